//! Framed HTTP bridge between a native transport and an async Rust handler.
//!
//! A native process terminates TLS and HTTP and forwards each request over a
//! compact binary framing, either on a byte-stream channel or through a
//! direct call/poll interface. This crate serves those exchanges.
//!
//! # Crate Structure
//!
//! - [`transport`]: bridge endpoints, listener binds, the native boundary
//! - [`frame`]: the wire format and framed readers/writers
//! - [`server`]: exchange runtime, tunnels, lifecycle (behind `server` feature)

/// Re-export transport types.
pub mod transport {
    pub use bridgewire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use bridgewire_frame::*;
}

/// Re-export server types (requires `server` feature).
#[cfg(feature = "server")]
pub mod server {
    pub use bridgewire_server::*;
}
