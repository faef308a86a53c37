//! Byte-stream endpoints for the bridge.
//!
//! Everything below the frame layer lives here:
//! - TCP and Unix domain socket bridge listeners ([`BridgeEndpoint`])
//! - listener binds with backlog/v6-only/reuse options, including the
//!   dual-stack loopback pair sharing one ephemeral port
//! - loopback socket pairs for detached tunnels
//! - the call contract of the native transport ([`NativeTransport`])

pub mod endpoint;
pub mod error;
pub mod native;
pub mod pair;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use endpoint::{BridgeEndpoint, BridgeListener};
pub use error::{Result, TransportError};
pub use native::{
    probe_abi, start_native_listener, BackendDescriptor, DirectPayload, InProcessNative,
    ListenerBinding, NativeListenerConfig, NativeListenerHandle, NativeTransport, TlsConfig,
    SUPPORTED_NATIVE_ABI_VERSION,
};
pub use pair::loopback_pair;
pub use stream::BridgeStream;
pub use tcp::{
    bind_host, bind_loopback_pair, bind_shared_port, bind_tcp, BindOptions, PortBinder,
    SocketBinder, SHARED_PORT_ATTEMPTS,
};

#[cfg(unix)]
pub use uds::UnixBridgeListener;
