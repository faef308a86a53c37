//! Exchange runtime for the bridge.
//!
//! This is the layer applications talk to. A [`Handler`] receives each
//! request with a streaming body and answers through a [`ResponseSink`];
//! the runtime takes care of frame sequencing, body limits, error responses
//! and upgrade tunnels.
//!
//! Exchanges arrive either over framed byte-stream connections
//! ([`BridgeServer`], [`serve_connection`]) or through the native call/poll
//! interface ([`DirectDispatcher`]).

mod body;
pub mod connection;
pub mod counters;
pub mod direct;
pub mod error;
mod exchange;
pub mod handler;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod sink;
pub mod tunnel;

pub use body::RequestBody;
pub use connection::serve_connection;
pub use counters::{ChannelGuard, ConnectionCounters, CounterSnapshot, ExchangeGuard};
pub use direct::{DirectConfig, DirectDispatcher};
pub use error::{Result, ServerError};
pub use handler::{BridgeRequest, Handler, HandlerError};
pub use server::{BridgeServer, NativeListener, ServerConfig};
pub use session::{Session, SessionConfig, SessionStore};
pub use shutdown::{watch_signals, OsSignals, ShutdownSignal, SignalSource};
pub use sink::{ExchangeMode, ExchangeState, ResponseSink, SharedHeaders};
pub use tunnel::TunnelHandle;
