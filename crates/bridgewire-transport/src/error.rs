use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors that can occur while binding, accepting, or connecting bridge endpoints.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a TCP listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to bind a Unix domain socket listener.
    #[error("failed to bind {path}: {source}")]
    BindUnix {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host name did not resolve to any usable address.
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    /// Dual-stack loopback bind kept colliding on the shared ephemeral port.
    #[error("no shared loopback port after {attempts} attempts: {source}")]
    SharedPortExhausted {
        attempts: usize,
        source: std::io::Error,
    },

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The native transport reported an ABI version this build does not speak.
    #[error("unsupported native transport ABI version {found} (expected {expected})")]
    UnsupportedAbi { found: i32, expected: i32 },

    /// The native transport refused to start a listener.
    #[error("native listener start failed: {0}")]
    NativeStart(String),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether this error is an "address in use" collision.
    pub fn is_addr_in_use(&self) -> bool {
        match self {
            TransportError::Bind { source, .. }
            | TransportError::BindUnix { source, .. }
            | TransportError::Io(source) => source.kind() == std::io::ErrorKind::AddrInUse,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
