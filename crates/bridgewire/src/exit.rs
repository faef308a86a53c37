use std::fmt;
use std::io;

use bridgewire_frame::FrameError;
use bridgewire_server::ServerError;
use bridgewire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
// Forced exits return the code chosen by the shutdown watcher.
#[allow(dead_code)]
pub const SIGNAL_INTERRUPT: i32 = 130;
#[allow(dead_code)]
pub const SIGNAL_TERMINATE: i32 = 143;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::BindUnix { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::FrameTooLarge { .. } | FrameError::BodyTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        FrameError::IdleTimeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn server_error(context: &str, err: ServerError) -> CliError {
    match err {
        ServerError::Transport(err) => transport_error(context, err),
        ServerError::Frame(err) => frame_error(context, err),
        ServerError::Io(err) => io_error(context, err),
        ServerError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ServerError::ResourceLimit { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}
