use bridgewire_frame::FrameError;
use bridgewire_transport::TransportError;

use crate::handler::HandlerError;

/// Errors that can occur while serving bridge exchanges.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Frames arrived (or were produced) in an order the exchange does not allow.
    #[error("protocol sequence error: {0}")]
    ProtocolSequence(String),

    /// The application handler failed.
    #[error("handler failed: {0}")]
    Handler(HandlerError),

    /// A body grew past the configured maximum.
    #[error("body of {size} bytes exceeds maximum {max}")]
    ResourceLimit { size: usize, max: usize },

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(FrameError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The other end of an internal channel went away.
    #[error("exchange channel closed")]
    ChannelClosed,

    /// No response started before the exchange timed out.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The detached tunnel failed to set up or relay.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Whether a synthesized error response can still report this failure.
    ///
    /// Only meaningful while no response-start has been emitted.
    pub fn is_recoverable_before_commit(&self) -> bool {
        matches!(
            self,
            Self::Handler(_) | Self::ResourceLimit { .. } | Self::Timeout(_)
        )
    }

    /// Status of the synthesized error response for this failure.
    pub fn error_status(&self) -> u16 {
        match self {
            Self::ResourceLimit { .. } => 413,
            Self::Timeout(_) => 504,
            _ => 400,
        }
    }
}

impl From<FrameError> for ServerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::BodyTooLarge { size, max } => Self::ResourceLimit { size, max },
            other => Self::Frame(other),
        }
    }
}

impl From<HandlerError> for ServerError {
    fn from(err: HandlerError) -> Self {
        Self::Handler(err)
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_limit_maps_to_resource_limit() {
        let err = ServerError::from(FrameError::BodyTooLarge { size: 10, max: 4 });
        assert!(matches!(err, ServerError::ResourceLimit { size: 10, max: 4 }));
        assert_eq!(err.error_status(), 413);
        assert!(err.is_recoverable_before_commit());
    }

    #[test]
    fn format_errors_are_not_recoverable() {
        let err = ServerError::from(FrameError::Truncated);
        assert!(matches!(err, ServerError::Frame(FrameError::Truncated)));
        assert!(!err.is_recoverable_before_commit());
        assert_eq!(err.error_status(), 400);
    }

    #[test]
    fn timeouts_report_504() {
        let err = ServerError::Timeout(std::time::Duration::from_secs(30));
        assert!(err.is_recoverable_before_commit());
        assert_eq!(err.error_status(), 504);
    }

    #[test]
    fn handler_errors_report_400() {
        let err = ServerError::from(HandlerError::message("no such route"));
        assert!(err.is_recoverable_before_commit());
        assert_eq!(err.error_status(), 400);
        assert_eq!(err.to_string(), "handler failed: no such route");
    }
}
