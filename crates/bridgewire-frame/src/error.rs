/// Errors that can occur while encoding, decoding, reading or writing frames.
///
/// Every variant except [`FrameError::Io`] and [`FrameError::IdleTimeout`]
/// is a format error: the frame is abandoned and the caller must not try to
/// resynchronise on the same stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A field ran past the end of the payload.
    #[error("truncated bridge payload")]
    Truncated,

    /// Bytes were left over after the last field of a frame.
    #[error("unexpected trailing bytes in bridge payload ({remaining} bytes)")]
    TrailingBytes { remaining: usize },

    /// The version byte is not one this build accepts.
    #[error("unsupported bridge protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The frame type byte is not defined at all.
    #[error("unknown bridge frame type: {0}")]
    UnknownFrameType(u8),

    /// The frame type is valid, but not where it appeared.
    #[error("invalid bridge {expected} frame type: {found}")]
    UnexpectedFrameType { expected: &'static str, found: u8 },

    /// A header name token outside the static table.
    #[error("invalid bridge header name token: {0}")]
    InvalidHeaderToken(u16),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in bridge {field}")]
    InvalidUtf8 { field: &'static str },

    /// A field is too long to describe with a `u32` length.
    #[error("bridge {field} length does not fit u32")]
    FieldTooLong { field: &'static str },

    /// Frame length exceeds the configured maximum.
    #[error("bridge frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Accumulated body bytes exceed the configured maximum.
    #[error("bridge body too large ({size} bytes, max {max})")]
    BodyTooLarge { size: usize, max: usize },

    /// The stream ended inside a frame.
    #[error("bridge closed connection mid-frame")]
    ConnectionClosed,

    /// No frame started before the idle timeout elapsed.
    #[error("bridge connection idle for {0:?}")]
    IdleTimeout(std::time::Duration),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error means the peer sent something malformed.
    pub fn is_format_error(&self) -> bool {
        !matches!(self, FrameError::Io(_) | FrameError::IdleTimeout(_))
    }

    /// Whether this is a size-limit violation.
    pub fn is_size_limit(&self) -> bool {
        matches!(
            self,
            FrameError::FrameTooLarge { .. } | FrameError::BodyTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
