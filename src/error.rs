use std::io;
use thiserror::Error;

/// Convenient type alias for `Result<T, YamuxError>`.
pub type Result<T> = std::result::Result<T, YamuxError>;

/// Error types for the yamux library.
///
/// `YamuxError` represents all possible error conditions that can occur when
/// using the library, from transport I/O failures to peer protocol
/// violations.
#[derive(Debug, Error)]
pub enum YamuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid protocol version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Session closed")]
    SessionClosed,

    #[error("Stream {0} reset by peer")]
    StreamReset(u32),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(u32),

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    #[error("Too many streams")]
    TooManyStreams,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl YamuxError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            YamuxError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            YamuxError::Timeout => true,
            YamuxError::TooManyStreams => true,
            YamuxError::SessionClosed
            | YamuxError::InvalidVersion(_)
            | YamuxError::InvalidFrameType(_)
            | YamuxError::Config(_)
            | YamuxError::ProtocolViolation(_) => false,
            YamuxError::FrameTooLarge { .. }
            | YamuxError::StreamReset(_)
            | YamuxError::StreamNotFound(_)
            | YamuxError::StreamAlreadyExists(_)
            | YamuxError::InvalidStreamId(_) => false,
        }
    }
}

impl From<YamuxError> for io::Error {
    fn from(err: YamuxError) -> io::Error {
        match err {
            YamuxError::Io(e) => e,
            YamuxError::SessionClosed => io::Error::new(io::ErrorKind::BrokenPipe, err.to_string()),
            YamuxError::StreamReset(_) => {
                io::Error::new(io::ErrorKind::ConnectionReset, err.to_string())
            }
            YamuxError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
