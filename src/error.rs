//! Error types for audioflow.

use thiserror::Error;

/// Result type alias using audioflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a single stream transfer: bytes moved, or a distinguished I/O code.
///
/// `Ok(0)` means "nothing transferred" and is treated as end of data by the
/// element task loop, the same way a `Done` code is.
pub type IoResult = std::result::Result<usize, IoError>;

/// Distinguished stream I/O codes returned by ports and element callbacks.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoError {
    /// The transfer failed.
    #[error("stream i/o failed")]
    Fail,

    /// The stream has ended and no more data will arrive.
    #[error("stream done")]
    Done,

    /// The transfer was aborted (shutdown in progress).
    #[error("stream aborted")]
    Abort,

    /// The transfer did not complete before its timeout.
    #[error("stream timed out")]
    Timeout,

    /// The element's processing step failed.
    #[error("processing failed")]
    ProcessFail,
}

impl IoError {
    /// Numeric code of this result, as reported to drivers and user callbacks.
    pub fn code(self) -> i32 {
        match self {
            IoError::Fail => -1,
            IoError::Done => -2,
            IoError::Abort => -3,
            IoError::Timeout => -4,
            IoError::ProcessFail => -5,
        }
    }

    /// Parse a negative driver return code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(IoError::Fail),
            -2 => Some(IoError::Done),
            -3 => Some(IoError::Abort),
            -4 => Some(IoError::Timeout),
            -5 => Some(IoError::ProcessFail),
            _ => None,
        }
    }
}

/// Main error type for audioflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value was rejected at init time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No element with this tag is registered.
    #[error("unknown element '{0}'")]
    UnknownElement(String),

    /// An element with this tag is already registered.
    #[error("element '{0}' already registered")]
    DuplicateElement(String),

    /// Linking a sequence of elements failed.
    #[error("link failed: {0}")]
    Link(String),

    /// A multi-port index is outside the configured range.
    #[error("port index {index} out of range (max {max})")]
    PortIndex {
        /// Requested index.
        index: usize,
        /// Configured number of ports.
        max: usize,
    },

    /// The element has no port in the requested position.
    #[error("element '{0}' has no such port")]
    NoPort(String),

    /// A wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Spawning a task thread failed.
    #[error("failed to spawn task: {0}")]
    Spawn(#[from] std::io::Error),

    /// The element does not implement this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A command or event channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// A stream transfer failed.
    #[error("stream error: {0}")]
    Io(#[from] IoError),
}

impl Error {
    /// Returns `true` if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Io(IoError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_codes_round_trip() {
        for e in [
            IoError::Fail,
            IoError::Done,
            IoError::Abort,
            IoError::Timeout,
            IoError::ProcessFail,
        ] {
            assert_eq!(IoError::from_code(e.code()), Some(e));
        }
        assert_eq!(IoError::from_code(0), None);
    }

    #[test]
    fn test_timeout_detection() {
        assert!(Error::Timeout("stop".into()).is_timeout());
        assert!(Error::Io(IoError::Timeout).is_timeout());
        assert!(!Error::ChannelClosed.is_timeout());
    }
}
