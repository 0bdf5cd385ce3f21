//! Error types for redmux.

use thiserror::Error;

/// Main error type for all connection, protocol and adapter operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The decoder saw a sigil byte that maps to no RESP3 type.
    #[error("unknown RESP3 type byte")]
    UnknownType,

    /// A size, length or integer field did not parse as a number.
    #[error("expected a number")]
    NotANumber,

    /// Request and adapter disagree on the number of responses.
    #[error("request and adapter have incompatible sizes")]
    IncompatibleSize,

    /// The read buffer grew past `Config::max_read_size` without
    /// completing a frame.
    #[error("maximum read size exceeded")]
    ExceedsMaxReadSize,

    /// DNS resolution did not finish within `Config::resolve_timeout`.
    #[error("resolve timeout")]
    ResolveTimeout,

    /// No endpoint accepted a connection within `Config::connect_timeout`.
    #[error("connect timeout")]
    ConnectTimeout,

    /// No data was received for twice `Config::ping_interval`.
    #[error("idle timeout")]
    IdleTimeout,

    /// A request with `cancel_if_not_connected` was submitted while
    /// the connection was down.
    #[error("not connected")]
    NotConnected,

    /// The operation was cancelled. This is the success code of
    /// cancellation and never cascades to other operations.
    #[error("operation aborted")]
    OperationAborted,

    /// The push or event channel was cancelled while waiting.
    #[error("channel cancelled")]
    ChannelCancelled,

    /// The server closed the connection.
    #[error("end of file")]
    Eof,

    /// I/O error on the underlying stream.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the byte stream may be desynchronized after this error.
    ///
    /// Adapter-level errors leave the stream intact (the frame is still
    /// consumed in full); parse and transport errors do not.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Error::UnknownType
                | Error::ExceedsMaxReadSize
                | Error::IdleTimeout
                | Error::Eof
                | Error::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::NotANumber.to_string(), "expected a number");
        assert_eq!(Error::Eof.to_string(), "end of file");
        assert_eq!(Error::OperationAborted.to_string(), "operation aborted");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_fatal_to_run());
    }

    #[test]
    fn test_adapter_errors_not_fatal() {
        assert!(!Error::NotANumber.is_fatal_to_run());
        assert!(!Error::IncompatibleSize.is_fatal_to_run());
        assert!(!Error::OperationAborted.is_fatal_to_run());
    }
}
