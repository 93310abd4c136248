use std::io;
use thiserror::Error;

/// Errors that can occur in session and stream operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (malformed header, unsupported version, oversized frame, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer sent more data than it was credited
    #[error("Flow control violation on stream {stream_id}: received {len} bytes but window is {window}")]
    FlowControl {
        stream_id: u32,
        len: u32,
        window: u32,
    },

    /// Stream was reset (aborted) by either side
    #[error("Stream reset")]
    StreamReset,

    /// Local side already sent FIN
    #[error("Stream closed for writes")]
    StreamClosedForWrites,

    /// Concurrent stream limit reached
    #[error("Too many streams (limit {0})")]
    ResourceExhausted(usize),

    /// Session closed
    #[error("Session closed")]
    SessionClosed,

    /// Peer announced GoAway; no new streams may be opened
    #[error("Session going away (code {0})")]
    GoAway(u32),

    /// Ping acknowledgment not received within the deadline
    #[error("Keepalive timed out")]
    KeepaliveTimeout,

    /// Rejected configuration value
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error tears down the whole session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::FlowControl { .. } | Error::KeepaliveTimeout
        )
    }

    /// Convert into an `io::Error` for the `AsyncRead`/`AsyncWrite` impls
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match &self {
            Error::Io(e) => e.kind(),
            Error::StreamReset => io::ErrorKind::ConnectionReset,
            Error::StreamClosedForWrites => io::ErrorKind::BrokenPipe,
            Error::SessionClosed | Error::GoAway(_) => io::ErrorKind::NotConnected,
            Error::KeepaliveTimeout => io::ErrorKind::TimedOut,
            Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::InvalidData,
        };
        match self {
            Error::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Protocol("bad".into()).is_fatal());
        assert!(Error::FlowControl { stream_id: 1, len: 2, window: 1 }.is_fatal());
        assert!(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)).is_fatal());
        assert!(!Error::StreamReset.is_fatal());
        assert!(!Error::ResourceExhausted(4).is_fatal());
        assert!(!Error::GoAway(0).is_fatal());
    }

    #[test]
    fn test_into_io_kind() {
        assert_eq!(Error::StreamReset.into_io().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(
            Error::StreamClosedForWrites.into_io().kind(),
            io::ErrorKind::BrokenPipe
        );
        assert_eq!(Error::SessionClosed.into_io().kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_go_away_code_in_message() {
        assert_eq!(Error::GoAway(2).to_string(), "Session going away (code 2)");
    }
}
