//! Error types for the server and for individual sessions.
//!
//! Session errors fall into two categories with different logging policies:
//! protocol errors (bad request bytes, logged at warn) and stream errors
//! (I/O failures and forced disconnects, expected and not logged as errors).

use std::fmt;
use std::io;

/// Error raised while driving a single session.
#[derive(Debug)]
pub enum SessionError {
    /// Malformed request bytes or a protocol violation.
    Protocol(String),
    /// Transport failure: peer reset, write timeout, forced disconnect.
    Stream(io::Error),
    /// Operation on a transport that was already closed or handed off.
    Closed,
}

impl SessionError {
    /// Stream error representing a sweeper-forced close.
    pub(crate) fn forced_close() -> Self {
        SessionError::Stream(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "session force-closed",
        ))
    }

    /// Stream error representing an elapsed write timeout.
    pub(crate) fn write_timeout() -> Self {
        SessionError::Stream(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            SessionError::Stream(e) => write!(f, "stream error: {e}"),
            SessionError::Closed => write!(f, "session transport already closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Stream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Stream(e)
    }
}

/// Error raised by server-level operations.
#[derive(Debug)]
pub enum ServerError {
    /// Operation requires the server to have been started.
    NotStarted,
    /// Listener setup failed.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::NotStarted => write!(f, "server not started"),
            ServerError::Io(e) => write!(f, "listener error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::NotStarted => None,
        }
    }
}
