//! Collider error types.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ColliderError {
    /// I/O failure from a socket or the readiness multiplexer.
    Io(io::Error),
    /// Raw OS error with errno.
    Os(i32),
    /// Session output is sealed, no more data is accepted.
    SessionClosed,
    /// Task is already linked into a pool shard.
    TaskAlreadyQueued,
    /// Worker pool was stopped.
    PoolShutdown,
    /// Reactor stop was requested.
    Stopped,
    /// Acceptor or connector is already registered.
    AlreadyRegistered,
    /// Another send is in flight on the session.
    SessionBusy,
    /// Accelerated transport could not map or accept a block.
    TransportFailure,
    /// Configuration rejected by `validate()`.
    InvalidConfig(&'static str),
}

impl fmt::Display for ColliderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::SessionClosed => write!(f, "session closed"),
            Self::TaskAlreadyQueued => write!(f, "task already queued"),
            Self::PoolShutdown => write!(f, "thread pool shut down"),
            Self::Stopped => write!(f, "collider stopped"),
            Self::AlreadyRegistered => write!(f, "already registered"),
            Self::SessionBusy => write!(f, "session busy"),
            Self::TransportFailure => write!(f, "shared memory transport failure"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ColliderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ColliderError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::errno::Errno> for ColliderError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Os(e as i32)
    }
}

impl ColliderError {
    /// Capture `errno` after a failed libc call.
    pub fn last_os_error() -> Self {
        Self::Io(io::Error::last_os_error())
    }

    /// Errno behind this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            Self::Os(e) => Some(*e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ColliderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ColliderError::SessionClosed.to_string(), "session closed");
        assert_eq!(ColliderError::Os(11).to_string(), "OS error: errno 11");
        assert_eq!(
            ColliderError::InvalidConfig("threads must be <= 256").to_string(),
            "invalid config: threads must be <= 256"
        );
    }

    #[test]
    fn test_conversions_keep_errno() {
        let e: ColliderError = nix::errno::Errno::EAGAIN.into();
        assert_eq!(e.raw_os_error(), Some(libc::EAGAIN));

        let e: ColliderError = io::Error::from_raw_os_error(libc::ECONNRESET).into();
        assert_eq!(e.raw_os_error(), Some(libc::ECONNRESET));
        assert!(std::error::Error::source(&e).is_some());

        assert_eq!(ColliderError::Stopped.raw_os_error(), None);
    }
}
