//! Crate level errors.
//!
//! # Error Classes
//!
//! Operations against the coordinator fail in two fundamentally different
//! ways, and the rest of the crate is built around that split:
//!
//! - **Transient** errors ([`Error::ConnectionLoss`], [`Error::OperationTimeout`]
//!   and [`Error::NoNode`] when it is a racing delete) are retried by the
//!   group's sync loop until they succeed or the session times out.
//! - **Non-retryable** errors (authentication rejected, malformed paths, bad
//!   arguments) are latched by the group and broadcast to every pending and
//!   future operation. A group never recovers from a latched error.
//!
//! [`Error::SessionExpired`] sits between the two: it is terminal for the
//! operations it fails, but the group itself transparently re-initializes
//! with a fresh session afterwards.
//!
//! Errors are `Clone + PartialEq` so a single failure can be fanned out to
//! every queued operation and so detectors can compare a caller's previous
//! observation against the current one.

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by groups, contenders and detectors.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The connection to the coordinator was lost mid-operation.
    #[error("connection to the coordinator lost")]
    ConnectionLoss,

    /// An operation against the coordinator timed out.
    #[error("coordinator operation timed out")]
    OperationTimeout,

    /// The znode does not exist. Often a benign race against a concurrent
    /// delete; callers inside the group treat it contextually.
    #[error("znode does not exist: {0}")]
    NoNode(String),

    /// The znode already exists. Benign while ensuring the parent path.
    #[error("znode already exists: {0}")]
    NodeExists(String),

    /// The coordinator rejected our credentials.
    #[error("failed to authenticate with the coordinator: {0}")]
    AuthFailed(String),

    /// A malformed znode path was handed to the coordinator.
    #[error("bad znode path: {0}")]
    BadPath(String),

    /// The coordinator rejected the operation's arguments.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// The coordinator session expired, either reported by the coordinator
    /// or forced locally after the session timeout elapsed while
    /// disconnected.
    #[error("coordinator session expired")]
    SessionExpired,

    /// Tried to cancel a membership this group instance does not own.
    #[error("membership {0} is not owned by this group instance")]
    NotOwned(u64),

    /// `contend` was called more than once on the same contender.
    #[error("contender is already contending")]
    AlreadyContended,

    /// `withdraw` was called before `contend`.
    #[error("contender has not contended yet")]
    NotContended,

    /// The coordinator URL could not be parsed.
    #[error("invalid coordinator URL: {0}")]
    InvalidUrl(String),

    /// A leader payload could not be decoded into an address.
    #[error("leader payload is not a valid address: {0}")]
    Payload(String),

    /// Reading a `file://` election backend failed.
    #[error("failed to read election backend file: {0}")]
    Io(String),

    /// The backing actor task is gone; its results are unknowable.
    #[error("{0} terminated")]
    Terminated(&'static str),
}

impl Error {
    /// Whether the group's sync loop should retry after this error.
    ///
    /// `NoNode` is classified retryable because inside the sync loop it is
    /// a race against a concurrent delete: a cache refresh reconciles the
    /// tracked memberships and the retried pass then settles the affected
    /// operation one way or the other.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLoss | Error::OperationTimeout | Error::NoNode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionLoss.is_retryable());
        assert!(Error::OperationTimeout.is_retryable());
        assert!(Error::NoNode("/elect/0000000001".into()).is_retryable());

        assert!(!Error::AuthFailed("digest rejected".into()).is_retryable());
        assert!(!Error::BadPath("elect".into()).is_retryable());
        assert!(!Error::SessionExpired.is_retryable());
        assert!(!Error::NotOwned(3).is_retryable());
        assert!(!Error::Terminated("group").is_retryable());
    }

    #[test]
    fn test_errors_compare_by_value() {
        assert_eq!(Error::SessionExpired, Error::SessionExpired);
        assert_eq!(Error::NoNode("/a".into()), Error::NoNode("/a".into()));
        assert_ne!(Error::NoNode("/a".into()), Error::NoNode("/b".into()));
        assert_ne!(Error::ConnectionLoss, Error::OperationTimeout);
    }

    #[test]
    fn test_display() {
        let err = Error::NotOwned(42);
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("not owned"));
    }
}
