//! Coordinator client abstraction.
//!
//! The election subsystem is written against a small trait surface rather
//! than a concrete coordination service client, allowing for:
//!
//! - Different backend implementations (a production ZooKeeper-style
//!   client, the in-memory cluster for testing)
//! - Easier testing without an external ensemble
//! - Clear separation of concerns: the [`Group`](crate::group::Group)
//!   owns election semantics, the client owns wire plumbing
//!
//! # Sessions and Events
//!
//! A [`CoordinatorClient`] represents one *session-managing handle*: it is
//! minted by a [`Connector`], establishes its session in the background,
//! and reports session lifecycle and watch firings as [`ClientEvent`]s on
//! the channel supplied at connect time. The handle survives connection
//! loss (the underlying client reconnects on its own) but not session
//! expiration; after an [`ClientEvent::Expired`] the owner calls
//! [`CoordinatorClient::reopen`] to begin a fresh session on the same
//! handle.
//!
//! # Available Implementations
//!
//! - [`MemoryCluster`](memory::MemoryCluster): in-memory coordinator for
//!   tests and demos (behind the `test-utilities` feature)

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::constants::DIGEST_SCHEME;
use crate::error::Result;

/// How a znode is created on the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The znode outlives the creating session.
    Persistent,
    /// The znode is deleted when the creating session ends.
    Ephemeral,
    /// Persistent, with a coordinator-assigned sequence suffix appended to
    /// the name. The suffix is a zero-padded 10 digit decimal.
    PersistentSequential,
    /// Ephemeral and sequential; the combination group memberships are
    /// built from.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential
        )
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Access policy attached to created znodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Acl {
    /// World-readable and writable.
    #[default]
    Open,
    /// World-readable, writable only by the authenticated creator. Used by
    /// groups configured with credentials.
    EveryoneReadCreatorAll,
}

/// Session credentials.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// Authentication scheme, e.g. `digest`.
    pub scheme: String,
    /// Scheme-specific credential string, e.g. `user:pass` for `digest`.
    pub credentials: String,
}

impl Authentication {
    /// Digest credentials of the form `user:pass`.
    pub fn digest(credentials: impl Into<String>) -> Authentication {
        Authentication {
            scheme: DIGEST_SCHEME.to_string(),
            credentials: credentials.into(),
        }
    }
}

/// Session lifecycle and watch events reported by a client handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// The session is established. `reconnect` is true when an existing
    /// session was re-attached after a connection loss, false for a fresh
    /// session.
    Connected { reconnect: bool },
    /// The connection dropped; the client is trying to reconnect. The
    /// session is not (yet) dead.
    Reconnecting,
    /// The session expired: ephemeral znodes are gone and watches are dead.
    Expired,
    /// A watched znode was created.
    NodeCreated(String),
    /// A watched znode was updated, or its children changed.
    NodeUpdated(String),
    /// A watched znode was deleted.
    NodeDeleted(String),
}

/// Sending half of a client's event channel.
pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// Receiving half of a client's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// One session-managing handle onto the coordinator.
///
/// All operations are a thin mapping of the coordinator's wire protocol:
/// errors come back as the transient/non-retryable split described in
/// [`crate::error`], and `NoNode` on a racing delete must be tolerated by
/// callers.
#[async_trait]
pub trait CoordinatorClient: Send + Sync + 'static {
    /// Create a znode. Returns the actual path, which for sequential modes
    /// carries the assigned suffix.
    async fn create(&self, path: &str, data: Bytes, acl: Acl, mode: CreateMode) -> Result<String>;

    /// Delete a znode at any version.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Read a znode's payload.
    async fn get_data(&self, path: &str) -> Result<Bytes>;

    /// List a znode's children (their names, not full paths). With `watch`,
    /// a one-shot watch fires [`ClientEvent::NodeUpdated`] for the path
    /// when the child set next changes.
    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>>;

    /// Attach credentials to the session.
    async fn authenticate(&self, auth: &Authentication) -> Result<()>;

    /// The current session id, if a session is established.
    fn session_id(&self) -> Option<i64>;

    /// Abandon the current session (it is left to expire) and begin a fresh
    /// one on this handle. A [`ClientEvent::Connected`] with
    /// `reconnect: false` follows once the new session is up.
    async fn reopen(&self);
}

/// Mints client handles bound to an event channel.
pub trait Connector: Send + Sync + 'static {
    /// Create a client handle that immediately begins establishing a
    /// session with the given negotiated timeout, reporting progress on
    /// `events`.
    fn connect(
        &self,
        session_timeout: std::time::Duration,
        events: EventSender,
    ) -> Arc<dyn CoordinatorClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::PersistentSequential.is_ephemeral());

        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(!CreateMode::Ephemeral.is_sequential());
    }

    #[test]
    fn test_digest_authentication() {
        let auth = Authentication::digest("user:pass");
        assert_eq!(auth.scheme, "digest");
        assert_eq!(auth.credentials, "user:pass");
    }
}
