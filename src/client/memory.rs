//! In-memory coordinator cluster for testing.
//!
//! This provides a full-featured in-memory implementation of the
//! [`CoordinatorClient`] surface for comprehensive testing without an
//! external coordination service: a shared znode tree, per-session
//! ephemerals, sequential suffix assignment, one-shot child watches, and
//! fault injection (session expiry, network partitions, credential
//! rejection).
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! ballot = { path = ".", features = ["test-utilities"] }
//! ```
//!
//! # Fidelity Notes
//!
//! - Operations issued while the cluster is partitioned fail immediately
//!   with [`Error::ConnectionLoss`] rather than blocking; paired with the
//!   group's own retry loop this reproduces the observable behavior of a
//!   flapping network without wall-clock delays.
//! - A session abandoned via [`CoordinatorClient::reopen`] is expired
//!   server-side immediately (its ephemerals vanish). A real coordinator
//!   would let it idle out after the session timeout; immediate expiry is
//!   the deterministic stand-in.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{Acl, Authentication, ClientEvent, Connector, CoordinatorClient, CreateMode, EventSender};
use crate::error::{Error, Result};

/// A znode in the in-memory tree.
#[derive(Debug)]
struct Znode {
    data: Bytes,
    /// Session that owns this node if it is ephemeral.
    ephemeral_owner: Option<i64>,
    /// Next sequence suffix handed to a sequential child of this node.
    next_sequence: u64,
}

/// Server-side view of one session.
#[derive(Debug)]
struct Session {
    events: EventSender,
    /// False while the session waits for the network (initial connect or
    /// reopen during a partition).
    established: bool,
    /// True when the session saw a `Reconnecting` it has not recovered from.
    disrupted: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<String, Znode>,
    sessions: HashMap<i64, Session>,
    /// One-shot child watches: path -> sessions to notify on child change.
    child_watches: HashMap<String, Vec<i64>>,
    /// Sequence counter for children created directly under the root.
    root_sequence: u64,
    partitioned: bool,
    reject_credentials: bool,
}

/// Shared in-memory coordinator cluster.
///
/// Cloning shares the same tree; mint client handles through the
/// [`Connector`] impl.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    next_session_id: Arc<AtomicI64>,
}

impl MemoryCluster {
    pub fn new() -> MemoryCluster {
        MemoryCluster::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // A panic while holding the lock only happens in tests; the state
        // itself stays usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Expire a session: its ephemerals vanish, watches fire, and the
    /// session's client is told its session is dead.
    pub fn expire_session(&self, session_id: i64) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.remove(&session_id) {
            debug!(session_id, "expiring session");
            reap_session(&mut state, session_id);
            let _ = session.events.send(ClientEvent::Expired);
        }
    }

    /// Drop the network: every established session sees `Reconnecting` and
    /// all operations fail with [`Error::ConnectionLoss`] until
    /// [`MemoryCluster::restore`].
    pub fn partition(&self) {
        let mut state = self.lock();
        if state.partitioned {
            return;
        }
        state.partitioned = true;
        for session in state.sessions.values_mut() {
            if session.established && !session.disrupted {
                session.disrupted = true;
                let _ = session.events.send(ClientEvent::Reconnecting);
            }
        }
    }

    /// Bring the network back: disrupted sessions reconnect, sessions that
    /// were still connecting establish fresh.
    pub fn restore(&self) {
        let mut state = self.lock();
        if !state.partitioned {
            return;
        }
        state.partitioned = false;
        for session in state.sessions.values_mut() {
            if session.disrupted {
                session.disrupted = false;
                let _ = session.events.send(ClientEvent::Connected { reconnect: true });
            } else if !session.established {
                session.established = true;
                let _ = session.events.send(ClientEvent::Connected { reconnect: false });
            }
        }
    }

    /// Make `authenticate` fail, for exercising the non-retryable path.
    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_credentials = reject;
    }

    /// Operator-style delete from outside any session.
    pub fn remove(&self, path: &str) {
        let mut state = self.lock();
        if state.nodes.remove(path).is_some() {
            fire_child_watches(&mut state, &parent_of(path));
        }
    }

    /// Whether a znode currently exists.
    pub fn contains(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn register(&self, events: EventSender) -> i64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.lock();
        let established = !state.partitioned;
        state.sessions.insert(
            session_id,
            Session {
                events: events.clone(),
                established,
                disrupted: false,
            },
        );
        if established {
            let _ = events.send(ClientEvent::Connected { reconnect: false });
        }
        session_id
    }
}

impl Connector for MemoryCluster {
    fn connect(
        &self,
        _session_timeout: Duration,
        events: EventSender,
    ) -> Arc<dyn CoordinatorClient> {
        let session_id = self.register(events.clone());
        Arc::new(MemorySession {
            cluster: self.clone(),
            events,
            session_id: Mutex::new(session_id),
        })
    }
}

/// One client handle onto a [`MemoryCluster`].
pub struct MemorySession {
    cluster: MemoryCluster,
    events: EventSender,
    session_id: Mutex<i64>,
}

impl MemorySession {
    fn current_session(&self) -> i64 {
        *self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails the operation if the network is down or our session is gone.
    fn admit(&self, state: &ClusterState) -> Result<()> {
        if state.partitioned {
            return Err(Error::ConnectionLoss);
        }
        if !state.sessions.contains_key(&self.current_session()) {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinatorClient for MemorySession {
    async fn create(&self, path: &str, data: Bytes, _acl: Acl, mode: CreateMode) -> Result<String> {
        let mut state = self.cluster.lock();
        self.admit(&state)?;

        let (parent, name) = split_path(path)?;
        if !mode.is_sequential() && name.is_empty() {
            return Err(Error::BadPath(path.to_string()));
        }
        if parent != "/" && !state.nodes.contains_key(parent.as_str()) {
            return Err(Error::NoNode(parent));
        }

        let actual = if mode.is_sequential() {
            let sequence = if parent == "/" {
                let sequence = state.root_sequence;
                state.root_sequence += 1;
                sequence
            } else {
                let node = state
                    .nodes
                    .get_mut(parent.as_str())
                    .ok_or_else(|| Error::NoNode(parent.clone()))?;
                let sequence = node.next_sequence;
                node.next_sequence += 1;
                sequence
            };
            join_path(&parent, &format!("{name}{sequence:010}"))
        } else {
            let actual = join_path(&parent, &name);
            if state.nodes.contains_key(&actual) {
                return Err(Error::NodeExists(actual));
            }
            actual
        };

        let ephemeral_owner = mode.is_ephemeral().then(|| self.current_session());
        state.nodes.insert(
            actual.clone(),
            Znode {
                data,
                ephemeral_owner,
                next_sequence: 0,
            },
        );
        fire_child_watches(&mut state, &parent);
        Ok(actual)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.cluster.lock();
        self.admit(&state)?;

        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        if state
            .nodes
            .range(format!("{path}/")..)
            .next()
            .is_some_and(|(child, _)| child.starts_with(&format!("{path}/")))
        {
            return Err(Error::BadArguments(format!("znode {path} has children")));
        }
        state.nodes.remove(path);
        fire_child_watches(&mut state, &parent_of(path));
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Bytes> {
        let state = self.cluster.lock();
        self.admit(&state)?;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let mut state = self.cluster.lock();
        self.admit(&state)?;

        if path != "/" && !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let children = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .filter(|(candidate, _)| !candidate[prefix.len()..].contains('/'))
            .map(|(candidate, _)| candidate[prefix.len()..].to_string())
            .collect();

        if watch {
            let session_id = self.current_session();
            let watchers = state.child_watches.entry(path.to_string()).or_default();
            if !watchers.contains(&session_id) {
                watchers.push(session_id);
            }
        }
        Ok(children)
    }

    async fn authenticate(&self, auth: &Authentication) -> Result<()> {
        let state = self.cluster.lock();
        self.admit(&state)?;
        if state.reject_credentials {
            return Err(Error::AuthFailed(format!(
                "{} credentials rejected",
                auth.scheme
            )));
        }
        Ok(())
    }

    fn session_id(&self) -> Option<i64> {
        Some(self.current_session())
    }

    async fn reopen(&self) {
        let old_session = self.current_session();
        let mut state = self.cluster.lock();
        // The abandoned session is expired server-side right away; see the
        // module docs for why this is deterministic enough.
        if state.sessions.remove(&old_session).is_some() {
            reap_session(&mut state, old_session);
        }

        let new_session = self.cluster.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let established = !state.partitioned;
        state.sessions.insert(
            new_session,
            Session {
                events: self.events.clone(),
                established,
                disrupted: false,
            },
        );
        drop(state);

        debug!(old_session, new_session, "reopened coordinator session");
        *self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_session;
        if established {
            let _ = self.events.send(ClientEvent::Connected { reconnect: false });
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // Graceful close: the session ends and its ephemerals vanish.
        let session_id = self.current_session();
        let mut state = self.cluster.lock();
        if state.sessions.remove(&session_id).is_some() {
            reap_session(&mut state, session_id);
        }
    }
}

/// Remove a dead session's ephemerals and watch registrations, firing the
/// affected child watches.
fn reap_session(state: &mut ClusterState, session_id: i64) {
    let doomed: Vec<String> = state
        .nodes
        .iter()
        .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
        .map(|(path, _)| path.clone())
        .collect();

    let mut parents: Vec<String> = Vec::new();
    for path in doomed {
        state.nodes.remove(&path);
        let parent = parent_of(&path);
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }
    for watchers in state.child_watches.values_mut() {
        watchers.retain(|watcher| *watcher != session_id);
    }
    for parent in parents {
        fire_child_watches(state, &parent);
    }
}

/// Fire and clear the one-shot child watches registered on `path`.
fn fire_child_watches(state: &mut ClusterState, path: &str) {
    let Some(watchers) = state.child_watches.remove(path) else {
        return;
    };
    for session_id in watchers {
        if let Some(session) = state.sessions.get(&session_id) {
            let _ = session
                .events
                .send(ClientEvent::NodeUpdated(path.to_string()));
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(slash) => path[..slash].to_string(),
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a create path into (parent, name-or-prefix). A trailing `/` means
/// an empty name, which is how sequential children with no name prefix are
/// requested.
fn split_path(path: &str) -> Result<(String, String)> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(Error::BadPath(path.to_string()));
    }
    match path.rfind('/') {
        Some(0) => Ok(("/".to_string(), path[1..].to_string())),
        Some(slash) => Ok((path[..slash].to_string(), path[slash + 1..].to_string())),
        None => Err(Error::BadPath(path.to_string())),
    }
}
