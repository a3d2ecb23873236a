//! Distributed group membership over the coordinator.
//!
//! A [`Group`] is bound to one parent znode; members are ephemeral
//! sequential children of that znode. Joining creates a child carrying the
//! member's payload, cancelling deletes it, and watching reports the
//! member set whenever it differs from an expected set. The coordinator
//! assigns each child a monotonic sequence; the smallest live sequence is
//! the group's leader.
//!
//! # Architecture
//!
//! The public [`Group`] handle is a cheap clone that posts messages to a
//! single actor task. The actor owns the coordinator session and runs a
//! small state machine over it:
//!
//! ```text
//!           connected(reconnect=false)
//! Connecting ------------------------> Connected
//!     ^  ^                              |    ^
//!     |  |       expired /              |    | connected(reconnect=true)
//!     |  +--- watchdog fired            v    |
//!     |                              Disconnected
//!     +------------- reconnecting ------+
//! ```
//!
//! Pending operations queue while the session is down and are replayed by
//! [`sync`](GroupActor::sync) in a fixed phase order (cache refresh, joins,
//! cancels, datas, watches) once it is up. Transient failures arm a single
//! jittered retry timer; non-retryable failures latch and fail everything,
//! permanently.
//!
//! # The Session Watchdog
//!
//! The coordinator client only ever reports "reconnecting", never "dead".
//! A session that silently never reconnects would wedge every caller, so
//! on disconnect the actor arms its own timer for the session timeout and,
//! if it fires while the same session is still disconnected, locally
//! forces the expiration path. To contenders and detectors a forced
//! expiration is indistinguishable from a coordinator-reported one.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{
    Acl, Authentication, ClientEvent, Connector, CoordinatorClient, CreateMode, EventReceiver,
};
use crate::constants::{DEFAULT_SESSION_TIMEOUT, RETRY_INTERVAL, SEQUENCE_WIDTH};
use crate::error::{Error, Result};
use crate::retry;
use crate::url::CoordinatorUrl;

/// Configuration for a [`Group`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GroupConfig {
    /// Comma separated `host:port` coordinator servers. Interpreted by the
    /// connector; an in-memory connector ignores it.
    pub servers: String,

    /// Parent znode whose children are the group members.
    pub znode: String,

    /// Coordinator session timeout, and the window the group allows a
    /// disconnected session to reconnect before forcing expiration.
    #[serde(default = "GroupConfig::default_session_timeout")]
    pub session_timeout: Duration,

    /// Session credentials. When set, created znodes are writable only by
    /// the creator.
    #[serde(default)]
    pub auth: Option<Authentication>,
}

impl GroupConfig {
    pub fn new(servers: impl Into<String>, znode: impl Into<String>) -> GroupConfig {
        GroupConfig {
            servers: servers.into(),
            znode: znode.into(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            auth: None,
        }
    }

    /// Configuration from a parsed `zk://` URL.
    pub fn from_url(url: &CoordinatorUrl, session_timeout: Duration) -> GroupConfig {
        GroupConfig {
            servers: url.servers.clone(),
            znode: url.path.clone(),
            session_timeout,
            auth: url.auth.clone(),
        }
    }

    pub fn with_session_timeout(mut self, session_timeout: Duration) -> GroupConfig {
        self.session_timeout = session_timeout;
        self
    }

    pub fn with_auth(mut self, auth: Authentication) -> GroupConfig {
        self.auth = Some(auth);
        self
    }

    /// Check the configuration for structural problems.
    pub fn validate(&self) -> Result<()> {
        if !self.znode.starts_with('/') {
            return Err(Error::BadPath(self.znode.clone()));
        }
        if self.session_timeout.is_zero() {
            return Err(Error::BadArguments(
                "session timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn default_session_timeout() -> Duration {
        DEFAULT_SESSION_TIMEOUT
    }
}

/// Resolution of a membership's cancellation signal.
type CancelOutcome = Option<Result<bool>>;
type CancelSlot = watch::Sender<CancelOutcome>;
type CancelSignal = watch::Receiver<CancelOutcome>;

/// One member of a group.
///
/// Memberships compare, order and hash by sequence alone, so values minted
/// by different [`Group`] instances for the same znode are interchangeable.
/// An older membership (smaller sequence) orders before a younger one; the
/// group's leader is the minimum.
#[derive(Clone, Debug)]
pub struct Membership {
    sequence: u64,
    cancelled: CancelSignal,
}

impl Membership {
    /// The coordinator-assigned sequence of this member.
    pub fn id(&self) -> u64 {
        self.sequence
    }

    /// Resolves once this membership has been cancelled. The value is
    /// `true` only if the owning group's [`Group::cancel`] caused the
    /// deletion; any other disappearance (session expiration, an external
    /// delete, observed gone after a reconnect) yields `false`. Fails with
    /// the group's latched error if the group aborted.
    pub async fn cancelled(&self) -> Result<bool> {
        let mut signal = self.cancelled.clone();
        loop {
            let settled = signal.borrow_and_update().clone();
            if let Some(outcome) = settled {
                return outcome;
            }
            if signal.changed().await.is_err() {
                return Err(Error::Terminated("group"));
            }
        }
    }
}

impl PartialEq for Membership {
    fn eq(&self, other: &Membership) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for Membership {}

impl PartialOrd for Membership {
    fn partial_cmp(&self, other: &Membership) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Membership {
    fn cmp(&self, other: &Membership) -> std::cmp::Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

impl std::hash::Hash for Membership {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.sequence.hash(state);
    }
}

/// Messages from [`Group`] handles to the actor.
enum Command {
    Join {
        data: Bytes,
        tx: oneshot::Sender<Result<Membership>>,
    },
    Cancel {
        sequence: u64,
        tx: oneshot::Sender<Result<bool>>,
    },
    Data {
        sequence: u64,
        tx: oneshot::Sender<Result<Bytes>>,
    },
    Watch {
        expected: BTreeSet<u64>,
        tx: oneshot::Sender<Result<BTreeSet<Membership>>>,
    },
    Session {
        tx: oneshot::Sender<Result<Option<i64>>>,
    },
}

/// A distributed group handle.
///
/// Cheap to clone; a contender and any number of detectors can share one.
/// The actor task (and with it the coordinator session) shuts down when
/// the last handle is dropped, at which point the coordinator reclaims the
/// session's ephemeral members.
#[derive(Clone)]
pub struct Group {
    commands: mpsc::UnboundedSender<Command>,
}

impl Group {
    /// Start a group over the given connector. Must be called from within
    /// a tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: GroupConfig) -> Result<Group> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = connector.connect(config.session_timeout, event_tx);
        info!(znode = %config.znode, servers = %config.servers, "starting group");
        tokio::spawn(
            GroupActor {
                config,
                client,
                commands: command_rx,
                events: event_rx,
                state: ConnectionState::Connecting,
                prepared: false,
                latched: None,
                pending: Pending::default(),
                owned: BTreeMap::new(),
                unowned: BTreeMap::new(),
                cache: None,
                backoff: None,
                retry_at: None,
                watchdog: None,
            }
            .run(),
        );
        Ok(Group {
            commands: command_tx,
        })
    }

    /// Join the group with the given payload. Resolves with an owned
    /// membership once the coordinator has created the member znode. A
    /// membership is not renewed across a session expiration; watch the
    /// group and rejoin instead.
    pub async fn join(&self, data: impl Into<Bytes>) -> Result<Membership> {
        let data = data.into();
        self.call(|tx| Command::Join { data, tx }).await
    }

    /// Cancel a membership. Only memberships owned by this group instance
    /// (obtained from its [`Group::join`]) can be cancelled.
    pub async fn cancel(&self, membership: &Membership) -> Result<bool> {
        let sequence = membership.id();
        self.call(|tx| Command::Cancel { sequence, tx }).await
    }

    /// Fetch the payload a member joined with.
    pub async fn data(&self, membership: &Membership) -> Result<Bytes> {
        let sequence = membership.id();
        self.call(|tx| Command::Data { sequence, tx }).await
    }

    /// Resolves with the current member set as soon as it is known to
    /// differ from `expected`. An empty `expected` resolves on the first
    /// non-empty observation.
    pub async fn watch(&self, expected: &BTreeSet<Membership>) -> Result<BTreeSet<Membership>> {
        let expected: BTreeSet<u64> = expected.iter().map(Membership::id).collect();
        self.call(|tx| Command::Watch { expected, tx }).await
    }

    /// The current coordinator session id, or `None` while disconnected.
    pub async fn session(&self) -> Result<Option<i64>> {
        self.call(|tx| Command::Session { tx }).await
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::Terminated("group"))?;
        rx.await.map_err(|_| Error::Terminated("group"))?
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

struct JoinRequest {
    data: Bytes,
    tx: oneshot::Sender<Result<Membership>>,
}

struct CancelRequest {
    sequence: u64,
    tx: oneshot::Sender<Result<bool>>,
}

struct DataRequest {
    sequence: u64,
    tx: oneshot::Sender<Result<Bytes>>,
}

struct WatchRequest {
    expected: BTreeSet<u64>,
    tx: oneshot::Sender<Result<BTreeSet<Membership>>>,
}

#[derive(Default)]
struct Pending {
    joins: VecDeque<JoinRequest>,
    cancels: VecDeque<CancelRequest>,
    datas: VecDeque<DataRequest>,
    /// Watches are kept until the member set differs from their
    /// expectation, so this is retained rather than drained.
    watches: Vec<WatchRequest>,
}

/// Watchdog guarding one disconnected session.
struct Watchdog {
    session_id: i64,
    deadline: Instant,
}

struct GroupActor {
    config: GroupConfig,
    client: Arc<dyn CoordinatorClient>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: EventReceiver,
    state: ConnectionState,
    /// Whether the current session has authenticated and ensured the
    /// parent znode.
    prepared: bool,
    /// Non-retryable error; once set, the group is permanently failed.
    latched: Option<Error>,
    pending: Pending,
    /// Sequences created by this instance, with their cancellation slots.
    owned: BTreeMap<u64, CancelSlot>,
    /// Sequences observed to exist, created elsewhere.
    unowned: BTreeMap<u64, CancelSlot>,
    /// Sequences last read from the tree; `None` marks the cache invalid.
    cache: Option<BTreeSet<u64>>,
    backoff: Option<backon::ExponentialBackoff>,
    retry_at: Option<Instant>,
    watchdog: Option<Watchdog>,
}

impl GroupActor {
    async fn run(mut self) {
        loop {
            let retry_deadline = self.retry_at;
            let watchdog_deadline = self.watchdog.as_ref().map(|watchdog| watchdog.deadline);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = tokio::time::sleep_until(retry_deadline.unwrap_or_else(Instant::now)),
                    if retry_deadline.is_some() =>
                {
                    self.retry_at = None;
                    debug!("retrying pending group operations");
                    self.sync_and_reschedule().await;
                }
                _ = tokio::time::sleep_until(watchdog_deadline.unwrap_or_else(Instant::now)),
                    if watchdog_deadline.is_some() =>
                {
                    self.timed_out().await;
                }
            }
        }
        debug!(znode = %self.config.znode, "last group handle dropped; closing session");
    }

    async fn handle_command(&mut self, command: Command) {
        if let Some(latched) = self.latched.clone() {
            fail_command(command, latched);
            return;
        }
        let queued = match command {
            Command::Session { tx } => {
                let session = (self.state == ConnectionState::Connected)
                    .then(|| self.client.session_id())
                    .flatten();
                let _ = tx.send(Ok(session));
                false
            }
            Command::Join { data, tx } => {
                self.pending.joins.push_back(JoinRequest { data, tx });
                true
            }
            Command::Cancel { sequence, tx } => {
                self.pending.cancels.push_back(CancelRequest { sequence, tx });
                true
            }
            Command::Data { sequence, tx } => {
                self.pending.datas.push_back(DataRequest { sequence, tx });
                true
            }
            Command::Watch { expected, tx } => {
                self.pending.watches.push(WatchRequest { expected, tx });
                true
            }
        };
        if queued && self.state == ConnectionState::Connected {
            self.sync_and_reschedule().await;
        }
    }

    async fn handle_event(&mut self, event: ClientEvent) {
        if self.latched.is_some() {
            return;
        }
        match event {
            ClientEvent::Connected { reconnect } => {
                info!(
                    reconnect,
                    session = ?self.client.session_id(),
                    "connected to the coordinator"
                );
                self.watchdog = None;
                // Watches may have been missed: with a fresh session they
                // are dead, after a reconnect they may have fired into the
                // void. Either way the cache must be re-read (and with it
                // the parent re-watched).
                self.cache = None;
                if !reconnect {
                    self.prepared = false;
                }
                self.state = ConnectionState::Connected;
                self.sync_and_reschedule().await;
            }
            ClientEvent::Reconnecting => {
                if self.state != ConnectionState::Connected {
                    debug!("connection attempt interrupted; still waiting for a session");
                    return;
                }
                let session_id = self.client.session_id().unwrap_or(-1);
                warn!(
                    session = session_id,
                    timeout = ?self.config.session_timeout,
                    "disconnected from the coordinator; arming session watchdog"
                );
                self.state = ConnectionState::Disconnected;
                self.watchdog = Some(Watchdog {
                    session_id,
                    deadline: Instant::now() + self.config.session_timeout,
                });
            }
            ClientEvent::Expired => {
                info!("coordinator session expired");
                self.expire(false).await;
            }
            ClientEvent::NodeCreated(path)
            | ClientEvent::NodeUpdated(path)
            | ClientEvent::NodeDeleted(path) => {
                debug!(%path, "watched znode changed");
                self.cache = None;
                if self.state == ConnectionState::Connected {
                    self.sync_and_reschedule().await;
                }
            }
        }
    }

    /// The session watchdog fired: if the session we armed it for is still
    /// the current one and still disconnected, declare it dead ourselves.
    async fn timed_out(&mut self) {
        let Some(watchdog) = self.watchdog.take() else {
            return;
        };
        if self.state == ConnectionState::Disconnected
            && self.client.session_id() == Some(watchdog.session_id)
        {
            warn!(
                session = watchdog.session_id,
                "timed out waiting to reconnect; forcing session expiration"
            );
            self.expire(true).await;
        }
    }

    /// The expiration path, shared by coordinator-reported and locally
    /// forced expirations.
    ///
    /// Every tracked membership resolves `false` (none of these
    /// disappearances were requested through `cancel`) and the session is
    /// reopened. Queued operations survive a coordinator-reported
    /// expiration and replay under the new session; a forced expiration
    /// means we have been disconnected for the whole session timeout, so
    /// nothing queued can complete in bounded time and it is all failed
    /// instead.
    async fn expire(&mut self, forced: bool) {
        self.watchdog = None;
        self.retry_at = None;
        self.backoff = None;
        self.cache = None;
        self.prepared = false;

        for (_, slot) in std::mem::take(&mut self.owned) {
            let _ = slot.send(Some(Ok(false)));
        }
        for (_, slot) in std::mem::take(&mut self.unowned) {
            let _ = slot.send(Some(Ok(false)));
        }

        if forced {
            self.fail_pending(Error::SessionExpired);
        }

        self.state = ConnectionState::Connecting;
        self.client.reopen().await;
    }

    /// Record a non-retryable error and fail everything, permanently.
    fn latch(&mut self, err: Error) {
        error!(error = %err, "non-retryable coordinator error; failing the group");
        self.latched = Some(err.clone());
        self.retry_at = None;
        self.backoff = None;
        self.watchdog = None;
        self.cache = None;
        self.fail_pending(err.clone());
        for (_, slot) in std::mem::take(&mut self.owned)
            .into_iter()
            .chain(std::mem::take(&mut self.unowned))
        {
            let _ = slot.send(Some(Err(err.clone())));
        }
    }

    fn fail_pending(&mut self, err: Error) {
        for join in self.pending.joins.drain(..) {
            let _ = join.tx.send(Err(err.clone()));
        }
        for cancel in self.pending.cancels.drain(..) {
            let _ = cancel.tx.send(Err(err.clone()));
        }
        for data in self.pending.datas.drain(..) {
            let _ = data.tx.send(Err(err.clone()));
        }
        for watch in self.pending.watches.drain(..) {
            let _ = watch.tx.send(Err(err.clone()));
        }
    }

    async fn sync_and_reschedule(&mut self) {
        if self.state != ConnectionState::Connected || self.latched.is_some() {
            return;
        }
        match self.sync().await {
            Ok(()) => {
                self.backoff = None;
                self.retry_at = None;
            }
            Err(err) if err.is_retryable() => {
                if self.retry_at.is_none() {
                    let delay = self
                        .backoff
                        .get_or_insert_with(|| retry::sync_policy().build())
                        .next()
                        .unwrap_or(RETRY_INTERVAL);
                    debug!(error = %err, ?delay, "transient coordinator error; will retry");
                    self.retry_at = Some(Instant::now() + delay);
                }
            }
            Err(err) => self.latch(err),
        }
    }

    /// One pass synchronizing pending operations with the coordinator:
    /// prepare the session, refresh the cache if invalid, then drain
    /// joins, cancels and datas and settle watches, in that order.
    async fn sync(&mut self) -> Result<()> {
        if !self.prepared {
            self.prepare().await?;
            self.prepared = true;
        }
        if self.cache.is_none() {
            self.refresh_cache().await?;
            self.update_watches();
        }
        self.drain_joins().await?;
        self.drain_cancels().await?;
        self.drain_datas().await?;
        self.update_watches();
        Ok(())
    }

    /// Authenticate (if configured) and ensure the parent znode exists.
    async fn prepare(&mut self) -> Result<()> {
        if let Some(auth) = &self.config.auth {
            match self.client.authenticate(auth).await {
                Ok(()) => {}
                Err(err) if err.is_retryable() => return Err(err),
                Err(err @ Error::AuthFailed(_)) => return Err(err),
                Err(err) => return Err(Error::AuthFailed(err.to_string())),
            }
        }

        let acl = self.acl();
        let mut path = String::new();
        for component in self.config.znode.split('/').filter(|c| !c.is_empty()) {
            path.push('/');
            path.push_str(component);
            match self
                .client
                .create(&path, Bytes::new(), acl, CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Re-read the tree (installing the parent watch) and reconcile the
    /// owned/unowned maps against it.
    async fn refresh_cache(&mut self) -> Result<()> {
        let children = match self.client.get_children(&self.config.znode, true).await {
            Ok(children) => children,
            Err(Error::NoNode(path)) => {
                // The parent vanished underneath us; re-create it on the
                // retried pass.
                self.prepared = false;
                return Err(Error::NoNode(path));
            }
            Err(err) => return Err(err),
        };

        let mut current = BTreeSet::new();
        for child in children {
            match parse_sequence(&child) {
                Some(sequence) => {
                    current.insert(sequence);
                }
                None => warn!(child = %child, "ignoring group member with unparsable sequence"),
            }
        }

        // Tracked memberships that disappeared from the tree were
        // cancelled, though not by us.
        settle_missing(&mut self.owned, &current);
        settle_missing(&mut self.unowned, &current);

        for sequence in &current {
            if !self.owned.contains_key(sequence) && !self.unowned.contains_key(sequence) {
                let (slot, _) = watch::channel(None);
                self.unowned.insert(*sequence, slot);
            }
        }

        debug!(members = current.len(), "refreshed membership cache");
        self.cache = Some(current);
        Ok(())
    }

    async fn drain_joins(&mut self) -> Result<()> {
        while let Some(join) = self.pending.joins.pop_front() {
            match self
                .client
                .create(
                    &self.member_prefix(),
                    join.data.clone(),
                    self.acl(),
                    CreateMode::EphemeralSequential,
                )
                .await
            {
                Ok(path) => {
                    let Some(sequence) = parse_sequence(last_component(&path)) else {
                        warn!(%path, "created member znode has an unparsable sequence");
                        let _ = join.tx.send(Err(Error::BadPath(path)));
                        continue;
                    };
                    info!(sequence, "joined the group");
                    let (slot, signal) = watch::channel(None);
                    self.owned.insert(sequence, slot);
                    if let Some(cache) = &mut self.cache {
                        cache.insert(sequence);
                    }
                    let _ = join.tx.send(Ok(Membership {
                        sequence,
                        cancelled: signal,
                    }));
                }
                Err(Error::NoNode(path)) => {
                    // The parent is gone; rebuild it and retry.
                    self.prepared = false;
                    self.pending.joins.push_front(join);
                    return Err(Error::NoNode(path));
                }
                Err(err) => {
                    self.pending.joins.push_front(join);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn drain_cancels(&mut self) -> Result<()> {
        while let Some(cancel) = self.pending.cancels.pop_front() {
            if !self.owned.contains_key(&cancel.sequence) {
                let _ = cancel.tx.send(Err(Error::NotOwned(cancel.sequence)));
                continue;
            }
            let path = self.member_path(cancel.sequence);
            match self.client.delete(&path).await {
                Ok(()) => {
                    info!(sequence = cancel.sequence, "cancelled group membership");
                    self.settle_owned(cancel.sequence, true);
                    let _ = cancel.tx.send(Ok(true));
                }
                Err(Error::NoNode(_)) => {
                    // Lost a race with some other disappearance, so the
                    // deletion was not ours.
                    debug!(sequence = cancel.sequence, "membership already gone");
                    self.settle_owned(cancel.sequence, false);
                    let _ = cancel.tx.send(Ok(false));
                }
                Err(err) => {
                    self.pending.cancels.push_front(cancel);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn drain_datas(&mut self) -> Result<()> {
        while let Some(data) = self.pending.datas.pop_front() {
            if !self.owned.contains_key(&data.sequence)
                && !self.unowned.contains_key(&data.sequence)
            {
                let _ = data
                    .tx
                    .send(Err(Error::NoNode(self.member_path(data.sequence))));
                continue;
            }
            let path = self.member_path(data.sequence);
            match self.client.get_data(&path).await {
                Ok(bytes) => {
                    let _ = data.tx.send(Ok(bytes));
                }
                Err(Error::NoNode(path)) => {
                    // The member vanished after we last looked; reconcile
                    // and let the retried pass settle this request.
                    self.cache = None;
                    self.pending.datas.push_front(data);
                    return Err(Error::NoNode(path));
                }
                Err(err) => {
                    self.pending.datas.push_front(data);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Fulfill pending watches whose expectation differs from the member
    /// set; the rest stay pending.
    fn update_watches(&mut self) {
        if self.cache.is_none() {
            return;
        }
        let current: BTreeSet<u64> = self
            .owned
            .keys()
            .chain(self.unowned.keys())
            .copied()
            .collect();
        if self
            .pending
            .watches
            .iter()
            .all(|request| request.expected == current)
        {
            return;
        }
        let snapshot = self.memberships_snapshot();
        let mut remaining = Vec::new();
        for request in self.pending.watches.drain(..) {
            if request.expected == current {
                remaining.push(request);
            } else {
                let _ = request.tx.send(Ok(snapshot.clone()));
            }
        }
        self.pending.watches = remaining;
    }

    /// Mint membership values for every tracked sequence.
    fn memberships_snapshot(&self) -> BTreeSet<Membership> {
        self.owned
            .iter()
            .chain(self.unowned.iter())
            .map(|(sequence, slot)| Membership {
                sequence: *sequence,
                cancelled: slot.subscribe(),
            })
            .collect()
    }

    /// Resolve an owned sequence's cancellation slot and drop it from the
    /// books.
    fn settle_owned(&mut self, sequence: u64, cancelled_by_us: bool) {
        if let Some(slot) = self.owned.remove(&sequence) {
            let _ = slot.send(Some(Ok(cancelled_by_us)));
        }
        if let Some(cache) = &mut self.cache {
            cache.remove(&sequence);
        }
    }

    fn acl(&self) -> Acl {
        if self.config.auth.is_some() {
            Acl::EveryoneReadCreatorAll
        } else {
            Acl::Open
        }
    }

    /// Path prefix handed to sequential creates; the coordinator appends
    /// the sequence digits.
    fn member_prefix(&self) -> String {
        if self.config.znode == "/" {
            "/".to_string()
        } else {
            format!("{}/", self.config.znode)
        }
    }

    fn member_path(&self, sequence: u64) -> String {
        format!("{}{}", self.member_prefix(), format_sequence(sequence))
    }
}

fn fail_command(command: Command, err: Error) {
    match command {
        Command::Join { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Command::Cancel { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Command::Data { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Command::Watch { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Command::Session { tx } => {
            let _ = tx.send(Err(err));
        }
    }
}

/// Resolve `false` for every tracked sequence no longer in the tree.
fn settle_missing(tracked: &mut BTreeMap<u64, CancelSlot>, current: &BTreeSet<u64>) {
    let gone: Vec<u64> = tracked
        .keys()
        .filter(|sequence| !current.contains(*sequence))
        .copied()
        .collect();
    for sequence in gone {
        if let Some(slot) = tracked.remove(&sequence) {
            let _ = slot.send(Some(Ok(false)));
        }
    }
}

/// Parse the trailing zero-padded sequence out of a member znode name.
fn parse_sequence(name: &str) -> Option<u64> {
    let start = name.len().saturating_sub(SEQUENCE_WIDTH);
    name.get(start..).and_then(|digits| digits.parse().ok())
}

fn format_sequence(sequence: u64) -> String {
    format!("{sequence:0width$}", width = SEQUENCE_WIDTH)
}

fn last_component(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
