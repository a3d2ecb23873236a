//! Detecting the current leader of a group.
//!
//! A [`LeaderDetector`] runs one shared watch loop over a [`Group`] and
//! answers [`detect`](LeaderDetector::detect) calls with the current
//! leader — but only once that observation *differs* from whatever the
//! caller saw last. Callers therefore loop: detect, act on the observed
//! leader, detect again passing the observation back in.
//!
//! An observation is a [`Detected`]: `Ok(None)` while the group has no
//! members, `Ok(Some(address))` with the leader's payload decoded as an
//! address, or `Err` when the group failed (latched error, forced session
//! expiration) or the payload did not decode. Errors are delivered to
//! *every* pending caller; a subsequent `detect` with the error passed
//! back as `previous` then waits for recovery.
//!
//! The leader is the group member with the smallest sequence. No
//! cancellation observer is installed on the leader's membership: the
//! watch loop's delta detection is sufficient.

use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::group::{Group, Membership};

/// A leader observation: no leader, a leader address, or a failure.
pub type Detected = Result<Option<String>>;

/// Messages from the handle to the detector actor.
enum Command {
    Detect {
        previous: Detected,
        tx: oneshot::Sender<Detected>,
    },
}

/// Completions posted back by forwarder tasks.
enum Completion {
    Watched(Result<BTreeSet<Membership>>),
    Fetched {
        sequence: u64,
        payload: Result<bytes::Bytes>,
    },
}

/// A change-delta leader observer over a [`Group`].
pub struct LeaderDetector {
    commands: mpsc::UnboundedSender<Command>,
}

impl LeaderDetector {
    /// Create a detector over `group` and start its watch loop. Must be
    /// called from within a tokio runtime.
    pub fn new(group: Group) -> LeaderDetector {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let actor = DetectorActor {
            group,
            commands: command_rx,
            completions: completion_rx,
            completion_tx,
            current: Ok(None),
            leader_sequence: None,
            fetching: None,
            watching: false,
            last_set: BTreeSet::new(),
            pending: Vec::new(),
        };
        tokio::spawn(actor.run());
        LeaderDetector {
            commands: command_tx,
        }
    }

    /// Resolve with the current leader observation once it differs from
    /// `previous`. Pass `Ok(None)` on the first call and feed every
    /// delivered observation back in to get change-only notifications.
    pub async fn detect(&self, previous: Detected) -> Detected {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Detect { previous, tx })
            .is_err()
        {
            return Err(Error::Terminated("detector"));
        }
        match rx.await {
            Ok(observed) => observed,
            Err(_) => Err(Error::Terminated("detector")),
        }
    }
}

struct DetectorActor {
    group: Group,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    /// The observation last broadcast, compared against callers'
    /// `previous`.
    current: Detected,
    /// Sequence of the leader behind `current`, to skip redundant
    /// payload fetches.
    leader_sequence: Option<u64>,
    /// Sequence of an in-flight payload fetch; stale completions are
    /// discarded.
    fetching: Option<u64>,
    /// Whether a group watch is armed.
    watching: bool,
    /// The member set last delivered, re-armed as the next expectation.
    last_set: BTreeSet<Membership>,
    pending: Vec<(Detected, oneshot::Sender<Detected>)>,
}

impl DetectorActor {
    async fn run(mut self) {
        // Observe from the start so `detect` answers from a warm cache.
        self.arm_watch();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
            }
        }
        debug!("last detector handle dropped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Detect { previous, tx } => {
                if previous != self.current {
                    let _ = tx.send(self.current.clone());
                    return;
                }
                self.pending.push((previous, tx));
                // A failed watch is not re-armed until somebody asks
                // again, so a latched group cannot spin the loop.
                if !self.watching {
                    self.arm_watch();
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Watched(Ok(memberships)) => {
                self.last_set = memberships.clone();
                match memberships.iter().next() {
                    None => {
                        self.fetching = None;
                        if self.leader_sequence.take().is_some() || self.current != Ok(None) {
                            info!("no leader");
                        }
                        self.publish(Ok(None));
                    }
                    Some(leader) => {
                        if self.leader_sequence != Some(leader.id()) {
                            self.fetch(leader.clone());
                        }
                    }
                }
                self.arm_watch();
            }
            Completion::Watched(Err(err)) => {
                warn!(error = %err, "group watch failed; failing pending detections");
                self.watching = false;
                self.last_set = BTreeSet::new();
                self.leader_sequence = None;
                self.fetching = None;
                self.current = Err(err.clone());
                // Unlike regular observations, a failure goes to every
                // pending caller.
                for (_, tx) in self.pending.drain(..) {
                    let _ = tx.send(Err(err.clone()));
                }
            }
            Completion::Fetched { sequence, payload } => {
                if self.fetching != Some(sequence) {
                    debug!(sequence, "discarding stale leader payload");
                    return;
                }
                self.fetching = None;
                match payload {
                    Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
                        Ok(address) => {
                            info!(sequence, address = %address, "detected a new leader");
                            self.leader_sequence = Some(sequence);
                            self.publish(Ok(Some(address)));
                        }
                        Err(_) => {
                            warn!(sequence, "leader payload is not valid UTF-8");
                            self.leader_sequence = Some(sequence);
                            self.publish(Err(Error::Payload(format!(
                                "member {sequence} payload is not valid UTF-8"
                            ))));
                        }
                    },
                    Err(Error::NoNode(_)) => {
                        // The leader vanished between the watch delivery
                        // and our read; the watch loop reports what
                        // replaced it.
                        debug!(sequence, "leader disappeared before its payload was read");
                    }
                    Err(err) => {
                        warn!(sequence, error = %err, "failed to read the leader payload");
                        self.publish(Err(err));
                    }
                }
            }
        }
    }

    /// Record and deliver an observation to the pending callers it is
    /// news for.
    fn publish(&mut self, observed: Detected) {
        self.current = observed;
        let current = self.current.clone();
        let (kept, delivered): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(previous, _)| *previous == current);
        self.pending = kept;
        for (_, tx) in delivered {
            let _ = tx.send(current.clone());
        }
    }

    fn arm_watch(&mut self) {
        self.watching = true;
        let group = self.group.clone();
        let expected = self.last_set.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let watched = group.watch(&expected).await;
            let _ = completions.send(Completion::Watched(watched));
        });
    }

    fn fetch(&mut self, leader: Membership) {
        self.fetching = Some(leader.id());
        let group = self.group.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let payload = group.data(&leader).await;
            let _ = completions.send(Completion::Fetched {
                sequence: leader.id(),
                payload,
            });
        });
    }
}
