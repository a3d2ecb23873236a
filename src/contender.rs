//! Contending for leadership of a group.
//!
//! A [`LeaderContender`] enters one candidacy into a [`Group`] and tracks
//! it until it is lost or withdrawn. Contending is two-staged:
//! [`LeaderContender::contend`] resolves once the candidacy is
//! established, handing back a [`Candidacy`] whose
//! [`lost`](Candidacy::lost) resolves when the candidacy is gone —
//! whether cancelled, expired with the session, or removed by an
//! operator.
//!
//! The contender never re-enters a lost candidacy: clients watch for the
//! loss and contend again with a fresh contender, so that leadership
//! changes stay observable.
//!
//! # State Machine
//!
//! The contender progresses `contending → watching → withdrawing`, or
//! `contending → withdrawing` when it withdraws before (or instead of)
//! establishing candidacy. Each state's promise is assigned at most once
//! and never reset.
//!
//! # Dropping
//!
//! Dropping the contender cancels the membership best-effort: the group
//! keeps retrying after the contender is gone, until it succeeds or the
//! session times out. One caveat is a drop that lands between enqueueing
//! the join and learning its result — the resulting membership is *not*
//! cancelled by the drop. Clients that need a guaranteed exit call
//! [`LeaderContender::withdraw`] and await it before dropping.

use std::collections::BTreeSet;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::group::{Group, Membership};

/// An established candidacy.
///
/// Hold on to it: [`Candidacy::lost`] is the only signal that leadership
/// (or the chance at it) is gone.
#[derive(Debug)]
pub struct Candidacy {
    lost: oneshot::Receiver<Result<()>>,
}

impl Candidacy {
    pub(crate) fn pending(lost: oneshot::Receiver<Result<()>>) -> Candidacy {
        Candidacy { lost }
    }

    /// Resolves when the candidacy is lost for any reason. Fails when the
    /// group hit a hard error (a latched failure or a forced session
    /// expiration while unreachable).
    pub async fn lost(self) -> Result<()> {
        match self.lost.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Terminated("contender")),
        }
    }
}

/// Messages from the handle to the contender actor.
enum Command {
    Contend {
        tx: oneshot::Sender<Result<Candidacy>>,
    },
    Withdraw {
        tx: oneshot::Sender<Result<bool>>,
    },
}

/// Completions posted back by forwarder tasks.
enum Completion {
    Joined(Result<Membership>),
    Watched(Result<BTreeSet<Membership>>),
    Cancelled(Result<bool>),
}

/// A single-candidacy contender over a [`Group`].
pub struct LeaderContender {
    commands: mpsc::UnboundedSender<Command>,
}

impl LeaderContender {
    /// Create a contender that will join `group` with `data` as its
    /// payload. Must be called from within a tokio runtime.
    pub fn new(group: Group, data: impl Into<Bytes>) -> LeaderContender {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            ContenderActor {
                group,
                data: data.into(),
                commands: command_rx,
                completions: completion_rx,
                completion_tx,
                contending: None,
                contended: false,
                watching: None,
                withdrawing: None,
                candidacy: CandidacyState::NotStarted,
            }
            .run(),
        );
        LeaderContender {
            commands: command_tx,
        }
    }

    /// Enter the contest. May only be called once; resolves once the
    /// candidacy is established.
    pub async fn contend(&self) -> Result<Candidacy> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Contend { tx })
            .map_err(|_| Error::Terminated("contender"))?;
        rx.await.map_err(|_| Error::Terminated("contender"))?
    }

    /// Withdraw from the contest. Resolves `true` if this withdrawal
    /// cancelled the membership (directly, or once an in-flight join
    /// completed), `false` if the join had already failed. Idempotent:
    /// repeated calls observe the same result.
    pub async fn withdraw(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Withdraw { tx })
            .map_err(|_| Error::Terminated("contender"))?;
        rx.await.map_err(|_| Error::Terminated("contender"))?
    }
}

enum CandidacyState {
    NotStarted,
    Pending,
    Ready(Membership),
    Failed,
}

enum WithdrawState {
    /// Waiters parked until the cancellation settles.
    Requested(Vec<oneshot::Sender<Result<bool>>>),
    /// Settled; later calls answer immediately with the same result.
    Settled(Result<bool>),
}

struct ContenderActor {
    group: Group,
    data: Bytes,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    /// Outer promise, pending until the candidacy is established.
    contending: Option<oneshot::Sender<Result<Candidacy>>>,
    contended: bool,
    /// Inner promise, resolved when the candidacy is lost.
    watching: Option<oneshot::Sender<Result<()>>>,
    withdrawing: Option<WithdrawState>,
    candidacy: CandidacyState,
}

impl ContenderActor {
    async fn run(mut self) {
        let mut handles_gone = false;
        loop {
            tokio::select! {
                command = self.commands.recv(), if !handles_gone => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        handles_gone = true;
                    }
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                else => break,
            }
            if handles_gone && !matches!(self.withdrawing, Some(WithdrawState::Requested(_))) {
                // Nothing left that could still settle a caller's future.
                break;
            }
        }
        self.finalize();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Contend { tx } => {
                if self.contended {
                    let _ = tx.send(Err(Error::AlreadyContended));
                    return;
                }
                info!(data = ?self.data, "joining the group to contend for leadership");
                self.contended = true;
                self.contending = Some(tx);
                self.candidacy = CandidacyState::Pending;

                let group = self.group.clone();
                let data = self.data.clone();
                let completions = self.completion_tx.clone();
                tokio::spawn(async move {
                    let joined = group.join(data).await;
                    let _ = completions.send(Completion::Joined(joined));
                });
            }
            Command::Withdraw { tx } => self.handle_withdraw(tx),
        }
    }

    fn handle_withdraw(&mut self, tx: oneshot::Sender<Result<bool>>) {
        if !self.contended {
            let _ = tx.send(Err(Error::NotContended));
            return;
        }
        match &mut self.withdrawing {
            Some(WithdrawState::Settled(outcome)) => {
                let _ = tx.send(outcome.clone());
            }
            Some(WithdrawState::Requested(waiters)) => waiters.push(tx),
            None => {
                self.withdrawing = Some(WithdrawState::Requested(vec![tx]));
                match &self.candidacy {
                    CandidacyState::Pending => {
                        // Withdraw once the in-flight join lands.
                        info!("withdraw requested before candidacy was obtained; deferring");
                    }
                    CandidacyState::Ready(membership) => {
                        self.cancel(membership.clone());
                    }
                    CandidacyState::Failed => {
                        // The join failed, so there is nothing to cancel.
                        self.settle_withdraw(Ok(false));
                    }
                    CandidacyState::NotStarted => unreachable!("contended implies a join"),
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Joined(Err(err)) => {
                self.candidacy = CandidacyState::Failed;
                self.fail(err);
            }
            Completion::Joined(Ok(membership)) => {
                info!(
                    sequence = membership.id(),
                    "entered the contest for leadership"
                );
                self.candidacy = CandidacyState::Ready(membership.clone());

                // The inner promise is assigned either way; with a
                // withdrawal already requested it just never resolves
                // (the contest was abandoned, not lost).
                let (lost_tx, lost_rx) = oneshot::channel();
                self.watching = Some(lost_tx);
                let delivered = match self.contending.take() {
                    Some(contending) => contending.send(Ok(Candidacy { lost: lost_rx })).is_ok(),
                    None => false,
                };

                if self.withdrawing.is_some() {
                    info!("joined the group after withdrawing started; cancelling");
                    self.cancel(membership);
                } else if delivered {
                    self.watch(BTreeSet::new());
                } else {
                    debug!("caller abandoned contend(); not watching the membership");
                }
            }
            Completion::Watched(Ok(memberships)) => {
                if self.withdrawing.is_some() {
                    debug!("group memberships changed after withdrawing started");
                    return;
                }
                let CandidacyState::Ready(membership) = &self.candidacy else {
                    return;
                };
                if memberships.contains(membership) {
                    // Still in the contest; keep watching.
                    self.watch(memberships);
                } else {
                    info!(sequence = membership.id(), "lost candidacy");
                    if let Some(watching) = self.watching.take() {
                        let _ = watching.send(Ok(()));
                    }
                }
            }
            Completion::Watched(Err(err)) => {
                if self.withdrawing.is_some() {
                    debug!(error = %err, "ignoring watch failure while withdrawing");
                    return;
                }
                self.fail(err);
            }
            Completion::Cancelled(outcome) => {
                debug!(?outcome, "membership cancellation settled");
                self.settle_withdraw(outcome);
            }
        }
    }

    /// Ask the group to cancel the obtained membership; the result comes
    /// back as a `Cancelled` completion.
    fn cancel(&self, membership: Membership) {
        let group = self.group.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let cancelled = group.cancel(&membership).await;
            let _ = completions.send(Completion::Cancelled(cancelled));
        });
    }

    fn watch(&self, expected: BTreeSet<Membership>) {
        let group = self.group.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let watched = group.watch(&expected).await;
            let _ = completions.send(Completion::Watched(watched));
        });
    }

    fn settle_withdraw(&mut self, outcome: Result<bool>) {
        match self.withdrawing.take() {
            Some(WithdrawState::Requested(waiters)) => {
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
                self.withdrawing = Some(WithdrawState::Settled(outcome));
            }
            previous => self.withdrawing = previous,
        }
    }

    /// Fail every assigned, unresolved promise.
    fn fail(&mut self, err: Error) {
        if let Some(contending) = self.contending.take() {
            let _ = contending.send(Err(err.clone()));
        }
        if let Some(watching) = self.watching.take() {
            let _ = watching.send(Err(err.clone()));
        }
        self.settle_withdraw(Err(err));
    }

    /// Best-effort cancellation on drop. The group keeps retrying even
    /// after the contender is gone, until it succeeds or the session
    /// times out.
    fn finalize(&mut self) {
        if let Some(watching) = self.watching.take() {
            // Whoever still holds the candidacy: it is over.
            let _ = watching.send(Ok(()));
        }
        if matches!(self.withdrawing, Some(WithdrawState::Settled(Ok(true)))) {
            return;
        }
        if let CandidacyState::Ready(membership) = &self.candidacy {
            debug!(
                sequence = membership.id(),
                "contender dropped; cancelling membership best-effort"
            );
            let group = self.group.clone();
            let membership = membership.clone();
            tokio::spawn(async move {
                let _ = group.cancel(&membership).await;
            });
        }
    }
}
