//! Standalone election and the backend factory.
//!
//! Deployments without a coordinator still want the contender/detector
//! interfaces: a single-node setup elects itself, a statically configured
//! fleet reads its leader's address from a file. This module provides
//! those thin renditions plus [`Backend`], which turns a configuration
//! string into the right flavor:
//!
//! - `""` — standalone: the local process is its own leader
//! - `"zk://host:port[,host:port...]/path"` — coordinator-backed election
//! - `"file:///etc/svc/leader"` — read the file once and recurse on its
//!   trimmed contents (a URL or, for detectors, a bare leader address)

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::info;

use crate::client::Connector;
use crate::constants::{FILE_SCHEME, URL_SCHEME};
use crate::contender::{Candidacy, LeaderContender};
use crate::detector::{Detected, LeaderDetector};
use crate::error::{Error, Result};
use crate::group::{Group, GroupConfig};
use crate::url::CoordinatorUrl;

/// Where election state lives, parsed from a configuration string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// No coordinator; the local process stands alone.
    Standalone,
    /// A coordinator ensemble and chroot to elect under.
    Url(CoordinatorUrl),
    /// A fixed leader address (meaningful for detectors only).
    Address(String),
}

impl Backend {
    /// Parse a configuration string, following one level of `file://`
    /// indirection.
    pub fn parse(spec: &str) -> Result<Backend> {
        Backend::parse_at(spec.trim(), 0)
    }

    fn parse_at(spec: &str, depth: usize) -> Result<Backend> {
        if spec.is_empty() {
            return Ok(Backend::Standalone);
        }
        if spec.starts_with(URL_SCHEME) {
            let url = CoordinatorUrl::parse(spec)?;
            if url.path == "/" {
                return Err(Error::InvalidUrl(format!(
                    "expecting a chroot path in '{spec}' ('/' is not supported)"
                )));
            }
            return Ok(Backend::Url(url));
        }
        if let Some(path) = spec.strip_prefix(FILE_SCHEME) {
            if depth > 0 {
                return Err(Error::InvalidUrl(format!(
                    "'{spec}': a file:// backend may not point at another file://"
                )));
            }
            let contents = std::fs::read_to_string(path)
                .map_err(|err| Error::Io(format!("'{path}': {err}")))?;
            return Backend::parse_at(contents.trim(), depth + 1);
        }
        Ok(Backend::Address(spec.to_string()))
    }
}

/// Build a contender for the parsed backend. Bare addresses are rejected:
/// there is nothing to contend against in a file.
pub fn contender_for(
    spec: &str,
    connector: Arc<dyn Connector>,
    session_timeout: Duration,
    data: impl Into<Bytes>,
) -> Result<AnyContender> {
    match Backend::parse(spec)? {
        Backend::Standalone => Ok(AnyContender::Standalone(StandaloneContender::new())),
        Backend::Url(url) => {
            let group = Group::new(connector, GroupConfig::from_url(&url, session_timeout))?;
            Ok(AnyContender::Coordinated(LeaderContender::new(group, data)))
        }
        Backend::Address(address) => Err(Error::InvalidUrl(format!(
            "cannot contend against a fixed leader address '{address}'"
        ))),
    }
}

/// Build a detector for the parsed backend.
pub fn detector_for(
    spec: &str,
    connector: Arc<dyn Connector>,
    session_timeout: Duration,
) -> Result<AnyDetector> {
    match Backend::parse(spec)? {
        Backend::Standalone => Ok(AnyDetector::Standalone(StandaloneDetector::new())),
        Backend::Url(url) => {
            let group = Group::new(connector, GroupConfig::from_url(&url, session_timeout))?;
            Ok(AnyDetector::Coordinated(LeaderDetector::new(group)))
        }
        Backend::Address(address) => Ok(AnyDetector::Standalone(StandaloneDetector::appointed(
            Some(address),
        ))),
    }
}

/// A contender of either flavor, as built by [`contender_for`].
pub enum AnyContender {
    Standalone(StandaloneContender),
    Coordinated(LeaderContender),
}

impl AnyContender {
    pub async fn contend(&self) -> Result<Candidacy> {
        match self {
            AnyContender::Standalone(contender) => Ok(contender.contend()),
            AnyContender::Coordinated(contender) => contender.contend().await,
        }
    }

    pub async fn withdraw(&self) -> Result<bool> {
        match self {
            AnyContender::Standalone(contender) => Ok(contender.withdraw()),
            AnyContender::Coordinated(contender) => contender.withdraw().await,
        }
    }
}

/// A detector of either flavor, as built by [`detector_for`].
pub enum AnyDetector {
    Standalone(StandaloneDetector),
    Coordinated(LeaderDetector),
}

impl AnyDetector {
    pub async fn detect(&self, previous: Detected) -> Detected {
        match self {
            AnyDetector::Standalone(detector) => detector.detect(previous).await,
            AnyDetector::Coordinated(detector) => detector.detect(previous).await,
        }
    }
}

/// A contender without a coordinator: candidacy is granted immediately
/// and lost only when withdrawn, re-entered, or dropped.
#[derive(Default)]
pub struct StandaloneContender {
    candidacy: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl StandaloneContender {
    pub fn new() -> StandaloneContender {
        StandaloneContender::default()
    }

    /// Enter the (one-horse) contest. Re-contending withdraws the
    /// previous candidacy first.
    pub fn contend(&self) -> Candidacy {
        let mut slot = self.lock();
        if let Some(previous) = slot.take() {
            info!("withdrawing the previous standalone candidacy before recontending");
            let _ = previous.send(Ok(()));
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Candidacy::pending(rx)
    }

    /// Give up the candidacy. Returns whether there was one to give up.
    pub fn withdraw(&self) -> bool {
        match self.lock().take() {
            Some(candidacy) => {
                let _ = candidacy.send(Ok(()));
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<Result<()>>>> {
        self.candidacy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StandaloneContender {
    fn drop(&mut self) {
        // Dropping the contender is leadership lost.
        self.withdraw();
    }
}

struct AppointedState {
    current: Detected,
    waiters: Vec<(Detected, oneshot::Sender<Detected>)>,
}

/// A detector whose leader is appointed locally instead of elected.
#[derive(Clone)]
pub struct StandaloneDetector {
    state: Arc<Mutex<AppointedState>>,
}

impl Default for StandaloneDetector {
    fn default() -> StandaloneDetector {
        StandaloneDetector::new()
    }
}

impl StandaloneDetector {
    /// A detector with no leader appointed yet.
    pub fn new() -> StandaloneDetector {
        StandaloneDetector::appointed(None)
    }

    /// A detector born with an appointed leader, e.g. one read from a
    /// file.
    pub fn appointed(leader: Option<String>) -> StandaloneDetector {
        StandaloneDetector {
            state: Arc::new(Mutex::new(AppointedState {
                current: Ok(leader),
                waiters: Vec::new(),
            })),
        }
    }

    /// Appoint (or depose, with `None`) the leader, waking the waiters
    /// this is news for.
    pub fn appoint(&self, leader: Option<String>) {
        let mut state = self.lock();
        state.current = Ok(leader);
        let current = state.current.clone();
        let (kept, woken): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiters)
            .into_iter()
            .partition(|(previous, _)| *previous == current);
        state.waiters = kept;
        drop(state);
        for (_, tx) in woken {
            let _ = tx.send(current.clone());
        }
    }

    /// Same contract as [`LeaderDetector::detect`]: resolves once the
    /// appointment differs from `previous`.
    pub async fn detect(&self, previous: Detected) -> Detected {
        let rx = {
            let mut state = self.lock();
            if previous != state.current {
                return state.current.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push((previous, tx));
            rx
        };
        match rx.await {
            Ok(observed) => observed,
            Err(_) => Err(Error::Terminated("detector")),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AppointedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backend_parse_standalone() {
        assert_eq!(Backend::parse("").unwrap(), Backend::Standalone);
        assert_eq!(Backend::parse("   ").unwrap(), Backend::Standalone);
    }

    #[test]
    fn test_backend_parse_url() {
        let backend = Backend::parse("zk://a:2181,b:2181/elect").unwrap();
        let Backend::Url(url) = backend else {
            panic!("expected a coordinator URL backend");
        };
        assert_eq!(url.servers, "a:2181,b:2181");
        assert_eq!(url.path, "/elect");
    }

    #[test]
    fn test_backend_parse_rejects_root_chroot() {
        assert!(matches!(
            Backend::parse("zk://a:2181/"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            Backend::parse("zk://a:2181"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_backend_parse_address() {
        assert_eq!(
            Backend::parse("10.0.0.1:5050").unwrap(),
            Backend::Address("10.0.0.1:5050".to_string())
        );
    }

    #[test]
    fn test_backend_parse_file_indirection() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "zk://a:2181/elect").unwrap();

        let spec = format!("file://{}", file.path().display());
        let backend = Backend::parse(&spec).unwrap();
        assert!(matches!(backend, Backend::Url(_)));
    }

    #[test]
    fn test_backend_parse_file_with_address() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  10.0.0.1:5050  ").unwrap();

        let spec = format!("file://{}", file.path().display());
        assert_eq!(
            Backend::parse(&spec).unwrap(),
            Backend::Address("10.0.0.1:5050".to_string())
        );
    }

    #[test]
    fn test_backend_parse_rejects_nested_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "file:///etc/other").unwrap();

        let spec = format!("file://{}", file.path().display());
        assert!(matches!(Backend::parse(&spec), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_backend_parse_missing_file() {
        assert!(matches!(
            Backend::parse("file:///definitely/not/here"),
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_standalone_contender_holds_until_withdrawn() {
        let contender = StandaloneContender::new();
        let candidacy = contender.contend();

        let lost = tokio::spawn(candidacy.lost());
        assert!(!lost.is_finished());

        assert!(contender.withdraw());
        assert_eq!(lost.await.unwrap(), Ok(()));

        // Nothing left to withdraw.
        assert!(!contender.withdraw());
    }

    #[tokio::test]
    async fn test_standalone_contender_recontend_withdraws_previous() {
        let contender = StandaloneContender::new();
        let first = contender.contend();
        let second = contender.contend();

        // The first candidacy is lost the moment the second exists.
        assert_eq!(first.lost().await, Ok(()));

        drop(contender);
        assert_eq!(second.lost().await, Ok(()));
    }

    #[tokio::test]
    async fn test_standalone_detector_delivers_deltas_only() {
        let detector = StandaloneDetector::new();

        // Nothing appointed: a `None` previous stays pending.
        let pending = {
            let detector = detector.clone();
            tokio::spawn(async move { detector.detect(Ok(None)).await })
        };
        assert!(!pending.is_finished());

        detector.appoint(Some("10.0.0.1:5050".to_string()));
        assert_eq!(
            pending.await.unwrap(),
            Ok(Some("10.0.0.1:5050".to_string()))
        );

        // A stale previous answers immediately.
        assert_eq!(
            detector.detect(Ok(None)).await,
            Ok(Some("10.0.0.1:5050".to_string()))
        );
    }

    #[tokio::test]
    async fn test_appointed_detector_answers_from_birth() {
        let detector = StandaloneDetector::appointed(Some("10.0.0.1:5050".to_string()));
        assert_eq!(
            detector.detect(Ok(None)).await,
            Ok(Some("10.0.0.1:5050".to_string()))
        );
    }
}
