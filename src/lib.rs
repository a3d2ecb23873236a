//! # Ballot
//! Leader election and group membership on top of a hierarchical
//! coordination service.
//!
//! Processes compete for exclusive leadership of a named group by
//! creating ephemeral sequential znodes under a shared parent; the
//! member holding the smallest sequence is the leader. Other processes
//! discover the current leader and are notified only when it changes.
//! This is pure Rust all the way down; the coordination service itself
//! stays behind a small client trait.
//!
//! # Goals
//! - Survive the unglamorous parts: disconnects, reconnects, session
//!   expirations, and coordinators that silently never come back
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Be a building block for cluster masters, schedulers and failover
//!   managers
//!
//! ## Getting started
//! Install `ballot` to your rust project with `cargo add ballot` or include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! ballot = "0.1"
//! ```
//!
//! ### Electing a leader
//! A [`Group`](group::Group) multiplexes join/cancel/data/watch over one
//! coordinator session. A [`LeaderContender`](contender::LeaderContender)
//! enters a candidacy; a [`LeaderDetector`](detector::LeaderDetector)
//! observes whoever currently holds the smallest sequence:
//!
//! ```text
//! let group = Group::new(connector, GroupConfig::new(servers, "/elect"))?;
//!
//! let contender = LeaderContender::new(group.clone(), "10.0.0.1:5050");
//! let candidacy = contender.contend().await?;
//!
//! let detector = LeaderDetector::new(group);
//! let leader = detector.detect(Ok(None)).await?;       // -> "10.0.0.1:5050"
//!
//! candidacy.lost().await?;                             // leadership is gone
//! ```
//!
//! The `connector` is whatever speaks your coordinator's wire protocol
//! (see [`client`]); an in-memory cluster behind the `test-utilities`
//! feature drives the crate's own tests and demos.
//!
//! ### Without a coordinator
//! Single-node and statically configured deployments use the same
//! interfaces through the standalone flavors:
//!
//! ```rust,no_run
//! use ballot::standalone::StandaloneDetector;
//!
//! # async fn example() {
//! let detector = StandaloneDetector::new();
//! detector.appoint(Some("10.0.0.1:5050".to_string()));
//! assert_eq!(
//!     detector.detect(Ok(None)).await,
//!     Ok(Some("10.0.0.1:5050".to_string())),
//! );
//! # }
//! ```
//!
//! [`Backend::parse`](standalone::Backend::parse) picks the flavor from a
//! configuration string: empty for standalone, `zk://` for coordinated,
//! `file://` to indirect through a file.

#![forbid(unsafe_code)]

pub mod client;
pub mod constants;
pub mod contender;
pub mod detector;
pub mod error;
pub mod group;
pub mod retry;
pub mod standalone;
pub mod telemetry;
pub mod url;

pub mod prelude {
    //! Main exports for election clients.
    pub use crate::client::{Authentication, Connector};
    pub use crate::contender::{Candidacy, LeaderContender};
    pub use crate::detector::{Detected, LeaderDetector};
    pub use crate::error::{Error, Result};
    pub use crate::group::{Group, GroupConfig, Membership};
    pub use crate::standalone::{
        contender_for, detector_for, AnyContender, AnyDetector, Backend, StandaloneContender,
        StandaloneDetector,
    };
    pub use crate::url::CoordinatorUrl;
}
