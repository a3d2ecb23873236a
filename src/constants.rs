//! Centralized timing and protocol constants.
//!
//! This module consolidates the magic numbers used throughout the election
//! subsystem. Having them in one place makes it easier to:
//!
//! - Understand the coordination timing envelope
//! - Update values consistently
//! - Document the rationale for each constant

use std::time::Duration;

// =============================================================================
// Coordination Timing
// =============================================================================

/// Upper bound on the delay between retries of the group's sync loop.
///
/// Transient failures (connection loss, operation timeouts, racing deletes)
/// are retried indefinitely with jittered exponential backoff capped at this
/// interval; at most one retry timer is armed per group at any time.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Initial delay of the sync retry backoff.
pub const RETRY_MIN_DELAY: Duration = Duration::from_millis(50);

/// Default coordinator session timeout.
///
/// Also the window the group's own watchdog allows for a disconnected
/// session to reconnect before forcing local expiration. The coordinator
/// client only reports "reconnecting", never "dead", so without this
/// watchdog a silent never-reconnect would wedge every caller.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Znode Naming
// =============================================================================

/// Width of the zero-padded decimal sequence suffix the coordinator appends
/// to sequential znode names.
pub const SEQUENCE_WIDTH: usize = 10;

/// URL scheme for coordinator-backed election backends.
pub const URL_SCHEME: &str = "zk://";

/// URL scheme for file-indirected election backends.
pub const FILE_SCHEME: &str = "file://";

/// Authentication scheme used for credentials embedded in a coordinator URL.
pub const DIGEST_SCHEME: &str = "digest";
