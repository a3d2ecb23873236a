//! Retry policies for consistent backoff behavior across the crate.
//!
//! Named `backon` policies keep retry intent clear and jittered, instead
//! of ad-hoc sleeps scattered through the code.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `sync_policy` | 50ms | `RETRY_INTERVAL` | unbounded | group sync loop |
//! | `detect_policy` | 100ms | 5s | 10 | re-detecting after errors |
//!
//! The group drives `sync_policy` itself (it arms a single timer inside
//! its actor loop rather than wrapping an operation), so the policy is
//! consumed as a plain backoff iterator:
//!
//! ```rust
//! use backon::BackoffBuilder;
//!
//! let mut backoff = ballot::retry::sync_policy().build();
//! let first_delay = backoff.next();
//! assert!(first_delay.is_some());
//! ```

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::constants::{RETRY_INTERVAL, RETRY_MIN_DELAY};

/// Policy for the group's sync loop.
///
/// Characteristics:
/// - Retries forever: transient coordinator errors are bounded by the
///   session watchdog, not by a retry budget
/// - Capped at [`RETRY_INTERVAL`] so a recovering coordinator is picked
///   up promptly
/// - Includes jitter to keep a fleet of groups from thundering back in
///   lockstep
pub fn sync_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(RETRY_MIN_DELAY)
        .with_max_delay(RETRY_INTERVAL)
        .without_max_times()
        .with_jitter()
}

/// Policy for callers looping on `detect` after an error observation.
///
/// Characteristics:
/// - Moderate initial delay (100ms); a failed group usually needs a
///   session turnaround to recover
/// - Long max delay (5s) for outages
/// - Bounded (10 tries) so embedders surface persistent failures
pub fn detect_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_sync_policy_is_unbounded_and_capped() {
        let mut backoff = sync_policy().build();
        for _ in 0..64 {
            let delay = backoff.next().expect("sync policy must never run dry");
            // Jitter rides on top of the capped base delay.
            assert!(delay <= RETRY_INTERVAL * 2);
            assert!(delay >= RETRY_MIN_DELAY);
        }
    }

    #[test]
    fn test_detect_policy_is_bounded() {
        let mut backoff = detect_policy().build();
        let mut total = 0;
        while backoff.next().is_some() {
            total += 1;
            assert!(total <= 16, "detect policy should exhaust");
        }
        assert_eq!(total, 10);
    }
}
