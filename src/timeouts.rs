//! Centralized timeout and retry defaults.
//!
//! Device-facing defaults mirror the usual management-protocol values; the
//! cluster-facing ones bound how long a follower waits on the owner.

use crate::error::ClusterError;
use std::fmt;
use std::time::Duration;

/// Time allowed for a single device connection attempt.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(20_000);
/// Time allowed for a device request, including keepalive probes.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);
/// Time a follower waits for the owner's endpoint to answer.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(5);
/// First delay between reconnect attempts.
pub const DEFAULT_BETWEEN_ATTEMPTS: Duration = Duration::from_millis(2_000);
/// Upper bound on the delay between reconnect attempts.
pub const DEFAULT_MAX_BETWEEN_ATTEMPTS: Duration = Duration::from_millis(1_200_000);
pub const DEFAULT_SLEEP_FACTOR: f64 = 1.5;

/// Candidate registration attempts before a device context gives up.
pub const REGISTRATION_ATTEMPTS: usize = 3;
pub const REGISTRATION_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Attempts to fetch one advertised schema source while the owner times out.
pub const SCHEMA_PREFETCH_ATTEMPTS: usize = 3;

/// Pause before a follower retries a failed mount rebuild.
pub const REBUILD_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bound on the idle-expiry sweep period of the operation endpoint.
pub const MAX_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period granted to endpoint workers when asked to shut down.
pub const ENDPOINT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bounds `fut` by `duration`; expiry becomes a `ClusterError::Timeout`
/// naming `target`.
pub async fn with_timeout<F, T>(
    target: impl fmt::Display,
    duration: Duration,
    fut: F,
) -> Result<T, ClusterError>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ClusterError::Timeout {
            target: target.to_string(),
            timeout: duration,
        })
}
