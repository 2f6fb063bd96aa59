//! Scheduler configuration.
//!
//! All durations are wall-clock. Construction never touches the store;
//! resolution of derived values (heartbeat cadence, per-instance claim
//! window, instance id) happens when the scheduler is built.

use std::time::Duration;

use uuid::Uuid;

use crate::backoff::{Backoff, DEFAULT_BASE, DEFAULT_MAX_DELAY};

/// Default physical collection name.
pub const DEFAULT_COLLECTION: &str = "monque_jobs";

/// Age-based cleanup of terminal jobs.
///
/// Absent cutoffs leave that status untouched; the service only runs when
/// a policy is configured at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Delete `completed` jobs whose last update is older than this.
    pub completed: Option<Duration>,
    /// Delete `failed` jobs whose last update is older than this.
    pub failed: Option<Duration>,
    /// Sweep period.
    pub interval: Duration,
}

/// Scheduler options.
///
/// The defaults match a small, latency-tolerant deployment: one-second
/// polling, three attempts with one-second base backoff, 30-second
/// leases. Tune `poll_interval` down and `worker_concurrency` up for
/// high-throughput queues.
#[derive(Debug, Clone)]
pub struct MonqueOptions {
    /// Physical collection name.
    pub collection_name: String,
    /// Poller period.
    pub poll_interval: Duration,
    /// Attempts before a job is terminally failed.
    pub max_retries: u32,
    /// Backoff base for retry delays.
    pub base_retry_interval: Duration,
    /// Backoff ceiling.
    pub max_backoff_delay: Duration,
    /// Graceful-stop deadline when `stop()` is called without one.
    pub shutdown_timeout: Duration,
    /// Global cap on concurrently executing handlers.
    pub worker_concurrency: usize,
    /// Per-instance claim window; defaults to `worker_concurrency`.
    pub instance_concurrency: Option<usize>,
    /// Lease duration. Must exceed expected inter-instance clock skew
    /// plus a safety margin.
    pub lock_timeout: Duration,
    /// Lease extension period; defaults to `lock_timeout / 3`.
    pub heartbeat_interval: Option<Duration>,
    /// Whether to run the stale-lease recovery service.
    pub recover_stale_jobs: bool,
    /// The `claimed_by` tag for this instance; defaults to a random id.
    pub scheduler_instance_id: Option<String>,
    /// Optional retention cleanup of terminal jobs.
    pub job_retention: Option<RetentionPolicy>,
}

impl Default for MonqueOptions {
    fn default() -> Self {
        Self {
            collection_name: DEFAULT_COLLECTION.to_string(),
            poll_interval: Duration::from_millis(1000),
            max_retries: 3,
            base_retry_interval: DEFAULT_BASE,
            max_backoff_delay: DEFAULT_MAX_DELAY,
            shutdown_timeout: Duration::from_millis(5000),
            worker_concurrency: 5,
            instance_concurrency: None,
            lock_timeout: Duration::from_millis(30_000),
            heartbeat_interval: None,
            recover_stale_jobs: true,
            scheduler_instance_id: None,
            job_retention: None,
        }
    }
}

impl MonqueOptions {
    /// Lease extension period: configured, or `lock_timeout / 3`.
    pub fn effective_heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(self.lock_timeout / 3)
    }

    /// How many jobs this instance may hold claimed at once.
    pub fn instance_slots(&self) -> usize {
        self.instance_concurrency.unwrap_or(self.worker_concurrency)
    }

    /// The retry backoff policy these options describe.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_retry_interval, self.max_backoff_delay)
    }

    /// The configured instance id, or a fresh random one.
    pub(crate) fn resolve_instance_id(&self) -> String {
        self.scheduler_instance_id
            .clone()
            .unwrap_or_else(|| format!("monque-{}", Uuid::new_v4()))
    }
}
