//! Lifecycle events and the in-process event bus.
//!
//! Every observable transition emits a [`SchedulerEvent`] on a broadcast
//! channel. Delivery is at-most-once and in-memory only: slow subscribers
//! may lag and drop events, and nothing is persisted. The job documents
//! themselves are the durable record; events exist for observability and
//! tests, never for coordination.

use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use tokio::sync::broadcast;

use crate::job::{Job, JobStatus};

/// Default broadcast capacity before slow receivers start lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// An observable scheduler transition.
///
/// Payloads carry the job (for transitions where subscribers commonly
/// inspect it) or the id plus enough context to correlate.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A new job document was inserted.
    JobEnqueued { job: Job },
    /// A claimed job was handed to its worker.
    JobStarted { job: Job },
    /// A handler returned successfully.
    JobCompleted {
        job_id: ObjectId,
        name: String,
        duration_ms: u64,
    },
    /// A handler failed and the job was rescheduled.
    JobRetry {
        job_id: ObjectId,
        name: String,
        reason: String,
        next_run_at: DateTime<Utc>,
        fail_count: u32,
    },
    /// A handler failed with no retries remaining.
    JobFailed {
        job_id: ObjectId,
        name: String,
        reason: String,
        fail_count: u32,
    },
    /// A pending job was cancelled.
    JobCancelled { job_id: ObjectId, name: String },
    /// An expired lease was reclaimed and the job returned to the
    /// runnable set.
    JobRecovered {
        job_id: ObjectId,
        name: String,
        fail_count: u32,
    },
    /// A terminal job was deleted by retention.
    JobDeleted { job_id: ObjectId, status: JobStatus },
    /// Background services started on this instance.
    SchedulerStarted { instance_id: String },
    /// Background services stopped on this instance.
    SchedulerStopped { instance_id: String },
    /// A background loop hit a store error and will retry next tick.
    SchedulerError {
        context: &'static str,
        message: String,
    },
}

impl SchedulerEvent {
    /// Stable event name, useful for logging and metrics fan-out.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::JobEnqueued { .. } => "job:enqueued",
            SchedulerEvent::JobStarted { .. } => "job:started",
            SchedulerEvent::JobCompleted { .. } => "job:completed",
            SchedulerEvent::JobRetry { .. } => "job:retry",
            SchedulerEvent::JobFailed { .. } => "job:failed",
            SchedulerEvent::JobCancelled { .. } => "job:cancelled",
            SchedulerEvent::JobRecovered { .. } => "job:recovered",
            SchedulerEvent::JobDeleted { .. } => "job:deleted",
            SchedulerEvent::SchedulerStarted { .. } => "scheduler:started",
            SchedulerEvent::SchedulerStopped { .. } => "scheduler:stopped",
            SchedulerEvent::SchedulerError { .. } => "scheduler:error",
        }
    }
}

/// Broadcast bus for [`SchedulerEvent`]s.
///
/// Cloning shares the channel; any clone can emit and any clone can mint
/// new subscribers. Multiple schedulers in one process each carry their
/// own bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A bus with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers (fire-and-forget).
    ///
    /// Returns the number of receivers the event reached; zero when no
    /// one is listening, which is not an error.
    pub fn emit(&self, event: SchedulerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
