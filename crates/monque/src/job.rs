//! The job data model.
//!
//! A [`Job`] is the sole persistent entity of the scheduler. Every instance
//! of the fleet reads and writes the same collection of job documents; all
//! coordination happens through single-document atomic updates on them.
//!
//! Two representations exist:
//!
//! - [`Job`] - the public view, with `chrono` timestamps and an owned
//!   payload. Everything outside the repository works with this type.
//! - [`JobDocument`] - the persisted layout (camelCase field names, BSON
//!   datetimes). Only the repository constructs or reads these.
//!
//! # Lifecycle
//!
//! ```text
//! pending ──claim──► processing ──success──► completed
//!    ▲                   │ │
//!    │    retry/recur/   │ └──retries exhausted──► failed
//!    └────recovered──────┘
//! pending ──cancel──► cancelled
//! ```
//!
//! A job is `processing` if and only if `locked_at` and `claimed_by` are
//! both set. Cancellation of an in-flight job is not a valid transition;
//! it takes effect at the job's next transition instead.

use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, DateTime as BsonDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Execution state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its `next_run_at` to pass, or for a free worker slot.
    Pending,
    /// Claimed by an instance under a time-bounded lease.
    Processing,
    /// Finished successfully (non-recurring jobs only).
    Completed,
    /// Failed with no retries remaining.
    Failed,
    /// Explicitly cancelled while still pending.
    Cancelled,
}

impl JobStatus {
    /// The wire representation used in queries and filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal jobs never run again and are eligible for retention
    /// cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The statuses a live (claimable or claimed) job can be in.
    pub const NON_TERMINAL: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled unit of work.
///
/// The payload is opaque to the scheduler; [`Job::data_as`] decodes it at
/// the edge where the concrete type is known.
#[derive(Debug, Clone)]
pub struct Job {
    /// Store-assigned unique identifier. Tiebreaker for polling order and
    /// the cursor key for pagination.
    pub id: ObjectId,
    /// Logical handler key; workers register under this name.
    pub name: String,
    /// Opaque caller-supplied payload.
    pub data: Bson,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Earliest instant this job is eligible to run.
    pub next_run_at: DateTime<Utc>,
    /// Number of prior failed attempts. Monotone across retries; resets
    /// only when a recurring job completes successfully.
    pub fail_count: u32,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent repository write.
    pub updated_at: DateTime<Utc>,
    /// Cron expression; presence marks the job recurring.
    pub repeat_interval: Option<String>,
    /// Idempotency key, scoped to `name` across non-terminal jobs.
    pub unique_key: Option<String>,
    /// When the current lease began. Set exactly when `processing`.
    pub locked_at: Option<DateTime<Utc>>,
    /// Instance id of the current leaseholder. Set exactly when
    /// `processing`.
    pub claimed_by: Option<String>,
    /// Short description of the most recent failure.
    pub fail_reason: Option<String>,
}

impl Job {
    /// Whether this job re-enters `pending` after each completion.
    pub fn is_recurring(&self) -> bool {
        self.repeat_interval.is_some()
    }

    /// Decode the opaque payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, mongodb::bson::de::Error> {
        mongodb::bson::from_bson(self.data.clone())
    }
}

/// Persisted layout of a job, as stored in the collection.
///
/// Field names follow the collection's camelCase convention so that the
/// documents stay queryable by name from any driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub data: Bson,
    pub status: JobStatus,
    pub next_run_at: BsonDateTime,
    pub fail_count: i32,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<BsonDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

impl JobDocument {
    /// Map the persisted layout to the public view.
    pub(crate) fn into_job(self) -> Job {
        Job {
            id: self.id,
            name: self.name,
            data: self.data,
            status: self.status,
            next_run_at: self.next_run_at.to_chrono(),
            fail_count: self.fail_count.max(0) as u32,
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
            repeat_interval: self.repeat_interval,
            unique_key: self.unique_key,
            locked_at: self.locked_at.map(|at| at.to_chrono()),
            claimed_by: self.claimed_by,
            fail_reason: self.fail_reason,
        }
    }
}
