//! Structured error types for monque.
//!
//! `Error` is the closed set of failure modes that cross the public API
//! boundary. Handler code keeps using `anyhow::Error` internally; the
//! scheduler captures those, classifies them into retry-vs-fail, and never
//! re-exports them as typed errors.
//!
//! # Propagation policy
//!
//! - Public API calls (`enqueue`, `schedule`, `cancel`, `get_jobs`, ...)
//!   surface errors to the caller unchanged.
//! - Background loops (poller, heartbeat, recovery, retention) log failures
//!   as `scheduler:error` events and retry on their next tick. They never
//!   terminate on a transient store error.
//! - Errors during a terminal job update are left to the recovery service:
//!   the lease expires and another instance picks the job up.

use mongodb::bson::oid::ObjectId;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Structured error type for scheduler operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A cron expression failed five-field validation or parsing.
    #[error("invalid cron expression: {expression:?}")]
    InvalidCron {
        /// The offending expression, verbatim.
        expression: String,
    },

    /// A pagination cursor could not be decoded.
    #[error("invalid cursor: {reason}")]
    InvalidCursor {
        /// What the decoder objected to.
        reason: String,
    },

    /// A worker is already registered for this job name and `replace` was
    /// not requested.
    #[error("a worker is already registered for job {job_name:?}")]
    WorkerRegistration {
        /// The contested job name.
        job_name: String,
    },

    /// Graceful stop exceeded its deadline with work still in flight.
    ///
    /// The listed jobs keep their leases until `lock_timeout` elapses, at
    /// which point any instance's recovery service reclaims them.
    #[error("shutdown timed out with {} jobs still in flight", incomplete.len())]
    ShutdownTimeout {
        /// Ids of the jobs that had not finished at the deadline.
        incomplete: Vec<ObjectId>,
    },

    /// Underlying store failure surfaced to a caller that cannot recover
    /// locally.
    #[error("store operation failed: {0}")]
    Connection(#[from] mongodb::error::Error),

    /// A targeted mutation addressed a job that does not exist.
    #[error("job {id} not found")]
    NotFound {
        /// The missing job id.
        id: ObjectId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_cron_display() {
        let err = Error::InvalidCron {
            expression: "* * *".to_string(),
        };
        assert!(err.to_string().contains("invalid cron"));
        assert!(err.to_string().contains("* * *"));
    }

    #[test]
    fn test_shutdown_timeout_counts_jobs() {
        let err = Error::ShutdownTimeout {
            incomplete: vec![ObjectId::new(), ObjectId::new()],
        };
        assert!(err.to_string().contains("2 jobs"));
    }

    #[test]
    fn test_not_found_mentions_id() {
        let id = ObjectId::new();
        let err = Error::NotFound { id };
        assert!(err.to_string().contains(&id.to_hex()));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = Error::WorkerRegistration {
            job_name: "send-email".to_string(),
        };
        match &err {
            Error::WorkerRegistration { job_name } => assert_eq!(job_name, "send-email"),
            _ => panic!("expected WorkerRegistration"),
        }
    }
}
