//! # Monque
//!
//! A distributed job scheduler and worker runtime backed by a MongoDB
//! collection as the single source of truth.
//!
//! Any number of scheduler instances may run against the same collection.
//! Each instance polls for due jobs, atomically claims them under a
//! time-bounded lease, executes the worker registered for the job's name,
//! and records the outcome. One-shot jobs, delayed jobs, recurring (cron)
//! jobs, idempotency keys, bounded retries with exponential backoff,
//! stale-lease recovery, and age-based retention cleanup are all built
//! in.
//!
//! ## Architecture
//!
//! ```text
//! Monque (facade)
//!     │ enqueue / schedule / cancel / query
//!     ▼
//! JobRepository ◄─────────────── the only component touching the store
//!     ▲      ▲        ▲     ▲
//!     │      │        │     │
//!  Poller  WorkerPool │  Retention
//!     │      ▲        │
//!     │      │     Recovery
//!     │  Heartbeat
//!     │
//!     └─► claim batch ─► dispatch ─► handler ─► complete/retry/fail
//! ```
//!
//! The poller claims due jobs and hands them to the worker pool; the
//! heartbeat service extends their leases while they run; the recovery
//! service returns expired leases to the runnable set; the retention
//! service deletes old terminal jobs. Every transition is published on an
//! in-process [`EventBus`].
//!
//! ## Guarantees
//!
//! - **At-least-once execution**: a claim linearizes ownership, so each
//!   attempt runs on exactly one instance, but crashes can re-run an
//!   attempt. Use idempotency keys (and idempotent handlers) where that
//!   matters.
//! - **At most one live job per `(name, unique_key)`**, enforced by a
//!   partial unique index.
//! - **No cross-instance state** beyond the collection: there is no lock
//!   server and no membership protocol. An instance that dies simply
//!   stops heartbeating and its leases expire.
//! - **Events are in-memory observability**, never coordination. Slow
//!   subscribers may miss events; the documents are the record.
//!
//! ## Example
//!
//! ```ignore
//! use monque::{EnqueueOptions, Monque, MonqueOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Email { to: String }
//!
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//! let monque = Monque::new(client.database("app"), MonqueOptions::default());
//!
//! monque.worker("send-email", |email: Email, _ctx| async move {
//!     println!("sending to {}", email.to);
//!     Ok(())
//! })?;
//!
//! monque.initialize().await?;
//! monque.start();
//! monque.enqueue("send-email", Email { to: "a@b.c".into() }, EnqueueOptions::default()).await?;
//! ```

mod backoff;
mod config;
mod context;
mod cron;
mod cursor;
mod error;
mod events;
mod heartbeat;
mod job;
mod poller;
mod query;
mod recovery;
mod repository;
mod retention;
mod scheduler;
mod worker;

// Re-export the public surface.
pub use backoff::{Backoff, DEFAULT_BASE, DEFAULT_MAX_DELAY};
pub use config::{MonqueOptions, RetentionPolicy, DEFAULT_COLLECTION};
pub use cron::CronSchedule;
pub use cursor::{Cursor, Direction};
pub use error::{Error, Result};
pub use events::{EventBus, SchedulerEvent};
pub use job::{Job, JobStatus};
pub use query::{JobFilter, JobPage, Page, StatusSelector, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use repository::{EnqueueResult, JobRepository, NewJob, QueueStats};
pub use scheduler::{EnqueueOptions, Monque, ScheduleOptions};
pub use worker::{JobContext, Worker, WorkerOptions};

// Re-export commonly used external types.
pub use async_trait::async_trait;
pub use mongodb::bson::oid::ObjectId;
pub use mongodb::bson::Bson;
