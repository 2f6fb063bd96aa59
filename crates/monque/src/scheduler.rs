//! The public scheduler facade.
//!
//! [`Monque`] is a scoped resource: construction does no I/O,
//! [`Monque::initialize`] creates indexes, [`Monque::start`] launches the
//! background tasks, and [`Monque::stop`] releases them on every exit
//! path, including the timeout branch. Multiple schedulers may coexist in
//! one process, pointing at the same collection or different ones; all
//! cross-instance coordination goes through the documents themselves.
//!
//! ```ignore
//! use monque::{EnqueueOptions, Monque, MonqueOptions};
//!
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//! let monque = Monque::new(client.database("app"), MonqueOptions::default());
//!
//! monque.worker("send-email", |email: Email, ctx| async move {
//!     mailer.send(&email).await?;
//!     Ok(())
//! })?;
//!
//! monque.initialize().await?;
//! monque.start();
//!
//! monque.enqueue("send-email", email, EnqueueOptions::default()).await?;
//! monque.schedule("0 2 * * *", "nightly-report", params, Default::default()).await?;
//!
//! monque.stop(None).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::oid::ObjectId;
use mongodb::Database;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MonqueOptions;
use crate::context::SchedulerContext;
use crate::cron::CronSchedule;
use crate::error::{Error, Result};
use crate::events::SchedulerEvent;
use crate::heartbeat::HeartbeatService;
use crate::job::Job;
use crate::poller::Poller;
use crate::query::{JobFilter, JobPage, Page};
use crate::recovery::RecoveryService;
use crate::repository::{JobRepository, NewJob, QueueStats};
use crate::retention::RetentionService;
use crate::scheduler::private::IntoBson;
use crate::worker::{JobContext, Worker, WorkerOptions, WorkerPool, WorkerRegistry};

/// Options for [`Monque::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Defer the first run by this much instead of running immediately.
    pub delay: Option<Duration>,
    /// Idempotency key: at most one non-terminal job per
    /// `(name, unique_key)`.
    pub unique_key: Option<String>,
}

/// Options for [`Monque::schedule`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Idempotency key for the series. Defaults to a deterministic
    /// fingerprint of `(name, cron)`, so re-registering the same schedule
    /// on every boot never duplicates it.
    pub unique_key: Option<String>,
}

/// A distributed job scheduler backed by a MongoDB collection.
pub struct Monque {
    ctx: Arc<SchedulerContext>,
    registry: Arc<WorkerRegistry>,
    pool: Arc<WorkerPool>,
    kick: Arc<Notify>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Monque {
    /// Bind a scheduler to a database. No I/O happens until
    /// [`Monque::initialize`] or the first operation.
    pub fn new(database: Database, options: MonqueOptions) -> Self {
        let repository = JobRepository::new(&database, &options.collection_name);
        let ctx = Arc::new(SchedulerContext::new(repository, options));
        let registry = Arc::new(WorkerRegistry::new());
        let pool = Arc::new(WorkerPool::new(Arc::clone(&ctx), Arc::clone(&registry)));
        Self {
            ctx,
            registry,
            pool,
            kick: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This instance's id, as written into `claimedBy` on claimed jobs.
    pub fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    /// Create the collection indexes. Idempotent; call once at boot.
    pub async fn initialize(&self) -> Result<()> {
        self.ctx.repository.ensure_indexes().await
    }

    /// Subscribe to lifecycle events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.ctx.events.subscribe()
    }

    /// Enqueue a one-shot job.
    ///
    /// Runs as soon as a worker is free, or after `options.delay`. With a
    /// `unique_key`, re-enqueuing while a previous job is still
    /// non-terminal returns that job instead of inserting.
    pub async fn enqueue<T: Serialize>(
        &self,
        name: impl Into<String>,
        data: T,
        options: EnqueueOptions,
    ) -> Result<Job> {
        let name = name.into();
        let now = Utc::now();
        let next_run_at = match options.delay {
            Some(delay) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
            None => now,
        };

        let inserted = self
            .ctx
            .repository
            .insert(
                NewJob {
                    name,
                    data: data.into_bson()?,
                    next_run_at,
                    repeat_interval: None,
                    unique_key: options.unique_key,
                },
                now,
            )
            .await?;

        if inserted.is_created() {
            let job = inserted.job().clone();
            self.ctx.events.emit(SchedulerEvent::JobEnqueued { job });
            if next_run_at <= now && self.running.load(Ordering::Acquire) {
                self.kick.notify_one();
            }
        }
        Ok(inserted.into_job())
    }

    /// Register a recurring job on a five-field cron expression.
    ///
    /// Validates the expression (failing with [`Error::InvalidCron`]) and
    /// stores the series with `next_run_at` at the next fire. Unless
    /// overridden, the idempotency key is derived from `(name, cron)`, so
    /// calling this at every boot keeps exactly one series.
    pub async fn schedule<T: Serialize>(
        &self,
        cron: &str,
        name: impl Into<String>,
        data: T,
        options: ScheduleOptions,
    ) -> Result<Job> {
        let name = name.into();
        let schedule = CronSchedule::parse(cron)?;
        let now = Utc::now();
        let next_run_at = schedule.next_after(now).ok_or_else(|| Error::InvalidCron {
            expression: cron.to_string(),
        })?;
        let unique_key = options
            .unique_key
            .unwrap_or_else(|| cron_unique_key(&name, schedule.expression()));

        let inserted = self
            .ctx
            .repository
            .insert(
                NewJob {
                    name,
                    data: data.into_bson()?,
                    next_run_at,
                    repeat_interval: Some(schedule.expression().to_string()),
                    unique_key: Some(unique_key),
                },
                now,
            )
            .await?;

        if inserted.is_created() {
            let job = inserted.job().clone();
            self.ctx.events.emit(SchedulerEvent::JobEnqueued { job });
        }
        Ok(inserted.into_job())
    }

    /// Register an async closure as the worker for `name`.
    ///
    /// Fails with [`Error::WorkerRegistration`] when a worker already
    /// exists for the name; use [`Monque::worker_with_options`] with
    /// `replace` to swap one out. Registration is in-memory and per
    /// instance.
    pub fn worker<T, F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register(name, WorkerOptions::default(), handler)
    }

    /// [`Monque::worker`] with explicit options (replace, per-name
    /// concurrency).
    pub fn worker_with_options<T, F, Fut>(
        &self,
        name: &str,
        options: WorkerOptions,
        handler: F,
    ) -> Result<()>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register(name, options, handler)
    }

    /// Register a struct-based [`Worker`].
    pub fn register_worker<W: Worker>(
        &self,
        name: &str,
        options: WorkerOptions,
        worker: Arc<W>,
    ) -> Result<()> {
        self.registry.register_worker(name, options, worker)
    }

    /// Whether a worker is registered for `name` on this instance.
    pub fn has_worker(&self, name: &str) -> bool {
        self.registry.is_registered(name)
    }

    /// Cancel a pending job.
    ///
    /// Fails with [`Error::NotFound`] when no such job exists. A job that
    /// is already processing is returned unchanged: in-flight work cannot
    /// be revoked, only superseded at its next transition.
    pub async fn cancel(&self, id: ObjectId) -> Result<Job> {
        match self.ctx.repository.cancel(id, Utc::now()).await? {
            Some(job) => {
                self.ctx.events.emit(SchedulerEvent::JobCancelled {
                    job_id: job.id,
                    name: job.name.clone(),
                });
                Ok(job)
            }
            None => match self.ctx.repository.find_by_id(id).await? {
                Some(job) => Ok(job),
                None => Err(Error::NotFound { id }),
            },
        }
    }

    /// Fetch a job by id, failing with [`Error::NotFound`] when absent.
    pub async fn get_job(&self, id: ObjectId) -> Result<Job> {
        self.ctx
            .repository
            .find_by_id(id)
            .await?
            .ok_or(Error::NotFound { id })
    }

    /// Query jobs with keyset pagination.
    pub async fn get_jobs(&self, filter: &JobFilter, page: &Page) -> Result<JobPage> {
        self.ctx.repository.query(filter, page).await
    }

    /// Per-status counts over the whole collection.
    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        self.ctx.repository.stats().await
    }

    /// Launch the poller, heartbeat, recovery, and retention tasks.
    ///
    /// Idempotent while running. A stopped scheduler stays stopped;
    /// construct a fresh one instead of restarting.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = lock_tasks(&self.tasks);
        tasks.push(tokio::spawn(
            Poller::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.pool),
                Arc::clone(&self.kick),
                Arc::clone(&self.running),
                self.shutdown.clone(),
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            HeartbeatService::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.pool),
                self.shutdown.clone(),
            )
            .run(),
        ));
        if self.ctx.options.recover_stale_jobs {
            tasks.push(tokio::spawn(
                RecoveryService::new(Arc::clone(&self.ctx), self.shutdown.clone()).run(),
            ));
        }
        if let Some(policy) = self.ctx.options.job_retention.clone() {
            tasks.push(tokio::spawn(
                RetentionService::new(Arc::clone(&self.ctx), policy, self.shutdown.clone()).run(),
            ));
        }
        drop(tasks);

        info!(instance_id = %self.ctx.instance_id, "scheduler started");
        self.ctx.events.emit(SchedulerEvent::SchedulerStarted {
            instance_id: self.ctx.instance_id.clone(),
        });
    }

    /// Gracefully stop: quit claiming, drain in-flight work, release
    /// every background task.
    ///
    /// Waits up to `timeout` (default `shutdown_timeout`) for in-flight
    /// jobs, then fails with [`Error::ShutdownTimeout`] listing the
    /// stragglers; their leases expire after `lock_timeout` and any
    /// instance's recovery service reclaims them. All tasks are released
    /// on both branches.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // Wake the poller so it observes the stop immediately.
        self.kick.notify_one();

        let deadline = timeout.unwrap_or(self.ctx.options.shutdown_timeout);
        let drained = self.pool.drain(deadline).await;
        if drained.is_err() {
            warn!(
                instance_id = %self.ctx.instance_id,
                in_flight = self.pool.in_flight_count(),
                "shutdown deadline elapsed; cancelling remaining workers"
            );
            self.pool.cancel_all();
        }

        self.shutdown.cancel();
        for task in lock_tasks(&self.tasks).drain(..) {
            task.abort();
        }

        info!(instance_id = %self.ctx.instance_id, "scheduler stopped");
        self.ctx.events.emit(SchedulerEvent::SchedulerStopped {
            instance_id: self.ctx.instance_id.clone(),
        });
        drained
    }
}

impl Drop for Monque {
    fn drop(&mut self) {
        // Tasks hold clones of the context; make sure they exit even when
        // the caller never reached stop().
        self.shutdown.cancel();
        for task in lock_tasks(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Monque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monque")
            .field("instance_id", &self.ctx.instance_id)
            .field("running", &self.running.load(Ordering::Acquire))
            .field("in_flight", &self.pool.in_flight_count())
            .finish()
    }
}

fn lock_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    match tasks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Deterministic idempotency key for a cron series.
fn cron_unique_key(name: &str, cron: &str) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(format!("{name}\n{cron}").as_bytes());
    let mut key = String::with_capacity(37);
    key.push_str("cron:");
    for byte in &digest[..16] {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

mod private {
    use crate::error::Error;
    use mongodb::bson::Bson;
    use serde::Serialize;

    /// Payload-to-BSON conversion at the API edge. Serialization failures
    /// are surfaced as store errors; they never reach the collection.
    pub(crate) trait IntoBson {
        fn into_bson(self) -> Result<Bson, Error>;
    }

    impl<T: Serialize> IntoBson for T {
        fn into_bson(self) -> Result<Bson, Error> {
            mongodb::bson::to_bson(&self)
                .map_err(|err| Error::Connection(mongodb::error::Error::custom(err)))
        }
    }
}
