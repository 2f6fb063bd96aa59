//! Worker registration and the bounded-concurrency execution pool.
//!
//! A *worker* is the async handler registered for a job name; a *job* is
//! the persistent document it runs against. The registry stores handlers
//! type-erased so the scheduler core never sees payload types; decoding
//! happens inside the wrapper the moment a job is dispatched.
//!
//! The pool enforces two limits: a global semaphore sized to
//! `worker_concurrency`, and an optional per-name semaphore for handlers
//! that must not overlap themselves. A claimed job waiting on either
//! limit is already registered in the in-flight table, so the heartbeat
//! service keeps its lease alive while it queues.
//!
//! Execution contract per attempt:
//!
//! 1. `job:started` is emitted before the handler is looked up.
//! 2. A missing handler counts as a retryable failure ("no handler").
//! 3. Success with a `repeat_interval` reschedules at the next cron fire;
//!    success without one completes the job.
//! 4. Failure retries with exponential backoff while attempts remain,
//!    except that a recurring job only retries when the backoff instant
//!    precedes its next cron fire - otherwise the cron fire wins and the
//!    failure is recorded on the rescheduled job.
//! 5. Exactly one terminal event (`job:completed`, `job:retry`,
//!    `job:failed`) follows per attempt. A repository error during the
//!    terminal update is logged and the job is left for lease recovery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::Bson;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::context::SchedulerContext;
use crate::cron::CronSchedule;
use crate::error::Error;
use crate::events::SchedulerEvent;
use crate::job::Job;

type WorkerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type WorkerFn = Arc<dyn Fn(Bson, JobContext) -> WorkerFuture + Send + Sync>;

/// Options for worker registration.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Replace an existing registration instead of failing.
    pub replace: bool,
    /// Cap on concurrently running jobs of this name on this instance.
    pub concurrency: Option<usize>,
}

/// A struct-based worker, for handlers with their own dependencies.
///
/// Closure registration via [`crate::Monque::worker`] covers most cases;
/// implement this when the handler carries clients or pools of its own.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The payload type this worker decodes.
    type Data: DeserializeOwned + Send + 'static;

    /// Execute one attempt. Errors are classified into retry-vs-fail by
    /// the pool; cancellation arrives through `ctx` and is cooperative.
    async fn run(&self, data: Self::Data, ctx: JobContext) -> anyhow::Result<()>;
}

/// Per-attempt context passed to a handler alongside its payload.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(job: Job, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }

    /// The claimed job this attempt runs against.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Whether cancellation was requested (lease stolen or instance
    /// stopping past its deadline). Long handlers should check this at
    /// convenient points and bail out.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested; for `select!`-style
    /// handlers.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

struct Registration {
    run: WorkerFn,
    concurrency: Option<usize>,
}

/// Name-to-handler registry. Append-mostly; registrations are cheap
/// clones, so dispatch reads see a frozen snapshot of each entry.
#[derive(Default)]
pub(crate) struct WorkerRegistry {
    workers: DashMap<String, Registration>,
}

impl WorkerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a typed closure handler.
    pub(crate) fn register<T, F, Fut>(
        &self,
        name: &str,
        options: WorkerOptions,
        handler: F,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let run: WorkerFn = Arc::new(move |data: Bson, ctx: JobContext| {
            match mongodb::bson::from_bson::<T>(data) {
                Ok(decoded) => Box::pin(handler(decoded, ctx)) as WorkerFuture,
                Err(err) => Box::pin(async move {
                    Err(anyhow!("failed to decode job data: {err}"))
                }) as WorkerFuture,
            }
        });
        self.insert(name, run, options)
    }

    /// Register a struct-based [`Worker`].
    pub(crate) fn register_worker<W: Worker>(
        &self,
        name: &str,
        options: WorkerOptions,
        worker: Arc<W>,
    ) -> Result<(), Error> {
        self.register(name, options, move |data: W::Data, ctx| {
            let worker = Arc::clone(&worker);
            async move { worker.run(data, ctx).await }
        })
    }

    fn insert(&self, name: &str, run: WorkerFn, options: WorkerOptions) -> Result<(), Error> {
        use dashmap::mapref::entry::Entry;
        let registration = Registration {
            run,
            concurrency: options.concurrency,
        };
        match self.workers.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(registration);
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                if !options.replace {
                    return Err(Error::WorkerRegistration {
                        job_name: name.to_string(),
                    });
                }
                entry.insert(registration);
                Ok(())
            }
        }
    }

    fn get(&self, name: &str) -> Option<WorkerFn> {
        self.workers.get(name).map(|entry| Arc::clone(&entry.run))
    }

    fn concurrency(&self, name: &str) -> Option<usize> {
        self.workers.get(name).and_then(|entry| entry.concurrency)
    }

    pub(crate) fn is_registered(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }
}

struct InFlight {
    name: String,
    cancel: CancellationToken,
}

/// Bounded-concurrency executor for claimed jobs.
pub(crate) struct WorkerPool {
    ctx: Arc<SchedulerContext>,
    registry: Arc<WorkerRegistry>,
    permits: Arc<Semaphore>,
    per_name: DashMap<String, Arc<Semaphore>>,
    in_flight: DashMap<ObjectId, InFlight>,
    drained: Notify,
    jobs_root: CancellationToken,
}

impl WorkerPool {
    pub(crate) fn new(ctx: Arc<SchedulerContext>, registry: Arc<WorkerRegistry>) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.options.worker_concurrency));
        Self {
            ctx,
            registry,
            permits,
            per_name: DashMap::new(),
            in_flight: DashMap::new(),
            drained: Notify::new(),
            jobs_root: CancellationToken::new(),
        }
    }

    /// How many more jobs this instance should claim right now.
    pub(crate) fn available_slots(&self) -> usize {
        self.ctx
            .options
            .instance_slots()
            .saturating_sub(self.in_flight.len())
    }

    /// Ids of every claimed job this instance currently holds, queued or
    /// executing. All of them need their leases extended.
    pub(crate) fn in_flight_ids(&self) -> Vec<ObjectId> {
        self.in_flight.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Request cooperative cancellation of a single job (lease stolen).
    pub(crate) fn cancel_job(&self, id: &ObjectId) {
        if let Some(entry) = self.in_flight.get(id) {
            warn!(job_id = %id, name = %entry.name, "cancelling job whose lease was lost");
            entry.cancel.cancel();
        }
    }

    /// Request cooperative cancellation of everything still in flight.
    pub(crate) fn cancel_all(&self) {
        self.jobs_root.cancel();
    }

    /// Take ownership of a claimed job and run it on its own task.
    pub(crate) fn dispatch(self: &Arc<Self>, job: Job) {
        let cancel = self.jobs_root.child_token();
        self.in_flight.insert(
            job.id,
            InFlight {
                name: job.name.clone(),
                cancel: cancel.clone(),
            },
        );

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.id;
            let global = pool.permits.clone().acquire_owned().await;
            if global.is_err() {
                // Semaphore closed: the pool is being torn down.
                pool.finish(&job_id);
                return;
            }
            let _global = global;
            let _per_name = match pool.name_semaphore(&job.name) {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            pool.execute(job, cancel).await;
            pool.finish(&job_id);
        });
    }

    /// Wait for all in-flight jobs to finish, up to `timeout`.
    ///
    /// On deadline, fails with [`Error::ShutdownTimeout`] listing the
    /// stragglers; their leases expire and another instance recovers
    /// them.
    pub(crate) async fn drain(&self, timeout: std::time::Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.is_empty() {
                return Ok(());
            }
            let notified = self.drained.notified();
            if self.in_flight.is_empty() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::ShutdownTimeout {
                    incomplete: self.in_flight_ids(),
                });
            }
        }
    }

    fn finish(&self, id: &ObjectId) {
        self.in_flight.remove(id);
        if self.in_flight.is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn name_semaphore(&self, name: &str) -> Option<Arc<Semaphore>> {
        let limit = self.registry.concurrency(name)?;
        Some(
            self.per_name
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))))
                .clone(),
        )
    }

    async fn execute(&self, job: Job, cancel: CancellationToken) {
        let started = Instant::now();
        self.ctx
            .events
            .emit(SchedulerEvent::JobStarted { job: job.clone() });
        debug!(job_id = %job.id, name = %job.name, attempt = job.fail_count + 1, "job started");

        let result = match self.registry.get(&job.name) {
            Some(run) => {
                let context = JobContext::new(job.clone(), cancel);
                run(job.data.clone(), context).await
            }
            None => Err(anyhow!("no handler")),
        };

        let now = Utc::now();
        let reason = result.as_ref().err().map(|err| format!("{err:#}"));
        let plan = plan_completion(
            &job,
            reason.is_some(),
            &self.ctx.backoff(),
            self.ctx.options.max_retries,
            now,
        );
        self.apply(&job, plan, reason, started, now).await;
    }

    async fn apply(
        &self,
        job: &Job,
        plan: CompletionPlan,
        reason: Option<String>,
        started: Instant,
        now: DateTime<Utc>,
    ) {
        let repository = &self.ctx.repository;
        let instance_id = &self.ctx.instance_id;
        let reason = reason.unwrap_or_else(|| "unknown error".to_string());

        let outcome = match plan {
            CompletionPlan::Success => repository
                .complete_success(job.id, instance_id, now)
                .await
                .map(|updated| {
                    updated.map(|_| SchedulerEvent::JobCompleted {
                        job_id: job.id,
                        name: job.name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                }),
            CompletionPlan::Recurring { next_run_at } => repository
                .complete_recurring(job.id, instance_id, next_run_at, None, now)
                .await
                .map(|updated| {
                    updated.map(|_| SchedulerEvent::JobCompleted {
                        job_id: job.id,
                        name: job.name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                }),
            CompletionPlan::Retry { next_run_at } => repository
                .complete_retry(job.id, instance_id, next_run_at, &reason, now)
                .await
                .map(|updated| {
                    updated.map(|_| SchedulerEvent::JobRetry {
                        job_id: job.id,
                        name: job.name.clone(),
                        reason: reason.clone(),
                        next_run_at,
                        fail_count: job.fail_count + 1,
                    })
                }),
            CompletionPlan::RescheduleFailed { next_run_at } => repository
                .complete_recurring(job.id, instance_id, next_run_at, Some(&reason), now)
                .await
                .map(|updated| {
                    updated.map(|_| SchedulerEvent::JobRetry {
                        job_id: job.id,
                        name: job.name.clone(),
                        reason: reason.clone(),
                        next_run_at,
                        fail_count: job.fail_count + 1,
                    })
                }),
            CompletionPlan::Fail => repository
                .complete_fail(job.id, instance_id, &reason, now)
                .await
                .map(|updated| {
                    updated.map(|_| SchedulerEvent::JobFailed {
                        job_id: job.id,
                        name: job.name.clone(),
                        reason: reason.clone(),
                        fail_count: job.fail_count + 1,
                    })
                }),
        };

        match outcome {
            Ok(Some(event)) => {
                debug!(job_id = %job.id, name = %job.name, kind = event.kind(), "job finished");
                self.ctx.events.emit(event);
            }
            Ok(None) => {
                // Lease lost before the terminal update; the new owner's
                // outcome stands.
                warn!(job_id = %job.id, name = %job.name, "lease lost before completion; outcome dropped");
            }
            Err(err) => {
                error!(job_id = %job.id, name = %job.name, error = %err, "terminal update failed; leaving job for recovery");
                self.ctx.events.emit(SchedulerEvent::SchedulerError {
                    context: "complete",
                    message: err.to_string(),
                });
            }
        }
    }
}

/// What to do with a job after its attempt finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionPlan {
    /// Non-recurring success.
    Success,
    /// Recurring success: back to pending at the next cron fire.
    Recurring { next_run_at: DateTime<Utc> },
    /// Failure with retries remaining: back to pending after backoff.
    Retry { next_run_at: DateTime<Utc> },
    /// Recurring failure whose next cron fire precedes the backoff
    /// retry: the fire wins and the failure is recorded on the
    /// rescheduled job.
    RescheduleFailed { next_run_at: DateTime<Utc> },
    /// Failure with no retries remaining.
    Fail,
}

/// Decide the completion path for an attempt. Pure; all clock input is
/// `now`.
pub(crate) fn plan_completion(
    job: &Job,
    failed: bool,
    backoff: &Backoff,
    max_retries: u32,
    now: DateTime<Utc>,
) -> CompletionPlan {
    let cron_next = job.repeat_interval.as_deref().and_then(|expression| {
        match CronSchedule::parse(expression) {
            Ok(schedule) => schedule.next_after(now),
            Err(_) => {
                warn!(job_id = %job.id, expression, "stored cron expression no longer parses; treating job as one-shot");
                None
            }
        }
    });

    if !failed {
        return match cron_next {
            Some(next_run_at) => CompletionPlan::Recurring { next_run_at },
            None => CompletionPlan::Success,
        };
    }

    if job.fail_count.saturating_add(1) < max_retries {
        let (_, retry_at) = backoff.next_run_at(job.fail_count, now);
        match cron_next {
            // The retry only happens if it beats the next scheduled fire.
            Some(fire_at) if fire_at <= retry_at => {
                CompletionPlan::RescheduleFailed { next_run_at: fire_at }
            }
            _ => CompletionPlan::Retry { next_run_at: retry_at },
        }
    } else {
        CompletionPlan::Fail
    }
}
