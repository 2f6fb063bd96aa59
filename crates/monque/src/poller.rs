//! The claim loop.
//!
//! One poller task per scheduler instance. Each tick it computes how many
//! slots the instance has free, claims at most that many due jobs, and
//! hands them to the worker pool. A "kick" collapses the next sleep to
//! zero; `enqueue` fires one when a job is due immediately, which keeps
//! enqueue-to-start latency below the poll interval without busy
//! polling.
//!
//! Claim errors are transient by policy: they become `scheduler:error`
//! events and the loop simply runs again next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::context::SchedulerContext;
use crate::events::SchedulerEvent;
use crate::worker::WorkerPool;

pub(crate) struct Poller {
    ctx: Arc<SchedulerContext>,
    pool: Arc<WorkerPool>,
    kick: Arc<Notify>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Poller {
    pub(crate) fn new(
        ctx: Arc<SchedulerContext>,
        pool: Arc<WorkerPool>,
        kick: Arc<Notify>,
        running: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            pool,
            kick,
            running,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let interval = self.ctx.options.poll_interval;
        debug!(instance_id = %self.ctx.instance_id, ?interval, "poller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.kick.notified() => {}
                _ = self.shutdown.cancelled() => break,
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let slots = self.pool.available_slots();
            if slots == 0 {
                continue;
            }

            match self
                .ctx
                .repository
                .claim_batch(&self.ctx.instance_id, slots, Utc::now())
                .await
            {
                Ok(jobs) => {
                    for job in jobs {
                        self.pool.dispatch(job);
                    }
                }
                Err(err) => {
                    error!(error = %err, "claim failed; retrying next poll");
                    self.ctx.events.emit(SchedulerEvent::SchedulerError {
                        context: "poll",
                        message: err.to_string(),
                    });
                }
            }
        }

        debug!(instance_id = %self.ctx.instance_id, "poller stopped");
    }
}
