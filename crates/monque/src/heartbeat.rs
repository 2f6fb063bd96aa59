//! Lease extension for in-flight jobs.
//!
//! Every `heartbeat_interval` (default a third of the lease) the service
//! pushes `lockedAt` forward for every job this instance holds. A
//! heartbeat that matches zero documents for an id means the lease was
//! stolen - the job is no longer `processing`, or recovery handed it to
//! another instance - and the corresponding worker is cancelled so it
//! stops burning work whose outcome will be dropped anyway.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::SchedulerContext;
use crate::events::SchedulerEvent;
use crate::worker::WorkerPool;

pub(crate) struct HeartbeatService {
    ctx: Arc<SchedulerContext>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
}

impl HeartbeatService {
    pub(crate) fn new(
        ctx: Arc<SchedulerContext>,
        pool: Arc<WorkerPool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            pool,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let interval = self.ctx.options.effective_heartbeat_interval();
        debug!(instance_id = %self.ctx.instance_id, ?interval, "heartbeat service started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.cancelled() => break,
            }

            let ids = self.pool.in_flight_ids();
            if ids.is_empty() {
                continue;
            }

            match self
                .ctx
                .repository
                .heartbeat(&self.ctx.instance_id, &ids, Utc::now())
                .await
            {
                Ok(lost) => {
                    for id in lost {
                        warn!(job_id = %id, "lease no longer ours; cancelling worker");
                        self.pool.cancel_job(&id);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "heartbeat failed; retrying next tick");
                    self.ctx.events.emit(SchedulerEvent::SchedulerError {
                        context: "heartbeat",
                        message: err.to_string(),
                    });
                }
            }
        }

        debug!(instance_id = %self.ctx.instance_id, "heartbeat service stopped");
    }
}
