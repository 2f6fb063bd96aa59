//! Stale-lease recovery.
//!
//! Runs every `lock_timeout`. Any job still `processing` with a lease
//! older than the timeout belongs to an instance that crashed, lost its
//! store connection, or stalled past its heartbeat. Recovery returns such
//! jobs to `pending` with a failed attempt credited ("lease expired"), so
//! a handler that kills its host every time ends up `failed` instead of
//! looping forever.
//!
//! Detection deliberately biases toward false positives: recovering a job
//! whose worker is actually still alive is safe, because that worker's
//! terminal compare-and-set no longer matches and its outcome is dropped.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::SchedulerContext;
use crate::events::SchedulerEvent;
use crate::job::JobStatus;

/// Upper bound on recoveries per sweep, to keep a single tick from
/// monopolizing the store.
const RECOVERY_BATCH: usize = 100;

pub(crate) struct RecoveryService {
    ctx: Arc<SchedulerContext>,
    shutdown: CancellationToken,
}

impl RecoveryService {
    pub(crate) fn new(ctx: Arc<SchedulerContext>, shutdown: CancellationToken) -> Self {
        Self { ctx, shutdown }
    }

    pub(crate) async fn run(self) {
        let interval = self.ctx.options.lock_timeout;
        debug!(instance_id = %self.ctx.instance_id, ?interval, "recovery service started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.cancelled() => break,
            }

            let result = self
                .ctx
                .repository
                .recover_stale(
                    Utc::now(),
                    self.ctx.options.lock_timeout,
                    self.ctx.options.max_retries,
                    RECOVERY_BATCH,
                )
                .await;

            match result {
                Ok(recovered) => {
                    for job in recovered {
                        info!(
                            job_id = %job.id,
                            name = %job.name,
                            fail_count = job.fail_count,
                            status = %job.status,
                            "recovered job with expired lease"
                        );
                        let event = if job.status == JobStatus::Failed {
                            SchedulerEvent::JobFailed {
                                job_id: job.id,
                                name: job.name,
                                reason: "lease expired".to_string(),
                                fail_count: job.fail_count,
                            }
                        } else {
                            SchedulerEvent::JobRecovered {
                                job_id: job.id,
                                name: job.name,
                                fail_count: job.fail_count,
                            }
                        };
                        self.ctx.events.emit(event);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "recovery sweep failed; retrying next tick");
                    self.ctx.events.emit(SchedulerEvent::SchedulerError {
                        context: "recovery",
                        message: err.to_string(),
                    });
                }
            }
        }

        debug!(instance_id = %self.ctx.instance_id, "recovery service stopped");
    }
}
