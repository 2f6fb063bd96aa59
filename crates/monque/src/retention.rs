//! Age-based cleanup of terminal jobs.
//!
//! Disabled unless a [`crate::RetentionPolicy`] is configured. Each sweep
//! deletes a bounded batch of `completed` and `failed` jobs whose last
//! update predates the per-status cutoff; anything the bound leaves
//! behind is picked up next sweep, so a single invocation never turns
//! into a long-running store operation.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetentionPolicy;
use crate::context::SchedulerContext;
use crate::events::SchedulerEvent;
use crate::job::JobStatus;

/// Upper bound on deletions per status per sweep.
const RETENTION_BATCH: usize = 500;

pub(crate) struct RetentionService {
    ctx: Arc<SchedulerContext>,
    policy: RetentionPolicy,
    shutdown: CancellationToken,
}

impl RetentionService {
    pub(crate) fn new(
        ctx: Arc<SchedulerContext>,
        policy: RetentionPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            policy,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        debug!(
            instance_id = %self.ctx.instance_id,
            interval = ?self.policy.interval,
            "retention service started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {}
                _ = self.shutdown.cancelled() => break,
            }

            let cutoffs = [
                (JobStatus::Completed, self.policy.completed),
                (JobStatus::Failed, self.policy.failed),
            ];
            for (status, age) in cutoffs {
                let Some(age) = age else { continue };
                let Ok(age) = chrono::Duration::from_std(age) else {
                    continue;
                };
                let cutoff = Utc::now() - age;

                match self
                    .ctx
                    .repository
                    .delete_terminal_older_than(status, cutoff, RETENTION_BATCH)
                    .await
                {
                    Ok(deleted) => {
                        if !deleted.is_empty() {
                            debug!(status = %status, count = deleted.len(), "retention deleted jobs");
                        }
                        for job_id in deleted {
                            self.ctx
                                .events
                                .emit(SchedulerEvent::JobDeleted { job_id, status });
                        }
                    }
                    Err(err) => {
                        warn!(status = %status, error = %err, "retention sweep failed; retrying next tick");
                        self.ctx.events.emit(SchedulerEvent::SchedulerError {
                            context: "retention",
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        debug!(instance_id = %self.ctx.instance_id, "retention service stopped");
    }
}
