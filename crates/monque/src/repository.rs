//! All reads and writes over the jobs collection.
//!
//! The repository is the only component that touches the store. Every
//! cross-instance coordination step is a conditioned single-document
//! update: the filter re-states the precondition (status, leaseholder,
//! staleness) so that two racing instances produce exactly one winner.
//! Batch operations iterate such single-document updates rather than
//! issuing multi-document writes, which keeps each step atomic and keeps
//! the per-invocation work bounded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use tracing::debug;

use crate::cursor::{Cursor, Direction};
use crate::error::{Error, Result};
use crate::job::{Job, JobDocument, JobStatus};
use crate::query::{JobFilter, JobPage, Page};

/// Outcome of an idempotent insert.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// A new job document was inserted.
    Created(Job),
    /// A non-terminal job with the same `(name, unique_key)` already
    /// existed; no new document was written.
    Duplicate(Job),
}

impl EnqueueResult {
    /// The job, regardless of whether it was created or already present.
    pub fn into_job(self) -> Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }

    /// Whether a new document was written.
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }
}

/// Fields of a job about to be inserted. The repository fills in the
/// id, status, counters, and timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub data: Bson,
    pub next_run_at: DateTime<Utc>,
    pub repeat_interval: Option<String>,
    pub unique_key: Option<String>,
}

/// Per-status counts over the whole collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

/// Typed access to the jobs collection.
#[derive(Clone)]
pub struct JobRepository {
    collection: Collection<JobDocument>,
}

impl JobRepository {
    /// Bind to a collection. No I/O happens here.
    pub fn new(database: &Database, collection_name: &str) -> Self {
        Self {
            collection: database.collection(collection_name),
        }
    }

    /// Create the indexes the claim, idempotency, retention, and recovery
    /// paths rely on. Safe to call repeatedly.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let non_terminal: Vec<&str> = JobStatus::NON_TERMINAL
            .iter()
            .map(JobStatus::as_str)
            .collect();
        let indexes = vec![
            // Polling: due pending jobs in (nextRunAt, _id) order.
            IndexModel::builder()
                .keys(doc! { "status": 1, "nextRunAt": 1 })
                .options(
                    IndexOptions::builder()
                        .name("status_next_run_at".to_string())
                        .build(),
                )
                .build(),
            // Idempotency: at most one live job per (name, uniqueKey).
            IndexModel::builder()
                .keys(doc! { "name": 1, "uniqueKey": 1 })
                .options(
                    IndexOptions::builder()
                        .name("name_unique_key".to_string())
                        .unique(true)
                        .partial_filter_expression(doc! {
                            "uniqueKey": { "$exists": true },
                            "status": { "$in": non_terminal },
                        })
                        .build(),
                )
                .build(),
            // Retention: terminal jobs by age.
            IndexModel::builder()
                .keys(doc! { "status": 1, "updatedAt": 1 })
                .options(
                    IndexOptions::builder()
                        .name("status_updated_at".to_string())
                        .build(),
                )
                .build(),
            // Recovery: leases by holder and age.
            IndexModel::builder()
                .keys(doc! { "claimedBy": 1, "lockedAt": 1 })
                .options(
                    IndexOptions::builder()
                        .name("claimed_by_locked_at".to_string())
                        .build(),
                )
                .build(),
        ];
        self.collection.create_indexes(indexes).await?;
        Ok(())
    }

    /// Insert a new pending job.
    ///
    /// When `unique_key` is set and a non-terminal job already holds the
    /// same `(name, unique_key)`, the existing job is returned instead.
    /// The duplicate check races against concurrent inserts; the partial
    /// unique index is the authority, and a duplicate-key rejection is
    /// resolved by re-reading the surviving document.
    pub async fn insert(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<EnqueueResult> {
        if let Some(key) = &new_job.unique_key {
            if let Some(existing) = self.find_live_by_unique_key(&new_job.name, key).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let now_bson = BsonDateTime::from_chrono(now);
        let document = JobDocument {
            id: ObjectId::new(),
            name: new_job.name.clone(),
            data: new_job.data,
            status: JobStatus::Pending,
            next_run_at: BsonDateTime::from_chrono(new_job.next_run_at),
            fail_count: 0,
            created_at: now_bson,
            updated_at: now_bson,
            repeat_interval: new_job.repeat_interval,
            unique_key: new_job.unique_key.clone(),
            locked_at: None,
            claimed_by: None,
            fail_reason: None,
        };

        match self.collection.insert_one(&document).await {
            Ok(_) => Ok(EnqueueResult::Created(document.into_job())),
            Err(err) if is_duplicate_key(&err) => {
                // Lost the race; hand back whichever document won.
                let key = new_job.unique_key.as_deref().unwrap_or_default();
                match self.find_live_by_unique_key(&new_job.name, key).await? {
                    Some(existing) => Ok(EnqueueResult::Duplicate(existing)),
                    None => Err(Error::Connection(err)),
                }
            }
            Err(err) => Err(Error::Connection(err)),
        }
    }

    /// Atomically claim up to `limit` due jobs for `instance_id`.
    ///
    /// Candidates are pending jobs with `nextRunAt <= now`, in
    /// `(nextRunAt, _id)` order. Each claim is a compare-and-set whose
    /// filter re-checks `status = pending`, so a candidate observed by
    /// two pollers is won by exactly one.
    pub async fn claim_batch(
        &self,
        instance_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now_bson = BsonDateTime::from_chrono(now);
        let mut candidates = self
            .collection
            .find(doc! {
                "status": JobStatus::Pending.as_str(),
                "nextRunAt": { "$lte": now_bson },
            })
            .sort(doc! { "nextRunAt": 1, "_id": 1 })
            .limit(limit as i64)
            .await?;

        let mut claimed = Vec::new();
        while let Some(candidate) = candidates.try_next().await? {
            let updated = self
                .collection
                .find_one_and_update(
                    doc! { "_id": candidate.id, "status": JobStatus::Pending.as_str() },
                    doc! {
                        "$set": {
                            "status": JobStatus::Processing.as_str(),
                            "claimedBy": instance_id,
                            "lockedAt": now_bson,
                            "updatedAt": now_bson,
                        },
                    },
                )
                .return_document(ReturnDocument::After)
                .await?;

            if let Some(document) = updated {
                claimed.push(document.into_job());
            }
        }

        debug!(
            instance_id,
            count = claimed.len(),
            "claimed batch of due jobs"
        );
        Ok(claimed)
    }

    /// Extend the lease on every listed job still processing and owned by
    /// `instance_id`.
    ///
    /// Returns the ids that did NOT match - their lease was stolen (the
    /// job is no longer `processing`, or another instance now owns it) and
    /// the caller should cancel the corresponding worker.
    pub async fn heartbeat(
        &self,
        instance_id: &str,
        ids: &[ObjectId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ObjectId>> {
        let now_bson = BsonDateTime::from_chrono(now);
        let mut lost = Vec::new();
        for id in ids {
            let result = self
                .collection
                .update_one(
                    doc! {
                        "_id": *id,
                        "claimedBy": instance_id,
                        "status": JobStatus::Processing.as_str(),
                    },
                    doc! { "$set": { "lockedAt": now_bson, "updatedAt": now_bson } },
                )
                .await?;
            if result.matched_count == 0 {
                lost.push(*id);
            }
        }
        Ok(lost)
    }

    /// Complete a non-recurring job successfully.
    pub async fn complete_success(
        &self,
        id: ObjectId,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.finish(
            id,
            instance_id,
            doc! {
                "$set": {
                    "status": JobStatus::Completed.as_str(),
                    "updatedAt": BsonDateTime::from_chrono(now),
                },
                "$unset": { "lockedAt": "", "claimedBy": "" },
            },
        )
        .await
    }

    /// Return a recurring job to `pending` at its next cron fire.
    ///
    /// Resets `failCount`; a `fail_reason` is recorded when the cron fire
    /// won over a retry (the attempt failed but the series continues).
    pub async fn complete_recurring(
        &self,
        id: ObjectId,
        instance_id: &str,
        next_run_at: DateTime<Utc>,
        fail_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut set = doc! {
            "status": JobStatus::Pending.as_str(),
            "nextRunAt": BsonDateTime::from_chrono(next_run_at),
            "failCount": 0,
            "updatedAt": BsonDateTime::from_chrono(now),
        };
        let mut unset = doc! { "lockedAt": "", "claimedBy": "" };
        match fail_reason {
            Some(reason) => {
                set.insert("failReason", reason);
            }
            None => {
                unset.insert("failReason", "");
            }
        }
        self.finish(id, instance_id, doc! { "$set": set, "$unset": unset })
            .await
    }

    /// Reschedule a failed attempt with retries remaining.
    pub async fn complete_retry(
        &self,
        id: ObjectId,
        instance_id: &str,
        next_run_at: DateTime<Utc>,
        fail_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.finish(
            id,
            instance_id,
            doc! {
                "$set": {
                    "status": JobStatus::Pending.as_str(),
                    "nextRunAt": BsonDateTime::from_chrono(next_run_at),
                    "failReason": fail_reason,
                    "updatedAt": BsonDateTime::from_chrono(now),
                },
                "$unset": { "lockedAt": "", "claimedBy": "" },
                "$inc": { "failCount": 1 },
            },
        )
        .await
    }

    /// Terminally fail a job whose retries are exhausted.
    pub async fn complete_fail(
        &self,
        id: ObjectId,
        instance_id: &str,
        fail_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.finish(
            id,
            instance_id,
            doc! {
                "$set": {
                    "status": JobStatus::Failed.as_str(),
                    "failReason": fail_reason,
                    "updatedAt": BsonDateTime::from_chrono(now),
                },
                "$unset": { "lockedAt": "", "claimedBy": "" },
                "$inc": { "failCount": 1 },
            },
        )
        .await
    }

    /// Shared compare-and-set for the four completion paths: the update
    /// applies only while the job is still processing under our lease.
    /// `None` means the lease was lost first; the new owner's outcome
    /// stands and ours is dropped.
    async fn finish(
        &self,
        id: ObjectId,
        instance_id: &str,
        update: Document,
    ) -> Result<Option<Job>> {
        let updated = self
            .collection
            .find_one_and_update(
                doc! {
                    "_id": id,
                    "status": JobStatus::Processing.as_str(),
                    "claimedBy": instance_id,
                },
                update,
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(updated.map(JobDocument::into_job))
    }

    /// Return expired-lease jobs to the runnable set.
    ///
    /// Each recovery is charged as a failed attempt ("lease expired") so a
    /// crash-looping job cannot cycle forever: once the credit reaches
    /// `max_retries` the job moves straight to `failed`. The per-id filter
    /// re-checks staleness, so a lease extended between the scan and the
    /// update is left alone.
    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let stale_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let cutoff = BsonDateTime::from_chrono(stale_before);
        let now_bson = BsonDateTime::from_chrono(now);

        let mut stale = self
            .collection
            .find(doc! {
                "status": JobStatus::Processing.as_str(),
                "lockedAt": { "$lt": cutoff },
            })
            .sort(doc! { "lockedAt": 1 })
            .limit(limit as i64)
            .await?;

        let mut recovered = Vec::new();
        while let Some(candidate) = stale.try_next().await? {
            let exhausted = candidate.fail_count.saturating_add(1) >= max_retries as i32;
            let next_status = if exhausted {
                JobStatus::Failed
            } else {
                JobStatus::Pending
            };
            let updated = self
                .collection
                .find_one_and_update(
                    doc! {
                        "_id": candidate.id,
                        "status": JobStatus::Processing.as_str(),
                        "lockedAt": { "$lt": cutoff },
                    },
                    doc! {
                        "$set": {
                            "status": next_status.as_str(),
                            "failReason": "lease expired",
                            "updatedAt": now_bson,
                        },
                        "$unset": { "lockedAt": "", "claimedBy": "" },
                        "$inc": { "failCount": 1 },
                    },
                )
                .return_document(ReturnDocument::After)
                .await?;
            if let Some(document) = updated {
                recovered.push(document.into_job());
            }
        }
        Ok(recovered)
    }

    /// Cancel a pending job. Other states are left untouched and `None`
    /// is returned.
    pub async fn cancel(&self, id: ObjectId, now: DateTime<Utc>) -> Result<Option<Job>> {
        let updated = self
            .collection
            .find_one_and_update(
                doc! { "_id": id, "status": JobStatus::Pending.as_str() },
                doc! {
                    "$set": {
                        "status": JobStatus::Cancelled.as_str(),
                        "updatedAt": BsonDateTime::from_chrono(now),
                    },
                },
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(updated.map(JobDocument::into_job))
    }

    /// Fetch a single job by id.
    pub async fn find_by_id(&self, id: ObjectId) -> Result<Option<Job>> {
        let document = self.collection.find_one(doc! { "_id": id }).await?;
        Ok(document.map(JobDocument::into_job))
    }

    /// Keyset-paginated query in ascending `(createdAt, _id)` order.
    pub async fn query(&self, filter: &JobFilter, page: &Page) -> Result<JobPage> {
        let limit = page.clamped_limit();
        let base = filter.to_query();

        let cursor = match &page.cursor {
            Some(encoded) => Some(Cursor::decode(encoded)?),
            None => None,
        };

        let (query, descending) = match cursor {
            None => (base, false),
            Some(cursor) => {
                let anchor =
                    self.find_by_id(cursor.id)
                        .await?
                        .ok_or_else(|| Error::InvalidCursor {
                            reason: "cursor references a missing job".to_string(),
                        })?;
                let anchor_created = BsonDateTime::from_chrono(anchor.created_at);
                let keyset = match cursor.direction {
                    Direction::Forward => doc! {
                        "$or": [
                            { "createdAt": { "$gt": anchor_created } },
                            { "createdAt": anchor_created, "_id": { "$gt": cursor.id } },
                        ],
                    },
                    Direction::Backward => doc! {
                        "$or": [
                            { "createdAt": { "$lt": anchor_created } },
                            { "createdAt": anchor_created, "_id": { "$lt": cursor.id } },
                        ],
                    },
                };
                let combined = if base.is_empty() {
                    keyset
                } else {
                    doc! { "$and": [base, keyset] }
                };
                (combined, matches!(cursor.direction, Direction::Backward))
            }
        };

        let order = if descending { -1 } else { 1 };
        let mut found = self
            .collection
            .find(query)
            .sort(doc! { "createdAt": order, "_id": order })
            .limit(limit as i64 + 1)
            .await?;

        let mut jobs = Vec::with_capacity(limit);
        let mut overflow = false;
        while let Some(document) = found.try_next().await? {
            if jobs.len() == limit {
                overflow = true;
                break;
            }
            jobs.push(document.into_job());
        }
        if descending {
            jobs.reverse();
        }

        // Forward pages have more content when the over-fetch hit;
        // backward pages always have content ahead (where we came from).
        let (more_after, more_before) = if descending {
            (true, overflow)
        } else {
            (overflow, page.cursor.is_some())
        };

        let next_cursor = match (more_after, jobs.last()) {
            (true, Some(last)) => Some(Cursor::new(last.id, Direction::Forward).encode()),
            _ => None,
        };
        let prev_cursor = match (more_before, jobs.first()) {
            (true, Some(first)) => Some(Cursor::new(first.id, Direction::Backward).encode()),
            _ => None,
        };

        Ok(JobPage {
            jobs,
            next_cursor,
            prev_cursor,
        })
    }

    /// Delete up to `limit` jobs in a terminal status whose last update
    /// predates `cutoff`. Returns the deleted ids.
    pub async fn delete_terminal_older_than(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ObjectId>> {
        debug_assert!(status.is_terminal());
        let cutoff_bson = BsonDateTime::from_chrono(cutoff);

        let mut candidates = self
            .collection
            .find(doc! {
                "status": status.as_str(),
                "updatedAt": { "$lt": cutoff_bson },
            })
            .sort(doc! { "updatedAt": 1 })
            .limit(limit as i64)
            .await?;

        let mut deleted = Vec::new();
        while let Some(candidate) = candidates.try_next().await? {
            let result = self
                .collection
                .delete_one(doc! {
                    "_id": candidate.id,
                    "status": status.as_str(),
                    "updatedAt": { "$lt": cutoff_bson },
                })
                .await?;
            if result.deleted_count == 1 {
                deleted.push(candidate.id);
            }
        }
        Ok(deleted)
    }

    /// Per-status counts plus the collection total.
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut groups = self
            .collection
            .aggregate(vec![doc! {
                "$group": { "_id": "$status", "count": { "$sum": 1 } },
            }])
            .await?;

        let mut stats = QueueStats::default();
        while let Some(group) = groups.try_next().await? {
            let count = match group.get("count") {
                Some(Bson::Int32(n)) => *n as u64,
                Some(Bson::Int64(n)) => *n as u64,
                _ => 0,
            };
            match group.get_str("_id") {
                Ok("pending") => stats.pending = count,
                Ok("processing") => stats.processing = count,
                Ok("completed") => stats.completed = count,
                Ok("failed") => stats.failed = count,
                Ok("cancelled") => stats.cancelled = count,
                _ => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }

    async fn find_live_by_unique_key(&self, name: &str, key: &str) -> Result<Option<Job>> {
        let non_terminal: Vec<&str> = JobStatus::NON_TERMINAL
            .iter()
            .map(JobStatus::as_str)
            .collect();
        let document = self
            .collection
            .find_one(doc! {
                "name": name,
                "uniqueKey": key,
                "status": { "$in": non_terminal },
            })
            .await?;
        Ok(document.map(JobDocument::into_job))
    }
}

impl std::fmt::Debug for JobRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRepository")
            .field("collection", &self.collection.name())
            .finish()
    }
}

/// Whether a store error is a unique-index violation (code 11000).
fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref write_error)) => write_error.code == 11000,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_result_accessors() {
        let job = JobDocument {
            id: ObjectId::new(),
            name: "n".to_string(),
            data: Bson::Null,
            status: JobStatus::Pending,
            next_run_at: BsonDateTime::from_chrono(Utc::now()),
            fail_count: 0,
            created_at: BsonDateTime::from_chrono(Utc::now()),
            updated_at: BsonDateTime::from_chrono(Utc::now()),
            repeat_interval: None,
            unique_key: None,
            locked_at: None,
            claimed_by: None,
            fail_reason: None,
        }
        .into_job();

        let created = EnqueueResult::Created(job.clone());
        assert!(created.is_created());
        assert_eq!(created.job().id, job.id);

        let duplicate = EnqueueResult::Duplicate(job.clone());
        assert!(!duplicate.is_created());
        assert_eq!(duplicate.into_job().id, job.id);
    }

    #[test]
    fn test_queue_stats_default_is_zero() {
        let stats = QueueStats::default();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.pending, 0);
    }
}
