//! Integration tests against a live MongoDB.
//!
//! Ignored by default; opt in with a running server:
//!
//! ```sh
//! MONQUE_TEST_URI=mongodb://localhost:27017 cargo test -p monque -- --ignored
//! ```
//!
//! Each test works in its own collection and drops it afterwards, so the
//! suite can run concurrently against one server.

use std::time::Duration;

use chrono::Utc;
use mongodb::bson::{doc, oid::ObjectId, Bson, DateTime as BsonDateTime, Document};
use mongodb::Database;
use monque::{
    EnqueueOptions, Error, Job, JobFilter, JobRepository, JobStatus, Monque, MonqueOptions,
    NewJob, Page, RetentionPolicy, ScheduleOptions, SchedulerEvent,
};

async fn database() -> Database {
    let uri = std::env::var("MONQUE_TEST_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let client = mongodb::Client::with_uri_str(&uri)
        .await
        .expect("MONQUE_TEST_URI must point at a reachable MongoDB");
    client.database("monque_integration")
}

fn unique_collection(prefix: &str) -> String {
    format!("{prefix}_{}", ObjectId::new().to_hex())
}

async fn drop_collection(database: &Database, name: &str) {
    let _ = database.collection::<Document>(name).drop().await;
}

fn payload(value: i64) -> Bson {
    mongodb::bson::to_bson(&serde_json::json!({ "value": value })).unwrap()
}

fn new_job(name: &str) -> NewJob {
    NewJob {
        name: name.to_string(),
        data: payload(1),
        next_run_at: Utc::now(),
        repeat_interval: None,
        unique_key: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn concurrent_claims_produce_one_winner() {
    let database = database().await;
    let collection = unique_collection("claim_race");
    let repository = JobRepository::new(&database, &collection);
    repository.ensure_indexes().await.unwrap();

    repository.insert(new_job("race"), Utc::now()).await.unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(
        repository.claim_batch("instance-a", 10, now),
        repository.claim_batch("instance-b", 10, now),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.len() + b.len(), 1, "exactly one instance wins the claim");
    let winner = a.first().or(b.first()).unwrap();
    assert_eq!(winner.status, JobStatus::Processing);
    assert!(winner.locked_at.is_some());
    assert!(winner.claimed_by.is_some());

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn claim_orders_by_next_run_at_then_id() {
    let database = database().await;
    let collection = unique_collection("claim_order");
    let repository = JobRepository::new(&database, &collection);

    let base = Utc::now() - chrono::Duration::seconds(60);
    let mut expected = Vec::new();
    for offset in [30, 10, 20] {
        let job = repository
            .insert(
                NewJob {
                    next_run_at: base + chrono::Duration::seconds(offset),
                    ..new_job("ordered")
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .into_job();
        expected.push((offset, job.id));
    }
    expected.sort();

    let claimed = repository
        .claim_batch("instance-a", 10, Utc::now())
        .await
        .unwrap();
    let claimed_ids: Vec<ObjectId> = claimed.iter().map(|job| job.id).collect();
    let expected_ids: Vec<ObjectId> = expected.iter().map(|(_, id)| *id).collect();
    assert_eq!(claimed_ids, expected_ids);

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn heartbeat_reports_stolen_leases() {
    let database = database().await;
    let collection = unique_collection("heartbeat");
    let repository = JobRepository::new(&database, &collection);

    repository.insert(new_job("hb"), Utc::now()).await.unwrap();
    let claimed = repository
        .claim_batch("instance-a", 1, Utc::now())
        .await
        .unwrap();
    let id = claimed[0].id;

    // The owner's heartbeat matches.
    let lost = repository
        .heartbeat("instance-a", &[id], Utc::now())
        .await
        .unwrap();
    assert!(lost.is_empty());

    // Anyone else's does not.
    let lost = repository
        .heartbeat("instance-b", &[id], Utc::now())
        .await
        .unwrap();
    assert_eq!(lost, vec![id]);

    // Nor the owner's once the job completed.
    repository
        .complete_success(id, "instance-a", Utc::now())
        .await
        .unwrap()
        .expect("completion CAS should match");
    let lost = repository
        .heartbeat("instance-a", &[id], Utc::now())
        .await
        .unwrap();
    assert_eq!(lost, vec![id]);

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn expired_lease_is_recovered_with_a_failure_credited() {
    let database = database().await;
    let collection = unique_collection("recovery");
    let repository = JobRepository::new(&database, &collection);

    repository
        .insert(new_job("crashy"), Utc::now())
        .await
        .unwrap();
    let claimed = repository
        .claim_batch("instance-a", 1, Utc::now())
        .await
        .unwrap();
    let id = claimed[0].id;

    let lease = Duration::from_secs(30);

    // Instance A halts here. From a vantage point past the lease, the
    // job is stale and goes back to pending with one failure credited.
    let later = Utc::now() + chrono::Duration::seconds(31);
    let recovered = repository
        .recover_stale(later, lease, 3, 100)
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    let job = &recovered[0];
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.fail_count, 1);
    assert_eq!(job.fail_reason.as_deref(), Some("lease expired"));
    assert!(job.locked_at.is_none());
    assert!(job.claimed_by.is_none());

    // A fresh lease is not recovered.
    repository
        .claim_batch("instance-b", 1, Utc::now())
        .await
        .unwrap();
    let recovered = repository
        .recover_stale(Utc::now(), lease, 3, 100)
        .await
        .unwrap();
    assert!(recovered.is_empty());

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn recovery_exhausting_retries_fails_the_job() {
    let database = database().await;
    let collection = unique_collection("recovery_exhausted");
    let repository = JobRepository::new(&database, &collection);

    repository
        .insert(new_job("crashy"), Utc::now())
        .await
        .unwrap();

    let lease = Duration::from_secs(30);
    let mut status = JobStatus::Pending;
    for round in 1..=3u32 {
        let claimed = repository
            .claim_batch("instance-a", 1, Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1, "round {round} should claim the job");

        let later = Utc::now() + chrono::Duration::seconds(31);
        let recovered = repository
            .recover_stale(later, lease, 3, 100)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].fail_count, round);
        status = recovered[0].status;
    }

    // Third recovery reaches max_retries: straight to failed.
    assert_eq!(status, JobStatus::Failed);

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn enqueue_with_unique_key_is_idempotent() {
    let database = database().await;
    let collection = unique_collection("idempotent");
    let options = MonqueOptions {
        collection_name: collection.clone(),
        ..Default::default()
    };
    let monque = Monque::new(database.clone(), options);
    monque.initialize().await.unwrap();

    let enqueue_options = EnqueueOptions {
        unique_key: Some("digest:2024-05-01".to_string()),
        ..Default::default()
    };
    let first = monque
        .enqueue("digest", payload(1), enqueue_options.clone())
        .await
        .unwrap();
    let second = monque
        .enqueue("digest", payload(2), enqueue_options)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    let stats = monque.get_queue_stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 1);

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn schedule_same_cron_twice_keeps_one_series() {
    let database = database().await;
    let collection = unique_collection("cron_idempotent");
    let options = MonqueOptions {
        collection_name: collection.clone(),
        ..Default::default()
    };
    let monque = Monque::new(database.clone(), options);
    monque.initialize().await.unwrap();

    let first = monque
        .schedule("* * * * *", "tick", payload(1), ScheduleOptions::default())
        .await
        .unwrap();
    let second = monque
        .schedule("* * * * *", "tick", payload(1), ScheduleOptions::default())
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.repeat_interval.as_deref(), Some("* * * * *"));
    let stats = monque.get_queue_stats().await.unwrap();
    assert_eq!(stats.total, 1);

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn failing_worker_retries_then_completes() {
    let database = database().await;
    let collection = unique_collection("retry_flow");
    let options = MonqueOptions {
        collection_name: collection.clone(),
        poll_interval: Duration::from_millis(50),
        base_retry_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let monque = Monque::new(database.clone(), options);
    monque.initialize().await.unwrap();

    // Fails on the first attempt, succeeds on the retry.
    monque
        .worker("flaky", |_data: Bson, ctx| async move {
            if ctx.job().fail_count == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        })
        .unwrap();

    let mut events = monque.subscribe();
    monque.start();
    let job = monque
        .enqueue("flaky", payload(1), EnqueueOptions::default())
        .await
        .unwrap();

    let mut saw_retry = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("job should settle within 15s")
            .unwrap();
        match event {
            SchedulerEvent::JobRetry {
                job_id, fail_count, ..
            } if job_id == job.id => {
                assert_eq!(fail_count, 1);
                saw_retry = true;
            }
            SchedulerEvent::JobCompleted { job_id, .. } if job_id == job.id => break,
            SchedulerEvent::JobFailed { job_id, reason, .. } if job_id == job.id => {
                panic!("job unexpectedly failed terminally: {reason}");
            }
            _ => {}
        }
    }
    assert!(saw_retry, "the first attempt should have retried");

    let settled = monque.get_job(job.id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Completed);
    assert!(settled.locked_at.is_none());
    assert!(settled.claimed_by.is_none());

    monque.stop(None).await.unwrap();
    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn missing_handler_counts_as_retryable_failure() {
    let database = database().await;
    let collection = unique_collection("no_handler");
    let options = MonqueOptions {
        collection_name: collection.clone(),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let monque = Monque::new(database.clone(), options);
    monque.initialize().await.unwrap();

    let mut events = monque.subscribe();
    monque.start();
    let job = monque
        .enqueue("unregistered", payload(1), EnqueueOptions::default())
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("retry event expected")
            .unwrap();
        if let SchedulerEvent::JobRetry { job_id, reason, .. } = event {
            if job_id == job.id {
                assert!(reason.contains("no handler"));
                break;
            }
        }
    }

    monque.stop(None).await.unwrap();
    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn retention_deletes_old_terminal_jobs_and_keeps_fresh_ones() {
    let database = database().await;
    let collection = unique_collection("retention");
    let options = MonqueOptions {
        collection_name: collection.clone(),
        poll_interval: Duration::from_millis(50),
        job_retention: Some(RetentionPolicy {
            completed: Some(Duration::from_millis(5000)),
            failed: None,
            interval: Duration::from_millis(100),
        }),
        ..Default::default()
    };
    let monque = Monque::new(database.clone(), options);
    monque.initialize().await.unwrap();
    monque
        .worker("noop", |_data: Bson, _ctx| async { Ok(()) })
        .unwrap();

    let mut events = monque.subscribe();
    monque.start();

    let old = monque
        .enqueue("noop", payload(1), EnqueueOptions::default())
        .await
        .unwrap();
    let fresh = monque
        .enqueue("noop", payload(2), EnqueueOptions::default())
        .await
        .unwrap();

    // Wait for both to complete, then age one past the cutoff by
    // rewriting its updatedAt.
    let mut completed = 0;
    while completed < 2 {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("jobs should complete")
            .unwrap();
        if matches!(event, SchedulerEvent::JobCompleted { .. }) {
            completed += 1;
        }
    }
    let aged = BsonDateTime::from_chrono(Utc::now() - chrono::Duration::seconds(6));
    database
        .collection::<Document>(&collection)
        .update_one(
            doc! { "_id": old.id },
            doc! { "$set": { "updatedAt": aged } },
        )
        .await
        .unwrap();

    // The aged job is swept within a couple of seconds; the fresh one
    // survives.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("retention should delete the aged job")
            .unwrap();
        if let SchedulerEvent::JobDeleted { job_id, status } = event {
            assert_eq!(job_id, old.id);
            assert_eq!(status, JobStatus::Completed);
            break;
        }
    }
    assert!(matches!(
        monque.get_job(old.id).await,
        Err(Error::NotFound { .. })
    ));
    assert_eq!(
        monque.get_job(fresh.id).await.unwrap().status,
        JobStatus::Completed
    );

    monque.stop(None).await.unwrap();
    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn cancel_is_pending_only_and_not_found_otherwise() {
    let database = database().await;
    let collection = unique_collection("cancel");
    let options = MonqueOptions {
        collection_name: collection.clone(),
        ..Default::default()
    };
    let monque = Monque::new(database.clone(), options);
    monque.initialize().await.unwrap();

    let job = monque
        .enqueue(
            "cancellable",
            payload(1),
            EnqueueOptions {
                delay: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let cancelled = monque.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // Cancelling again is a no-op on a terminal job.
    let again = monque.cancel(job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);

    assert!(matches!(
        monque.cancel(ObjectId::new()).await,
        Err(Error::NotFound { .. })
    ));

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn keyset_pagination_walks_forward_and_back() {
    let database = database().await;
    let collection = unique_collection("pagination");
    let repository = JobRepository::new(&database, &collection);

    let base = Utc::now() - chrono::Duration::seconds(100);
    let mut inserted: Vec<Job> = Vec::new();
    for index in 0..5 {
        let created = base + chrono::Duration::seconds(index);
        let job = repository
            .insert(
                NewJob {
                    next_run_at: created,
                    ..new_job("paged")
                },
                created,
            )
            .await
            .unwrap()
            .into_job();
        inserted.push(job);
    }

    let filter = JobFilter::new().with_name("paged");

    let first = repository
        .query(&filter, &Page::with_limit(2))
        .await
        .unwrap();
    assert_eq!(first.jobs.len(), 2);
    assert_eq!(first.jobs[0].id, inserted[0].id);
    assert_eq!(first.jobs[1].id, inserted[1].id);
    assert!(first.prev_cursor.is_none());
    let next = first.next_cursor.expect("more pages exist");

    let second = repository
        .query(&filter, &Page::with_cursor(2, next))
        .await
        .unwrap();
    assert_eq!(second.jobs[0].id, inserted[2].id);
    assert_eq!(second.jobs[1].id, inserted[3].id);
    assert!(second.prev_cursor.is_some());

    let third = repository
        .query(
            &filter,
            &Page::with_cursor(2, second.next_cursor.expect("one more page")),
        )
        .await
        .unwrap();
    assert_eq!(third.jobs.len(), 1);
    assert_eq!(third.jobs[0].id, inserted[4].id);
    assert!(third.next_cursor.is_none());

    // And back again from the second page's prev cursor.
    let back = repository
        .query(
            &filter,
            &Page::with_cursor(2, second.prev_cursor.expect("previous page exists")),
        )
        .await
        .unwrap();
    assert_eq!(back.jobs[0].id, inserted[0].id);
    assert_eq!(back.jobs[1].id, inserted[1].id);

    drop_collection(&database, &collection).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live MongoDB (MONQUE_TEST_URI)"]
async fn processing_jobs_carry_lease_fields_and_pending_jobs_do_not() {
    let database = database().await;
    let collection = unique_collection("lease_invariant");
    let repository = JobRepository::new(&database, &collection);

    let job = repository
        .insert(new_job("invariant"), Utc::now())
        .await
        .unwrap()
        .into_job();
    assert!(job.locked_at.is_none() && job.claimed_by.is_none());

    let claimed = repository
        .claim_batch("instance-a", 1, Utc::now())
        .await
        .unwrap();
    assert!(claimed[0].locked_at.is_some() && claimed[0].claimed_by.is_some());

    let completed = repository
        .complete_success(job.id, "instance-a", Utc::now())
        .await
        .unwrap()
        .expect("completion CAS should match");
    assert_eq!(completed.status, JobStatus::Completed);
    assert!(completed.locked_at.is_none() && completed.claimed_by.is_none());

    drop_collection(&database, &collection).await;
}
