/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Durable queue semantics: idempotent enqueue, leasing, ack/nack,
//! stalled-lease recovery, and retention.

use std::time::Duration;

use serde_json::json;

use weir::database::universal_types::UniversalUuid;
use weir::error::QueueError;
use weir::queue::{DurableQueue, EnqueueOptions, NackOutcome, QueueConfig, RetentionPolicy};
use weir::retry::BackoffPolicy;
use weir::models::JobStatus;

use crate::fixtures::test_dal;

fn fast_config() -> QueueConfig {
    QueueConfig {
        lease_duration: Duration::from_secs(60),
        backoff: BackoffPolicy {
            base: Duration::from_millis(50),
            cap: Duration::from_secs(1),
            jitter: false,
        },
        retention: RetentionPolicy::default(),
    }
}

#[tokio::test]
async fn test_enqueue_is_idempotent_on_job_id() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());
    let id = UniversalUuid::new_v4();

    let options = EnqueueOptions {
        id,
        ..Default::default()
    };
    assert!(queue
        .enqueue("test.job", json!({"n": 1}), options.clone())
        .await
        .unwrap());

    // Replay with the same id: absorbed, original payload untouched.
    assert!(!queue
        .enqueue("test.job", json!({"n": 2}), options)
        .await
        .unwrap());

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.payload, json!({"n": 1}));
}

#[tokio::test]
async fn test_lease_claims_job_exactly_once() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());
    let id = UniversalUuid::new_v4();

    queue
        .enqueue(
            "test.job",
            json!({}),
            EnqueueOptions {
                id,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = queue.lease().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Leased);
    assert!(job.lease_expires_at.is_some());

    // The leased job is invisible to a second poller.
    assert!(queue.lease().await.unwrap().is_none());
}

#[tokio::test]
async fn test_delayed_job_invisible_until_due() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());

    queue
        .enqueue(
            "test.job",
            json!({}),
            EnqueueOptions {
                delay: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(queue.lease().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(queue.lease().await.unwrap().is_some());
}

#[tokio::test]
async fn test_ack_completes_and_tolerates_replay() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());

    queue
        .enqueue("test.job", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = queue.lease().await.unwrap().unwrap();

    queue.ack(job.id).await.unwrap();
    let done = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());

    // A second ack (late delivery of the first) is a no-op.
    queue.ack(job.id).await.unwrap();
    let done = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_ack_of_failed_job_is_invalid() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());

    queue
        .enqueue("test.job", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = queue.lease().await.unwrap().unwrap();
    queue.fail(job.id, "rejected").await.unwrap();

    // Failed is terminal; a late ack is a fault, not a replay.
    let result = queue.ack(job.id).await;
    assert!(matches!(result, Err(QueueError::InvalidState { .. })));
}

#[tokio::test]
async fn test_nack_schedules_backoff_retry() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());

    queue
        .enqueue("test.job", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = queue.lease().await.unwrap().unwrap();

    let outcome = queue.nack(job.id, "connection reset").await.unwrap();
    assert!(matches!(outcome, NackOutcome::Retry { attempt: 1, .. }));

    let retried = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempt, 1);
    assert_eq!(retried.last_error.as_deref(), Some("connection reset"));
    assert!(retried.available_at > job.available_at);

    // Not visible until the backoff delay passes.
    assert!(queue.lease().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.lease().await.unwrap().is_some());
}

#[tokio::test]
async fn test_retries_exhaust_to_failed() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());

    queue
        .enqueue(
            "test.job",
            json!({}),
            EnqueueOptions {
                max_attempts: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = queue.lease().await.unwrap().unwrap();
    assert!(matches!(
        queue.nack(job.id, "boom").await.unwrap(),
        NackOutcome::Retry { .. }
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = queue.lease().await.unwrap().unwrap();
    assert!(matches!(
        queue.nack(job.id, "boom again").await.unwrap(),
        NackOutcome::Exhausted { attempt: 2 }
    ));

    let failed = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt, 2);
    assert!(failed.completed_at.is_some());
    assert!(queue.lease().await.unwrap().is_none());
}

#[tokio::test]
async fn test_fail_is_terminal_without_consuming_retries() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());

    queue
        .enqueue("test.job", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = queue.lease().await.unwrap().unwrap();

    queue.fail(job.id, "unknown kind").await.unwrap();

    let failed = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt, 0);
    assert!(queue.lease().await.unwrap().is_none());
}

#[tokio::test]
async fn test_stalled_lease_released_without_attempt_increment() {
    let dal = test_dal().await;
    let config = QueueConfig {
        lease_duration: Duration::from_millis(50),
        ..fast_config()
    };
    let queue = DurableQueue::new(dal, config);

    queue
        .enqueue("test.job", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = queue.lease().await.unwrap().unwrap();

    // Lease not yet expired: nothing to recover.
    assert_eq!(queue.recover_stalled().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.recover_stalled().await.unwrap(), 1);

    // Re-leasable; a stall is not a recorded failure.
    let again = queue.lease().await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempt, 0);
}

#[tokio::test]
async fn test_cancel_by_dedupe_key_only_removes_queued() {
    let dal = test_dal().await;
    let queue = DurableQueue::new(dal, fast_config());

    queue
        .enqueue(
            "test.job",
            json!({}),
            EnqueueOptions {
                dedupe_key: Some("user:42".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(queue.cancel_by_dedupe_key("user:42").await.unwrap(), 1);
    assert_eq!(queue.cancel_by_dedupe_key("user:42").await.unwrap(), 0);
    assert!(queue.lease().await.unwrap().is_none());

    // A leased job is beyond cancellation.
    queue
        .enqueue(
            "test.job",
            json!({}),
            EnqueueOptions {
                dedupe_key: Some("user:43".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    queue.lease().await.unwrap().unwrap();
    assert_eq!(queue.cancel_by_dedupe_key("user:43").await.unwrap(), 0);
}

#[tokio::test]
async fn test_retention_keeps_most_recent_completed() {
    let dal = test_dal().await;
    let config = QueueConfig {
        retention: RetentionPolicy {
            keep_last: 2,
            completed_ttl: Duration::ZERO,
            failed_ttl: Duration::from_secs(3600),
        },
        ..fast_config()
    };
    let queue = DurableQueue::new(dal.clone(), config);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = UniversalUuid::new_v4();
        ids.push(id);
        queue
            .enqueue(
                "test.job",
                json!({}),
                EnqueueOptions {
                    id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let job = queue.lease().await.unwrap().unwrap();
        queue.ack(job.id).await.unwrap();
        // Distinct completion timestamps for a deterministic keep set.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Zero TTL, keep_last 2: the oldest completed job is gone.
    assert_eq!(
        dal.jobs().count_by_status(JobStatus::Completed).await.unwrap(),
        2
    );
    assert!(queue.get(ids[0]).await.unwrap().is_none());
    assert!(queue.get(ids[2]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_jobs_survive_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("weir.db").to_str().unwrap().to_string();
    let id = UniversalUuid::new_v4();

    {
        let database = weir::database::Database::new(&url, 1);
        database.run_migrations().await.unwrap();
        let queue = DurableQueue::new(weir::dal::DAL::new(database.clone()), fast_config());
        queue
            .enqueue(
                "test.job",
                json!({"durable": true}),
                EnqueueOptions {
                    id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Release the file lock; deadpool drops idle connections lazily.
        database.pool().close();
    }

    // A fresh pool over the same file sees the queued job.
    let database = weir::database::Database::new(&url, 1);
    database.run_migrations().await.unwrap();
    let queue = DurableQueue::new(weir::dal::DAL::new(database), fast_config());

    let job = queue.lease().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.payload, json!({"durable": true}));
}

#[tokio::test]
async fn test_failed_jobs_outlive_completed_retention() {
    let dal = test_dal().await;
    let config = QueueConfig {
        retention: RetentionPolicy {
            keep_last: 0,
            completed_ttl: Duration::ZERO,
            failed_ttl: Duration::from_secs(3600),
        },
        ..fast_config()
    };
    let queue = DurableQueue::new(dal.clone(), config);

    queue
        .enqueue("test.job", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let job = queue.lease().await.unwrap().unwrap();
    queue.fail(job.id, "kept for inspection").await.unwrap();

    queue.purge_retained().await.unwrap();
    assert_eq!(
        dal.jobs().count_by_status(JobStatus::Failed).await.unwrap(),
        1
    );
}
