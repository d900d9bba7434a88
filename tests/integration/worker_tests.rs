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

//! End-to-end worker pool tests: a running pool against a live queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use serial_test::serial;

use weir::dal::DAL;
use weir::database::universal_types::UniversalUuid;
use weir::error::HandlerError;
use weir::models::{Job, JobStatus};
use weir::queue::{DurableQueue, EnqueueOptions, QueueConfig, RetentionPolicy};
use weir::retry::BackoffPolicy;
use weir::worker::{HandlerRegistry, JobHandler, WorkerConfig, WorkerPool};

use crate::fixtures::test_dal;

/// Handler that succeeds after a configurable number of failures.
struct FlakyHandler {
    calls: Arc<AtomicUsize>,
    failures_before_success: usize,
    fatal: bool,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, _job: &Job) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            if self.fatal {
                Err(HandlerError::fatal("rejected"))
            } else {
                Err(HandlerError::transient("upstream 503"))
            }
        } else {
            Ok(json!({"ok": true}))
        }
    }
}

fn fast_queue(dal: &DAL) -> DurableQueue {
    DurableQueue::new(
        dal.clone(),
        QueueConfig {
            lease_duration: Duration::from_secs(30),
            backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                cap: Duration::from_millis(100),
                jitter: false,
            },
            retention: RetentionPolicy::default(),
        },
    )
}

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        max_concurrent_jobs: 2,
        poll_interval: Duration::from_millis(20),
        job_timeout: Duration::from_secs(5),
        recovery_interval: Duration::from_millis(200),
        idempotency_ttl: Duration::from_secs(3600),
        reservation_ttl: Duration::from_secs(3600),
    }
}

/// Runs a pool in the background, waits for `predicate`, then shuts down.
async fn run_pool_until<F, Fut>(pool: WorkerPool, predicate: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let shutdown = pool.shutdown_handle();
    let pool_task = tokio::spawn(async move { pool.run().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if predicate().await {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Timed out waiting for worker pool"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = shutdown.send(());
    pool_task.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn test_pool_processes_job_to_completion() {
    let dal = test_dal().await;
    let queue = fast_queue(&dal);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    registry.register(
        "test.work",
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            failures_before_success: 0,
            fatal: false,
        }),
    );

    let id = UniversalUuid::new_v4();
    queue
        .enqueue(
            "test.work",
            json!({}),
            EnqueueOptions {
                id,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pool = WorkerPool::new(queue.clone(), dal, registry, fast_worker_config());
    let probe_queue = queue.clone();
    run_pool_until(pool, || {
        let queue = probe_queue.clone();
        async move {
            matches!(
                queue.get(id).await.unwrap(),
                Some(job) if job.status == JobStatus::Completed
            )
        }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_transient_failure_retries_until_success() {
    let dal = test_dal().await;
    let queue = fast_queue(&dal);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    registry.register(
        "test.work",
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            failures_before_success: 2,
            fatal: false,
        }),
    );

    let id = UniversalUuid::new_v4();
    queue
        .enqueue(
            "test.work",
            json!({}),
            EnqueueOptions {
                id,
                max_attempts: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pool = WorkerPool::new(queue.clone(), dal, registry, fast_worker_config());
    let probe_queue = queue.clone();
    run_pool_until(pool, || {
        let queue = probe_queue.clone();
        async move {
            matches!(
                queue.get(id).await.unwrap(),
                Some(job) if job.status == JobStatus::Completed
            )
        }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempt, 2);
}

#[tokio::test]
#[serial]
async fn test_fatal_failure_skips_remaining_retries() {
    let dal = test_dal().await;
    let queue = fast_queue(&dal);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    registry.register(
        "test.work",
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            failures_before_success: usize::MAX,
            fatal: true,
        }),
    );

    let id = UniversalUuid::new_v4();
    queue
        .enqueue(
            "test.work",
            json!({}),
            EnqueueOptions {
                id,
                max_attempts: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pool = WorkerPool::new(queue.clone(), dal, registry, fast_worker_config());
    let probe_queue = queue.clone();
    run_pool_until(pool, || {
        let queue = probe_queue.clone();
        async move {
            matches!(
                queue.get(id).await.unwrap(),
                Some(job) if job.status == JobStatus::Failed
            )
        }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempt, 0);
    assert_eq!(job.last_error.as_deref(), Some("rejected"));
}

#[tokio::test]
#[serial]
async fn test_recorded_effect_suppresses_redelivered_handler_run() {
    let dal = test_dal().await;
    let queue = fast_queue(&dal);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    registry.register(
        "test.work",
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            failures_before_success: 0,
            fatal: false,
        }),
    );

    // Simulate a job whose first delivery ran to completion but whose ack
    // was lost: the effect record exists, the job is queued again.
    let id = UniversalUuid::new_v4();
    dal.idempotency()
        .put(
            &format!("job:{}", id),
            &json!({"ok": true}),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    queue
        .enqueue(
            "test.work",
            json!({}),
            EnqueueOptions {
                id,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pool = WorkerPool::new(queue.clone(), dal, registry, fast_worker_config());
    let probe_queue = queue.clone();
    run_pool_until(pool, || {
        let queue = probe_queue.clone();
        async move {
            matches!(
                queue.get(id).await.unwrap(),
                Some(job) if job.status == JobStatus::Completed
            )
        }
    })
    .await;

    // Acked without running the handler again.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[serial]
async fn test_recovery_sweep_reclaims_stale_reservations() {
    let dal = test_dal().await;
    let queue = fast_queue(&dal);
    let ledger = weir::ledger::CreditLedger::new(dal.clone());
    ledger.add_credits("hank", 10, "grant", "g-1").await.unwrap();

    // A reservation left behind by a delivery that timed out mid-handler;
    // the retried attempt reserves under a different key.
    let stranded = ledger
        .reserve("hank", "generate", 6, "r-stranded")
        .await
        .unwrap();
    assert!(stranded.has_credits);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool = WorkerPool::new(
        queue,
        dal,
        HandlerRegistry::new(),
        WorkerConfig {
            reservation_ttl: Duration::ZERO,
            ..fast_worker_config()
        },
    );
    let probe_ledger = ledger.clone();
    run_pool_until(pool, || {
        let ledger = probe_ledger.clone();
        async move {
            matches!(
                ledger.find_by_idempotency_key("r-stranded").await.unwrap(),
                Some(row) if row.status == weir::models::TransactionStatus::Cancelled
            )
        }
    })
    .await;

    // The user's availability is whole again.
    let retry = ledger.reserve("hank", "generate", 6, "r-1").await.unwrap();
    assert!(retry.has_credits);
    assert_eq!(ledger.balance("hank").await.unwrap(), 10);
}

#[tokio::test]
#[serial]
async fn test_unroutable_job_fails_terminally() {
    let dal = test_dal().await;
    let queue = fast_queue(&dal);

    let id = UniversalUuid::new_v4();
    queue
        .enqueue(
            "kind.nobody.handles",
            json!({}),
            EnqueueOptions {
                id,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pool = WorkerPool::new(
        queue.clone(),
        dal,
        HandlerRegistry::new(),
        fast_worker_config(),
    );
    let probe_queue = queue.clone();
    run_pool_until(pool, || {
        let queue = probe_queue.clone();
        async move {
            matches!(
                queue.get(id).await.unwrap(),
                Some(job) if job.status == JobStatus::Failed
            )
        }
    })
    .await;
}
