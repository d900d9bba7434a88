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

//! Durable job queue with at-least-once delivery.
//!
//! Jobs are persisted rows. A leased job that is neither acked nor nacked
//! before its lease expires returns to the pool, so every job is delivered
//! at least once; handlers are expected to make their effects idempotent.
//!
//! Enqueue is idempotent on the job id: replaying an enqueue with an id
//! that already exists is a no-op, whatever state the original is in.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dal::DAL;
use crate::database::universal_types::{current_timestamp, UniversalTimestamp, UniversalUuid};
use crate::error::QueueError;
use crate::models::{Job, NewJob};
use crate::retry::BackoffPolicy;

/// Retention windows for terminal jobs.
///
/// Completed jobs are kept for `completed_ttl` and the most recent
/// `keep_last` survive regardless of age. Failed jobs get the longer
/// `failed_ttl` window since they are the ones worth inspecting.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub keep_last: i64,
    pub completed_ttl: Duration,
    pub failed_ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last: 100,
            completed_ttl: Duration::from_secs(24 * 60 * 60),
            failed_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Outcome of a nack as recorded by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Attempts remain; the job re-enters the pool at `retry_at`.
    Retry {
        attempt: i32,
        retry_at: UniversalTimestamp,
    },
    /// Retry budget exhausted; the job is permanently `Failed`.
    Exhausted { attempt: i32 },
}

/// Options for [`DurableQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Job id, which doubles as the enqueue idempotency key. Callers with a
    /// natural event id should derive the job id from it.
    pub id: UniversalUuid,
    /// Delay before the job becomes visible to workers.
    pub delay: Duration,
    pub max_attempts: i32,
    /// Deterministic key for cancel-by-key (delayed task scheduling).
    pub dedupe_key: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            id: UniversalUuid::new_v4(),
            delay: Duration::ZERO,
            max_attempts: 3,
            dedupe_key: None,
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a worker holds a claimed job before it is considered
    /// stalled.
    pub lease_duration: Duration,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5 * 60),
            backoff: BackoffPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Handle to the durable queue.
///
/// Cheap to clone; all state lives in the database.
#[derive(Clone)]
pub struct DurableQueue {
    dal: DAL,
    config: QueueConfig,
}

impl DurableQueue {
    pub fn new(dal: DAL, config: QueueConfig) -> Self {
        Self { dal, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueues a job, idempotent on `options.id`.
    ///
    /// Returns `true` if the job was created, `false` on replay.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let delay = chrono::Duration::from_std(options.delay)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let new_job = NewJob {
            id: options.id,
            kind: kind.to_string(),
            payload,
            max_attempts: options.max_attempts,
            dedupe_key: options.dedupe_key,
            available_at: current_timestamp() + delay,
        };

        let created = self.dal.jobs().insert_if_absent(new_job).await?;
        if created {
            debug!(job_id = %options.id, kind = kind, "Enqueued job");
        } else {
            debug!(job_id = %options.id, kind = kind, "Enqueue replayed, job already exists");
        }
        Ok(created)
    }

    /// Claims the next ready job under a lease, if any.
    pub async fn lease(&self) -> Result<Option<Job>, QueueError> {
        let lease = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let job = self.dal.jobs().claim_next(lease).await?;
        if let Some(ref job) = job {
            debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "Leased job");
        }
        Ok(job)
    }

    /// Acknowledges successful processing.
    ///
    /// Safe to call after the lease stalled and the job was re-queued; the
    /// duplicate delivery is absorbed by handler idempotency, and a second
    /// ack of a completed job is a no-op. Acking a failed job is an
    /// `InvalidState` error.
    pub async fn ack(&self, job_id: UniversalUuid) -> Result<(), QueueError> {
        self.dal
            .jobs()
            .mark_completed(job_id, self.config.retention)
            .await?;
        debug!(job_id = %job_id, "Acked job");
        Ok(())
    }

    /// Reports a failed attempt; the queue decides between backoff retry
    /// and permanent failure.
    pub async fn nack(&self, job_id: UniversalUuid, error: &str) -> Result<NackOutcome, QueueError> {
        let outcome = self
            .dal
            .jobs()
            .fail_attempt(job_id, error.to_string(), self.config.backoff)
            .await?;

        match outcome {
            NackOutcome::Retry { attempt, retry_at } => {
                info!(job_id = %job_id, attempt, retry_at = %retry_at, "Job nacked, retry scheduled");
            }
            NackOutcome::Exhausted { attempt } => {
                warn!(job_id = %job_id, attempt, error, "Job failed permanently, retries exhausted");
            }
        }
        Ok(outcome)
    }

    /// Fails a job immediately without consuming its remaining retries.
    /// For errors retrying cannot fix.
    pub async fn fail(&self, job_id: UniversalUuid, error: &str) -> Result<(), QueueError> {
        self.dal.jobs().mark_failed(job_id, error.to_string()).await?;
        warn!(job_id = %job_id, error, "Job failed permanently, non-retryable");
        Ok(())
    }

    /// Returns stalled leases to the pool. Run periodically.
    pub async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let released = self.dal.jobs().release_stalled().await?;
        if released > 0 {
            info!(released, "Released stalled leases back to the queue");
        }
        Ok(released)
    }

    /// Fetches a job by id (observability and tests).
    pub async fn get(&self, job_id: UniversalUuid) -> Result<Option<Job>, QueueError> {
        self.dal.jobs().get_by_id(job_id).await
    }

    /// Removes still-queued jobs carrying the given dedupe key. Returns the
    /// number removed; zero is not an error.
    pub async fn cancel_by_dedupe_key(&self, dedupe_key: &str) -> Result<usize, QueueError> {
        let cancelled = self.dal.jobs().delete_queued_by_dedupe_key(dedupe_key).await?;
        if cancelled > 0 {
            debug!(dedupe_key, cancelled, "Cancelled queued jobs by dedupe key");
        }
        Ok(cancelled)
    }

    /// Applies retention outside the ack path. Run periodically.
    pub async fn purge_retained(&self) -> Result<usize, QueueError> {
        self.dal.jobs().purge_retained(self.config.retention).await
    }
}
