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

//! Worker pool: leases jobs from the queue and runs registered handlers.
//!
//! The pool polls the queue, gates concurrency with a semaphore, and spawns
//! one task per leased job. Around every handler invocation sits an
//! idempotency check keyed on the job id: a redelivered job whose effect
//! was already recorded is acked without re-running the handler, which is
//! what turns at-least-once delivery into effectively-once effects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::dal::DAL;
use crate::error::{HandlerError, WorkerError};
use crate::models::Job;
use crate::queue::{DurableQueue, NackOutcome};

/// A unit of job-processing logic, registered under a job kind.
///
/// Handlers must tolerate redelivery: the pool deduplicates completed work,
/// but a job whose first delivery died mid-handler will run again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Processes one job, returning a JSON result recorded for replay.
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError>;
}

/// Maps job kinds to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrently running handlers.
    pub max_concurrent_jobs: usize,
    /// Queue poll interval when idle.
    pub poll_interval: Duration,
    /// Per-job wall-clock timeout; a timed-out job is nacked.
    pub job_timeout: Duration,
    /// How often the recovery sweep runs (stalled leases, expired
    /// idempotency records, retention).
    pub recovery_interval: Duration,
    /// TTL for the per-job idempotency record.
    pub idempotency_ttl: Duration,
    /// Age after which an unsettled `Reserved` ledger row is reclaimed by
    /// the recovery sweep. Must exceed `job_timeout`, or the sweep can
    /// cancel a reservation out from under a live handler.
    pub reservation_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_millis(100),
            job_timeout: Duration::from_secs(5 * 60),
            recovery_interval: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            reservation_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// The worker pool. Owns the poll loop; spawned via [`WorkerPool::run`].
pub struct WorkerPool {
    queue: DurableQueue,
    dal: DAL,
    registry: HandlerRegistry,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(queue: DurableQueue, dal: DAL, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            queue,
            dal,
            registry,
            config,
            semaphore,
            shutdown,
        }
    }

    /// Returns a handle that stops the poll loop when triggered.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Runs the poll loop until shutdown. In-flight handlers are given
    /// until their permits release before the loop returns.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(
            max_concurrent = self.config.max_concurrent_jobs,
            "Worker pool started"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut recovery = tokio::time::interval(self.config.recovery_interval);
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Worker pool shutting down");
                    break;
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.recovery_sweep().await {
                        error!("Recovery sweep failed: {}", e);
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Queue poll failed: {}", e);
                    }
                }
            }
        }

        // Drain: wait for all permits, i.e. all in-flight jobs.
        let _drain = self
            .semaphore
            .acquire_many(self.config.max_concurrent_jobs as u32)
            .await?;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Leases and dispatches jobs until the queue is empty or permits run
    /// out.
    async fn poll_once(&self) -> Result<(), WorkerError> {
        loop {
            if self.semaphore.available_permits() == 0 {
                return Ok(());
            }
            let Some(job) = self.queue.lease().await? else {
                return Ok(());
            };

            let permit = self.semaphore.clone().acquire_owned().await?;
            let queue = self.queue.clone();
            let dal = self.dal.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                let _permit = permit;
                process_job(&queue, &dal, &registry, &config, job).await;
            });
        }
    }

    async fn recovery_sweep(&self) -> Result<(), WorkerError> {
        self.queue.recover_stalled().await?;
        self.queue.purge_retained().await?;
        let purged = self.dal.idempotency().purge_expired().await?;
        if purged > 0 {
            debug!(purged, "Purged expired idempotency records");
        }
        // A delivery that dies between reserving credits and settling the
        // reservation (timeout, crash) leaves a Reserved row that holds
        // availability; its retry runs under a fresh key, so nothing else
        // ever settles it.
        let reclaimed = self
            .dal
            .ledger()
            .cancel_stale_reserved(self.config.reservation_ttl)
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stale credit reservations");
        }
        Ok(())
    }
}

fn job_idempotency_key(job: &Job) -> String {
    format!("job:{}", job.id)
}

/// Runs one leased job end to end: idempotency check, handler dispatch
/// with timeout, then ack/nack/fail according to the outcome.
///
/// Errors from the queue itself are logged, not propagated; the lease
/// expiry recovers anything this delivery failed to settle.
async fn process_job(
    queue: &DurableQueue,
    dal: &DAL,
    registry: &HandlerRegistry,
    config: &WorkerConfig,
    job: Job,
) {
    let job_id = job.id;

    // Redelivery of already-completed work: ack without re-running.
    match dal.idempotency().get_valid(&job_idempotency_key(&job)).await {
        Ok(Some(_)) => {
            debug!(job_id = %job_id, "Skipping redelivered job, effect already recorded");
            if let Err(e) = queue.ack(job_id).await {
                error!(job_id = %job_id, "Failed to ack deduplicated job: {}", e);
            }
            return;
        }
        Ok(None) => {}
        Err(e) => {
            error!(job_id = %job_id, "Idempotency lookup failed: {}", e);
            return; // lease expiry will redeliver
        }
    }

    let Some(handler) = registry.get(&job.kind) else {
        warn!(job_id = %job_id, kind = %job.kind, "No handler registered for job kind");
        if let Err(e) = queue.fail(job_id, &format!("no handler for kind '{}'", job.kind)).await {
            error!(job_id = %job_id, "Failed to fail unroutable job: {}", e);
        }
        return;
    };

    let outcome = tokio::time::timeout(config.job_timeout, handler.handle(&job)).await;

    match outcome {
        Ok(Ok(result)) => {
            // Record the effect first; if the ack is then lost, redelivery
            // hits the record and acks without re-running.
            if let Err(e) = dal
                .idempotency()
                .put(&job_idempotency_key(&job), &result, config.idempotency_ttl)
                .await
            {
                error!(job_id = %job_id, "Failed to record job result: {}", e);
                return;
            }
            if let Err(e) = queue.ack(job_id).await {
                error!(job_id = %job_id, "Failed to ack job: {}", e);
            }
        }
        Ok(Err(HandlerError::Fatal { message })) => {
            error!(job_id = %job_id, kind = %job.kind, "Job failed fatally: {}", message);
            if let Err(e) = queue.fail(job_id, &message).await {
                error!(job_id = %job_id, "Failed to record fatal failure: {}", e);
            }
        }
        Ok(Err(HandlerError::Transient { message })) => {
            warn!(job_id = %job_id, kind = %job.kind, "Job attempt failed: {}", message);
            match queue.nack(job_id, &message).await {
                Ok(NackOutcome::Retry { .. }) | Ok(NackOutcome::Exhausted { .. }) => {}
                Err(e) => error!(job_id = %job_id, "Failed to nack job: {}", e),
            }
        }
        Err(_) => {
            warn!(job_id = %job_id, kind = %job.kind, "Job timed out");
            let message = format!("timed out after {:?}", config.job_timeout);
            if let Err(e) = queue.nack(job_id, &message).await {
                error!(job_id = %job_id, "Failed to nack timed-out job: {}", e);
            }
        }
    }
}
