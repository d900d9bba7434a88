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

//! Generation relay: the job handler that spends credits on an upstream
//! generation call.
//!
//! Pipeline per job: reserve credits, pace through both rate limiters,
//! call the backend, then confirm (success) or cancel (failure) the
//! reservation, and schedule a follow-up check-in. The reservation's
//! idempotency key is derived from the job id, so a redelivered job
//! replays its reservation instead of double-charging.
//!
//! Failures after the backend call has gone out are never allowed to mask
//! what happened: cleanup and follow-up errors are captured in the job's
//! recorded outcome alongside the primary result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{HandlerError, LedgerError, LimiterError};
use crate::ledger::{CreditCostResolver, CreditLedger};
use crate::limiter::{SlidingWindowLimiter, TokenBucket};
use crate::models::{Job, TransactionStatus};
use crate::scheduler::CheckinScheduler;
use crate::worker::JobHandler;

/// Job kind for generation relay jobs.
pub const RELAY_JOB_KIND: &str = "generation.request";

/// What a relay job carries: who is asking, what they are paying for, and
/// the opaque input forwarded to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPayload {
    pub user_id: String,
    pub action: String,
    pub input: Value,
}

/// The upstream generation service. Implementations classify their own
/// failures: transient for timeouts and upstream overload, fatal for
/// rejected requests.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, user_id: &str, input: &Value) -> Result<Value, HandlerError>;
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Longest a job waits on the token bucket before giving up the
    /// attempt (the queue's backoff then spaces out the retry).
    pub bucket_max_wait: Duration,
    /// Delay before the follow-up check-in fires.
    pub checkin_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bucket_max_wait: Duration::from_secs(10),
            checkin_delay: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Job handler for [`RELAY_JOB_KIND`].
pub struct RelayHandler<B: GenerationBackend> {
    ledger: CreditLedger,
    costs: Arc<dyn CreditCostResolver>,
    bucket: Arc<TokenBucket>,
    window: SlidingWindowLimiter,
    backend: B,
    scheduler: CheckinScheduler,
    config: RelayConfig,
}

impl<B: GenerationBackend> RelayHandler<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: CreditLedger,
        costs: Arc<dyn CreditCostResolver>,
        bucket: Arc<TokenBucket>,
        window: SlidingWindowLimiter,
        backend: B,
        scheduler: CheckinScheduler,
        config: RelayConfig,
    ) -> Self {
        Self {
            ledger,
            costs,
            bucket,
            window,
            backend,
            scheduler,
            config,
        }
    }
}

fn ledger_to_handler(e: LedgerError) -> HandlerError {
    match e {
        // Programming faults; retrying will not change them.
        LedgerError::InvalidTransition { .. } | LedgerError::BalanceUnderflow { .. } => {
            HandlerError::fatal(e.to_string())
        }
        _ => HandlerError::transient(e.to_string()),
    }
}

#[async_trait]
impl<B: GenerationBackend> JobHandler for RelayHandler<B> {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: RelayPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::fatal(format!("malformed relay payload: {}", e)))?;
        let user_id = &payload.user_id;

        let cost = self.costs.credit_cost(&payload.action).await;

        // The attempt number is part of the key: a retried attempt starts
        // a fresh reservation (the previous one was cancelled on failure),
        // while a redelivery of the same attempt replays its reservation.
        let reservation_key = format!("reserve:{}:{}", job.id, job.attempt);
        let reservation = self
            .ledger
            .reserve(user_id, &payload.action, cost, &reservation_key)
            .await
            .map_err(ledger_to_handler)?;

        match reservation.status {
            // This delivery's reservation was already rolled back by an
            // earlier delivery of the same attempt; push to the next one.
            TransactionStatus::Cancelled => {
                return Err(HandlerError::transient(
                    "reservation cancelled by a previous delivery",
                ));
            }
            // A denied reservation is a recorded terminal outcome for
            // this job, not a retryable failure.
            TransactionStatus::Insufficient => {
                info!(user_id, action = %payload.action, "Relay denied, insufficient credits");
                return Ok(serde_json::json!({
                    "status": "insufficient_credits",
                    "balance": reservation.balance,
                    "cost": cost,
                }));
            }
            // Confirmed means an earlier delivery got through the backend
            // but its result record was lost; run again, confirm is
            // idempotent.
            TransactionStatus::Reserved | TransactionStatus::Confirmed => {}
        }

        // Local pacing first, then the shared window; a bucket timeout
        // must not burn a window slot.
        if let Err(e) = self.bucket.acquire(self.config.bucket_max_wait).await {
            self.release_reservation(&reservation.reservation_id, None)
                .await;
            return Err(HandlerError::transient(e.to_string()));
        }

        let admitted = match self.window.try_acquire().await {
            Ok(admitted) => admitted,
            Err(e) => {
                self.release_reservation(&reservation.reservation_id, None)
                    .await;
                return Err(HandlerError::transient(e.to_string()));
            }
        };
        if !admitted {
            self.release_reservation(&reservation.reservation_id, None)
                .await;
            return Err(HandlerError::transient(
                LimiterError::RateLimitExceeded {
                    key: "generation".to_string(),
                    max_wait_ms: 0,
                }
                .to_string(),
            ));
        }

        match self.backend.generate(user_id, &payload.input).await {
            Ok(result) => {
                let balance = self
                    .ledger
                    .confirm(reservation.reservation_id)
                    .await
                    .map_err(ledger_to_handler)?;

                // Follow-up scheduling failure must not fail the job (the
                // generation already happened); record it instead.
                let checkin_error = match self
                    .scheduler
                    .schedule(user_id, self.config.checkin_delay)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => {
                        error!(user_id, "Follow-up check-in scheduling failed: {}", e);
                        Some(e.to_string())
                    }
                };

                Ok(serde_json::json!({
                    "status": "completed",
                    "result": result,
                    "balance": balance,
                    "checkin_error": checkin_error,
                }))
            }
            Err(backend_error) => {
                self.release_reservation(&reservation.reservation_id, Some(&backend_error))
                    .await;
                Err(backend_error)
            }
        }
    }
}

impl<B: GenerationBackend> RelayHandler<B> {
    /// Cancels a reservation on the failure path. The cancel itself can
    /// fail; that is logged and left to reservation reconciliation rather
    /// than masking the original error.
    async fn release_reservation(
        &self,
        reservation_id: &crate::database::universal_types::UniversalUuid,
        cause: Option<&HandlerError>,
    ) {
        if let Err(cancel_error) = self.ledger.cancel(*reservation_id).await {
            error!(
                reservation_id = %reservation_id,
                cause = ?cause,
                "Failed to cancel reservation after relay failure: {}",
                cancel_error
            );
        } else if let Some(cause) = cause {
            warn!(
                reservation_id = %reservation_id,
                "Reservation cancelled after backend failure: {}",
                cause
            );
        }
    }
}
