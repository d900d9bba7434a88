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

//! Cancelable delayed check-ins.
//!
//! A check-in is a delayed job carrying the deterministic dedupe key
//! `checkin:{user_id}`, so at most one is queued per user and rescheduling
//! cancels the previous one. Two independent guards suppress stale fires:
//! cancellation deletes the queued job, and the fire handler re-checks
//! state and freshness at fire time, since a job already leased when the
//! cancel ran can no longer be deleted.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::dal::DAL;
use crate::database::universal_types::{current_timestamp, UniversalTimestamp, UniversalUuid};
use crate::error::{HandlerError, SchedulerError};
use crate::models::{Checkin, CheckinStatus, Job};
use crate::queue::{DurableQueue, EnqueueOptions};
use crate::worker::JobHandler;

/// Job kind for check-in fire jobs.
pub const CHECKIN_JOB_KIND: &str = "checkin.fire";

fn checkin_dedupe_key(user_id: &str) -> String {
    format!("checkin:{}", user_id)
}

/// Payload of a check-in fire job. `scheduled_at` snapshots the user's
/// last event time as of scheduling; the fire handler compares it to the
/// live value to detect activity that should have rescheduled or
/// cancelled this check-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinPayload {
    pub user_id: String,
    pub last_user_event_at: Option<UniversalTimestamp>,
}

/// Schedules, reschedules, and cancels per-user check-ins.
#[derive(Clone)]
pub struct CheckinScheduler {
    dal: DAL,
    queue: DurableQueue,
}

impl CheckinScheduler {
    pub fn new(dal: DAL, queue: DurableQueue) -> Self {
        Self { dal, queue }
    }

    /// Schedules a check-in to fire after `delay`, replacing any check-in
    /// already queued for the user.
    pub async fn schedule(&self, user_id: &str, delay: Duration) -> Result<(), SchedulerError> {
        let dedupe_key = checkin_dedupe_key(user_id);
        self.queue.cancel_by_dedupe_key(&dedupe_key).await?;

        let checkin = self.dal.checkins().get(user_id).await?;
        let payload = CheckinPayload {
            user_id: user_id.to_string(),
            last_user_event_at: checkin.and_then(|c| c.last_user_event_at),
        };

        let fire_at = current_timestamp()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));

        // State row first: a zero-delay job is leasable the instant it is
        // enqueued, and the fire handler requires the row to read
        // Scheduled.
        self.dal.checkins().upsert_scheduled(user_id, fire_at).await?;

        self.queue
            .enqueue(
                CHECKIN_JOB_KIND,
                serde_json::to_value(&payload).map_err(crate::error::StorageError::from)?,
                EnqueueOptions {
                    id: UniversalUuid::new_v4(),
                    delay,
                    dedupe_key: Some(dedupe_key),
                    ..Default::default()
                },
            )
            .await?;

        info!(user_id, fire_at = %fire_at, "Check-in scheduled");
        Ok(())
    }

    /// Cancels the user's pending check-in. A no-op when nothing is
    /// scheduled; a check-in already leased for firing is left to the fire
    /// handler's freshness check.
    pub async fn cancel(&self, user_id: &str) -> Result<(), SchedulerError> {
        let deleted = self
            .queue
            .cancel_by_dedupe_key(&checkin_dedupe_key(user_id))
            .await?;
        let transitioned = self
            .dal
            .checkins()
            .transition(user_id, CheckinStatus::Scheduled, CheckinStatus::Cancelled)
            .await?;
        if deleted > 0 || transitioned {
            info!(user_id, "Check-in cancelled");
        }
        Ok(())
    }

    /// Records a user-originated event for the freshness check.
    pub async fn record_user_event(&self, user_id: &str) -> Result<(), SchedulerError> {
        self.dal
            .checkins()
            .record_user_event(user_id, current_timestamp())
            .await?;
        Ok(())
    }

    /// Marks a fired check-in as answered: `Sent -> Completed`. Returns
    /// false when the user had no check-in awaiting a reply.
    pub async fn mark_replied(&self, user_id: &str) -> Result<bool, SchedulerError> {
        let transitioned = self
            .dal
            .checkins()
            .transition(user_id, CheckinStatus::Sent, CheckinStatus::Completed)
            .await?;
        if transitioned {
            debug!(user_id, "Check-in reply recorded");
        }
        Ok(transitioned)
    }

    /// Current check-in state for the user.
    pub async fn get(&self, user_id: &str) -> Result<Option<Checkin>, SchedulerError> {
        Ok(self.dal.checkins().get(user_id).await?)
    }
}

/// Delivers a fired check-in to the user. Injected so the scheduler stays
/// independent of the delivery channel.
#[async_trait]
pub trait CheckinSender: Send + Sync {
    async fn send_checkin(&self, user_id: &str) -> Result<(), HandlerError>;
}

/// Job handler for [`CHECKIN_JOB_KIND`].
///
/// Fire-time guards, in order: the user's row must still be `Scheduled`,
/// and no user event may have arrived after the payload snapshot. A
/// check-in failing either guard resolves as suppressed, which completes
/// the job; it is not an error.
pub struct CheckinFireHandler<S: CheckinSender> {
    dal: DAL,
    sender: S,
}

impl<S: CheckinSender> CheckinFireHandler<S> {
    pub fn new(dal: DAL, sender: S) -> Self {
        Self { dal, sender }
    }
}

#[async_trait]
impl<S: CheckinSender> JobHandler for CheckinFireHandler<S> {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: CheckinPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::fatal(format!("malformed check-in payload: {}", e)))?;
        let user_id = &payload.user_id;

        let checkin = self
            .dal
            .checkins()
            .get(user_id)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;

        let Some(checkin) = checkin else {
            debug!(user_id, "Check-in fired for unknown user, suppressing");
            return Ok(serde_json::json!({ "sent": false, "reason": "no_state" }));
        };

        if checkin.status != CheckinStatus::Scheduled {
            debug!(user_id, status = %checkin.status, "Check-in no longer scheduled, suppressing");
            return Ok(serde_json::json!({ "sent": false, "reason": "not_scheduled" }));
        }

        if checkin.last_user_event_at > payload.last_user_event_at {
            // User activity since scheduling makes this check-in stale.
            self.dal
                .checkins()
                .transition(user_id, CheckinStatus::Scheduled, CheckinStatus::Cancelled)
                .await
                .map_err(|e| HandlerError::transient(e.to_string()))?;
            info!(user_id, "Check-in stale at fire time, cancelled");
            return Ok(serde_json::json!({ "sent": false, "reason": "stale" }));
        }

        self.sender.send_checkin(user_id).await?;

        self.dal
            .checkins()
            .transition(user_id, CheckinStatus::Scheduled, CheckinStatus::Sent)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;

        info!(user_id, "Check-in sent");
        Ok(serde_json::json!({ "sent": true }))
    }
}
