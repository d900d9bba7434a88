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

//! Event dispatcher: the ingress seam between event delivery and the
//! queue.
//!
//! The event id becomes the job id, so a delivery retry from upstream
//! collapses into the existing job instead of enqueueing a duplicate. The
//! dispatcher does no processing of its own; everything interesting
//! happens in the handlers.

use serde_json::Value;
use tracing::debug;

use crate::database::universal_types::UniversalUuid;
use crate::error::SchedulerError;
use crate::queue::{DurableQueue, EnqueueOptions};
use crate::relay::{RelayPayload, RELAY_JOB_KIND};
use crate::scheduler::CheckinScheduler;

/// An inbound user event.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Upstream delivery id; doubles as the job id.
    pub id: UniversalUuid,
    pub user_id: String,
    pub action: String,
    pub input: Value,
}

/// Routes inbound events onto the durable queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: DurableQueue,
    scheduler: CheckinScheduler,
}

impl Dispatcher {
    pub fn new(queue: DurableQueue, scheduler: CheckinScheduler) -> Self {
        Self { queue, scheduler }
    }

    /// Accepts one event: records the user activity (which makes any
    /// pending check-in stale) and enqueues the relay job.
    ///
    /// Returns `true` if the event was new, `false` for an upstream
    /// redelivery.
    pub async fn dispatch(&self, event: InboundEvent) -> Result<bool, SchedulerError> {
        self.scheduler.record_user_event(&event.user_id).await?;

        let payload = RelayPayload {
            user_id: event.user_id.clone(),
            action: event.action.clone(),
            input: event.input,
        };

        let created = self
            .queue
            .enqueue(
                RELAY_JOB_KIND,
                serde_json::to_value(&payload).map_err(crate::error::StorageError::from)?,
                EnqueueOptions {
                    id: event.id,
                    ..Default::default()
                },
            )
            .await?;

        if !created {
            debug!(event_id = %event.id, "Duplicate event delivery absorbed");
        }
        Ok(created)
    }

    /// Accepts a user's reply to a fired check-in.
    pub async fn dispatch_checkin_reply(&self, user_id: &str) -> Result<bool, SchedulerError> {
        self.scheduler.record_user_event(user_id).await?;
        self.scheduler.mark_replied(user_id).await
    }
}
