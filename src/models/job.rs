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

//! Job model: one durably queued unit of asynchronous work.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::error::StorageError;

/// Lifecycle status of a queued job.
///
/// `Queued -> Leased -> Completed`, or `Leased -> Queued` (retry after a
/// nack or a stalled lease), or `Leased -> Failed` (attempts exhausted or
/// terminal failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Leased,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Leased => "Leased",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "Queued" => Ok(JobStatus::Queued),
            "Leased" => Ok(JobStatus::Leased),
            "Completed" => Ok(JobStatus::Completed),
            "Failed" => Ok(JobStatus::Failed),
            other => Err(StorageError::InvalidValue(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durably queued job.
///
/// The job id doubles as the delivery-level idempotency key: enqueueing with
/// a reused id is a no-op, and the worker keys its handler-level idempotency
/// record off it as well. The payload is opaque to the queue; handlers
/// interpret it per [`kind`](Job::kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: UniversalUuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of delivery attempts so far (0 before the first lease).
    pub attempt: i32,
    pub max_attempts: i32,
    /// Deterministic lookup key for cancelable jobs (e.g. one per user).
    pub dedupe_key: Option<String>,
    /// Earliest time `lease()` may return this job.
    pub available_at: UniversalTimestamp,
    pub lease_expires_at: Option<UniversalTimestamp>,
    pub last_error: Option<String>,
    pub completed_at: Option<UniversalTimestamp>,
    pub created_at: UniversalTimestamp,
    pub updated_at: UniversalTimestamp,
}

/// A job to be inserted. Remaining columns are populated at enqueue time.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: UniversalUuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub available_at: UniversalTimestamp,
}
