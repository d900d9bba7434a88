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

//! Check-in model: per-user state for the delayed follow-up task.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::UniversalTimestamp;
use crate::error::StorageError;

/// State machine for a user's delayed check-in.
///
/// `NotScheduled -> Scheduled -> {Sent, Cancelled}`; `Sent -> Completed`
/// once the user's reply to the fired check-in is handled. A fired task can
/// also be suppressed at fire time (`Scheduled -> Cancelled`) by the
/// freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckinStatus {
    NotScheduled,
    Scheduled,
    Sent,
    Cancelled,
    Completed,
}

impl CheckinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckinStatus::NotScheduled => "NotScheduled",
            CheckinStatus::Scheduled => "Scheduled",
            CheckinStatus::Sent => "Sent",
            CheckinStatus::Cancelled => "Cancelled",
            CheckinStatus::Completed => "Completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "NotScheduled" => Ok(CheckinStatus::NotScheduled),
            "Scheduled" => Ok(CheckinStatus::Scheduled),
            "Sent" => Ok(CheckinStatus::Sent),
            "Cancelled" => Ok(CheckinStatus::Cancelled),
            "Completed" => Ok(CheckinStatus::Completed),
            other => Err(StorageError::InvalidValue(format!(
                "unknown checkin status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CheckinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-user check-in scheduling state. At most one row per user; at most
/// one may be `Scheduled` at any time by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkin {
    pub user_id: String,
    pub status: CheckinStatus,
    pub scheduled_for: Option<UniversalTimestamp>,
    /// Timestamp of the most recent user-originated event; the fire-time
    /// freshness check compares against this to suppress stale check-ins.
    pub last_user_event_at: Option<UniversalTimestamp>,
    pub created_at: UniversalTimestamp,
    pub updated_at: UniversalTimestamp,
}
