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

//! Database-backed sliding-window limiter.

use std::time::Duration;

use tracing::debug;

use crate::dal::DAL;
use crate::error::LimiterError;

/// Current consumption under a limiter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
}

/// Hard ceiling of `max_calls` per trailing `window`, shared across every
/// process pointed at the same database.
///
/// Admission is strict: eviction, count, and the event insert happen in one
/// write transaction, so concurrent callers across processes cannot
/// overshoot the limit. There is no queueing; a denied caller retries via
/// the job backoff path.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    dal: DAL,
    key: String,
    max_calls: i64,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(dal: DAL, key: impl Into<String>, max_calls: i64, window: Duration) -> Self {
        Self {
            dal,
            key: key.into(),
            max_calls,
            window,
        }
    }

    /// Records one call if the window has room. Returns `true` if admitted.
    pub async fn try_acquire(&self) -> Result<bool, LimiterError> {
        let admitted = self
            .dal
            .rate_window()
            .try_acquire(&self.key, self.max_calls, self.window)
            .await?;
        if !admitted {
            debug!(key = %self.key, limit = self.max_calls, "Sliding window limit reached");
        }
        Ok(admitted)
    }

    /// Like [`try_acquire`](Self::try_acquire) but denial is an error, for
    /// callers that propagate rather than branch.
    pub async fn acquire(&self) -> Result<(), LimiterError> {
        if self.try_acquire().await? {
            Ok(())
        } else {
            Err(LimiterError::RateLimitExceeded {
                key: self.key.clone(),
                max_wait_ms: 0,
            })
        }
    }

    /// Reports current usage without consuming a slot.
    pub async fn usage(&self) -> Result<WindowUsage, LimiterError> {
        let used = self
            .dal
            .rate_window()
            .count_in_window(&self.key, self.window)
            .await?;
        Ok(WindowUsage {
            used,
            limit: self.max_calls,
            remaining: (self.max_calls - used).max(0),
        })
    }
}
