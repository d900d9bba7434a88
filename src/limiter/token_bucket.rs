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

//! In-process token bucket.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::LimiterError;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with continuous refill.
///
/// Tokens accrue at `refill_rate` per second up to `capacity`, so the
/// bucket allows bursts of up to `capacity` calls and a sustained rate of
/// `refill_rate`. State is a tokio mutex; waiting callers sleep outside
/// the lock, so they do not block concurrent acquires.
pub struct TokenBucket {
    name: String,
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket. `capacity` and `refill_rate` are clamped to
    /// be positive.
    pub fn new(name: impl Into<String>, capacity: f64, refill_rate: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            name: name.into(),
            capacity,
            refill_rate: refill_rate.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token if available, without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        Self::refill(&mut state, self.capacity, self.refill_rate);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Takes one token, sleeping until one accrues.
    ///
    /// Gives up with [`LimiterError::RateLimitExceeded`] if the wait would
    /// exceed `max_wait`. On failure no token is consumed and the caller's
    /// position is not reserved.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), LimiterError> {
        let deadline = Instant::now() + max_wait;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                Self::refill(&mut state, self.capacity, self.refill_rate);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                // Time for the missing fraction to accrue.
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
            };

            if Instant::now() + wait > deadline {
                debug!(
                    bucket = %self.name,
                    wait_ms = wait.as_millis() as u64,
                    "Token bucket wait exceeds deadline"
                );
                return Err(LimiterError::RateLimitExceeded {
                    key: self.name.clone(),
                    max_wait_ms: max_wait.as_millis() as u64,
                });
            }

            tokio::time::sleep(wait).await;
        }
    }

    fn refill(state: &mut BucketState, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(capacity);
        state.last_refill = now;
    }
}
