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

//! Retry backoff policy.
//!
//! Backoff is a pure function of the attempt count, independent of any
//! concurrency primitive; the queue applies it when rescheduling a nacked
//! job.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and optional full jitter.
///
/// `delay_for(n)` for attempt `n` (1-based) is `base * 2^(n-1)`, capped at
/// `cap`. With jitter enabled the delay is drawn uniformly from
/// `[delay, 2 * delay)`, which stays inside the next doubling step — a job
/// nacked on attempt 1 with base 1000ms becomes visible no earlier than
/// 1000ms and strictly before 2000ms.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(5 * 60),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay for the given attempt, before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << exponent;
        let delay = self
            .base
            .checked_mul(factor as u32)
            .unwrap_or(Duration::MAX);
        delay.min(self.cap)
    }

    /// Delay for the given attempt, with jitter applied if configured.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() || delay >= self.cap {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..1.0f64);
        (delay + delay.mul_f64(jitter)).min(self.cap)
    }
}
