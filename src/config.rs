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

//! Configuration.
//!
//! Everything has a working default; `WeirConfig::from_env` overlays
//! `WEIR_*` environment variables (a `.env` file is honored via dotenvy)
//! for the handful of values operators actually tune.

use std::time::Duration;

use crate::queue::QueueConfig;
use crate::relay::RelayConfig;
use crate::worker::WorkerConfig;

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Token bucket burst capacity.
    pub bucket_capacity: f64,
    /// Token bucket sustained rate, tokens per second.
    pub bucket_refill_rate: f64,
    /// Sliding window ceiling.
    pub window_max_calls: i64,
    /// Sliding window length.
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 5.0,
            bucket_refill_rate: 1.0,
            window_max_calls: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct WeirConfig {
    pub database_url: String,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub limiter: LimiterConfig,
    pub relay: RelayConfig,
}

impl Default for WeirConfig {
    fn default() -> Self {
        Self {
            database_url: "weir.db".to_string(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            limiter: LimiterConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl WeirConfig {
    /// Defaults overlaid with `WEIR_*` environment variables. Unparseable
    /// values fall back to the default rather than failing startup.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Ok(url) = std::env::var("WEIR_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(n) = env_parse::<usize>("WEIR_MAX_CONCURRENT_JOBS") {
            config.worker.max_concurrent_jobs = n;
        }
        if let Some(secs) = env_parse::<u64>("WEIR_LEASE_DURATION_SECS") {
            config.queue.lease_duration = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<i64>("WEIR_WINDOW_MAX_CALLS") {
            config.limiter.window_max_calls = n;
        }
        if let Some(secs) = env_parse::<u64>("WEIR_WINDOW_SECS") {
            config.limiter.window = Duration::from_secs(secs);
        }
        if let Some(rate) = env_parse::<f64>("WEIR_BUCKET_REFILL_RATE") {
            config.limiter.bucket_refill_rate = rate;
        }
        if let Some(capacity) = env_parse::<f64>("WEIR_BUCKET_CAPACITY") {
            config.limiter.bucket_capacity = capacity;
        }
        if let Some(secs) = env_parse::<u64>("WEIR_CHECKIN_DELAY_SECS") {
            config.relay.checkin_delay = Duration::from_secs(secs);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
