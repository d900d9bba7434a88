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

//! # Weir
//!
//! Resource-controlled asynchronous job processing over SQLite.
//!
//! Weir turns inbound events into durable jobs and runs them through a
//! pipeline of resource controls: a credit ledger with two-phase spend, a
//! local token bucket plus a shared sliding-window rate limit, and a
//! cancelable delayed-task scheduler for follow-ups.
//!
//! ## Core pieces
//!
//! - **[`queue::DurableQueue`]** — persistent job queue with at-least-once
//!   delivery, leases, exponential backoff with jitter, and retention of
//!   terminal jobs.
//! - **[`worker::WorkerPool`]** — polls the queue and runs registered
//!   [`worker::JobHandler`]s under a concurrency limit, deduplicating
//!   redelivered work through idempotency records.
//! - **[`ledger::CreditLedger`]** — per-user credit balances with
//!   reserve/confirm/cancel semantics over an append-only transaction log.
//! - **[`limiter`]** — [`limiter::TokenBucket`] for in-process pacing and
//!   [`limiter::SlidingWindowLimiter`] for a database-backed hard ceiling.
//! - **[`scheduler::CheckinScheduler`]** — delayed check-ins that can be
//!   cancelled or superseded, with a fire-time freshness check.
//! - **[`relay::RelayHandler`]** — the handler wiring all of the above
//!   around an injected [`relay::GenerationBackend`].
//! - **[`dispatcher::Dispatcher`]** — ingress seam mapping event ids to
//!   job ids so upstream redeliveries collapse.
//!
//! ## Delivery semantics
//!
//! Delivery is at-least-once: a worker that dies mid-job loses its lease
//! and the job is redelivered. Effects are made effectively-once by
//! layering idempotency on top — enqueue is idempotent on the job id,
//! completed work is recorded so redelivery acks without re-running, and
//! ledger operations replay by idempotency key. The one acknowledged gap
//! is an external side effect that completed right before a crash; such a
//! call can happen twice.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use weir::config::WeirConfig;
//! use weir::dal::DAL;
//! use weir::database::Database;
//! use weir::queue::DurableQueue;
//! use weir::worker::{HandlerRegistry, WorkerPool};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WeirConfig::from_env();
//! let database = Database::new(&config.database_url, 10);
//! database.run_migrations().await?;
//!
//! let dal = DAL::new(database);
//! let queue = DurableQueue::new(dal.clone(), config.queue.clone());
//! let registry = HandlerRegistry::new();
//! // registry.register(...) your handlers
//!
//! let pool = WorkerPool::new(queue, dal, registry, config.worker.clone());
//! pool.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dal;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod models;
pub mod queue;
pub mod relay;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use config::WeirConfig;
pub use dal::DAL;
pub use database::Database;
pub use dispatcher::{Dispatcher, InboundEvent};
pub use error::{
    HandlerError, LedgerError, LimiterError, QueueError, SchedulerError, StorageError, WorkerError,
};
pub use ledger::{CreditCostResolver, CreditLedger, ReservationOutcome};
pub use limiter::{SlidingWindowLimiter, TokenBucket};
pub use models::{Job, JobStatus};
pub use queue::{DurableQueue, EnqueueOptions, NackOutcome, QueueConfig, RetentionPolicy};
pub use relay::{GenerationBackend, RelayConfig, RelayHandler, RelayPayload};
pub use retry::BackoffPolicy;
pub use scheduler::{CheckinFireHandler, CheckinScheduler, CheckinSender};
pub use worker::{HandlerRegistry, JobHandler, WorkerConfig, WorkerPool};
