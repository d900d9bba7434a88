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

//! Error types for all weir subsystems.
//!
//! Each layer has its own error enum; lower-layer errors are wrapped rather
//! than flattened so callers can distinguish a storage fault from a domain
//! rule. Invariant violations (e.g. confirming a cancelled reservation) are
//! their own variants: they indicate a programming fault, are logged loudly
//! at the call site, and abort the surrounding transaction.

use thiserror::Error;
use uuid::Uuid;

/// Errors from the persistence layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection pool checkout or interact failure.
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    /// Diesel query error.
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Migration failure at startup.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A BLOB column did not contain a valid UUID.
    #[error("Invalid UUID in database: {0}")]
    Uuid(#[from] uuid::Error),

    /// A TEXT column did not contain a valid RFC3339 timestamp.
    #[error("Invalid timestamp in database: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// Payload or result (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A status column held a value outside its state machine.
    #[error("Invalid value in database: {0}")]
    InvalidValue(String),
}

/// Errors from the durable queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// The job is not in a state that permits the requested operation
    /// (e.g. acking a job that was never leased).
    #[error("Job {job_id} is {status}, cannot {operation}")]
    InvalidState {
        job_id: Uuid,
        status: String,
        operation: &'static str,
    },
}

impl From<diesel::result::Error> for QueueError {
    fn from(e: diesel::result::Error) -> Self {
        QueueError::Storage(StorageError::Database(e))
    }
}

/// Errors from the credit reservation ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    /// Invariant violation: the transaction status machine only moves
    /// forward (`Reserved -> Confirmed` or `Reserved -> Cancelled`).
    #[error("Reservation {reservation_id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        reservation_id: Uuid,
        from: String,
        to: &'static str,
    },

    /// Invariant violation: confirming this reservation would drive the
    /// balance below zero. The surrounding transaction is rolled back.
    #[error("Confirming reservation for {user_id} would underflow balance ({balance} - {amount})")]
    BalanceUnderflow {
        user_id: String,
        balance: i64,
        amount: i64,
    },
}

impl From<diesel::result::Error> for LedgerError {
    fn from(e: diesel::result::Error) -> Self {
        LedgerError::Storage(StorageError::Database(e))
    }
}

/// Errors from the rate limiters.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// No permit became available within the configured maximum wait.
    #[error("Rate limit exceeded for '{key}' (waited up to {max_wait_ms}ms)")]
    RateLimitExceeded { key: String, max_wait_ms: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the delayed-task scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors surfaced by job handlers, classified for the retry path.
///
/// `Transient` failures propagate as a nack and go through the queue's
/// backoff/retry cycle; `Fatal` failures are terminal and do not consume
/// further attempts.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure: timeout, connection reset, upstream 429/502/503.
    #[error("Transient handler failure: {message}")]
    Transient { message: String },

    /// Non-retryable business failure: validation, not-found, unauthorized,
    /// insufficient resource.
    #[error("Fatal handler failure: {message}")]
    Fatal { message: String },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient { .. })
    }
}

/// Errors from the worker pool runtime.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Worker semaphore closed: {0}")]
    Semaphore(#[from] tokio::sync::AcquireError),
}
