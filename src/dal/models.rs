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

//! SQLite row models.
//!
//! Diesel model definitions using SQLite-compatible types: UUIDs as BLOB
//! (`Vec<u8>`), timestamps as TEXT (RFC3339 strings). These are internal to
//! the DAL and converted to/from the domain models at its boundary.

use diesel::prelude::*;

use crate::database::schema::*;
use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::error::StorageError;
use crate::models::{
    Checkin, CheckinStatus, CreditAccount, CreditTransaction, IdempotencyRecord, Job, JobStatus,
    TransactionStatus,
};

fn parse_opt_ts(value: Option<String>) -> Result<Option<UniversalTimestamp>, StorageError> {
    value
        .map(|s| UniversalTimestamp::from_rfc3339(&s))
        .transpose()
        .map_err(Into::into)
}

// ============================================================================
// Job Models
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteJob {
    pub id: Vec<u8>,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub available_at: String,
    pub lease_expires_at: Option<String>,
    pub last_error: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewSqliteJob {
    pub id: Vec<u8>,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub available_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SqliteJob> for Job {
    type Error = StorageError;

    fn try_from(row: SqliteJob) -> Result<Self, Self::Error> {
        Ok(Job {
            id: UniversalUuid::from_bytes(&row.id)?,
            kind: row.kind,
            payload: serde_json::from_str(&row.payload)?,
            status: JobStatus::parse(&row.status)?,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            dedupe_key: row.dedupe_key,
            available_at: UniversalTimestamp::from_rfc3339(&row.available_at)?,
            lease_expires_at: parse_opt_ts(row.lease_expires_at)?,
            last_error: row.last_error,
            completed_at: parse_opt_ts(row.completed_at)?,
            created_at: UniversalTimestamp::from_rfc3339(&row.created_at)?,
            updated_at: UniversalTimestamp::from_rfc3339(&row.updated_at)?,
        })
    }
}

// ============================================================================
// Idempotency Models
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = idempotency_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteIdempotencyRecord {
    pub key: String,
    pub result: String,
    pub expires_at: String,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = idempotency_records)]
pub struct NewSqliteIdempotencyRecord {
    pub key: String,
    pub result: String,
    pub expires_at: String,
    pub created_at: String,
}

impl TryFrom<SqliteIdempotencyRecord> for IdempotencyRecord {
    type Error = StorageError;

    fn try_from(row: SqliteIdempotencyRecord) -> Result<Self, Self::Error> {
        Ok(IdempotencyRecord {
            key: row.key,
            result: serde_json::from_str(&row.result)?,
            expires_at: UniversalTimestamp::from_rfc3339(&row.expires_at)?,
            created_at: UniversalTimestamp::from_rfc3339(&row.created_at)?,
        })
    }
}

// ============================================================================
// Credit Models
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = credit_accounts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteCreditAccount {
    pub user_id: String,
    pub balance: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = credit_accounts)]
pub struct NewSqliteCreditAccount {
    pub user_id: String,
    pub balance: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SqliteCreditAccount> for CreditAccount {
    type Error = StorageError;

    fn try_from(row: SqliteCreditAccount) -> Result<Self, Self::Error> {
        Ok(CreditAccount {
            user_id: row.user_id,
            balance: row.balance,
            created_at: UniversalTimestamp::from_rfc3339(&row.created_at)?,
            updated_at: UniversalTimestamp::from_rfc3339(&row.updated_at)?,
        })
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = credit_transactions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteCreditTransaction {
    pub id: Vec<u8>,
    pub user_id: String,
    pub amount: i64,
    pub action: String,
    pub status: String,
    pub idempotency_key: String,
    pub created_at: String,
    pub confirmed_at: Option<String>,
    pub cancelled_at: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = credit_transactions)]
pub struct NewSqliteCreditTransaction {
    pub id: Vec<u8>,
    pub user_id: String,
    pub amount: i64,
    pub action: String,
    pub status: String,
    pub idempotency_key: String,
    pub created_at: String,
    pub confirmed_at: Option<String>,
    pub cancelled_at: Option<String>,
}

impl TryFrom<SqliteCreditTransaction> for CreditTransaction {
    type Error = StorageError;

    fn try_from(row: SqliteCreditTransaction) -> Result<Self, Self::Error> {
        Ok(CreditTransaction {
            id: UniversalUuid::from_bytes(&row.id)?,
            user_id: row.user_id,
            amount: row.amount,
            action: row.action,
            status: TransactionStatus::parse(&row.status)?,
            idempotency_key: row.idempotency_key,
            created_at: UniversalTimestamp::from_rfc3339(&row.created_at)?,
            confirmed_at: parse_opt_ts(row.confirmed_at)?,
            cancelled_at: parse_opt_ts(row.cancelled_at)?,
        })
    }
}

// ============================================================================
// Checkin Models
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = checkins)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteCheckin {
    pub user_id: String,
    pub status: String,
    pub scheduled_for: Option<String>,
    pub last_user_event_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = checkins)]
pub struct NewSqliteCheckin {
    pub user_id: String,
    pub status: String,
    pub scheduled_for: Option<String>,
    pub last_user_event_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SqliteCheckin> for Checkin {
    type Error = StorageError;

    fn try_from(row: SqliteCheckin) -> Result<Self, Self::Error> {
        Ok(Checkin {
            user_id: row.user_id,
            status: CheckinStatus::parse(&row.status)?,
            scheduled_for: parse_opt_ts(row.scheduled_for)?,
            last_user_event_at: parse_opt_ts(row.last_user_event_at)?,
            created_at: UniversalTimestamp::from_rfc3339(&row.created_at)?,
            updated_at: UniversalTimestamp::from_rfc3339(&row.updated_at)?,
        })
    }
}

// ============================================================================
// Rate Limit Event Models
// ============================================================================

#[derive(Debug, Insertable)]
#[diesel(table_name = rate_limit_events)]
pub struct NewSqliteRateLimitEvent {
    pub limiter_key: String,
    pub called_at: String,
}
