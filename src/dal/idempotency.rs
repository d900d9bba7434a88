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

//! Idempotency record DAL.
//!
//! Records are keyed by caller-supplied string and carry a TTL. A record
//! past its `expires_at` is treated as absent on read and reclaimed by the
//! periodic purge.

use diesel::prelude::*;
use std::time::Duration;

use super::models::{NewSqliteIdempotencyRecord, SqliteIdempotencyRecord};
use super::DAL;
use crate::database::universal_types::current_timestamp;
use crate::error::StorageError;
use crate::models::IdempotencyRecord;

/// Data access layer for idempotency records.
#[derive(Clone)]
pub struct IdempotencyDAL<'a> {
    pub(crate) dal: &'a DAL,
}

impl<'a> IdempotencyDAL<'a> {
    /// Returns the record for `key` if one exists and has not expired.
    pub async fn get_valid(&self, key: &str) -> Result<Option<IdempotencyRecord>, StorageError> {
        use crate::database::schema::idempotency_records;

        let conn = self.dal.database.get_connection().await?;
        let key = key.to_string();
        let now = current_timestamp().to_rfc3339();

        let row: Option<SqliteIdempotencyRecord> = conn
            .interact(move |conn| {
                idempotency_records::table
                    .find(key)
                    .filter(idempotency_records::expires_at.gt(now))
                    .select(SqliteIdempotencyRecord::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        row.map(IdempotencyRecord::try_from).transpose()
    }

    /// Stores the result for `key`, valid for `ttl`. First write wins: a
    /// replayed store against a live record leaves the original in place.
    /// An expired record under the same key is overwritten.
    pub async fn put(
        &self,
        key: &str,
        result: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        use crate::database::schema::idempotency_records;

        let conn = self.dal.database.get_connection().await?;
        let now = current_timestamp();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let record = NewSqliteIdempotencyRecord {
            key: key.to_string(),
            result: serde_json::to_string(result)?,
            expires_at: (now + ttl).to_rfc3339(),
            created_at: now.to_rfc3339(),
        };
        let now_str = now.to_rfc3339();

        conn.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let live: Option<String> = idempotency_records::table
                    .find(&record.key)
                    .select(idempotency_records::expires_at)
                    .first(conn)
                    .optional()?;

                match live {
                    Some(expires) if expires > now_str => Ok(0),
                    Some(_) => diesel::replace_into(idempotency_records::table)
                        .values(&record)
                        .execute(conn),
                    None => diesel::insert_into(idempotency_records::table)
                        .values(&record)
                        .execute(conn),
                }
            })
        })
        .await
        .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Deletes all expired records, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        use crate::database::schema::idempotency_records;

        let conn = self.dal.database.get_connection().await?;
        let now = current_timestamp().to_rfc3339();

        let deleted = conn
            .interact(move |conn| {
                diesel::delete(
                    idempotency_records::table.filter(idempotency_records::expires_at.le(now)),
                )
                .execute(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(deleted)
    }
}
