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

//! Sliding-window rate limit event DAL.
//!
//! Each admitted call is one row under a limiter key. Admission evicts
//! events older than the window, counts the survivors, and inserts only if
//! under the limit, all in one `immediate_transaction` so concurrent
//! callers cannot both take the last slot.

use diesel::prelude::*;
use std::time::Duration;

use super::models::NewSqliteRateLimitEvent;
use super::DAL;
use crate::database::universal_types::{current_timestamp, UniversalTimestamp};
use crate::error::StorageError;

/// Data access layer for rate limit events.
#[derive(Clone)]
pub struct RateWindowDAL<'a> {
    pub(crate) dal: &'a DAL,
}

impl<'a> RateWindowDAL<'a> {
    /// Attempts to record one call under `key` with at most `max_calls` in
    /// the trailing `window`. Returns true if admitted.
    pub async fn try_acquire(
        &self,
        key: &str,
        max_calls: i64,
        window: Duration,
    ) -> Result<bool, StorageError> {
        use crate::database::schema::rate_limit_events;

        let conn = self.dal.database.get_connection().await?;
        let key = key.to_string();
        let now = current_timestamp();
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = UniversalTimestamp(now.0 - window).to_rfc3339();
        let now_str = now.to_rfc3339();

        let admitted = conn
            .interact(move |conn| {
                conn.immediate_transaction(|conn| {
                    diesel::delete(
                        rate_limit_events::table
                            .filter(rate_limit_events::limiter_key.eq(&key))
                            .filter(rate_limit_events::called_at.lt(&cutoff)),
                    )
                    .execute(conn)?;

                    let used: i64 = rate_limit_events::table
                        .filter(rate_limit_events::limiter_key.eq(&key))
                        .count()
                        .get_result(conn)?;

                    if used >= max_calls {
                        return Ok::<bool, diesel::result::Error>(false);
                    }

                    diesel::insert_into(rate_limit_events::table)
                        .values(&NewSqliteRateLimitEvent {
                            limiter_key: key.clone(),
                            called_at: now_str.clone(),
                        })
                        .execute(conn)?;

                    Ok(true)
                })
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(admitted)
    }

    /// Counts events under `key` within the trailing `window`, without
    /// evicting or recording anything.
    pub async fn count_in_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<i64, StorageError> {
        use crate::database::schema::rate_limit_events;

        let conn = self.dal.database.get_connection().await?;
        let key = key.to_string();
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = UniversalTimestamp(current_timestamp().0 - window).to_rfc3339();

        let used = conn
            .interact(move |conn| {
                rate_limit_events::table
                    .filter(rate_limit_events::limiter_key.eq(&key))
                    .filter(rate_limit_events::called_at.ge(&cutoff))
                    .count()
                    .get_result(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(used)
    }
}
