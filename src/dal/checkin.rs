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

//! Check-in state DAL.
//!
//! One row per user. Transitions are gated on the current status inside an
//! `immediate_transaction` so a concurrent cancel and fire cannot both win.

use diesel::prelude::*;

use super::models::{NewSqliteCheckin, SqliteCheckin};
use super::DAL;
use crate::database::universal_types::{current_timestamp_string, UniversalTimestamp};
use crate::error::StorageError;
use crate::models::{Checkin, CheckinStatus};

/// Data access layer for per-user check-in state.
#[derive(Clone)]
pub struct CheckinDAL<'a> {
    pub(crate) dal: &'a DAL,
}

impl<'a> CheckinDAL<'a> {
    /// Returns the user's check-in row, if any.
    pub async fn get(&self, user_id: &str) -> Result<Option<Checkin>, StorageError> {
        use crate::database::schema::checkins;

        let conn = self.dal.database.get_connection().await?;
        let user = user_id.to_string();

        let row: Option<SqliteCheckin> = conn
            .interact(move |conn| {
                checkins::table
                    .find(user)
                    .select(SqliteCheckin::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        row.map(Checkin::try_from).transpose()
    }

    /// Moves the user to `Scheduled` for the given fire time, creating the
    /// row if needed. Any prior status is overwritten; the caller cancels
    /// the prior queued job first.
    pub async fn upsert_scheduled(
        &self,
        user_id: &str,
        scheduled_for: UniversalTimestamp,
    ) -> Result<(), StorageError> {
        use crate::database::schema::checkins;

        let conn = self.dal.database.get_connection().await?;
        let now = current_timestamp_string();
        let record = NewSqliteCheckin {
            user_id: user_id.to_string(),
            status: CheckinStatus::Scheduled.as_str().to_string(),
            scheduled_for: Some(scheduled_for.to_rfc3339()),
            last_user_event_at: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        conn.interact(move |conn| {
            diesel::insert_into(checkins::table)
                .values(&record)
                .on_conflict(checkins::user_id)
                .do_update()
                .set((
                    checkins::status.eq(CheckinStatus::Scheduled.as_str()),
                    checkins::scheduled_for.eq(record.scheduled_for.clone()),
                    checkins::updated_at.eq(&now),
                ))
                .execute(conn)
        })
        .await
        .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Conditionally transitions `from -> to`, returning true if the row
    /// was in `from` and the transition applied.
    pub async fn transition(
        &self,
        user_id: &str,
        from: CheckinStatus,
        to: CheckinStatus,
    ) -> Result<bool, StorageError> {
        use crate::database::schema::checkins;

        let conn = self.dal.database.get_connection().await?;
        let user = user_id.to_string();
        let now = current_timestamp_string();

        let updated = conn
            .interact(move |conn| {
                conn.immediate_transaction(|conn| {
                    diesel::update(
                        checkins::table
                            .find(&user)
                            .filter(checkins::status.eq(from.as_str())),
                    )
                    .set((
                        checkins::status.eq(to.as_str()),
                        checkins::updated_at.eq(&now),
                    ))
                    .execute(conn)
                })
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(updated > 0)
    }

    /// Records a user-originated event. The fire-time freshness check
    /// compares against this timestamp; creates the row if needed.
    pub async fn record_user_event(
        &self,
        user_id: &str,
        at: UniversalTimestamp,
    ) -> Result<(), StorageError> {
        use crate::database::schema::checkins;

        let conn = self.dal.database.get_connection().await?;
        let now = current_timestamp_string();
        let at_str = at.to_rfc3339();
        let record = NewSqliteCheckin {
            user_id: user_id.to_string(),
            status: CheckinStatus::NotScheduled.as_str().to_string(),
            scheduled_for: None,
            last_user_event_at: Some(at_str.clone()),
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        conn.interact(move |conn| {
            diesel::insert_into(checkins::table)
                .values(&record)
                .on_conflict(checkins::user_id)
                .do_update()
                .set((
                    checkins::last_user_event_at.eq(Some(&at_str)),
                    checkins::updated_at.eq(&now),
                ))
                .execute(conn)
        })
        .await
        .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(())
    }
}
