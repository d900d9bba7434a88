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

//! Job DAL: persistence operations for the durable queue.

use diesel::prelude::*;

use super::models::{NewSqliteJob, SqliteJob};
use super::DAL;
use crate::database::universal_types::{
    current_timestamp_string, UniversalTimestamp, UniversalUuid,
};
use crate::error::{QueueError, StorageError};
use crate::models::{Job, JobStatus, NewJob};
use crate::queue::{NackOutcome, RetentionPolicy};
use crate::retry::BackoffPolicy;

/// Data access layer for job records.
#[derive(Clone)]
pub struct JobDAL<'a> {
    pub(crate) dal: &'a DAL,
}

impl<'a> JobDAL<'a> {
    /// Inserts a job unless one with the same id already exists.
    ///
    /// Returns `true` if the job was created, `false` if the id was a
    /// replay (queue-level enqueue idempotency).
    pub async fn insert_if_absent(&self, new_job: NewJob) -> Result<bool, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;

        let now = current_timestamp_string();
        let row = NewSqliteJob {
            id: new_job.id.to_blob(),
            kind: new_job.kind,
            payload: serde_json::to_string(&new_job.payload).map_err(StorageError::from)?,
            status: JobStatus::Queued.as_str().to_string(),
            attempt: 0,
            max_attempts: new_job.max_attempts,
            dedupe_key: new_job.dedupe_key,
            available_at: new_job.available_at.to_rfc3339(),
            created_at: now.clone(),
            updated_at: now,
        };

        let inserted = conn
            .interact(move |conn| {
                diesel::insert_into(jobs::table)
                    .values(&row)
                    .on_conflict(jobs::id)
                    .do_nothing()
                    .execute(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        Ok(inserted > 0)
    }

    /// Retrieves a job by id.
    pub async fn get_by_id(&self, id: UniversalUuid) -> Result<Option<Job>, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;
        let id_blob = id.to_blob();

        let row: Option<SqliteJob> = conn
            .interact(move |conn| {
                jobs::table
                    .find(id_blob)
                    .select(SqliteJob::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        row.map(Job::try_from)
            .transpose()
            .map_err(QueueError::Storage)
    }

    /// Atomically claims the next eligible job.
    ///
    /// Finds the oldest `Queued` job whose delivery time has passed, then
    /// flips it to `Leased` with a status double-check in the same
    /// transaction so two pollers cannot claim the same job.
    pub async fn claim_next(
        &self,
        lease_duration: chrono::Duration,
    ) -> Result<Option<Job>, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;

        let row: Option<SqliteJob> = conn
            .interact(move |conn| -> Result<Option<SqliteJob>, diesel::result::Error> {
                conn.immediate_transaction(|conn| {
                    let now = current_timestamp_string();

                    let ready: Option<SqliteJob> = jobs::table
                        .filter(jobs::status.eq(JobStatus::Queued.as_str()))
                        .filter(jobs::available_at.le(&now))
                        .order(jobs::available_at.asc())
                        .select(SqliteJob::as_select())
                        .first(conn)
                        .optional()?;

                    let Some(job) = ready else {
                        return Ok(None);
                    };

                    let lease_expires =
                        (UniversalTimestamp::now() + lease_duration).to_rfc3339();

                    let claimed: Option<SqliteJob> = diesel::update(jobs::table)
                        .filter(jobs::id.eq(job.id))
                        .filter(jobs::status.eq(JobStatus::Queued.as_str()))
                        .set((
                            jobs::status.eq(JobStatus::Leased.as_str()),
                            jobs::lease_expires_at.eq(Some(lease_expires)),
                            jobs::updated_at.eq(&now),
                        ))
                        .returning(SqliteJob::as_returning())
                        .get_result(conn)
                        .optional()?;

                    Ok(claimed)
                })
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        row.map(Job::try_from)
            .transpose()
            .map_err(QueueError::Storage)
    }

    /// Marks a job completed and applies the retention policy.
    ///
    /// Tolerant of a late ack from a worker whose lease already stalled and
    /// was released (the job may be `Queued` again); acking an already
    /// completed job is a no-op, while acking a failed job is an
    /// `InvalidState` error. Both writes and the retention purge run in one
    /// transaction.
    pub async fn mark_completed(
        &self,
        id: UniversalUuid,
        retention: RetentionPolicy,
    ) -> Result<(), QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;
        let id_blob = id.to_blob();

        conn.interact(move |conn| -> Result<(), QueueError> {
            conn.immediate_transaction(|conn| {
                let now = current_timestamp_string();

                let status: Option<String> = jobs::table
                    .find(&id_blob)
                    .select(jobs::status)
                    .first(conn)
                    .optional()?;
                let status = status.ok_or(QueueError::JobNotFound(id.0))?;
                if status == JobStatus::Failed.as_str() {
                    return Err(QueueError::InvalidState {
                        job_id: id.0,
                        status,
                        operation: "ack",
                    });
                }

                diesel::update(jobs::table)
                    .filter(jobs::id.eq(&id_blob))
                    .filter(jobs::status.eq_any(vec![
                        JobStatus::Leased.as_str(),
                        JobStatus::Queued.as_str(),
                    ]))
                    .set((
                        jobs::status.eq(JobStatus::Completed.as_str()),
                        jobs::completed_at.eq(Some(now.clone())),
                        jobs::lease_expires_at.eq(None::<String>),
                        jobs::updated_at.eq(&now),
                    ))
                    .execute(conn)?;

                purge_retained(conn, &retention)?;

                Ok(())
            })
        })
        .await
        .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// Increments the attempt count; if attempts remain, reschedules the
    /// job with exponential backoff, otherwise marks it permanently failed
    /// (retained for the longer observability window).
    pub async fn fail_attempt(
        &self,
        id: UniversalUuid,
        error: String,
        backoff: BackoffPolicy,
    ) -> Result<NackOutcome, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;
        let id_blob = id.to_blob();

        let outcome = conn
            .interact(move |conn| -> Result<NackOutcome, QueueError> {
                conn.immediate_transaction(|conn| {
                    let now = UniversalTimestamp::now();
                    let now_str = now.to_rfc3339();

                    let job: SqliteJob = jobs::table
                        .find(&id_blob)
                        .select(SqliteJob::as_select())
                        .first(conn)
                        .optional()?
                        .ok_or(QueueError::JobNotFound(id.0))?;

                    let attempt = job.attempt + 1;

                    if attempt < job.max_attempts {
                        let delay = backoff.delay_for(attempt as u32);
                        let retry_at = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::days(365));

                        diesel::update(jobs::table.filter(jobs::id.eq(&id_blob)))
                            .set((
                                jobs::status.eq(JobStatus::Queued.as_str()),
                                jobs::attempt.eq(attempt),
                                jobs::available_at.eq(retry_at.to_rfc3339()),
                                jobs::last_error.eq(Some(&error)),
                                jobs::lease_expires_at.eq(None::<String>),
                                jobs::updated_at.eq(&now_str),
                            ))
                            .execute(conn)?;

                        Ok(NackOutcome::Retry { attempt, retry_at })
                    } else {
                        diesel::update(jobs::table.filter(jobs::id.eq(&id_blob)))
                            .set((
                                jobs::status.eq(JobStatus::Failed.as_str()),
                                jobs::attempt.eq(attempt),
                                jobs::last_error.eq(Some(&error)),
                                jobs::completed_at.eq(Some(now_str.clone())),
                                jobs::lease_expires_at.eq(None::<String>),
                                jobs::updated_at.eq(&now_str),
                            ))
                            .execute(conn)?;

                        Ok(NackOutcome::Exhausted { attempt })
                    }
                })
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(outcome)
    }

    /// Marks a job permanently failed without consuming further retries.
    pub async fn mark_failed(&self, id: UniversalUuid, error: String) -> Result<(), QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;
        let id_blob = id.to_blob();

        let updated = conn
            .interact(move |conn| {
                let now = current_timestamp_string();
                diesel::update(jobs::table.filter(jobs::id.eq(&id_blob)))
                    .set((
                        jobs::status.eq(JobStatus::Failed.as_str()),
                        jobs::last_error.eq(Some(&error)),
                        jobs::completed_at.eq(Some(now.clone())),
                        jobs::lease_expires_at.eq(None::<String>),
                        jobs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        if updated == 0 {
            return Err(QueueError::JobNotFound(id.0));
        }
        Ok(())
    }

    /// Returns expired leases to the pool.
    ///
    /// A lease that was neither acked nor nacked within its window is
    /// stalled; the job goes back to `Queued` for re-lease. The attempt
    /// count is not incremented — a stall is not a recorded failure.
    pub async fn release_stalled(&self) -> Result<usize, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;

        let released = conn
            .interact(move |conn| {
                let now = current_timestamp_string();
                diesel::update(jobs::table)
                    .filter(jobs::status.eq(JobStatus::Leased.as_str()))
                    .filter(jobs::lease_expires_at.lt(&now))
                    .set((
                        jobs::status.eq(JobStatus::Queued.as_str()),
                        jobs::lease_expires_at.eq(None::<String>),
                        jobs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        Ok(released)
    }

    /// Finds a still-queued job by its deterministic dedupe key.
    pub async fn find_queued_by_dedupe_key(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<Job>, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;
        let key = dedupe_key.to_string();

        let row: Option<SqliteJob> = conn
            .interact(move |conn| {
                jobs::table
                    .filter(jobs::dedupe_key.eq(Some(key)))
                    .filter(jobs::status.eq(JobStatus::Queued.as_str()))
                    .select(SqliteJob::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        row.map(Job::try_from)
            .transpose()
            .map_err(QueueError::Storage)
    }

    /// Deletes still-queued jobs with the given dedupe key.
    ///
    /// Tolerant of the job having already fired or never existing; returns
    /// the number of jobs removed.
    pub async fn delete_queued_by_dedupe_key(&self, dedupe_key: &str) -> Result<usize, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;
        let key = dedupe_key.to_string();

        let deleted = conn
            .interact(move |conn| {
                diesel::delete(
                    jobs::table
                        .filter(jobs::dedupe_key.eq(Some(key)))
                        .filter(jobs::status.eq(JobStatus::Queued.as_str())),
                )
                .execute(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        Ok(deleted)
    }

    /// Applies the retention policy outside the ack path (recovery sweep).
    pub async fn purge_retained(&self, retention: RetentionPolicy) -> Result<usize, QueueError> {
        let conn = self.dal.database.get_connection().await?;

        let purged = conn
            .interact(move |conn| -> Result<usize, diesel::result::Error> {
                conn.immediate_transaction(|conn| purge_retained(conn, &retention))
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        Ok(purged)
    }

    /// Counts jobs by status (observability).
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64, QueueError> {
        use crate::database::schema::jobs;

        let conn = self.dal.database.get_connection().await?;

        let count: i64 = conn
            .interact(move |conn| {
                jobs::table
                    .filter(jobs::status.eq(status.as_str()))
                    .count()
                    .get_result(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        Ok(count)
    }
}

/// Deletes completed jobs past the retention window (keeping the most
/// recent N regardless of age) and failed jobs past the longer window.
fn purge_retained(
    conn: &mut diesel::sqlite::SqliteConnection,
    retention: &RetentionPolicy,
) -> Result<usize, diesel::result::Error> {
    use crate::database::schema::jobs;

    let now = UniversalTimestamp::now();
    let cutoff = |ttl: std::time::Duration| {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        UniversalTimestamp(now.0 - ttl).to_rfc3339()
    };
    let completed_cutoff = cutoff(retention.completed_ttl);
    let failed_cutoff = cutoff(retention.failed_ttl);

    let keep: Vec<Vec<u8>> = jobs::table
        .filter(jobs::status.eq(JobStatus::Completed.as_str()))
        .order(jobs::completed_at.desc())
        .limit(retention.keep_last)
        .select(jobs::id)
        .load(conn)?;

    let mut purged = diesel::delete(
        jobs::table
            .filter(jobs::status.eq(JobStatus::Completed.as_str()))
            .filter(jobs::completed_at.lt(completed_cutoff))
            .filter(jobs::id.ne_all(keep)),
    )
    .execute(conn)?;

    purged += diesel::delete(
        jobs::table
            .filter(jobs::status.eq(JobStatus::Failed.as_str()))
            .filter(jobs::completed_at.lt(failed_cutoff)),
    )
    .execute(conn)?;

    Ok(purged)
}
