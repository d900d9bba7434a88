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

//! Ledger DAL: balances and the reservation transaction log.
//!
//! Every multi-row operation here runs inside `immediate_transaction`. The
//! balance column is only ever written from within these transactions, so a
//! confirm either applies both the decrement and the status flip or neither.

use diesel::prelude::*;

use super::models::{NewSqliteCreditAccount, NewSqliteCreditTransaction, SqliteCreditTransaction};
use super::DAL;
use crate::database::universal_types::{
    current_timestamp, current_timestamp_string, UniversalTimestamp, UniversalUuid,
};
use crate::error::{LedgerError, StorageError};
use crate::models::{CreditTransaction, TransactionStatus};

/// Result of a reservation attempt as recorded in the ledger.
#[derive(Debug, Clone)]
pub struct ReservationRow {
    pub transaction: CreditTransaction,
    /// Balance observed inside the reservation transaction.
    pub balance: i64,
    /// True when the idempotency key matched an existing row and no new
    /// side effect occurred.
    pub replayed: bool,
}

/// Data access layer for the credit ledger.
#[derive(Clone)]
pub struct LedgerDAL<'a> {
    pub(crate) dal: &'a DAL,
}

impl<'a> LedgerDAL<'a> {
    /// Returns the user's current balance (0 for unknown users).
    pub async fn get_balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        use crate::database::schema::credit_accounts;

        let conn = self.dal.database.get_connection().await?;
        let user = user_id.to_string();

        let balance: Option<i64> = conn
            .interact(move |conn| {
                credit_accounts::table
                    .find(user)
                    .select(credit_accounts::balance)
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        Ok(balance.unwrap_or(0))
    }

    /// Looks up a transaction by its idempotency key.
    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<CreditTransaction>, LedgerError> {
        use crate::database::schema::credit_transactions;

        let conn = self.dal.database.get_connection().await?;
        let key = key.to_string();

        let row: Option<SqliteCreditTransaction> = conn
            .interact(move |conn| {
                credit_transactions::table
                    .filter(credit_transactions::idempotency_key.eq(key))
                    .select(SqliteCreditTransaction::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        row.map(CreditTransaction::try_from)
            .transpose()
            .map_err(LedgerError::Storage)
    }

    /// Retrieves a transaction by id.
    pub async fn get_transaction(
        &self,
        id: UniversalUuid,
    ) -> Result<Option<CreditTransaction>, LedgerError> {
        use crate::database::schema::credit_transactions;

        let conn = self.dal.database.get_connection().await?;
        let id_blob = id.to_blob();

        let row: Option<SqliteCreditTransaction> = conn
            .interact(move |conn| {
                credit_transactions::table
                    .find(id_blob)
                    .select(SqliteCreditTransaction::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        row.map(CreditTransaction::try_from)
            .transpose()
            .map_err(LedgerError::Storage)
    }

    /// Reservation attempt: idempotency replay, availability check, and the
    /// ledger write, all inside one transaction.
    ///
    /// Availability is `balance - SUM(outstanding Reserved amounts)`, so two
    /// concurrent reservations cannot both be admitted against the same
    /// credits. The balance itself is NOT decremented here.
    ///
    /// An `Insufficient` row is a recorded outcome, not an error.
    pub async fn check_and_reserve(
        &self,
        user_id: &str,
        action: &str,
        cost: i64,
        idempotency_key: &str,
    ) -> Result<ReservationRow, LedgerError> {
        use crate::database::schema::{credit_accounts, credit_transactions};

        let conn = self.dal.database.get_connection().await?;
        let user = user_id.to_string();
        let action = action.to_string();
        let key = idempotency_key.to_string();

        let (row, balance, replayed) = conn
            .interact(
                move |conn| -> Result<(SqliteCreditTransaction, i64, bool), LedgerError> {
                    conn.immediate_transaction(|conn| {
                        let balance: i64 = credit_accounts::table
                            .find(&user)
                            .select(credit_accounts::balance)
                            .first(conn)
                            .optional()?
                            .unwrap_or(0);

                        // Idempotent replay: exactly one row per key.
                        let existing: Option<SqliteCreditTransaction> = credit_transactions::table
                            .filter(credit_transactions::idempotency_key.eq(&key))
                            .select(SqliteCreditTransaction::as_select())
                            .first(conn)
                            .optional()?;
                        if let Some(existing) = existing {
                            return Ok((existing, balance, true));
                        }

                        // diesel types SUM over BigInt as Nullable<Numeric>,
                        // which SQLite cannot hand back as i64; sum the
                        // outstanding amounts in Rust instead.
                        let reserved: Vec<i64> = credit_transactions::table
                            .filter(credit_transactions::user_id.eq(&user))
                            .filter(
                                credit_transactions::status
                                    .eq(TransactionStatus::Reserved.as_str()),
                            )
                            .select(credit_transactions::amount)
                            .load(conn)?;
                        let available = balance - reserved.iter().sum::<i64>();

                        let status = if available < cost {
                            TransactionStatus::Insufficient
                        } else {
                            TransactionStatus::Reserved
                        };

                        let now = current_timestamp_string();
                        let new_row = NewSqliteCreditTransaction {
                            id: UniversalUuid::new_v4().to_blob(),
                            user_id: user.clone(),
                            amount: cost,
                            action: action.clone(),
                            status: status.as_str().to_string(),
                            idempotency_key: key.clone(),
                            created_at: now,
                            confirmed_at: None,
                            cancelled_at: None,
                        };

                        let inserted: SqliteCreditTransaction =
                            diesel::insert_into(credit_transactions::table)
                                .values(&new_row)
                                .returning(SqliteCreditTransaction::as_returning())
                                .get_result(conn)?;

                        Ok((inserted, balance, false))
                    })
                },
            )
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(ReservationRow {
            transaction: CreditTransaction::try_from(row).map_err(LedgerError::Storage)?,
            balance,
            replayed,
        })
    }

    /// Confirms a reservation: decrements the balance and flips the status
    /// to `Confirmed`, atomically. Idempotent when already confirmed.
    ///
    /// Any state other than `Reserved`/`Confirmed` is an invariant
    /// violation; the transaction rolls back with no partial effect, as
    /// does a confirm that would drive the balance negative.
    pub async fn confirm(&self, reservation_id: UniversalUuid) -> Result<i64, LedgerError> {
        use crate::database::schema::{credit_accounts, credit_transactions};

        let conn = self.dal.database.get_connection().await?;
        let id_blob = reservation_id.to_blob();

        let new_balance = conn
            .interact(move |conn| -> Result<i64, LedgerError> {
                conn.immediate_transaction(|conn| {
                    let row: SqliteCreditTransaction = credit_transactions::table
                        .find(&id_blob)
                        .select(SqliteCreditTransaction::as_select())
                        .first(conn)
                        .optional()?
                        .ok_or(LedgerError::ReservationNotFound(reservation_id.0))?;

                    let status =
                        TransactionStatus::parse(&row.status).map_err(LedgerError::Storage)?;

                    let balance: i64 = credit_accounts::table
                        .find(&row.user_id)
                        .select(credit_accounts::balance)
                        .first(conn)
                        .optional()?
                        .unwrap_or(0);

                    match status {
                        TransactionStatus::Confirmed => Ok(balance),
                        TransactionStatus::Reserved => {
                            if balance < row.amount {
                                return Err(LedgerError::BalanceUnderflow {
                                    user_id: row.user_id.clone(),
                                    balance,
                                    amount: row.amount,
                                });
                            }

                            let now = current_timestamp_string();
                            diesel::update(credit_accounts::table.find(&row.user_id))
                                .set((
                                    credit_accounts::balance
                                        .eq(credit_accounts::balance - row.amount),
                                    credit_accounts::updated_at.eq(&now),
                                ))
                                .execute(conn)?;

                            diesel::update(credit_transactions::table.find(&id_blob))
                                .set((
                                    credit_transactions::status
                                        .eq(TransactionStatus::Confirmed.as_str()),
                                    credit_transactions::confirmed_at.eq(Some(&now)),
                                ))
                                .execute(conn)?;

                            Ok(balance - row.amount)
                        }
                        other => Err(LedgerError::InvalidTransition {
                            reservation_id: reservation_id.0,
                            from: other.to_string(),
                            to: "Confirmed",
                        }),
                    }
                })
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(new_balance)
    }

    /// Cancels a reservation. No balance effect — none was ever applied.
    /// Idempotent when already cancelled; invalid from any other state.
    pub async fn cancel(&self, reservation_id: UniversalUuid) -> Result<(), LedgerError> {
        use crate::database::schema::credit_transactions;

        let conn = self.dal.database.get_connection().await?;
        let id_blob = reservation_id.to_blob();

        conn.interact(move |conn| -> Result<(), LedgerError> {
            conn.immediate_transaction(|conn| {
                let row: SqliteCreditTransaction = credit_transactions::table
                    .find(&id_blob)
                    .select(SqliteCreditTransaction::as_select())
                    .first(conn)
                    .optional()?
                    .ok_or(LedgerError::ReservationNotFound(reservation_id.0))?;

                let status =
                    TransactionStatus::parse(&row.status).map_err(LedgerError::Storage)?;

                match status {
                    TransactionStatus::Cancelled => Ok(()),
                    TransactionStatus::Reserved => {
                        let now = current_timestamp_string();
                        diesel::update(credit_transactions::table.find(&id_blob))
                            .set((
                                credit_transactions::status
                                    .eq(TransactionStatus::Cancelled.as_str()),
                                credit_transactions::cancelled_at.eq(Some(&now)),
                            ))
                            .execute(conn)?;
                        Ok(())
                    }
                    other => Err(LedgerError::InvalidTransition {
                        reservation_id: reservation_id.0,
                        from: other.to_string(),
                        to: "Cancelled",
                    }),
                }
            })
        })
        .await
        .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Cancels `Reserved` rows older than `older_than`, returning how many
    /// were reclaimed.
    ///
    /// A reservation that old belongs to a delivery that died without
    /// settling it (a retried attempt reserves under a fresh key), and
    /// until reclaimed it keeps reducing the user's availability.
    /// `older_than` must exceed the longest a live handler can run.
    pub async fn cancel_stale_reserved(
        &self,
        older_than: std::time::Duration,
    ) -> Result<usize, LedgerError> {
        use crate::database::schema::credit_transactions;

        let conn = self.dal.database.get_connection().await?;
        let now = current_timestamp();
        let age = chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = UniversalTimestamp(now.0 - age).to_rfc3339();
        let now_str = now.to_rfc3339();

        let cancelled = conn
            .interact(move |conn| {
                diesel::update(
                    credit_transactions::table
                        .filter(
                            credit_transactions::status
                                .eq(TransactionStatus::Reserved.as_str()),
                        )
                        .filter(credit_transactions::created_at.lt(&cutoff)),
                )
                .set((
                    credit_transactions::status.eq(TransactionStatus::Cancelled.as_str()),
                    credit_transactions::cancelled_at.eq(Some(&now_str)),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
            .map_err(StorageError::from)?;

        Ok(cancelled)
    }

    /// Grants credits: increments the balance and appends a `Confirmed`
    /// ledger row with the negative-amount convention, atomically.
    /// Idempotent on `reference_id`.
    pub async fn add_credits(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference_id: &str,
    ) -> Result<i64, LedgerError> {
        use crate::database::schema::{credit_accounts, credit_transactions};

        let conn = self.dal.database.get_connection().await?;
        let user = user_id.to_string();
        let reason = reason.to_string();
        let reference = reference_id.to_string();

        let balance = conn
            .interact(move |conn| -> Result<i64, LedgerError> {
                conn.immediate_transaction(|conn| {
                    let replay: Option<Vec<u8>> = credit_transactions::table
                        .filter(credit_transactions::idempotency_key.eq(&reference))
                        .select(credit_transactions::id)
                        .first(conn)
                        .optional()?;
                    if replay.is_some() {
                        let balance: i64 = credit_accounts::table
                            .find(&user)
                            .select(credit_accounts::balance)
                            .first(conn)
                            .optional()?
                            .unwrap_or(0);
                        return Ok(balance);
                    }

                    let now = current_timestamp_string();
                    diesel::insert_into(credit_accounts::table)
                        .values(&NewSqliteCreditAccount {
                            user_id: user.clone(),
                            balance: amount,
                            created_at: now.clone(),
                            updated_at: now.clone(),
                        })
                        .on_conflict(credit_accounts::user_id)
                        .do_update()
                        .set((
                            credit_accounts::balance.eq(credit_accounts::balance + amount),
                            credit_accounts::updated_at.eq(&now),
                        ))
                        .execute(conn)?;

                    diesel::insert_into(credit_transactions::table)
                        .values(&NewSqliteCreditTransaction {
                            id: UniversalUuid::new_v4().to_blob(),
                            user_id: user.clone(),
                            amount: -amount,
                            action: reason.clone(),
                            status: TransactionStatus::Confirmed.as_str().to_string(),
                            idempotency_key: reference.clone(),
                            created_at: now.clone(),
                            confirmed_at: Some(now),
                            cancelled_at: None,
                        })
                        .execute(conn)?;

                    let balance: i64 = credit_accounts::table
                        .find(&user)
                        .select(credit_accounts::balance)
                        .first(conn)?;

                    Ok(balance)
                })
            })
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))??;

        Ok(balance)
    }
}
