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

//! Credit ledger: two-phase spend over an append-only transaction log.
//!
//! A spend is `reserve -> confirm` with `cancel` as the failure path. The
//! reserve admits or denies against `balance - outstanding reservations`;
//! only confirm moves the balance. Every reserve is idempotent on its
//! caller-supplied key, so a redelivered job replays the recorded outcome
//! instead of reserving twice.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::dal::DAL;
use crate::database::universal_types::UniversalUuid;
use crate::error::LedgerError;
use crate::models::{CreditTransaction, TransactionStatus};

/// Resolves the credit cost of an action. Injected so pricing lives with
/// the caller, not the ledger.
#[async_trait]
pub trait CreditCostResolver: Send + Sync {
    async fn credit_cost(&self, action: &str) -> i64;
}

/// Flat per-action pricing from a static table.
pub struct FixedCosts {
    pub default_cost: i64,
    pub overrides: Vec<(String, i64)>,
}

#[async_trait]
impl CreditCostResolver for FixedCosts {
    async fn credit_cost(&self, action: &str) -> i64 {
        self.overrides
            .iter()
            .find(|(name, _)| name == action)
            .map(|(_, cost)| *cost)
            .unwrap_or(self.default_cost)
    }
}

/// Result of a reservation attempt.
#[derive(Debug, Clone)]
pub struct ReservationOutcome {
    /// True when the reservation was admitted (or replayed as admitted).
    pub has_credits: bool,
    /// Balance observed at reservation time. Reservations do not move it.
    pub balance: i64,
    pub reservation_id: UniversalUuid,
    pub status: TransactionStatus,
}

/// Handle to the credit ledger.
#[derive(Clone)]
pub struct CreditLedger {
    dal: DAL,
}

impl CreditLedger {
    pub fn new(dal: DAL) -> Self {
        Self { dal }
    }

    /// Current balance; unknown users hold zero.
    pub async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        self.dal.ledger().get_balance(user_id).await
    }

    /// Phase one of a spend: reserve `cost(action)` credits.
    ///
    /// Denial for insufficient credits is a recorded `Insufficient` row,
    /// not an error; replaying the same `idempotency_key` returns the
    /// recorded outcome without a second reservation.
    pub async fn reserve(
        &self,
        user_id: &str,
        action: &str,
        cost: i64,
        idempotency_key: &str,
    ) -> Result<ReservationOutcome, LedgerError> {
        let row = self
            .dal
            .ledger()
            .check_and_reserve(user_id, action, cost, idempotency_key)
            .await?;

        let status = row.transaction.status;
        let outcome = ReservationOutcome {
            has_credits: status == TransactionStatus::Reserved,
            balance: row.balance,
            reservation_id: row.transaction.id,
            status,
        };

        if row.replayed {
            debug!(
                user_id,
                idempotency_key,
                status = %status,
                "Reservation replayed from ledger"
            );
        } else if outcome.has_credits {
            debug!(
                user_id,
                action,
                cost,
                reservation_id = %outcome.reservation_id,
                "Credits reserved"
            );
        } else {
            info!(
                user_id,
                action,
                cost,
                balance = row.balance,
                "Reservation denied, insufficient credits"
            );
        }

        Ok(outcome)
    }

    /// Phase two, success: deduct the reserved amount. Returns the new
    /// balance. Idempotent for an already-confirmed reservation.
    pub async fn confirm(&self, reservation_id: UniversalUuid) -> Result<i64, LedgerError> {
        let balance = self.dal.ledger().confirm(reservation_id).await?;
        debug!(reservation_id = %reservation_id, balance, "Reservation confirmed");
        Ok(balance)
    }

    /// Phase two, failure: release the reservation with no balance effect.
    /// Idempotent for an already-cancelled reservation.
    pub async fn cancel(&self, reservation_id: UniversalUuid) -> Result<(), LedgerError> {
        self.dal.ledger().cancel(reservation_id).await?;
        debug!(reservation_id = %reservation_id, "Reservation cancelled");
        Ok(())
    }

    /// Grants credits, idempotent on `reference_id` (e.g. a payment id).
    /// Returns the new balance.
    pub async fn add_credits(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference_id: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            warn!(user_id, amount, "Ignoring non-positive credit grant");
            return self.balance(user_id).await;
        }
        let balance = self
            .dal
            .ledger()
            .add_credits(user_id, amount, reason, reference_id)
            .await?;
        info!(user_id, amount, reason, balance, "Credits granted");
        Ok(balance)
    }

    /// Looks up a ledger row by its reservation idempotency key.
    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<CreditTransaction>, LedgerError> {
        self.dal.ledger().find_by_idempotency_key(key).await
    }
}
