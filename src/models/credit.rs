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

//! Credit ledger models: prepaid balances and the reservation transaction log.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::error::StorageError;

/// Status of a credit transaction.
///
/// Forward-only: `Reserved -> Confirmed` or `Reserved -> Cancelled`.
/// `Insufficient` is terminal from the start — it records a reservation
/// attempt that found the balance too low, and is never transitioned out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Reserved,
    Confirmed,
    Cancelled,
    Insufficient,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Reserved => "Reserved",
            TransactionStatus::Confirmed => "Confirmed",
            TransactionStatus::Cancelled => "Cancelled",
            TransactionStatus::Insufficient => "Insufficient",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "Reserved" => Ok(TransactionStatus::Reserved),
            "Confirmed" => Ok(TransactionStatus::Confirmed),
            "Cancelled" => Ok(TransactionStatus::Cancelled),
            "Insufficient" => Ok(TransactionStatus::Insufficient),
            other => Err(StorageError::InvalidValue(format!(
                "unknown transaction status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user's prepaid credit balance.
///
/// The balance is mutated only inside single-row ledger transactions; no
/// other subsystem writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: String,
    pub balance: i64,
    pub created_at: UniversalTimestamp,
    pub updated_at: UniversalTimestamp,
}

/// One row of the reservation ledger.
///
/// Exactly one transaction exists per idempotency key. Credit grants use a
/// negative `amount` by convention and are written already `Confirmed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: UniversalUuid,
    pub user_id: String,
    pub amount: i64,
    pub action: String,
    pub status: TransactionStatus,
    pub idempotency_key: String,
    pub created_at: UniversalTimestamp,
    pub confirmed_at: Option<UniversalTimestamp>,
    pub cancelled_at: Option<UniversalTimestamp>,
}
