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

//! Data Access Layer.
//!
//! One DAL struct per entity, all hanging off a shared [`DAL`] handle.
//! Reads are single `interact` queries; anything touching more than one row
//! runs inside `immediate_transaction`, which takes SQLite's write lock up
//! front — the row-lock (`FOR UPDATE`) equivalent that keeps ledger and
//! claim operations atomic under concurrent workers.

use crate::database::Database;

pub mod checkin;
pub mod idempotency;
pub mod job;
pub mod ledger;
pub mod models;
pub mod rate_window;

pub use checkin::CheckinDAL;
pub use idempotency::IdempotencyDAL;
pub use job::JobDAL;
pub use ledger::LedgerDAL;
pub use rate_window::RateWindowDAL;

/// The main Data Access Layer handle.
#[derive(Clone)]
pub struct DAL {
    pub(crate) database: Database,
}

impl DAL {
    /// Creates a new DAL over the given database.
    pub fn new(database: Database) -> Self {
        DAL { database }
    }

    /// Returns the underlying database handle.
    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn jobs(&self) -> JobDAL {
        JobDAL { dal: self }
    }

    pub fn idempotency(&self) -> IdempotencyDAL {
        IdempotencyDAL { dal: self }
    }

    pub fn ledger(&self) -> LedgerDAL {
        LedgerDAL { dal: self }
    }

    pub fn checkins(&self) -> CheckinDAL {
        CheckinDAL { dal: self }
    }

    pub fn rate_window(&self) -> RateWindowDAL {
        RateWindowDAL { dal: self }
    }
}
