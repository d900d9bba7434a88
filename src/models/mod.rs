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

//! Domain models shared across subsystems.
//!
//! These are the types business logic works with. The raw row
//! representations live in [`crate::dal::models`] and are converted at the
//! DAL boundary.

pub mod checkin;
pub mod credit;
pub mod idempotency;
pub mod job;

pub use checkin::{Checkin, CheckinStatus};
pub use credit::{CreditAccount, CreditTransaction, TransactionStatus};
pub use idempotency::IdempotencyRecord;
pub use job::{Job, JobStatus, NewJob};
