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

//! Idempotency record: cached handler results keyed by correlation id.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::UniversalTimestamp;

/// Maps an idempotency key to a cached result and an expiry.
///
/// Written once on first successful completion; read-checked before every
/// execution attempt. A repeated call with the same key inside the expiry
/// window returns the cached result without re-executing side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: serde_json::Value,
    pub expires_at: UniversalTimestamp,
    pub created_at: UniversalTimestamp,
}
