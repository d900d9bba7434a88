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

//! Diesel schema for the SQLite backend.
//!
//! UUIDs are `Binary` (BLOB), timestamps are `Text` (RFC3339, see
//! [`crate::database::universal_types`]).

diesel::table! {
    jobs (id) {
        id -> Binary,
        kind -> Text,
        payload -> Text,
        status -> Text,
        attempt -> Integer,
        max_attempts -> Integer,
        dedupe_key -> Nullable<Text>,
        available_at -> Text,
        lease_expires_at -> Nullable<Text>,
        last_error -> Nullable<Text>,
        completed_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    idempotency_records (key) {
        key -> Text,
        result -> Text,
        expires_at -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    credit_accounts (user_id) {
        user_id -> Text,
        balance -> BigInt,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    credit_transactions (id) {
        id -> Binary,
        user_id -> Text,
        amount -> BigInt,
        action -> Text,
        status -> Text,
        idempotency_key -> Text,
        created_at -> Text,
        confirmed_at -> Nullable<Text>,
        cancelled_at -> Nullable<Text>,
    }
}

diesel::table! {
    checkins (user_id) {
        user_id -> Text,
        status -> Text,
        scheduled_for -> Nullable<Text>,
        last_user_event_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    rate_limit_events (id) {
        id -> Integer,
        limiter_key -> Text,
        called_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    jobs,
    idempotency_records,
    credit_accounts,
    credit_transactions,
    checkins,
    rate_limit_events,
);
