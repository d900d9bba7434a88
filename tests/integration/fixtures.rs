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

//! Shared test setup: each call provisions an isolated in-memory SQLite
//! database (shared-cache, so every pooled connection sees the same data)
//! with migrations applied.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

use weir::dal::DAL;
use weir::database::Database;

static DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
});

/// Fresh migrated database, isolated from every other test.
pub async fn test_dal() -> DAL {
    Lazy::force(&TRACING);

    let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let url = format!("file:weir_test_{}?mode=memory&cache=shared", n);
    let database = Database::new(&url, 1);
    database
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    DAL::new(database)
}
