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

//! Database connection management for the SQLite backend.
//!
//! This module provides an async connection pool implementation using
//! `deadpool-diesel`. It handles pooling, connection lifecycle, and schema
//! migration, and is the single entry point every DAL goes through.
//!
//! # Example
//!
//! ```rust,no_run
//! use weir::database::Database;
//!
//! let db = Database::new("weir.db", 1);
//! // or an in-memory database shared across pool connections:
//! let db = Database::new("file:weir_mem?mode=memory&cache=shared", 1);
//! ```

use deadpool_diesel::sqlite::{Manager, Object, Pool, Runtime};
use tracing::info;

use crate::error::StorageError;

/// A thread-safe handle to the SQLite connection pool.
///
/// `Database` is `Clone`; each clone references the same underlying pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Database(sqlite)")
    }
}

impl Database {
    /// Creates a new connection pool.
    ///
    /// `connection_string` accepts a file path, `:memory:`, a `sqlite://`
    /// URL, or a `file:` URI (e.g. `file:test?mode=memory&cache=shared`).
    ///
    /// SQLite has limited concurrent write support even with WAL mode, so
    /// `max_size` is clamped to 1; a single connection avoids "database is
    /// locked" errors under concurrent workers.
    ///
    /// # Panics
    ///
    /// Panics if the connection pool cannot be created.
    pub fn new(connection_string: &str, max_size: u32) -> Self {
        let connection_url = Self::build_sqlite_url(connection_string);
        let manager = Manager::new(connection_url, Runtime::Tokio1);
        // Clamped regardless of the requested size; see the doc comment.
        let _ = max_size;
        let pool_size = 1;
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .expect("Failed to create SQLite connection pool");

        info!("SQLite connection pool initialized (size: {})", pool_size);

        Self { pool }
    }

    /// Returns a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    /// Checks out a connection from the pool.
    pub async fn get_connection(&self) -> Result<Object, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::ConnectionPool(e.to_string()))
    }

    /// Strips the `sqlite://` prefix if present; all other forms pass through.
    fn build_sqlite_url(connection_string: &str) -> String {
        if let Some(path) = connection_string.strip_prefix("sqlite://") {
            path.to_string()
        } else {
            connection_string.to_string()
        }
    }

    /// Runs pending database migrations and sets connection pragmas.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        use diesel_migrations::MigrationHarness;

        let conn = self.get_connection().await?;
        conn.interact(|conn| {
            use diesel::prelude::*;

            // busy_timeout first: switching the journal mode takes a lock,
            // and another pool's connection may still hold the file.
            diesel::sql_query("PRAGMA busy_timeout=30000;")
                .execute(conn)
                .map_err(|e| StorageError::Migration(e.to_string()))?;
            // WAL mode allows concurrent reads during writes.
            diesel::sql_query("PRAGMA journal_mode=WAL;")
                .execute(conn)
                .map_err(|e| StorageError::Migration(e.to_string()))?;

            conn.run_pending_migrations(crate::database::MIGRATIONS)
                .map_err(|e| StorageError::Migration(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::ConnectionPool(e.to_string()))?
    }
}
