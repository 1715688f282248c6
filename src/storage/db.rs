//! SQLite Database
//!
//! Embedded database for the shared lock table using rusqlite with r2d2
//! connection pooling. A single server instance uses this for coordination;
//! multiple instances sharing a database file coordinate through the same
//! `repo_locks` rows.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::utils::error::{AppError, AppResult};

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database service holding the connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create a new database instance with connection pooling
    pub fn new(db_path: &Path) -> AppResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database for testing.
    ///
    /// Single-connection pool so every caller sees the same data.
    pub fn new_in_memory() -> AppResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> AppResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repo_locks (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                user_id TEXT,
                plan_id TEXT NOT NULL,
                plan_build_id TEXT,
                scope TEXT NOT NULL CHECK (scope IN ('r', 'w')),
                branch TEXT,
                reason TEXT NOT NULL DEFAULT '',
                last_heartbeat_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_repo_locks_plan_id ON repo_locks (plan_id);

            CREATE TABLE IF NOT EXISTS model_streams (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                branch TEXT NOT NULL,
                finished_at TEXT,
                last_heartbeat_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_model_streams_plan_id ON model_streams (plan_id);
            "#,
        )
        .map_err(|e| AppError::database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Get a pooled connection
    pub fn conn(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("Failed to get connection: {}", e)))
    }

    /// Check the database responds to a trivial query
    pub fn is_healthy(&self) -> bool {
        self.conn()
            .and_then(|c| {
                c.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(AppError::from)
            })
            .map(|v| v == 1)
            .unwrap_or(false)
    }
}
