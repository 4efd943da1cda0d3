//! Result store: durable, queryable runs and per-test results.
//!
//! [`ResultStore`] is synchronous; async callers go through
//! `spawn_blocking`. [`SqliteStore`] is the durable backend, [`MemoryStore`]
//! keeps everything in process.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::path::Path;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{TestResult, TestRun};

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

/// One past result of a test case, with the run it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_name: Option<String>,
    #[serde(flatten)]
    pub result: TestResult,
}

/// Persistence for runs and results.
///
/// `save_result` may be called concurrently; implementations serialize
/// writes so none are lost.
pub trait ResultStore: Send + Sync {
    /// Insert or update run metadata; idempotent per run id.
    fn save_run(&self, run: &TestRun) -> Result<(), StoreError>;

    /// Append one result to a run.
    fn save_result(&self, run_id: &str, result: &TestResult) -> Result<(), StoreError>;

    fn get_run(&self, run_id: &str) -> Result<Option<TestRun>, StoreError>;

    /// Most recent first, optionally for one suite.
    fn list_runs(&self, suite_name: Option<&str>, limit: usize) -> Result<Vec<TestRun>, StoreError>;

    /// Results of a run in the order they were saved.
    fn get_results(&self, run_id: &str) -> Result<Vec<TestResult>, StoreError>;

    /// The `limit` most recent results of a test case across all runs, newest first.
    fn get_history(&self, test_case_id: &str, limit: usize) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}
