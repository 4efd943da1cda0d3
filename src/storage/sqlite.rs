//! SQLite-backed [`ResultStore`].

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{open_pool, HistoryEntry, Pool, ResultStore, StoreError};
use crate::model::{TestResult, TestRun};

const RUN_COLUMNS: &str = "id, suite_name, status, total, passed, failed, errored, skipped,
     persistence_degraded, metadata_json, started_at, finished_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the database at `path`, creating and migrating it if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

struct RunRow {
    id: String,
    suite_name: String,
    status: String,
    counts: [i64; 5],
    persistence_degraded: bool,
    metadata_json: String,
    started_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            suite_name: row.get(1)?,
            status: row.get(2)?,
            counts: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?],
            persistence_degraded: row.get(8)?,
            metadata_json: row.get(9)?,
            started_at: row.get(10)?,
            finished_at: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<TestRun, StoreError> {
        let [total, passed, failed, errored, skipped] = self.counts.map(|n| n.max(0) as usize);
        Ok(TestRun {
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            metadata: serde_json::from_str(&self.metadata_json)?,
            id: self.id,
            suite_name: self.suite_name,
            total,
            passed,
            failed,
            errored,
            skipped,
            persistence_degraded: self.persistence_degraded,
        })
    }
}

impl ResultStore for SqliteStore {
    fn save_run(&self, run: &TestRun) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO runs (id, suite_name, status, total, passed, failed, errored, skipped,
                               persistence_degraded, metadata_json, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                suite_name = excluded.suite_name,
                status = excluded.status,
                total = excluded.total,
                passed = excluded.passed,
                failed = excluded.failed,
                errored = excluded.errored,
                skipped = excluded.skipped,
                persistence_degraded = excluded.persistence_degraded,
                metadata_json = excluded.metadata_json,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at",
            params![
                run.id,
                run.suite_name,
                run.status.as_str(),
                run.total as i64,
                run.passed as i64,
                run.failed as i64,
                run.errored as i64,
                run.skipped as i64,
                run.persistence_degraded,
                serde_json::to_string(&run.metadata)?,
                ts(&run.started_at),
                run.finished_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    fn save_result(&self, run_id: &str, result: &TestResult) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO results (run_id, test_case_id, status, duration_ms, result_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                result.test_case_id,
                result.status.as_str(),
                result.duration.as_secs_f64() * 1000.0,
                serde_json::to_string(result)?,
                ts(&result.timestamp),
            ],
        )?;
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<TestRun>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [run_id],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    fn list_runs(&self, suite_name: Option<&str>, limit: usize) -> Result<Vec<TestRun>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE (?1 IS NULL OR suite_name = ?1)
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![suite_name, limit as i64], RunRow::from_row)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(RunRow::into_run))
            .collect()
    }

    fn get_results(&self, run_id: &str) -> Result<Vec<TestResult>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT result_json FROM results WHERE run_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map([run_id], |row| row.get::<_, String>(0))?;
        rows.map(|json| -> Result<TestResult, StoreError> { Ok(serde_json::from_str(&json?)?) })
            .collect()
    }

    fn get_history(&self, test_case_id: &str, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT r.run_id, runs.suite_name, r.result_json
             FROM results r LEFT JOIN runs ON runs.id = r.run_id
             WHERE r.test_case_id = ?1
             ORDER BY r.timestamp DESC, r.id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![test_case_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        rows.map(|row| -> Result<HistoryEntry, StoreError> {
            let (run_id, suite_name, json) = row?;
            Ok(HistoryEntry {
                run_id,
                suite_name,
                result: serde_json::from_str(&json)?,
            })
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorKind, RunStatus, TestStatus};
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested/evalrunner.db")).unwrap();
        (dir, store)
    }

    fn result_at(id: &str, minutes_ago: i64) -> TestResult {
        let mut result = TestResult::errored(id, ErrorKind::Adapter, "boom");
        result.timestamp = Utc::now() - ChronoDuration::minutes(minutes_ago);
        result
    }

    #[test]
    fn test_save_run_is_upsert() {
        let (_dir, store) = store();
        let mut run = TestRun::new("r1", "smoke", 2);
        store.save_run(&run).unwrap();

        run.record(TestStatus::Passed);
        run.record(TestStatus::Failed);
        run.persistence_degraded = true;
        run.finish(RunStatus::Completed);
        store.save_run(&run).unwrap();
        store.save_run(&run).unwrap();

        let loaded = store.get_run("r1").unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!((loaded.passed, loaded.failed), (1, 1));
        assert!(loaded.persistence_degraded);
        assert!(loaded.finished_at.is_some());
        assert_eq!(store.list_runs(None, 10).unwrap().len(), 1);
        assert!(store.get_run("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_runs_newest_first_with_filter() {
        let (_dir, store) = store();
        for (id, suite, age) in [("a", "x", 30), ("b", "y", 20), ("c", "x", 10)] {
            let mut run = TestRun::new(id, suite, 0);
            run.started_at = Utc::now() - ChronoDuration::minutes(age);
            store.save_run(&run).unwrap();
        }

        let all: Vec<_> = store.list_runs(None, 10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(all, vec!["c", "b", "a"]);
        let x: Vec<_> = store.list_runs(Some("x"), 10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(x, vec!["c", "a"]);
        assert_eq!(store.list_runs(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_history_descending_and_limited() {
        let (_dir, store) = store();
        for run_id in ["r1", "r2", "r3"] {
            store.save_run(&TestRun::new(run_id, "smoke", 1)).unwrap();
        }
        store.save_result("r1", &result_at("tc_001", 30)).unwrap();
        store.save_result("r3", &result_at("tc_001", 5)).unwrap();
        store.save_result("r2", &result_at("tc_001", 15)).unwrap();
        store.save_result("r2", &result_at("tc_other", 1)).unwrap();

        let history = store.get_history("tc_001", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].run_id, "r3");
        assert_eq!(history[1].run_id, "r2");
        assert!(history[0].result.timestamp > history[1].result.timestamp);
        assert_eq!(history[0].suite_name.as_deref(), Some("smoke"));
        assert_eq!(history[0].result.error_kind, Some(ErrorKind::Adapter));
    }

    #[test]
    fn test_concurrent_result_writes() {
        let (_dir, store) = store();
        store.save_run(&TestRun::new("r1", "load", 40)).unwrap();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..5 {
                        let result = TestResult::skipped(format!("tc_{t}_{i}"), "x");
                        store.save_result("r1", &result).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get_results("r1").unwrap().len(), 40);
    }
}
