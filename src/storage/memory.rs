//! In-process [`ResultStore`] for embedding and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{HistoryEntry, ResultStore, StoreError};
use crate::model::{TestResult, TestRun};

#[derive(Default)]
struct Inner {
    /// Run id -> (insertion sequence, run).
    runs: HashMap<String, (u64, TestRun)>,
    /// (sequence, run id, result) in save order.
    results: Vec<(u64, String, TestResult)>,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Keeps runs and results in memory; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".into()))
    }
}

impl ResultStore for MemoryStore {
    fn save_run(&self, run: &TestRun) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let seq = match inner.runs.get(&run.id) {
            Some((seq, _)) => *seq,
            None => inner.next_seq(),
        };
        inner.runs.insert(run.id.clone(), (seq, run.clone()));
        Ok(())
    }

    fn save_result(&self, run_id: &str, result: &TestResult) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let seq = inner.next_seq();
        inner.results.push((seq, run_id.to_string(), result.clone()));
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<TestRun>, StoreError> {
        Ok(self.lock()?.runs.get(run_id).map(|(_, run)| run.clone()))
    }

    fn list_runs(&self, suite_name: Option<&str>, limit: usize) -> Result<Vec<TestRun>, StoreError> {
        let inner = self.lock()?;
        let mut runs: Vec<&(u64, TestRun)> = inner
            .runs
            .values()
            .filter(|(_, run)| suite_name.map_or(true, |s| run.suite_name == s))
            .collect();
        runs.sort_by(|(seq_a, a), (seq_b, b)| {
            b.started_at.cmp(&a.started_at).then(seq_b.cmp(seq_a))
        });
        Ok(runs.into_iter().take(limit).map(|(_, run)| run.clone()).collect())
    }

    fn get_results(&self, run_id: &str) -> Result<Vec<TestResult>, StoreError> {
        Ok(self
            .lock()?
            .results
            .iter()
            .filter(|(_, id, _)| id == run_id)
            .map(|(_, _, result)| result.clone())
            .collect())
    }

    fn get_history(&self, test_case_id: &str, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.lock()?;
        let mut matches: Vec<&(u64, String, TestResult)> = inner
            .results
            .iter()
            .filter(|(_, _, result)| result.test_case_id == test_case_id)
            .collect();
        matches.sort_by(|(seq_a, _, a), (seq_b, _, b)| {
            b.timestamp.cmp(&a.timestamp).then(seq_b.cmp(seq_a))
        });
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|(_, run_id, result)| HistoryEntry {
                run_id: run_id.clone(),
                suite_name: inner.runs.get(run_id).map(|(_, run)| run.suite_name.clone()),
                result: result.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorKind, RunStatus};
    use chrono::{Duration, Utc};

    #[test]
    fn test_history_order_and_limit() {
        let store = MemoryStore::new();
        store.save_run(&TestRun::new("r1", "smoke", 3)).unwrap();
        for minutes in [10, 30, 20] {
            let mut result = TestResult::errored("tc_001", ErrorKind::Evaluation, "x");
            result.timestamp = Utc::now() - Duration::minutes(minutes);
            store.save_result("r1", &result).unwrap();
        }

        let history = store.get_history("tc_001", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].result.timestamp > history[1].result.timestamp);
        assert_eq!(history[0].suite_name.as_deref(), Some("smoke"));
        assert!(store.get_history("tc_unknown", 5).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_keeps_single_run() {
        let store = MemoryStore::new();
        let mut run = TestRun::new("r1", "smoke", 0);
        store.save_run(&run).unwrap();
        run.finish(RunStatus::Cancelled);
        store.save_run(&run).unwrap();

        let runs = store.list_runs(Some("smoke"), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Cancelled);
        assert!(store.list_runs(Some("other"), 10).unwrap().is_empty());
    }
}
