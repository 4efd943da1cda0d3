//! Progress events emitted while a run executes.
//!
//! Delivery is best-effort: the sink wraps a bounded channel and drops the
//! newest event when the consumer falls behind. A full or closed channel never
//! affects the run itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::model::{RunSummary, TestResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    TestCompleted {
        run_id: String,
        test_case_id: String,
        result: TestResult,
    },
    RunCompleted {
        run_id: String,
        summary: RunSummary,
    },
}

impl ProgressEvent {
    pub fn run_id(&self) -> &str {
        match self {
            ProgressEvent::TestCompleted { run_id, .. } | ProgressEvent::RunCompleted { run_id, .. } => {
                run_id
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::RunCompleted { .. })
    }
}

/// Sending half of a progress channel.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

/// Create a sink with room for `capacity` undelivered events.
pub fn channel(capacity: usize) -> (ProgressSink, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = ProgressSink {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sink, rx)
}

impl ProgressSink {
    /// Queue an event without waiting.
    pub fn emit(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(run_id = %event.run_id(), dropped, "progress consumer lagging, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events that could not be delivered so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorKind, TestRun};

    fn completed(id: &str) -> ProgressEvent {
        ProgressEvent::TestCompleted {
            run_id: "r1".into(),
            test_case_id: id.into(),
            result: TestResult::errored(id, ErrorKind::Adapter, "x"),
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_newest() {
        let (sink, mut rx) = channel(2);
        sink.emit(completed("a"));
        sink.emit(completed("b"));
        sink.emit(completed("c"));
        assert_eq!(sink.dropped(), 1);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProgressEvent::TestCompleted { ref test_case_id, .. } if test_case_id == "a"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ProgressEvent::TestCompleted { ref test_case_id, .. } if test_case_id == "b"));
    }

    #[tokio::test]
    async fn test_closed_receiver_is_harmless() {
        let (sink, rx) = channel(4);
        drop(rx);
        sink.emit(completed("a"));
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_event_wire_shape() {
        let mut run = TestRun::new("r1", "suite", 0);
        run.finish(crate::model::RunStatus::Completed);
        let event = ProgressEvent::RunCompleted {
            run_id: "r1".into(),
            summary: run.summary(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "run_completed");
        assert_eq!(json["summary"]["status"], "completed");
        assert!(event.is_terminal());

        let json = serde_json::to_value(completed("tc_9")).unwrap();
        assert_eq!(json["event"], "test_completed");
        assert_eq!(json["test_case_id"], "tc_9");
        assert_eq!(json["result"]["status"], "errored");
    }
}
