//! Run progress shared between the scheduler and observers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Idle,
    Fetching,
    Filtering,
    Enriching,
    Exporting,
    Done,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Done | ProgressStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub run_id: Option<Uuid>,
    pub current: usize,
    pub total: usize,
    pub status: ProgressStatus,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            run_id: None,
            current: 0,
            total: 0,
            status: ProgressStatus::Idle,
        }
    }
}

/// Single writer for progress state; readers get `watch` receivers.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Resets counters for a new run and returns its id.
    pub fn start_run(&self) -> Uuid {
        let run_id = Uuid::new_v4();
        self.tx.send_replace(ProgressSnapshot {
            run_id: Some(run_id),
            current: 0,
            total: 0,
            status: ProgressStatus::Fetching,
        });
        run_id
    }

    pub fn set_status(&self, status: ProgressStatus) {
        self.tx.send_modify(|s| s.status = status);
    }

    pub fn begin(&self, total: usize) {
        self.tx.send_modify(|s| {
            s.current = 0;
            s.total = total;
            s.status = ProgressStatus::Enriching;
        });
    }

    /// One permit settled, successfully or not.
    pub fn record_completion(&self) {
        self.tx.send_modify(|s| s.current = (s.current + 1).min(s.total));
    }

    pub fn finish(&self) {
        self.tx.send_modify(|s| {
            s.current = s.total;
            s.status = ProgressStatus::Done;
        });
    }

    pub fn fail(&self) {
        self.set_status(ProgressStatus::Failed);
    }
}
