//! Execution records, the keyed snapshot store, and status streaming
//!
//! The record for one execution is mutated only through [`ExecutionStore::update`],
//! which also notifies a per-execution watch channel. [`ExecutionStore::stream`]
//! turns that channel into a sequence of snapshots with a hard guarantee:
//! at least one snapshot is emitted even for an already-terminal execution,
//! and the stream always closes with a single terminal marker frame.

use crate::error::{Error, Result};
use crate::types::{ExecutionId, ExecutionStatus, StepState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Default upper bound on snapshot frames per stream subscription
pub const DEFAULT_MAX_STREAM_EVENTS: usize = 64;

/// Progress entry for one step of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Step name (the configured agent type)
    pub step: String,
    /// Agent type driving the step
    pub agent_type: String,
    /// Current state
    pub status: StepState,
    /// Whether a failure of this step is tolerated
    pub optional: bool,
    /// Failure reason or other annotation
    #[serde(default)]
    pub detail: Option<String>,
}

/// Mutable, eventually-terminal state of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution id, also used as the event correlation token
    pub id: ExecutionId,
    /// Name of the pipeline configuration driving the run
    pub pipeline_name: String,
    /// Overall status
    pub status: ExecutionStatus,
    /// Input payload the run was started with
    pub input: Value,
    /// Per-step progress entries, in config order
    pub steps: Vec<StepProgress>,
    /// Step results keyed by step name
    pub results: BTreeMap<String, Value>,
    /// Non-fatal problems (optional-step failures, dropped results)
    pub warnings: Vec<String>,
    /// Failure reason once the run is failed
    pub error: Option<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a running record with pending step entries
    pub fn new(pipeline_name: impl Into<String>, input: Value, steps: Vec<StepProgress>) -> Self {
        Self {
            id: ExecutionId::new(),
            pipeline_name: pipeline_name.into(),
            status: ExecutionStatus::Running,
            input,
            steps,
            results: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Mutable access to one step's progress entry
    pub fn step_mut(&mut self, step: &str) -> Option<&mut StepProgress> {
        self.steps.iter_mut().find(|s| s.step == step)
    }

    /// Set a step's state and optional detail
    pub fn set_step(&mut self, step: &str, status: StepState, detail: Option<String>) {
        if let Some(entry) = self.step_mut(step) {
            entry.status = status;
            entry.detail = detail;
        }
    }

    /// Move the record to a terminal state
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    /// Number of steps in a terminal state
    pub fn terminal_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_terminal()).count()
    }

    /// Completed fraction of the run as a percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.steps.is_empty() {
            return 100.0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepState::Completed)
            .count();
        completed as f64 / self.steps.len() as f64 * 100.0
    }
}

/// Compact listing entry for one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Execution id
    pub execution_id: ExecutionId,
    /// Pipeline that ran
    pub pipeline_name: String,
    /// Overall status
    pub status: ExecutionStatus,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Terminal time, if reached
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether a failure reason is recorded
    pub has_error: bool,
    /// Completed fraction as a percentage
    pub progress_percentage: f64,
}

/// One frame of a status stream
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A point-in-time copy of the record
    Snapshot(ExecutionRecord),
    /// Terminal marker; always the last frame of a stream
    Ended {
        /// Snapshot frames emitted before this marker
        events_sent: usize,
    },
}

/// Keyed store of execution records with change notification
pub struct ExecutionStore {
    slots: DashMap<ExecutionId, watch::Sender<ExecutionRecord>>,
    max_stream_events: usize,
}

impl ExecutionStore {
    /// Create a store with the default stream bound
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            max_stream_events: DEFAULT_MAX_STREAM_EVENTS,
        }
    }

    /// Set the maximum snapshot frames per stream subscription
    pub fn with_max_stream_events(mut self, max: usize) -> Self {
        self.max_stream_events = max.max(1);
        self
    }

    /// Insert a freshly created record, returning its id
    pub fn insert(&self, record: ExecutionRecord) -> ExecutionId {
        let id = record.id;
        let (tx, _rx) = watch::channel(record);
        self.slots.insert(id, tx);
        id
    }

    /// Point-in-time copy of a record, or [`Error::UnknownExecution`]
    pub fn snapshot(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.slots
            .get(&id)
            .map(|tx| tx.borrow().clone())
            .ok_or_else(|| Error::UnknownExecution(id.to_string()))
    }

    /// Apply a mutation to a record and notify stream subscribers
    pub fn update<F>(&self, id: ExecutionId, f: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        let tx = self
            .slots
            .get(&id)
            .ok_or_else(|| Error::UnknownExecution(id.to_string()))?;
        tx.send_modify(f);
        Ok(())
    }

    /// Whether a record exists for the id
    pub fn contains(&self, id: ExecutionId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Number of retained records
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Summaries of all retained executions
    pub fn list(&self) -> Vec<ExecutionSummary> {
        let mut summaries: Vec<ExecutionSummary> = self
            .slots
            .iter()
            .map(|entry| {
                let record = entry.value().borrow();
                ExecutionSummary {
                    execution_id: record.id,
                    pipeline_name: record.pipeline_name.clone(),
                    status: record.status,
                    started_at: record.started_at,
                    completed_at: record.completed_at,
                    has_error: record.error.is_some(),
                    progress_percentage: record.progress_percentage(),
                }
            })
            .collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Stream of record snapshots for one execution.
    ///
    /// Emits the current snapshot immediately (so a subscriber to an
    /// already-terminal execution still sees data), then one snapshot per
    /// state change up to the configured bound, and finally exactly one
    /// [`StreamFrame::Ended`] marker.
    pub fn stream(&self, id: ExecutionId) -> Result<impl Stream<Item = StreamFrame>> {
        let mut rx = self
            .slots
            .get(&id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::UnknownExecution(id.to_string()))?;
        let max_events = self.max_stream_events;

        Ok(async_stream::stream! {
            let mut events_sent = 0usize;

            let snapshot = rx.borrow_and_update().clone();
            let mut terminal = snapshot.status.is_terminal();
            yield StreamFrame::Snapshot(snapshot);
            events_sent += 1;

            while !terminal && events_sent < max_events {
                match rx.changed().await {
                    Ok(()) => {
                        let snapshot = rx.borrow_and_update().clone();
                        terminal = snapshot.status.is_terminal();
                        yield StreamFrame::Snapshot(snapshot);
                        events_sent += 1;
                    }
                    // Sender gone: the record was evicted mid-stream.
                    Err(_) => break,
                }
            }

            yield StreamFrame::Ended { events_sent };
        })
    }
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn sample_record() -> ExecutionRecord {
        ExecutionRecord::new(
            "default",
            json!("build a calculator"),
            vec![
                StepProgress {
                    step: "analyst".into(),
                    agent_type: "analyst".into(),
                    status: StepState::Pending,
                    optional: false,
                    detail: None,
                },
                StepProgress {
                    step: "coder".into(),
                    agent_type: "coder".into(),
                    status: StepState::Pending,
                    optional: false,
                    detail: None,
                },
            ],
        )
    }

    #[tokio::test]
    async fn snapshot_is_a_copy_not_a_live_reference() {
        let store = ExecutionStore::new();
        let id = store.insert(sample_record());

        let before = store.snapshot(id).unwrap();
        store
            .update(id, |r| r.set_step("analyst", StepState::Running, None))
            .unwrap();
        let after = store.snapshot(id).unwrap();

        assert_eq!(before.steps[0].status, StepState::Pending);
        assert_eq!(after.steps[0].status, StepState::Running);
    }

    #[tokio::test]
    async fn terminal_snapshots_are_structurally_equal() {
        let store = ExecutionStore::new();
        let id = store.insert(sample_record());
        store
            .update(id, |r| r.finish(ExecutionStatus::Completed, None))
            .unwrap();

        let first = store.snapshot(id).unwrap();
        let second = store.snapshot(id).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_execution_is_an_error() {
        let store = ExecutionStore::new();
        let err = store.snapshot(ExecutionId::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownExecution(_)));
        assert!(store.stream(ExecutionId::new()).is_err());
    }

    #[tokio::test]
    async fn stream_on_terminal_execution_yields_snapshot_then_marker() {
        let store = ExecutionStore::new();
        let id = store.insert(sample_record());
        store
            .update(id, |r| r.finish(ExecutionStatus::Completed, None))
            .unwrap();

        let frames: Vec<StreamFrame> = store.stream(id).unwrap().collect().await;
        assert_eq!(frames.len(), 2);
        assert!(
            matches!(&frames[0], StreamFrame::Snapshot(r) if r.status == ExecutionStatus::Completed)
        );
        assert!(matches!(frames[1], StreamFrame::Ended { events_sent: 1 }));
    }

    #[tokio::test]
    async fn stream_follows_state_changes_to_terminal() {
        let store = ExecutionStore::new();
        let id = store.insert(sample_record());

        let stream = store.stream(id).unwrap();
        let collector = tokio::spawn(async move {
            let frames: Vec<StreamFrame> = stream.collect().await;
            frames
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .update(id, |r| r.set_step("analyst", StepState::Completed, None))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .update(id, |r| r.finish(ExecutionStatus::Completed, None))
            .unwrap();

        let frames = collector.await.unwrap();
        // initial snapshot, one change, terminal change, end marker
        assert!(frames.len() >= 3);
        assert!(matches!(
            frames.last().unwrap(),
            StreamFrame::Ended { events_sent } if *events_sent == frames.len() - 1
        ));
    }

    #[tokio::test]
    async fn stream_frame_count_is_bounded() {
        let store = ExecutionStore::new().with_max_stream_events(3);
        let id = store.insert(sample_record());

        let stream = store.stream(id).unwrap();
        let collector = tokio::spawn(async move {
            let frames: Vec<StreamFrame> = stream.collect().await;
            frames
        });

        // More updates than the bound allows; the run never goes terminal.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            store
                .update(id, |r| {
                    r.warnings.push("tick".into());
                })
                .unwrap();
        }

        let frames = collector.await.unwrap();
        assert_eq!(frames.len(), 4); // 3 snapshots + marker
        assert!(matches!(frames.last().unwrap(), StreamFrame::Ended { events_sent: 3 }));
    }

    #[tokio::test]
    async fn list_reports_progress() {
        let store = ExecutionStore::new();
        let id = store.insert(sample_record());
        store
            .update(id, |r| r.set_step("analyst", StepState::Completed, None))
            .unwrap();

        let summaries = store.list();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].progress_percentage, 50.0);
        assert!(!summaries[0].has_error);
    }
}
