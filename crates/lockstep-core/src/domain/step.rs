//! Step bookkeeping and the per-run execution context.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PairId, ParticipantId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Pipeline-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Running,
    Paused,
    /// Left the step loop at a boundary because of `stop()` or cancellation.
    Stopped,
    /// Every step completed.
    Finished,
    /// A step failed.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            error: None,
            finished_at: None,
        }
    }

    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.error = None;
        self.finished_at = None;
    }
}

/// One row of `list_steps()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
}

/// Context passed into and returned from each step of one pipeline run.
///
/// The identity fields are known before the run starts. `values` is for data
/// steps hand to each other (e.g. a captured UI dump, a looked-up user id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub run_id: Option<RunId>,
    pub pair_id: Option<PairId>,
    pub participant_id: Option<ParticipantId>,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_participant(run_id: RunId, pair_id: PairId, participant_id: ParticipantId) -> Self {
        Self {
            run_id: Some(run_id),
            pair_id: Some(pair_id),
            participant_id: Some(participant_id),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }
}
