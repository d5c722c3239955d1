//! Outcome - バッチ実行の結果
//!
//! Participant results roll up into a per-pair status, and pair results into a
//! [`BatchReport`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, PairId, ParticipantId, RunId};
use super::step::StepView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Completed,
    Failed,
    /// Stopped at a boundary by cancellation.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantOutcome {
    pub participant: ParticipantId,
    pub status: ParticipantStatus,
    /// The pre-action barrier timed out and the participant went on degraded.
    pub pre_barrier_timed_out: bool,
    pub post_barrier_timed_out: bool,
    pub error: Option<String>,
    pub steps: Vec<StepView>,
}

impl ParticipantOutcome {
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            status: ParticipantStatus::Failed,
            pre_barrier_timed_out: false,
            post_barrier_timed_out: false,
            error: None,
            steps: Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.pre_barrier_timed_out || self.post_barrier_timed_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Completed,
    PartialSuccess,
    Failed,
    ConnectionFailed,
}

impl PairStatus {
    /// All participants completed -> Completed, some -> PartialSuccess,
    /// none -> Failed.
    pub fn aggregate(participants: &[ParticipantOutcome]) -> Self {
        let ok = participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Completed)
            .count();
        if participants.is_empty() || ok == 0 {
            PairStatus::Failed
        } else if ok == participants.len() {
            PairStatus::Completed
        } else {
            PairStatus::PartialSuccess
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PairStatus::Completed => "completed",
            PairStatus::PartialSuccess => "partial_success",
            PairStatus::Failed => "failed",
            PairStatus::ConnectionFailed => "connection_failed",
        }
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub pair_id: PairId,
    /// `None` when the pair never got a job (lock conflict).
    pub job_id: Option<JobId>,
    pub status: PairStatus,
    pub participants: Vec<ParticipantOutcome>,
    /// Workers still running when the batch deadline passed.
    pub hung: Vec<ParticipantId>,
    pub error: Option<String>,
}

impl PairOutcome {
    pub fn failed(pair_id: PairId, job_id: Option<JobId>, error: impl Into<String>) -> Self {
        Self {
            pair_id,
            job_id,
            status: PairStatus::Failed,
            participants: Vec::new(),
            hung: Vec::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs: Vec<PairOutcome>,
}

impl BatchReport {
    pub fn count(&self, status: PairStatus) -> usize {
        self.pairs.iter().filter(|p| p.status == status).count()
    }

    pub fn pair(&self, pair_id: &PairId) -> Option<&PairOutcome> {
        self.pairs.iter().find(|p| &p.pair_id == pair_id)
    }
}
