//! Job record and status management.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, PairId, ParticipantId, RunId};

/// Job status.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`. A pending job can
/// also be cancelled before it ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Pending or running; only active jobs hold their pair lock.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Job record: one pair's run, owned by the registry.
///
/// Callers only ever see clones of it. State transitions go through methods so
/// that the terminal status is assigned exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub run_id: RunId,
    pub pair_id: PairId,
    pub participants: Vec<ParticipantId>,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,

    /// 0..=100
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Read-only copy of a [`JobRecord`] handed out by the registry.
pub type JobSnapshot = JobRecord;

impl JobRecord {
    pub fn new(
        job_id: JobId,
        run_id: RunId,
        pair_id: PairId,
        participants: Vec<ParticipantId>,
        metadata: BTreeMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            run_id,
            pair_id,
            participants,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            stopped_at: None,
            progress: 0,
            message: String::new(),
            error: None,
            metadata,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
    }

    /// Assigns a terminal status. Returns `false` (and changes nothing) if the
    /// job was already terminal.
    pub fn mark_terminal(
        &mut self,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.stopped_at = Some(now);
        if status == JobStatus::Completed {
            self.progress = 100;
        }
        if let Some(err) = error {
            self.message = err.clone();
            self.error = Some(err);
        }
        true
    }

    pub fn set_progress(&mut self, pct: u8, message: Option<String>) {
        self.progress = pct.min(100);
        if let Some(message) = message {
            self.message = message;
        }
    }

    /// Terminal and stopped longer than `max_age` ago. Active jobs never expire.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        let since = self.stopped_at.unwrap_or(self.created_at);
        now.signed_duration_since(since) > to_chrono(max_age)
    }
}

/// std の Duration を chrono に変換（範囲外は 1 年に丸める）
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
