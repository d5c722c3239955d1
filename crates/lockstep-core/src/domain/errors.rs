//! Errors - エラー型と分類
//!
//! Every failure the orchestration layer can report flows through
//! [`LockstepError`]. [`ErrorKind`] is the operational classification callers
//! use to decide between "try again later" and "give up on this endpoint".

use std::time::Duration;

use thiserror::Error;

use super::ids::{JobId, PairId};
use super::job::JobStatus;
use crate::ports::device::DeviceError;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（後で再実行すれば通る可能性がある）
/// - Permanent: 恒久的なエラー（同じ入力で再実行しても無意味）
/// - Infrastructure: インフラエラー（ファイル・プロセス・接続の障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum LockstepError {
    /// A step's precondition was not met.
    #[error("validation failed for step {step}: {reason}")]
    ValidationFailure { step: String, reason: String },

    /// A step's action raised.
    #[error("execution failed in step {step}: {reason}")]
    ExecutionFailure { step: String, reason: String },

    /// `create_job` was called for a pair that already has an active job.
    #[error("pair {pair_id} is already running (job: {job_id})")]
    LockConflict { pair_id: PairId, job_id: JobId },

    /// Not fatal on its own; the coordinator's timeout policy decides.
    #[error("barrier {group} timed out after {timeout:?} waiting for {required} participants")]
    BarrierTimeout {
        group: String,
        required: usize,
        timeout: Duration,
    },

    /// The readiness supervisor used every attempt. Never retried upstream.
    #[error("control agent not ready for {endpoint} after {attempts} attempts: {last_error}")]
    ReadinessExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job_id} is {status}, expected pending")]
    InvalidJobState { job_id: JobId, status: JobStatus },

    #[error("pipeline has no steps")]
    EmptyPipeline,

    #[error("step index {index} out of range (pipeline has {len} steps)")]
    StepIndexOutOfRange { index: usize, len: usize },

    #[error("connection to {participant} failed: {reason}")]
    Connection { participant: String, reason: String },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LockstepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockstepError::LockConflict { .. }
            | LockstepError::BarrierTimeout { .. }
            | LockstepError::Cancelled => ErrorKind::Transient,
            LockstepError::ReadinessExhausted { .. }
            | LockstepError::Connection { .. }
            | LockstepError::Device(_)
            | LockstepError::Io(_) => ErrorKind::Infrastructure,
            LockstepError::ValidationFailure { .. }
            | LockstepError::ExecutionFailure { .. }
            | LockstepError::JobNotFound(_)
            | LockstepError::InvalidJobState { .. }
            | LockstepError::EmptyPipeline
            | LockstepError::StepIndexOutOfRange { .. }
            | LockstepError::Config(_)
            | LockstepError::Json(_)
            | LockstepError::Other(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LockstepError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::lock(LockstepError::LockConflict { pair_id: PairId::new("p1"), job_id: JobId::new() }, ErrorKind::Transient)]
    #[case::readiness(LockstepError::ReadinessExhausted { endpoint: "10.0.0.2:5555".into(), attempts: 3, last_error: "port closed".into() }, ErrorKind::Infrastructure)]
    #[case::validation(LockstepError::ValidationFailure { step: "open".into(), reason: "no app".into() }, ErrorKind::Permanent)]
    fn errors_are_classified(#[case] err: LockstepError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn readiness_message_names_endpoint_and_attempts() {
        let err = LockstepError::ReadinessExhausted {
            endpoint: "10.0.0.2:5555".into(),
            attempts: 3,
            last_error: "port closed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.2:5555"));
        assert!(msg.contains("3 attempts"));
    }
}
