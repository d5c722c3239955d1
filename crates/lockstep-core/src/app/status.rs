//! Status - レジストリの集計ビュー

use serde::{Deserialize, Serialize};

use crate::domain::job::{JobRecord, JobStatus};

/// Per-status tallies over the registry's job table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Pairs currently holding a lock.
    pub locked_pairs: usize,
}

impl RegistryCounts {
    pub fn tally<'a>(jobs: impl IntoIterator<Item = &'a JobRecord>, locked_pairs: usize) -> Self {
        let mut counts = Self {
            locked_pairs,
            ..Self::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}
