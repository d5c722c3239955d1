//! Domain model (IDs, records, outcomes, errors).

pub mod barrier;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod step;

pub use barrier::{Arrival, BarrierPhase, BarrierRecord};
pub use errors::{ErrorKind, LockstepError};
pub use ids::{GroupId, JobId, PairId, ParticipantId, RunId};
pub use job::{JobRecord, JobSnapshot, JobStatus};
pub use outcome::{BatchReport, PairOutcome, PairStatus, ParticipantOutcome, ParticipantStatus};
pub use step::{PipelineState, StepContext, StepRecord, StepStatus, StepView};
