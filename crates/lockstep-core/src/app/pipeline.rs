//! StepPipeline - ステップの順次実行
//!
//! # ステップの状態遷移
//! - pending → (validate 失敗) → failed
//! - pending → running → completed
//! - running → (execute 失敗) → failed
//!
//! 失敗したステップ以降は pending のまま実行されません。
//! pause / resume / stop はステップの境界でのみ効きます（ステップの途中では止めない）。
//! リトライはしません。必要なら呼び出し側が新しい run を行います。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::domain::errors::LockstepError;
use crate::domain::step::{PipelineState, StepContext, StepRecord, StepStatus, StepView};

/// One scripted action with an explicit precondition.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Checked right before `execute`. `Ok(false)` aborts the run.
    async fn validate(&self, ctx: &StepContext) -> Result<bool, LockstepError>;

    async fn execute(&self, ctx: StepContext) -> Result<StepContext, LockstepError>;
}

/// `(index, total, step name)`, called before each step. `index` is 0-based.
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// A step failed; the run stopped there.
#[derive(Debug, Error)]
#[error("pipeline aborted at step {index} ({step}): {source}")]
pub struct PipelineAbort {
    pub index: usize,
    pub step: String,
    #[source]
    pub source: LockstepError,
    /// Context after the last completed step.
    pub context: StepContext,
}

impl From<PipelineAbort> for LockstepError {
    fn from(abort: PipelineAbort) -> Self {
        abort.source
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Control {
    paused: bool,
    stopped: bool,
}

struct Shared {
    control: watch::Sender<Control>,
    state: Mutex<PipelineState>,
    records: Mutex<Vec<StepRecord>>,
}

impl Shared {
    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn update_record(&self, index: usize, status: StepStatus, error: Option<String>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(index) {
            record.status = status;
            record.error = error;
            if matches!(status, StepStatus::Completed | StepStatus::Failed) {
                record.finished_at = Some(Utc::now());
            }
        }
    }
}

/// Cloneable control surface for a pipeline that may be running elsewhere.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Takes effect before the next step starts.
    pub fn pause(&self) {
        self.shared.control.send_modify(|c| c.paused = true);
    }

    pub fn resume(&self) {
        self.shared.control.send_modify(|c| c.paused = false);
    }

    /// Leave the step loop at the next boundary. Not an error.
    pub fn stop(&self) {
        self.shared.control.send_modify(|c| c.stopped = true);
    }

    pub fn state(&self) -> PipelineState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn list_steps(&self) -> Vec<StepView> {
        self.shared
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .enumerate()
            .map(|(index, r)| StepView {
                index,
                name: r.name.clone(),
                status: r.status,
                error: r.error.clone(),
            })
            .collect()
    }
}

pub struct StepPipeline {
    steps: Vec<Arc<dyn Step>>,
    shared: Arc<Shared>,
    progress: Option<ProgressFn>,
    cancel: CancelToken,
}

impl StepPipeline {
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Result<Self, LockstepError> {
        if steps.is_empty() {
            return Err(LockstepError::EmptyPipeline);
        }
        let records = steps.iter().map(|s| StepRecord::new(s.name())).collect();
        let (control, _) = watch::channel(Control::default());
        Ok(Self {
            steps,
            shared: Arc::new(Shared {
                control,
                state: Mutex::new(PipelineState::NotStarted),
                records: Mutex::new(records),
            }),
            progress: None,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cancellation is checked at every step boundary and behaves like `stop`.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Back to `NotStarted` with every step pending. Clears a previous `stop`.
    pub fn reset(&self) {
        for record in self
            .shared
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter_mut()
        {
            record.reset();
        }
        self.shared.control.send_modify(|c| c.stopped = false);
        self.shared.set_state(PipelineState::NotStarted);
    }

    /// Runs every step in order.
    ///
    /// Returns the final context when all steps completed or the run was
    /// stopped at a boundary; [`PipelineAbort`] when a step failed. Each run
    /// starts fresh: a `stop` from a previous run does not carry over.
    pub async fn run(&mut self, initial: StepContext) -> Result<StepContext, PipelineAbort> {
        {
            let mut records = self.shared.records.lock().unwrap_or_else(|e| e.into_inner());
            records.iter_mut().for_each(StepRecord::reset);
        }
        self.shared.control.send_modify(|c| c.stopped = false);
        self.shared.set_state(PipelineState::Running);

        let total = self.steps.len();
        let mut ctx = initial;
        for index in 0..total {
            if !self.wait_at_boundary().await {
                info!(index, total, "pipeline stopped");
                self.shared.set_state(PipelineState::Stopped);
                return Ok(ctx);
            }

            let name = self.steps[index].name().to_string();
            if let Some(progress) = &self.progress {
                progress(index, total, &name);
            }

            match self.attempt(index, &ctx).await {
                Ok(next) => ctx = next,
                Err(source) => {
                    let state = if source.is_cancelled() {
                        PipelineState::Stopped
                    } else {
                        PipelineState::Aborted
                    };
                    self.shared.set_state(state);
                    warn!(index, step = %name, error = %source, "pipeline aborted");
                    return Err(PipelineAbort {
                        index,
                        step: name,
                        source,
                        context: ctx,
                    });
                }
            }
        }

        self.shared.set_state(PipelineState::Finished);
        debug!(total, "pipeline finished");
        Ok(ctx)
    }

    /// Runs a single step outside the normal loop.
    pub async fn run_step(&self, index: usize, ctx: StepContext) -> Result<StepContext, LockstepError> {
        if index >= self.steps.len() {
            return Err(LockstepError::StepIndexOutOfRange {
                index,
                len: self.steps.len(),
            });
        }
        self.attempt(index, &ctx).await
    }

    async fn attempt(&self, index: usize, ctx: &StepContext) -> Result<StepContext, LockstepError> {
        let step = &self.steps[index];
        let name = step.name();

        let valid = match step.validate(ctx).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LockstepError::ValidationFailure {
                step: name.to_string(),
                reason: "precondition not met".into(),
            }),
            Err(e) => Err(as_validation_failure(name, e)),
        };
        if let Err(err) = valid {
            self.shared
                .update_record(index, StepStatus::Failed, Some(err.to_string()));
            return Err(err);
        }

        self.shared.update_record(index, StepStatus::Running, None);
        debug!(index, step = name, "executing step");
        match step.execute(ctx.clone()).await {
            Ok(next) => {
                self.shared.update_record(index, StepStatus::Completed, None);
                Ok(next)
            }
            Err(LockstepError::Cancelled) => {
                self.shared
                    .update_record(index, StepStatus::Failed, Some("cancelled".into()));
                Err(LockstepError::Cancelled)
            }
            Err(e) => {
                let err = as_execution_failure(name, e);
                self.shared
                    .update_record(index, StepStatus::Failed, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Blocks while paused. Returns `false` when the run should stop.
    async fn wait_at_boundary(&self) -> bool {
        let mut rx = self.shared.control.subscribe();
        loop {
            let control = *rx.borrow_and_update();
            if control.stopped || self.cancel.is_cancelled() {
                return false;
            }
            if !control.paused {
                self.shared.set_state(PipelineState::Running);
                return true;
            }

            self.shared.set_state(PipelineState::Paused);
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

fn as_validation_failure(step: &str, err: LockstepError) -> LockstepError {
    match err {
        e @ LockstepError::ValidationFailure { .. } => e,
        other => LockstepError::ValidationFailure {
            step: step.to_string(),
            reason: other.to_string(),
        },
    }
}

fn as_execution_failure(step: &str, err: LockstepError) -> LockstepError {
    match err {
        e @ LockstepError::ExecutionFailure { .. } => e,
        other => LockstepError::ExecutionFailure {
            step: step.to_string(),
            reason: other.to_string(),
        },
    }
}
