//! WorkerCoordinator - ペア単位の協調実行
//!
//! # 1 ペアの流れ
//! 1. `create_job` でペアのロックを取る（取れなければ Failed、job なし）
//! 2. 各参加者の制御エージェントを readiness で復旧
//! 3. 全参加者に接続（1 台でも失敗したら ConnectionFailed）
//! 4. 参加者ごとにワーカーを起動（少しずつずらす）
//!    - pre バリア → StepPipeline → post バリア
//! 5. バッチの期限までワーカーを定期的に確認し、残っていれば hung として報告
//! 6. 参加者の結果を集計（completed / partial_success / failed）
//!
//! ペア同士は並行に実行します。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::pipeline::{Step, StepPipeline};
use super::readiness::{ReadinessPolicy, ReadinessSupervisor};
use super::registry::JobRegistry;
use crate::cancel::CancelToken;
use crate::config::{BarrierTimeoutPolicy, CoordinatorConfig};
use crate::domain::errors::LockstepError;
use crate::domain::ids::{GroupId, JobId, PairId, ParticipantId, RunId};
use crate::domain::outcome::{BatchReport, PairOutcome, PairStatus, ParticipantOutcome, ParticipantStatus};
use crate::domain::step::{PipelineState, StepContext};
use crate::impls::telemetry::TracingSink;
use crate::ports::barrier::Barrier;
use crate::ports::device::{DeviceCapability, DeviceConnector, PairSpec, ParticipantSpec};
use crate::ports::telemetry::{LogLevel, Metadata, TelemetrySink};

/// Builds each participant's script once its device is connected.
pub trait ScriptFactory: Send + Sync {
    fn build(
        &self,
        participant: &ParticipantSpec,
        device: Arc<dyn DeviceCapability>,
    ) -> Result<Vec<Arc<dyn Step>>, LockstepError>;

    fn initial_context(&self, run_id: RunId, pair: &PairSpec, participant: &ParticipantSpec) -> StepContext {
        StepContext::for_participant(run_id, pair.pair_id.clone(), participant.id.clone())
    }
}

impl<F> ScriptFactory for F
where
    F: Fn(&ParticipantSpec, Arc<dyn DeviceCapability>) -> Result<Vec<Arc<dyn Step>>, LockstepError>
        + Send
        + Sync,
{
    fn build(
        &self,
        participant: &ParticipantSpec,
        device: Arc<dyn DeviceCapability>,
    ) -> Result<Vec<Arc<dyn Step>>, LockstepError> {
        self(participant, device)
    }
}

#[derive(Clone)]
pub struct WorkerCoordinator {
    registry: Arc<JobRegistry>,
    barrier: Arc<dyn Barrier>,
    connector: Arc<dyn DeviceConnector>,
    scripts: Arc<dyn ScriptFactory>,
    config: CoordinatorConfig,
    readiness: ReadinessPolicy,
    sink: Arc<dyn TelemetrySink>,
}

impl WorkerCoordinator {
    pub fn new(
        registry: Arc<JobRegistry>,
        barrier: Arc<dyn Barrier>,
        connector: Arc<dyn DeviceConnector>,
        scripts: Arc<dyn ScriptFactory>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            barrier,
            connector,
            scripts,
            config,
            readiness: ReadinessPolicy::default(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = policy;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Runs every pair concurrently and reports one outcome per pair, in input
    /// order.
    ///
    /// Signalling `cancel` stops every pair at its next boundary. The batch
    /// never waits past `batch_timeout` (plus a short grace) for a pair.
    pub async fn run_batch(&self, run_id: RunId, pairs: Vec<PairSpec>, cancel: &CancelToken) -> BatchReport {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.batch_timeout();
        info!(%run_id, pairs = pairs.len(), "batch started");

        let pair_ids: Vec<PairId> = pairs.iter().map(|p| p.pair_id.clone()).collect();
        let mut tasks = JoinSet::new();
        for (index, pair) in pairs.into_iter().enumerate() {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { (index, this.run_pair(run_id, pair, deadline, cancel).await) });
        }

        let mut slots: Vec<Option<PairOutcome>> = vec![None; pair_ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => error!(%run_id, error = %e, "pair task panicked"),
            }
        }
        let pairs: Vec<PairOutcome> = slots
            .into_iter()
            .zip(pair_ids)
            .map(|(slot, pair_id)| {
                slot.unwrap_or_else(|| PairOutcome::failed(pair_id, None, "pair task panicked"))
            })
            .collect();

        let report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pairs,
        };
        info!(
            %run_id,
            completed = report.count(PairStatus::Completed),
            partial = report.count(PairStatus::PartialSuccess),
            failed = report.count(PairStatus::Failed),
            connection_failed = report.count(PairStatus::ConnectionFailed),
            "batch finished"
        );
        report
    }

    async fn run_pair(&self, run_id: RunId, pair: PairSpec, deadline: Instant, batch_cancel: CancelToken) -> PairOutcome {
        let pair_id = pair.pair_id.clone();
        let mut metadata = BTreeMap::new();
        metadata.insert("participants".to_string(), serde_json::Value::from(pair.participants.len()));

        let job_id = match self
            .registry
            .create_job(run_id, pair_id.clone(), pair.participant_ids(), metadata)
        {
            Ok(job_id) => job_id,
            Err(e) => {
                warn!(%pair_id, error = %e, "pair skipped");
                let outcome = PairOutcome::failed(pair_id, None, e.to_string());
                self.report(&outcome);
                return outcome;
            }
        };

        let (tx, rx) = oneshot::channel();
        let driver = PairDriver {
            coordinator: self.clone(),
            run_id,
            job_id,
            pair: Arc::new(pair),
            deadline,
        };
        let started = self.registry.start_job(job_id, move |token| async move {
            let link = link_cancel(batch_cancel, token.clone());
            let outcome = driver.drive(token).await;
            link.abort();

            let result = match outcome.status {
                PairStatus::Completed | PairStatus::PartialSuccess => Ok(()),
                status => Err(outcome.error.clone().unwrap_or_else(|| status.to_string())),
            };
            let _ = tx.send(outcome);
            result
        });
        if let Err(e) = started {
            error!(%pair_id, %job_id, error = %e, "could not start pair job");
            let outcome = PairOutcome::failed(pair_id, Some(job_id), e.to_string());
            self.report(&outcome);
            return outcome;
        }

        let grace = self.config.liveness_interval() * 2 + Duration::from_secs(1);
        let outcome = match tokio::time::timeout_at(deadline + grace, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // 結果を送る前にワーカーが終わった（force-stop / panic）
                let reason = self
                    .registry
                    .wait_for_job(job_id, grace)
                    .await
                    .ok()
                    .and_then(|job| job.error)
                    .unwrap_or_else(|| "pair worker ended without a result".to_string());
                PairOutcome::failed(pair_id, Some(job_id), reason)
            }
            Err(_) => {
                warn!(%pair_id, %job_id, "pair still running at the batch deadline");
                let _ = self.registry.cancel_job(job_id, grace).await;
                PairOutcome::failed(pair_id, Some(job_id), "pair did not finish before the batch deadline")
            }
        };

        // The worker returns right after sending; let its terminal transition land.
        let _ = self.registry.wait_for_job(job_id, grace).await;
        self.report(&outcome);
        outcome
    }

    fn report(&self, outcome: &PairOutcome) {
        let mut meta = Metadata::new();
        meta.insert("pair_id".into(), outcome.pair_id.to_string());
        meta.insert("status".into(), outcome.status.to_string());
        if let Some(job_id) = outcome.job_id {
            meta.insert("job_id".into(), job_id.to_string());
        }
        if let Some(error) = &outcome.error {
            meta.insert("error".into(), error.clone());
        }
        if !outcome.hung.is_empty() {
            let hung: Vec<&str> = outcome.hung.iter().map(|p| p.as_str()).collect();
            meta.insert("hung".into(), hung.join(","));
        }

        let level = match outcome.status {
            PairStatus::Completed => LogLevel::Info,
            PairStatus::PartialSuccess => LogLevel::Warn,
            PairStatus::Failed | PairStatus::ConnectionFailed => LogLevel::Error,
        };
        self.sink.record_log(level, "pair finished", &meta);
        self.sink
            .record_metric(&format!("pairs.{}", outcome.status), 1.0);
    }

    /// `i * stagger + uniform(0, jitter)` for each participant.
    fn stagger_delays(&self, count: usize) -> Vec<Duration> {
        let mut rng = rand::thread_rng();
        let jitter = self.config.stagger_jitter_ms;
        (0..count)
            .map(|i| {
                self.config.stagger() * i as u32 + Duration::from_millis(rng.gen_range(0..=jitter))
            })
            .collect()
    }
}

/// Forwards a batch-wide cancel into one job's token.
fn link_cancel(batch: CancelToken, job: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = batch.cancelled() => job.signal(),
            _ = job.cancelled() => {}
        }
    })
}

/// Progress of one pair: completed steps over total steps of every participant.
struct PairProgress {
    registry: Arc<JobRegistry>,
    job_id: JobId,
    table: Mutex<Vec<(usize, usize)>>,
}

impl PairProgress {
    fn new(registry: Arc<JobRegistry>, job_id: JobId, participants: usize) -> Self {
        Self {
            registry,
            job_id,
            table: Mutex::new(vec![(0, 0); participants]),
        }
    }

    fn update(&self, slot: usize, done: usize, total: usize, message: String) {
        let pct = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = table.get_mut(slot) {
                *entry = (done, total);
            }
            let (done, total) = table
                .iter()
                .fold((0, 0), |(d, t), (done, total)| (d + done, t + total));
            if total == 0 { 0 } else { (done * 100 / total) as u8 }
        };
        if let Err(e) = self.registry.update_progress(self.job_id, pct, Some(message)) {
            debug!(job_id = %self.job_id, error = %e, "progress update dropped");
        }
    }
}

/// Drives one pair inside its registry job.
struct PairDriver {
    coordinator: WorkerCoordinator,
    run_id: RunId,
    job_id: JobId,
    pair: Arc<PairSpec>,
    deadline: Instant,
}

impl PairDriver {
    async fn drive(&self, token: CancelToken) -> PairOutcome {
        let pair_id = &self.pair.pair_id;
        let mut outcome = PairOutcome {
            pair_id: pair_id.clone(),
            job_id: Some(self.job_id),
            status: PairStatus::Failed,
            participants: Vec::new(),
            hung: Vec::new(),
            error: None,
        };

        if self.coordinator.config.readiness_enabled {
            if let Err(e) = self.ensure_ready(&token).await {
                error!(%pair_id, error = %e, "readiness failed");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        let devices = match self.connect_all().await {
            Ok(devices) => devices,
            Err(e) => {
                outcome.status = PairStatus::ConnectionFailed;
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let workers_cancel = token.child();
        let progress = Arc::new(PairProgress::new(
            Arc::clone(&self.coordinator.registry),
            self.job_id,
            devices.len(),
        ));
        let delays = self.coordinator.stagger_delays(devices.len());
        let mut handles = Vec::with_capacity(devices.len());
        for (slot, ((spec, device), delay)) in devices.into_iter().zip(delays).enumerate() {
            let participant = spec.id.clone();
            let worker = ParticipantWorker {
                coordinator: self.coordinator.clone(),
                run_id: self.run_id,
                pair: Arc::clone(&self.pair),
                spec,
                device,
                slot,
                progress: Arc::clone(&progress),
            };
            debug!(%pair_id, %participant, ?delay, "worker scheduled");
            handles.push((participant, tokio::spawn(worker.run(delay, workers_cancel.clone()))));
        }

        outcome.hung = self.watch_workers(&handles).await;
        if !outcome.hung.is_empty() {
            workers_cancel.signal();
        }

        for (participant, handle) in handles {
            if outcome.hung.contains(&participant) {
                handle.abort();
                let mut hung = ParticipantOutcome::new(participant);
                hung.error = Some("still running at the batch deadline".into());
                outcome.participants.push(hung);
                continue;
            }
            match handle.await {
                Ok(result) => outcome.participants.push(result),
                Err(e) => {
                    let mut failed = ParticipantOutcome::new(participant);
                    failed.error = Some(format!("worker panicked: {e}"));
                    outcome.participants.push(failed);
                }
            }
        }

        outcome.status = PairStatus::aggregate(&outcome.participants);
        let errors: Vec<String> = outcome
            .participants
            .iter()
            .filter_map(|p| p.error.as_ref().map(|e| format!("{}: {e}", p.participant)))
            .collect();
        if !errors.is_empty() {
            outcome.error = Some(errors.join("; "));
        }

        self.disconnect_all().await;
        info!(%pair_id, status = %outcome.status, hung = outcome.hung.len(), "pair done");
        outcome
    }

    async fn ensure_ready(&self, cancel: &CancelToken) -> Result<(), LockstepError> {
        for spec in &self.pair.participants {
            let agent = self.coordinator.connector.control_agent(spec);
            let report = ReadinessSupervisor::new(agent, self.coordinator.readiness)
                .ensure_ready(cancel)
                .await?;
            debug!(participant = %spec.id, attempts = report.attempts, "participant ready");
        }
        Ok(())
    }

    async fn connect_all(&self) -> Result<Vec<(ParticipantSpec, Arc<dyn DeviceCapability>)>, LockstepError> {
        let mut connected = Vec::with_capacity(self.pair.participants.len());
        let mut first_failure = None;
        for spec in &self.pair.participants {
            match self.coordinator.connector.connect(spec).await {
                Ok(device) => connected.push((spec.clone(), device)),
                Err(e) => {
                    warn!(pair_id = %self.pair.pair_id, participant = %spec.id, endpoint = %spec.endpoint, error = %e, "connection failed");
                    first_failure.get_or_insert(LockstepError::Connection {
                        participant: spec.id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        match first_failure {
            None => Ok(connected),
            Some(err) => {
                for (spec, _) in &connected {
                    self.disconnect(spec).await;
                }
                Err(err)
            }
        }
    }

    async fn disconnect_all(&self) {
        for spec in &self.pair.participants {
            self.disconnect(spec).await;
        }
    }

    async fn disconnect(&self, spec: &ParticipantSpec) {
        if let Err(e) = self.coordinator.connector.disconnect(spec).await {
            debug!(participant = %spec.id, error = %e, "disconnect failed");
        }
    }

    /// Polls until every worker finished or the batch deadline passed.
    /// Returns the workers still running at the deadline.
    async fn watch_workers(&self, handles: &[(ParticipantId, JoinHandle<ParticipantOutcome>)]) -> Vec<ParticipantId> {
        let interval = self.coordinator.config.liveness_interval();
        loop {
            if handles.iter().all(|(_, h)| h.is_finished()) {
                return Vec::new();
            }
            let now = Instant::now();
            if now >= self.deadline {
                let hung: Vec<ParticipantId> = handles
                    .iter()
                    .filter(|(_, h)| !h.is_finished())
                    .map(|(p, _)| p.clone())
                    .collect();
                warn!(pair_id = %self.pair.pair_id, ?hung, "workers hung past the batch deadline");
                return hung;
            }
            tokio::time::sleep(interval.min(self.deadline - now)).await;
        }
    }
}

/// pre barrier → script → post barrier for one participant.
struct ParticipantWorker {
    coordinator: WorkerCoordinator,
    run_id: RunId,
    pair: Arc<PairSpec>,
    spec: ParticipantSpec,
    device: Arc<dyn DeviceCapability>,
    slot: usize,
    progress: Arc<PairProgress>,
}

enum BarrierResult {
    Released,
    /// Timed out; go on degraded.
    Degraded,
    Stop(ParticipantStatus, Option<String>),
}

impl ParticipantWorker {
    async fn run(self, delay: Duration, cancel: CancelToken) -> ParticipantOutcome {
        let mut outcome = ParticipantOutcome::new(self.spec.id.clone());
        if !cancel.sleep(delay).await {
            outcome.status = ParticipantStatus::Stopped;
            return outcome;
        }

        match self.barrier("pre", self.coordinator.config.pre_barrier_timeout(), &cancel).await {
            BarrierResult::Released => {}
            BarrierResult::Degraded => outcome.pre_barrier_timed_out = true,
            BarrierResult::Stop(status, error) => {
                outcome.status = status;
                outcome.error = error;
                return outcome;
            }
        }

        let action = self.perform(&mut outcome, &cancel).await;
        match &action {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                outcome.status = ParticipantStatus::Stopped;
                return outcome;
            }
            Err(e) => {
                warn!(participant = %self.spec.id, error = %e, "script failed");
                outcome.error = Some(e.to_string());
            }
        }

        // 失敗しても post バリアには到着する（相手を待たせない）
        match self.barrier("post", self.coordinator.config.post_barrier_timeout(), &cancel).await {
            BarrierResult::Released => {}
            BarrierResult::Degraded => outcome.post_barrier_timed_out = true,
            BarrierResult::Stop(status, error) => {
                if action.is_ok() {
                    outcome.status = status;
                    outcome.error = error;
                }
                return outcome;
            }
        }

        if action.is_ok() {
            outcome.status = ParticipantStatus::Completed;
            let total = outcome.steps.len();
            self.progress
                .update(self.slot, total, total, format!("{}: done", self.spec.id));
        }
        outcome
    }

    async fn barrier(&self, phase: &str, timeout: Duration, cancel: &CancelToken) -> BarrierResult {
        let group = GroupId::for_phase(&self.run_id, &self.pair.pair_id, phase);
        let required = self.pair.participants.len();
        let result = self
            .coordinator
            .barrier
            .rendezvous(&group, &self.spec.id, required, timeout, cancel)
            .await;

        match result {
            Ok(true) => BarrierResult::Released,
            Ok(false) => {
                let err = LockstepError::BarrierTimeout {
                    group: group.to_string(),
                    required,
                    timeout,
                };
                match self.coordinator.config.barrier_timeout_policy {
                    BarrierTimeoutPolicy::Proceed => {
                        warn!(participant = %self.spec.id, error = %err, "proceeding without the barrier");
                        BarrierResult::Degraded
                    }
                    BarrierTimeoutPolicy::Abort => {
                        BarrierResult::Stop(ParticipantStatus::Failed, Some(err.to_string()))
                    }
                }
            }
            Err(e) if e.is_cancelled() => BarrierResult::Stop(ParticipantStatus::Stopped, None),
            Err(e) => BarrierResult::Stop(ParticipantStatus::Failed, Some(e.to_string())),
        }
    }

    async fn perform(&self, outcome: &mut ParticipantOutcome, cancel: &CancelToken) -> Result<(), LockstepError> {
        let steps = self
            .coordinator
            .scripts
            .build(&self.spec, Arc::clone(&self.device))?;

        let progress = Arc::clone(&self.progress);
        let participant = self.spec.id.clone();
        let slot = self.slot;
        let mut pipeline = StepPipeline::new(steps)?
            .with_cancel(cancel.clone())
            .with_progress(Arc::new(move |index: usize, total: usize, name: &str| {
                progress.update(slot, index, total, format!("{participant}: {name}"));
            }));
        let handle = pipeline.handle();

        let ctx = self
            .coordinator
            .scripts
            .initial_context(self.run_id, &self.pair, &self.spec);
        let result = pipeline.run(ctx).await;
        outcome.steps = handle.list_steps();

        match result {
            Ok(_) if handle.state() == PipelineState::Stopped => Err(LockstepError::Cancelled),
            Ok(_) => Ok(()),
            Err(abort) => Err(abort.into()),
        }
    }
}
