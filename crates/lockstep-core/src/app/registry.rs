//! JobRegistry - ジョブのライフサイクルとペアの排他
//!
//! # 不変条件
//! - ペア ID が pair_locks にあるのは、そのジョブが pending / running の間だけ
//! - 終了状態（completed / failed / cancelled）はワーカーのラッパーが 1 回だけ設定する
//! - sweep は終了状態かつ max_age より古いジョブだけを消す
//!
//! # ロックの扱い
//! ジョブ表とペア表の更新はすべて 1 つの std Mutex の中で行います。
//! ワーカー本体（`work`）はロックの外で動き、ロックを `.await` をまたいで保持しません。

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::status::RegistryCounts;
use crate::cancel::CancelToken;
use crate::config::RegistryConfig;
use crate::domain::errors::LockstepError;
use crate::domain::ids::{JobId, PairId, ParticipantId, RunId};
use crate::domain::job::{JobRecord, JobStatus};
use crate::ports::clock::Clock;
use crate::ports::telemetry::{LogLevel, Metadata, TelemetrySink};

struct JobEntry {
    record: JobRecord,
    cancel: CancelToken,
    /// Flips to `true` once the terminal status is set.
    done: watch::Sender<bool>,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<JobId, JobEntry>,
    pair_locks: HashMap<PairId, JobId>,
}

/// Tracks jobs and enforces one active job per pair.
///
/// Construct with [`JobRegistry::new`] inside a tokio runtime and call
/// [`shutdown`](Self::shutdown) when done.
pub struct JobRegistry {
    state: Mutex<RegistryState>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
    shutdown: CancelToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl JobRegistry {
    /// Creates the registry and spawns its background sweep.
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>, sink: Arc<dyn TelemetrySink>) -> Arc<Self> {
        let registry = Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            config,
            clock,
            sink,
            shutdown: CancelToken::new(),
            sweeper: Mutex::new(None),
        });

        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(&registry),
            registry.config.sweep_interval(),
            registry.shutdown.clone(),
        ));
        *registry.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocates a pending job and takes the pair's lock.
    ///
    /// Fails with `LockConflict` if the pair already has a pending or running job.
    pub fn create_job(
        &self,
        run_id: RunId,
        pair_id: PairId,
        participants: Vec<ParticipantId>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobId, LockstepError> {
        let record = {
            let mut st = self.lock();
            if let Some(existing) = st.pair_locks.get(&pair_id) {
                return Err(LockstepError::LockConflict {
                    pair_id,
                    job_id: *existing,
                });
            }

            let job_id = JobId::new();
            let record = JobRecord::new(
                job_id,
                run_id,
                pair_id.clone(),
                participants,
                metadata,
                self.clock.now(),
            );
            let (done, _) = watch::channel(false);
            st.jobs.insert(
                job_id,
                JobEntry {
                    record: record.clone(),
                    cancel: CancelToken::new(),
                    done,
                    abort: None,
                },
            );
            st.pair_locks.insert(pair_id, job_id);
            record
        };

        info!(job_id = %record.job_id, pair_id = %record.pair_id, run_id = %record.run_id, "job created");
        self.sink
            .record_log(LogLevel::Info, "job created", &job_metadata(&record));
        self.sink.record_metric("jobs.created", 1.0);
        Ok(record.job_id)
    }

    /// Starts a pending job's worker.
    ///
    /// `work` receives the job's cancel token and runs on its own task, outside
    /// the registry lock. When it ends the job becomes `cancelled` if the token
    /// was signalled, else `completed` on `Ok`, else `failed` with the error text.
    pub fn start_job<F, Fut, E>(self: &Arc<Self>, job_id: JobId, work: F) -> Result<bool, LockstepError>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let token = {
            let mut st = self.lock();
            let entry = st
                .jobs
                .get_mut(&job_id)
                .ok_or(LockstepError::JobNotFound(job_id))?;
            if entry.record.status != JobStatus::Pending {
                return Err(LockstepError::InvalidJobState {
                    job_id,
                    status: entry.record.status,
                });
            }
            entry.record.mark_running(self.clock.now());
            entry.cancel.clone()
        };

        let inner = tokio::spawn(work(token.clone()));
        if let Some(entry) = self.lock().jobs.get_mut(&job_id) {
            entry.abort = Some(inner.abort_handle());
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let (status, error) = match inner.await {
                Ok(_) if token.is_cancelled() => (JobStatus::Cancelled, None),
                Ok(Ok(())) => (JobStatus::Completed, None),
                Ok(Err(e)) => (JobStatus::Failed, Some(e.to_string())),
                Err(join) if join.is_cancelled() => {
                    (JobStatus::Cancelled, Some("force-stopped".to_string()))
                }
                Err(join) => (JobStatus::Failed, Some(format!("worker panicked: {join}"))),
            };
            registry.finish(job_id, status, error);
        });

        debug!(%job_id, "job started");
        Ok(true)
    }

    /// Terminal transition. Sets `stopped_at`, releases the pair lock and wakes
    /// anyone waiting on the job. No-op if already terminal.
    fn finish(&self, job_id: JobId, status: JobStatus, error: Option<String>) {
        let record = {
            let mut st = self.lock();
            let now = self.clock.now();
            match terminate_locked(&mut st, job_id, status, error, now) {
                Some(record) => record,
                None => return,
            }
        };
        self.report_terminal(&record);
    }

    fn report_terminal(&self, record: &JobRecord) {
        let meta = job_metadata(record);
        match record.status {
            JobStatus::Failed => {
                warn!(job_id = %record.job_id, pair_id = %record.pair_id, error = ?record.error, "job failed");
                self.sink.record_log(LogLevel::Warn, "job failed", &meta);
            }
            status => {
                info!(job_id = %record.job_id, pair_id = %record.pair_id, %status, "job finished");
                self.sink.record_log(LogLevel::Info, "job finished", &meta);
            }
        }
        self.sink
            .record_metric(&format!("jobs.{}", record.status), 1.0);
    }

    /// Signals the job and waits up to `timeout` for its worker to stop.
    ///
    /// Returns `Ok(false)` if the worker is still running after the timeout; the
    /// status is left untouched in that case. A pending job is cancelled
    /// immediately.
    pub async fn cancel_job(&self, job_id: JobId, timeout: Duration) -> Result<bool, LockstepError> {
        let mut done = {
            let mut st = self.lock();
            let entry = st
                .jobs
                .get_mut(&job_id)
                .ok_or(LockstepError::JobNotFound(job_id))?;
            match entry.record.status {
                s if s.is_terminal() => return Ok(true),
                JobStatus::Pending => {
                    let now = self.clock.now();
                    let record = terminate_locked(&mut st, job_id, JobStatus::Cancelled, None, now);
                    drop(st);
                    if let Some(record) = record {
                        self.report_terminal(&record);
                    }
                    return Ok(true);
                }
                _ => {
                    entry.cancel.signal();
                    entry.done.subscribe()
                }
            }
        };

        let stopped = tokio::time::timeout(timeout, done.wait_for(|d| *d))
            .await
            .is_ok();
        if !stopped {
            warn!(%job_id, ?timeout, "job did not stop in time");
        }
        Ok(stopped)
    }

    /// Waits up to `timeout` for the job to reach a terminal status without
    /// signalling it. Returns the snapshot at that point.
    pub async fn wait_for_job(&self, job_id: JobId, timeout: Duration) -> Result<JobRecord, LockstepError> {
        let mut done = {
            let st = self.lock();
            let entry = st.jobs.get(&job_id).ok_or(LockstepError::JobNotFound(job_id))?;
            entry.done.subscribe()
        };
        let _ = tokio::time::timeout(timeout, done.wait_for(|d| *d)).await;
        self.get_job(job_id).ok_or(LockstepError::JobNotFound(job_id))
    }

    /// Cancels the pair's current job. No job means nothing to do.
    pub async fn cancel_pair(&self, pair_id: &PairId, timeout: Duration) -> Result<bool, LockstepError> {
        let job_id = self.lock().pair_locks.get(pair_id).copied();
        match job_id {
            Some(job_id) => self.cancel_job(job_id, timeout).await,
            None => Ok(true),
        }
    }

    /// Signals every active job, then waits for each with an equal share of
    /// `timeout`.
    pub async fn cancel_all(&self, timeout: Duration) -> HashMap<JobId, bool> {
        let mut results = HashMap::new();
        let mut pending_records = Vec::new();
        let running: Vec<(JobId, watch::Receiver<bool>)> = {
            let mut st = self.lock();
            let now = self.clock.now();

            let pending: Vec<JobId> = st
                .jobs
                .values()
                .filter(|e| e.record.status == JobStatus::Pending)
                .map(|e| e.record.job_id)
                .collect();
            for job_id in pending {
                if let Some(record) = terminate_locked(&mut st, job_id, JobStatus::Cancelled, None, now) {
                    pending_records.push(record);
                }
                results.insert(job_id, true);
            }

            let running: Vec<_> = st
                .jobs
                .values()
                .filter(|e| e.record.status == JobStatus::Running)
                .map(|e| {
                    e.cancel.signal();
                    (e.record.job_id, e.done.subscribe())
                })
                .collect();
            running
        };
        for record in &pending_records {
            self.report_terminal(record);
        }

        if running.is_empty() {
            return results;
        }
        let share = timeout / running.len() as u32;
        for (job_id, mut done) in running {
            let stopped = tokio::time::timeout(share, done.wait_for(|d| *d))
                .await
                .is_ok();
            if !stopped {
                warn!(%job_id, ?share, "job did not stop in time");
            }
            results.insert(job_id, stopped);
        }
        results
    }

    /// Emergency path: aborts the worker task instead of asking it to stop.
    ///
    /// The work future is dropped at its next await point. The registry still
    /// records the job as `cancelled` ("force-stopped") and releases the pair.
    /// Returns `Ok(false)` if the job has no live worker.
    pub fn force_stop(&self, job_id: JobId) -> Result<bool, LockstepError> {
        let st = self.lock();
        let entry = st.jobs.get(&job_id).ok_or(LockstepError::JobNotFound(job_id))?;
        if entry.record.status.is_terminal() {
            return Ok(false);
        }
        entry.cancel.signal();
        match &entry.abort {
            Some(abort) => {
                error!(%job_id, pair_id = %entry.record.pair_id, "force-stopping job");
                abort.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn update_progress(
        &self,
        job_id: JobId,
        pct: u8,
        message: Option<String>,
    ) -> Result<(), LockstepError> {
        let mut st = self.lock();
        let entry = st
            .jobs
            .get_mut(&job_id)
            .ok_or(LockstepError::JobNotFound(job_id))?;
        entry.record.set_progress(pct, message);
        Ok(())
    }

    pub fn get_job(&self, job_id: JobId) -> Option<JobRecord> {
        self.lock().jobs.get(&job_id).map(|e| e.record.clone())
    }

    /// The pair's active job, if any.
    pub fn get_pair_job(&self, pair_id: &PairId) -> Option<JobRecord> {
        let st = self.lock();
        let job_id = st.pair_locks.get(pair_id)?;
        st.jobs.get(job_id).map(|e| e.record.clone())
    }

    pub fn get_running_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<_> = self
            .lock()
            .jobs
            .values()
            .filter(|e| e.record.status == JobStatus::Running)
            .map(|e| e.record.clone())
            .collect();
        jobs.sort_by_key(|j| j.job_id);
        jobs
    }

    pub fn get_all_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<_> = self.lock().jobs.values().map(|e| e.record.clone()).collect();
        jobs.sort_by_key(|j| j.job_id);
        jobs
    }

    pub fn is_pair_running(&self, pair_id: &PairId) -> bool {
        self.lock().pair_locks.contains_key(pair_id)
    }

    pub fn counts(&self) -> RegistryCounts {
        let st = self.lock();
        RegistryCounts::tally(st.jobs.values().map(|e| &e.record), st.pair_locks.len())
    }

    /// Removes terminal jobs older than `max_age`. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let removed = {
            let mut st = self.lock();
            let now = self.clock.now();
            let max_age = self.config.max_age();
            let expired: Vec<JobId> = st
                .jobs
                .values()
                .filter(|e| e.record.is_expired(now, max_age))
                .map(|e| e.record.job_id)
                .collect();
            for job_id in &expired {
                if let Some(entry) = st.jobs.remove(job_id) {
                    let pair_id = entry.record.pair_id;
                    if st.pair_locks.get(&pair_id) == Some(job_id) {
                        st.pair_locks.remove(&pair_id);
                    }
                }
            }
            expired.len()
        };

        if removed > 0 {
            info!(removed, "swept expired jobs");
            self.sink.record_metric("jobs.swept", removed as f64);
        }
        removed
    }

    /// Cancels every job with 80% of `timeout`, then stops the sweep.
    pub async fn shutdown(&self, timeout: Duration) -> HashMap<JobId, bool> {
        info!(?timeout, "registry shutting down");
        let results = self.cancel_all(timeout.mul_f64(0.8)).await;

        self.shutdown.signal();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        results
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        self.shutdown.signal();
    }
}

/// Applies a terminal status under the lock. Returns the updated record if this
/// call made the transition.
fn terminate_locked(
    st: &mut RegistryState,
    job_id: JobId,
    status: JobStatus,
    error: Option<String>,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<JobRecord> {
    let entry = st.jobs.get_mut(&job_id)?;
    if !entry.record.mark_terminal(status, error, now) {
        return None;
    }
    entry.abort = None;
    let record = entry.record.clone();
    if st.pair_locks.get(&record.pair_id) == Some(&job_id) {
        st.pair_locks.remove(&record.pair_id);
    }
    // ペアのロックを外してから通知する
    if let Some(entry) = st.jobs.get(&job_id) {
        entry.done.send_replace(true);
    }
    Some(record)
}

fn job_metadata(record: &JobRecord) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("job_id".into(), record.job_id.to_string());
    meta.insert("run_id".into(), record.run_id.to_string());
    meta.insert("pair_id".into(), record.pair_id.to_string());
    meta.insert("status".into(), record.status.to_string());
    if let Some(error) = &record.error {
        meta.insert("error".into(), error.clone());
    }
    meta
}

async fn sweep_loop(registry: Weak<JobRegistry>, interval: Duration, shutdown: CancelToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 最初の tick は即時なので読み捨てる
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_expired();
            }
        }
    }
    debug!("registry sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::telemetry::MemorySink;
    use crate::ports::clock::{FixedClock, SystemClock};
    use chrono::Utc;

    fn registry() -> Arc<JobRegistry> {
        JobRegistry::new(
            RegistryConfig::default(),
            Arc::new(SystemClock),
            Arc::new(MemorySink::new()),
        )
    }

    fn create(registry: &JobRegistry, pair: &str) -> Result<JobId, LockstepError> {
        registry.create_job(
            RunId::new(),
            PairId::new(pair),
            vec![ParticipantId::new("dev1"), ParticipantId::new("dev2")],
            BTreeMap::new(),
        )
    }

    async fn wait_terminal(registry: &JobRegistry, job_id: JobId) -> JobRecord {
        let job = registry
            .wait_for_job(job_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(job.status.is_terminal(), "job still {}", job.status);
        job
    }

    /// Loops `n` times sleeping 1s, checking the token each iteration.
    async fn cooperative(token: CancelToken, n: u32) -> Result<(), LockstepError> {
        for _ in 0..n {
            if token.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_for_one_pair_admit_exactly_one() {
        let registry = registry();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { create(&registry, "p1") }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(LockstepError::LockConflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 15);
        assert_eq!(registry.get_all_jobs().len(), 1);
    }

    #[tokio::test]
    async fn completed_job_releases_its_pair() {
        let sink = Arc::new(MemorySink::new());
        let registry = JobRegistry::new(RegistryConfig::default(), Arc::new(SystemClock), sink.clone());
        let job_id = create(&registry, "p1").unwrap();
        assert!(registry.is_pair_running(&PairId::new("p1")));

        registry
            .start_job(job_id, |_token| async { Ok::<(), LockstepError>(()) })
            .unwrap();
        let job = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.started_at.is_some());
        assert!(job.stopped_at.is_some());
        assert!(!registry.is_pair_running(&PairId::new("p1")));
        assert_eq!(sink.metric("jobs.created"), 1.0);
        assert_eq!(sink.metric("jobs.completed"), 1.0);

        // the pair is free again
        assert!(create(&registry, "p1").is_ok());
    }

    #[tokio::test]
    async fn failed_work_keeps_the_error_message() {
        let registry = registry();
        let job_id = create(&registry, "p1").unwrap();

        registry
            .start_job(job_id, |_token| async { Err::<(), _>("device went offline") })
            .unwrap();
        let job = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("device went offline"));
        assert!(!registry.is_pair_running(&PairId::new("p1")));
    }

    #[tokio::test]
    async fn panicking_work_is_recorded_as_failed() {
        let registry = registry();
        let job_id = create(&registry, "p1").unwrap();

        registry
            .start_job(job_id, |_token| async {
                if true {
                    panic!("boom");
                }
                Ok::<(), LockstepError>(())
            })
            .unwrap();
        let job = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("panicked"));
        assert!(!registry.is_pair_running(&PairId::new("p1")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_running_job_within_timeout() {
        let registry = registry();
        let job_id = create(&registry, "p1").unwrap();
        registry
            .start_job(job_id, |token| cooperative(token, 10))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let started = tokio::time::Instant::now();
        let stopped = registry.cancel_job(job_id, Duration::from_secs(5)).await.unwrap();

        assert!(stopped);
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert_eq!(registry.get_job(job_id).unwrap().status, JobStatus::Cancelled);
        assert!(!registry.is_pair_running(&PairId::new("p1")));
    }

    #[tokio::test(start_paused = true)]
    async fn uncooperative_job_needs_force_stop() {
        let registry = registry();
        let job_id = create(&registry, "p1").unwrap();
        registry
            .start_job(job_id, |_token| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), LockstepError>(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopped = registry.cancel_job(job_id, Duration::from_secs(1)).await.unwrap();
        assert!(!stopped);
        assert_eq!(registry.get_job(job_id).unwrap().status, JobStatus::Running);
        assert!(registry.is_pair_running(&PairId::new("p1")));

        assert!(registry.force_stop(job_id).unwrap());
        let job = wait_terminal(&registry, job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!registry.is_pair_running(&PairId::new("p1")));
    }

    #[tokio::test]
    async fn cancelling_a_pending_job_is_immediate() {
        let registry = registry();
        let job_id = create(&registry, "p1").unwrap();

        assert!(registry.cancel_pair(&PairId::new("p1"), Duration::from_secs(1)).await.unwrap());

        let job = registry.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(!registry.is_pair_running(&PairId::new("p1")));
        // no job on the pair any more: still a success
        assert!(registry.cancel_pair(&PairId::new("p1"), Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn start_requires_a_pending_job() {
        let registry = registry();
        let job_id = create(&registry, "p1").unwrap();
        registry.cancel_job(job_id, Duration::from_secs(1)).await.unwrap();

        let err = registry
            .start_job(job_id, |_t| async { Ok::<(), LockstepError>(()) })
            .unwrap_err();
        assert!(matches!(err, LockstepError::InvalidJobState { status: JobStatus::Cancelled, .. }));

        let err = registry
            .start_job(JobId::new(), |_t| async { Ok::<(), LockstepError>(()) })
            .unwrap_err();
        assert!(matches!(err, LockstepError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn sweep_only_removes_old_terminal_jobs() {
        let t0 = Utc::now();
        let clock = Arc::new(FixedClock::new(t0));
        let registry = JobRegistry::new(
            RegistryConfig {
                max_age_ms: 3_600_000,
                ..RegistryConfig::default()
            },
            clock.clone(),
            Arc::new(MemorySink::new()),
        );
        let done = create(&registry, "p1").unwrap();
        let running = create(&registry, "p2").unwrap();
        registry
            .start_job(done, |_t| async { Ok::<(), LockstepError>(()) })
            .unwrap();
        registry
            .start_job(running, |token| async move {
                token.cancelled().await;
                Ok::<(), LockstepError>(())
            })
            .unwrap();
        wait_terminal(&registry, done).await;

        clock.advance(Duration::from_secs(3_599));
        assert_eq!(registry.sweep_expired(), 0);
        assert!(registry.get_job(done).is_some());

        clock.advance(Duration::from_secs(2));
        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.get_job(done).is_none());

        clock.advance(Duration::from_secs(30 * 24 * 3600));
        assert_eq!(registry.sweep_expired(), 0);
        assert_eq!(registry.get_job(running).unwrap().status, JobStatus::Running);

        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_on_its_interval() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let registry = JobRegistry::new(
            RegistryConfig {
                sweep_interval_ms: 1_000,
                max_age_ms: 60_000,
                ..RegistryConfig::default()
            },
            clock.clone(),
            Arc::new(MemorySink::new()),
        );
        let job_id = create(&registry, "p1").unwrap();
        registry
            .start_job(job_id, |_t| async { Ok::<(), LockstepError>(()) })
            .unwrap();
        wait_terminal(&registry, job_id).await;

        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(registry.get_job(job_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let registry = registry();
        let a = create(&registry, "p1").unwrap();
        let b = create(&registry, "p2").unwrap();
        let c = create(&registry, "p3").unwrap();
        registry.start_job(a, |t| cooperative(t, 100)).unwrap();
        registry.start_job(b, |t| cooperative(t, 100)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let results = registry.shutdown(Duration::from_secs(10)).await;

        assert_eq!(results.len(), 3);
        assert!(results.values().all(|stopped| *stopped));
        for id in [a, b, c] {
            assert_eq!(registry.get_job(id).unwrap().status, JobStatus::Cancelled);
        }
        assert_eq!(registry.counts().locked_pairs, 0);
    }

    #[tokio::test]
    async fn progress_and_counts() {
        let registry = registry();
        let a = create(&registry, "p1").unwrap();
        create(&registry, "p2").unwrap();

        registry.update_progress(a, 150, Some("2/3 participants".into())).unwrap();
        let job = registry.get_pair_job(&PairId::new("p1")).unwrap();
        assert_eq!(job.progress, 100);
        assert_eq!(job.message, "2/3 participants");
        assert!(matches!(
            registry.update_progress(JobId::new(), 10, None),
            Err(LockstepError::JobNotFound(_))
        ));

        let counts = registry.counts();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.total(), 2);
        assert_eq!(counts.locked_pairs, 2);
        assert!(registry.get_running_jobs().is_empty());
    }
}
