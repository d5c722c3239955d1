//! FileBarrier - プロセス間バリア
//!
//! 1 group = 1 JSON ファイル (`barrier_{group}.json`)。group id は可逆に
//! エスケープするので、別の group が同じファイルを共有することはありません。
//!
//! # 更新手順（read-modify-write を排他する）
//! 1. `{file}.lock` を `create_new` で作成し、自分のトークンを書く（既にあれば少し待って再試行）
//! 2. JSON を読む（group id が違うレコードは捨てる）
//! 3. BarrierRecord を更新
//! 4. 一時ファイルに書いて rename（途中で落ちても壊れたファイルを残さない）
//! 5. ロックファイルが自分のトークンのままなら削除
//!
//! ファイル I/O はブロッキングなので `spawn_blocking` で実行します。
//! 待機側は `poll_interval` ごとにファイルを読み直します。
//! signal / wait のたびにディレクトリを走査して期限切れのレコードを消します。

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::cancel::CancelToken;
use crate::config::BarrierConfig;
use crate::domain::barrier::{Arrival, BarrierRecord};
use crate::domain::errors::LockstepError;
use crate::domain::ids::{GroupId, ParticipantId};
use crate::ports::barrier::Barrier;
use crate::ports::clock::Clock;

const LOCK_RETRY: Duration = Duration::from_millis(5);
const FILE_PREFIX: &str = "barrier_";
const FILE_SUFFIX: &str = ".json";

/// Barrier shared through a directory visible to every participating process.
pub struct FileBarrier {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    stale_after: Duration,
    settle_grace: Duration,
    lock_timeout: Duration,
}

impl FileBarrier {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>, config: &BarrierConfig) -> Result<Self, LockstepError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            clock,
            poll_interval: config.poll_interval(),
            stale_after: config.stale_after(),
            settle_grace: config.settle_grace(),
            lock_timeout: config.lock_timeout(),
        })
    }

    pub fn record_path(&self, group: &GroupId) -> PathBuf {
        self.dir.join(file_name(group))
    }

    /// Runs `f` on the group's record while holding the lock file.
    ///
    /// Setting the record to `None` deletes the file.
    async fn update<F, R>(&self, group: &GroupId, f: F) -> Result<R, LockstepError>
    where
        F: FnOnce(&mut Option<BarrierRecord>, DateTime<Utc>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let path = self.record_path(group);
        let group = group.clone();
        let clock = Arc::clone(&self.clock);
        let lock_timeout = self.lock_timeout;

        tokio::task::spawn_blocking(move || -> Result<R, LockstepError> {
            let _lock = LockFile::acquire(&path, lock_timeout)?;
            let mut record = read_record(&path)?.filter(|record| {
                let matches = record.group_id == group;
                if !matches {
                    warn!(path = %path.display(), %group, found = %record.group_id, "discarding barrier record of another group");
                }
                matches
            });
            let result = f(&mut record, clock.now());
            match &record {
                Some(record) => write_record(&path, record)?,
                None => remove_if_exists(&path)?,
            }
            Ok(result)
        })
        .await
        .map_err(|e| LockstepError::Other(format!("barrier update task failed: {e}")))?
    }

    /// Removes every record in the directory that nobody will act on any more.
    pub async fn sweep_expired(&self) -> Result<usize, LockstepError> {
        let dir = self.dir.clone();
        let now = self.clock.now();
        let (stale_after, settle_grace, lock_timeout) = (self.stale_after, self.settle_grace, self.lock_timeout);

        tokio::task::spawn_blocking(move || -> Result<usize, LockstepError> {
            let mut removed = 0;
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let is_record = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX));
                if !is_record {
                    continue;
                }

                // 他の group の更新中なら今回は見送る
                let Ok(_lock) = LockFile::acquire(&path, lock_timeout) else {
                    continue;
                };
                let expired = read_record(&path)?
                    .is_some_and(|record| record.is_expired(now, stale_after, settle_grace));
                if expired {
                    remove_if_exists(&path)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|e| LockstepError::Other(format!("barrier sweep task failed: {e}")))?
    }

    async fn sweep_quietly(&self) {
        match self.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, dir = %self.dir.display(), "swept expired barrier records"),
            Err(e) => warn!(error = %e, dir = %self.dir.display(), "barrier sweep failed"),
        }
    }

    async fn abandon(&self, group: &GroupId, participant: &ParticipantId) {
        let p = participant.clone();
        let result = self
            .update(group, move |slot, _now| {
                if let Some(record) = slot.as_mut() {
                    record.abandon(&p);
                    if record.is_drained() {
                        *slot = None;
                    }
                }
            })
            .await;
        if let Err(e) = result {
            warn!(%group, %participant, error = %e, "could not release abandoned barrier wait");
        }
    }
}

#[async_trait]
impl Barrier for FileBarrier {
    async fn signal_ready(
        &self,
        group: &GroupId,
        participant: &ParticipantId,
    ) -> Result<(), LockstepError> {
        self.sweep_quietly().await;
        loop {
            let g = group.clone();
            let p = participant.clone();
            let arrival = self
                .update(group, move |slot, now| {
                    slot.get_or_insert_with(|| BarrierRecord::new(g, now))
                        .arrive(&p, now)
                })
                .await?;

            if arrival != Arrival::NextRound {
                debug!(%group, %participant, ?arrival, "barrier signal (file)");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
            self.sweep_quietly().await;
        }
    }

    async fn wait(
        &self,
        group: &GroupId,
        participant: &ParticipantId,
        required: usize,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, LockstepError> {
        self.sweep_quietly().await;
        loop {
            if cancel.is_cancelled() {
                self.abandon(group, participant).await;
                return Err(LockstepError::Cancelled);
            }

            let g = group.clone();
            let p = participant.clone();
            let (outcome, remaining, arrived) = self
                .update(group, move |slot, now| {
                    let record = slot.get_or_insert_with(|| BarrierRecord::new(g, now));
                    let outcome = record.observe(&p, required, timeout, now);
                    let remaining = record.remaining(now);
                    let arrived = record.arrived.len();
                    if outcome.is_some() && record.is_drained() {
                        *slot = None;
                    }
                    (outcome, remaining, arrived)
                })
                .await?;

            if let Some(released) = outcome {
                if !released {
                    warn!(%group, %participant, arrived, required, "barrier timed out (file)");
                }
                return Ok(released);
            }

            let nap = remaining
                .map_or(self.poll_interval, |r| r.min(self.poll_interval))
                .max(Duration::from_millis(1));
            if !cancel.sleep(nap).await {
                self.abandon(group, participant).await;
                return Err(LockstepError::Cancelled);
            }
        }
    }
}

/// `[A-Za-z0-9-]` はそのまま、それ以外（`_` を含む）は `_XX` に。
fn file_name(group: &GroupId) -> String {
    let mut name = String::from(FILE_PREFIX);
    for byte in group.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, "_{byte:02X}");
        }
    }
    name.push_str(FILE_SUFFIX);
    name
}

fn read_record(path: &Path) -> Result<Option<BarrierRecord>, LockstepError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            // 壊れたファイルは新しいラウンドで上書きする
            warn!(path = %path.display(), error = %e, "discarding unreadable barrier record");
            Ok(None)
        }
    }
}

fn write_record(path: &Path, record: &BarrierRecord) -> Result<(), LockstepError> {
    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&temp_path, serde_json::to_vec_pretty(record)?)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), LockstepError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Exclusive lock held for the duration of one read-modify-write.
///
/// The file holds the owner's token; only the owner removes it.
struct LockFile {
    path: PathBuf,
    token: String,
}

impl LockFile {
    fn acquire(record_path: &Path, lock_timeout: Duration) -> Result<Self, LockstepError> {
        let path = record_path.with_extension("json.lock");
        let token = Ulid::new().to_string();
        let started = Instant::now();
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lock = Self { path, token };
                    file.write_all(lock.token.as_bytes())?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            // holder died mid-update
            if let Some(owner) = stale_owner(&path, lock_timeout) {
                break_lock(&path, &owner);
                continue;
            }
            if started.elapsed() > lock_timeout * 2 {
                return Err(LockstepError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("could not lock {}", path.display()),
                )));
            }
            std::thread::sleep(LOCK_RETRY);
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if fs::read_to_string(&self.path).is_ok_and(|owner| owner == self.token) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Token of a lock older than `lock_timeout`, if there is one.
fn stale_owner(path: &Path, lock_timeout: Duration) -> Option<String> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    if age <= lock_timeout {
        return None;
    }
    fs::read_to_string(path).ok()
}

/// Moves the stale lock aside; only one contender's rename succeeds.
///
/// If what got moved is not the lock that was judged stale, someone already
/// broke it and took a fresh one, so it is linked back (never over another lock).
fn break_lock(path: &Path, stale_owner: &str) {
    let aside = path.with_extension(format!("lock.{}.broken", Ulid::new()));
    if fs::rename(path, &aside).is_err() {
        return;
    }
    match fs::read_to_string(&aside) {
        Ok(owner) if owner == stale_owner => {
            warn!(path = %path.display(), "breaking stale barrier lock");
        }
        _ => {
            let _ = fs::hard_link(&aside, path);
        }
    }
    let _ = fs::remove_file(&aside);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::clock::SystemClock;

    fn config() -> BarrierConfig {
        BarrierConfig {
            poll_interval_ms: 20,
            lock_timeout_ms: 500,
            settle_grace_ms: 100,
            ..BarrierConfig::default()
        }
    }

    /// Two instances over one directory stand in for two processes.
    fn pair_of_barriers(dir: &Path) -> (Arc<FileBarrier>, Arc<FileBarrier>) {
        let a = FileBarrier::new(dir, Arc::new(SystemClock), &config()).unwrap();
        let b = FileBarrier::new(dir, Arc::new(SystemClock), &config()).unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn separate_instances_rendezvous() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = pair_of_barriers(dir.path());
        let group = GroupId::new("run-1_p1_pre");
        let cancel = CancelToken::new();

        let first = {
            let group = group.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                a.rendezvous(&group, &ParticipantId::new("dev1"), 2, Duration::from_secs(10), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = b
            .rendezvous(&group, &ParticipantId::new("dev2"), 2, Duration::from_secs(10), &cancel)
            .await
            .unwrap();

        assert!(second);
        assert!(first.await.unwrap().unwrap());
        assert!(!b.record_path(&group).exists());
    }

    #[tokio::test]
    async fn missing_participant_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = pair_of_barriers(dir.path());
        let group = GroupId::new("g-timeout");

        let ok = a
            .rendezvous(&group, &ParticipantId::new("dev1"), 2, Duration::from_millis(150), &CancelToken::new())
            .await
            .unwrap();

        assert!(!ok);
    }

    #[tokio::test]
    async fn record_is_persisted_while_gathering() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = pair_of_barriers(dir.path());
        let group = GroupId::new("g/with:odd chars");

        a.signal_ready(&group, &ParticipantId::new("dev1")).await.unwrap();

        let path = a.record_path(&group);
        assert_eq!(path.file_name().unwrap(), "barrier_g_2Fwith_3Aodd_20chars.json");
        let record: BarrierRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(record.arrived.contains(&ParticipantId::new("dev1")));
        assert!(!path.with_extension("json.lock").exists());
    }

    #[test]
    fn file_names_do_not_collide() {
        let names = ["pair 1_pre", "pair_1_pre", "pair_201_5Fpre", "a:b", "a_b", "a-b"];
        let files: std::collections::HashSet<_> =
            names.iter().map(|n| file_name(&GroupId::new(*n))).collect();
        assert_eq!(files.len(), names.len());
    }

    #[tokio::test]
    async fn groups_with_similar_names_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = pair_of_barriers(dir.path());
        let spaced = GroupId::new("pair 1_pre");
        let underscored = GroupId::new("pair_1_pre");

        a.signal_ready(&spaced, &ParticipantId::new("dev1")).await.unwrap();
        let ok = b
            .rendezvous(&underscored, &ParticipantId::new("dev2"), 2, Duration::from_millis(300), &CancelToken::new())
            .await
            .unwrap();

        assert!(!ok);
        assert_ne!(a.record_path(&spaced), a.record_path(&underscored));
        assert!(a.record_path(&spaced).exists());
    }

    #[tokio::test]
    async fn record_of_another_group_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = pair_of_barriers(dir.path());
        let group = GroupId::new("g-mine");
        let mut foreign = BarrierRecord::new(GroupId::new("g-theirs"), Utc::now());
        foreign.arrive(&ParticipantId::new("dev1"), Utc::now());
        fs::write(a.record_path(&group), serde_json::to_vec(&foreign).unwrap()).unwrap();

        let ok = a
            .rendezvous(&group, &ParticipantId::new("dev2"), 2, Duration::from_millis(200), &CancelToken::new())
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_processes_rendezvous_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let group = GroupId::new("run-8_p1_pre");
        let cancel = CancelToken::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let barrier = FileBarrier::new(dir.path(), Arc::new(SystemClock), &config()).unwrap();
            let group = group.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                barrier
                    .rendezvous(&group, &ParticipantId::new(format!("dev{i}")), 8, Duration::from_secs(10), &cancel)
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn abandoned_record_is_swept_after_its_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = pair_of_barriers(dir.path());
        let group = GroupId::new("g-abandoned");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.signal();
        });

        let err = a
            .rendezvous(&group, &ParticipantId::new("dev1"), 2, Duration::from_millis(100), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(a.record_path(&group).exists());

        // deadline (100ms) + grace (100ms) has passed
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(b
            .rendezvous(&GroupId::new("g-other"), &ParticipantId::new("dev2"), 1, Duration::from_secs(1), &CancelToken::new())
            .await
            .unwrap());
        assert!(!a.record_path(&group).exists());
    }

    #[test]
    fn lock_taken_over_by_someone_else_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("barrier_g.json");
        let lock = LockFile::acquire(&record, Duration::from_millis(500)).unwrap();
        let lock_path = record.with_extension("json.lock");
        assert_eq!(fs::read_to_string(&lock_path).unwrap(), lock.token);

        fs::write(&lock_path, "someone-else").unwrap();
        drop(lock);

        assert_eq!(fs::read_to_string(&lock_path).unwrap(), "someone-else");
    }

    #[test]
    fn breaking_a_lock_that_was_already_replaced_restores_it() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("barrier_g.json.lock");
        fs::write(&lock_path, "fresh-owner").unwrap();

        // judged stale while it still held "old-owner"
        break_lock(&lock_path, "old-owner");

        assert_eq!(fs::read_to_string(&lock_path).unwrap(), "fresh-owner");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = pair_of_barriers(dir.path());
        let group = GroupId::new("g-stale-lock");
        let lock = a.record_path(&group).with_extension("json.lock");
        fs::write(&lock, b"").unwrap();

        // older than lock_timeout (500ms)
        tokio::time::sleep(Duration::from_millis(600)).await;
        a.signal_ready(&group, &ParticipantId::new("dev1")).await.unwrap();

        assert!(a.record_path(&group).exists());
    }

    #[tokio::test]
    async fn corrupt_record_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = pair_of_barriers(dir.path());
        let group = GroupId::new("g-corrupt");
        fs::write(a.record_path(&group), b"{ half a rec").unwrap();

        let ok = a
            .rendezvous(&group, &ParticipantId::new("dev1"), 1, Duration::from_secs(1), &CancelToken::new())
            .await
            .unwrap();
        assert!(ok);
    }
}
