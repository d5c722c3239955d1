//! InMemoryBarrier - 同一プロセス内のバリア
//!
//! # 学習ポイント
//! - std Mutex は `.await` をまたいで保持しない（ブロックの中で完結させる）
//! - 待機側はロック中に watch を subscribe するので通知を取りこぼさない
//! - group ごとに独立した watch channel を持つので他の group を起こさない
//! - signal / wait のたびに期限切れのレコードを全 group から掃除する

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::domain::barrier::{Arrival, BarrierRecord};
use crate::domain::errors::LockstepError;
use crate::domain::ids::{GroupId, ParticipantId};
use crate::ports::barrier::Barrier;
use crate::ports::clock::Clock;

const DEFAULT_SETTLE_GRACE: Duration = Duration::from_secs(2);

struct Slot {
    record: BarrierRecord,
    version: watch::Sender<u64>,
}

impl Slot {
    fn new(group: &GroupId, now: DateTime<Utc>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            record: BarrierRecord::new(group.clone(), now),
            version,
        }
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// In-process barrier keyed by group id.
pub struct InMemoryBarrier {
    groups: Mutex<HashMap<GroupId, Slot>>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    /// Upper bound on how long a parked waiter sleeps before re-checking.
    recheck_interval: Duration,
    settle_grace: Duration,
}

impl InMemoryBarrier {
    pub fn new(clock: Arc<dyn Clock>, stale_after: Duration, recheck_interval: Duration) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            clock,
            stale_after,
            recheck_interval,
            settle_grace: DEFAULT_SETTLE_GRACE,
        }
    }

    /// How long past its deadline an unacknowledged record is kept.
    pub fn with_settle_grace(mut self, settle_grace: Duration) -> Self {
        self.settle_grace = settle_grace;
        self
    }

    /// Number of groups currently holding state.
    pub fn group_count(&self) -> usize {
        self.groups.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn sweep(&self, groups: &mut HashMap<GroupId, Slot>, now: DateTime<Utc>) {
        groups.retain(|group, slot| {
            let expired = slot.record.is_expired(now, self.stale_after, self.settle_grace);
            if expired && !slot.record.is_drained() {
                debug!(%group, phase = ?slot.record.phase, "dropping expired barrier record");
            }
            !expired
        });
    }

    /// The waiter was cancelled; it will not come back for the outcome.
    fn abandon(&self, group: &GroupId, participant: &ParticipantId) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let drained = groups.get_mut(group).is_some_and(|slot| {
            slot.record.abandon(participant);
            slot.record.is_drained()
        });
        if drained {
            groups.remove(group);
        }
    }
}

#[async_trait]
impl Barrier for InMemoryBarrier {
    async fn signal_ready(
        &self,
        group: &GroupId,
        participant: &ParticipantId,
    ) -> Result<(), LockstepError> {
        loop {
            let mut rx = {
                let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
                let now = self.clock.now();
                self.sweep(&mut groups, now);

                let slot = groups
                    .entry(group.clone())
                    .or_insert_with(|| Slot::new(group, now));
                match slot.record.arrive(participant, now) {
                    Arrival::NextRound => slot.version.subscribe(),
                    arrival => {
                        debug!(%group, %participant, ?arrival, arrived = slot.record.arrived.len(), "barrier signal");
                        slot.notify();
                        return Ok(());
                    }
                }
            };

            // 前のラウンドが片付くのを待つ
            debug!(%group, %participant, "previous barrier round still draining");
            let _ = tokio::time::timeout(self.recheck_interval, rx.changed()).await;
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
        loop {
            if cancel.is_cancelled() {
                self.abandon(group, participant);
                return Err(LockstepError::Cancelled);
            }

            let (mut rx, nap) = {
                let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
                let now = self.clock.now();
                self.sweep(&mut groups, now);
                let slot = groups
                    .entry(group.clone())
                    .or_insert_with(|| Slot::new(group, now));

                if let Some(released) = slot.record.observe(participant, required, timeout, now) {
                    slot.notify();
                    if !released {
                        warn!(%group, %participant, arrived = slot.record.arrived.len(), required, "barrier timed out");
                    }
                    if slot.record.is_drained() {
                        groups.remove(group);
                    }
                    return Ok(released);
                }

                let remaining = slot.record.remaining(now).unwrap_or(timeout);
                (slot.version.subscribe(), remaining.min(self.recheck_interval))
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abandon(group, participant);
                    return Err(LockstepError::Cancelled);
                }
                _ = rx.changed() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
