//! Barrier port - 複数ワーカーのランデブー
//!
//! # 実装
//! - **InMemoryBarrier**: 同一プロセス内（watch channel で即時通知）
//! - **FileBarrier**: 別プロセス間（ロックファイル + atomic rename + polling）

use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::domain::errors::LockstepError;
use crate::domain::ids::{GroupId, ParticipantId};

/// Barrier lets N participants rendezvous at a named checkpoint.
///
/// Timeout is not an error: `wait` returns `Ok(false)` and the caller decides
/// whether to go on degraded or abort. Every participant that arrived sees the
/// same outcome.
#[async_trait]
pub trait Barrier: Send + Sync {
    /// Records the participant's arrival. Idempotent within one round.
    async fn signal_ready(
        &self,
        group: &GroupId,
        participant: &ParticipantId,
    ) -> Result<(), LockstepError>;

    /// Blocks until `required` participants arrived (`true`) or the group's
    /// deadline passed (`false`). Cancellation returns `Err(Cancelled)`.
    async fn wait(
        &self,
        group: &GroupId,
        participant: &ParticipantId,
        required: usize,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, LockstepError>;

    async fn rendezvous(
        &self,
        group: &GroupId,
        participant: &ParticipantId,
        required: usize,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, LockstepError> {
        self.signal_ready(group, participant).await?;
        self.wait(group, participant, required, timeout, cancel).await
    }
}
