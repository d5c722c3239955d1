//! ReadinessSupervisor - 制御エージェントの復旧
//!
//! # 1 回の試行
//! 1. 残っているエージェントのプロセスを終了
//! 2. 少し待つ（settle）
//! 3. エージェントをデーモンとして再起動
//! 4. readiness シグナルを一定時間ポーリング
//!
//! 失敗したら backoff だけ待って 1 からやり直し（最大 `retries + 1` 回）。
//! 使い切ったら `ReadinessExhausted`。このエラーは上位でリトライしません。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::ReadinessConfig;
use crate::domain::errors::LockstepError;
use crate::ports::control_agent::ControlAgent;
use crate::ports::device::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub retries: u32,
    pub settle_delay: Duration,
    pub readiness_timeout: Duration,
    pub probe_interval: Duration,
    pub backoff: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::from(&ReadinessConfig::default())
    }
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            retries: config.retries,
            settle_delay: config.settle_delay(),
            readiness_timeout: config.readiness_timeout(),
            probe_interval: config.probe_interval(),
            backoff: config.backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub endpoint: String,
    /// 1-based attempt that succeeded.
    pub attempts: u32,
    pub elapsed: Duration,
}

pub struct ReadinessSupervisor {
    agent: Arc<dyn ControlAgent>,
    policy: ReadinessPolicy,
}

impl ReadinessSupervisor {
    pub fn new(agent: Arc<dyn ControlAgent>, policy: ReadinessPolicy) -> Self {
        Self { agent, policy }
    }

    pub fn endpoint(&self) -> &str {
        self.agent.endpoint()
    }

    pub async fn ensure_ready(&self, cancel: &CancelToken) -> Result<ReadinessReport, LockstepError> {
        let started = Instant::now();
        let endpoint = self.agent.endpoint().to_string();
        let attempts = self.policy.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(LockstepError::Cancelled);
            }

            match self.attempt(cancel).await {
                Ok(()) => {
                    info!(%endpoint, attempt, "control agent ready");
                    return Ok(ReadinessReport {
                        endpoint,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(LockstepError::Cancelled) => return Err(LockstepError::Cancelled),
                Err(e) => {
                    warn!(%endpoint, attempt, max = attempts, error = %e, "readiness attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < attempts && !cancel.sleep(self.policy.backoff).await {
                return Err(LockstepError::Cancelled);
            }
        }

        error!(%endpoint, attempts, "control agent not ready, giving up");
        Err(LockstepError::ReadinessExhausted {
            endpoint,
            attempts,
            last_error,
        })
    }

    async fn attempt(&self, cancel: &CancelToken) -> Result<(), LockstepError> {
        self.agent.terminate_stale().await?;
        if !cancel.sleep(self.policy.settle_delay).await {
            return Err(LockstepError::Cancelled);
        }
        self.agent.start_daemon().await?;
        self.wait_ready(cancel).await
    }

    async fn wait_ready(&self, cancel: &CancelToken) -> Result<(), LockstepError> {
        let deadline = Instant::now() + self.policy.readiness_timeout;
        loop {
            match self.agent.probe_ready().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => debug!(endpoint = self.agent.endpoint(), error = %e, "readiness probe failed"),
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    operation: "readiness probe".into(),
                    after: self.policy.readiness_timeout,
                }
                .into());
            }
            if !cancel.sleep(self.policy.probe_interval).await {
                return Err(LockstepError::Cancelled);
            }
        }
    }

    /// Kill the agent's processes and stop its service. Outside the retry loop.
    pub async fn cleanup(&self) -> Result<(), LockstepError> {
        let terminated = self.agent.terminate_stale().await;
        let stopped = self.agent.stop_service().await;
        terminated?;
        stopped?;
        debug!(endpoint = self.agent.endpoint(), "control agent cleaned up");
        Ok(())
    }
}
