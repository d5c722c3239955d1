//! Config - 設定
//!
//! JSON で読み込み、全フィールドにデフォルト値があります。
//! 時間は `*_ms`（ミリ秒）で表し、`Duration` のアクセサで取り出します。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::errors::LockstepError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockstepConfig {
    pub registry: RegistryConfig,
    pub barrier: BarrierConfig,
    pub readiness: ReadinessConfig,
    pub coordinator: CoordinatorConfig,
}

impl LockstepConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LockstepError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LockstepError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, LockstepError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| LockstepError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LockstepError> {
        if self.barrier.poll_interval_ms == 0 {
            return Err(LockstepError::Config(
                "barrier.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.readiness.probe_interval_ms == 0 {
            return Err(LockstepError::Config(
                "readiness.probe_interval_ms must be > 0".into(),
            ));
        }
        if self.coordinator.liveness_interval_ms == 0 {
            return Err(LockstepError::Config(
                "coordinator.liveness_interval_ms must be > 0".into(),
            ));
        }
        if self.registry.sweep_interval_ms == 0 {
            return Err(LockstepError::Config(
                "registry.sweep_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub sweep_interval_ms: u64,
    /// Terminal jobs older than this are removed by the sweep.
    pub max_age_ms: u64,
    pub default_cancel_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 300_000,
            max_age_ms: 86_400_000,
            default_cancel_timeout_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn default_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.default_cancel_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    pub poll_interval_ms: u64,
    pub default_timeout_ms: u64,
    /// Records older than this are discarded even if not every participant
    /// acknowledged them.
    pub stale_after_ms: u64,
    /// How long to retry taking the lock file before giving up.
    pub lock_timeout_ms: u64,
    /// A record past its deadline by this much is removed even if some
    /// participant never came back to read the outcome.
    pub settle_grace_ms: u64,
    /// Set to use the file-backed barrier in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            default_timeout_ms: 30_000,
            stale_after_ms: 600_000,
            lock_timeout_ms: 2_000,
            settle_grace_ms: 2_000,
            directory: None,
        }
    }
}

impl BarrierConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn settle_grace(&self) -> Duration {
        Duration::from_millis(self.settle_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Additional attempts after the first one.
    pub retries: u32,
    pub settle_delay_ms: u64,
    pub readiness_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub backoff_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            settle_delay_ms: 1_000,
            readiness_timeout_ms: 5_000,
            probe_interval_ms: 500,
            backoff_ms: 1_500,
        }
    }
}

impl ReadinessConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// What a participant does when a barrier times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierTimeoutPolicy {
    /// Go on alone; the outcome is flagged as degraded.
    #[default]
    Proceed,
    /// Fail the participant.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub stagger_ms: u64,
    pub stagger_jitter_ms: u64,
    pub pre_barrier_timeout_ms: u64,
    pub post_barrier_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    pub liveness_interval_ms: u64,
    pub barrier_timeout_policy: BarrierTimeoutPolicy,
    pub readiness_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 500,
            stagger_jitter_ms: 250,
            pre_barrier_timeout_ms: 30_000,
            post_barrier_timeout_ms: 30_000,
            batch_timeout_ms: 600_000,
            liveness_interval_ms: 1_000,
            barrier_timeout_policy: BarrierTimeoutPolicy::Proceed,
            readiness_enabled: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn stagger_jitter(&self) -> Duration {
        Duration::from_millis(self.stagger_jitter_ms)
    }

    pub fn pre_barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.pre_barrier_timeout_ms)
    }

    pub fn post_barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.post_barrier_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = LockstepConfig::from_json_str("{}").unwrap();
        assert_eq!(config, LockstepConfig::default());
        assert_eq!(config.readiness.retries, 2);
        assert_eq!(config.registry.max_age(), Duration::from_secs(24 * 3600));
        assert_eq!(config.coordinator.barrier_timeout_policy, BarrierTimeoutPolicy::Proceed);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = LockstepConfig::from_json_str(
            r#"{ "barrier": { "poll_interval_ms": 100, "directory": "/tmp/barriers" },
                 "coordinator": { "barrier_timeout_policy": "abort" } }"#,
        )
        .unwrap();

        assert_eq!(config.barrier.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.barrier.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.barrier.directory, Some(PathBuf::from("/tmp/barriers")));
        assert_eq!(config.coordinator.barrier_timeout_policy, BarrierTimeoutPolicy::Abort);
        assert_eq!(config.coordinator.stagger_ms, 500);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = LockstepConfig::from_json_str(r#"{ "barrier": { "poll_interval_ms": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, LockstepError::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = LockstepConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, LockstepError::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockstep.json");
        std::fs::write(&path, r#"{ "readiness": { "retries": 5 } }"#).unwrap();

        let config = LockstepConfig::load(&path).unwrap();
        assert_eq!(config.readiness.retries, 5);
    }
}
