//! ControlAgent port - 端末上の制御エージェントのライフサイクル
//!
//! The readiness supervisor composes these primitives into its bounded retry
//! loop; each call is a single attempt with its own short timeout.

use async_trait::async_trait;

use super::device::DeviceError;

#[async_trait]
pub trait ControlAgent: Send + Sync {
    /// Endpoint this agent runs on (used in errors and logs).
    fn endpoint(&self) -> &str;

    /// Kill leftover agent processes.
    async fn terminate_stale(&self) -> Result<(), DeviceError>;

    /// (Re)start the agent service in daemon mode.
    async fn start_daemon(&self) -> Result<(), DeviceError>;

    /// One check of the readiness signal.
    async fn probe_ready(&self) -> Result<bool, DeviceError>;

    async fn stop_service(&self) -> Result<(), DeviceError>;
}
