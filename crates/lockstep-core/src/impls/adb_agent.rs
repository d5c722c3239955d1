//! AdbControlAgent - adb 経由で端末上の UI 自動化エージェントを管理
//!
//! 端末側には `uiautomator` と `atx-agent` (port 7912) が動いている前提です。
//! 全コマンドに個別のタイムアウト（デフォルト 10 秒）を付けます。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::ports::control_agent::ControlAgent;
use crate::ports::device::DeviceError;

const AGENT_BINARY: &str = "/data/local/tmp/atx-agent";
const AUTOMATION_PACKAGES: [&str; 2] = ["com.github.uiautomator", "com.github.uiautomator.test"];
const STALE_PROCESSES: [&str; 2] = ["uiautomator", "atx-agent"];

/// Output of one `adb shell` call.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub success: bool,
    pub stdout: String,
}

#[derive(Debug, Clone)]
pub struct AdbControlAgent {
    endpoint: String,
    adb_path: PathBuf,
    command_timeout: Duration,
    agent_port: u16,
    restart_pause: Duration,
}

impl AdbControlAgent {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            adb_path: PathBuf::from("adb"),
            command_timeout: Duration::from_secs(10),
            agent_port: 7912,
            restart_pause: Duration::from_millis(500),
        }
    }

    pub fn with_adb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.adb_path = path.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    /// Runs `adb -s <endpoint> shell <command>`.
    pub async fn shell(&self, command: &str) -> Result<ShellOutput, DeviceError> {
        debug!(endpoint = %self.endpoint, command, "adb shell");
        let child = Command::new(&self.adb_path)
            .arg("-s")
            .arg(&self.endpoint)
            .arg("shell")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| DeviceError::Timeout {
                operation: format!("adb shell {command}"),
                after: self.command_timeout,
            })?
            .map_err(|e| DeviceError::Command {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        Ok(ShellOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn shell_checked(&self, command: &str) -> Result<String, DeviceError> {
        let out = self.shell(command).await?;
        if !out.success {
            return Err(DeviceError::Command {
                command: command.to_string(),
                reason: "non-zero exit status".into(),
            });
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl ControlAgent for AdbControlAgent {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn terminate_stale(&self) -> Result<(), DeviceError> {
        for process in STALE_PROCESSES {
            self.shell_checked(&format!("pidof {process} | xargs -r kill -9"))
                .await?;
        }
        for package in AUTOMATION_PACKAGES {
            self.shell_checked(&format!("am force-stop {package}")).await?;
        }
        Ok(())
    }

    async fn start_daemon(&self) -> Result<(), DeviceError> {
        self.shell(&format!("{AGENT_BINARY} server --stop || true"))
            .await?;
        tokio::time::sleep(self.restart_pause).await;
        self.shell_checked(&format!("{AGENT_BINARY} server -d")).await?;
        Ok(())
    }

    async fn probe_ready(&self) -> Result<bool, DeviceError> {
        // grep exits non-zero when nothing listens; that is "not ready", not an error
        let out = self
            .shell(&format!("netstat -an | grep :{}", self.agent_port))
            .await?;
        Ok(!out.stdout.trim().is_empty())
    }

    async fn stop_service(&self) -> Result<(), DeviceError> {
        self.shell(&format!("{AGENT_BINARY} server --stop")).await?;
        Ok(())
    }
}
