//! Device port - リモート端末の操作能力
//!
//! Steps only ever talk to a device through [`DeviceCapability`]. The selector
//! vocabulary of any particular target app stays in the step definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::control_agent::ControlAgent;
use crate::domain::ids::{PairId, ParticipantId};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("element not found: {0}")]
    NotFound(Selector),

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("device {0} is disconnected")]
    Disconnected(String),

    #[error("{0}")]
    Other(String),
}

/// UI element lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    ResourceId(String),
    Text(String),
    Description(String),
    XPath(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::ResourceId(v) => write!(f, "resource-id={v}"),
            Selector::Text(v) => write!(f, "text={v}"),
            Selector::Description(v) => write!(f, "description={v}"),
            Selector::XPath(v) => write!(f, "xpath={v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCode {
    Home,
    Back,
    Enter,
    Recents,
    Code(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// The capability set the step pipeline needs from one device.
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    fn serial(&self) -> &str;

    async fn exists(&self, selector: &Selector) -> Result<bool, DeviceError>;

    async fn click(&self, selector: &Selector) -> Result<(), DeviceError>;

    async fn type_text(&self, selector: &Selector, text: &str) -> Result<(), DeviceError>;

    async fn current_foreground_app(&self) -> Result<String, DeviceError>;

    async fn dump_ui_hierarchy(&self) -> Result<String, DeviceError>;

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> Result<(), DeviceError>;

    async fn press_key(&self, key: KeyCode) -> Result<(), DeviceError>;

    async fn launch_app(&self, package: &str) -> Result<(), DeviceError>;
}

/// One participant of a pair and the endpoint it is reached at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSpec {
    pub id: ParticipantId,
    /// e.g. `192.168.5.74:5555`
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSpec {
    pub pair_id: PairId,
    pub participants: Vec<ParticipantSpec>,
}

impl PairSpec {
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }
}

/// Opens device sessions for the coordinator.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, participant: &ParticipantSpec) -> Result<Arc<dyn DeviceCapability>, DeviceError>;

    /// Control agent for readiness recovery on the same endpoint.
    fn control_agent(&self, participant: &ParticipantSpec) -> Arc<dyn ControlAgent>;

    async fn disconnect(&self, _participant: &ParticipantSpec) -> Result<(), DeviceError> {
        Ok(())
    }
}
