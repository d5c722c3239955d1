//! Scripted simulation of devices and control agents.
//!
//! Used by the demo binary and by tests. A [`ScriptedDevice`] keeps a set of
//! visible elements, a foreground app and a log of every action it received.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ids::ParticipantId;
use crate::ports::control_agent::ControlAgent;
use crate::ports::device::{
    DeviceCapability, DeviceConnector, DeviceError, KeyCode, ParticipantSpec, Point, Selector,
};

const LAUNCHER: &str = "com.android.launcher";

#[derive(Debug)]
struct DeviceState {
    foreground: String,
    actions: Vec<String>,
}

#[derive(Debug)]
pub struct ScriptedDevice {
    serial: String,
    /// Visible whatever app is in front.
    always_visible: HashSet<Selector>,
    /// Visible only while the package is in front.
    app_elements: HashMap<String, HashSet<Selector>>,
    failing: HashSet<Selector>,
    latency: Duration,
    state: Mutex<DeviceState>,
}

impl ScriptedDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            always_visible: HashSet::new(),
            app_elements: HashMap::new(),
            failing: HashSet::new(),
            latency: Duration::ZERO,
            state: Mutex::new(DeviceState {
                foreground: LAUNCHER.to_string(),
                actions: Vec::new(),
            }),
        }
    }

    pub fn with_element(mut self, selector: Selector) -> Self {
        self.always_visible.insert(selector);
        self
    }

    pub fn with_app(mut self, package: impl Into<String>, elements: impl IntoIterator<Item = Selector>) -> Self {
        self.app_elements
            .entry(package.into())
            .or_default()
            .extend(elements);
        self
    }

    /// Clicking or typing into `selector` fails with a command error.
    pub fn failing_on(mut self, selector: Selector) -> Self {
        self.failing.insert(selector);
        self
    }

    /// Every action sleeps this long first.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn visible(&self, selector: &Selector) -> bool {
        if self.always_visible.contains(selector) {
            return true;
        }
        let foreground = self.lock().foreground.clone();
        self.app_elements
            .get(&foreground)
            .is_some_and(|elements| elements.contains(selector))
    }

    fn record(&self, action: String) {
        self.lock().actions.push(action);
    }

    async fn act(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn interact(&self, selector: &Selector, action: &str) -> Result<(), DeviceError> {
        if self.failing.contains(selector) {
            return Err(DeviceError::Command {
                command: format!("{action} {selector}"),
                reason: "injected failure".into(),
            });
        }
        if !self.visible(selector) {
            return Err(DeviceError::NotFound(selector.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceCapability for ScriptedDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn exists(&self, selector: &Selector) -> Result<bool, DeviceError> {
        self.act().await;
        Ok(self.visible(selector))
    }

    async fn click(&self, selector: &Selector) -> Result<(), DeviceError> {
        self.act().await;
        self.interact(selector, "click")?;
        self.record(format!("click {selector}"));
        Ok(())
    }

    async fn type_text(&self, selector: &Selector, text: &str) -> Result<(), DeviceError> {
        self.act().await;
        self.interact(selector, "type")?;
        self.record(format!("type {selector} {text}"));
        Ok(())
    }

    async fn current_foreground_app(&self) -> Result<String, DeviceError> {
        Ok(self.lock().foreground.clone())
    }

    async fn dump_ui_hierarchy(&self) -> Result<String, DeviceError> {
        self.act().await;
        let foreground = self.lock().foreground.clone();
        let mut nodes: Vec<String> = self
            .always_visible
            .iter()
            .chain(self.app_elements.get(&foreground).into_iter().flatten())
            .map(|s| format!("  <node {s} />"))
            .collect();
        nodes.sort();
        Ok(format!(
            "<hierarchy package=\"{foreground}\">\n{}\n</hierarchy>",
            nodes.join("\n")
        ))
    }

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> Result<(), DeviceError> {
        self.act().await;
        self.record(format!(
            "swipe {},{} -> {},{} in {}ms",
            from.x,
            from.y,
            to.x,
            to.y,
            duration.as_millis()
        ));
        Ok(())
    }

    async fn press_key(&self, key: KeyCode) -> Result<(), DeviceError> {
        self.act().await;
        if key == KeyCode::Home {
            self.lock().foreground = LAUNCHER.to_string();
        }
        self.record(format!("key {key:?}"));
        Ok(())
    }

    async fn launch_app(&self, package: &str) -> Result<(), DeviceError> {
        self.act().await;
        self.lock().foreground = package.to_string();
        self.record(format!("launch {package}"));
        Ok(())
    }
}

/// Control agent whose daemon fails to start the first `failures` times.
#[derive(Debug)]
pub struct ScriptedControlAgent {
    endpoint: String,
    failures: u32,
    pub terminate_calls: AtomicU32,
    pub start_calls: AtomicU32,
    pub probe_calls: AtomicU32,
    pub stop_calls: AtomicU32,
}

impl ScriptedControlAgent {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::failing(endpoint, 0)
    }

    pub fn failing(endpoint: impl Into<String>, failures: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            failures,
            terminate_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            probe_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }

    fn started_ok(&self) -> bool {
        self.start_calls.load(Ordering::SeqCst) > self.failures
    }
}

#[async_trait]
impl ControlAgent for ScriptedControlAgent {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn terminate_stale(&self) -> Result<(), DeviceError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_daemon(&self) -> Result<(), DeviceError> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(DeviceError::Command {
                command: "atx-agent server -d".into(),
                reason: format!("daemon exited (attempt {n})"),
            });
        }
        Ok(())
    }

    async fn probe_ready(&self) -> Result<bool, DeviceError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.started_ok())
    }

    async fn stop_service(&self) -> Result<(), DeviceError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out scripted devices and agents keyed by participant id.
///
/// Unknown participants get a bare [`ScriptedDevice`] on first connect.
#[derive(Default)]
pub struct ScriptedConnector {
    devices: Mutex<HashMap<ParticipantId, Arc<ScriptedDevice>>>,
    agents: Mutex<HashMap<ParticipantId, Arc<ScriptedControlAgent>>>,
    unreachable: HashSet<ParticipantId>,
    disconnected: Mutex<Vec<ParticipantId>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, participant: impl Into<ParticipantId>, device: ScriptedDevice) -> Self {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(participant.into(), Arc::new(device));
        self
    }

    pub fn with_agent(self, participant: impl Into<ParticipantId>, agent: ScriptedControlAgent) -> Self {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(participant.into(), Arc::new(agent));
        self
    }

    pub fn unreachable(mut self, participant: impl Into<ParticipantId>) -> Self {
        self.unreachable.insert(participant.into());
        self
    }

    pub fn device(&self, participant: &ParticipantId) -> Option<Arc<ScriptedDevice>> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(participant)
            .cloned()
    }

    pub fn agent(&self, participant: &ParticipantId) -> Option<Arc<ScriptedControlAgent>> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(participant)
            .cloned()
    }

    pub fn disconnected(&self) -> Vec<ParticipantId> {
        self.disconnected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeviceConnector for ScriptedConnector {
    async fn connect(&self, participant: &ParticipantSpec) -> Result<Arc<dyn DeviceCapability>, DeviceError> {
        if self.unreachable.contains(&participant.id) {
            return Err(DeviceError::Disconnected(participant.endpoint.clone()));
        }
        let device = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(participant.id.clone())
            .or_insert_with(|| Arc::new(ScriptedDevice::new(participant.endpoint.clone())))
            .clone();
        Ok(device)
    }

    fn control_agent(&self, participant: &ParticipantSpec) -> Arc<dyn ControlAgent> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(participant.id.clone())
            .or_insert_with(|| Arc::new(ScriptedControlAgent::new(participant.endpoint.clone())))
            .clone()
    }

    async fn disconnect(&self, participant: &ParticipantSpec) -> Result<(), DeviceError> {
        self.disconnected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(participant.id.clone());
        Ok(())
    }
}
