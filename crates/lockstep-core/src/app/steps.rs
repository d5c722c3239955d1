//! Generic device steps.
//!
//! Building blocks for participant scripts. They know nothing about a target
//! app beyond the selectors they are given.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::pipeline::Step;
use crate::domain::errors::LockstepError;
use crate::domain::step::StepContext;
use crate::ports::device::{DeviceCapability, DeviceError, KeyCode, Point, Selector};

pub struct LaunchApp {
    name: String,
    device: Arc<dyn DeviceCapability>,
    package: String,
}

impl LaunchApp {
    pub fn new(device: Arc<dyn DeviceCapability>, package: impl Into<String>) -> Self {
        let package = package.into();
        Self {
            name: format!("launch {package}"),
            device,
            package,
        }
    }
}

#[async_trait]
impl Step for LaunchApp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &StepContext) -> Result<bool, LockstepError> {
        Ok(true)
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepContext, LockstepError> {
        self.device.launch_app(&self.package).await?;
        let foreground = self.device.current_foreground_app().await?;
        if foreground != self.package {
            return Err(LockstepError::ExecutionFailure {
                step: self.name.clone(),
                reason: format!("{foreground} is in the foreground"),
            });
        }
        Ok(ctx)
    }
}

/// Polls until the element shows up.
pub struct WaitForElement {
    name: String,
    device: Arc<dyn DeviceCapability>,
    selector: Selector,
    timeout: Duration,
    poll_interval: Duration,
}

impl WaitForElement {
    pub fn new(device: Arc<dyn DeviceCapability>, selector: Selector, timeout: Duration) -> Self {
        Self {
            name: format!("wait for {selector}"),
            device,
            selector,
            timeout,
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl Step for WaitForElement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &StepContext) -> Result<bool, LockstepError> {
        Ok(true)
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepContext, LockstepError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.device.exists(&self.selector).await? {
                return Ok(ctx);
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    operation: self.name.clone(),
                    after: self.timeout,
                }
                .into());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Precondition: the element is on screen.
pub struct Click {
    name: String,
    device: Arc<dyn DeviceCapability>,
    selector: Selector,
}

impl Click {
    pub fn new(device: Arc<dyn DeviceCapability>, selector: Selector) -> Self {
        Self {
            name: format!("click {selector}"),
            device,
            selector,
        }
    }
}

#[async_trait]
impl Step for Click {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &StepContext) -> Result<bool, LockstepError> {
        Ok(self.device.exists(&self.selector).await?)
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepContext, LockstepError> {
        self.device.click(&self.selector).await?;
        Ok(ctx)
    }
}

/// Where [`TypeText`] gets its text.
#[derive(Debug, Clone)]
pub enum TextSource {
    Literal(String),
    /// A string value stored in the context under this key.
    Context(String),
}

pub struct TypeText {
    name: String,
    device: Arc<dyn DeviceCapability>,
    selector: Selector,
    text: TextSource,
}

impl TypeText {
    pub fn new(device: Arc<dyn DeviceCapability>, selector: Selector, text: TextSource) -> Self {
        Self {
            name: format!("type into {selector}"),
            device,
            selector,
            text,
        }
    }

    fn resolve<'a>(&'a self, ctx: &'a StepContext) -> Option<&'a str> {
        match &self.text {
            TextSource::Literal(text) => Some(text.as_str()),
            TextSource::Context(key) => ctx.get_str(key),
        }
    }
}

#[async_trait]
impl Step for TypeText {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, ctx: &StepContext) -> Result<bool, LockstepError> {
        if self.resolve(ctx).is_none() {
            return Err(LockstepError::ValidationFailure {
                step: self.name.clone(),
                reason: "no text in context".into(),
            });
        }
        Ok(self.device.exists(&self.selector).await?)
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepContext, LockstepError> {
        let text = self.resolve(&ctx).unwrap_or_default().to_string();
        self.device.type_text(&self.selector, &text).await?;
        Ok(ctx)
    }
}

pub struct PressKey {
    name: String,
    device: Arc<dyn DeviceCapability>,
    key: KeyCode,
}

impl PressKey {
    pub fn new(device: Arc<dyn DeviceCapability>, key: KeyCode) -> Self {
        Self {
            name: format!("press {key:?}"),
            device,
            key,
        }
    }
}

#[async_trait]
impl Step for PressKey {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &StepContext) -> Result<bool, LockstepError> {
        Ok(true)
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepContext, LockstepError> {
        self.device.press_key(self.key).await?;
        Ok(ctx)
    }
}

pub struct Swipe {
    name: String,
    device: Arc<dyn DeviceCapability>,
    from: Point,
    to: Point,
    duration: Duration,
}

impl Swipe {
    pub fn new(device: Arc<dyn DeviceCapability>, from: Point, to: Point, duration: Duration) -> Self {
        Self {
            name: format!("swipe ({},{})->({},{})", from.x, from.y, to.x, to.y),
            device,
            from,
            to,
            duration,
        }
    }
}

#[async_trait]
impl Step for Swipe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &StepContext) -> Result<bool, LockstepError> {
        Ok(true)
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepContext, LockstepError> {
        self.device.swipe(self.from, self.to, self.duration).await?;
        Ok(ctx)
    }
}

/// Stores the UI hierarchy dump in the context under `key`.
pub struct CaptureHierarchy {
    name: String,
    device: Arc<dyn DeviceCapability>,
    key: String,
}

impl CaptureHierarchy {
    pub fn new(device: Arc<dyn DeviceCapability>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: format!("capture hierarchy as {key}"),
            device,
            key,
        }
    }
}

#[async_trait]
impl Step for CaptureHierarchy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &StepContext) -> Result<bool, LockstepError> {
        Ok(true)
    }

    async fn execute(&self, mut ctx: StepContext) -> Result<StepContext, LockstepError> {
        let dump = self.device.dump_ui_hierarchy().await?;
        ctx.insert(self.key.clone(), dump);
        Ok(ctx)
    }
}

type ContextFn = dyn Fn(&mut StepContext) -> Result<(), LockstepError> + Send + Sync;

/// Step backed by a synchronous closure over the context.
pub struct FnStep {
    name: String,
    f: Box<ContextFn>,
}

impl FnStep {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut StepContext) -> Result<(), LockstepError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &StepContext) -> Result<bool, LockstepError> {
        Ok(true)
    }

    async fn execute(&self, mut ctx: StepContext) -> Result<StepContext, LockstepError> {
        (self.f)(&mut ctx)?;
        Ok(ctx)
    }
}
