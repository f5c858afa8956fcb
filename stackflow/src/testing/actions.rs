//! Provisioning action fakes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::StackOutputs;
use crate::provisioner::{ApplyContext, ProvisioningAction, TeardownContext};

/// Always succeeds with fixed outputs.
#[derive(Debug, Clone, Default)]
pub struct StaticAction {
    outputs: StackOutputs,
}

impl StaticAction {
    /// Creates an action returning these outputs.
    #[must_use]
    pub fn new(outputs: impl IntoIterator<Item = (String, serde_json::Value)>) -> Self {
        Self {
            outputs: outputs.into_iter().collect(),
        }
    }

    /// Creates an action returning no outputs.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvisioningAction for StaticAction {
    async fn apply(&self, _ctx: &ApplyContext) -> anyhow::Result<StackOutputs> {
        Ok(self.outputs.clone())
    }

    async fn teardown(&self, _ctx: &TeardownContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fails on apply, on teardown, or both.
#[derive(Debug, Clone)]
pub struct FailingAction {
    message: String,
    fail_apply: bool,
    fail_teardown: bool,
}

impl FailingAction {
    /// Fails every apply with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fail_apply: true,
            fail_teardown: false,
        }
    }

    /// Applies with no outputs, fails every teardown with `message`.
    #[must_use]
    pub fn teardown_only(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fail_apply: false,
            fail_teardown: true,
        }
    }
}

#[async_trait]
impl ProvisioningAction for FailingAction {
    async fn apply(&self, _ctx: &ApplyContext) -> anyhow::Result<StackOutputs> {
        if self.fail_apply {
            anyhow::bail!("{}", self.message);
        }
        Ok(StackOutputs::new())
    }

    async fn teardown(&self, _ctx: &TeardownContext) -> anyhow::Result<()> {
        if self.fail_teardown {
            anyhow::bail!("{}", self.message);
        }
        Ok(())
    }
}

type ApplyHook = Box<dyn Fn() + Send + Sync>;

/// Records every call and returns fixed outputs, optionally after a delay.
///
/// Tracks how many applies ran at once.
pub struct RecordingAction {
    outputs: StackOutputs,
    delay: Duration,
    on_apply: Option<ApplyHook>,
    applied: Mutex<Vec<ApplyContext>>,
    torn_down: Mutex<Vec<TeardownContext>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl fmt::Debug for RecordingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingAction")
            .field("outputs", &self.outputs)
            .field("delay", &self.delay)
            .field("applied", &self.applied.lock().len())
            .finish_non_exhaustive()
    }
}

impl RecordingAction {
    /// Creates a recorder returning these outputs.
    #[must_use]
    pub fn new(outputs: StackOutputs) -> Self {
        Self {
            outputs,
            delay: Duration::ZERO,
            on_apply: None,
            applied: Mutex::new(Vec::new()),
            torn_down: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Sleeps this long inside each apply.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Runs `hook` at the start of each apply.
    #[must_use]
    pub fn on_apply<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_apply = Some(Box::new(hook));
        self
    }

    /// Apply contexts seen so far, in call order.
    #[must_use]
    pub fn applied(&self) -> Vec<ApplyContext> {
        self.applied.lock().clone()
    }

    /// Teardown contexts seen so far, in call order.
    #[must_use]
    pub fn torn_down(&self) -> Vec<TeardownContext> {
        self.torn_down.lock().clone()
    }

    /// Highest number of applies that overlapped.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvisioningAction for RecordingAction {
    async fn apply(&self, ctx: &ApplyContext) -> anyhow::Result<StackOutputs> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(hook) = &self.on_apply {
            hook();
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.applied.lock().push(ctx.clone());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(self.outputs.clone())
    }

    async fn teardown(&self, ctx: &TeardownContext) -> anyhow::Result<()> {
        self.torn_down.lock().push(ctx.clone());
        Ok(())
    }
}
