//! Trigger target fakes.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::schedule::{FireContext, TriggerTarget};

/// Records every fire. Optionally fails each one, or forwards contexts to a
/// channel so tests can await a fire.
#[derive(Debug, Default)]
pub struct RecordingTarget {
    fires: Mutex<Vec<FireContext>>,
    error: Option<String>,
    notify: Option<mpsc::UnboundedSender<FireContext>>,
}

impl RecordingTarget {
    /// A target whose fires succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A target whose every fire fails with `error`.
    #[must_use]
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// A target that also sends each context to the returned receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FireContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = Self {
            notify: Some(tx),
            ..Self::default()
        };
        (target, rx)
    }

    /// Contexts received so far.
    #[must_use]
    pub fn fires(&self) -> Vec<FireContext> {
        self.fires.lock().clone()
    }
}

#[async_trait]
impl TriggerTarget for RecordingTarget {
    async fn fire(&self, ctx: &FireContext) -> anyhow::Result<()> {
        self.fires.lock().push(ctx.clone());
        if let Some(tx) = &self.notify {
            let _ = tx.send(ctx.clone());
        }
        match &self.error {
            Some(error) => Err(anyhow::anyhow!("{error}")),
            None => Ok(()),
        }
    }
}
