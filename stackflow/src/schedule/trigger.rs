//! Cron-driven invocation of targets, independent of deploy runs.

use super::cron::CronExpression;
use crate::events::{self, EventSink, NoOpEventSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Something a schedule entry invokes.
#[async_trait]
pub trait TriggerTarget: Send + Sync {
    /// Runs one scheduled invocation. Errors are logged by the trigger and
    /// otherwise ignored.
    async fn fire(&self, ctx: &FireContext) -> anyhow::Result<()>;
}

/// Passed to a target on each fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FireContext {
    /// Unique per fire.
    pub fire_id: Uuid,
    /// The entry that fired.
    pub trigger_id: String,
    /// The tick this fire belongs to.
    pub scheduled_at: DateTime<Utc>,
    /// When the target was invoked.
    pub fired_at: DateTime<Utc>,
}

/// A registered schedule.
#[derive(Clone)]
pub struct ScheduleEntry {
    /// Registration key.
    pub id: String,
    /// When to fire.
    pub cron: CronExpression,
    /// What to fire.
    pub target: Arc<dyn TriggerTarget>,
    /// `None` once the expression can no longer fire.
    pub next_fire: Option<DateTime<Utc>>,
}

impl fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("id", &self.id)
            .field("cron", &self.cron.as_str())
            .field("next_fire", &self.next_fire)
            .finish_non_exhaustive()
    }
}

struct Due {
    trigger_id: String,
    scheduled_at: DateTime<Utc>,
    target: Arc<dyn TriggerTarget>,
}

/// Holds schedule entries and fires them on their own clock.
///
/// Registration is keyed by id, so registering the same trigger on every
/// deploy replaces the entry rather than adding another one.
pub struct ScheduledTrigger {
    entries: RwLock<BTreeMap<String, ScheduleEntry>>,
    events: Arc<dyn EventSink>,
    changed: Notify,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for ScheduledTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTrigger")
            .field("entries", &self.entries.read().len())
            .field("shutdown", &*self.shutdown.borrow())
            .finish_non_exhaustive()
    }
}

impl Default for ScheduledTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduledTrigger {
    /// Creates a trigger with no entries.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events: Arc::new(NoOpEventSink),
            changed: Notify::new(),
            shutdown,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Registers `target` under `id`, replacing any entry with that id.
    ///
    /// Returns the first fire time, or `None` if the expression never fires.
    pub fn register(
        &self,
        id: impl Into<String>,
        cron: CronExpression,
        target: Arc<dyn TriggerTarget>,
    ) -> Option<DateTime<Utc>> {
        let id = id.into();
        let next_fire = cron.next_after(Utc::now());
        let replaced = self
            .entries
            .write()
            .insert(
                id.clone(),
                ScheduleEntry {
                    id: id.clone(),
                    cron: cron.clone(),
                    target,
                    next_fire,
                },
            )
            .is_some();

        info!(trigger_id = %id, cron = %cron, replaced, next_fire = ?next_fire, "Trigger registered");
        self.events.try_emit(
            events::TRIGGER_REGISTERED,
            Some(serde_json::json!({
                "trigger_id": id,
                "cron": cron.as_str(),
                "replaced": replaced,
                "next_fire": next_fire,
            })),
        );
        self.changed.notify_one();
        next_fire
    }

    /// Removes an entry. Returns false if there was none.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.entries.write().remove(id).is_some();
        if removed {
            info!(trigger_id = %id, "Trigger unregistered");
            self.changed.notify_one();
        }
        removed
    }

    /// Snapshot of every entry, ordered by id.
    #[must_use]
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Next fire time of an entry.
    #[must_use]
    pub fn next_fire(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.read().get(id).and_then(|entry| entry.next_fire)
    }

    fn earliest_fire(&self) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .values()
            .filter_map(|entry| entry.next_fire)
            .min()
    }

    /// Collects entries due at `now` and moves each to its next tick.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<Due> {
        let mut entries = self.entries.write();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            let Some(scheduled_at) = entry.next_fire.filter(|at| *at <= now) else {
                continue;
            };
            // Missed ticks collapse into one fire.
            entry.next_fire = entry.cron.next_after(now);
            due.push(Due {
                trigger_id: entry.id.clone(),
                scheduled_at,
                target: Arc::clone(&entry.target),
            });
        }
        due
    }

    async fn fire(sink: Arc<dyn EventSink>, due: Due) -> String {
        let ctx = FireContext {
            fire_id: Uuid::now_v7(),
            trigger_id: due.trigger_id,
            scheduled_at: due.scheduled_at,
            fired_at: Utc::now(),
        };
        debug!(trigger_id = %ctx.trigger_id, fire_id = %ctx.fire_id, "Firing trigger");

        let error = due.target.fire(&ctx).await.err().map(|e| format!("{e:#}"));
        if let Some(error) = &error {
            warn!(trigger_id = %ctx.trigger_id, fire_id = %ctx.fire_id, error = %error, "Trigger target failed");
        }
        sink.try_emit(
            events::TRIGGER_FIRED,
            Some(serde_json::json!({
                "trigger_id": ctx.trigger_id,
                "fire_id": ctx.fire_id,
                "scheduled_at": ctx.scheduled_at,
                "success": error.is_none(),
                "error": error,
            })),
        );
        ctx.trigger_id
    }

    /// Fires every entry due at `now` once, waits for the targets and
    /// returns the fired ids. Target failures are logged, not returned.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let due = self.take_due(now);
        join_all(
            due.into_iter()
                .map(|due| Self::fire(Arc::clone(&self.events), due)),
        )
        .await
    }

    /// Runs the schedule on a background task until [`shutdown`](Self::shutdown).
    ///
    /// Each tick's targets run on their own tasks so a slow target never
    /// delays the next tick.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let trigger = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!("Scheduled trigger started");
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }

                let wait = trigger
                    .earliest_fire()
                    .map(|at| (at - Utc::now()).to_std().unwrap_or_default());
                let sleep = async {
                    match wait {
                        Some(wait) => tokio::time::sleep(wait).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = trigger.changed.notified() => {}
                    () = sleep => {
                        for due in trigger.take_due(Utc::now()) {
                            tokio::spawn(Self::fire(Arc::clone(&trigger.events), due));
                        }
                    }
                }
            }
            info!("Scheduled trigger stopped");
        })
    }

    /// Stops the loop started by [`spawn`](Self::spawn). Fires already in
    /// progress are left to finish.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
