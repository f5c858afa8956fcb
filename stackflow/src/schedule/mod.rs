//! Scheduled invocation of workers outside the deploy lifecycle.
//!
//! Entries are registered once per deploy and fire on their own clock:
//!
//! ```text
//! register(id, cron, target) ──► ScheduleEntry { next_fire }
//!                                      │
//!                          spawn() ────┴──► fire_due(now) ──► target.fire(ctx)
//! ```

mod cron;
mod trigger;

pub use cron::CronExpression;
pub use trigger::{FireContext, ScheduleEntry, ScheduledTrigger, TriggerTarget};
