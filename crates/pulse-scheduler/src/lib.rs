//! # Pulse Scheduler
//!
//! Recurring per-user schedule engine for course automations: credit
//! allocations and notifications.
//!
//! ## Architecture
//! ```text
//! Lifecycle hooks (instance saved, user enrolled, condition fired, ...)
//!   └── ScheduleEngine::create_schedule_for_instance
//!         ├── RoleResolver → recipients → ActionKind fan-out
//!         ├── eligibility gate (conditions, suppression)
//!         ├── RecurrenceCalculator → next run
//!         └── idempotent upsert → ScheduleStore (memory or SQLite)
//!
//! Dispatcher (tokio interval)
//!   ├── fetch ≤ N due rows, oldest first
//!   ├── re-check eligibility, apply via Allocator / Mailer
//!   └── mark_completed (chains the next occurrence) or mark_failed
//! ```

pub mod action;
pub mod catalog;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod instance;
pub mod kinds;
pub mod lifecycle;
pub mod mailer;
pub mod overrides;
pub mod persistence;
pub mod record;
pub mod recurrence;
pub mod store;
pub mod suppress;

#[cfg(test)]
pub(crate) mod testkit;

pub use action::{ActionContent, ActionOverrides, ActionSettings, SuppressOperator, SuppressRule};
pub use dispatch::{Dispatcher, SweepReport, SweepSummary, spawn_dispatcher};
pub use engine::{EngineContext, InstanceReport, ReportRow, ScheduleEngine, ScheduleOutcome, ScheduleRequest};
pub use events::{AuditEvent, EventLog};
pub use instance::{AutomationInstance, AutomationTemplate, InstanceOverrides};
pub use lifecycle::Lifecycle;
pub use mailer::{LogMailer, SmtpMailer, mailer_from_config};
pub use overrides::{CreditEdit, OverrideReconciler};
pub use persistence::SchedulerDb;
pub use record::{ActionType, CreditOverride, ScheduleRecord, ScheduleStatus};
pub use recurrence::{BaseDateMode, Delay, RecurrenceCalculator, RecurrenceSpec};
pub use store::{InstanceRepository, MemoryStore, ScheduleStore};
pub use suppress::SuppressionEvaluator;
