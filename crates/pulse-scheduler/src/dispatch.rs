//! Dispatch sweeps: apply due schedules and report back to the engine.
//!
//! Each sweep fetches at most `batch_size` due rows (oldest first), re-checks
//! eligibility, hands the row to the allocator or the mailer, then marks it
//! Completed or Failed. One bad row never aborts the sweep.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use pulse_core::error::{PulseError, Result};
use pulse_core::traits::{Allocator, Mailer};
use pulse_core::types::{InstanceId, NotificationMessage, UserId};

use crate::engine::{EngineContext, ScheduleEngine};
use crate::events::{AuditEvent, EventLog};
use crate::kinds::notification_content;
use crate::mailer::render_template;
use crate::record::{ActionType, SchedulePayload, ScheduleRecord};
use crate::store::DueQuery;

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub fetched: usize,
    pub completed: usize,
    pub failed: usize,
    pub disabled: usize,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} completed={} failed={} disabled={}",
            self.fetched, self.completed, self.failed, self.disabled
        )
    }
}

/// Both sweeps of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub credits: SweepReport,
    pub notifications: SweepReport,
}

/// Request-scoped engines keyed by instance id. `None` remembers a failed load.
type EngineCache = HashMap<InstanceId, Option<ScheduleEngine>>;

enum Gate {
    Proceed,
    Disabled,
    Skip,
}

pub struct Dispatcher {
    ctx: EngineContext,
    allocator: Arc<dyn Allocator>,
    mailer: Arc<dyn Mailer>,
    events: Arc<EventLog>,
    batch_size: usize,
}

impl Dispatcher {
    pub fn new(
        ctx: EngineContext,
        allocator: Arc<dyn Allocator>,
        mailer: Arc<dyn Mailer>,
        events: Arc<EventLog>,
        batch_size: usize,
    ) -> Self {
        Self { ctx, allocator, mailer, events, batch_size }
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    fn fetch(&self, action: ActionType, user_id: Option<UserId>) -> Result<Vec<ScheduleRecord>> {
        let query = DueQuery { now: self.ctx.now(), limit: self.batch_size, user_id };
        self.ctx.store.fetch_due(action, &query)
    }

    fn engine<'a>(&self, cache: &'a mut EngineCache, instance_id: InstanceId, action: ActionType) -> Option<&'a ScheduleEngine> {
        cache
            .entry(instance_id)
            .or_insert_with(|| match ScheduleEngine::load(self.ctx.clone(), instance_id, action) {
                Ok(engine) => Some(engine),
                Err(e) => {
                    tracing::warn!("Cannot load instance {instance_id} for {} sweep: {e}", action.as_str());
                    None
                }
            })
            .as_ref()
    }

    /// Eligibility may have changed since the row was queued.
    fn gate(&self, engine: &ScheduleEngine, row: &ScheduleRecord) -> Gate {
        let subject = row.subject_user();
        if !engine.is_eligible(subject, false) {
            return match engine.disable_user_schedule(row.user_id, row.related_user_id) {
                Ok(_) => Gate::Disabled,
                Err(e) => {
                    tracing::warn!(
                        "Failed to disable schedule: schedule_id={} user_id={} instance_id={}: {e}",
                        row.id,
                        row.user_id,
                        row.instance_id
                    );
                    Gate::Skip
                }
            };
        }
        if self.ctx.suppression().is_suppress_reached(engine.instance(), engine.action_type(), subject) {
            return Gate::Disabled;
        }
        Gate::Proceed
    }

    fn finish(&self, engine: &ScheduleEngine, row: &ScheduleRecord, outcome: Result<AuditEvent>, report: &mut SweepReport) {
        let now = self.ctx.now();
        match outcome {
            Ok(event) => {
                self.events.record(now, event);
                let completed = match engine.complete(row.id) {
                    Ok(completed) => completed,
                    Err(e) => {
                        tracing::warn!(
                            "Applied but not marked completed: schedule_id={} user_id={} instance_id={}: {e}",
                            row.id,
                            row.user_id,
                            row.instance_id
                        );
                        return;
                    }
                };
                report.completed += 1;
                // Stays Completed even when chaining fails
                if let Some(record) = completed {
                    if let Err(e) = engine.chain_next(&record) {
                        tracing::warn!(
                            "Next occurrence not scheduled: schedule_id={} user_id={} instance_id={}: {e}",
                            row.id,
                            row.user_id,
                            row.instance_id
                        );
                    }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(mark) = engine.mark_failed(row.id, &reason) {
                    tracing::warn!(
                        "Failed to record failure: schedule_id={} user_id={} instance_id={}: {mark}",
                        row.id,
                        row.user_id,
                        row.instance_id
                    );
                }
                self.events.record(
                    now,
                    AuditEvent::ScheduleFailed {
                        action: engine.action_type(),
                        schedule_id: row.id,
                        instance_id: row.instance_id,
                        user_id: row.user_id,
                        reason,
                    },
                );
                report.failed += 1;
            }
        }
    }

    /// Apply due credit schedules through the allocator.
    pub fn run_credits_sweep(&self, user_id: Option<UserId>) -> Result<SweepReport> {
        let action = ActionType::Credits;
        let rows = self.fetch(action, user_id)?;
        let mut report = SweepReport { fetched: rows.len(), ..Default::default() };
        let mut cache = EngineCache::new();

        for row in &rows {
            let Some(engine) = self.engine(&mut cache, row.instance_id, action) else {
                continue;
            };
            match self.gate(engine, row) {
                Gate::Proceed => {}
                Gate::Disabled => {
                    report.disabled += 1;
                    continue;
                }
                Gate::Skip => continue,
            }
            let outcome = self.allocate(row);
            self.finish(engine, row, outcome, &mut report);
        }

        tracing::info!("💰 Credits sweep: {report}");
        Ok(report)
    }

    fn allocate(&self, row: &ScheduleRecord) -> Result<AuditEvent> {
        let SchedulePayload::Credits { credits, allocation_method, .. } = row.payload else {
            return Err(PulseError::validation(format!("schedule {} carries no credits", row.id)));
        };
        self.allocator.apply(row.user_id, credits, allocation_method)?;
        Ok(AuditEvent::CreditAllocated {
            schedule_id: row.id,
            instance_id: row.instance_id,
            user_id: row.user_id,
            credits,
            method: allocation_method,
        })
    }

    /// Deliver due notifications through the mailer.
    pub async fn run_notification_sweep(&self, user_id: Option<UserId>) -> Result<SweepReport> {
        let action = ActionType::Notification;
        let rows = self.fetch(action, user_id)?;
        let mut report = SweepReport { fetched: rows.len(), ..Default::default() };
        let mut cache = EngineCache::new();

        for row in &rows {
            let Some(engine) = self.engine(&mut cache, row.instance_id, action) else {
                continue;
            };
            match self.gate(engine, row) {
                Gate::Proceed => {}
                Gate::Disabled => {
                    report.disabled += 1;
                    continue;
                }
                Gate::Skip => continue,
            }
            let outcome = match self.compose(engine, row) {
                Ok(message) => self.mailer.send(&message).await.map(|_| AuditEvent::NotificationSent {
                    schedule_id: row.id,
                    instance_id: row.instance_id,
                    user_id: row.user_id,
                    related_user_id: row.related_user_id,
                }),
                Err(e) => Err(e),
            };
            self.finish(engine, row, outcome, &mut report);
        }

        tracing::info!("📬 Notification sweep via {}: {report}", self.mailer.name());
        Ok(report)
    }

    fn compose(&self, engine: &ScheduleEngine, row: &ScheduleRecord) -> Result<NotificationMessage> {
        let (subject, body) = notification_content(engine.settings())
            .ok_or_else(|| PulseError::validation(format!("instance {} has no notification content", row.instance_id)))?;
        let directory = &self.ctx.directory;
        let course_id = engine.instance().course_id;
        let recipient_email = directory.user_email(row.user_id);

        let mut vars = BTreeMap::new();
        vars.insert("course_name", directory.course_name(course_id).unwrap_or_default());
        vars.insert("user_email", recipient_email.clone().unwrap_or_default());
        if let Some(related) = row.related_user_id {
            vars.insert("related_user_email", directory.user_email(related).unwrap_or_default());
        }

        Ok(NotificationMessage {
            instance_id: row.instance_id,
            course_id,
            recipient_user_id: row.user_id,
            recipient_email,
            related_user_id: row.related_user_id,
            subject: render_template(subject, &vars),
            body: render_template(body, &vars),
        })
    }

    /// Credits first, then notifications.
    pub async fn run_all(&self, user_id: Option<UserId>) -> Result<SweepSummary> {
        Ok(SweepSummary {
            credits: self.run_credits_sweep(user_id)?,
            notifications: self.run_notification_sweep(user_id).await?,
        })
    }
}

/// Spawn the dispatch loop as a background tokio task.
pub async fn spawn_dispatcher(dispatcher: Arc<Dispatcher>, tick_secs: u64) {
    tracing::info!("⏰ Dispatcher started (sweep every {tick_secs}s)");

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs));

    loop {
        interval.tick().await;

        if let Err(e) = dispatcher.run_all(None).await {
            tracing::warn!("Sweep aborted: {e}");
        }
    }
}
