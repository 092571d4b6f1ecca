//! Schedule engine: owns the per-user schedule lifecycle.
//!
//! One [`ScheduleEngine`] is built per (instance, action kind). It is the only
//! component that changes a schedule's status: create, requeue, disable,
//! complete and fail all go through here.

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use serde::Serialize;

use pulse_core::clock::Clock;
use pulse_core::error::{PulseError, Result};
use pulse_core::traits::{CompletionInfo, ConditionEvaluator, CourseDirectory, RoleResolver};
use pulse_core::types::{InstanceId, ScheduleId, UserId};

use crate::action::ActionSettings;
use crate::instance::AutomationInstance;
use crate::kinds::{ActionKind, kind_for};
use crate::persistence::SchedulerDb;
use crate::record::{ActionType, ScheduleRecord, ScheduleStatus, status_label};
use crate::recurrence::{Delay, IntervalType, RecurrenceCalculator, RunContext};
use crate::store::{DeleteScope, InstanceRepository, ScheduleStore};
use crate::suppress::SuppressionEvaluator;

/// Everything the engine talks to, injected explicitly.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn ScheduleStore>,
    pub instances: Arc<dyn InstanceRepository>,
    pub conditions: Arc<dyn ConditionEvaluator>,
    pub roles: Arc<dyn RoleResolver>,
    pub completion: Arc<dyn CompletionInfo>,
    pub directory: Arc<dyn CourseDirectory>,
    pub clock: Arc<dyn Clock>,
    pub calculator: RecurrenceCalculator,
}

impl EngineContext {
    /// Context where the SQLite database backs every collaborator.
    pub fn from_db(db: Arc<SchedulerDb>, clock: Arc<dyn Clock>, calculator: RecurrenceCalculator) -> Self {
        Self {
            store: db.clone(),
            instances: db.clone(),
            conditions: db.clone(),
            roles: db.clone(),
            completion: db.clone(),
            directory: db,
            clock,
            calculator,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn suppression(&self) -> SuppressionEvaluator {
        SuppressionEvaluator::new(self.completion.clone(), self.store.clone(), self.clock.clone())
    }
}

/// Arguments of [`ScheduleEngine::create_schedule_for_user`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub user_id: UserId,
    pub related_user_id: Option<UserId>,
    pub last_run: Option<i64>,
    /// `None` reuses the counter of the user's latest record.
    pub notify_count: Option<u32>,
    pub expected_run_time: Option<i64>,
    pub is_new_user: bool,
    /// Chained or forced request; checks suppression and may insert after a completion.
    pub new_schedule: bool,
    /// Starts a new restart cycle.
    pub new_frequency: bool,
    /// The completed schedule this one continues.
    pub previous_based: Option<ScheduleId>,
}

impl ScheduleRequest {
    pub fn for_user(user_id: UserId) -> Self {
        Self { user_id, ..Default::default() }
    }

    pub fn related_to(mut self, related_user_id: Option<UserId>) -> Self {
        self.related_user_id = related_user_id.filter(|r| *r != self.user_id);
        self
    }

    pub fn subject(&self) -> UserId {
        self.related_user_id.unwrap_or(self.user_id)
    }
}

/// What happened to one user's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Inserted(ScheduleId),
    Updated(ScheduleId),
    /// The eligibility gate failed; any active schedule is now Disabled.
    Disabled,
    /// Nothing to do (already completed once, limit reached, frozen by suppression).
    Unchanged,
}

impl ScheduleOutcome {
    pub fn schedule_id(self) -> Option<ScheduleId> {
        match self {
            Self::Inserted(id) | Self::Updated(id) => Some(id),
            Self::Disabled | Self::Unchanged => None,
        }
    }
}

/// Summary of a fan-out over an instance's recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
    pub inserted: usize,
    pub updated: usize,
    pub disabled: usize,
    pub unchanged: usize,
    /// Targets skipped because their stop condition is already reached.
    pub suppressed: usize,
    pub removed: usize,
}

impl InstanceReport {
    fn record(&mut self, outcome: ScheduleOutcome) {
        match outcome {
            ScheduleOutcome::Inserted(_) => self.inserted += 1,
            ScheduleOutcome::Updated(_) => self.updated += 1,
            ScheduleOutcome::Disabled => self.disabled += 1,
            ScheduleOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

impl AddAssign for InstanceReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.disabled += other.disabled;
        self.unchanged += other.unchanged;
        self.suppressed += other.suppressed;
        self.removed += other.removed;
    }
}

impl fmt::Display for InstanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} updated={} disabled={} unchanged={} suppressed={} removed={}",
            self.inserted, self.updated, self.disabled, self.unchanged, self.suppressed, self.removed
        )
    }
}

/// One line of the schedule report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub schedule_id: ScheduleId,
    pub user_id: UserId,
    pub related_user_id: Option<UserId>,
    pub schedule_time: i64,
    pub status: String,
    pub notify_count: u32,
    pub credits: Option<f64>,
    pub error_log: Option<String>,
}

/// The schedule state machine for one action of one instance.
pub struct ScheduleEngine {
    ctx: EngineContext,
    instance: AutomationInstance,
    settings: ActionSettings,
    kind: &'static dyn ActionKind,
}

impl ScheduleEngine {
    pub fn new(ctx: EngineContext, instance: AutomationInstance, action: ActionType) -> Result<Self> {
        let settings = instance.action_settings(action).ok_or_else(|| {
            PulseError::NotFound(format!("{} action on instance {}", action.as_str(), instance.id))
        })?;
        Ok(Self { ctx, instance, settings, kind: kind_for(action) })
    }

    pub fn load(ctx: EngineContext, instance_id: InstanceId, action: ActionType) -> Result<Self> {
        let instance = ctx
            .instances
            .get_instance(instance_id)?
            .ok_or_else(|| PulseError::NotFound(format!("instance {instance_id}")))?;
        Self::new(ctx, instance, action)
    }

    /// Engines for every action configured on `instance`.
    pub fn for_instance(ctx: &EngineContext, instance: &AutomationInstance) -> Vec<Self> {
        instance
            .action_types()
            .into_iter()
            .filter_map(|action| Self::new(ctx.clone(), instance.clone(), action).ok())
            .collect()
    }

    pub fn instance(&self) -> &AutomationInstance {
        &self.instance
    }

    pub fn settings(&self) -> &ActionSettings {
        &self.settings
    }

    pub fn kind(&self) -> &'static dyn ActionKind {
        self.kind
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    fn is_active(&self) -> bool {
        self.instance.enabled && self.settings.enabled
    }

    /// Action enabled, a condition configured, and the condition plugins
    /// agree for `subject`.
    pub fn is_eligible(&self, subject: UserId, is_new_user: bool) -> bool {
        self.is_active()
            && self.instance.has_enabled_condition()
            && self
                .ctx
                .conditions
                .is_user_eligible(&self.instance.condition_context(), subject, is_new_user)
    }

    /// Build or refresh the schedules of every resolved recipient.
    pub fn create_schedule_for_instance(
        &self,
        new_enrolment: bool,
        target_user: Option<UserId>,
        new_frequency: bool,
    ) -> Result<InstanceReport> {
        let mut report = InstanceReport::default();
        let action = self.action_type();

        if !self.is_active() {
            report.disabled = self.ctx.store.disable_queued(action, self.instance.id, self.ctx.now())?;
            tracing::info!(
                "⏸️ Instance {} {} disabled: {} queued schedules put on hold",
                self.instance.id,
                action.as_str(),
                report.disabled
            );
            return Ok(report);
        }

        if self.settings.recipients.is_empty() {
            let removed = self.ctx.store.delete_for_instance(action, self.instance.id, DeleteScope::All)?;
            self.ctx.store.delete_overrides(&removed)?;
            report.removed = removed.len();
            tracing::info!(
                "🧹 Instance {} {} has no recipients: removed {} schedules",
                self.instance.id,
                action.as_str(),
                report.removed
            );
            return Ok(report);
        }

        if !self.kind.verify(&self.settings) {
            tracing::debug!("Instance {} {} not schedulable", self.instance.id, action.as_str());
            return Ok(report);
        }

        let course_id = self.instance.course_id;
        let mut recipients = self.ctx.roles.resolve_recipients(&self.settings.recipients, course_id, target_user);
        let mut learners = self.ctx.roles.learners(course_id);
        if let Some(target) = target_user {
            recipients = self.kind.narrow(recipients, target, self.ctx.roles.as_ref(), course_id);
            learners.retain(|u| *u == target);
        }

        let suppression = self.ctx.suppression();
        for target in self.kind.fan_out(&recipients, &learners) {
            if suppression.is_reached(&self.settings.suppress, course_id, target.subject()) {
                report.suppressed += 1;
                continue;
            }
            let request = ScheduleRequest {
                is_new_user: new_enrolment,
                new_frequency,
                ..ScheduleRequest::for_user(target.user_id).related_to(target.related_user_id)
            };
            report.record(self.create_schedule_for_user(&request)?);
        }

        tracing::info!("📅 Instance {} {}: {report}", self.instance.id, action.as_str());
        Ok(report)
    }

    /// Gate, then compute and upsert one user's schedule.
    pub fn create_schedule_for_user(&self, req: &ScheduleRequest) -> Result<ScheduleOutcome> {
        let now = self.ctx.now();
        let action = self.action_type();
        let store = &self.ctx.store;
        let subject = req.subject();

        if !self.is_eligible(subject, req.is_new_user)
            || (req.new_schedule && self.ctx.suppression().is_suppress_reached(&self.instance, action, subject))
        {
            let changed = store.disable_for_user(action, self.instance.id, req.user_id, req.related_user_id, now)?;
            tracing::debug!(
                "User {} not eligible for instance {} {}: disabled {changed}",
                req.user_id,
                self.instance.id,
                action.as_str()
            );
            return Ok(ScheduleOutcome::Disabled);
        }

        let latest = store.latest_for_user(action, self.instance.id, req.user_id, req.related_user_id)?;
        let mut frequency = latest.as_ref().map_or(0, |r| r.frequency_count);
        let limit = self.instance.frequency_limit;
        let frequency_open = limit == 0 || frequency < limit;

        let notify_count = if req.new_frequency && frequency_open {
            frequency += 1;
            req.notify_count.unwrap_or(0)
        } else {
            let count = req.notify_count.unwrap_or_else(|| latest.as_ref().map_or(0, |r| r.notify_count));
            if self.settings.notify_limit > 0 && count >= self.settings.notify_limit {
                tracing::debug!("Notify limit reached: instance={} user={}", self.instance.id, req.user_id);
                return Ok(ScheduleOutcome::Unchanged);
            }
            if self.settings.interval.interval_type() == IntervalType::Once
                && store
                    .latest_completed(action, self.instance.id, req.user_id, req.related_user_id)?
                    .is_some()
            {
                return Ok(ScheduleOutcome::Unchanged);
            }
            count
        };

        let last_run = match req.last_run {
            Some(t) => Some(t),
            None => store
                .latest_completed(action, self.instance.id, req.user_id, req.related_user_id)?
                .and_then(|r| r.completed_time),
        };

        let delay_anchor = if !matches!(self.settings.delay, Delay::None)
            && last_run.is_none()
            && req.expected_run_time.is_none()
        {
            self.delay_anchor(subject)
        } else {
            None
        };

        let enrolment_time = self.ctx.directory.enrolment_time(self.instance.course_id, subject);
        let run = RunContext {
            base_time: self.settings.base_date.resolve(enrolment_time, now),
            now,
            last_run,
            expected_run_time: req.expected_run_time,
            delay_anchor,
        };
        let schedule_time = self.ctx.calculator.next_run(&self.settings.interval, self.settings.delay, &run);

        let mut payload = self.kind.generate_payload(&self.settings);
        if let Some(previous_id) = req.previous_based {
            if let Some(previous) = store.get(action, previous_id)? {
                self.kind.chain_payload(&mut payload, &previous);
            }
        }

        let candidate = ScheduleRecord {
            id: 0,
            instance_id: self.instance.id,
            user_id: req.user_id,
            related_user_id: req.related_user_id,
            interval_type: self.settings.interval.interval_type(),
            status: ScheduleStatus::Queued,
            schedule_time,
            completed_time: None,
            notify_count,
            frequency_count: frequency,
            suppress_reached: false,
            time_created: now,
            time_modified: now,
            payload,
            error_log: None,
        };
        self.upsert(candidate, req.new_schedule, req.new_frequency)
    }

    /// Write `candidate` without ever duplicating an active obligation.
    pub fn upsert(&self, mut candidate: ScheduleRecord, new_schedule: bool, new_frequency: bool) -> Result<ScheduleOutcome> {
        let store = &self.ctx.store;
        let action = candidate.action_type();

        if let Some(existing) = store.find_active(action, &candidate.key())? {
            if existing.suppress_reached {
                tracing::debug!("Schedule {} is frozen by suppression", existing.id);
                return Ok(ScheduleOutcome::Unchanged);
            }
            candidate.id = existing.id;
            candidate.time_created = existing.time_created;
            candidate.status = ScheduleStatus::Queued;
            self.kind.before_update(store.as_ref(), &mut candidate, &existing)?;
            store.update(&candidate)?;
            tracing::debug!(
                "Schedule {} requeued for user {} at {}",
                existing.id,
                candidate.user_id,
                candidate.schedule_time
            );
            return Ok(ScheduleOutcome::Updated(existing.id));
        }

        if !new_schedule
            && !new_frequency
            && store
                .latest_completed(action, candidate.instance_id, candidate.user_id, candidate.related_user_id)?
                .is_some()
        {
            return Ok(ScheduleOutcome::Unchanged);
        }

        let id = store.insert(&candidate)?;
        tracing::debug!(
            "Schedule {id} created: instance={} user={} related={:?} at {}",
            candidate.instance_id,
            candidate.user_id,
            candidate.related_user_id,
            candidate.schedule_time
        );
        Ok(ScheduleOutcome::Inserted(id))
    }

    /// Tear down the rebuildable schedules (queued, or frozen by suppression)
    /// and build them again.
    pub fn recreate_schedule_for_instance(&self) -> Result<InstanceReport> {
        let action = self.action_type();
        let removed = self.ctx.store.delete_for_instance(action, self.instance.id, DeleteScope::Rebuildable)?;
        self.ctx.store.delete_overrides(&removed)?;
        tracing::info!("🔁 Recreating instance {} {}: cleared {}", self.instance.id, action.as_str(), removed.len());

        let mut report = self.create_schedule_for_instance(false, None, false)?;
        report.removed += removed.len();
        Ok(report)
    }

    /// Delete the user's active schedules (as recipient or related user) and
    /// any credit overrides on them.
    pub fn remove_user_schedules(&self, user_id: UserId) -> Result<Vec<ScheduleId>> {
        let removed = self.ctx.store.delete_for_user(self.action_type(), self.instance.id, user_id)?;
        self.ctx.store.delete_overrides(&removed)?;
        if !removed.is_empty() {
            tracing::info!(
                "🗑️ Removed {} schedules of user {user_id} from instance {}",
                removed.len(),
                self.instance.id
            );
        }
        Ok(removed)
    }

    pub fn disable_user_schedule(&self, user_id: UserId, related_user_id: Option<UserId>) -> Result<usize> {
        self.ctx
            .store
            .disable_for_user(self.action_type(), self.instance.id, user_id, related_user_id, self.ctx.now())
    }

    /// Completed, then chain the next occurrence for recurring intervals.
    /// Returns the chained outcome, if any. Completing twice is a no-op.
    pub fn mark_completed(&self, schedule_id: ScheduleId) -> Result<Option<ScheduleOutcome>> {
        match self.complete(schedule_id)? {
            Some(record) => self.chain_next(&record),
            None => Ok(None),
        }
    }

    /// Persist Completed on its own. `None` when the record already was.
    /// Once this returns the occurrence can no longer be fetched as due.
    pub fn complete(&self, schedule_id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        let now = self.ctx.now();
        let store = &self.ctx.store;
        let mut record = store
            .get(self.action_type(), schedule_id)?
            .ok_or_else(|| PulseError::NotFound(format!("schedule {schedule_id}")))?;
        if record.status == ScheduleStatus::Completed {
            return Ok(None);
        }

        record.status = ScheduleStatus::Completed;
        record.completed_time = Some(now);
        record.notify_count += 1;
        record.time_modified = now;
        record.error_log = None;
        store.update(&record)?;
        tracing::info!(
            "✅ Schedule {} completed: instance={} user={} count={}",
            record.id,
            record.instance_id,
            record.user_id,
            record.notify_count
        );
        Ok(Some(record))
    }

    /// Schedule the occurrence after `completed`. `None` for one-off intervals.
    pub fn chain_next(&self, completed: &ScheduleRecord) -> Result<Option<ScheduleOutcome>> {
        if !self.settings.interval.interval_type().is_recurring() {
            return Ok(None);
        }

        let now = self.ctx.now();
        let request = ScheduleRequest {
            last_run: Some(now),
            notify_count: Some(completed.notify_count),
            new_schedule: true,
            previous_based: Some(completed.id),
            ..ScheduleRequest::for_user(completed.user_id).related_to(completed.related_user_id)
        };
        let outcome = self.create_schedule_for_user(&request)?;
        if let Some(next_id) = outcome.schedule_id() {
            self.kind.carry_forward(self.ctx.store.as_ref(), &self.settings, completed, next_id, now)?;
        }
        Ok(Some(outcome))
    }

    /// Failed is terminal for this occurrence; the next recompute decides
    /// whether a new one is created.
    pub fn mark_failed(&self, schedule_id: ScheduleId, reason: &str) -> Result<()> {
        let now = self.ctx.now();
        let mut record = self
            .ctx
            .store
            .get(self.action_type(), schedule_id)?
            .ok_or_else(|| PulseError::NotFound(format!("schedule {schedule_id}")))?;
        record.status = ScheduleStatus::Failed;
        record.error_log = Some(reason.to_string());
        record.time_modified = now;
        self.ctx.store.update(&record)?;
        tracing::warn!(
            "❌ Schedule failed: schedule_id={} user_id={} instance_id={}: {reason}",
            record.id,
            record.user_id,
            record.instance_id
        );
        Ok(())
    }

    /// Report label for `record` as seen by this instance.
    pub fn status_label(&self, record: &ScheduleRecord) -> String {
        status_label(record.status, self.instance.enabled, self.kind.completed_status_label())
    }

    pub fn report(&self) -> Result<Vec<ReportRow>> {
        let rows = self.ctx.store.list_for_instance(self.action_type(), self.instance.id)?;
        Ok(rows
            .iter()
            .map(|r| ReportRow {
                schedule_id: r.id,
                user_id: r.user_id,
                related_user_id: r.related_user_id,
                schedule_time: r.schedule_time,
                status: self.status_label(r),
                notify_count: r.notify_count,
                credits: r.credits(),
                error_log: r.error_log.clone(),
            })
            .collect())
    }

    /// First anchor offered by a delay-capable condition, in condition-name order.
    fn delay_anchor(&self, subject: UserId) -> Option<i64> {
        let ctx = self.instance.condition_context();
        ctx.enabled_names()
            .filter(|name| self.ctx.conditions.supports_delay(name))
            .find_map(|name| self.ctx.conditions.delay_anchor(name, &ctx, subject))
    }
}
