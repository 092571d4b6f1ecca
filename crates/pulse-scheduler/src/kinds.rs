//! Per-action behaviour plugged into the shared schedule engine.

use pulse_core::error::Result;
use pulse_core::traits::RoleResolver;
use pulse_core::types::{CourseId, Recipient, RecipientScope, ScheduleId, UserId};

use crate::action::{ActionContent, ActionSettings};
use crate::record::{ActionType, CreditOverride, SchedulePayload, ScheduleRecord};
use crate::store::ScheduleStore;

/// One schedule row to create: the recipient and, when it differs, the user
/// whose progress triggers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub user_id: UserId,
    pub related_user_id: Option<UserId>,
}

impl Target {
    pub fn own(user_id: UserId) -> Self {
        Self { user_id, related_user_id: None }
    }

    pub fn on_behalf_of(user_id: UserId, subject: UserId) -> Self {
        if user_id == subject {
            return Self::own(user_id);
        }
        Self { user_id, related_user_id: Some(subject) }
    }

    /// The user whose conditions and suppression rules apply.
    pub fn subject(&self) -> UserId {
        self.related_user_id.unwrap_or(self.user_id)
    }
}

/// The kind-specific half of the schedule engine.
pub trait ActionKind: Send + Sync {
    fn action_type(&self) -> ActionType;

    fn table_name(&self) -> &'static str {
        self.action_type().table_name()
    }

    /// Report label for a Completed record.
    fn completed_status_label(&self) -> &'static str;

    /// Extra pre-check before any schedule is created for the action.
    fn verify(&self, settings: &ActionSettings) -> bool {
        settings.enabled
    }

    /// Keep the recipients concerned by an event of `target`.
    fn narrow(
        &self,
        recipients: Vec<Recipient>,
        target: UserId,
        _roles: &dyn RoleResolver,
        _course_id: CourseId,
    ) -> Vec<Recipient> {
        recipients.into_iter().filter(|r| r.user_id == target).collect()
    }

    /// Expand resolved recipients into schedule rows.
    fn fan_out(&self, recipients: &[Recipient], learners: &[UserId]) -> Vec<Target>;

    /// Payload for a freshly computed record.
    fn generate_payload(&self, settings: &ActionSettings) -> SchedulePayload;

    /// Carry state from the occurrence a new record was chained from.
    fn chain_payload(&self, _payload: &mut SchedulePayload, _previous: &ScheduleRecord) {}

    /// Runs after a completed record chained its next occurrence `next_id`.
    fn carry_forward(
        &self,
        _store: &dyn ScheduleStore,
        _settings: &ActionSettings,
        _previous: &ScheduleRecord,
        _next_id: ScheduleId,
        _now: i64,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs before an existing active record is overwritten by `candidate`.
    fn before_update(
        &self,
        _store: &dyn ScheduleStore,
        _candidate: &mut ScheduleRecord,
        _existing: &ScheduleRecord,
    ) -> Result<()> {
        Ok(())
    }
}

/// Credit allocation schedules.
pub struct CreditsAction;

impl ActionKind for CreditsAction {
    fn action_type(&self) -> ActionType {
        ActionType::Credits
    }

    fn completed_status_label(&self) -> &'static str {
        "Credits applied"
    }

    fn verify(&self, settings: &ActionSettings) -> bool {
        settings.enabled && settings.credit_amount().is_some_and(|(credits, _)| credits > 0.0)
    }

    /// Every resolved user receives their own allocation.
    fn fan_out(&self, recipients: &[Recipient], _learners: &[UserId]) -> Vec<Target> {
        let mut targets: Vec<Target> = Vec::new();
        for recipient in recipients {
            let target = Target::own(recipient.user_id);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    fn generate_payload(&self, settings: &ActionSettings) -> SchedulePayload {
        let (credits, allocation_method) = settings.credit_amount().unwrap_or_default();
        SchedulePayload::Credits { credits, allocation_method, parent_schedule_id: None }
    }

    fn chain_payload(&self, payload: &mut SchedulePayload, previous: &ScheduleRecord) {
        if let SchedulePayload::Credits { credits, parent_schedule_id, .. } = payload {
            if let Some(prev) = previous.credits().filter(|c| *c > 0.0) {
                *credits = prev;
            }
            *parent_schedule_id = Some(previous.id);
        }
    }

    /// Moves a standing override onto the next occurrence; the snapshot is
    /// the configured amount so deleting it falls back to the default.
    fn carry_forward(
        &self,
        store: &dyn ScheduleStore,
        settings: &ActionSettings,
        previous: &ScheduleRecord,
        next_id: ScheduleId,
        now: i64,
    ) -> Result<()> {
        let Some(ov) = store.get_override(previous.id)? else {
            return Ok(());
        };
        let scheduled_credit = settings.credit_amount().map_or(0.0, |(credits, _)| credits);
        store.apply_override(&CreditOverride {
            id: 0,
            schedule_id: next_id,
            scheduled_credit,
            time_created: now,
            time_modified: now,
            ..ov
        })?;
        Ok(())
    }

    /// A standing override wins over the freshly computed amount.
    fn before_update(
        &self,
        store: &dyn ScheduleStore,
        candidate: &mut ScheduleRecord,
        existing: &ScheduleRecord,
    ) -> Result<()> {
        if let Some(ov) = store.get_override(existing.id)? {
            candidate.set_credits(ov.override_credit);
        }
        if let (
            SchedulePayload::Credits { parent_schedule_id: new_parent, .. },
            SchedulePayload::Credits { parent_schedule_id: old_parent, .. },
        ) = (&mut candidate.payload, &existing.payload)
        {
            if new_parent.is_none() {
                *new_parent = *old_parent;
            }
        }
        Ok(())
    }
}

/// Notification schedules.
pub struct NotificationAction;

impl ActionKind for NotificationAction {
    fn action_type(&self) -> ActionType {
        ActionType::Notification
    }

    fn completed_status_label(&self) -> &'static str {
        "Sent"
    }

    /// Learner and parent recipients are matched on the target; course-level
    /// recipients are kept when they share a group with the target.
    fn narrow(
        &self,
        recipients: Vec<Recipient>,
        target: UserId,
        roles: &dyn RoleResolver,
        course_id: CourseId,
    ) -> Vec<Recipient> {
        let (course, mut kept): (Vec<Recipient>, Vec<Recipient>) =
            recipients.into_iter().partition(|r| r.scope == RecipientScope::Course);
        kept.retain(|r| match r.scope {
            RecipientScope::Learner => r.user_id == target,
            RecipientScope::UserContext { child } => child == target,
            RecipientScope::Course => true,
        });

        let target_groups = roles.user_groups(course_id, target);
        let shared: Vec<Recipient> = if target_groups.is_empty() {
            Vec::new()
        } else {
            course
                .iter()
                .filter(|r| roles.user_groups(course_id, r.user_id).iter().any(|g| target_groups.contains(g)))
                .copied()
                .collect()
        };
        kept.extend(if shared.is_empty() { course } else { shared });
        kept
    }

    /// Learners are notified about themselves, course-level recipients about
    /// every learner, and user-context recipients about their child.
    fn fan_out(&self, recipients: &[Recipient], learners: &[UserId]) -> Vec<Target> {
        let mut targets: Vec<Target> = Vec::new();
        let mut push = |target: Target| {
            if !targets.contains(&target) {
                targets.push(target);
            }
        };
        for recipient in recipients {
            match recipient.scope {
                RecipientScope::Learner => push(Target::own(recipient.user_id)),
                RecipientScope::Course => {
                    for learner in learners {
                        push(Target::on_behalf_of(recipient.user_id, *learner));
                    }
                }
                RecipientScope::UserContext { child } => push(Target::on_behalf_of(recipient.user_id, child)),
            }
        }
        targets
    }

    fn generate_payload(&self, _settings: &ActionSettings) -> SchedulePayload {
        SchedulePayload::Notification
    }
}

static CREDITS: CreditsAction = CreditsAction;
static NOTIFICATION: NotificationAction = NotificationAction;

pub fn kind_for(action: ActionType) -> &'static dyn ActionKind {
    match action {
        ActionType::Credits => &CREDITS,
        ActionType::Notification => &NOTIFICATION,
    }
}

/// Subject and body of a notification action, if that is what `settings` holds.
pub fn notification_content(settings: &ActionSettings) -> Option<(&str, &str)> {
    match &settings.content {
        ActionContent::Notification { subject, body } => Some((subject, body)),
        ActionContent::Credits { .. } => None,
    }
}
