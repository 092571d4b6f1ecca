//! Administrator overrides on credits.
//!
//! Two paths: a per-schedule override that replaces the scheduled amount while
//! the schedule is still queued, and a direct balance edit that bypasses
//! schedules entirely. Instance-level action overrides are merged in
//! [`AutomationInstance::action_settings`].

use std::sync::Arc;

use pulse_core::clock::Clock;
use pulse_core::error::{PulseError, Result};
use pulse_core::traits::Allocator;
use pulse_core::types::{AllocationMethod, CourseId, ScheduleId, UserId};

use crate::action::{ActionSettings, validate_credits};
use crate::events::{AuditEvent, EventLog};
use crate::instance::AutomationInstance;
use crate::record::{ActionType, CreditOverride, ScheduleStatus, UserCreditEdit};
use crate::store::ScheduleStore;

/// A direct balance edit request.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditEdit {
    pub user_id: UserId,
    pub course_id: Option<CourseId>,
    pub new_credits: f64,
    pub overridden_by: UserId,
    pub note: Option<String>,
}

pub struct OverrideReconciler {
    store: Arc<dyn ScheduleStore>,
    allocator: Arc<dyn Allocator>,
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    max_digits: usize,
}

impl OverrideReconciler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        allocator: Arc<dyn Allocator>,
        clock: Arc<dyn Clock>,
        events: Arc<EventLog>,
        max_digits: usize,
    ) -> Self {
        Self { store, allocator, clock, events, max_digits }
    }

    /// Template defaults with the instance's field overrides on top.
    pub fn resolve_action(&self, instance: &AutomationInstance, action: ActionType) -> Result<ActionSettings> {
        instance.action_settings(action).ok_or_else(|| {
            PulseError::NotFound(format!("{} action on instance {}", action.as_str(), instance.id))
        })
    }

    /// Replace the credits of a queued schedule. Overriding again keeps the
    /// first snapshot so deleting the override restores the original amount.
    pub fn create_override(&self, schedule_id: ScheduleId, credits: f64, overridden_by: UserId) -> Result<CreditOverride> {
        validate_credits(credits, self.max_digits)?;
        let schedule = self
            .store
            .get(ActionType::Credits, schedule_id)?
            .ok_or_else(|| PulseError::NotFound(format!("schedule {schedule_id}")))?;
        if schedule.status != ScheduleStatus::Queued {
            return Err(PulseError::OverrideRejected(schedule_id));
        }

        let now = self.clock.now();
        let existing = self.store.get_override(schedule_id)?;
        let scheduled_credit = match &existing {
            Some(ov) => ov.scheduled_credit,
            None => schedule.credits().unwrap_or(0.0),
        };
        let mut ov = CreditOverride {
            id: 0,
            schedule_id,
            user_id: schedule.user_id,
            override_credit: credits,
            scheduled_credit,
            overridden_by,
            status: true,
            time_created: existing.as_ref().map_or(now, |e| e.time_created),
            time_modified: now,
        };
        ov.id = self.store.apply_override(&ov)?;

        self.events.record(
            now,
            AuditEvent::CreditOverridden {
                schedule_id,
                user_id: ov.user_id,
                scheduled_credit,
                override_credit: credits,
                overridden_by,
            },
        );
        Ok(ov)
    }

    /// Drop the override and restore the snapshot. `None` when there was none.
    pub fn delete_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>> {
        let reverted = self.store.revert_override(schedule_id)?;
        if let Some(ov) = &reverted {
            tracing::info!(
                "↩️ Override removed: schedule_id={schedule_id} user_id={} credits restored to {}",
                ov.user_id,
                ov.scheduled_credit
            );
        }
        Ok(reverted)
    }

    /// Set a user's balance directly. Always a Replace, audited separately
    /// from schedule-driven allocations.
    pub fn edit_user_credits(&self, edit: &CreditEdit) -> Result<UserCreditEdit> {
        validate_credits(edit.new_credits, self.max_digits)?;
        let now = self.clock.now();
        let old_credits = self.allocator.balance(edit.user_id)?;
        self.allocator.apply(edit.user_id, edit.new_credits, AllocationMethod::Replace)?;

        let mut row = UserCreditEdit {
            id: 0,
            user_id: edit.user_id,
            course_id: edit.course_id,
            old_credits,
            new_credits: edit.new_credits,
            overridden_by: edit.overridden_by,
            note: edit.note.clone(),
            time_created: now,
        };
        row.id = self.store.insert_user_credit_edit(&row)?;

        self.events.record(
            now,
            AuditEvent::UserCreditsEdited {
                user_id: edit.user_id,
                course_id: edit.course_id,
                old_credits,
                new_credits: edit.new_credits,
                overridden_by: edit.overridden_by,
                note: edit.note.clone(),
            },
        );
        Ok(row)
    }

    /// Overrides attached to schedules that are being removed.
    pub fn remove_user_overrides(&self, schedule_ids: &[ScheduleId]) -> Result<usize> {
        self.store.delete_overrides(schedule_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testkit::{self, LedgerAllocator};
    use pulse_core::clock::FixedClock;

    struct Fixture {
        store: Arc<MemoryStore>,
        allocator: Arc<LedgerAllocator>,
        events: Arc<EventLog>,
        reconciler: OverrideReconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let allocator = Arc::new(LedgerAllocator::default());
        let events = Arc::new(EventLog::new());
        let reconciler =
            OverrideReconciler::new(store.clone(), allocator.clone(), Arc::new(FixedClock::new(900)), events.clone(), 4);
        Fixture { store, allocator, events, reconciler }
    }

    #[test]
    fn test_override_round_trip() {
        let f = fixture();
        let id = f.store.insert(&testkit::queued(10, 5, 100)).unwrap();

        let ov = f.reconciler.create_override(id, 80.0, 2).unwrap();
        assert_eq!(ov.scheduled_credit, 50.0);
        assert_eq!(f.store.get(ActionType::Credits, id).unwrap().unwrap().credits(), Some(80.0));

        // A second override keeps the original snapshot
        let again = f.reconciler.create_override(id, 120.0, 2).unwrap();
        assert_eq!(again.scheduled_credit, 50.0);
        assert_eq!(again.id, ov.id);

        let reverted = f.reconciler.delete_override(id).unwrap().unwrap();
        assert_eq!(reverted.override_credit, 120.0);
        assert_eq!(f.store.get(ActionType::Credits, id).unwrap().unwrap().credits(), Some(50.0));
        assert!(f.reconciler.delete_override(id).unwrap().is_none());
        assert_eq!(f.events.history().len(), 2);
    }

    #[test]
    fn test_override_rejected_once_processed() {
        let f = fixture();
        let mut done = testkit::queued(10, 5, 100);
        done.status = ScheduleStatus::Completed;
        let id = f.store.insert(&done).unwrap();
        assert!(matches!(f.reconciler.create_override(id, 80.0, 2), Err(PulseError::OverrideRejected(i)) if i == id));
        assert!(f.store.get_override(id).unwrap().is_none());
        assert!(matches!(f.reconciler.create_override(404, 80.0, 2), Err(PulseError::NotFound(_))));
    }

    #[test]
    fn test_override_validates_amount() {
        let f = fixture();
        let id = f.store.insert(&testkit::queued(10, 5, 100)).unwrap();
        assert!(matches!(f.reconciler.create_override(id, -1.0, 2), Err(PulseError::Validation(_))));
        assert!(matches!(f.reconciler.create_override(id, 12_345.0, 2), Err(PulseError::Validation(_))));
        assert_eq!(f.store.get(ActionType::Credits, id).unwrap().unwrap().credits(), Some(50.0));
    }

    #[test]
    fn test_edit_user_credits_replaces_and_audits() {
        let f = fixture();
        f.allocator.set_balance(5, 30.0);
        let edit = CreditEdit {
            user_id: 5,
            course_id: Some(3),
            new_credits: 75.0,
            overridden_by: 2,
            note: Some("manual correction".into()),
        };
        let row = f.reconciler.edit_user_credits(&edit).unwrap();
        assert_eq!((row.old_credits, row.new_credits), (30.0, 75.0));
        assert_eq!(f.allocator.balance(5).unwrap(), 75.0);
        assert_eq!(f.store.user_credit_edits(5).unwrap(), vec![row]);
        assert!(matches!(f.events.history()[0].event, AuditEvent::UserCreditsEdited { old_credits, .. } if old_credits == 30.0));
    }

    #[test]
    fn test_resolve_action_applies_instance_override() {
        let f = fixture();
        let mut instance = testkit::credits_instance(10, 3, 50.0);
        instance.overrides.actions.insert(
            ActionType::Credits,
            crate::action::ActionOverrides { credits: Some(70.0), ..Default::default() },
        );
        let settings = f.reconciler.resolve_action(&instance, ActionType::Credits).unwrap();
        assert_eq!(settings.credit_amount(), Some((70.0, AllocationMethod::Add)));
        assert!(f.reconciler.resolve_action(&instance, ActionType::Notification).is_err());
    }

    #[test]
    fn test_remove_user_overrides() {
        let f = fixture();
        let id = f.store.insert(&testkit::queued(10, 5, 100)).unwrap();
        f.reconciler.create_override(id, 80.0, 2).unwrap();
        assert_eq!(f.reconciler.remove_user_overrides(&[id, 999]).unwrap(), 1);
    }
}
