//! Stop conditions that retire a user's schedules.

use std::sync::Arc;

use pulse_core::clock::Clock;
use pulse_core::traits::CompletionInfo;
use pulse_core::types::{CourseId, ModuleId, UserId};

use crate::action::{SuppressOperator, SuppressRule};
use crate::instance::AutomationInstance;
use crate::record::ActionType;
use crate::store::ScheduleStore;

/// Decides whether a user has reached an action's stop condition and freezes
/// their schedules when they have.
pub struct SuppressionEvaluator {
    completion: Arc<dyn CompletionInfo>,
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
}

impl SuppressionEvaluator {
    pub fn new(completion: Arc<dyn CompletionInfo>, store: Arc<dyn ScheduleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { completion, store, clock }
    }

    /// Verdict only, no side effects.
    ///
    /// Course completion is checked first; otherwise the module list is
    /// combined with the rule's operator. Modules with no completion data
    /// count as incomplete.
    pub fn is_reached(&self, rule: &SuppressRule, course_id: CourseId, user_id: UserId) -> bool {
        if rule.course && self.completion.is_course_complete(course_id, user_id) {
            return true;
        }
        if rule.modules.is_empty() {
            return false;
        }
        let mut done = rule.modules.iter().map(|m| self.completion.is_module_complete(*m, user_id));
        match rule.operator {
            SuppressOperator::All => done.all(|c| c),
            SuppressOperator::Any => done.any(|c| c),
        }
    }

    /// Verdict for one action of `instance`; when reached, every active
    /// schedule where `user_id` is the recipient or the related user is
    /// disabled and flagged. Safe to call repeatedly.
    pub fn is_suppress_reached(&self, instance: &AutomationInstance, action: ActionType, user_id: UserId) -> bool {
        let Some(settings) = instance.action_settings(action) else {
            return false;
        };
        if !self.is_reached(&settings.suppress, instance.course_id, user_id) {
            return false;
        }
        match self.store.flag_suppressed(action, instance.id, user_id, self.clock.now()) {
            Ok(0) => {}
            Ok(n) => tracing::info!(
                "🛑 Suppression reached: instance={} user={} action={} schedules={n}",
                instance.id,
                user_id,
                action.as_str()
            ),
            Err(e) => tracing::warn!(
                "Failed to flag suppressed schedules: instance={} user={} action={}: {e}",
                instance.id,
                user_id,
                action.as_str()
            ),
        }
        true
    }

    /// Module completion observer. Returns how many (instance, action) pairs
    /// reached suppression.
    pub fn on_module_completed(&self, instances: &[AutomationInstance], module_id: ModuleId, user_id: UserId) -> usize {
        self.evaluate_where(instances, user_id, |rule| rule.modules.contains(&module_id))
    }

    /// Course completion observer.
    pub fn on_course_completed(&self, instances: &[AutomationInstance], course_id: CourseId, user_id: UserId) -> usize {
        let in_course: Vec<AutomationInstance> =
            instances.iter().filter(|i| i.course_id == course_id).cloned().collect();
        self.evaluate_where(&in_course, user_id, |rule| rule.course)
    }

    fn evaluate_where(
        &self,
        instances: &[AutomationInstance],
        user_id: UserId,
        references: impl Fn(&SuppressRule) -> bool,
    ) -> usize {
        let mut reached = 0;
        for instance in instances {
            for action in instance.action_types() {
                let Some(settings) = instance.action_settings(action) else {
                    continue;
                };
                if references(&settings.suppress) && self.is_suppress_reached(instance, action, user_id) {
                    reached += 1;
                }
            }
        }
        reached
    }
}
