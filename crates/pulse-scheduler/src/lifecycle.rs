//! Hooks that keep schedules in step with configuration and enrolment events.

use pulse_core::error::Result;
use pulse_core::types::{CourseId, InstanceId, ModuleId, UserId};

use crate::engine::{EngineContext, InstanceReport, ScheduleEngine};
use crate::instance::{AutomationInstance, AutomationTemplate};
use crate::record::ActionType;
use crate::store::DeleteScope;

pub struct Lifecycle {
    ctx: EngineContext,
    max_digits: usize,
}

impl Lifecycle {
    pub fn new(ctx: EngineContext, max_digits: usize) -> Self {
        Self { ctx, max_digits }
    }

    /// Validate, persist, then refresh the instance's schedules in place.
    /// An invalid instance is rejected before anything is written.
    pub fn on_instance_saved(&self, instance: &AutomationInstance) -> Result<InstanceReport> {
        instance.validate(self.max_digits)?;
        self.ctx.instances.save_instance(instance)?;
        tracing::info!("💾 Instance {} saved (course {})", instance.id, instance.course_id);

        let mut report = InstanceReport::default();
        let configured = instance.action_types();
        for action in ActionType::ALL.into_iter().filter(|a| !configured.contains(a)) {
            report.removed += self.purge(instance.id, action)?;
        }
        for engine in ScheduleEngine::for_instance(&self.ctx, instance) {
            report += engine.create_schedule_for_instance(false, None, false)?;
        }
        Ok(report)
    }

    /// Push a template change to every instance built on it and rebuild
    /// their schedules from scratch.
    pub fn on_template_saved(&self, template: &AutomationTemplate) -> Result<InstanceReport> {
        let mut report = InstanceReport::default();
        for mut instance in self.ctx.instances.list_instances()? {
            if instance.template.id != template.id {
                continue;
            }
            instance.template = template.clone();
            instance.validate(self.max_digits)?;
            self.ctx.instances.save_instance(&instance)?;
            for engine in ScheduleEngine::for_instance(&self.ctx, &instance) {
                report += engine.recreate_schedule_for_instance()?;
            }
        }
        tracing::info!("🧩 Template {} saved: {report}", template.id);
        Ok(report)
    }

    /// Drop the instance with every schedule and override it owns.
    pub fn on_instance_deleted(&self, instance_id: InstanceId) -> Result<usize> {
        let mut removed = 0;
        for action in ActionType::ALL {
            removed += self.purge(instance_id, action)?;
        }
        self.ctx.instances.delete_instance(instance_id)?;
        tracing::info!("🗑️ Instance {instance_id} deleted with {removed} schedules");
        Ok(removed)
    }

    fn purge(&self, instance_id: InstanceId, action: ActionType) -> Result<usize> {
        let removed = self.ctx.store.delete_for_instance(action, instance_id, DeleteScope::All)?;
        self.ctx.store.delete_overrides(&removed)?;
        Ok(removed.len())
    }

    pub fn on_user_enrolled(&self, course_id: CourseId, user_id: UserId) -> Result<InstanceReport> {
        let mut report = InstanceReport::default();
        for instance in self.ctx.instances.instances_for_course(course_id)? {
            for engine in ScheduleEngine::for_instance(&self.ctx, &instance) {
                report += engine.create_schedule_for_instance(true, Some(user_id), false)?;
            }
        }
        Ok(report)
    }

    /// A condition plugin fired for `user_id`: start a new cycle for them.
    pub fn on_condition_triggered(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
        is_new_user: bool,
    ) -> Result<InstanceReport> {
        let Some(instance) = self.ctx.instances.get_instance(instance_id)? else {
            tracing::debug!("Condition fired for unknown instance {instance_id}");
            return Ok(InstanceReport::default());
        };
        let mut report = InstanceReport::default();
        for engine in ScheduleEngine::for_instance(&self.ctx, &instance) {
            report += engine.create_schedule_for_instance(is_new_user, Some(user_id), true)?;
        }
        Ok(report)
    }

    pub fn on_user_unenrolled(&self, course_id: CourseId, user_id: UserId) -> Result<usize> {
        let mut removed = 0;
        for instance in self.ctx.instances.instances_for_course(course_id)? {
            for engine in ScheduleEngine::for_instance(&self.ctx, &instance) {
                removed += engine.remove_user_schedules(user_id)?.len();
            }
        }
        Ok(removed)
    }

    pub fn on_module_completed(&self, course_id: CourseId, module_id: ModuleId, user_id: UserId) -> Result<usize> {
        let instances = self.ctx.instances.instances_for_course(course_id)?;
        Ok(self.ctx.suppression().on_module_completed(&instances, module_id, user_id))
    }

    pub fn on_course_completed(&self, course_id: CourseId, user_id: UserId) -> Result<usize> {
        let instances = self.ctx.instances.instances_for_course(course_id)?;
        Ok(self.ctx.suppression().on_course_completed(&instances, course_id, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionOverrides;
    use crate::overrides::OverrideReconciler;
    use crate::record::{ScheduleRecord, ScheduleStatus};
    use crate::store::{InstanceRepository, ScheduleStore};
    use crate::testkit::{self, COURSE, Harness};
    use pulse_core::error::PulseError;

    const T0: i64 = 1_704_067_200;

    fn rows(h: &Harness, action: ActionType) -> Vec<ScheduleRecord> {
        h.store.list_for_instance(action, 10).unwrap()
    }

    fn reconciler(h: &Harness) -> OverrideReconciler {
        OverrideReconciler::new(h.store.clone(), h.allocator.clone(), h.clock.clone(), h.events.clone(), 8)
    }

    #[test]
    fn test_invalid_instance_is_not_persisted() {
        let h = Harness::new(T0);
        h.enrol(20, T0);
        let instance = testkit::credits_instance(10, COURSE, -5.0);
        assert!(matches!(h.lifecycle().on_instance_saved(&instance), Err(PulseError::Validation(_))));
        assert!(h.store.get_instance(10).unwrap().is_none());
        assert!(rows(&h, ActionType::Credits).is_empty());
    }

    #[test]
    fn test_instance_resave_keeps_override() {
        let h = Harness::new(T0);
        h.enrol(20, T0);
        let lifecycle = h.lifecycle();
        let mut instance = testkit::credits_instance(10, COURSE, 100.0);
        assert_eq!(lifecycle.on_instance_saved(&instance).unwrap().inserted, 1);
        let id = rows(&h, ActionType::Credits)[0].id;

        reconciler(&h).create_override(id, 40.0, 2).unwrap();
        instance.overrides.actions.insert(
            ActionType::Credits,
            ActionOverrides { credits: Some(150.0), ..Default::default() },
        );
        let report = lifecycle.on_instance_saved(&instance).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(h.store.get(ActionType::Credits, id).unwrap().unwrap().credits(), Some(40.0));

        reconciler(&h).delete_override(id).unwrap();
        assert_eq!(h.store.get(ActionType::Credits, id).unwrap().unwrap().credits(), Some(100.0));
    }

    #[test]
    fn test_template_save_rebuilds_every_instance() {
        let h = Harness::new(T0);
        h.enrol(20, T0);
        let lifecycle = h.lifecycle();
        let first = testkit::credits_instance(10, COURSE, 100.0);
        lifecycle.on_instance_saved(&first).unwrap();
        lifecycle.on_instance_saved(&testkit::credits_instance(11, COURSE, 100.0)).unwrap();
        let old_id = rows(&h, ActionType::Credits)[0].id;

        let mut template = first.template.clone();
        if let Some(settings) = template.actions.get_mut(&ActionType::Credits) {
            settings.content = crate::action::ActionContent::Credits {
                credits: 25.0,
                allocation_method: pulse_core::types::AllocationMethod::Replace,
            };
        }
        let report = lifecycle.on_template_saved(&template).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.inserted, 2);

        let rebuilt = rows(&h, ActionType::Credits);
        assert_eq!(rebuilt.len(), 1);
        assert_ne!(rebuilt[0].id, old_id);
        assert_eq!(rebuilt[0].credits(), Some(25.0));
        assert_eq!(h.store.get_instance(11).unwrap().unwrap().template, template);
    }

    #[test]
    fn test_dropping_an_action_removes_its_schedules() {
        let h = Harness::new(T0);
        h.enrol(20, T0);
        let lifecycle = h.lifecycle();
        let mut instance = testkit::credits_instance(10, COURSE, 100.0);
        lifecycle.on_instance_saved(&instance).unwrap();

        instance.template.actions.clear();
        let report = lifecycle.on_instance_saved(&instance).unwrap();
        assert_eq!(report.removed, 1);
        assert!(rows(&h, ActionType::Credits).is_empty());
    }

    #[test]
    fn test_instance_deleted() {
        let h = Harness::new(T0);
        h.enrol(20, T0);
        let lifecycle = h.lifecycle();
        lifecycle.on_instance_saved(&testkit::credits_instance(10, COURSE, 100.0)).unwrap();
        let id = rows(&h, ActionType::Credits)[0].id;
        reconciler(&h).create_override(id, 40.0, 2).unwrap();

        assert_eq!(lifecycle.on_instance_deleted(10).unwrap(), 1);
        assert!(h.store.get_instance(10).unwrap().is_none());
        assert!(h.store.get_override(id).unwrap().is_none());
    }

    #[test]
    fn test_enrol_and_unenrol() {
        let h = Harness::new(T0);
        let lifecycle = h.lifecycle();
        lifecycle.on_instance_saved(&testkit::credits_instance(10, COURSE, 100.0)).unwrap();
        assert!(rows(&h, ActionType::Credits).is_empty());

        h.enrol(20, T0 + 60);
        h.enrol(21, T0 + 60);
        let report = lifecycle.on_user_enrolled(COURSE, 20).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(rows(&h, ActionType::Credits)[0].user_id, 20);
        assert_eq!(rows(&h, ActionType::Credits)[0].schedule_time, T0 + 60);
        assert_eq!(lifecycle.on_user_enrolled(COURSE + 1, 21).unwrap(), InstanceReport::default());

        let id = rows(&h, ActionType::Credits)[0].id;
        reconciler(&h).create_override(id, 40.0, 2).unwrap();
        assert_eq!(lifecycle.on_user_unenrolled(COURSE, 20).unwrap(), 1);
        assert!(rows(&h, ActionType::Credits).is_empty());
        assert!(h.store.get_override(id).unwrap().is_none());
    }

    #[test]
    fn test_condition_trigger_starts_new_cycle() {
        let h = Harness::new(T0);
        h.enrol(20, T0);
        let lifecycle = h.lifecycle();
        lifecycle.on_instance_saved(&testkit::credits_instance(10, COURSE, 100.0)).unwrap();
        let first = rows(&h, ActionType::Credits)[0].id;
        h.engine(10, ActionType::Credits).mark_completed(first).unwrap();

        let report = lifecycle.on_condition_triggered(10, 20, false).unwrap();
        assert_eq!(report.inserted, 1);
        let queued: Vec<_> =
            rows(&h, ActionType::Credits).into_iter().filter(|r| r.status == ScheduleStatus::Queued).collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].frequency_count, 1);
        assert_eq!(lifecycle.on_condition_triggered(99, 20, false).unwrap(), InstanceReport::default());
    }

    #[test]
    fn test_completion_events_suppress() {
        let h = Harness::new(T0);
        h.enrol(20, T0);
        let lifecycle = h.lifecycle();
        let mut instance = testkit::credits_instance(10, COURSE, 100.0);
        if let Some(settings) = instance.template.actions.get_mut(&ActionType::Credits) {
            settings.suppress.course = true;
        }
        lifecycle.on_instance_saved(&instance).unwrap();

        assert_eq!(lifecycle.on_course_completed(COURSE, 20).unwrap(), 0);
        h.completion.complete_course(COURSE, 20);
        assert_eq!(lifecycle.on_module_completed(COURSE, 11, 20).unwrap(), 0);
        assert_eq!(lifecycle.on_course_completed(COURSE, 20).unwrap(), 1);
        assert!(rows(&h, ActionType::Credits)[0].suppress_reached);
    }
}
