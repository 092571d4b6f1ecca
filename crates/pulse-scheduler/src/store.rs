//! Storage seams for schedules, overrides and instance definitions.
//!
//! [`MemoryStore`] keeps everything in process; `SchedulerDb` in
//! `persistence.rs` is the SQLite-backed equivalent.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use pulse_core::error::{PulseError, Result};
use pulse_core::types::{CourseId, InstanceId, ScheduleId, UserId};

use crate::catalog::{CourseRecord, EnrolmentRecord, UserRecord};
use crate::instance::AutomationInstance;
use crate::record::{
    ActionType, CreditOverride, ScheduleKey, ScheduleRecord, ScheduleStatus, UserCreditEdit,
};

/// Batch fetch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueQuery {
    pub now: i64,
    pub limit: usize,
    /// Restrict the sweep to one recipient.
    pub user_id: Option<UserId>,
}

/// Which schedules of an instance to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Every schedule regardless of status.
    All,
    /// Queued schedules, plus Disabled ones frozen by suppression.
    Rebuildable,
}

impl DeleteScope {
    pub fn matches(self, record: &ScheduleRecord) -> bool {
        match self {
            Self::All => true,
            Self::Rebuildable => {
                record.status == ScheduleStatus::Queued
                    || (record.status == ScheduleStatus::Disabled && record.suppress_reached)
            }
        }
    }
}

/// Schedule persistence, one logical table per [`ActionType`].
pub trait ScheduleStore: Send + Sync {
    fn get(&self, action: ActionType, id: ScheduleId) -> Result<Option<ScheduleRecord>>;

    /// The Queued or Disabled record for `key`, if any.
    fn find_active(&self, action: ActionType, key: &ScheduleKey) -> Result<Option<ScheduleRecord>>;

    /// Most recently completed record for the (instance, user, related user) triple.
    fn latest_completed(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>>;

    /// Newest record of any status for the triple; carries the running counters.
    fn latest_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>>;

    /// Insert a new record and return its id.
    fn insert(&self, record: &ScheduleRecord) -> Result<ScheduleId>;

    /// Overwrite the record with the same id.
    fn update(&self, record: &ScheduleRecord) -> Result<()>;

    /// Queued -> Disabled for one (user, related user) pair. Returns rows changed.
    fn disable_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
        now: i64,
    ) -> Result<usize>;

    /// Queued -> Disabled for every record of the instance.
    fn disable_queued(&self, action: ActionType, instance_id: InstanceId, now: i64) -> Result<usize>;

    /// Disable and freeze active records where the user is recipient or related user.
    /// Records already frozen are left untouched and not counted.
    fn flag_suppressed(&self, action: ActionType, instance_id: InstanceId, user_id: UserId, now: i64) -> Result<usize>;

    /// Delete schedules of an instance and return the deleted ids.
    fn delete_for_instance(&self, action: ActionType, instance_id: InstanceId, scope: DeleteScope) -> Result<Vec<ScheduleId>>;

    /// Delete active schedules where the user is recipient or related user.
    fn delete_for_user(&self, action: ActionType, instance_id: InstanceId, user_id: UserId) -> Result<Vec<ScheduleId>>;

    fn list_for_instance(&self, action: ActionType, instance_id: InstanceId) -> Result<Vec<ScheduleRecord>>;

    /// Due, eligible Queued records ordered by creation time, at most `query.limit`.
    fn fetch_due(&self, action: ActionType, query: &DueQuery) -> Result<Vec<ScheduleRecord>>;

    fn get_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>>;

    /// Store the override and set the schedule's credits to it, atomically.
    fn apply_override(&self, ov: &CreditOverride) -> Result<i64>;

    /// Restore the snapshot credits and delete the override, atomically.
    fn revert_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>>;

    fn delete_overrides(&self, schedule_ids: &[ScheduleId]) -> Result<usize>;

    fn insert_user_credit_edit(&self, edit: &UserCreditEdit) -> Result<i64>;

    fn user_credit_edits(&self, user_id: UserId) -> Result<Vec<UserCreditEdit>>;
}

/// Automation instance definitions.
pub trait InstanceRepository: Send + Sync {
    fn get_instance(&self, id: InstanceId) -> Result<Option<AutomationInstance>>;

    fn save_instance(&self, instance: &AutomationInstance) -> Result<()>;

    fn delete_instance(&self, id: InstanceId) -> Result<()>;

    fn instances_for_course(&self, course_id: CourseId) -> Result<Vec<AutomationInstance>>;

    fn list_instances(&self) -> Result<Vec<AutomationInstance>>;
}

/// Applies the join filters of the batch fetch to one record.
pub(crate) fn passes_due_filters(
    record: &ScheduleRecord,
    instance: Option<&AutomationInstance>,
    course: Option<&CourseRecord>,
    user: Option<&UserRecord>,
    enrolment: Option<&EnrolmentRecord>,
    now: i64,
) -> bool {
    let Some(instance) = instance else { return false };
    let Some(course) = course else { return false };
    let Some(user) = user else { return false };
    let Some(enrolment) = enrolment else { return false };
    record.is_due(now)
        && instance.enabled
        && course.is_running(now)
        && user.is_active()
        && enrolment.is_active(now)
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    schedules: HashMap<ActionType, BTreeMap<ScheduleId, ScheduleRecord>>,
    overrides: BTreeMap<ScheduleId, CreditOverride>,
    credit_edits: Vec<UserCreditEdit>,
    instances: BTreeMap<InstanceId, AutomationInstance>,
    courses: HashMap<CourseId, CourseRecord>,
    users: HashMap<UserId, UserRecord>,
    enrolments: HashMap<(CourseId, UserId), EnrolmentRecord>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn table(&self, action: ActionType) -> impl Iterator<Item = &ScheduleRecord> {
        self.schedules.get(&action).into_iter().flat_map(|t| t.values())
    }

    fn table_mut(&mut self, action: ActionType) -> &mut BTreeMap<ScheduleId, ScheduleRecord> {
        self.schedules.entry(action).or_default()
    }
}

/// In-process store holding schedules, instances and the catalog rows the
/// batch fetch joins against.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|e| PulseError::Storage(e.to_string()))
    }

    pub fn upsert_course(&self, course: CourseRecord) -> Result<()> {
        self.lock()?.courses.insert(course.id, course);
        Ok(())
    }

    pub fn upsert_user(&self, user: UserRecord) -> Result<()> {
        self.lock()?.users.insert(user.id, user);
        Ok(())
    }

    pub fn upsert_enrolment(&self, enrolment: EnrolmentRecord) -> Result<()> {
        self.lock()?
            .enrolments
            .insert((enrolment.course_id, enrolment.user_id), enrolment);
        Ok(())
    }

    pub fn remove_enrolment(&self, course_id: CourseId, user_id: UserId) -> Result<()> {
        self.lock()?.enrolments.remove(&(course_id, user_id));
        Ok(())
    }

    /// Number of stored schedules of one kind.
    pub fn count(&self, action: ActionType) -> Result<usize> {
        Ok(self.lock()?.table(action).count())
    }
}

impl ScheduleStore for MemoryStore {
    fn get(&self, action: ActionType, id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        Ok(self.lock()?.schedules.get(&action).and_then(|t| t.get(&id)).cloned())
    }

    fn find_active(&self, action: ActionType, key: &ScheduleKey) -> Result<Option<ScheduleRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .table(action)
            .find(|r| r.key() == *key && r.status.is_active())
            .cloned())
    }

    fn latest_completed(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .table(action)
            .filter(|r| {
                r.instance_id == instance_id
                    && r.user_id == user_id
                    && r.related_user_id == related_user_id
                    && r.status == ScheduleStatus::Completed
            })
            .max_by_key(|r| (r.completed_time.unwrap_or(0), r.id))
            .cloned())
    }

    fn latest_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .table(action)
            .filter(|r| r.instance_id == instance_id && r.user_id == user_id && r.related_user_id == related_user_id)
            .max_by_key(|r| r.id)
            .cloned())
    }

    fn insert(&self, record: &ScheduleRecord) -> Result<ScheduleId> {
        let mut inner = self.lock()?;
        let id = inner.next_id();
        let mut stored = record.clone();
        stored.id = id;
        inner.table_mut(record.action_type()).insert(id, stored);
        Ok(id)
    }

    fn update(&self, record: &ScheduleRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let table = inner.table_mut(record.action_type());
        match table.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(PulseError::NotFound(format!("schedule {}", record.id))),
        }
    }

    fn disable_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
        now: i64,
    ) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut changed = 0;
        for r in inner.table_mut(action).values_mut() {
            if r.instance_id == instance_id
                && r.user_id == user_id
                && r.related_user_id == related_user_id
                && r.status == ScheduleStatus::Queued
            {
                r.status = ScheduleStatus::Disabled;
                r.time_modified = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn disable_queued(&self, action: ActionType, instance_id: InstanceId, now: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut changed = 0;
        for r in inner.table_mut(action).values_mut() {
            if r.instance_id == instance_id && r.status == ScheduleStatus::Queued {
                r.status = ScheduleStatus::Disabled;
                r.time_modified = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn flag_suppressed(&self, action: ActionType, instance_id: InstanceId, user_id: UserId, now: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut changed = 0;
        for r in inner.table_mut(action).values_mut() {
            let involved = r.user_id == user_id || r.related_user_id == Some(user_id);
            let frozen = r.status == ScheduleStatus::Disabled && r.suppress_reached;
            if r.instance_id == instance_id && involved && r.status.is_active() && !frozen {
                r.status = ScheduleStatus::Disabled;
                r.suppress_reached = true;
                r.time_modified = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn delete_for_instance(&self, action: ActionType, instance_id: InstanceId, scope: DeleteScope) -> Result<Vec<ScheduleId>> {
        let mut inner = self.lock()?;
        let table = inner.table_mut(action);
        let ids: Vec<ScheduleId> = table
            .values()
            .filter(|r| r.instance_id == instance_id && scope.matches(r))
            .map(|r| r.id)
            .collect();
        for id in &ids {
            table.remove(id);
        }
        Ok(ids)
    }

    fn delete_for_user(&self, action: ActionType, instance_id: InstanceId, user_id: UserId) -> Result<Vec<ScheduleId>> {
        let mut inner = self.lock()?;
        let table = inner.table_mut(action);
        let ids: Vec<ScheduleId> = table
            .values()
            .filter(|r| {
                r.instance_id == instance_id
                    && (r.user_id == user_id || r.related_user_id == Some(user_id))
                    && r.status.is_active()
            })
            .map(|r| r.id)
            .collect();
        for id in &ids {
            table.remove(id);
        }
        Ok(ids)
    }

    fn list_for_instance(&self, action: ActionType, instance_id: InstanceId) -> Result<Vec<ScheduleRecord>> {
        let inner = self.lock()?;
        Ok(inner.table(action).filter(|r| r.instance_id == instance_id).cloned().collect())
    }

    fn fetch_due(&self, action: ActionType, query: &DueQuery) -> Result<Vec<ScheduleRecord>> {
        let inner = self.lock()?;
        let mut due: Vec<ScheduleRecord> = inner
            .table(action)
            .filter(|r| query.user_id.is_none_or(|u| r.user_id == u))
            .filter(|r| {
                let instance = inner.instances.get(&r.instance_id);
                let course = instance.and_then(|i| inner.courses.get(&i.course_id));
                let enrolment = instance
                    .and_then(|i| inner.enrolments.get(&(i.course_id, r.subject_user())));
                passes_due_filters(r, instance, course, inner.users.get(&r.user_id), enrolment, query.now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.time_created, r.id));
        due.truncate(query.limit);
        Ok(due)
    }

    fn get_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>> {
        Ok(self.lock()?.overrides.get(&schedule_id).cloned())
    }

    fn apply_override(&self, ov: &CreditOverride) -> Result<i64> {
        let mut inner = self.lock()?;
        let schedule = inner
            .table_mut(ActionType::Credits)
            .get_mut(&ov.schedule_id)
            .ok_or_else(|| PulseError::NotFound(format!("schedule {}", ov.schedule_id)))?;
        schedule.set_credits(ov.override_credit);
        schedule.time_modified = ov.time_modified;

        let id = match inner.overrides.get(&ov.schedule_id) {
            Some(existing) => existing.id,
            None => inner.next_id(),
        };
        let mut stored = ov.clone();
        stored.id = id;
        inner.overrides.insert(ov.schedule_id, stored);
        Ok(id)
    }

    fn revert_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>> {
        let mut inner = self.lock()?;
        let Some(ov) = inner.overrides.remove(&schedule_id) else {
            return Ok(None);
        };
        if let Some(schedule) = inner.table_mut(ActionType::Credits).get_mut(&schedule_id) {
            schedule.set_credits(ov.scheduled_credit);
        }
        Ok(Some(ov))
    }

    fn delete_overrides(&self, schedule_ids: &[ScheduleId]) -> Result<usize> {
        let mut inner = self.lock()?;
        Ok(schedule_ids
            .iter()
            .filter(|id| inner.overrides.remove(*id).is_some())
            .count())
    }

    fn insert_user_credit_edit(&self, edit: &UserCreditEdit) -> Result<i64> {
        let mut inner = self.lock()?;
        let id = inner.next_id();
        let mut stored = edit.clone();
        stored.id = id;
        inner.credit_edits.push(stored);
        Ok(id)
    }

    fn user_credit_edits(&self, user_id: UserId) -> Result<Vec<UserCreditEdit>> {
        Ok(self
            .lock()?
            .credit_edits
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl InstanceRepository for MemoryStore {
    fn get_instance(&self, id: InstanceId) -> Result<Option<AutomationInstance>> {
        Ok(self.lock()?.instances.get(&id).cloned())
    }

    fn save_instance(&self, instance: &AutomationInstance) -> Result<()> {
        self.lock()?.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn delete_instance(&self, id: InstanceId) -> Result<()> {
        self.lock()?.instances.remove(&id);
        Ok(())
    }

    fn instances_for_course(&self, course_id: CourseId) -> Result<Vec<AutomationInstance>> {
        Ok(self
            .lock()?
            .instances
            .values()
            .filter(|i| i.course_id == course_id)
            .cloned()
            .collect())
    }

    fn list_instances(&self) -> Result<Vec<AutomationInstance>> {
        Ok(self.lock()?.instances.values().cloned().collect())
    }
}
