//! In-memory fakes and fixtures shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pulse_core::clock::FixedClock;
use pulse_core::error::{PulseError, Result};
use pulse_core::traits::{Allocator, CompletionInfo, ConditionEvaluator, CourseDirectory, Mailer, RoleResolver};
use pulse_core::types::{
    AllocationMethod, ConditionContext, ConditionSetting, CourseId, GroupId, InstanceId, ModuleId, NotificationMessage,
    Recipient, RecipientSpec, RoleId, ScheduleId, UserId,
};

use crate::action::ActionSettings;
use crate::catalog::{CourseRecord, EnrolmentRecord, UserRecord};
use crate::dispatch::Dispatcher;
use crate::engine::{EngineContext, ScheduleEngine};
use crate::events::EventLog;
use crate::instance::{AutomationInstance, AutomationTemplate};
use crate::lifecycle::Lifecycle;
use crate::persistence::SchedulerDb;
use crate::record::{ActionType, CreditOverride, ScheduleKey, SchedulePayload, ScheduleRecord, ScheduleStatus, UserCreditEdit};
use crate::recurrence::{BaseDateMode, IntervalType, RecurrenceCalculator};
use crate::store::{DeleteScope, DueQuery, InstanceRepository, MemoryStore, ScheduleStore};

pub const COURSE: CourseId = 3;
pub const STUDENT_ROLE: RoleId = 5;
pub const PARENT_ROLE: RoleId = 9;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// Eligible when any condition is enabled and the user is not blocked.
#[derive(Default)]
pub struct FakeConditions {
    blocked: Mutex<HashSet<UserId>>,
    anchors: Mutex<HashMap<(String, UserId), i64>>,
}

impl FakeConditions {
    pub fn block(&self, user_id: UserId) {
        lock(&self.blocked).insert(user_id);
    }

    pub fn allow(&self, user_id: UserId) {
        lock(&self.blocked).remove(&user_id);
    }

    pub fn set_anchor(&self, condition: &str, user_id: UserId, at: i64) {
        lock(&self.anchors).insert((condition.to_string(), user_id), at);
    }
}

impl ConditionEvaluator for FakeConditions {
    fn is_user_eligible(&self, ctx: &ConditionContext, user_id: UserId, _is_new_user: bool) -> bool {
        ctx.enabled_names().next().is_some() && !lock(&self.blocked).contains(&user_id)
    }

    fn supports_delay(&self, _condition: &str) -> bool {
        true
    }

    fn delay_anchor(&self, condition: &str, _ctx: &ConditionContext, user_id: UserId) -> Option<i64> {
        lock(&self.anchors).get(&(condition.to_string(), user_id)).copied()
    }
}

/// STUDENT_ROLE resolves to learners, PARENT_ROLE to parents, any other role
/// to staff holding it at course level.
#[derive(Default)]
pub struct FakeRoles {
    learners: Mutex<Vec<UserId>>,
    parents: Mutex<Vec<(UserId, UserId)>>,
    staff: Mutex<Vec<UserId>>,
    groups: Mutex<HashMap<UserId, Vec<GroupId>>>,
}

impl FakeRoles {
    pub fn add_learner(&self, user_id: UserId) {
        let mut learners = lock(&self.learners);
        if !learners.contains(&user_id) {
            learners.push(user_id);
        }
    }

    pub fn remove_learner(&self, user_id: UserId) {
        lock(&self.learners).retain(|u| *u != user_id);
    }

    pub fn add_parent(&self, parent: UserId, child: UserId) {
        lock(&self.parents).push((parent, child));
    }

    pub fn add_staff(&self, user_id: UserId) {
        lock(&self.staff).push(user_id);
    }

    pub fn set_groups(&self, user_id: UserId, groups: &[GroupId]) {
        lock(&self.groups).insert(user_id, groups.to_vec());
    }
}

impl RoleResolver for FakeRoles {
    fn resolve_recipients(&self, specs: &[RecipientSpec], _course_id: CourseId, child: Option<UserId>) -> Vec<Recipient> {
        let mut out = Vec::new();
        for spec in specs {
            match spec {
                RecipientSpec::Role(STUDENT_ROLE) => out.extend(
                    lock(&self.learners)
                        .iter()
                        .filter(|u| child.is_none_or(|c| c == **u))
                        .map(|u| Recipient::learner(*u)),
                ),
                RecipientSpec::Role(PARENT_ROLE) => out.extend(
                    lock(&self.parents)
                        .iter()
                        .filter(|(_, c)| child.is_none_or(|t| t == *c))
                        .map(|(p, c)| Recipient::parent_of(*p, *c)),
                ),
                RecipientSpec::Role(_) => out.extend(lock(&self.staff).iter().map(|u| Recipient::course(*u))),
                RecipientSpec::Email(_) => {}
            }
        }
        out
    }

    fn learners(&self, _course_id: CourseId) -> Vec<UserId> {
        lock(&self.learners).clone()
    }

    fn user_groups(&self, _course_id: CourseId, user_id: UserId) -> Vec<GroupId> {
        lock(&self.groups).get(&user_id).cloned().unwrap_or_default()
    }
}

#[derive(Default)]
pub struct FakeCompletion {
    courses: Mutex<HashSet<(CourseId, UserId)>>,
    modules: Mutex<HashSet<(ModuleId, UserId)>>,
}

impl FakeCompletion {
    pub fn complete_course(&self, course_id: CourseId, user_id: UserId) {
        lock(&self.courses).insert((course_id, user_id));
    }

    pub fn complete_module(&self, module_id: ModuleId, user_id: UserId) {
        lock(&self.modules).insert((module_id, user_id));
    }

    pub fn reset(&self) {
        lock(&self.courses).clear();
        lock(&self.modules).clear();
    }
}

impl CompletionInfo for FakeCompletion {
    fn is_course_complete(&self, course_id: CourseId, user_id: UserId) -> bool {
        lock(&self.courses).contains(&(course_id, user_id))
    }

    fn is_module_complete(&self, module_id: ModuleId, user_id: UserId) -> bool {
        lock(&self.modules).contains(&(module_id, user_id))
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    enrolments: Mutex<HashMap<(CourseId, UserId), i64>>,
}

impl FakeDirectory {
    pub fn enrol(&self, course_id: CourseId, user_id: UserId, at: i64) {
        lock(&self.enrolments).insert((course_id, user_id), at);
    }
}

impl CourseDirectory for FakeDirectory {
    fn enrolment_time(&self, course_id: CourseId, user_id: UserId) -> Option<i64> {
        lock(&self.enrolments).get(&(course_id, user_id)).copied()
    }

    fn user_email(&self, user_id: UserId) -> Option<String> {
        Some(format!("user{user_id}@example.com"))
    }

    fn course_name(&self, course_id: CourseId) -> Option<String> {
        Some(format!("Course {course_id}"))
    }
}

/// Balance ledger that can be told to reject a user.
#[derive(Default)]
pub struct LedgerAllocator {
    balances: Mutex<HashMap<UserId, f64>>,
    failing: Mutex<HashSet<UserId>>,
}

impl LedgerAllocator {
    pub fn fail_for(&self, user_id: UserId) {
        lock(&self.failing).insert(user_id);
    }

    pub fn set_balance(&self, user_id: UserId, amount: f64) {
        lock(&self.balances).insert(user_id, amount);
    }
}

impl Allocator for LedgerAllocator {
    fn apply(&self, user_id: UserId, amount: f64, method: AllocationMethod) -> Result<()> {
        if lock(&self.failing).contains(&user_id) {
            return Err(PulseError::Allocation(format!("ledger rejected user {user_id}")));
        }
        let mut balances = lock(&self.balances);
        let current = balances.get(&user_id).copied().unwrap_or(0.0);
        balances.insert(user_id, method.apply(current, amount));
        Ok(())
    }

    fn balance(&self, user_id: UserId) -> Result<f64> {
        Ok(lock(&self.balances).get(&user_id).copied().unwrap_or(0.0))
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<NotificationMessage>>,
    failing: Mutex<HashSet<UserId>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<NotificationMessage> {
        lock(&self.sent).clone()
    }

    pub fn fail_for(&self, user_id: UserId) {
        lock(&self.failing).insert(user_id);
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        if lock(&self.failing).contains(&message.recipient_user_id) {
            return Err(PulseError::Delivery(format!("mailbox of user {} is full", message.recipient_user_id)));
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}

/// [`MemoryStore`] whose inserts can be switched off.
pub struct FailingInsertStore {
    inner: Arc<MemoryStore>,
    fail_inserts: AtomicBool,
}

impl FailingInsertStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner, fail_inserts: AtomicBool::new(false) }
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

impl ScheduleStore for FailingInsertStore {
    fn get(&self, action: ActionType, id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        self.inner.get(action, id)
    }

    fn find_active(&self, action: ActionType, key: &ScheduleKey) -> Result<Option<ScheduleRecord>> {
        self.inner.find_active(action, key)
    }

    fn latest_completed(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>> {
        self.inner.latest_completed(action, instance_id, user_id, related_user_id)
    }

    fn latest_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>> {
        self.inner.latest_for_user(action, instance_id, user_id, related_user_id)
    }

    fn insert(&self, record: &ScheduleRecord) -> Result<ScheduleId> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(PulseError::Storage("Save schedule: disk full".into()));
        }
        self.inner.insert(record)
    }

    fn update(&self, record: &ScheduleRecord) -> Result<()> {
        self.inner.update(record)
    }

    fn disable_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
        now: i64,
    ) -> Result<usize> {
        self.inner.disable_for_user(action, instance_id, user_id, related_user_id, now)
    }

    fn disable_queued(&self, action: ActionType, instance_id: InstanceId, now: i64) -> Result<usize> {
        self.inner.disable_queued(action, instance_id, now)
    }

    fn flag_suppressed(&self, action: ActionType, instance_id: InstanceId, user_id: UserId, now: i64) -> Result<usize> {
        self.inner.flag_suppressed(action, instance_id, user_id, now)
    }

    fn delete_for_instance(&self, action: ActionType, instance_id: InstanceId, scope: DeleteScope) -> Result<Vec<ScheduleId>> {
        self.inner.delete_for_instance(action, instance_id, scope)
    }

    fn delete_for_user(&self, action: ActionType, instance_id: InstanceId, user_id: UserId) -> Result<Vec<ScheduleId>> {
        self.inner.delete_for_user(action, instance_id, user_id)
    }

    fn list_for_instance(&self, action: ActionType, instance_id: InstanceId) -> Result<Vec<ScheduleRecord>> {
        self.inner.list_for_instance(action, instance_id)
    }

    fn fetch_due(&self, action: ActionType, query: &DueQuery) -> Result<Vec<ScheduleRecord>> {
        self.inner.fetch_due(action, query)
    }

    fn get_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>> {
        self.inner.get_override(schedule_id)
    }

    fn apply_override(&self, ov: &CreditOverride) -> Result<i64> {
        self.inner.apply_override(ov)
    }

    fn revert_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>> {
        self.inner.revert_override(schedule_id)
    }

    fn delete_overrides(&self, schedule_ids: &[ScheduleId]) -> Result<usize> {
        self.inner.delete_overrides(schedule_ids)
    }

    fn insert_user_credit_edit(&self, edit: &UserCreditEdit) -> Result<i64> {
        self.inner.insert_user_credit_edit(edit)
    }

    fn user_credit_edits(&self, user_id: UserId) -> Result<Vec<UserCreditEdit>> {
        self.inner.user_credit_edits(user_id)
    }
}

/// Every collaborator faked, on top of a [`MemoryStore`].
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub conditions: Arc<FakeConditions>,
    pub roles: Arc<FakeRoles>,
    pub completion: Arc<FakeCompletion>,
    pub directory: Arc<FakeDirectory>,
    pub allocator: Arc<LedgerAllocator>,
    pub mailer: Arc<RecordingMailer>,
    pub events: Arc<EventLog>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(now: i64) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.upsert_course(CourseRecord::open(COURSE, "Course")).unwrap();
        Self {
            store,
            conditions: Arc::default(),
            roles: Arc::default(),
            completion: Arc::default(),
            directory: Arc::default(),
            allocator: Arc::default(),
            mailer: Arc::default(),
            events: Arc::new(EventLog::new()),
            clock: Arc::new(FixedClock::new(now)),
        }
    }

    pub fn ctx(&self) -> EngineContext {
        EngineContext {
            store: self.store.clone(),
            instances: self.store.clone(),
            conditions: self.conditions.clone(),
            roles: self.roles.clone(),
            completion: self.completion.clone(),
            directory: self.directory.clone(),
            clock: self.clock.clone(),
            calculator: RecurrenceCalculator::utc(),
        }
    }

    /// Enrol `user_id` as a learner of [`COURSE`].
    pub fn enrol(&self, user_id: UserId, at: i64) {
        self.roles.add_learner(user_id);
        self.directory.enrol(COURSE, user_id, at);
        self.store.upsert_user(UserRecord::active(user_id, &format!("user{user_id}@example.com"))).unwrap();
        self.store.upsert_enrolment(EnrolmentRecord::active(COURSE, user_id, at)).unwrap();
    }

    pub fn add_parent(&self, parent: UserId, child: UserId) {
        self.roles.add_parent(parent, child);
        self.store.upsert_user(UserRecord::active(parent, &format!("user{parent}@example.com"))).unwrap();
    }

    pub fn save(&self, instance: AutomationInstance) {
        self.store.save_instance(&instance).unwrap();
    }

    pub fn engine(&self, instance_id: i64, action: ActionType) -> ScheduleEngine {
        ScheduleEngine::load(self.ctx(), instance_id, action).unwrap()
    }

    pub fn dispatcher(&self, batch_size: usize) -> Dispatcher {
        Dispatcher::new(self.ctx(), self.allocator.clone(), self.mailer.clone(), self.events.clone(), batch_size)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(self.ctx(), 8)
    }
}

pub fn seed_catalog(store: &MemoryStore, course_id: CourseId, users: &[UserId], enrol_time: i64) {
    store.upsert_course(CourseRecord::open(course_id, "Course")).unwrap();
    for user in users {
        store.upsert_user(UserRecord::active(*user, &format!("user{user}@example.com"))).unwrap();
        store.upsert_enrolment(EnrolmentRecord::active(course_id, *user, enrol_time)).unwrap();
    }
}

/// Same as [`seed_catalog`], plus the learner role assignments.
pub fn seed_db_catalog(db: &SchedulerDb, course_id: CourseId, users: &[UserId], enrol_time: i64) {
    use crate::catalog::{LEARNER_ARCHETYPE, RoleContext};
    db.upsert_course(&CourseRecord::open(course_id, "Course")).unwrap();
    db.upsert_role(STUDENT_ROLE, "student", LEARNER_ARCHETYPE).unwrap();
    for user in users {
        db.upsert_user(&UserRecord::active(*user, &format!("user{user}@example.com"))).unwrap();
        db.upsert_enrolment(&EnrolmentRecord::active(course_id, *user, enrol_time)).unwrap();
        db.assign_role(STUDENT_ROLE, *user, RoleContext::Course(course_id)).unwrap();
    }
}

fn template(action: ActionType, settings: ActionSettings) -> AutomationTemplate {
    AutomationTemplate {
        id: 1,
        title: "Welcome".into(),
        conditions: BTreeMap::from([("enrolment".to_string(), ConditionSetting::enabled())]),
        actions: BTreeMap::from([(action, settings)]),
    }
}

/// One-off credits to every learner, measured from enrolment.
pub fn credits_instance(id: i64, course_id: CourseId, credits: f64) -> AutomationInstance {
    let mut settings = ActionSettings::credits(credits, AllocationMethod::Add);
    settings.recipients = vec![RecipientSpec::Role(STUDENT_ROLE)];
    settings.base_date = BaseDateMode::Relative;
    AutomationInstance::new(id, course_id, template(ActionType::Credits, settings))
}

/// One-off notification to learners and their parents.
pub fn notification_instance(id: i64, course_id: CourseId) -> AutomationInstance {
    let mut settings = ActionSettings::notification("Welcome {{user_firstname}}", "Glad to have you in {{course_name}}");
    settings.recipients = vec![RecipientSpec::Role(STUDENT_ROLE), RecipientSpec::Role(PARENT_ROLE)];
    AutomationInstance::new(id, course_id, template(ActionType::Notification, settings))
}

/// Queued credits schedule worth 50.
pub fn queued(instance_id: i64, user_id: UserId, schedule_time: i64) -> ScheduleRecord {
    ScheduleRecord {
        id: 0,
        instance_id,
        user_id,
        related_user_id: None,
        interval_type: IntervalType::Once,
        status: ScheduleStatus::Queued,
        schedule_time,
        completed_time: None,
        notify_count: 0,
        frequency_count: 0,
        suppress_reached: false,
        time_created: 0,
        time_modified: 0,
        payload: SchedulePayload::Credits {
            credits: 50.0,
            allocation_method: AllocationMethod::Add,
            parent_schedule_id: None,
        },
        error_log: None,
    }
}

pub fn credit_override(schedule_id: ScheduleId, user_id: UserId, override_credit: f64, scheduled_credit: f64) -> CreditOverride {
    CreditOverride {
        id: 0,
        schedule_id,
        user_id,
        override_credit,
        scheduled_credit,
        overridden_by: 2,
        status: true,
        time_created: 0,
        time_modified: 0,
    }
}
