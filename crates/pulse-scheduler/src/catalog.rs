//! Catalog rows mirrored from the learning platform, and the collaborator
//! implementations backed by them.
//!
//! External condition plugins write their verdicts into
//! `pulse_condition_verdicts`; the engine only ever reads the boolean.

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use pulse_core::error::{PulseError, Result};
use pulse_core::traits::{Allocator, CompletionInfo, ConditionEvaluator, CourseDirectory, RoleResolver};
use pulse_core::types::{
    AllocationMethod, ConditionContext, CourseId, GroupId, ModuleId, Recipient, RecipientSpec, RoleId, UserId,
};

use crate::persistence::SchedulerDb;

/// Role archetype whose holders are the course's learners.
pub const LEARNER_ARCHETYPE: &str = "student";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRecord {
    pub id: CourseId,
    pub name: String,
    pub visible: bool,
    pub start_date: i64,
    /// 0 means open-ended.
    pub end_date: i64,
}

impl CourseRecord {
    /// Visible course with no date limits.
    pub fn open(id: CourseId, name: &str) -> Self {
        Self { id, name: name.to_string(), visible: true, start_date: 0, end_date: 0 }
    }

    pub fn is_running(&self, now: i64) -> bool {
        self.visible && self.start_date <= now && (self.end_date == 0 || self.end_date >= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub deleted: bool,
    pub suspended: bool,
}

impl UserRecord {
    pub fn active(id: UserId, email: &str) -> Self {
        Self { id, email: email.to_string(), deleted: false, suspended: false }
    }

    pub fn is_active(&self) -> bool {
        !self.deleted && !self.suspended
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolmentRecord {
    pub course_id: CourseId,
    pub user_id: UserId,
    pub active: bool,
    pub time_start: i64,
    /// 0 means no end date.
    pub time_end: i64,
}

impl EnrolmentRecord {
    pub fn active(course_id: CourseId, user_id: UserId, time_start: i64) -> Self {
        Self { course_id, user_id, active: true, time_start, time_end: 0 }
    }

    pub fn is_active(&self, now: i64) -> bool {
        self.active
            && (self.time_start == 0 || self.time_start <= now)
            && (self.time_end == 0 || self.time_end > now)
    }
}

/// Where a role assignment lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleContext {
    Course(CourseId),
    /// Held in a child's user context (parents, mentors).
    User(UserId),
}

impl SchedulerDb {
    pub fn upsert_course(&self, course: &CourseRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO pulse_courses (id, name, visible, start_date, end_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![course.id, course.name, course.visible, course.start_date, course.end_date],
            )
            .map_err(|e| PulseError::Storage(format!("Save course: {e}")))?;
        Ok(())
    }

    pub fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO pulse_users (id, email, deleted, suspended) VALUES (?1, ?2, ?3, ?4)",
                params![user.id, user.email, user.deleted, user.suspended],
            )
            .map_err(|e| PulseError::Storage(format!("Save user: {e}")))?;
        Ok(())
    }

    pub fn upsert_enrolment(&self, enrolment: &EnrolmentRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO pulse_enrolments (course_id, user_id, active, time_start, time_end)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    enrolment.course_id, enrolment.user_id, enrolment.active,
                    enrolment.time_start, enrolment.time_end,
                ],
            )
            .map_err(|e| PulseError::Storage(format!("Save enrolment: {e}")))?;
        Ok(())
    }

    pub fn set_enrolment_active(&self, course_id: CourseId, user_id: UserId, active: bool) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE pulse_enrolments SET active = ?3 WHERE course_id = ?1 AND user_id = ?2",
                params![course_id, user_id, active],
            )
            .map_err(|e| PulseError::Storage(format!("Update enrolment: {e}")))?;
        Ok(())
    }

    pub fn remove_enrolment(&self, course_id: CourseId, user_id: UserId) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM pulse_enrolments WHERE course_id = ?1 AND user_id = ?2",
                params![course_id, user_id],
            )
            .map_err(|e| PulseError::Storage(format!("Delete enrolment: {e}")))?;
        Ok(())
    }

    pub fn upsert_role(&self, id: RoleId, shortname: &str, archetype: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO pulse_roles (id, shortname, archetype) VALUES (?1, ?2, ?3)",
                params![id, shortname, archetype],
            )
            .map_err(|e| PulseError::Storage(format!("Save role: {e}")))?;
        Ok(())
    }

    pub fn assign_role(&self, role_id: RoleId, user_id: UserId, context: RoleContext) -> Result<()> {
        let (course, child) = match context {
            RoleContext::Course(course) => (course, 0),
            RoleContext::User(child) => (0, child),
        };
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO pulse_role_assignments (role_id, user_id, course_id, child_user_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![role_id, user_id, course, child],
            )
            .map_err(|e| PulseError::Storage(format!("Assign role: {e}")))?;
        Ok(())
    }

    pub fn add_group_member(&self, group_id: GroupId, course_id: CourseId, user_id: UserId) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO pulse_groups (group_id, course_id, user_id) VALUES (?1, ?2, ?3)",
                params![group_id, course_id, user_id],
            )
            .map_err(|e| PulseError::Storage(format!("Add group member: {e}")))?;
        Ok(())
    }

    /// Store a condition plugin's verdict for one user.
    pub fn record_condition_verdict(
        &self,
        instance_id: i64,
        user_id: UserId,
        condition: &str,
        eligible: bool,
        anchor_time: Option<i64>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO pulse_condition_verdicts (instance_id, user_id, condition, eligible, anchor_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![instance_id, user_id, condition, eligible, anchor_time],
            )
            .map_err(|e| PulseError::Storage(format!("Save verdict: {e}")))?;
        Ok(())
    }

    pub fn record_course_completion(&self, course_id: CourseId, user_id: UserId, at: i64) -> Result<()> {
        self.record_completion(course_id, 0, user_id, at)
    }

    pub fn record_module_completion(&self, module_id: ModuleId, user_id: UserId, at: i64) -> Result<()> {
        self.record_completion(0, module_id, user_id, at)
    }

    fn record_completion(&self, course_id: CourseId, module_id: ModuleId, user_id: UserId, at: i64) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO pulse_completions (user_id, course_id, module_id, time_completed)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, course_id, module_id, at],
            )
            .map_err(|e| PulseError::Storage(format!("Save completion: {e}")))?;
        Ok(())
    }

    fn user_ids(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| PulseError::Storage(format!("Prepare: {e}")))?;
        let ids = stmt
            .query_map(args, |r| r.get(0))
            .map_err(|e| PulseError::Storage(format!("Query users: {e}")))?
            .collect::<rusqlite::Result<Vec<UserId>>>()
            .map_err(|e| PulseError::Storage(format!("Read user: {e}")))?;
        Ok(ids)
    }

    fn role_archetype(&self, role_id: RoleId) -> Result<Option<String>> {
        self.conn()?
            .query_row("SELECT archetype FROM pulse_roles WHERE id = ?1", params![role_id], |r| r.get(0))
            .optional()
            .map_err(|e| PulseError::Storage(format!("Load role: {e}")))
    }

    fn exists(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<bool> {
        let found: Option<i64> = self
            .conn()?
            .query_row(sql, args, |r| r.get(0))
            .optional()
            .map_err(|e| PulseError::Storage(format!("Lookup: {e}")))?;
        Ok(found.is_some())
    }

    fn resolve_spec(&self, spec: &RecipientSpec, course_id: CourseId, child: Option<UserId>) -> Result<Vec<Recipient>> {
        match spec {
            RecipientSpec::Email(email) => {
                let ids = self.user_ids(
                    "SELECT id FROM pulse_users WHERE email = ?1 AND deleted = 0 ORDER BY id LIMIT 1",
                    &[email],
                )?;
                if ids.is_empty() {
                    tracing::debug!("No user for recipient email {email}");
                }
                Ok(ids.into_iter().map(Recipient::course).collect())
            }
            RecipientSpec::Role(role_id) => {
                if self.role_archetype(*role_id)?.as_deref() == Some(LEARNER_ARCHETYPE) {
                    let mut learners = self.user_ids(
                        "SELECT user_id FROM pulse_role_assignments
                         WHERE role_id = ?1 AND course_id = ?2 ORDER BY user_id",
                        &[role_id, &course_id],
                    )?;
                    if let Some(child) = child {
                        learners.retain(|u| *u == child);
                    }
                    return Ok(learners.into_iter().map(Recipient::learner).collect());
                }

                let mut out: Vec<Recipient> = self
                    .user_ids(
                        "SELECT user_id FROM pulse_role_assignments
                         WHERE role_id = ?1 AND course_id = ?2 ORDER BY user_id",
                        &[role_id, &course_id],
                    )?
                    .into_iter()
                    .map(Recipient::course)
                    .collect();

                let conn = self.conn()?;
                let mut stmt = conn
                    .prepare(
                        "SELECT user_id, child_user_id FROM pulse_role_assignments
                         WHERE role_id = ?1 AND child_user_id != 0 ORDER BY user_id, child_user_id",
                    )
                    .map_err(|e| PulseError::Storage(format!("Prepare: {e}")))?;
                let pairs = stmt
                    .query_map(params![role_id], |r| Ok((r.get::<_, UserId>(0)?, r.get::<_, UserId>(1)?)))
                    .map_err(|e| PulseError::Storage(format!("Query user roles: {e}")))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| PulseError::Storage(format!("Read user role: {e}")))?;
                out.extend(
                    pairs
                        .into_iter()
                        .filter(|(_, c)| child.is_none_or(|wanted| wanted == *c))
                        .map(|(user, c)| Recipient::parent_of(user, c)),
                );
                Ok(out)
            }
        }
    }
}

impl RoleResolver for SchedulerDb {
    fn resolve_recipients(&self, specs: &[RecipientSpec], course_id: CourseId, child: Option<UserId>) -> Vec<Recipient> {
        let mut out: Vec<Recipient> = Vec::new();
        for spec in specs {
            match self.resolve_spec(spec, course_id, child) {
                Ok(found) => {
                    for recipient in found {
                        if !out.contains(&recipient) {
                            out.push(recipient);
                        }
                    }
                }
                Err(e) => tracing::warn!("Recipient lookup failed for course {course_id}: {e}"),
            }
        }
        out
    }

    fn learners(&self, course_id: CourseId) -> Vec<UserId> {
        self.user_ids(
            "SELECT DISTINCT a.user_id FROM pulse_role_assignments a
             JOIN pulse_roles r ON r.id = a.role_id
             WHERE a.course_id = ?1 AND r.archetype = ?2 ORDER BY a.user_id",
            &[&course_id, &LEARNER_ARCHETYPE],
        )
        .unwrap_or_else(|e| {
            tracing::warn!("Learner lookup failed for course {course_id}: {e}");
            Vec::new()
        })
    }

    fn user_groups(&self, course_id: CourseId, user_id: UserId) -> Vec<GroupId> {
        self.user_ids(
            "SELECT group_id FROM pulse_groups WHERE course_id = ?1 AND user_id = ?2 ORDER BY group_id",
            &[&course_id, &user_id],
        )
        .unwrap_or_else(|e| {
            tracing::warn!("Group lookup failed for user {user_id}: {e}");
            Vec::new()
        })
    }
}

impl ConditionEvaluator for SchedulerDb {
    /// AND of the stored verdicts of every enabled condition. A condition
    /// with no verdict yet counts as not met.
    fn is_user_eligible(&self, ctx: &ConditionContext, user_id: UserId, _is_new_user: bool) -> bool {
        let mut any = false;
        for name in ctx.enabled_names() {
            any = true;
            let verdict: std::result::Result<Option<bool>, PulseError> = self.conn().and_then(|conn| {
                conn.query_row(
                    "SELECT eligible FROM pulse_condition_verdicts
                     WHERE instance_id = ?1 AND user_id = ?2 AND condition = ?3",
                    params![ctx.instance_id, user_id, name],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| PulseError::Storage(format!("Load verdict: {e}")))
            });
            match verdict {
                Ok(Some(true)) => {}
                Ok(_) => return false,
                Err(e) => {
                    tracing::warn!("Condition '{name}' lookup failed for user {user_id}: {e}");
                    return false;
                }
            }
        }
        any
    }

    fn supports_delay(&self, _condition: &str) -> bool {
        true
    }

    fn delay_anchor(&self, condition: &str, ctx: &ConditionContext, user_id: UserId) -> Option<i64> {
        let conn = self.conn().ok()?;
        conn.query_row(
            "SELECT anchor_time FROM pulse_condition_verdicts
             WHERE instance_id = ?1 AND user_id = ?2 AND condition = ?3",
            params![ctx.instance_id, user_id, condition],
            |r| r.get::<_, Option<i64>>(0),
        )
        .optional()
        .ok()
        .flatten()
        .flatten()
    }
}

impl CompletionInfo for SchedulerDb {
    fn is_course_complete(&self, course_id: CourseId, user_id: UserId) -> bool {
        self.exists(
            "SELECT 1 FROM pulse_completions WHERE course_id = ?1 AND module_id = 0 AND user_id = ?2",
            &[&course_id, &user_id],
        )
        .unwrap_or_else(|e| {
            tracing::warn!("Course completion lookup failed for user {user_id}: {e}");
            false
        })
    }

    fn is_module_complete(&self, module_id: ModuleId, user_id: UserId) -> bool {
        self.exists(
            "SELECT 1 FROM pulse_completions WHERE module_id = ?1 AND user_id = ?2",
            &[&module_id, &user_id],
        )
        .unwrap_or_else(|e| {
            tracing::warn!("Module completion lookup failed for user {user_id}: {e}");
            false
        })
    }
}

impl CourseDirectory for SchedulerDb {
    fn enrolment_time(&self, course_id: CourseId, user_id: UserId) -> Option<i64> {
        let conn = self.conn().ok()?;
        conn.query_row(
            "SELECT time_start FROM pulse_enrolments WHERE course_id = ?1 AND user_id = ?2",
            params![course_id, user_id],
            |r| r.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    fn user_email(&self, user_id: UserId) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row("SELECT email FROM pulse_users WHERE id = ?1", params![user_id], |r| r.get::<_, String>(0))
            .optional()
            .ok()
            .flatten()
            .filter(|email| !email.is_empty())
    }

    fn course_name(&self, course_id: CourseId) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row("SELECT name FROM pulse_courses WHERE id = ?1", params![course_id], |r| r.get(0))
            .optional()
            .ok()
            .flatten()
    }
}

/// Credit ledger kept in `pulse_user_credits`.
impl Allocator for SchedulerDb {
    fn apply(&self, user_id: UserId, amount: f64, method: AllocationMethod) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| PulseError::Storage(format!("Begin: {e}")))?;
        let current: f64 = tx
            .query_row("SELECT balance FROM pulse_user_credits WHERE user_id = ?1", params![user_id], |r| r.get(0))
            .optional()
            .map_err(|e| PulseError::Storage(format!("Load balance: {e}")))?
            .unwrap_or(0.0);
        tx.execute(
            "INSERT OR REPLACE INTO pulse_user_credits (user_id, balance) VALUES (?1, ?2)",
            params![user_id, method.apply(current, amount)],
        )
        .map_err(|e| PulseError::Storage(format!("Save balance: {e}")))?;
        tx.commit().map_err(|e| PulseError::Storage(format!("Commit: {e}")))?;
        Ok(())
    }

    fn balance(&self, user_id: UserId) -> Result<f64> {
        let balance = self
            .conn()?
            .query_row("SELECT balance FROM pulse_user_credits WHERE user_id = ?1", params![user_id], |r| r.get(0))
            .optional()
            .map_err(|e| PulseError::Storage(format!("Load balance: {e}")))?;
        Ok(balance.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::types::{ConditionSetting, RecipientScope};
    use std::collections::BTreeMap;

    const STUDENT: RoleId = 5;
    const PARENT: RoleId = 9;
    const TEACHER: RoleId = 3;

    fn db() -> SchedulerDb {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.upsert_role(STUDENT, "student", LEARNER_ARCHETYPE).unwrap();
        db.upsert_role(PARENT, "parent", "").unwrap();
        db.upsert_role(TEACHER, "editingteacher", "editingteacher").unwrap();
        db.upsert_user(&UserRecord::active(20, "learner@example.com")).unwrap();
        db.upsert_user(&UserRecord::active(21, "other@example.com")).unwrap();
        db.upsert_user(&UserRecord::active(30, "parent@example.com")).unwrap();
        db.upsert_user(&UserRecord::active(40, "teacher@example.com")).unwrap();
        db.assign_role(STUDENT, 20, RoleContext::Course(1)).unwrap();
        db.assign_role(STUDENT, 21, RoleContext::Course(1)).unwrap();
        db.assign_role(TEACHER, 40, RoleContext::Course(1)).unwrap();
        db.assign_role(PARENT, 30, RoleContext::User(20)).unwrap();
        db
    }

    #[test]
    fn test_course_and_enrolment_windows() {
        let course = CourseRecord { start_date: 100, end_date: 200, ..CourseRecord::open(1, "C") };
        assert!(!course.is_running(99));
        assert!(course.is_running(200));
        assert!(!course.is_running(201));

        let mut enrol = EnrolmentRecord::active(1, 2, 50);
        assert!(!enrol.is_active(49));
        assert!(enrol.is_active(50));
        enrol.time_end = 60;
        assert!(!enrol.is_active(60));
        assert!(!UserRecord { deleted: true, ..UserRecord::active(1, "") }.is_active());
    }

    #[test]
    fn test_resolve_learners_parents_and_emails() {
        let db = db();
        let specs = vec![
            RecipientSpec::Role(STUDENT),
            RecipientSpec::Role(PARENT),
            RecipientSpec::Email("teacher@example.com".into()),
            RecipientSpec::Email("nobody@example.com".into()),
        ];
        let found = db.resolve_recipients(&specs, 1, None);
        assert_eq!(
            found,
            vec![
                Recipient::learner(20),
                Recipient::learner(21),
                Recipient::parent_of(30, 20),
                Recipient::course(40),
            ]
        );

        let narrowed = db.resolve_recipients(&specs, 1, Some(21));
        assert!(narrowed.iter().all(|r| r.scope != RecipientScope::UserContext { child: 20 }));
        assert!(narrowed.contains(&Recipient::learner(21)));
        assert!(!narrowed.contains(&Recipient::learner(20)));
        assert_eq!(db.learners(1), vec![20, 21]);
    }

    #[test]
    fn test_condition_verdicts_and_anchor() {
        let db = db();
        let mut conditions = BTreeMap::new();
        conditions.insert("enrolment".to_string(), ConditionSetting::enabled());
        conditions.insert("coursedates".to_string(), ConditionSetting::enabled());
        let ctx = ConditionContext { instance_id: 7, course_id: 1, conditions };

        assert!(!db.is_user_eligible(&ctx, 20, true));
        db.record_condition_verdict(7, 20, "enrolment", true, None).unwrap();
        assert!(!db.is_user_eligible(&ctx, 20, true));
        db.record_condition_verdict(7, 20, "coursedates", true, Some(5_000)).unwrap();
        assert!(db.is_user_eligible(&ctx, 20, true));
        assert_eq!(db.delay_anchor("coursedates", &ctx, 20), Some(5_000));
        assert_eq!(db.delay_anchor("enrolment", &ctx, 20), None);

        let empty = ConditionContext { instance_id: 7, course_id: 1, conditions: BTreeMap::new() };
        assert!(!db.is_user_eligible(&empty, 20, true));
    }

    #[test]
    fn test_completion_directory_and_ledger() {
        let db = db();
        db.upsert_course(&CourseRecord::open(1, "Rust 101")).unwrap();
        db.upsert_enrolment(&EnrolmentRecord::active(1, 20, 1_000)).unwrap();
        db.record_module_completion(11, 20, 10).unwrap();
        db.record_course_completion(1, 21, 10).unwrap();
        db.add_group_member(4, 1, 20).unwrap();

        assert!(db.is_module_complete(11, 20));
        assert!(!db.is_module_complete(12, 20));
        assert!(db.is_course_complete(1, 21));
        assert!(!db.is_course_complete(1, 20));
        assert_eq!(db.enrolment_time(1, 20), Some(1_000));
        assert_eq!(db.enrolment_time(1, 21), None);
        assert_eq!(db.user_email(30).as_deref(), Some("parent@example.com"));
        assert_eq!(db.course_name(1).as_deref(), Some("Rust 101"));
        assert_eq!(db.user_groups(1, 20), vec![4]);

        db.apply(20, 100.0, AllocationMethod::Add).unwrap();
        db.apply(20, 25.0, AllocationMethod::Add).unwrap();
        assert_eq!(db.balance(20).unwrap(), 125.0);
        db.apply(20, 10.0, AllocationMethod::Replace).unwrap();
        assert_eq!(db.balance(20).unwrap(), 10.0);
        assert_eq!(db.balance(99).unwrap(), 0.0);
    }
}
