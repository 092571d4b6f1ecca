//! Shared domain types passed between the engine and its collaborators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type UserId = i64;
pub type CourseId = i64;
pub type InstanceId = i64;
pub type ScheduleId = i64;
pub type ModuleId = i64;
pub type RoleId = i64;
pub type GroupId = i64;

/// One configured condition of an automation (e.g. `enrolment`, `activity`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSetting {
    #[serde(default)]
    pub enabled: bool,
    /// Plugin-specific settings, opaque to the engine.
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl ConditionSetting {
    pub fn enabled() -> Self {
        Self { enabled: true, settings: serde_json::Value::Null }
    }
}

/// Everything a condition plugin needs to judge one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionContext {
    pub instance_id: InstanceId,
    pub course_id: CourseId,
    /// Merged template + instance conditions, keyed by plugin name.
    pub conditions: BTreeMap<String, ConditionSetting>,
}

impl ConditionContext {
    /// Names of enabled conditions in ascending order.
    pub fn enabled_names(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, _)| name.as_str())
    }
}

/// A configured recipient: either a role or a literal email address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSpec {
    Role(RoleId),
    Email(String),
}

/// Where a resolved recipient's role is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum RecipientScope {
    /// The recipient is a learner (capability holder) and acts on their own behalf.
    Learner,
    /// Role held at course level (teachers, managers, custom email users).
    Course,
    /// Role held in a child's user context (parents, mentors).
    UserContext { child: UserId },
}

/// A concrete user resolved from the recipient configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: UserId,
    pub scope: RecipientScope,
}

impl Recipient {
    pub fn learner(user_id: UserId) -> Self {
        Self { user_id, scope: RecipientScope::Learner }
    }

    pub fn course(user_id: UserId) -> Self {
        Self { user_id, scope: RecipientScope::Course }
    }

    pub fn parent_of(user_id: UserId, child: UserId) -> Self {
        Self { user_id, scope: RecipientScope::UserContext { child } }
    }
}

/// How a credit amount is applied to a user's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    #[default]
    Add,
    Replace,
}

impl AllocationMethod {
    pub fn code(self) -> i64 {
        match self {
            Self::Add => 1,
            Self::Replace => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Add),
            2 => Some(Self::Replace),
            _ => None,
        }
    }

    /// Balance after applying `amount` to `current`.
    pub fn apply(self, current: f64, amount: f64) -> f64 {
        match self {
            Self::Add => current + amount,
            Self::Replace => amount,
        }
    }
}

/// A rendered notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub instance_id: InstanceId,
    pub course_id: CourseId,
    pub recipient_user_id: UserId,
    pub recipient_email: Option<String>,
    pub related_user_id: Option<UserId>,
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_apply() {
        assert_eq!(AllocationMethod::Add.apply(40.0, 100.0), 140.0);
        assert_eq!(AllocationMethod::Replace.apply(40.0, 100.0), 100.0);
        assert_eq!(AllocationMethod::from_code(2), Some(AllocationMethod::Replace));
        assert_eq!(AllocationMethod::from_code(9), None);
    }

    #[test]
    fn test_recipient_spec_serde() {
        let specs: Vec<RecipientSpec> =
            serde_json::from_str(r#"[{"role": 5}, {"email": "ops@example.com"}]"#).unwrap();
        assert_eq!(specs[0], RecipientSpec::Role(5));
        assert_eq!(specs[1], RecipientSpec::Email("ops@example.com".into()));
    }

    #[test]
    fn test_enabled_condition_names_sorted() {
        let mut conditions = BTreeMap::new();
        conditions.insert("session".to_string(), ConditionSetting::enabled());
        conditions.insert("activity".to_string(), ConditionSetting::enabled());
        conditions.insert(
            "cohort".to_string(),
            ConditionSetting { enabled: false, settings: serde_json::Value::Null },
        );
        let ctx = ConditionContext { instance_id: 1, course_id: 2, conditions };
        let names: Vec<&str> = ctx.enabled_names().collect();
        assert_eq!(names, vec!["activity", "session"]);
    }
}
