//! Schedule records, the core data model for per-user obligations.

use serde::{Deserialize, Serialize};

use pulse_core::types::{AllocationMethod, CourseId, InstanceId, ScheduleId, UserId};

use crate::recurrence::IntervalType;

/// Lifecycle state of a schedule record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Failed,
    Disabled,
    Queued,
    Completed,
}

impl ScheduleStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Failed => 0,
            Self::Disabled => 1,
            Self::Queued => 2,
            Self::Completed => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Failed,
            1 => Self::Disabled,
            2 => Self::Queued,
            3 => Self::Completed,
            _ => return None,
        })
    }

    /// Queued and Disabled records count against the one-active-per-key rule.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Disabled)
    }
}

/// The kind of action a schedule performs. Each kind has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Credits,
    Notification,
}

impl ActionType {
    pub const ALL: [ActionType; 2] = [ActionType::Credits, ActionType::Notification];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Credits => "pulse_credits_sch",
            Self::Notification => "pulse_notification_sch",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credits => "credits",
            Self::Notification => "notification",
        }
    }
}

/// Identity of an active obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleKey {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    /// `None` when the trigger user is the recipient.
    pub related_user_id: Option<UserId>,
    pub frequency_count: u32,
}

/// Kind-specific columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulePayload {
    Credits {
        credits: f64,
        allocation_method: AllocationMethod,
        /// The completed schedule this one was chained from.
        parent_schedule_id: Option<ScheduleId>,
    },
    Notification,
}

impl SchedulePayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Credits { .. } => ActionType::Credits,
            Self::Notification => ActionType::Notification,
        }
    }
}

/// One row per (instance, user, related user, frequency cycle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    /// Store-assigned id; 0 until inserted.
    pub id: ScheduleId,
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub related_user_id: Option<UserId>,
    pub interval_type: IntervalType,
    pub status: ScheduleStatus,
    /// Next due time (Unix seconds).
    pub schedule_time: i64,
    /// Set when the record transitions to Completed.
    pub completed_time: Option<i64>,
    /// Completed occurrences so far.
    pub notify_count: u32,
    /// Restart cycles so far.
    pub frequency_count: u32,
    /// Sticky once set; blocks requeueing until the instance is recreated.
    pub suppress_reached: bool,
    pub time_created: i64,
    pub time_modified: i64,
    pub payload: SchedulePayload,
    /// Reason recorded by the last failure.
    pub error_log: Option<String>,
}

impl ScheduleRecord {
    pub fn key(&self) -> ScheduleKey {
        ScheduleKey {
            instance_id: self.instance_id,
            user_id: self.user_id,
            related_user_id: self.related_user_id,
            frequency_count: self.frequency_count,
        }
    }

    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    pub fn credits(&self) -> Option<f64> {
        match self.payload {
            SchedulePayload::Credits { credits, .. } => Some(credits),
            SchedulePayload::Notification => None,
        }
    }

    pub fn set_credits(&mut self, amount: f64) {
        if let SchedulePayload::Credits { credits, .. } = &mut self.payload {
            *credits = amount;
        }
    }

    /// The user whose conditions and suppression rules apply.
    pub fn subject_user(&self) -> UserId {
        self.related_user_id.unwrap_or(self.user_id)
    }

    /// Due at `now` and still waiting to be processed.
    pub fn is_due(&self, now: i64) -> bool {
        self.status == ScheduleStatus::Queued && !self.suppress_reached && self.schedule_time <= now
    }
}

/// Report label for a schedule. `completed_label` comes from the action kind.
pub fn status_label(status: ScheduleStatus, instance_enabled: bool, completed_label: &str) -> String {
    match status {
        ScheduleStatus::Disabled => "On hold".into(),
        ScheduleStatus::Queued if !instance_enabled => "On hold".into(),
        ScheduleStatus::Queued => "Queued".into(),
        ScheduleStatus::Completed => completed_label.into(),
        ScheduleStatus::Failed => "Failed".into(),
    }
}

/// Administrator credit override attached to one schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditOverride {
    pub id: i64,
    pub schedule_id: ScheduleId,
    pub user_id: UserId,
    pub override_credit: f64,
    /// Credits on the schedule before the override was applied.
    pub scheduled_credit: f64,
    pub overridden_by: UserId,
    pub status: bool,
    pub time_created: i64,
    pub time_modified: i64,
}

/// Audit row for a direct balance edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCreditEdit {
    pub id: i64,
    pub user_id: UserId,
    pub course_id: Option<CourseId>,
    pub old_credits: f64,
    pub new_credits: f64,
    pub overridden_by: UserId,
    pub note: Option<String>,
    pub time_created: i64,
}
