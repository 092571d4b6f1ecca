//! Audit events: what the engine did to balances and mailboxes.
//! Kept in memory (last 100) and mirrored to the log.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use pulse_core::types::{AllocationMethod, CourseId, InstanceId, ScheduleId, UserId};

use crate::record::ActionType;

const HISTORY_CAP: usize = 100;

/// One auditable change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A credits schedule was applied to the user's balance.
    CreditAllocated {
        schedule_id: ScheduleId,
        instance_id: InstanceId,
        user_id: UserId,
        credits: f64,
        method: AllocationMethod,
    },
    /// An administrator changed the amount of a queued schedule.
    CreditOverridden {
        schedule_id: ScheduleId,
        user_id: UserId,
        scheduled_credit: f64,
        override_credit: f64,
        overridden_by: UserId,
    },
    /// Direct balance edit, outside any schedule.
    UserCreditsEdited {
        user_id: UserId,
        course_id: Option<CourseId>,
        old_credits: f64,
        new_credits: f64,
        overridden_by: UserId,
        note: Option<String>,
    },
    NotificationSent {
        schedule_id: ScheduleId,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    },
    ScheduleFailed {
        action: ActionType,
        schedule_id: ScheduleId,
        instance_id: InstanceId,
        user_id: UserId,
        reason: String,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreditAllocated { .. } => "credit_allocated",
            Self::CreditOverridden { .. } => "credit_overridden",
            Self::UserCreditsEdited { .. } => "user_credits_edited",
            Self::NotificationSent { .. } => "notification_sent",
            Self::ScheduleFailed { .. } => "schedule_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    pub time: i64,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Event history (in-memory ring buffer, max 100).
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<EventEntry>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event and log it.
    pub fn record(&self, time: i64, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!("📝 {json}"),
            Err(_) => tracing::info!("📝 {}", event.name()),
        }
        let Ok(mut entries) = self.entries.lock() else {
            tracing::warn!("Event log poisoned, dropping {}", event.name());
            return;
        };
        entries.push(EventEntry { time, event });
        // Ring buffer, keep last 100
        if entries.len() > HISTORY_CAP {
            entries.remove(0);
        }
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<EventEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(schedule_id: ScheduleId) -> AuditEvent {
        AuditEvent::NotificationSent { schedule_id, instance_id: 1, user_id: 2, related_user_id: None }
    }

    #[test]
    fn test_ring_buffer_keeps_last_100() {
        let log = EventLog::new();
        for i in 0..105 {
            log.record(i, sent(i));
        }
        let history = log.history();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].time, 5);
        assert_eq!(history[99].event, sent(104));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let entry = EventEntry {
            time: 7,
            event: AuditEvent::UserCreditsEdited {
                user_id: 4,
                course_id: None,
                old_credits: 10.0,
                new_credits: 25.0,
                overridden_by: 2,
                note: Some("refund".into()),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event"], "user_credits_edited");
        assert_eq!(json["time"], 7);
        assert_eq!(json["new_credits"], 25.0);
        assert_eq!(entry.event.name(), "user_credits_edited");
    }
}
