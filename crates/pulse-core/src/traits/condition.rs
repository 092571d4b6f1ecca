//! Condition plugin verdicts.

use crate::types::{ConditionContext, UserId};

/// Answers "is this user eligible" for the enabled conditions of an instance.
pub trait ConditionEvaluator: Send + Sync {
    /// AND of all enabled conditions in `ctx` for `user_id`.
    fn is_user_eligible(&self, ctx: &ConditionContext, user_id: UserId, is_new_user: bool) -> bool;

    /// Whether the named condition can supply a delay anchor.
    fn supports_delay(&self, _condition: &str) -> bool {
        false
    }

    /// The event time a delay is measured from (e.g. enrolment start, due date).
    fn delay_anchor(&self, _condition: &str, _ctx: &ConditionContext, _user_id: UserId) -> Option<i64> {
        None
    }
}
