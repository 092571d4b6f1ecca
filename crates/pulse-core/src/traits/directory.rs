//! Course membership lookups.

use crate::types::{CourseId, UserId};

pub trait CourseDirectory: Send + Sync {
    /// Start of the user's active enrolment in the course.
    fn enrolment_time(&self, course_id: CourseId, user_id: UserId) -> Option<i64>;

    fn user_email(&self, user_id: UserId) -> Option<String>;

    fn course_name(&self, _course_id: CourseId) -> Option<String> {
        None
    }
}
