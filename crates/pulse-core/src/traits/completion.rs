//! Course and activity completion state.

use crate::types::{CourseId, ModuleId, UserId};

pub trait CompletionInfo: Send + Sync {
    fn is_course_complete(&self, course_id: CourseId, user_id: UserId) -> bool;

    /// Unknown or not-yet-evaluated modules report `false`.
    fn is_module_complete(&self, module_id: ModuleId, user_id: UserId) -> bool;
}
