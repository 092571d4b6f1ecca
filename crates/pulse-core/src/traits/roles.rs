//! Recipient resolution.

use crate::types::{CourseId, GroupId, Recipient, RecipientSpec, UserId};

/// Turns configured recipients into concrete users.
pub trait RoleResolver: Send + Sync {
    /// Resolve roles and literal emails within a course. When `child` is given,
    /// user-context recipients are limited to those holding the role over that child.
    fn resolve_recipients(
        &self,
        specs: &[RecipientSpec],
        course_id: CourseId,
        child: Option<UserId>,
    ) -> Vec<Recipient>;

    /// Users in the course who receive automations on their own behalf.
    fn learners(&self, course_id: CourseId) -> Vec<UserId>;

    /// Groups `user_id` belongs to in the course.
    fn user_groups(&self, _course_id: CourseId, _user_id: UserId) -> Vec<GroupId> {
        Vec::new()
    }
}
