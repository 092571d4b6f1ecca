//! Collaborator interfaces consumed by the schedule engine.
//!
//! The engine decides *whether* and *when*; implementations of these traits
//! answer eligibility questions and execute the allocation or delivery.

pub mod allocator;
pub mod completion;
pub mod condition;
pub mod directory;
pub mod mailer;
pub mod roles;

pub use allocator::Allocator;
pub use completion::CompletionInfo;
pub use condition::ConditionEvaluator;
pub use directory::CourseDirectory;
pub use mailer::Mailer;
pub use roles::RoleResolver;
