//! Notification delivery.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::NotificationMessage;

/// Delivers rendered notifications.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    async fn send(&self, message: &NotificationMessage) -> Result<()>;
}
