use async_trait::async_trait;

use crate::error::Result;
use crate::types::Notification;

/// A notification sink (SMTP, webhook, log).
#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}
