//! Driver chain of the standalone gateway binary.

use async_trait::async_trait;
use npac_adapter::DriverChain;
use npac_protocol::Notification;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::component_info;

/// Logs every notification handed downstream
#[derive(Debug, Default)]
pub struct LoggingDriverChain {
    processed: AtomicU64,
}

impl LoggingDriverChain {
    /// Notifications seen so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DriverChain for LoggingDriverChain {
    async fn process(&self, notification: &Notification) -> anyhow::Result<()> {
        let count = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        component_info!(
            "driver",
            "#{} {} for {} region {:?} (invoke ID {:?}, status {:?})",
            count,
            notification.message_type,
            notification.customer_id.as_deref().unwrap_or("-"),
            notification.region,
            notification.invoke_id,
            notification.status
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npac_protocol::MessageType;

    #[tokio::test]
    async fn test_counts_processed_notifications() {
        let driver = LoggingDriverChain::default();
        let notification = Notification::new(MessageType::from_name(
            "SubscriptionVersionNewSP_CreateRequestNotification",
        ));
        driver.process(&notification).await.unwrap();
        driver.process(&notification).await.unwrap();
        assert_eq!(driver.processed(), 2);
    }
}
