//! Boundary between the gateway transport and the adapter.
//!
//! The transport hands every inbound message to [`ComServer::process`], which
//! classifies it by message type and answers ACK or NACK. Replies to the
//! adapter's own requests are routed to their handlers; everything the adapter
//! does not consume goes to the driver chain.

use npac_protocol::{Ack, MessageType, Notification};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::adapter::NpacAdapter;
use crate::keepalive::KeepAliveDriver;

/// Entry point for inbound gateway traffic
#[derive(Debug)]
pub struct ComServer {
    adapter: NpacAdapter,
    keep_alive: Mutex<Option<KeepAliveDriver>>,
}

impl ComServer {
    /// Wrap an adapter
    pub fn new(adapter: NpacAdapter) -> Self {
        Self {
            adapter,
            keep_alive: Mutex::new(None),
        }
    }

    /// The adapter behind this server
    pub fn adapter(&self) -> &NpacAdapter {
        &self.adapter
    }

    /// Open every session and start the keep-alive loop
    pub async fn start(&self) {
        info!("Starting NPAC ComServer");
        self.adapter.initialize().await;

        let driver = KeepAliveDriver::start(
            self.adapter.clone(),
            self.adapter.config().keep_alive_interval,
        );
        let previous = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(driver);
        if let Some(mut previous) = previous {
            previous.stop();
        }
    }

    /// Classify and handle one inbound message
    pub async fn process(&self, notification: Notification) -> Ack {
        debug!(
            "Processing {} (session {:?}, invoke ID {:?})",
            notification.message_type, notification.session_id, notification.invoke_id
        );

        let ack = match &notification.message_type {
            kind if kind.is_bookkeeping_reply() => self.adapter.handle_reply(notification).await,
            MessageType::GatewayKeepAlive => self.adapter.receive_keep_alive(&notification).await,
            MessageType::AssociationStatusNotification => {
                self.adapter
                    .receive_association_status_notification(&notification)
                    .await
            }
            MessageType::GatewayReleaseSession => {
                self.adapter.receive_release_session(&notification).await
            }
            MessageType::GatewayError => self.adapter.handle_error(notification).await,
            _ => {
                self.adapter
                    .receive_application_notification(notification)
                    .await
            }
        };
        debug!("Answered {}", ack);
        ack
    }

    /// Stop keep-alives, release every session and stop background work
    pub async fn shutdown(&self) {
        let driver = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut driver) = driver {
            driver.stop();
        }
        self.adapter.shutdown().await;
        info!("NPAC ComServer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::{harness, reply_to, wait_for};
    use npac_protocol::{ErrorCode, InvokeId, Region, ReplyStatus, RequestBody};
    use npac_storage::{CursorKey, NotificationTimeKind};

    fn region(index: u8) -> Region {
        Region::new(index).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_opens_sessions_and_routes_replies() {
        let h = harness(&[("9999", "1111", &[0])]);
        let server = ComServer::new(h.adapter.clone());
        server.start().await;

        let new_session = wait_for(&h.client, "NewSession", 1).await.remove(0);
        let reply = reply_to(MessageType::NewSessionReply, &new_session, ReplyStatus::Success)
            .with_session_id("42");
        assert_eq!(server.process(reply.clone()).await, Ack::Ack);
        wait_for(&h.client, "AssociationConnect", 1).await;

        // the same invoke ID is no longer awaited
        assert_eq!(server.process(reply).await, Ack::Nack);
        server.shutdown().await;
        assert_eq!(h.client.of_kind("ClientReleaseSession").len(), 1);
        assert_eq!(h.adapter.outstanding_requests(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_application_notification_is_forwarded_and_answered() {
        let h = harness(&[("9999", "1111", &[0])]);
        let server = ComServer::new(h.adapter.clone());

        let notification = Notification::new(MessageType::from_name(
            "SubscriptionVersionStatusAttributeValueChangeNotification",
        ))
        .with_session_id("42")
        .with_invoke_id(InvokeId::from(500))
        .with_region(region(0))
        .with_customer("1111");
        assert_eq!(server.process(notification).await, Ack::Ack);

        assert_eq!(h.driver.received().len(), 1);
        let replies = h.client.of_kind("NotificationReply");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].invoke_id(), &InvokeId::from(500));
        assert!(matches!(
            replies[0].body,
            RequestBody::NotificationReply {
                status: ReplyStatus::Success,
                error_code: None,
                ..
            }
        ));
        let cursor = h
            .storage
            .notification_times
            .get(&CursorKey::new("1111", region(0), NotificationTimeKind::Default))
            .await
            .unwrap();
        assert_eq!(cursor, Some(h.clock.now()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_network_notification_failure_gets_download_reply() {
        let h = harness(&[("9999", "1111", &[0])]);
        h.driver.fail(true);
        let server = ComServer::new(h.adapter.clone());

        let notification = Notification::new(MessageType::from_name(
            "VersionNewNPA_NXX_ServiceProvNPA_NXX_Create",
        ))
        .with_session_id("42")
        .with_invoke_id(InvokeId::from(501))
        .with_region(region(0))
        .with_customer("1111");
        assert_eq!(server.process(notification).await, Ack::Nack);

        let replies = h.client.of_kind("DownloadReply");
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies[0].body,
            RequestBody::DownloadReply {
                status: ReplyStatus::Failed,
                error_code: Some(ErrorCode::ProcessingFailure),
                ..
            }
        ));
        assert!(h.client.of_kind("NotificationReply").is_empty());
        let cursor = h
            .storage
            .notification_times
            .get(&CursorKey::new("1111", region(0), NotificationTimeKind::Network))
            .await
            .unwrap();
        assert!(cursor.is_some());
    }
}
