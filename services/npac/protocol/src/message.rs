//! Inbound message discriminants and their classification.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Suffix shared by every notification that expects a NotificationReply
pub const NOTIFICATION_SUFFIX: &str = "Notification";

/// Notification name stems that carry network data and expect a DownloadReply
const NETWORK_NOTIFICATION_TYPES: &[&str] = &[
    "ServiceProvNPA_NXX_Create",
    "ServiceProvNPA_NXX_Delete",
    "ServiceProvLRNCreate",
    "ServiceProvLRNDelete",
    "ServiceProvNetworkCreate",
    "ServiceProvNetworkModify",
    "ServiceProvNetworkDelete",
    "ServiceProvNPA_NXX_X_Create",
    "ServiceProvNPA_NXX_X_Modify",
    "ServiceProvNPA_NXX_X_Delete",
];

/// Stems plus their notification-suffixed names
static NETWORK_NOTIFICATION_NAMES: Lazy<HashSet<String>> = Lazy::new(|| {
    NETWORK_NOTIFICATION_TYPES
        .iter()
        .flat_map(|stem| [stem.to_string(), format!("{stem}{NOTIFICATION_SUFFIX}")])
        .collect()
});

/// Discriminant element of an inbound gateway message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Reply to NewSession
    NewSessionReply,
    /// Reply to an association connect
    AssociationReply,
    /// Reply to RecoveryComplete
    RecoveryCompleteReply,
    /// Reply to RecoveryComplete carrying an error code
    RecoveryCompleteReplyWithErrorCode,
    /// Reply to a notification recovery request
    RecoveryReply,
    /// Reply to a network or service-provider data download
    DownloadRecoveryReply,
    /// Reply to SwimProcessingRecoveryResults
    SwimProcessingRecoveryResultsReply,
    /// Peer-initiated association status change
    AssociationStatusNotification,
    /// Error raised by the gateway for a request
    GatewayError,
    /// Gateway keep-alive
    GatewayKeepAlive,
    /// Peer released the session
    GatewayReleaseSession,
    /// Anything else: forwarded to the driver chain
    Application(String),
}

impl MessageType {
    /// Map an element name to its type
    pub fn from_name(name: &str) -> Self {
        match name {
            "NewSessionReply" => MessageType::NewSessionReply,
            "AssociationReply" => MessageType::AssociationReply,
            "RecoveryCompleteReply" => MessageType::RecoveryCompleteReply,
            "RecoveryCompleteReplyWithErrorCode" => {
                MessageType::RecoveryCompleteReplyWithErrorCode
            }
            "RecoveryReply" => MessageType::RecoveryReply,
            "DownloadRecoveryReply" => MessageType::DownloadRecoveryReply,
            "SwimProcessingRecoveryResultsReply" => {
                MessageType::SwimProcessingRecoveryResultsReply
            }
            "AssociationStatusNotification" => MessageType::AssociationStatusNotification,
            "GatewayError" => MessageType::GatewayError,
            "GatewayKeepAlive" => MessageType::GatewayKeepAlive,
            "GatewayReleaseSession" => MessageType::GatewayReleaseSession,
            other => MessageType::Application(other.to_string()),
        }
    }

    /// Element name
    pub fn name(&self) -> &str {
        match self {
            MessageType::NewSessionReply => "NewSessionReply",
            MessageType::AssociationReply => "AssociationReply",
            MessageType::RecoveryCompleteReply => "RecoveryCompleteReply",
            MessageType::RecoveryCompleteReplyWithErrorCode => {
                "RecoveryCompleteReplyWithErrorCode"
            }
            MessageType::RecoveryReply => "RecoveryReply",
            MessageType::DownloadRecoveryReply => "DownloadRecoveryReply",
            MessageType::SwimProcessingRecoveryResultsReply => {
                "SwimProcessingRecoveryResultsReply"
            }
            MessageType::AssociationStatusNotification => "AssociationStatusNotification",
            MessageType::GatewayError => "GatewayError",
            MessageType::GatewayKeepAlive => "GatewayKeepAlive",
            MessageType::GatewayReleaseSession => "GatewayReleaseSession",
            MessageType::Application(name) => name,
        }
    }

    /// Replies to requests the adapter itself issues
    pub fn is_bookkeeping_reply(&self) -> bool {
        matches!(
            self,
            MessageType::NewSessionReply
                | MessageType::AssociationReply
                | MessageType::RecoveryCompleteReply
                | MessageType::RecoveryCompleteReplyWithErrorCode
                | MessageType::RecoveryReply
                | MessageType::DownloadRecoveryReply
                | MessageType::SwimProcessingRecoveryResultsReply
        )
    }

    /// Notifications answered with a NotificationReply
    pub fn expects_notification_reply(&self) -> bool {
        matches!(self, MessageType::Application(name) if name.ends_with(NOTIFICATION_SUFFIX))
    }

    /// Network-data notifications answered with a DownloadReply
    pub fn is_network_notification(&self) -> bool {
        match self {
            MessageType::Application(name) => NETWORK_NOTIFICATION_NAMES
                .iter()
                .any(|known| name.ends_with(known.as_str())),
            _ => false,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        MessageType::from_name(&name)
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> String {
        kind.name().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_are_bookkeeping() {
        for name in ["NewSessionReply", "AssociationReply", "RecoveryReply", "DownloadRecoveryReply"] {
            let kind = MessageType::from_name(name);
            assert!(kind.is_bookkeeping_reply(), "{name}");
            assert_eq!(kind.name(), name);
        }
        assert!(!MessageType::GatewayKeepAlive.is_bookkeeping_reply());
    }

    #[test]
    fn test_application_classification() {
        let object = MessageType::from_name("SubscriptionVersionStatusAttributeValueChangeNotification");
        assert!(object.expects_notification_reply());
        assert!(!object.is_network_notification());

        let network = MessageType::from_name("VersionNewNPA_NXX_X_ServiceProvNPA_NXX_X_Create");
        assert!(network.is_network_notification());
        assert!(!network.expects_notification_reply());

        let lrn = MessageType::from_name("ServiceProvLRNCreateNotification");
        assert!(lrn.is_network_notification());
    }
}
