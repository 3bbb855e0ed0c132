//! Inbound messages as handed over by the transport.
//!
//! The transport owns XML parsing; what reaches the adapter is this flattened
//! view of the fields the adapter reads, plus the raw payload for the driver
//! chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorCode, InvokeId, MessageType, ProtocolError, Region, ReplyStatus};

/// One inbound gateway message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Discriminant element
    pub message_type: MessageType,
    /// Session the message belongs to
    #[serde(default)]
    pub session_id: Option<String>,
    /// Invoke ID of the request being answered
    #[serde(default)]
    pub invoke_id: Option<InvokeId>,
    /// Region index as sent by the peer
    #[serde(default)]
    pub region: Option<i64>,
    /// Customer SPID
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Reply status
    #[serde(default)]
    pub status: Option<ReplyStatus>,
    /// Error codes, in document order
    #[serde(default)]
    pub error_codes: Vec<ErrorCode>,
    /// Free-text error detail
    #[serde(default)]
    pub error_info: Option<String>,
    /// Keep-alive sequence number
    #[serde(default)]
    pub sequence_number: Option<u64>,
    /// SWIM action ID
    #[serde(default)]
    pub action_id: Option<String>,
    /// Upper bound of data the peer returned
    #[serde(default, with = "crate::timestamp::utc_option")]
    pub stop_time: Option<DateTime<Utc>>,
    /// Peer timestamp
    #[serde(default, with = "crate::timestamp::utc_option")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Raw message body
    #[serde(default)]
    pub payload: String,
}

impl Notification {
    /// Empty notification of the given type
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            session_id: None,
            invoke_id: None,
            region: None,
            customer_id: None,
            status: None,
            error_codes: Vec::new(),
            error_info: None,
            sequence_number: None,
            action_id: None,
            stop_time: None,
            timestamp: None,
            payload: String::new(),
        }
    }

    /// Set the session ID
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the invoke ID
    pub fn with_invoke_id(mut self, invoke_id: InvokeId) -> Self {
        self.invoke_id = Some(invoke_id);
        self
    }

    /// Set the region
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region.index() as i64);
        self
    }

    /// Set the customer SPID
    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: ReplyStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Append an error code
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.error_codes.push(code);
        self
    }

    /// Set the keep-alive sequence number
    pub fn with_sequence_number(mut self, sequence: u64) -> Self {
        self.sequence_number = Some(sequence);
        self
    }

    /// Set the SWIM action ID
    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    /// Set the stop time
    pub fn with_stop_time(mut self, stop_time: DateTime<Utc>) -> Self {
        self.stop_time = Some(stop_time);
        self
    }

    /// Region, validated
    pub fn region(&self) -> Result<Region, ProtocolError> {
        match self.region {
            Some(index) => Region::try_from(index),
            None => Err(ProtocolError::Missing {
                message_type: self.message_type.to_string(),
                field: "region",
            }),
        }
    }

    /// Reply status, if any
    pub fn status(&self) -> Option<&ReplyStatus> {
        self.status.as_ref()
    }

    /// Whether the reply status is success
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(ReplyStatus::Success))
    }

    /// Whether the peer reports our session as unknown
    pub fn is_session_invalid(&self) -> bool {
        matches!(self.status, Some(ReplyStatus::SessionInvalid))
    }

    /// Whether the peer rejected the request because the association is recovering
    pub fn is_association_in_recovery(&self) -> bool {
        self.error_codes.contains(&ErrorCode::AssociationInRecovery)
    }

    /// Whether the peer rejected the request because the region has no association
    pub fn is_region_not_associated(&self) -> bool {
        self.error_codes.contains(&ErrorCode::RegionNotAssociated)
    }

    /// Error codes joined with their detail, for logging
    pub fn error_summary(&self) -> String {
        let codes: Vec<&str> = self.error_codes.iter().map(ErrorCode::as_str).collect();
        match &self.error_info {
            Some(info) => format!("{}:{}", codes.join(","), info),
            None => codes.join(","),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_from_transport_json() {
        let json = r#"{
            "message_type": "AssociationStatusNotification",
            "session_id": "42",
            "region": 3,
            "status": "aborted",
            "error_codes": ["RequestRejectedBecauseRegionNotAssociated"],
            "stop_time": "2024-01-01T01:00:00Z"
        }"#;
        let notification: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(notification.message_type, MessageType::AssociationStatusNotification);
        assert_eq!(notification.region().unwrap().label(), "Southeast");
        assert_eq!(notification.status(), Some(&ReplyStatus::Aborted));
        assert!(notification.is_region_not_associated());
        assert!(notification.stop_time.is_some());
        assert!(notification.invoke_id.is_none());
    }

    #[test]
    fn test_missing_region_is_reported() {
        let notification = Notification::new(MessageType::AssociationStatusNotification);
        assert!(matches!(
            notification.region(),
            Err(ProtocolError::Missing { field: "region", .. })
        ));
    }
}
