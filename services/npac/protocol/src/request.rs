//! Outbound requests and their builders.
//!
//! Each builder stamps a [`MessageHeader`] with the session ID, invoke ID,
//! region, customer and current UTC time, and selects the body for one request
//! kind. Rendering to the gateway's XML is the transport's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ErrorCode, InvokeId, MessageHeader, Region, ReplyStatus};

/// Closed time range `[start, stop]` for recovery requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// First second included
    #[serde(with = "crate::timestamp::utc")]
    pub start: DateTime<Utc>,
    /// Last second included
    #[serde(with = "crate::timestamp::utc")]
    pub stop: DateTime<Utc>,
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            crate::timestamp::format(&self.start),
            crate::timestamp::format(&self.stop)
        )
    }
}

/// Data a DownloadRecoveryRequest asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadTarget {
    /// Network data (NPA-NXX, LRN, NPA-NXX-X)
    #[serde(rename = "network_data")]
    NetworkData,
    /// Service provider data
    #[serde(rename = "service_prov_data")]
    ServiceProvData,
}

/// How a region catches up after its association connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Windowed notification recovery only
    #[default]
    TimeBased,
    /// Windowed network and service-provider download, then notification recovery
    Download,
    /// Same phases as `Download`, continued with SWIM action IDs
    Swim,
}

/// Request body, one variant per request kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RequestBody {
    /// Open a session for a primary SPID
    NewSession {
        /// Gateway user
        user_id: String,
    },
    /// Connect a region association
    AssociationConnect,
    /// Recover notifications
    RecoveryRequest {
        /// Window to recover
        time_range: Option<TimeRange>,
        /// SWIM continuation token
        swim_action_id: Option<String>,
    },
    /// Download network or service-provider data
    DownloadRecoveryRequest {
        /// Data set
        target: DownloadTarget,
        /// Window to recover
        time_range: Option<TimeRange>,
        /// SWIM continuation token
        swim_action_id: Option<String>,
    },
    /// Confirm processing of a SWIM result set
    SwimProcessingRecoveryResultsRequest {
        /// Token returned with the results
        action_id: String,
        /// Processing outcome
        status: ReplyStatus,
    },
    /// Region recovery is done
    RecoveryCompleteRequest,
    /// Outbound keep-alive
    ClientKeepAlive {
        /// Sequence number, starting at 1
        sequence_number: u64,
    },
    /// Release the session
    ClientReleaseSession,
    /// Answer to an inbound notification
    NotificationReply {
        /// Outcome
        status: ReplyStatus,
        /// Failure code
        error_code: Option<ErrorCode>,
        /// Failure detail
        error_info: Option<String>,
    },
    /// Answer to an inbound network-data notification
    DownloadReply {
        /// Outcome
        status: ReplyStatus,
        /// Failure code
        error_code: Option<ErrorCode>,
        /// Failure detail
        error_info: Option<String>,
    },
    /// Application message built elsewhere
    Passthrough {
        /// Key of the message in the outbound request log
        message_key: String,
        /// Serialized body
        payload: String,
    },
}

impl RequestBody {
    /// Request kind name, as used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::NewSession { .. } => "NewSession",
            RequestBody::AssociationConnect => "AssociationConnect",
            RequestBody::RecoveryRequest { .. } => "RecoveryRequest",
            RequestBody::DownloadRecoveryRequest { .. } => "DownloadRecoveryRequest",
            RequestBody::SwimProcessingRecoveryResultsRequest { .. } => {
                "SwimProcessingRecoveryResultsRequest"
            }
            RequestBody::RecoveryCompleteRequest => "RecoveryCompleteRequest",
            RequestBody::ClientKeepAlive { .. } => "ClientKeepAlive",
            RequestBody::ClientReleaseSession => "ClientReleaseSession",
            RequestBody::NotificationReply { .. } => "NotificationReply",
            RequestBody::DownloadReply { .. } => "DownloadReply",
            RequestBody::Passthrough { .. } => "Passthrough",
        }
    }
}

/// A request ready for the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Common header
    pub header: MessageHeader,
    /// Kind-specific body
    pub body: RequestBody,
}

impl GatewayRequest {
    fn build(
        session_id: &str,
        invoke_id: InvokeId,
        region: Option<Region>,
        customer_id: &str,
        now: DateTime<Utc>,
        body: RequestBody,
    ) -> Self {
        Self {
            header: MessageHeader {
                session_id: session_id.to_string(),
                invoke_id,
                region,
                customer_id: customer_id.to_string(),
                timestamp: now,
            },
            body,
        }
    }

    /// NewSession for a primary SPID; the session ID is the uninitialized sentinel
    pub fn new_session(
        primary_spid: &str,
        invoke_id: InvokeId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            crate::UNINITIALIZED_SESSION_ID,
            invoke_id,
            None,
            primary_spid,
            now,
            RequestBody::NewSession {
                user_id: user_id.to_string(),
            },
        )
    }

    /// Association connect for a region
    pub fn association_connect(
        session_id: &str,
        invoke_id: InvokeId,
        region: Region,
        primary_spid: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            Some(region),
            primary_spid,
            now,
            RequestBody::AssociationConnect,
        )
    }

    /// Notification recovery for one SPID
    pub fn recovery(
        session_id: &str,
        invoke_id: InvokeId,
        region: Region,
        spid: &str,
        time_range: Option<TimeRange>,
        swim_action_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            Some(region),
            spid,
            now,
            RequestBody::RecoveryRequest {
                time_range,
                swim_action_id,
            },
        )
    }

    /// Network or service-provider download for one SPID
    #[allow(clippy::too_many_arguments)]
    pub fn download_recovery(
        session_id: &str,
        invoke_id: InvokeId,
        region: Region,
        spid: &str,
        target: DownloadTarget,
        time_range: Option<TimeRange>,
        swim_action_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            Some(region),
            spid,
            now,
            RequestBody::DownloadRecoveryRequest {
                target,
                time_range,
                swim_action_id,
            },
        )
    }

    /// Confirm a SWIM result set
    pub fn swim_processing_results(
        session_id: &str,
        invoke_id: InvokeId,
        region: Region,
        spid: &str,
        action_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            Some(region),
            spid,
            now,
            RequestBody::SwimProcessingRecoveryResultsRequest {
                action_id: action_id.to_string(),
                status: ReplyStatus::Success,
            },
        )
    }

    /// RecoveryComplete for a region
    pub fn recovery_complete(
        session_id: &str,
        invoke_id: InvokeId,
        region: Region,
        primary_spid: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            Some(region),
            primary_spid,
            now,
            RequestBody::RecoveryCompleteRequest,
        )
    }

    /// Outbound keep-alive
    pub fn keep_alive(
        session_id: &str,
        invoke_id: InvokeId,
        primary_spid: &str,
        sequence_number: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            None,
            primary_spid,
            now,
            RequestBody::ClientKeepAlive { sequence_number },
        )
    }

    /// Release the session
    pub fn release_session(
        session_id: &str,
        invoke_id: InvokeId,
        primary_spid: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            None,
            primary_spid,
            now,
            RequestBody::ClientReleaseSession,
        )
    }

    /// Answer a notification; the invoke ID is the one the notification carried
    #[allow(clippy::too_many_arguments)]
    pub fn notification_reply(
        session_id: &str,
        invoke_id: InvokeId,
        region: Option<Region>,
        customer_id: &str,
        status: ReplyStatus,
        error_code: Option<ErrorCode>,
        error_info: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            region,
            customer_id,
            now,
            RequestBody::NotificationReply {
                status,
                error_code,
                error_info,
            },
        )
    }

    /// Answer a network-data notification
    #[allow(clippy::too_many_arguments)]
    pub fn download_reply(
        session_id: &str,
        invoke_id: InvokeId,
        region: Option<Region>,
        customer_id: &str,
        status: ReplyStatus,
        error_code: Option<ErrorCode>,
        error_info: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            region,
            customer_id,
            now,
            RequestBody::DownloadReply {
                status,
                error_code,
                error_info,
            },
        )
    }

    /// Application message on behalf of a customer
    #[allow(clippy::too_many_arguments)]
    pub fn passthrough(
        session_id: &str,
        invoke_id: InvokeId,
        region: Option<Region>,
        customer_id: &str,
        message_key: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            session_id,
            invoke_id,
            region,
            customer_id,
            now,
            RequestBody::Passthrough {
                message_key: message_key.to_string(),
                payload: payload.to_string(),
            },
        )
    }

    /// Request kind name
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Invoke ID from the header
    pub fn invoke_id(&self) -> &InvokeId {
        &self.header.invoke_id
    }

    /// Region from the header
    pub fn region(&self) -> Option<Region> {
        self.header.region
    }
}

impl fmt::Display for GatewayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} session={} invoke={} customer={}",
            self.kind(),
            self.header.session_id,
            self.header.invoke_id,
            self.header.customer_id
        )?;
        if let Some(region) = self.header.region {
            write!(f, " region={}", region)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_session_header() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request = GatewayRequest::new_session("9999", InvokeId::from(7), "npac", now);
        assert_eq!(request.header.session_id, crate::UNINITIALIZED_SESSION_ID);
        assert_eq!(request.header.customer_id, "9999");
        assert_eq!(request.kind(), "NewSession");
        assert_eq!(request.region(), None);
    }

    #[test]
    fn test_request_json_uses_gateway_timestamps() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let stop = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let request = GatewayRequest::download_recovery(
            "42",
            InvokeId::from(9),
            Region::new(2).unwrap(),
            "1111",
            DownloadTarget::NetworkData,
            Some(TimeRange { start, stop }),
            None,
            stop,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["header"]["timestamp"], "2024-01-01T01:00:00Z");
        assert_eq!(json["header"]["region"], 2);
        assert_eq!(json["body"]["kind"], "DownloadRecoveryRequest");
        assert_eq!(json["body"]["target"], "network_data");
        assert_eq!(json["body"]["time_range"]["start"], "2024-01-01T00:00:01Z");
    }
}
