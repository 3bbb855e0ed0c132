//! Reply statuses and error codes reported by the gateway.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status field of a reply
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReplyStatus {
    /// Request accepted
    Success,
    /// Session ID no longer known to the peer
    SessionInvalid,
    /// Request failed
    Failed,
    /// Association is up
    Connected,
    /// Association aborted
    Aborted,
    /// Association released
    Released,
    /// Recovery window held nothing
    NoDataSelected,
    /// More SWIM data waits under the returned action ID
    SwimMoreData,
    /// Recovery window too wide for the peer
    CriteriaTooLarge,
    /// Recovery window rejected as a range
    TimeRangeInvalid,
    /// Any other value, kept verbatim
    Other(String),
}

impl ReplyStatus {
    /// Parse a status value
    pub fn from_value(value: &str) -> Self {
        match value {
            "success" => ReplyStatus::Success,
            "session-invalid" => ReplyStatus::SessionInvalid,
            "failed" => ReplyStatus::Failed,
            "connected" => ReplyStatus::Connected,
            "aborted" => ReplyStatus::Aborted,
            "released" => ReplyStatus::Released,
            "no-data-selected" => ReplyStatus::NoDataSelected,
            "swim-more-data" => ReplyStatus::SwimMoreData,
            // the peer spells it this way
            "criteria-to-large" => ReplyStatus::CriteriaTooLarge,
            "time-range-invalid" => ReplyStatus::TimeRangeInvalid,
            other => ReplyStatus::Other(other.to_string()),
        }
    }

    /// Wire value
    pub fn as_str(&self) -> &str {
        match self {
            ReplyStatus::Success => "success",
            ReplyStatus::SessionInvalid => "session-invalid",
            ReplyStatus::Failed => "failed",
            ReplyStatus::Connected => "connected",
            ReplyStatus::Aborted => "aborted",
            ReplyStatus::Released => "released",
            ReplyStatus::NoDataSelected => "no-data-selected",
            ReplyStatus::SwimMoreData => "swim-more-data",
            ReplyStatus::CriteriaTooLarge => "criteria-to-large",
            ReplyStatus::TimeRangeInvalid => "time-range-invalid",
            ReplyStatus::Other(value) => value,
        }
    }

    /// Window rejected as too wide or malformed; retry with a narrower one
    pub fn needs_smaller_window(&self) -> bool {
        matches!(self, ReplyStatus::CriteriaTooLarge | ReplyStatus::TimeRangeInvalid)
    }
}

impl From<String> for ReplyStatus {
    fn from(value: String) -> Self {
        ReplyStatus::from_value(&value)
    }
}

impl From<ReplyStatus> for String {
    fn from(status: ReplyStatus) -> String {
        status.as_str().to_string()
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error code attached to a failed reply or GatewayError
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// Local processing of a notification failed
    ProcessingFailure,
    /// Region association is still recovering
    AssociationInRecovery,
    /// Region has no association
    RegionNotAssociated,
    /// Any other code, kept verbatim
    Other(String),
}

impl ErrorCode {
    /// Parse an error code
    pub fn from_value(value: &str) -> Self {
        match value {
            "processingFailureEr" => ErrorCode::ProcessingFailure,
            "RequestRejectedBecauseAssociationInRecovery" => ErrorCode::AssociationInRecovery,
            "RequestRejectedBecauseRegionNotAssociated" => ErrorCode::RegionNotAssociated,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    /// Wire value
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ProcessingFailure => "processingFailureEr",
            ErrorCode::AssociationInRecovery => "RequestRejectedBecauseAssociationInRecovery",
            ErrorCode::RegionNotAssociated => "RequestRejectedBecauseRegionNotAssociated",
            ErrorCode::Other(value) => value,
        }
    }

    /// Association-level rejection: re-attempt the request later
    pub fn is_association_rejection(&self) -> bool {
        matches!(self, ErrorCode::AssociationInRecovery | ErrorCode::RegionNotAssociated)
    }
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        ErrorCode::from_value(&value)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
