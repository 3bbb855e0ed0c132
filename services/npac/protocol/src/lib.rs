//! Message model for the NPAC/OSS gateway protocol.
//!
//! This crate defines what travels between the adapter and the gateway:
//! typed outbound requests with their common header, the flattened view of
//! inbound notifications, reply statuses and error codes, regions and the
//! gateway's UTC timestamp format. Wire encoding is left to the transport.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod message;
pub mod notification;
pub mod request;
pub mod status;
pub mod timestamp;

pub use error::ProtocolError;
pub use header::{
    Ack, InvokeId, MessageHeader, Region, RegionSet, REGION_COUNT, UNINITIALIZED_SESSION_ID,
};
pub use message::{MessageType, NOTIFICATION_SUFFIX};
pub use notification::Notification;
pub use request::{DownloadTarget, GatewayRequest, RecoveryMode, RequestBody, TimeRange};
pub use status::{ErrorCode, ReplyStatus};
