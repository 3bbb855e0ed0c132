//! Protocol error types.

use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Region index outside 0..8
    #[error("invalid region {0}")]
    Region(i64),

    /// Timestamp not in yyyy-MM-ddTHH:mm:ssZ form
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    /// A field required by the message type is absent
    #[error("missing field {field} in {message_type}")]
    Missing {
        /// Message type being inspected
        message_type: String,
        /// Name of the absent field
        field: &'static str,
    },

    /// Malformed inbound message
    #[error("malformed message: {0}")]
    Malformed(String),
}
