//! Collaborators the adapter talks to.
//!
//! The gateway client carries requests to the peer and the driver chain
//! receives the business notifications the adapter does not consume itself.

use async_trait::async_trait;
use npac_protocol::{Ack, GatewayRequest, Notification};

/// Outbound side of the gateway transport
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Hand a request to the transport; NACK means it never left
    async fn send(&self, request: &GatewayRequest) -> Ack;
}

/// Downstream processing chain for application notifications
#[async_trait]
pub trait DriverChain: Send + Sync {
    /// Process one notification; an error is answered with a processing failure
    async fn process(&self, notification: &Notification) -> anyhow::Result<()>;
}
