//! NPAC adapter: the engine between the service-order server and the gateway.
//!
//! This crate opens one gateway session per primary SPID, brings the region
//! associations of each session up one at a time, recovers the notifications
//! missed while a region was down, answers and sends keep-alives, and hands
//! application notifications to the downstream driver chain.
//!
//! ## Moving parts
//!
//! - [`ReplyCorrelator`] pairs outstanding invoke IDs with their continuation
//!   and fires a timeout when no reply arrives
//! - [`WorkQueue`] runs continuations and retries off the receive path
//! - [`NpacAdapter`] holds the session, association and recovery flows
//! - [`ComServer`] classifies inbound traffic and answers ACK or NACK

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod clock;
pub mod com_server;
pub mod config;
pub mod correlator;
pub mod handler;
pub mod keepalive;
pub mod listener;
pub mod recovery;
pub mod retry;
pub mod transport;
pub mod work_queue;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::NpacAdapter;
pub use clock::{Clock, SystemClock};
pub use com_server::ComServer;
pub use config::{AdapterConfig, MIN_RECOVERY_INTERVAL};
pub use correlator::{Expired, ReplyCorrelator};
pub use handler::{Outcome, ReplyHandler};
pub use keepalive::KeepAliveDriver;
pub use listener::{AssociationEventNotifier, AssociationEvents};
pub use recovery::{RecoveryPhase, RecoveryStep};
pub use retry::PendingRetry;
pub use transport::{DriverChain, GatewayClient};
pub use work_queue::{Task, WorkQueue, WorkQueueConfig, WorkQueueStats};
