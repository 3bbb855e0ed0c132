//! Sessions and association state for the NPAC gateway adapter.
//!
//! This crate tracks, per primary customer SPID, the gateway session ID, the
//! association state of each of the eight regions, the keep-alive sequence
//! counters and the customer SPIDs served, and publishes every association
//! transition to registered listeners.
//!
//! ## Association states
//!
//! - `DOWN -> NOT_REQUIRED` when no customer needs the region
//! - `DOWN -> WAITING_FOR_REPLY` when a connect is sent
//! - `WAITING_FOR_REPLY -> CONNECTED -> RECOVERING -> CONNECTED` on success
//! - `WAITING_FOR_REPLY -> RETRY -> WAITING_FOR_REPLY` on NACK or timeout
//! - any state `-> DOWN` when the session is reset

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod association;
pub mod keepalive;
pub mod registry;
pub mod session;

pub use association::{AssociationEvent, AssociationListener, AssociationState, ListenerId};
pub use keepalive::KeepAliveCounters;
pub use registry::SessionRegistry;
pub use session::{SecondarySpid, Session, SessionError};
