//! Association states and change notification.

use npac_protocol::Region;
use std::fmt;

/// State of one region's association within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AssociationState {
    /// Not connected
    #[default]
    Down,
    /// No customer of the session needs this region
    NotRequired,
    /// Connect request sent, reply pending
    WaitingForReply,
    /// Connect failed; a retry is scheduled
    Retry,
    /// Connected, catching up on missed data
    Recovering,
    /// Connected and recovered
    Connected,
}

impl AssociationState {
    /// Numeric code used in logs and status reports
    pub fn code(self) -> u8 {
        match self {
            AssociationState::Down => 0,
            AssociationState::NotRequired => 1,
            AssociationState::WaitingForReply => 2,
            AssociationState::Retry => 3,
            AssociationState::Recovering => 4,
            AssociationState::Connected => 5,
        }
    }

    /// Operator-facing label
    pub fn label(self) -> &'static str {
        match self {
            AssociationState::Down => "DOWN",
            AssociationState::NotRequired => "NOT REQUIRED",
            AssociationState::WaitingForReply => "WAITING FOR REPLY",
            AssociationState::Retry => "WAITING FOR RETRY",
            AssociationState::Recovering => "RECOVERING",
            AssociationState::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A state change of one association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationEvent {
    /// Primary SPID of the owning session
    pub primary_spid: String,
    /// Region that changed
    pub region: Region,
    /// State before the change
    pub previous: AssociationState,
    /// State after the change
    pub current: AssociationState,
    /// Region generation after the change
    pub generation: u64,
}

/// Observer of association changes
pub trait AssociationListener: Send + Sync + fmt::Debug {
    /// Called after every transition, outside the region lock
    fn association_changed(&self, event: &AssociationEvent);
}

/// Handle returned by `Session::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
