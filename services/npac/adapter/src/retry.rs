//! Deferred protocol steps.
//!
//! A retry names the step to run again and the state it runs with; the adapter
//! decides when and on which worker it runs.

use npac_protocol::Region;
use npac_session::Session;
use std::fmt;
use std::sync::Arc;

use crate::recovery::RecoveryStep;

/// A protocol step waiting to be re-sent
#[derive(Debug, Clone)]
pub enum PendingRetry {
    /// Open the session again
    NewSession {
        /// Session to open
        session: Arc<Session>,
    },
    /// Reconnect one region; only runs while the region is still in RETRY
    AssociationConnect {
        /// Owning session
        session: Arc<Session>,
        /// Region to connect
        region: Region,
    },
    /// Re-send the current recovery window
    Recovery(RecoveryStep),
    /// Re-confirm a SWIM result set
    SwimResults {
        /// Recovery step the result set belongs to
        step: RecoveryStep,
        /// Action ID to confirm
        action_id: String,
    },
}

impl PendingRetry {
    /// Session the step belongs to
    pub fn session(&self) -> &Arc<Session> {
        match self {
            PendingRetry::NewSession { session }
            | PendingRetry::AssociationConnect { session, .. } => session,
            PendingRetry::Recovery(step) | PendingRetry::SwimResults { step, .. } => &step.session,
        }
    }
}

impl fmt::Display for PendingRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let primary = self.session().primary_spid();
        match self {
            PendingRetry::NewSession { .. } => write!(f, "new-session retry for {}", primary),
            PendingRetry::AssociationConnect { region, .. } => {
                write!(f, "association retry for {} region {}", primary, region)
            }
            PendingRetry::Recovery(step) => write!(f, "recovery retry for {}", step),
            PendingRetry::SwimResults { step, action_id } => {
                write!(f, "SWIM results retry for {} action {}", step, action_id)
            }
        }
    }
}
