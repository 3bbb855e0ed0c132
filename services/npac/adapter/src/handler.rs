//! Continuations of outstanding requests.
//!
//! Each [`ReplyHandler`] variant is registered with the correlator when its
//! request is sent and carries the state needed to continue once the reply,
//! a gateway error or the resend timeout arrives. Dispatch runs on the work
//! queue, never on the transport's receive path.

use npac_protocol::{Notification, Region, ReplyStatus};
use npac_session::{AssociationState, Session};
use npac_storage::RequestStatus;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapter::NpacAdapter;
use crate::recovery::RecoveryStep;
use crate::retry::PendingRetry;

/// What ended the wait for a reply
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Reply message
    Reply(Notification),
    /// GatewayError raised for the request
    Error(Notification),
    /// Nothing arrived within the resend timeout
    Timeout,
}

impl Outcome {
    fn message(&self) -> Option<&Notification> {
        match self {
            Outcome::Reply(message) | Outcome::Error(message) => Some(message),
            Outcome::Timeout => None,
        }
    }
}

/// Continuation of one outstanding request
#[derive(Debug, Clone)]
pub enum ReplyHandler {
    /// NewSession for a primary SPID
    NewSession {
        /// Session being opened
        session: Arc<Session>,
        /// Open attempt the request belongs to
        attempt: u64,
    },
    /// Association connect
    AssociationConnect {
        /// Owning session
        session: Arc<Session>,
        /// Region being connected
        region: Region,
        /// Region generation at send time
        generation: u64,
    },
    /// Recovery or download window
    Recovery(RecoveryStep),
    /// SWIM result confirmation
    SwimResults {
        /// Recovery step the result set belongs to
        step: RecoveryStep,
        /// Action ID being confirmed
        action_id: String,
    },
    /// RecoveryComplete
    RecoveryComplete {
        /// Owning session
        session: Arc<Session>,
        /// Region finishing recovery
        region: Region,
        /// Region generation of the recovery
        generation: u64,
    },
    /// Application request sent on behalf of a customer
    Generic {
        /// Customer SPID
        spid: String,
        /// Caller's key for the request
        message_key: String,
        /// Region the request targets
        region: Option<Region>,
    },
}

impl ReplyHandler {
    /// Session the request belongs to, when the handler carries it
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            ReplyHandler::NewSession { session, .. }
            | ReplyHandler::AssociationConnect { session, .. }
            | ReplyHandler::RecoveryComplete { session, .. } => Some(session),
            ReplyHandler::Recovery(step) | ReplyHandler::SwimResults { step, .. } => {
                Some(&step.session)
            }
            ReplyHandler::Generic { .. } => None,
        }
    }
}

impl fmt::Display for ReplyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyHandler::NewSession { session, attempt } => write!(
                f,
                "NewSession for {} (attempt {})",
                session.primary_spid(),
                attempt
            ),
            ReplyHandler::AssociationConnect {
                session, region, ..
            } => write!(
                f,
                "AssociationConnect for {} region {}",
                session.primary_spid(),
                region
            ),
            ReplyHandler::Recovery(step) => write!(f, "Recovery for {}", step),
            ReplyHandler::SwimResults { step, action_id } => {
                write!(f, "SwimProcessingRecoveryResults {} for {}", action_id, step)
            }
            ReplyHandler::RecoveryComplete {
                session, region, ..
            } => write!(
                f,
                "RecoveryComplete for {} region {}",
                session.primary_spid(),
                region
            ),
            ReplyHandler::Generic {
                spid, message_key, ..
            } => write!(f, "request {} for {}", message_key, spid),
        }
    }
}

impl NpacAdapter {
    /// Continue the request `handler` was waiting on
    pub(crate) async fn dispatch(&self, handler: ReplyHandler, outcome: Outcome) {
        debug!("Dispatching {} to {}", outcome_kind(&outcome), handler);

        let session_invalid = outcome
            .message()
            .map(Notification::is_session_invalid)
            .unwrap_or(false);
        if session_invalid {
            warn!("Peer reports session invalid while handling {}", handler);
            let session = match &handler {
                ReplyHandler::Generic { spid, .. } => self.registry().for_customer(spid),
                other => other.session().cloned(),
            };
            if matches!(handler, ReplyHandler::Generic { .. }) {
                self.on_generic(handler, outcome).await;
            }
            if let Some(session) = session {
                self.reinitialize(&session);
            }
            return;
        }

        match handler {
            ReplyHandler::NewSession { session, attempt } => {
                self.on_new_session(session, attempt, outcome).await
            }
            ReplyHandler::AssociationConnect {
                session,
                region,
                generation,
            } => {
                self.on_association(session, region, generation, outcome)
                    .await
            }
            ReplyHandler::Recovery(step) => match outcome {
                Outcome::Reply(reply) => self.on_recovery_reply(step, reply).await,
                Outcome::Error(error) => self.on_recovery_error(step, error).await,
                Outcome::Timeout => {
                    info!("Recovery request timed out; resending: {}", step);
                    self.send_recovery_window(step).await;
                }
            },
            ReplyHandler::SwimResults { step, action_id } => match outcome {
                Outcome::Reply(reply) | Outcome::Error(reply) => {
                    self.on_swim_results_reply(step, action_id, reply).await
                }
                Outcome::Timeout => {
                    info!("SWIM confirmation {} timed out; resending", action_id);
                    self.resend_swim_results(step, action_id).await;
                }
            },
            ReplyHandler::RecoveryComplete {
                session,
                region,
                generation,
            } => {
                self.on_recovery_complete(session, region, generation, outcome)
                    .await
            }
            handler @ ReplyHandler::Generic { .. } => self.on_generic(handler, outcome).await,
        }
    }

    async fn on_new_session(&self, session: Arc<Session>, attempt: u64, outcome: Outcome) {
        if !session.finish_open(attempt) {
            debug!(
                "Ignoring outcome of superseded NewSession attempt {} for {}",
                attempt,
                session.primary_spid()
            );
            return;
        }

        let retry_interval = self.config().retry_interval;
        let session_id = match &outcome {
            Outcome::Reply(reply) if reply.is_success() => reply.session_id.clone(),
            _ => None,
        };

        let Some(session_id) = session_id else {
            match outcome.message() {
                Some(message) => warn!(
                    "NewSession for {} failed (status {:?}, {}); retrying in {:?}",
                    session.primary_spid(),
                    message.status().map(ReplyStatus::as_str),
                    message.error_summary(),
                    retry_interval
                ),
                None => warn!(
                    "NewSession for {} timed out; retrying in {:?}",
                    session.primary_spid(),
                    retry_interval
                ),
            }
            self.schedule_retry(PendingRetry::NewSession { session }, retry_interval);
            return;
        };

        session.set_session_id(session_id);
        for region in Region::all() {
            if !session.spids_for_region(region).is_empty() {
                continue;
            }
            if let Err(e) = session.transition(
                region,
                &[AssociationState::Down],
                AssociationState::NotRequired,
            ) {
                debug!("Region {} left as is: {}", region, e);
            }
        }
        info!("Session opened: {}", session);
        self.connect_next_region(&session).await;
    }

    async fn on_association(
        &self,
        session: Arc<Session>,
        region: Region,
        generation: u64,
        outcome: Outcome,
    ) {
        if session.generation(region) != generation {
            debug!(
                "Ignoring stale association outcome for {} region {}",
                session.primary_spid(),
                region
            );
            return;
        }

        let connected = matches!(
            &outcome,
            Outcome::Reply(reply)
                if matches!(reply.status(), Some(ReplyStatus::Success) | Some(ReplyStatus::Connected))
        );
        if !connected {
            match outcome.message() {
                Some(message) => warn!(
                    "Association for {} region {} rejected (status {:?}, {})",
                    session.primary_spid(),
                    region,
                    message.status().map(ReplyStatus::as_str),
                    message.error_summary()
                ),
                None => warn!(
                    "Association for {} region {} timed out",
                    session.primary_spid(),
                    region
                ),
            }
            self.retry_association(&session, region, self.config().retry_interval);
            return;
        }

        match session.transition(
            region,
            &[AssociationState::WaitingForReply],
            AssociationState::Connected,
        ) {
            Ok(_) => self.start_recovery(session, region).await,
            Err(e) => warn!(
                "Association reply for {} region {} ignored: {}",
                session.primary_spid(),
                region,
                e
            ),
        }
    }

    async fn on_recovery_complete(
        &self,
        session: Arc<Session>,
        region: Region,
        generation: u64,
        outcome: Outcome,
    ) {
        if session.generation(region) != generation {
            debug!(
                "Ignoring stale RecoveryComplete outcome for {} region {}",
                session.primary_spid(),
                region
            );
            return;
        }

        let succeeded = matches!(&outcome, Outcome::Reply(reply) if reply.is_success());
        if !succeeded {
            warn!(
                "RecoveryComplete for {} region {} failed ({}); reconnecting",
                session.primary_spid(),
                region,
                outcome
                    .message()
                    .map(Notification::error_summary)
                    .unwrap_or_else(|| "timeout".to_string())
            );
            self.retry_association(&session, region, self.config().retry_interval);
            return;
        }

        if let Err(e) = session.transition(
            region,
            &[AssociationState::Recovering],
            AssociationState::Connected,
        ) {
            warn!("RecoveryComplete reply ignored: {}", e);
            return;
        }
        if let Err(e) = self
            .storage()
            .region_recovery
            .mark_ready(region, &self.config().connectivity_key)
            .await
        {
            error!("Could not mark region {} recovered: {}", region, e);
        }
        info!(
            "Region {} ({}) of {} is connected",
            region,
            region.label(),
            session.primary_spid()
        );
        self.connect_next_region(&session).await;
    }

    async fn on_generic(&self, handler: ReplyHandler, outcome: Outcome) {
        let ReplyHandler::Generic {
            spid,
            message_key,
            region,
        } = handler
        else {
            return;
        };

        let status = match &outcome {
            Outcome::Timeout => {
                warn!("No reply for request {} of {}; marking for retry", message_key, spid);
                RequestStatus::Retry
            }
            Outcome::Reply(message) | Outcome::Error(message) => {
                let is_error = matches!(outcome, Outcome::Error(_));
                let requeue = message.is_session_invalid()
                    || message.is_association_in_recovery()
                    || message.is_region_not_associated();
                if requeue {
                    let reason = match message.error_summary() {
                        summary if summary.is_empty() => message
                            .status()
                            .map(|s| s.as_str().to_string())
                            .unwrap_or_default(),
                        summary => summary,
                    };
                    warn!(
                        "Request {} of {} rejected ({}); will resend after recovery",
                        message_key, spid, reason
                    );
                    if let Some(region) = region {
                        if let Err(e) = self
                            .storage()
                            .region_recovery
                            .mark_awaiting(region, &self.config().connectivity_key)
                            .await
                        {
                            error!("Could not flag region {} for recovery: {}", region, e);
                        }
                    }
                    RequestStatus::FailedForResend { reason }
                } else if is_error {
                    warn!(
                        "Gateway error for request {} of {}: {}",
                        message_key,
                        spid,
                        message.error_summary()
                    );
                    self.forward(message).await;
                    RequestStatus::FailedForResend {
                        reason: message.error_summary(),
                    }
                } else {
                    self.forward(message).await;
                    RequestStatus::Succeeded
                }
            }
        };

        if let Err(e) = self.storage().requests.record(&message_key, status).await {
            error!("Could not record status of request {}: {}", message_key, e);
        }
    }
}

fn outcome_kind(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Reply(_) => "reply",
        Outcome::Error(_) => "error",
        Outcome::Timeout => "timeout",
    }
}
