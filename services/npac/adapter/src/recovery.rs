//! Paginated recovery of a freshly connected region.
//!
//! After an association connects, the region is walked SPID by SPID in bounded
//! time windows, from each SPID's last stored notification time up to the
//! moment the association came up. Download and SWIM recovery run the network
//! data and service-provider data phases first; every mode ends with the
//! notification phase and a RecoveryComplete request. A [`RecoveryStep`] is the
//! whole position in that walk and travels with the request it produced.

use chrono::{DateTime, Utc};
use npac_protocol::{
    DownloadTarget, GatewayRequest, InvokeId, Notification, RecoveryMode, Region, ReplyStatus,
    TimeRange,
};
use npac_session::{AssociationState, Session};
use npac_storage::{CursorKey, NotificationTimeKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::adapter::NpacAdapter;
use crate::config::MIN_RECOVERY_INTERVAL;
use crate::handler::ReplyHandler;
use crate::retry::PendingRetry;

/// Data class a recovery phase catches up on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    /// Network data download
    NetworkData,
    /// Service provider data download
    ServiceProvData,
    /// Notification recovery
    Notifications,
}

impl RecoveryPhase {
    /// Phases run for a mode, in order
    pub fn sequence(mode: RecoveryMode) -> &'static [RecoveryPhase] {
        match mode {
            RecoveryMode::TimeBased => &[RecoveryPhase::Notifications],
            RecoveryMode::Download | RecoveryMode::Swim => &[
                RecoveryPhase::NetworkData,
                RecoveryPhase::ServiceProvData,
                RecoveryPhase::Notifications,
            ],
        }
    }

    /// Cursor the phase reads and advances
    pub fn time_kind(self) -> NotificationTimeKind {
        match self {
            RecoveryPhase::NetworkData => NotificationTimeKind::Network,
            RecoveryPhase::ServiceProvData => NotificationTimeKind::ServiceProvider,
            RecoveryPhase::Notifications => NotificationTimeKind::Default,
        }
    }

    /// Download request target, for download phases
    pub fn download_target(self) -> Option<DownloadTarget> {
        match self {
            RecoveryPhase::NetworkData => Some(DownloadTarget::NetworkData),
            RecoveryPhase::ServiceProvData => Some(DownloadTarget::ServiceProvData),
            RecoveryPhase::Notifications => None,
        }
    }
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryPhase::NetworkData => f.write_str("network data"),
            RecoveryPhase::ServiceProvData => f.write_str("service provider data"),
            RecoveryPhase::Notifications => f.write_str("notifications"),
        }
    }
}

fn to_chrono(interval: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(interval.as_millis()).unwrap_or(i64::MAX))
}

/// Window following `cursor`, or `None` once the cursor reached `complete`.
///
/// Windows start one second after the cursor and end `interval` later, clipped
/// to `complete`. A window would start at or past `complete` counts as done.
/// Comparison is at second granularity, the wire resolution.
pub fn next_window(
    cursor: DateTime<Utc>,
    interval: Duration,
    complete: DateTime<Utc>,
) -> Option<TimeRange> {
    let start = cursor + chrono::Duration::seconds(1);
    if start.timestamp() >= complete.timestamp() {
        return None;
    }
    let stop = std::cmp::min(cursor + to_chrono(interval), complete);
    Some(TimeRange { start, stop })
}

/// Half of `interval`, or `None` when that falls under the smallest window
pub fn halve(interval: Duration) -> Option<Duration> {
    let half = interval / 2;
    (half >= MIN_RECOVERY_INTERVAL).then_some(half)
}

/// Position of one region's recovery
#[derive(Debug, Clone)]
pub struct RecoveryStep {
    /// Owning session
    pub session: Arc<Session>,
    /// Region being recovered
    pub region: Region,
    /// Strategy
    pub mode: RecoveryMode,
    /// Current phase
    pub phase: RecoveryPhase,
    /// SPIDs that need the region, in registration order
    pub spids: Vec<String>,
    /// Index of the SPID being recovered
    pub spid_index: usize,
    /// Recovery ends at this time
    pub recovery_complete_time: DateTime<Utc>,
    /// Configured window width
    pub window_interval: Duration,
    /// Window width in use; narrowed on rejection, restored per SPID
    pub interval: Duration,
    /// Last time recovered for the current SPID; loaded lazily
    pub cursor: Option<DateTime<Utc>>,
    /// Window of the request in flight
    pub window: Option<TimeRange>,
    /// SWIM continuation token
    pub swim_action_id: Option<String>,
    /// Region generation when recovery started
    pub generation: u64,
}

impl RecoveryStep {
    /// Start of recovery for `region`, at the first SPID of the mode's first phase
    pub fn new(
        session: Arc<Session>,
        region: Region,
        mode: RecoveryMode,
        recovery_complete_time: DateTime<Utc>,
        window_interval: Duration,
        generation: u64,
    ) -> Self {
        let spids = session.spids_for_region(region);
        Self {
            session,
            region,
            mode,
            phase: RecoveryPhase::sequence(mode)[0],
            spids,
            spid_index: 0,
            recovery_complete_time,
            window_interval,
            interval: window_interval,
            cursor: None,
            window: None,
            swim_action_id: None,
            generation,
        }
    }

    /// SPID being recovered, if any remain in this phase
    pub fn current_spid(&self) -> Option<&str> {
        self.spids.get(self.spid_index).map(String::as_str)
    }

    /// Key of the current SPID's cursor
    pub fn cursor_key(&self) -> Option<CursorKey> {
        self.current_spid()
            .map(|spid| CursorKey::new(spid, self.region, self.phase.time_kind()))
    }

    /// Move on to the next SPID
    pub fn next_spid(&mut self) {
        self.spid_index += 1;
        self.reset_position();
    }

    /// Move on to the next phase; false when every phase is done
    pub fn next_phase(&mut self) -> bool {
        let phases = RecoveryPhase::sequence(self.mode);
        let next = phases
            .iter()
            .position(|phase| *phase == self.phase)
            .and_then(|index| phases.get(index + 1));
        match next {
            Some(phase) => {
                self.phase = *phase;
                self.spid_index = 0;
                self.reset_position();
                true
            }
            None => false,
        }
    }

    fn reset_position(&mut self) {
        self.cursor = None;
        self.window = None;
        self.swim_action_id = None;
        self.interval = self.window_interval;
    }

    /// Whether the region is still in the recovery this step belongs to
    pub fn is_current(&self) -> bool {
        self.session.generation(self.region) == self.generation
            && self.session.is_association(self.region, AssociationState::Recovering)
    }

    /// Request for the window in flight
    pub fn request(&self, invoke_id: InvokeId, now: DateTime<Utc>) -> Option<GatewayRequest> {
        let spid = self.current_spid()?;
        let session_id = self.session.session_id();
        let request = match self.phase.download_target() {
            Some(target) => GatewayRequest::download_recovery(
                &session_id,
                invoke_id,
                self.region,
                spid,
                target,
                self.window,
                self.swim_action_id.clone(),
                now,
            ),
            None => GatewayRequest::recovery(
                &session_id,
                invoke_id,
                self.region,
                spid,
                self.window,
                self.swim_action_id.clone(),
                now,
            ),
        };
        Some(request)
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} region {} {} SPID [{}]",
            self.session.primary_spid(),
            self.region,
            self.phase,
            self.current_spid().unwrap_or("-")
        )?;
        if let Some(window) = &self.window {
            write!(f, " window {}", window)?;
        }
        Ok(())
    }
}

impl NpacAdapter {
    /// Put a connected region into recovery and send its first request
    pub(crate) async fn start_recovery(&self, session: Arc<Session>, region: Region) {
        let event = session.set_association_state(region, AssociationState::Recovering);
        let mode = match self.storage().region_recovery.recovery_mode(region).await {
            Ok(mode) => mode,
            Err(e) => {
                warn!(
                    "Could not read recovery mode for region {}, using time-based: {}",
                    region, e
                );
                RecoveryMode::default()
            }
        };
        let step = RecoveryStep::new(
            session,
            region,
            mode,
            self.now(),
            self.config().recovery_window,
            event.generation,
        );
        info!(
            "Starting {:?} recovery for session {} region {} ({} SPIDs) up to {}",
            mode,
            step.session.primary_spid(),
            region,
            step.spids.len(),
            npac_protocol::timestamp::format(&step.recovery_complete_time)
        );
        self.drive_recovery(step).await;
    }

    /// Find the next window to request, moving across SPIDs and phases
    pub(crate) async fn drive_recovery(&self, mut step: RecoveryStep) {
        loop {
            if !step.is_current() {
                info!("Recovery aborted, association moved: {}", step);
                return;
            }

            let Some(key) = step.cursor_key() else {
                if step.next_phase() {
                    debug!("Recovery moving to {} phase: {}", step.phase, step);
                    continue;
                }
                let RecoveryStep {
                    session,
                    region,
                    generation,
                    ..
                } = step;
                self.send_recovery_complete(session, region, generation).await;
                return;
            };

            let cursor = match step.cursor {
                Some(cursor) => cursor,
                None => match self.storage().notification_times.get(&key).await {
                    Ok(Some(time)) => {
                        let padded = time - to_chrono(self.config().recovery_padding);
                        step.cursor = Some(padded);
                        padded
                    }
                    Ok(None) => {
                        error!(
                            "No last notification time for {}; skipping this SPID in region {}",
                            key, step.region
                        );
                        step.next_spid();
                        continue;
                    }
                    Err(e) => {
                        error!(
                            "Could not read last notification time for {}: {}; skipping",
                            key, e
                        );
                        step.next_spid();
                        continue;
                    }
                },
            };

            match next_window(cursor, step.interval, step.recovery_complete_time) {
                Some(window) => {
                    step.window = Some(window);
                    self.send_recovery_window(step).await;
                    return;
                }
                None => {
                    debug!("SPID recovered up to the completion time: {}", step);
                    step.next_spid();
                }
            }
        }
    }

    /// Send (or re-send) the window in flight
    pub(crate) async fn send_recovery_window(&self, step: RecoveryStep) {
        if !step.is_current() {
            info!("Recovery aborted before send, association moved: {}", step);
            return;
        }
        if step.window.is_none() {
            warn!("No recovery window to send: {}", step);
            return;
        }

        let session = step.session.clone();
        let region = step.region;
        let now = self.now();
        debug!("Sending recovery request: {}", step);
        let template = step.clone();
        let ack = self
            .send_registered(ReplyHandler::Recovery(step), move |invoke_id| {
                template.request(invoke_id, now)
            })
            .await;
        if !ack.is_ack() {
            self.retry_association(&session, region, self.config().retry_interval);
        }
    }

    async fn send_swim_results(&self, step: RecoveryStep, action_id: String) {
        if !step.is_current() {
            return;
        }
        let session = step.session.clone();
        let region = step.region;
        let session_id = session.session_id();
        let spid = step.current_spid().unwrap_or_default().to_string();
        let now = self.now();
        debug!("Confirming SWIM action {} for {}", action_id, step);

        let action = action_id.clone();
        let ack = self
            .send_registered(
                ReplyHandler::SwimResults { step, action_id },
                move |invoke_id| {
                    Some(GatewayRequest::swim_processing_results(
                        &session_id,
                        invoke_id,
                        region,
                        &spid,
                        &action,
                        now,
                    ))
                },
            )
            .await;
        if !ack.is_ack() {
            self.retry_association(&session, region, self.config().retry_interval);
        }
    }

    async fn store_cursor(&self, step: &RecoveryStep, time: DateTime<Utc>) {
        let Some(key) = step.cursor_key() else {
            return;
        };
        if let Err(e) = self.storage().notification_times.advance(&key, time).await {
            error!("Could not store last notification time for {}: {}", key, e);
        }
    }

    /// Reply to a recovery or download request
    pub(crate) async fn on_recovery_reply(&self, mut step: RecoveryStep, reply: Notification) {
        if !step.is_current() {
            info!("Ignoring reply for aborted recovery: {}", step);
            return;
        }

        match reply.status() {
            Some(ReplyStatus::Success) | Some(ReplyStatus::NoDataSelected) => {
                if reply.is_success() {
                    self.forward(&reply).await;
                }
                match reply.action_id.clone() {
                    Some(action_id) if step.mode == RecoveryMode::Swim => {
                        self.send_swim_results(step, action_id).await;
                    }
                    _ => {
                        if let Some(window) = step.window {
                            self.store_cursor(&step, window.stop).await;
                            step.cursor = Some(window.stop);
                        }
                        step.window = None;
                        step.swim_action_id = None;
                        self.drive_recovery(step).await;
                    }
                }
            }
            Some(ReplyStatus::SwimMoreData) => {
                self.forward(&reply).await;
                step.swim_action_id = reply.action_id.clone();
                debug!("More data pending for {}", step);
                self.send_recovery_window(step).await;
            }
            Some(status) if status.needs_smaller_window() => match halve(step.interval) {
                Some(interval) => {
                    info!(
                        "Peer rejected window ({}), narrowing from {:?} to {:?}: {}",
                        status, step.interval, interval, step
                    );
                    step.interval = interval;
                    step.window = None;
                    self.drive_recovery(step).await;
                }
                None => {
                    error!(
                        "Window cannot be narrowed below {:?}; skipping SPID: {}",
                        MIN_RECOVERY_INTERVAL, step
                    );
                    step.next_spid();
                    self.drive_recovery(step).await;
                }
            },
            status => {
                warn!(
                    "Recovery request failed (status {:?}, {}); retrying in {:?}: {}",
                    status.map(ReplyStatus::as_str),
                    reply.error_summary(),
                    self.config().retry_interval,
                    step
                );
                self.schedule_retry(PendingRetry::Recovery(step), self.config().retry_interval);
            }
        }
    }

    /// Gateway error for a recovery or download request
    pub(crate) async fn on_recovery_error(&self, step: RecoveryStep, error: Notification) {
        if !step.is_current() {
            return;
        }
        warn!(
            "Gateway error for recovery request ({}); retrying in {:?}: {}",
            error.error_summary(),
            self.config().retry_interval,
            step
        );
        self.schedule_retry(PendingRetry::Recovery(step), self.config().retry_interval);
    }

    /// Reply to a SWIM result confirmation
    pub(crate) async fn on_swim_results_reply(
        &self,
        mut step: RecoveryStep,
        action_id: String,
        reply: Notification,
    ) {
        if !step.is_current() {
            info!("Ignoring SWIM reply for aborted recovery: {}", step);
            return;
        }

        match (reply.is_success(), reply.stop_time) {
            (_, Some(stop_time)) => {
                // the peer delivered up to stop_time; continue this SPID from there
                self.store_cursor(&step, stop_time).await;
                step.cursor = Some(stop_time);
                step.window = None;
                step.swim_action_id = None;
                self.drive_recovery(step).await;
            }
            (true, None) => {
                if let Some(window) = step.window {
                    self.store_cursor(&step, window.stop).await;
                }
                step.next_spid();
                self.drive_recovery(step).await;
            }
            (false, None) => {
                warn!(
                    "SWIM confirmation of action {} failed ({}); retrying in {:?}",
                    action_id,
                    reply.error_summary(),
                    self.config().retry_interval
                );
                self.schedule_retry(
                    PendingRetry::SwimResults { step, action_id },
                    self.config().retry_interval,
                );
            }
        }
    }

    /// Resend a SWIM confirmation
    pub(crate) async fn resend_swim_results(&self, step: RecoveryStep, action_id: String) {
        self.send_swim_results(step, action_id).await;
    }

    /// Ask the peer to finish recovery of the region
    pub(crate) async fn send_recovery_complete(
        &self,
        session: Arc<Session>,
        region: Region,
        generation: u64,
    ) {
        info!(
            "Recovery finished for session {} region {}; sending RecoveryComplete",
            session.primary_spid(),
            region
        );
        let session_id = session.session_id();
        let primary = session.primary_spid().to_string();
        let now = self.now();
        let ack = self
            .send_registered(
                ReplyHandler::RecoveryComplete {
                    session: session.clone(),
                    region,
                    generation,
                },
                move |invoke_id| {
                    Some(GatewayRequest::recovery_complete(
                        &session_id,
                        invoke_id,
                        region,
                        &primary,
                        now,
                    ))
                },
            )
            .await;
        if !ack.is_ack() {
            self.retry_association(&session, region, self.config().retry_interval);
        }
    }
}
