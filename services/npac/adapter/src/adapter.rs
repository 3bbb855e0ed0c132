//! The NPAC adapter orchestrator.
//!
//! [`NpacAdapter`] owns the reply correlator and the work queue and drives
//! every session through NewSession, sequential region bring-up, recovery,
//! keep-alive and release. It is constructed once per process and shared by
//! cloning; all clones drive the same state.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use npac_protocol::{
    Ack, ErrorCode, GatewayRequest, InvokeId, Notification, Region, ReplyStatus,
    UNINITIALIZED_SESSION_ID,
};
use npac_session::{AssociationState, Session, SessionRegistry};
use npac_storage::{CursorKey, NotificationTimeKind, RequestStatus, Storage, StoreError};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AdapterConfig;
use crate::correlator::{Expired, ReplyCorrelator};
use crate::handler::{Outcome, ReplyHandler};
use crate::listener::{AssociationEventNotifier, AssociationEvents};
use crate::retry::PendingRetry;
use crate::transport::{DriverChain, GatewayClient};
use crate::work_queue::{WorkQueue, WorkQueueStats};

struct Inner {
    config: AdapterConfig,
    registry: Arc<SessionRegistry>,
    storage: Storage,
    client: Arc<dyn GatewayClient>,
    driver: Arc<dyn DriverChain>,
    clock: Arc<dyn Clock>,
    correlator: ReplyCorrelator<ReplyHandler>,
    queue: WorkQueue,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

/// Session, association and recovery engine between the server and the gateway
#[derive(Clone)]
pub struct NpacAdapter {
    inner: Arc<Inner>,
}

impl NpacAdapter {
    /// Create the adapter for the sessions in `registry`.
    ///
    /// Must be called inside a tokio runtime: the resend timers of the
    /// correlator are watched by a background task.
    pub fn new(
        config: AdapterConfig,
        registry: Arc<SessionRegistry>,
        storage: Storage,
        client: Arc<dyn GatewayClient>,
        driver: Arc<dyn DriverChain>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (correlator, expired_rx) = ReplyCorrelator::new();
        let queue = WorkQueue::new(config.work_queue.clone());

        let log = Arc::new(AssociationEventNotifier::logging());
        for session in registry.sessions() {
            session.subscribe(log.clone());
        }

        let adapter = Self {
            inner: Arc::new(Inner {
                config,
                registry,
                storage,
                client,
                driver,
                clock,
                correlator,
                queue,
                expiry_task: Mutex::new(None),
            }),
        };
        adapter.start_expiry_task(expired_rx);
        adapter
    }

    fn start_expiry_task(&self, mut expired_rx: mpsc::UnboundedReceiver<Expired<ReplyHandler>>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(expired) = expired_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let adapter = NpacAdapter { inner };
                info!(
                    "No reply for invoke ID {} ({})",
                    expired.invoke_id, expired.handler
                );
                adapter.continue_with(expired.handler, Outcome::Timeout);
            }
            debug!("Reply timeout watcher stopped");
        });
        *self
            .inner
            .expiry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Adapter settings
    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// Sessions served
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Durable state
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Current time from the adapter's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Number of requests awaiting a reply
    pub fn outstanding_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Whether a reply for `invoke_id` is awaited
    pub fn is_awaiting(&self, invoke_id: &InvokeId) -> bool {
        self.inner.correlator.exists(invoke_id)
    }

    /// Work queue counters
    pub fn queue_stats(&self) -> WorkQueueStats {
        self.inner.queue.stats()
    }

    /// Stream of association transitions of every session
    pub fn association_events(&self) -> AssociationEvents {
        AssociationEvents::subscribe(self.registry().sessions().iter())
    }

    fn continue_with(&self, handler: ReplyHandler, outcome: Outcome) {
        let adapter = self.clone();
        let label = handler.to_string();
        self.inner.queue.enqueue(label, async move {
            adapter.dispatch(handler, outcome).await;
            Ok(())
        });
    }

    pub(crate) async fn next_invoke_id(&self) -> Result<InvokeId, StoreError> {
        self.storage()
            .invoke_ids
            .next_value(&self.config().invoke_id_sequence)
            .await
            .map(InvokeId::from)
    }

    /// Register `handler` under a fresh invoke ID, then send the request built for it
    pub(crate) async fn send_registered<F>(&self, handler: ReplyHandler, build: F) -> Ack
    where
        F: FnOnce(InvokeId) -> Option<GatewayRequest> + Send,
    {
        let invoke_id = match self.next_invoke_id().await {
            Ok(invoke_id) => invoke_id,
            Err(e) => {
                error!("Could not get invoke ID for {}: {}", handler, e);
                return Ack::Nack;
            }
        };
        let Some(request) = build(invoke_id.clone()) else {
            warn!("Nothing to send for {}", handler);
            return Ack::Nack;
        };

        // the reply may arrive before send() returns
        let description = handler.to_string();
        if !self
            .inner
            .correlator
            .add(invoke_id.clone(), handler, self.config().resend_timeout)
        {
            return Ack::Nack;
        }

        let ack = self.inner.client.send(&request).await;
        if ack.is_ack() {
            debug!("Sent {}", request);
        } else {
            self.inner.correlator.cancel(&invoke_id);
            warn!("Gateway did not accept {} ({})", description, request);
        }
        ack
    }

    /// Queue `retry` to run after `delay`
    pub(crate) fn schedule_retry(&self, retry: PendingRetry, delay: Duration) {
        let label = retry.to_string();
        debug!("Scheduling {} in {:?}", label, delay);
        let task = self.clone().run_retry(retry);
        self.inner.queue.enqueue_after(delay, label, task);
    }

    fn run_retry(self, retry: PendingRetry) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            match retry {
                PendingRetry::NewSession { session } => self.send_new_session(&session).await,
                PendingRetry::AssociationConnect { session, region } => {
                    self.connect_region(session, region, &[AssociationState::Retry])
                        .await
                }
                PendingRetry::Recovery(step) => {
                    if step.window.is_some() {
                        self.send_recovery_window(step).await
                    } else {
                        self.drive_recovery(step).await
                    }
                }
                PendingRetry::SwimResults { step, action_id } => {
                    self.resend_swim_results(step, action_id).await
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Mark `region` RETRY and reconnect it after `delay`
    pub(crate) fn retry_association(&self, session: &Arc<Session>, region: Region, delay: Duration) {
        session.set_association_state(region, AssociationState::Retry);
        warn!(
            "Association for {} region {} ({}) will be retried in {:?}",
            session.primary_spid(),
            region,
            region.label(),
            delay
        );
        self.schedule_retry(
            PendingRetry::AssociationConnect {
                session: session.clone(),
                region,
            },
            delay,
        );
    }

    /// Hand a notification to the driver chain; false when it failed
    pub(crate) async fn forward(&self, notification: &Notification) -> bool {
        match self.inner.driver.process(notification).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Driver chain failed to process {} (invoke ID {:?}): {:#}",
                    notification.message_type, notification.invoke_id, e
                );
                false
            }
        }
    }

    fn session_for(&self, notification: &Notification) -> Option<Arc<Session>> {
        notification
            .session_id
            .as_deref()
            .and_then(|session_id| self.registry().by_session_id(session_id))
    }

    /// Open every configured session
    pub async fn initialize(&self) {
        let sessions = self.registry().sessions();
        if sessions.is_empty() {
            warn!("No sessions configured; the adapter has nothing to connect");
            return;
        }
        info!("Initializing {} NPAC sessions", sessions.len());
        for session in sessions {
            self.send_new_session(&session).await;
        }
    }

    /// Send NewSession for `session` unless it is alive or already opening
    pub async fn send_new_session(&self, session: &Arc<Session>) {
        let Some(attempt) = session.begin_open() else {
            debug!(
                "Session {} is alive or already opening",
                session.primary_spid()
            );
            return;
        };

        let primary = session.primary_spid().to_string();
        let user_id = self.config().user_id.clone();
        let now = self.now();
        info!("Sending NewSession for primary SPID {}", primary);
        let ack = self
            .send_registered(
                ReplyHandler::NewSession {
                    session: session.clone(),
                    attempt,
                },
                move |invoke_id| {
                    Some(GatewayRequest::new_session(&primary, invoke_id, &user_id, now))
                },
            )
            .await;
        if !ack.is_ack() && session.finish_open(attempt) {
            self.schedule_retry(
                PendingRetry::NewSession {
                    session: session.clone(),
                },
                self.config().retry_interval,
            );
        }
    }

    /// Connect the lowest region still DOWN
    pub(crate) async fn connect_next_region(&self, session: &Arc<Session>) {
        let next = Region::all().find(|region| session.is_association(*region, AssociationState::Down));
        match next {
            Some(region) => {
                self.connect_region(session.clone(), region, &[AssociationState::Down])
                    .await
            }
            None => info!("Region bring-up finished: {}", session),
        }
    }

    /// Send an association connect for `region` if it is in one of `from`
    pub(crate) async fn connect_region(
        &self,
        session: Arc<Session>,
        region: Region,
        from: &[AssociationState],
    ) {
        if !session.is_alive() {
            debug!(
                "Session {} not alive; association for region {} deferred",
                session.primary_spid(),
                region
            );
            return;
        }
        let event = match session.transition(region, from, AssociationState::WaitingForReply) {
            Ok(event) => event,
            Err(e) => {
                debug!("Association connect for {} skipped: {}", session.primary_spid(), e);
                return;
            }
        };

        let session_id = session.session_id();
        let primary = session.primary_spid().to_string();
        let now = self.now();
        info!(
            "Connecting association for {} region {} ({})",
            primary,
            region,
            region.label()
        );
        let ack = self
            .send_registered(
                ReplyHandler::AssociationConnect {
                    session: session.clone(),
                    region,
                    generation: event.generation,
                },
                move |invoke_id| {
                    Some(GatewayRequest::association_connect(
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

    /// Reset `session` and open it again
    pub fn reinitialize(&self, session: &Arc<Session>) {
        warn!("Reinitializing session: {}", session);
        session.reset();
        self.schedule_retry(
            PendingRetry::NewSession {
                session: session.clone(),
            },
            Duration::ZERO,
        );
    }

    /// Route a reply to the handler awaiting its invoke ID
    pub async fn handle_reply(&self, reply: Notification) -> Ack {
        self.claim(reply, false)
    }

    /// Route a GatewayError to the handler awaiting its invoke ID
    pub async fn handle_error(&self, error: Notification) -> Ack {
        self.claim(error, true)
    }

    fn claim(&self, message: Notification, is_error: bool) -> Ack {
        let Some(invoke_id) = message.invoke_id.clone() else {
            warn!("{} without invoke ID ignored", message.message_type);
            return Ack::Nack;
        };
        match self.inner.correlator.remove(&invoke_id) {
            Some(handler) => {
                debug!("{} for invoke ID {} claimed by {}", message.message_type, invoke_id, handler);
                let outcome = if is_error {
                    Outcome::Error(message)
                } else {
                    Outcome::Reply(message)
                };
                self.continue_with(handler, outcome);
                Ack::Ack
            }
            None => {
                warn!(
                    "No request awaiting {} with invoke ID {}",
                    message.message_type, invoke_id
                );
                Ack::Nack
            }
        }
    }

    /// Peer released a session: open it again
    pub async fn receive_release_session(&self, notification: &Notification) -> Ack {
        match self.session_for(notification) {
            Some(session) => {
                info!("Gateway released session {}", session.primary_spid());
                self.reinitialize(&session);
                Ack::Ack
            }
            None => {
                warn!(
                    "Release for unknown session {:?}",
                    notification.session_id
                );
                Ack::Nack
            }
        }
    }

    /// Check a gateway keep-alive; a sequence gap reinitializes the session
    pub async fn receive_keep_alive(&self, notification: &Notification) -> Ack {
        let Some(session) = self.session_for(notification) else {
            warn!(
                "Keep-alive for unknown session {:?}",
                notification.session_id
            );
            return Ack::Nack;
        };
        let Some(sequence) = notification.sequence_number else {
            warn!(
                "Keep-alive without sequence number for {}",
                session.primary_spid()
            );
            return Ack::Nack;
        };

        let expected = session.expected_keep_alive_sequence();
        let ack = session.keep_alive_received(sequence);
        if !ack.is_ack() {
            warn!(
                "Keep-alive sequence {} for {} does not match expected {}",
                sequence,
                session.primary_spid(),
                expected
            );
            self.reinitialize(&session);
        }
        ack
    }

    /// Send the next ClientKeepAlive on every live session
    pub async fn send_keep_alives(&self) {
        for session in self.registry().sessions() {
            if !session.is_alive() {
                continue;
            }
            let invoke_id = match self.next_invoke_id().await {
                Ok(invoke_id) => invoke_id,
                Err(e) => {
                    error!("Could not get invoke ID for keep-alive: {}", e);
                    continue;
                }
            };
            let request = GatewayRequest::keep_alive(
                &session.session_id(),
                invoke_id,
                session.primary_spid(),
                session.next_keep_alive_sequence(),
                self.now(),
            );
            if self.inner.client.send(&request).await.is_ack() {
                debug!("Sent {}", request);
            } else {
                warn!("Keep-alive for {} refused", session.primary_spid());
                self.reinitialize(&session);
            }
        }
    }

    /// React to a peer-initiated association status change
    pub async fn receive_association_status_notification(&self, notification: &Notification) -> Ack {
        info!(
            "Association status notification for session {:?} region {:?}: {:?} {}",
            notification.session_id,
            notification.region,
            notification.status().map(ReplyStatus::as_str),
            notification.error_summary()
        );

        let (status, error_code) = self.apply_status_change(notification).await;
        let reply = GatewayRequest::notification_reply(
            notification
                .session_id
                .as_deref()
                .unwrap_or(UNINITIALIZED_SESSION_ID),
            self.reply_invoke_id(notification).await,
            notification.region().ok(),
            notification.customer_id.as_deref().unwrap_or_default(),
            status.clone(),
            error_code,
            None,
            self.now(),
        );
        if !self.inner.client.send(&reply).await.is_ack() {
            warn!("Could not answer association status notification: {}", reply);
        }
        Ack::from_bool(status == ReplyStatus::Success)
    }

    async fn apply_status_change(&self, notification: &Notification) -> (ReplyStatus, Option<ErrorCode>) {
        let region = match notification.region() {
            Ok(region) => region,
            Err(e) => {
                error!("Invalid association status notification: {}", e);
                return (ReplyStatus::Failed, Some(ErrorCode::ProcessingFailure));
            }
        };
        if notification.status() == Some(&ReplyStatus::Connected) {
            debug!("Region {} reported connected", region);
            return (ReplyStatus::Success, None);
        }
        let Some(session) = self.session_for(notification) else {
            warn!(
                "Association status notification for unknown session {:?}",
                notification.session_id
            );
            return (ReplyStatus::SessionInvalid, None);
        };

        if let Err(e) = self
            .storage()
            .region_recovery
            .mark_awaiting(region, &self.config().connectivity_key)
            .await
        {
            error!("Could not flag region {} for recovery: {}", region, e);
            return (ReplyStatus::Failed, Some(ErrorCode::ProcessingFailure));
        }
        self.retry_association(&session, region, Duration::ZERO);
        (ReplyStatus::Success, None)
    }

    async fn reply_invoke_id(&self, notification: &Notification) -> InvokeId {
        if let Some(invoke_id) = &notification.invoke_id {
            return invoke_id.clone();
        }
        match self.next_invoke_id().await {
            Ok(invoke_id) => invoke_id,
            Err(e) => {
                error!("Could not get invoke ID for reply: {}", e);
                InvokeId::from(0)
            }
        }
    }

    /// Process an application notification and answer it
    pub async fn receive_application_notification(&self, notification: Notification) -> Ack {
        self.record_notification_time(&notification).await;

        if let Some(invoke_id) = &notification.invoke_id {
            if self.is_awaiting(invoke_id) {
                return self.handle_reply(notification).await;
            }
        }

        let processed = self.forward(&notification).await;
        let (status, error_code) = if processed {
            (ReplyStatus::Success, None)
        } else {
            (ReplyStatus::Failed, Some(ErrorCode::ProcessingFailure))
        };

        let message_type = &notification.message_type;
        let session_id = notification
            .session_id
            .as_deref()
            .unwrap_or(UNINITIALIZED_SESSION_ID);
        let customer = notification.customer_id.as_deref().unwrap_or_default();
        let reply = if message_type.is_network_notification() {
            Some(GatewayRequest::download_reply(
                session_id,
                self.reply_invoke_id(&notification).await,
                notification.region().ok(),
                customer,
                status,
                error_code,
                None,
                self.now(),
            ))
        } else if message_type.expects_notification_reply() {
            Some(GatewayRequest::notification_reply(
                session_id,
                self.reply_invoke_id(&notification).await,
                notification.region().ok(),
                customer,
                status,
                error_code,
                None,
                self.now(),
            ))
        } else {
            None
        };

        if let Some(reply) = reply {
            if !self.inner.client.send(&reply).await.is_ack() {
                warn!("Could not answer {}: {}", message_type, reply);
            }
        }
        Ack::from_bool(processed)
    }

    async fn record_notification_time(&self, notification: &Notification) {
        let Some(customer) = notification.customer_id.as_deref() else {
            return;
        };
        let Ok(region) = notification.region() else {
            return;
        };
        let kind = if notification.message_type.is_network_notification() {
            NotificationTimeKind::Network
        } else {
            NotificationTimeKind::Default
        };
        let key = CursorKey::new(customer, region, kind);
        let time = notification.timestamp.unwrap_or_else(|| self.now());
        if let Err(e) = self.storage().notification_times.advance(&key, time).await {
            error!("Could not store last notification time for {}: {}", key, e);
        }
    }

    /// Send an application request for a customer SPID
    pub async fn send(
        &self,
        spid: &str,
        message_key: &str,
        region: Option<Region>,
        payload: &str,
    ) -> Ack {
        let Some(session) = self.registry().for_customer(spid) else {
            warn!("No session serves SPID {}; request {} not sent", spid, message_key);
            return Ack::Nack;
        };
        if !session.is_alive() {
            warn!(
                "Session {} not alive; request {} not sent",
                session.primary_spid(),
                message_key
            );
            return Ack::Nack;
        }

        if let Err(e) = self
            .storage()
            .requests
            .record(message_key, RequestStatus::Sent)
            .await
        {
            error!("Could not record request {}: {}", message_key, e);
        }

        let session_id = session.session_id();
        let customer = spid.to_string();
        let key = message_key.to_string();
        let body = payload.to_string();
        let now = self.now();
        self.send_registered(
            ReplyHandler::Generic {
                spid: spid.to_string(),
                message_key: message_key.to_string(),
                region,
            },
            move |invoke_id| {
                Some(GatewayRequest::passthrough(
                    &session_id,
                    invoke_id,
                    region,
                    &customer,
                    &key,
                    &body,
                    now,
                ))
            },
        )
        .await
    }

    /// Release every live session and stop all background work
    pub async fn shutdown(&self) {
        info!("Shutting down NPAC adapter");
        for session in self.registry().sessions() {
            if !session.is_alive() {
                continue;
            }
            match self.next_invoke_id().await {
                Ok(invoke_id) => {
                    let request = GatewayRequest::release_session(
                        &session.session_id(),
                        invoke_id,
                        session.primary_spid(),
                        self.now(),
                    );
                    if !self.inner.client.send(&request).await.is_ack() {
                        warn!("Release of {} refused", session.primary_spid());
                    }
                }
                Err(e) => error!(
                    "Could not get invoke ID to release {}: {}",
                    session.primary_spid(),
                    e
                ),
            }
            session.reset();
        }

        let dropped = self.inner.correlator.clear();
        if dropped > 0 {
            info!("Dropped {} outstanding requests", dropped);
        }
        self.inner.queue.kill();
        if let Some(handle) = self
            .inner
            .expiry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl fmt::Debug for NpacAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpacAdapter")
            .field("sessions", &self.registry().len())
            .field("outstanding", &self.inner.correlator.len())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, harness_with, reply_to, wait_for, Harness};
    use chrono::TimeZone;
    use npac_protocol::{MessageType, RecoveryMode, RequestBody, TimeRange};
    use npac_storage::RecoveryStatus;

    fn region(index: u8) -> Region {
        Region::new(index).unwrap()
    }

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, second).unwrap()
    }

    async fn open_session(h: &Harness) -> Arc<Session> {
        h.adapter.initialize().await;
        let new_session = wait_for(&h.client, "NewSession", 1).await.remove(0);
        let reply = reply_to(MessageType::NewSessionReply, &new_session, ReplyStatus::Success)
            .with_session_id("42");
        assert_eq!(h.adapter.handle_reply(reply).await, Ack::Ack);
        h.registry.get("9999").unwrap()
    }

    fn window_of(request: &GatewayRequest) -> Option<TimeRange> {
        match &request.body {
            RequestBody::RecoveryRequest { time_range, .. }
            | RequestBody::DownloadRecoveryRequest { time_range, .. } => *time_range,
            _ => None,
        }
    }

    fn swim_action_of(request: &GatewayRequest) -> Option<String> {
        match &request.body {
            RequestBody::RecoveryRequest { swim_action_id, .. }
            | RequestBody::DownloadRecoveryRequest { swim_action_id, .. } => swim_action_id.clone(),
            _ => None,
        }
    }

    async fn set_cursor(
        h: &Harness,
        spid: &str,
        index: u8,
        kind: NotificationTimeKind,
        time: DateTime<Utc>,
    ) {
        h.storage
            .notification_times
            .set(&CursorKey::new(spid, region(index), kind), time)
            .await
            .unwrap();
    }

    async fn answer(
        h: &Harness,
        message_type: MessageType,
        request: &GatewayRequest,
        status: ReplyStatus,
    ) {
        let reply = reply_to(message_type, request, status);
        assert_eq!(h.adapter.handle_reply(reply).await, Ack::Ack);
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(condition());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_session_connects_only_required_region() {
        let h = harness(&[("9999", "1111", &[0])]);
        let session = open_session(&h).await;

        let connects = wait_for(&h.client, "AssociationConnect", 1).await;
        assert_eq!(h.client.of_kind("NewSession").len(), 1);
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].region(), Some(region(0)));
        assert_eq!(connects[0].header.session_id, "42");

        assert!(session.is_alive());
        for index in 1..8 {
            assert_eq!(
                session.association_state(region(index)),
                AssociationState::NotRequired
            );
        }
        assert_eq!(
            session.association_state(region(0)),
            AssociationState::WaitingForReply
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recovery_walks_three_windows_then_completes() {
        let h = harness(&[("9999", "1111", &[0])]);
        h.clock.set(at(3, 0, 0));
        h.storage
            .notification_times
            .set(
                &CursorKey::new("1111", region(0), NotificationTimeKind::Default),
                at(0, 0, 0),
            )
            .await
            .unwrap();

        let session = open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        h.adapter
            .handle_reply(reply_to(MessageType::AssociationReply, &connect, ReplyStatus::Success))
            .await;

        let mut stops = Vec::new();
        for n in 1..=3 {
            let request = wait_for(&h.client, "RecoveryRequest", n).await.remove(n - 1);
            assert_eq!(request.header.customer_id, "1111");
            let window = window_of(&request).unwrap();
            stops.push(window.stop);
            h.adapter
                .handle_reply(reply_to(MessageType::RecoveryReply, &request, ReplyStatus::Success))
                .await;
        }
        assert_eq!(stops, vec![at(1, 0, 0), at(2, 0, 0), at(3, 0, 0)]);

        let complete = wait_for(&h.client, "RecoveryCompleteRequest", 1).await.remove(0);
        assert_eq!(h.client.of_kind("RecoveryRequest").len(), 3);
        assert_eq!(h.driver.received().len(), 3);
        h.adapter
            .handle_reply(reply_to(
                MessageType::RecoveryCompleteReply,
                &complete,
                ReplyStatus::Success,
            ))
            .await;

        for _ in 0..200 {
            if session.is_association(region(0), AssociationState::Connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.association_state(region(0)), AssociationState::Connected);
        let cursor = h
            .storage
            .notification_times
            .get(&CursorKey::new("1111", region(0), NotificationTimeKind::Default))
            .await
            .unwrap();
        assert_eq!(cursor, Some(at(3, 0, 0)));
        // no other region needed connecting
        assert_eq!(h.client.of_kind("AssociationConnect").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_criteria_too_large_halves_window_from_same_start() {
        let h = harness(&[("9999", "1111", &[0])]);
        h.clock.set(at(3, 0, 0));
        h.storage
            .notification_times
            .set(
                &CursorKey::new("1111", region(0), NotificationTimeKind::Default),
                at(0, 0, 0),
            )
            .await
            .unwrap();

        open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        h.adapter
            .handle_reply(reply_to(MessageType::AssociationReply, &connect, ReplyStatus::Success))
            .await;

        let first = wait_for(&h.client, "RecoveryRequest", 1).await.remove(0);
        h.adapter
            .handle_reply(reply_to(
                MessageType::RecoveryReply,
                &first,
                ReplyStatus::CriteriaTooLarge,
            ))
            .await;

        let second = wait_for(&h.client, "RecoveryRequest", 2).await.remove(1);
        assert_eq!(
            window_of(&first).unwrap(),
            TimeRange { start: at(0, 0, 1), stop: at(1, 0, 0) }
        );
        assert_eq!(
            window_of(&second).unwrap(),
            TimeRange { start: at(0, 0, 1), stop: at(0, 30, 0) }
        );
        assert!(h.driver.received().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_mode_runs_network_then_service_provider_phases() {
        let h = harness(&[("9999", "1111", &[2])]);
        h.clock.set(at(1, 0, 0));
        h.storage
            .region_recovery
            .set_recovery_mode(region(2), RecoveryMode::Download)
            .await
            .unwrap();
        for kind in [
            NotificationTimeKind::Network,
            NotificationTimeKind::ServiceProvider,
        ] {
            h.storage
                .notification_times
                .set(&CursorKey::new("1111", region(2), kind), at(0, 0, 0))
                .await
                .unwrap();
        }

        open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        assert_eq!(connect.region(), Some(region(2)));
        h.adapter
            .handle_reply(reply_to(MessageType::AssociationReply, &connect, ReplyStatus::Connected))
            .await;

        let network = wait_for(&h.client, "DownloadRecoveryRequest", 1).await.remove(0);
        assert!(matches!(
            network.body,
            RequestBody::DownloadRecoveryRequest {
                target: npac_protocol::DownloadTarget::NetworkData,
                ..
            }
        ));
        h.adapter
            .handle_reply(reply_to(
                MessageType::DownloadRecoveryReply,
                &network,
                ReplyStatus::NoDataSelected,
            ))
            .await;

        let service = wait_for(&h.client, "DownloadRecoveryRequest", 2).await.remove(1);
        assert!(matches!(
            service.body,
            RequestBody::DownloadRecoveryRequest {
                target: npac_protocol::DownloadTarget::ServiceProvData,
                ..
            }
        ));
        h.adapter
            .handle_reply(reply_to(
                MessageType::DownloadRecoveryReply,
                &service,
                ReplyStatus::Success,
            ))
            .await;

        // no default cursor stored, so the notification phase skips the SPID
        wait_for(&h.client, "RecoveryCompleteRequest", 1).await;
        assert!(h.client.of_kind("RecoveryRequest").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_keep_alive_mismatch_reinitializes_session() {
        let h = harness(&[("9999", "1111", &[0])]);
        let session = open_session(&h).await;
        wait_for(&h.client, "AssociationConnect", 1).await;

        let keep_alive = Notification::new(MessageType::GatewayKeepAlive)
            .with_session_id("42")
            .with_sequence_number(1);
        assert_eq!(h.adapter.receive_keep_alive(&keep_alive).await, Ack::Ack);

        let gap = Notification::new(MessageType::GatewayKeepAlive)
            .with_session_id("42")
            .with_sequence_number(5);
        assert_eq!(h.adapter.receive_keep_alive(&gap).await, Ack::Nack);
        assert!(!session.is_alive());
        assert_eq!(session.association_state(region(0)), AssociationState::Down);

        // reinitialization opens the session again
        wait_for(&h.client, "NewSession", 2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_session_is_nacked() {
        let h = harness(&[("9999", "1111", &[0])]);
        let release = Notification::new(MessageType::GatewayReleaseSession).with_session_id("77");
        assert_eq!(h.adapter.receive_release_session(&release).await, Ack::Nack);

        let orphan = Notification::new(MessageType::RecoveryReply)
            .with_invoke_id(InvokeId::from(12345))
            .with_status(ReplyStatus::Success);
        assert_eq!(h.adapter.handle_reply(orphan).await, Ack::Nack);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nacked_association_is_retried() {
        let h = harness(&[("9999", "1111", &[0])]);
        h.client.refuse("AssociationConnect");
        let session = open_session(&h).await;

        wait_for(&h.client, "AssociationConnect", 1).await;
        let mut retried = false;
        for _ in 0..200 {
            if session.is_association(region(0), AssociationState::Retry) {
                retried = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(retried);

        h.client.accept("AssociationConnect");
        wait_for(&h.client, "AssociationConnect", 2).await;
        let mut waiting = false;
        for _ in 0..200 {
            if session.is_association(region(0), AssociationState::WaitingForReply) {
                waiting = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(waiting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_notification_flags_region_and_reconnects() {
        let h = harness(&[("9999", "1111", &[0])]);
        let session = open_session(&h).await;
        wait_for(&h.client, "AssociationConnect", 1).await;

        let status = Notification::new(MessageType::AssociationStatusNotification)
            .with_session_id("42")
            .with_invoke_id(InvokeId::from(900))
            .with_region(region(0))
            .with_status(ReplyStatus::Aborted);
        assert_eq!(
            h.adapter.receive_association_status_notification(&status).await,
            Ack::Ack
        );

        let replies = h.client.of_kind("NotificationReply");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].invoke_id(), &InvokeId::from(900));
        assert_eq!(
            h.storage
                .region_recovery
                .status(region(0), "default")
                .await
                .unwrap(),
            Some(npac_storage::RecoveryStatus::Awaiting)
        );
        wait_for(&h.client, "AssociationConnect", 2).await;
        assert!(session.is_alive());

        let unparsable = Notification::new(MessageType::AssociationStatusNotification)
            .with_session_id("42")
            .with_status(ReplyStatus::Aborted);
        assert_eq!(
            h.adapter
                .receive_association_status_notification(&unparsable)
                .await,
            Ack::Nack
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generic_request_records_outcome() {
        let h = harness(&[("9999", "1111", &[0])]);
        open_session(&h).await;

        assert_eq!(
            h.adapter.send("1111", "order-1", Some(region(0)), "<payload/>").await,
            Ack::Ack
        );
        let sent = wait_for(&h.client, "Passthrough", 1).await.remove(0);
        assert_eq!(sent.header.customer_id, "1111");
        h.adapter
            .handle_reply(reply_to(
                MessageType::from_name("SubscriptionVersionCreateReply"),
                &sent,
                ReplyStatus::Success,
            ))
            .await;

        for _ in 0..200 {
            if h.storage.requests.latest("order-1").await.unwrap()
                == Some(RequestStatus::Succeeded)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.storage.requests.latest("order-1").await.unwrap(),
            Some(RequestStatus::Succeeded)
        );
        assert_eq!(h.driver.received().len(), 1);

        assert_eq!(
            h.adapter.send("5555", "order-2", None, "<payload/>").await,
            Ack::Nack
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repeated_reinitialize_brings_up_one_region_at_a_time() {
        let h = harness(&[("9999", "1111", &[0, 1])]);
        let session = h.registry.get("9999").unwrap();
        h.adapter.initialize().await;
        wait_for(&h.client, "NewSession", 1).await;

        h.adapter.reinitialize(&session);
        h.adapter.reinitialize(&session);
        wait_for(&h.client, "NewSession", 2).await;
        settle().await;

        // answer every attempt; only the latest one may open the session
        let attempts = h.client.of_kind("NewSession");
        for (n, request) in attempts.iter().enumerate() {
            let reply = reply_to(MessageType::NewSessionReply, request, ReplyStatus::Success)
                .with_session_id((40 + n).to_string());
            h.adapter.handle_reply(reply).await;
        }
        wait_for(&h.client, "AssociationConnect", 1).await;
        settle().await;

        let latest = (40 + attempts.len() - 1).to_string();
        let connects = h.client.of_kind("AssociationConnect");
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].region(), Some(region(0)));
        assert_eq!(connects[0].header.session_id, latest);
        assert_eq!(session.session_id(), latest);
        assert_eq!(session.association_state(region(1)), AssociationState::Down);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_regions_connect_in_order_after_each_recovery_completes() {
        let h = harness(&[("9999", "1111", &[0, 1])]);
        let session = open_session(&h).await;

        let first = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        assert_eq!(first.region(), Some(region(0)));
        answer(&h, MessageType::AssociationReply, &first, ReplyStatus::Success).await;

        // no stored cursor, so recovery goes straight to RecoveryComplete
        let complete = wait_for(&h.client, "RecoveryCompleteRequest", 1).await.remove(0);
        assert_eq!(complete.region(), Some(region(0)));
        settle().await;
        assert_eq!(h.client.of_kind("AssociationConnect").len(), 1);
        assert_eq!(session.association_state(region(1)), AssociationState::Down);

        answer(&h, MessageType::RecoveryCompleteReply, &complete, ReplyStatus::Success).await;
        let connects = wait_for(&h.client, "AssociationConnect", 2).await;
        assert_eq!(connects[1].region(), Some(region(1)));
        assert_eq!(session.association_state(region(0)), AssociationState::Connected);
        assert_eq!(
            h.storage
                .region_recovery
                .status(region(0), "default")
                .await
                .unwrap(),
            Some(RecoveryStatus::Ready)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_invalid_during_recovery_reinitializes_session() {
        let h = harness(&[("9999", "1111", &[0])]);
        h.clock.set(at(3, 0, 0));
        set_cursor(&h, "1111", 0, NotificationTimeKind::Default, at(0, 0, 0)).await;
        let session = open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        answer(&h, MessageType::AssociationReply, &connect, ReplyStatus::Success).await;

        let request = wait_for(&h.client, "RecoveryRequest", 1).await.remove(0);
        answer(&h, MessageType::RecoveryReply, &request, ReplyStatus::SessionInvalid).await;

        wait_for(&h.client, "NewSession", 2).await;
        assert!(!session.is_alive());
        assert_eq!(session.association_state(region(0)), AssociationState::Down);
        assert_eq!(h.client.of_kind("RecoveryRequest").len(), 1);
        assert!(h.driver.received().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_invalid_association_reply_reopens_session() {
        let h = harness(&[("9999", "1111", &[0])]);
        let session = open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        answer(&h, MessageType::AssociationReply, &connect, ReplyStatus::SessionInvalid).await;

        let reopen = wait_for(&h.client, "NewSession", 2).await.remove(1);
        assert!(!session.is_alive());
        let reply = reply_to(MessageType::NewSessionReply, &reopen, ReplyStatus::Success)
            .with_session_id("43");
        assert_eq!(h.adapter.handle_reply(reply).await, Ack::Ack);

        let connects = wait_for(&h.client, "AssociationConnect", 2).await;
        assert_eq!(connects[1].header.session_id, "43");
        assert_eq!(connects[1].region(), Some(region(0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_swim_more_data_resends_window_then_confirms_results() {
        let h = harness(&[("9999", "1111", &[0])]);
        h.clock.set(at(1, 0, 0));
        h.storage
            .region_recovery
            .set_recovery_mode(region(0), RecoveryMode::Swim)
            .await
            .unwrap();
        set_cursor(&h, "1111", 0, NotificationTimeKind::Network, at(0, 0, 0)).await;

        open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        answer(&h, MessageType::AssociationReply, &connect, ReplyStatus::Success).await;

        let first = wait_for(&h.client, "DownloadRecoveryRequest", 1).await.remove(0);
        assert_eq!(swim_action_of(&first), None);
        let more = reply_to(MessageType::DownloadRecoveryReply, &first, ReplyStatus::SwimMoreData)
            .with_action_id("A1");
        assert_eq!(h.adapter.handle_reply(more).await, Ack::Ack);

        // same window again, continued with the action ID
        let second = wait_for(&h.client, "DownloadRecoveryRequest", 2).await.remove(1);
        assert_eq!(window_of(&second), window_of(&first));
        assert_eq!(swim_action_of(&second), Some("A1".to_string()));
        assert_ne!(second.invoke_id(), first.invoke_id());

        let last = reply_to(MessageType::DownloadRecoveryReply, &second, ReplyStatus::Success)
            .with_action_id("A2");
        assert_eq!(h.adapter.handle_reply(last).await, Ack::Ack);

        let confirm = wait_for(&h.client, "SwimProcessingRecoveryResultsRequest", 1)
            .await
            .remove(0);
        assert!(matches!(
            &confirm.body,
            RequestBody::SwimProcessingRecoveryResultsRequest { action_id, .. } if action_id == "A2"
        ));
        let confirmed = reply_to(
            MessageType::SwimProcessingRecoveryResultsReply,
            &confirm,
            ReplyStatus::Success,
        )
        .with_stop_time(at(0, 30, 0));
        assert_eq!(h.adapter.handle_reply(confirmed).await, Ack::Ack);

        // the SPID continues from the stop time the peer reported
        let third = wait_for(&h.client, "DownloadRecoveryRequest", 3).await.remove(2);
        assert_eq!(
            window_of(&third).unwrap(),
            TimeRange { start: at(0, 30, 1), stop: at(1, 0, 0) }
        );
        assert_eq!(swim_action_of(&third), None);
        let cursor = h
            .storage
            .notification_times
            .get(&CursorKey::new("1111", region(0), NotificationTimeKind::Network))
            .await
            .unwrap();
        assert_eq!(cursor, Some(at(0, 30, 0)));
        assert_eq!(h.driver.received().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unanswered_requests_are_resent_after_timeout() {
        let h = harness_with(&[("9999", "1111", &[0])], |config| {
            config.resend_timeout = Duration::from_millis(300);
        });
        h.clock.set(at(3, 0, 0));
        set_cursor(&h, "1111", 0, NotificationTimeKind::Default, at(0, 0, 0)).await;
        let session = open_session(&h).await;

        // the first connect is never answered: RETRY, then a fresh connect
        let connects = wait_for(&h.client, "AssociationConnect", 2).await;
        assert_eq!(connects[1].region(), Some(region(0)));
        assert!(!h.adapter.is_awaiting(connects[0].invoke_id()));
        answer(&h, MessageType::AssociationReply, &connects[1], ReplyStatus::Success).await;

        // the recovery window is sent again under a new invoke ID
        let requests = wait_for(&h.client, "RecoveryRequest", 2).await;
        assert_eq!(window_of(&requests[0]), window_of(&requests[1]));
        assert_ne!(requests[0].invoke_id(), requests[1].invoke_id());
        assert!(!h.adapter.is_awaiting(requests[0].invoke_id()));
        assert_eq!(
            session.association_state(region(0)),
            AssociationState::Recovering
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_recovery_complete_reconnects_region() {
        let h = harness(&[("9999", "1111", &[0])]);
        let session = open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        answer(&h, MessageType::AssociationReply, &connect, ReplyStatus::Success).await;

        let complete = wait_for(&h.client, "RecoveryCompleteRequest", 1).await.remove(0);
        answer(
            &h,
            MessageType::RecoveryCompleteReplyWithErrorCode,
            &complete,
            ReplyStatus::Failed,
        )
        .await;

        let connects = wait_for(&h.client, "AssociationConnect", 2).await;
        assert_eq!(connects[1].region(), Some(region(0)));
        wait_until(|| session.is_association(region(0), AssociationState::WaitingForReply)).await;
        assert_ne!(
            h.storage
                .region_recovery
                .status(region(0), "default")
                .await
                .unwrap(),
            Some(RecoveryStatus::Ready)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recovery_padding_applies_once_per_spid() {
        let h = harness_with(&[("9999", "1111", &[0]), ("9999", "2222", &[0])], |config| {
            config.recovery_padding = Duration::from_secs(600);
        });
        h.clock.set(at(1, 0, 0));
        for spid in ["1111", "2222"] {
            set_cursor(&h, spid, 0, NotificationTimeKind::Default, at(0, 0, 0)).await;
        }

        open_session(&h).await;
        let connect = wait_for(&h.client, "AssociationConnect", 1).await.remove(0);
        answer(&h, MessageType::AssociationReply, &connect, ReplyStatus::Success).await;

        for n in 1..=3 {
            let request = wait_for(&h.client, "RecoveryRequest", n).await.remove(n - 1);
            answer(&h, MessageType::RecoveryReply, &request, ReplyStatus::Success).await;
        }

        let padded_start = Utc.with_ymd_and_hms(2023, 12, 31, 23, 50, 1).unwrap();
        let requests = h.client.of_kind("RecoveryRequest");
        let windows: Vec<(String, TimeRange)> = requests
            .iter()
            .map(|r| (r.header.customer_id.clone(), window_of(r).unwrap()))
            .collect();
        assert_eq!(
            windows[..3],
            [
                (
                    "1111".to_string(),
                    TimeRange { start: padded_start, stop: at(0, 50, 0) }
                ),
                (
                    "1111".to_string(),
                    TimeRange { start: at(0, 50, 1), stop: at(1, 0, 0) }
                ),
                (
                    "2222".to_string(),
                    TimeRange { start: padded_start, stop: at(0, 50, 0) }
                ),
            ]
        );
    }
}
