//! Test doubles shared by the adapter's unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use npac_protocol::{
    Ack, GatewayRequest, MessageType, Notification, RegionSet, ReplyStatus,
};
use npac_session::SessionRegistry;
use npac_storage::{MemoryStore, Storage};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapter::NpacAdapter;
use crate::clock::Clock;
use crate::config::AdapterConfig;
use crate::transport::{DriverChain, GatewayClient};

/// Gateway client that records every request and NACKs refused kinds
#[derive(Debug, Default)]
pub struct RecordingClient {
    sent: Mutex<Vec<GatewayRequest>>,
    refused: Mutex<HashSet<&'static str>>,
}

impl RecordingClient {
    pub fn refuse(&self, kind: &'static str) {
        self.refused.lock().unwrap().insert(kind);
    }

    pub fn accept(&self, kind: &'static str) {
        self.refused.lock().unwrap().remove(&kind);
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<GatewayRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.kind() == kind)
            .collect()
    }
}

#[async_trait]
impl GatewayClient for RecordingClient {
    async fn send(&self, request: &GatewayRequest) -> Ack {
        self.sent.lock().unwrap().push(request.clone());
        let refused = self.refused.lock().unwrap().contains(&request.kind());
        Ack::from_bool(!refused)
    }
}

/// Driver chain that keeps what it receives
#[derive(Debug, Default)]
pub struct RecordingDriver {
    received: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingDriver {
    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().unwrap().clone()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DriverChain for RecordingDriver {
    async fn process(&self, notification: &Notification) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(notification.clone());
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("driver refused {}", notification.message_type);
        }
        Ok(())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub struct Harness {
    pub adapter: NpacAdapter,
    pub client: Arc<RecordingClient>,
    pub driver: Arc<RecordingDriver>,
    pub clock: Arc<FixedClock>,
    pub storage: Storage,
    pub registry: Arc<SessionRegistry>,
}

/// Adapter over in-memory storage for `(primary, secondary, regions)` mappings
pub fn harness(mappings: &[(&str, &str, &[u8])]) -> Harness {
    harness_with(mappings, |_| {})
}

/// Like [`harness`], with the adapter settings adjusted by `configure`
pub fn harness_with(
    mappings: &[(&str, &str, &[u8])],
    configure: impl FnOnce(&mut AdapterConfig),
) -> Harness {
    let registry = Arc::new(SessionRegistry::new());
    for (primary, secondary, regions) in mappings {
        registry
            .add(
                primary,
                secondary,
                RegionSet::from_indices(regions.iter().copied()),
            )
            .unwrap();
    }

    let mut config = AdapterConfig {
        retry_interval: Duration::from_millis(200),
        resend_timeout: Duration::from_secs(60),
        ..AdapterConfig::default()
    };
    configure(&mut config);
    let storage = Storage::shared(Arc::new(MemoryStore::new()));
    let client = Arc::new(RecordingClient::default());
    let driver = Arc::new(RecordingDriver::default());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
    ));

    let adapter = NpacAdapter::new(
        config,
        registry.clone(),
        storage.clone(),
        client.clone(),
        driver.clone(),
        clock.clone(),
    );
    Harness {
        adapter,
        client,
        driver,
        clock,
        storage,
        registry,
    }
}

/// Wait until at least `n` requests of `kind` were sent
pub async fn wait_for(client: &RecordingClient, kind: &str, n: usize) -> Vec<GatewayRequest> {
    for _ in 0..500 {
        let sent = client.of_kind(kind);
        if sent.len() >= n {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} {} requests, saw {}",
        n,
        kind,
        client.of_kind(kind).len()
    );
}

/// Reply of type `message_type` to `request`
pub fn reply_to(
    message_type: MessageType,
    request: &GatewayRequest,
    status: ReplyStatus,
) -> Notification {
    let mut reply = Notification::new(message_type)
        .with_session_id(request.header.session_id.clone())
        .with_invoke_id(request.invoke_id().clone())
        .with_status(status);
    if let Some(region) = request.region() {
        reply = reply.with_region(region);
    }
    if !request.header.customer_id.is_empty() {
        reply = reply.with_customer(request.header.customer_id.clone());
    }
    reply
}
