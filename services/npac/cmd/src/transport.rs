//! JSON-lines gateway transport over TCP.
//!
//! Every outbound request is written as one JSON line; every inbound line is a
//! parsed gateway message handed to the ComServer. The connection is re-dialled
//! with exponential backoff, and sessions alive on a lost connection are
//! reinitialized.

use async_trait::async_trait;
use npac_adapter::{ComServer, GatewayClient};
use npac_protocol::{Ack, GatewayRequest, Notification};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{component_debug, component_error, component_info, component_warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Gateway client writing JSON lines to a TCP connection
pub struct TcpGatewayClient {
    addr: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpGatewayClient {
    /// Client for the gateway at `addr`; nothing is dialled until [`run`](Self::run)
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            writer: Mutex::new(None),
        }
    }

    /// Keep a connection open and feed inbound messages to `server`
    pub async fn run(self: Arc<Self>, server: Arc<ComServer>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let stream = match TcpStream::connect(&self.addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    component_warn!(
                        "transport",
                        "Cannot reach gateway {}: {}; retrying in {:?}",
                        self.addr,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            backoff = INITIAL_BACKOFF;
            if let Err(e) = stream.set_nodelay(true) {
                component_debug!("transport", "Could not set TCP_NODELAY: {}", e);
            }
            component_info!("transport", "Connected to gateway {}", self.addr);

            let (read_half, write_half) = stream.into_split();
            *self.writer.lock().await = Some(write_half);

            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => self.deliver(&server, &line).await,
                    Ok(None) => {
                        component_warn!("transport", "Gateway {} closed the connection", self.addr);
                        break;
                    }
                    Err(e) => {
                        component_error!("transport", "Read from gateway failed: {}", e);
                        break;
                    }
                }
            }

            self.writer.lock().await.take();
            let adapter = server.adapter();
            for session in adapter.registry().sessions() {
                if session.is_alive() {
                    adapter.reinitialize(&session);
                }
            }
        }
    }

    async fn deliver(&self, server: &ComServer, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<Notification>(line) {
            Ok(notification) => {
                let ack = server.process(notification).await;
                component_debug!("transport", "Inbound message answered {}", ack);
            }
            Err(e) => component_warn!("transport", "Discarding unparsable gateway line: {}", e),
        }
    }
}

#[async_trait]
impl GatewayClient for TcpGatewayClient {
    async fn send(&self, request: &GatewayRequest) -> Ack {
        let mut line = match serde_json::to_vec(request) {
            Ok(line) => line,
            Err(e) => {
                component_error!("transport", "Cannot encode {}: {}", request, e);
                return Ack::Nack;
            }
        };
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            component_debug!("transport", "Not connected; {} not sent", request);
            return Ack::Nack;
        };
        match stream.write_all(&line).await {
            Ok(()) => Ack::Ack,
            Err(e) => {
                component_warn!("transport", "Write of {} failed: {}", request, e);
                writer.take();
                Ack::Nack
            }
        }
    }
}
