//! Periodic outbound keep-alives.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::adapter::NpacAdapter;

/// Background task sending ClientKeepAlive on every live session
#[derive(Debug)]
pub struct KeepAliveDriver {
    handle: Option<JoinHandle<()>>,
}

impl KeepAliveDriver {
    /// Start sending keep-alives every `period`; a zero period disables them
    pub fn start(adapter: NpacAdapter, period: Duration) -> Self {
        if period.is_zero() {
            warn!("Keep-alive interval is zero; keep-alives disabled");
            return Self { handle: None };
        }

        info!("Sending keep-alives every {:?}", period);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("Keep-alive tick");
                adapter.send_keep_alives().await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop; a keep-alive being sent is abandoned
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Keep-alive loop stopped");
        }
    }
}

impl Drop for KeepAliveDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;
    use npac_protocol::RequestBody;

    #[tokio::test(start_paused = true)]
    async fn test_sends_on_live_sessions_only() {
        let h = harness(&[("9999", "1111", &[0]), ("8888", "2222", &[1])]);
        h.registry.get("9999").unwrap().set_session_id("42");

        let mut driver = KeepAliveDriver::start(h.adapter.clone(), Duration::from_secs(60));
        assert!(driver.is_running());

        tokio::time::sleep(Duration::from_secs(61)).await;
        let sent = h.client.of_kind("ClientKeepAlive");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.session_id, "42");
        assert!(matches!(
            sent[0].body,
            RequestBody::ClientKeepAlive { sequence_number: 1 }
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let sent = h.client.of_kind("ClientKeepAlive");
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            sent[1].body,
            RequestBody::ClientKeepAlive { sequence_number: 2 }
        ));

        driver.stop();
        assert!(!driver.is_running());
    }

    #[tokio::test]
    async fn test_zero_period_disables() {
        let h = harness(&[("9999", "1111", &[0])]);
        let driver = KeepAliveDriver::start(h.adapter.clone(), Duration::ZERO);
        assert!(!driver.is_running());
    }
}
