//! Runtime settings of the adapter.

use std::time::Duration;

use crate::work_queue::WorkQueueConfig;

/// Smallest recovery window the adapter will ask for
pub const MIN_RECOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the adapter's protocol timing
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Gateway user sent with NewSession
    pub user_id: String,
    /// Delay before a failed request is retried
    pub retry_interval: Duration,
    /// How long a request waits for its reply before it is resent
    pub resend_timeout: Duration,
    /// Width of one recovery window
    pub recovery_window: Duration,
    /// Backward offset applied to a stored cursor before recovery starts
    pub recovery_padding: Duration,
    /// Period of outbound keep-alives
    pub keep_alive_interval: Duration,
    /// Name of the invoke-ID sequence
    pub invoke_id_sequence: String,
    /// Connectivity instance key for the region recovery table
    pub connectivity_key: String,
    /// Worker pool settings
    pub work_queue: WorkQueueConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            user_id: "npac".to_string(),
            retry_interval: Duration::from_secs(30),
            resend_timeout: Duration::from_secs(120),
            recovery_window: Duration::from_secs(3600),
            recovery_padding: Duration::ZERO,
            keep_alive_interval: Duration::from_secs(60),
            invoke_id_sequence: "npac_invoke_id".to_string(),
            connectivity_key: "default".to_string(),
            work_queue: WorkQueueConfig::default(),
        }
    }
}
