//! Configuration handling for the NPAC gateway service.
//!
//! Settings come from the shared YAML config file (the `services.npac`
//! section), then from `NPAC_*` environment variables, then from the command
//! line.

use anyhow::{Context, Result};
use npac_adapter::{AdapterConfig, WorkQueueConfig};
use npac_protocol::RegionSet;
use npac_session::SessionRegistry;
use npac_storage::backend::file::DEFAULT_SEQUENCE_BLOCK;
use npac_storage::StorageMode;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Customer SPID served through a primary SPID's session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CustomerConfig {
    /// Primary SPID owning the gateway session
    pub primary: String,
    /// Customer (secondary) SPID
    pub secondary: String,
    /// Region indices the customer needs
    #[serde(default)]
    pub regions: Vec<u8>,
}

/// NPAC gateway service configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway address, host:port
    pub gateway_addr: String,
    /// Gateway user sent with NewSession
    pub user_id: String,
    /// Delay before a failed request is retried
    pub retry_interval: Duration,
    /// Reply timeout before a request is resent
    pub resend_timeout: Duration,
    /// Recovery window width
    pub recovery_window: Duration,
    /// Backward offset applied to stored cursors
    pub recovery_padding: Duration,
    /// Outbound keep-alive period
    pub keep_alive_interval: Duration,
    /// Connectivity key of the region recovery table
    pub connectivity_key: String,
    /// memory or file
    pub storage_mode: String,
    /// Snapshot path for file storage
    pub storage_path: PathBuf,
    /// Upper bound on work queue workers
    pub max_threads: usize,
    /// Idle work queue workers kept alive
    pub max_waiting_threads: usize,
    /// Sessions to open
    pub customers: Vec<CustomerConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let adapter = AdapterConfig::default();
        let queue = WorkQueueConfig::default();
        Self {
            gateway_addr: "127.0.0.1:7400".to_string(),
            user_id: adapter.user_id,
            retry_interval: adapter.retry_interval,
            resend_timeout: adapter.resend_timeout,
            recovery_window: adapter.recovery_window,
            recovery_padding: adapter.recovery_padding,
            keep_alive_interval: adapter.keep_alive_interval,
            connectivity_key: adapter.connectivity_key,
            storage_mode: "memory".to_string(),
            storage_path: PathBuf::from("./npacdata/state.json"),
            max_threads: queue.max_threads,
            max_waiting_threads: queue.max_waiting_threads,
            customers: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    npac: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
    #[serde(default)]
    customers: Vec<CustomerConfig>,
}

impl GatewayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                if let Some(service) = root.services.and_then(|services| services.npac) {
                    config.apply_service_config(service);
                }
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides();

        info!(
            "Final NPAC configuration: gateway={}, user={}, customers={}, storage={}",
            config.gateway_addr,
            config.user_id,
            config.customers.len(),
            config.storage_mode
        );
        Ok(config)
    }

    fn apply_service_config(&mut self, service: ServiceConfig) {
        self.customers = service.customers;

        for (key, value) in service.config.unwrap_or_default() {
            let Some(name) = key.strip_prefix("services.npac.") else {
                warn!("Ignoring configuration key {}", key);
                continue;
            };
            if let Err(e) = self.set(name, &value) {
                warn!("Ignoring {}={}: {}", key, value, e);
            }
        }
    }

    /// Apply one named setting
    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "gateway" => self.gateway_addr = value.to_string(),
            "user_id" => self.user_id = value.to_string(),
            "retry_interval" => self.retry_interval = humantime::parse_duration(value)?,
            "resend_timeout" => self.resend_timeout = humantime::parse_duration(value)?,
            "recovery_window" => self.recovery_window = humantime::parse_duration(value)?,
            "recovery_padding" => self.recovery_padding = humantime::parse_duration(value)?,
            "keep_alive_interval" => {
                self.keep_alive_interval = humantime::parse_duration(value)?
            }
            "connectivity_key" => self.connectivity_key = value.to_string(),
            "storage.mode" => self.storage_mode = value.to_lowercase(),
            "storage.path" => self.storage_path = PathBuf::from(value),
            "work_queue.max_threads" => self.max_threads = value.parse()?,
            "work_queue.max_waiting_threads" => self.max_waiting_threads = value.parse()?,
            _ => anyhow::bail!("unknown setting"),
        }
        Ok(())
    }

    fn apply_environment_overrides(&mut self) {
        const OVERRIDES: [(&str, &str); 5] = [
            ("NPAC_GATEWAY_ADDR", "gateway"),
            ("NPAC_USER_ID", "user_id"),
            ("NPAC_STORAGE_MODE", "storage.mode"),
            ("NPAC_STORAGE_PATH", "storage.path"),
            ("NPAC_RETRY_INTERVAL", "retry_interval"),
        ];
        for (variable, name) in OVERRIDES {
            let Ok(value) = std::env::var(variable) else {
                continue;
            };
            match self.set(name, &value) {
                Ok(()) => info!("{} overridden by environment: {}", name, value),
                Err(e) => warn!("Ignoring {}={}: {}", variable, value, e),
            }
        }
    }

    /// Adapter settings derived from this configuration
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            user_id: self.user_id.clone(),
            retry_interval: self.retry_interval,
            resend_timeout: self.resend_timeout,
            recovery_window: self.recovery_window,
            recovery_padding: self.recovery_padding,
            keep_alive_interval: self.keep_alive_interval,
            connectivity_key: self.connectivity_key.clone(),
            work_queue: WorkQueueConfig {
                max_threads: self.max_threads,
                max_waiting_threads: self.max_waiting_threads,
                ..WorkQueueConfig::default()
            },
            ..AdapterConfig::default()
        }
    }

    /// Storage backend selected by `storage_mode`
    pub fn storage_mode(&self) -> Result<StorageMode> {
        match self.storage_mode.as_str() {
            "memory" => Ok(StorageMode::InMemory),
            "file" => Ok(StorageMode::File {
                path: self.storage_path.clone(),
                sequence_block: DEFAULT_SEQUENCE_BLOCK,
            }),
            other => anyhow::bail!("Unknown storage mode: {}", other),
        }
    }

    /// Registry holding one session per configured primary SPID
    pub fn build_registry(&self) -> Result<Arc<SessionRegistry>> {
        let registry = Arc::new(SessionRegistry::new());
        for customer in &self.customers {
            if let Some(bad) = customer.regions.iter().find(|index| **index >= 8) {
                anyhow::bail!(
                    "Customer {} lists unknown region {}",
                    customer.secondary,
                    bad
                );
            }
            registry.add(
                &customer.primary,
                &customer.secondary,
                RegionSet::from_indices(customer.regions.iter().copied()),
            )?;
        }
        Ok(registry)
    }
}
