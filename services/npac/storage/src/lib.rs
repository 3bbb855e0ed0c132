//! Durable adapter state for the NPAC gateway adapter.
//!
//! This crate holds the state the adapter must keep across restarts: the
//! per-SPID last-notification-time cursors that recovery starts from, the
//! per-region recovery status and strategy table, the invoke-ID sequence and
//! the status log of pass-through application requests. Backends are
//! pluggable (in-memory, file-based).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use npac_protocol::{RecoveryMode, Region};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Which cursor a last-notification time belongs to
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTimeKind {
    /// Subscription and other object notifications
    Default,
    /// Network data
    Network,
    /// Service provider data
    ServiceProvider,
}

impl fmt::Display for NotificationTimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationTimeKind::Default => f.write_str("default"),
            NotificationTimeKind::Network => f.write_str("network"),
            NotificationTimeKind::ServiceProvider => f.write_str("service-provider"),
        }
    }
}

/// Key of one last-notification-time cursor
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorKey {
    /// Customer SPID
    pub spid: String,
    /// Region
    pub region: Region,
    /// Cursor kind
    pub kind: NotificationTimeKind,
}

impl CursorKey {
    /// Build a key
    pub fn new(spid: &str, region: Region, kind: NotificationTimeKind) -> Self {
        Self {
            spid: spid.to_string(),
            region,
            kind,
        }
    }
}

impl fmt::Display for CursorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spid, self.region, self.kind)
    }
}

/// Recovery status of a region for one connectivity instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Association dropped; data may have been missed
    Awaiting,
    /// Region recovered
    Ready,
}

/// Delivery status of a pass-through application request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    /// Handed to the gateway
    Sent,
    /// Peer replied with success
    Succeeded,
    /// Peer rejected it in a way that warrants resending later
    FailedForResend {
        /// Rejection reason
        reason: String,
    },
    /// No reply in time; resend
    Retry,
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Last-notification-time cursors keyed by (SPID, region, kind)
#[async_trait]
pub trait LastNotificationTimes: Send + Sync {
    /// Stored time, if any
    async fn get(&self, key: &CursorKey) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Replace the stored time
    async fn set(&self, key: &CursorKey, time: DateTime<Utc>) -> Result<(), StoreError>;

    /// Store `time` unless a later time is already stored; returns the value kept
    async fn advance(&self, key: &CursorKey, time: DateTime<Utc>)
        -> Result<DateTime<Utc>, StoreError>;
}

/// Per-region recovery status and strategy
#[async_trait]
pub trait RegionRecoveryTable: Send + Sync {
    /// Flag the region as awaiting recovery
    async fn mark_awaiting(&self, region: Region, connectivity: &str) -> Result<(), StoreError>;

    /// Flag the region as recovered
    async fn mark_ready(&self, region: Region, connectivity: &str) -> Result<(), StoreError>;

    /// Current status, if recorded
    async fn status(
        &self,
        region: Region,
        connectivity: &str,
    ) -> Result<Option<RecoveryStatus>, StoreError>;

    /// Strategy used to recover the region
    async fn recovery_mode(&self, region: Region) -> Result<RecoveryMode, StoreError>;

    /// Change the strategy used to recover the region
    async fn set_recovery_mode(&self, region: Region, mode: RecoveryMode)
        -> Result<(), StoreError>;
}

/// Durable, gap-tolerant counter behind invoke IDs
#[async_trait]
pub trait InvokeIdSequence: Send + Sync {
    /// Next value of the named sequence; values only ever increase
    async fn next_value(&self, name: &str) -> Result<u64, StoreError>;
}

/// Delivery log of pass-through application requests
#[async_trait]
pub trait RequestStatusLog: Send + Sync {
    /// Record the latest status of a request
    async fn record(&self, message_key: &str, status: RequestStatus) -> Result<(), StoreError>;

    /// Latest recorded status
    async fn latest(&self, message_key: &str) -> Result<Option<RequestStatus>, StoreError>;
}

/// Combined storage interface
#[derive(Clone)]
pub struct Storage {
    /// Recovery cursors
    pub notification_times: Arc<dyn LastNotificationTimes>,
    /// Region recovery status and strategy
    pub region_recovery: Arc<dyn RegionRecoveryTable>,
    /// Invoke-ID counter
    pub invoke_ids: Arc<dyn InvokeIdSequence>,
    /// Pass-through request log
    pub requests: Arc<dyn RequestStatusLog>,
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// Single snapshot file, rewritten atomically on every update
    File {
        /// Snapshot path
        path: PathBuf,
        /// Invoke IDs reserved per snapshot write
        sequence_block: u64,
    },
}

// Re-export backend implementations
pub use backend::file::FileStore;
pub use backend::mem::MemoryStore;

impl Storage {
    /// Create storage from configuration
    pub async fn from_mode(mode: StorageMode) -> Result<Self, StoreError> {
        match mode {
            StorageMode::InMemory => Ok(Self::shared(Arc::new(MemoryStore::new()))),
            StorageMode::File {
                path,
                sequence_block,
            } => Ok(Self::shared(Arc::new(
                FileStore::open(path, sequence_block).await?,
            ))),
        }
    }

    /// Use one backend for every table
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: LastNotificationTimes
            + RegionRecoveryTable
            + InvokeIdSequence
            + RequestStatusLog
            + 'static,
    {
        Self {
            notification_times: backend.clone(),
            region_recovery: backend.clone(),
            invoke_ids: backend.clone(),
            requests: backend,
        }
    }
}
