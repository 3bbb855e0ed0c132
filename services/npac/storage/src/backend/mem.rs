//! In-memory storage backend for development and testing

use crate::{
    CursorKey, InvokeIdSequence, LastNotificationTimes, RecoveryStatus, RegionRecoveryTable,
    RequestStatus, RequestStatusLog, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use npac_protocol::{RecoveryMode, Region};
use std::sync::Arc;
use tracing::debug;

/// In-memory store implementing every table
pub struct MemoryStore {
    /// Cursor -> last notification time
    cursors: Arc<DashMap<CursorKey, DateTime<Utc>>>,
    /// (region, connectivity) -> recovery status
    recovery: Arc<DashMap<(Region, String), RecoveryStatus>>,
    /// Region -> recovery strategy
    modes: Arc<DashMap<Region, RecoveryMode>>,
    /// Sequence name -> last value handed out
    sequences: Arc<DashMap<String, u64>>,
    /// Message key -> request status
    requests: Arc<DashMap<String, RequestStatus>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            cursors: Arc::new(DashMap::new()),
            recovery: Arc::new(DashMap::new()),
            modes: Arc::new(DashMap::new()),
            sequences: Arc::new(DashMap::new()),
            requests: Arc::new(DashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LastNotificationTimes for MemoryStore {
    async fn get(&self, key: &CursorKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.cursors.get(key).map(|v| *v))
    }

    async fn set(&self, key: &CursorKey, time: DateTime<Utc>) -> Result<(), StoreError> {
        debug!("Cursor set {} = {}", key, time);
        self.cursors.insert(key.clone(), time);
        Ok(())
    }

    async fn advance(
        &self,
        key: &CursorKey,
        time: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut entry = self.cursors.entry(key.clone()).or_insert(time);
        if *entry < time {
            *entry = time;
        }
        debug!("Cursor advance {} -> {}", key, *entry);
        Ok(*entry)
    }
}

#[async_trait]
impl RegionRecoveryTable for MemoryStore {
    async fn mark_awaiting(&self, region: Region, connectivity: &str) -> Result<(), StoreError> {
        self.recovery
            .insert((region, connectivity.to_string()), RecoveryStatus::Awaiting);
        Ok(())
    }

    async fn mark_ready(&self, region: Region, connectivity: &str) -> Result<(), StoreError> {
        self.recovery
            .insert((region, connectivity.to_string()), RecoveryStatus::Ready);
        Ok(())
    }

    async fn status(
        &self,
        region: Region,
        connectivity: &str,
    ) -> Result<Option<RecoveryStatus>, StoreError> {
        Ok(self
            .recovery
            .get(&(region, connectivity.to_string()))
            .map(|v| *v))
    }

    async fn recovery_mode(&self, region: Region) -> Result<RecoveryMode, StoreError> {
        Ok(self.modes.get(&region).map(|v| *v).unwrap_or_default())
    }

    async fn set_recovery_mode(
        &self,
        region: Region,
        mode: RecoveryMode,
    ) -> Result<(), StoreError> {
        self.modes.insert(region, mode);
        Ok(())
    }
}

#[async_trait]
impl InvokeIdSequence for MemoryStore {
    async fn next_value(&self, name: &str) -> Result<u64, StoreError> {
        let mut value = self.sequences.entry(name.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

#[async_trait]
impl RequestStatusLog for MemoryStore {
    async fn record(&self, message_key: &str, status: RequestStatus) -> Result<(), StoreError> {
        debug!("Request {} status {:?}", message_key, status);
        self.requests.insert(message_key.to_string(), status);
        Ok(())
    }

    async fn latest(&self, message_key: &str) -> Result<Option<RequestStatus>, StoreError> {
        Ok(self.requests.get(message_key).map(|v| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NotificationTimeKind;
    use chrono::TimeZone;

    fn key() -> CursorKey {
        CursorKey::new("1111", Region::new(0).unwrap(), NotificationTimeKind::Default)
    }

    #[tokio::test]
    async fn test_advance_never_regresses() {
        let store = MemoryStore::new();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();

        assert_eq!(store.advance(&key(), later).await.unwrap(), later);
        assert_eq!(store.advance(&key(), earlier).await.unwrap(), later);
        assert_eq!(store.get(&key()).await.unwrap(), Some(later));

        // set is an explicit overwrite
        store.set(&key(), earlier).await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap(), Some(earlier));
    }

    #[tokio::test]
    async fn test_recovery_status_per_connectivity() {
        let store = MemoryStore::new();
        let region = Region::new(5).unwrap();
        store.mark_awaiting(region, "gw-a").await.unwrap();
        store.mark_ready(region, "gw-b").await.unwrap();

        assert_eq!(
            store.status(region, "gw-a").await.unwrap(),
            Some(RecoveryStatus::Awaiting)
        );
        assert_eq!(
            store.status(region, "gw-b").await.unwrap(),
            Some(RecoveryStatus::Ready)
        );
        assert_eq!(store.status(region, "gw-c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sequences_are_independent() {
        let store = MemoryStore::new();
        assert_eq!(store.next_value("a").await.unwrap(), 1);
        assert_eq!(store.next_value("a").await.unwrap(), 2);
        assert_eq!(store.next_value("b").await.unwrap(), 1);
    }
}
