//! File-based storage backend with checksummed snapshots
//!
//! All tables live in one JSON snapshot followed by a CRC32 trailer line.
//! Every update runs as a transaction: the current state is copied, changed,
//! written to a temporary file, synced and renamed over the snapshot, and only
//! then becomes visible. A failed write leaves the previous state in place.

use crate::{
    CursorKey, InvokeIdSequence, LastNotificationTimes, RecoveryStatus, RegionRecoveryTable,
    RequestStatus, RequestStatusLog, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use npac_protocol::{RecoveryMode, Region};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default number of invoke IDs reserved per snapshot write
pub const DEFAULT_SEQUENCE_BLOCK: u64 = 100;

#[derive(Serialize, Deserialize, Debug)]
struct CursorRecord {
    key: CursorKey,
    #[serde(with = "npac_protocol::timestamp::utc")]
    time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
struct RecoveryRecord {
    region: Region,
    connectivity: String,
    status: RecoveryStatus,
}

/// On-disk layout
#[derive(Serialize, Deserialize, Debug, Default)]
struct Snapshot {
    cursors: Vec<CursorRecord>,
    recovery: Vec<RecoveryRecord>,
    modes: Vec<(Region, RecoveryMode)>,
    /// Highest reserved value per sequence
    sequences: HashMap<String, u64>,
    requests: HashMap<String, RequestStatus>,
}

/// In-memory view of the snapshot
#[derive(Clone, Debug, Default)]
struct Tables {
    cursors: HashMap<CursorKey, DateTime<Utc>>,
    recovery: HashMap<(Region, String), RecoveryStatus>,
    modes: HashMap<Region, RecoveryMode>,
    reserved: HashMap<String, u64>,
    requests: HashMap<String, RequestStatus>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            cursors: snapshot
                .cursors
                .into_iter()
                .map(|record| (record.key, record.time))
                .collect(),
            recovery: snapshot
                .recovery
                .into_iter()
                .map(|record| ((record.region, record.connectivity), record.status))
                .collect(),
            modes: snapshot.modes.into_iter().collect(),
            reserved: snapshot.sequences,
            requests: snapshot.requests,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut cursors: Vec<CursorRecord> = self
            .cursors
            .iter()
            .map(|(key, time)| CursorRecord {
                key: key.clone(),
                time: *time,
            })
            .collect();
        cursors.sort_by(|a, b| a.key.cmp(&b.key));

        let mut modes: Vec<(Region, RecoveryMode)> =
            self.modes.iter().map(|(r, m)| (*r, *m)).collect();
        modes.sort_by_key(|(region, _)| *region);

        Snapshot {
            cursors,
            recovery: self
                .recovery
                .iter()
                .map(|((region, connectivity), status)| RecoveryRecord {
                    region: *region,
                    connectivity: connectivity.clone(),
                    status: *status,
                })
                .collect(),
            modes,
            sequences: self.reserved.clone(),
            requests: self.requests.clone(),
        }
    }
}

struct State {
    tables: Tables,
    /// Next value to hand out per sequence; always <= reserved
    next_values: HashMap<String, u64>,
}

/// File-backed store implementing every table
pub struct FileStore {
    path: PathBuf,
    sequence_block: u64,
    state: Mutex<State>,
}

impl FileStore {
    /// Open the snapshot at `path`, creating an empty store if it does not exist
    pub async fn open(path: impl Into<PathBuf>, sequence_block: u64) -> Result<Self, StoreError> {
        let path = path.into();
        if sequence_block == 0 {
            return Err(StoreError::Invalid(
                "sequence block must be at least 1".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tables = if path.exists() {
            let tables = Tables::from_snapshot(read_snapshot(&path)?);
            info!(
                "Loaded adapter state from {:?}: {} cursors, {} region flags",
                path,
                tables.cursors.len(),
                tables.recovery.len()
            );
            tables
        } else {
            info!("No adapter state at {:?}, starting empty", path);
            Tables::default()
        };

        // Values below the reserved ceiling may have been handed out before a
        // restart, so resume above it.
        let next_values = tables
            .reserved
            .iter()
            .map(|(name, reserved)| (name.clone(), reserved + 1))
            .collect();

        Ok(Self {
            path,
            sequence_block,
            state: Mutex::new(State {
                tables,
                next_values,
            }),
        })
    }

    /// Snapshot path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the tables, persist it, then publish it.
    async fn transact<R>(
        &self,
        change: impl FnOnce(&mut Tables) -> R,
    ) -> Result<R, StoreError> {
        let mut state = self.state.lock().await;
        let mut tables = state.tables.clone();
        let result = change(&mut tables);
        write_snapshot(&self.path, &tables.to_snapshot())?;
        state.tables = tables;
        Ok(result)
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn read_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    let content = fs::read(path)?;
    let body_end = content
        .iter()
        .rposition(|b| *b == b'\n')
        .ok_or_else(|| StoreError::Corruption(format!("{:?}: missing checksum trailer", path)))?;
    let (body, trailer) = content.split_at(body_end);
    let trailer = std::str::from_utf8(&trailer[1..])
        .map_err(|_| StoreError::Corruption(format!("{:?}: unreadable checksum", path)))?;
    let expected = u32::from_str_radix(trailer.trim(), 16)
        .map_err(|_| StoreError::Corruption(format!("{:?}: unreadable checksum", path)))?;

    let actual = checksum(body);
    if actual != expected {
        warn!(
            "Checksum mismatch in {:?}: expected {:08x}, got {:08x}",
            path, expected, actual
        );
        return Err(StoreError::Corruption(format!(
            "{:?}: checksum mismatch",
            path
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        writeln!(file)?;
        write!(file, "{:08x}", checksum(&body))?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!("Wrote adapter state to {:?} ({} bytes)", path, body.len());
    Ok(())
}

#[async_trait]
impl LastNotificationTimes for FileStore {
    async fn get(&self, key: &CursorKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tables.cursors.get(key).copied())
    }

    async fn set(&self, key: &CursorKey, time: DateTime<Utc>) -> Result<(), StoreError> {
        self.transact(|tables| {
            tables.cursors.insert(key.clone(), time);
        })
        .await
    }

    async fn advance(
        &self,
        key: &CursorKey,
        time: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        {
            let state = self.state.lock().await;
            if let Some(current) = state.tables.cursors.get(key) {
                if *current >= time {
                    return Ok(*current);
                }
            }
        }
        self.transact(|tables| {
            let entry = tables.cursors.entry(key.clone()).or_insert(time);
            if *entry < time {
                *entry = time;
            }
            *entry
        })
        .await
    }
}

#[async_trait]
impl RegionRecoveryTable for FileStore {
    async fn mark_awaiting(&self, region: Region, connectivity: &str) -> Result<(), StoreError> {
        self.transact(|tables| {
            tables
                .recovery
                .insert((region, connectivity.to_string()), RecoveryStatus::Awaiting);
        })
        .await
    }

    async fn mark_ready(&self, region: Region, connectivity: &str) -> Result<(), StoreError> {
        self.transact(|tables| {
            tables
                .recovery
                .insert((region, connectivity.to_string()), RecoveryStatus::Ready);
        })
        .await
    }

    async fn status(
        &self,
        region: Region,
        connectivity: &str,
    ) -> Result<Option<RecoveryStatus>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .recovery
            .get(&(region, connectivity.to_string()))
            .copied())
    }

    async fn recovery_mode(&self, region: Region) -> Result<RecoveryMode, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tables.modes.get(&region).copied().unwrap_or_default())
    }

    async fn set_recovery_mode(
        &self,
        region: Region,
        mode: RecoveryMode,
    ) -> Result<(), StoreError> {
        self.transact(|tables| {
            tables.modes.insert(region, mode);
        })
        .await
    }
}

#[async_trait]
impl InvokeIdSequence for FileStore {
    async fn next_value(&self, name: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let next = state.next_values.get(name).copied().unwrap_or(1);
        let reserved = state.tables.reserved.get(name).copied().unwrap_or(0);

        if next > reserved {
            let mut tables = state.tables.clone();
            tables
                .reserved
                .insert(name.to_string(), next + self.sequence_block - 1);
            write_snapshot(&self.path, &tables.to_snapshot())?;
            state.tables = tables;
            debug!("Reserved {} values of sequence {}", self.sequence_block, name);
        }

        state.next_values.insert(name.to_string(), next + 1);
        Ok(next)
    }
}

#[async_trait]
impl RequestStatusLog for FileStore {
    async fn record(&self, message_key: &str, status: RequestStatus) -> Result<(), StoreError> {
        self.transact(|tables| {
            tables.requests.insert(message_key.to_string(), status);
        })
        .await
    }

    async fn latest(&self, message_key: &str) -> Result<Option<RequestStatus>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tables.requests.get(message_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NotificationTimeKind;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("npac.json");
        let key = CursorKey::new("1111", Region::new(2).unwrap(), NotificationTimeKind::ServiceProvider);
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        {
            let store = FileStore::open(&path, 10).await.unwrap();
            store.set(&key, time).await.unwrap();
            store.mark_awaiting(key.region, "gw-a").await.unwrap();
            store
                .set_recovery_mode(key.region, RecoveryMode::Swim)
                .await
                .unwrap();
            store
                .record("msg-1", RequestStatus::FailedForResend { reason: "session-invalid".into() })
                .await
                .unwrap();
        }

        let store = FileStore::open(&path, 10).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(time));
        assert_eq!(
            store.status(key.region, "gw-a").await.unwrap(),
            Some(RecoveryStatus::Awaiting)
        );
        assert_eq!(store.recovery_mode(key.region).await.unwrap(), RecoveryMode::Swim);
        assert!(matches!(
            store.latest("msg-1").await.unwrap(),
            Some(RequestStatus::FailedForResend { .. })
        ));
    }

    #[tokio::test]
    async fn test_sequence_resumes_above_reserved_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("npac.json");

        {
            let store = FileStore::open(&path, 5).await.unwrap();
            assert_eq!(store.next_value("invoke").await.unwrap(), 1);
            assert_eq!(store.next_value("invoke").await.unwrap(), 2);
        }

        // values 3..=5 were reserved but never used; they are skipped
        let store = FileStore::open(&path, 5).await.unwrap();
        assert_eq!(store.next_value("invoke").await.unwrap(), 6);
        assert_eq!(store.next_value("invoke").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("npac.json");
        {
            let store = FileStore::open(&path, 5).await.unwrap();
            store
                .mark_ready(Region::new(0).unwrap(), "gw-a")
                .await
                .unwrap();
        }

        let mut content = fs::read_to_string(&path).unwrap();
        content = content.replacen("ready", "await", 1);
        fs::write(&path, content).unwrap();

        assert!(matches!(
            FileStore::open(&path, 5).await,
            Err(StoreError::Corruption(_))
        ));
    }
}
