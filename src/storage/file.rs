//! Local JSON file persistence.
//!
//! The attack log is a single JSON array rewritten on every append. Batch
//! writes become one snapshot file per batch under
//! `<data_dir>/<collection>/`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use tokio::fs;
use tokio::sync::Mutex;

use crate::core::AttackEvent;
use crate::storage::{AttackLog, RecordSink, StoreError};
use crate::utils::format_file_stamp;

/// Writes record batches as timestamped JSON files
#[derive(Debug)]
pub struct LocalSnapshot {
    data_dir: PathBuf,
    /// Disambiguates snapshots written within the same second
    seq: AtomicU64,
}

impl LocalSnapshot {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Write `records` to `<data_dir>/<collection>/<collection>_<stamp>_<seq>.json`
    pub async fn write_snapshot(
        &self,
        collection: &str,
        records: &[serde_json::Value],
    ) -> Result<PathBuf, StoreError> {
        let dir = self.data_dir.join(collection);
        fs::create_dir_all(&dir).await?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "{}_{}_{:04}.json",
            collection,
            format_file_stamp(Utc::now()),
            seq
        ));
        let body = serde_json::to_vec_pretty(records)?;
        fs::write(&path, body).await?;

        info!("Saved {} records to {}", records.len(), path.display());
        Ok(path)
    }
}

/// File-backed attack log and record sink
#[derive(Debug)]
pub struct FileStore {
    log_file: PathBuf,
    /// Serialises read-modify-write cycles on the log file
    log_lock: Mutex<()>,
    snapshots: LocalSnapshot,
}

impl FileStore {
    pub fn new(log_file: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            log_file,
            log_lock: Mutex::new(()),
            snapshots: LocalSnapshot::new(data_dir),
        }
    }

    /// Read the log file. A missing file is an empty log; `None` means the
    /// file exists but is not a JSON array of events.
    async fn parse_events(&self) -> Result<Option<Vec<AttackEvent>>, StoreError> {
        let bytes = match fs::read(&self.log_file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some(Vec::new())),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Some(Vec::new()));
        }

        match serde_json::from_slice::<Vec<AttackEvent>>(&bytes) {
            Ok(events) => Ok(Some(events)),
            Err(e) => {
                warn!(
                    "Attack log {} is not a JSON array of events: {}",
                    self.log_file.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Events for reading; an unparsable log reads as empty
    async fn read_events(&self) -> Result<Vec<AttackEvent>, StoreError> {
        Ok(self.parse_events().await?.unwrap_or_default())
    }

    /// Move an unparsable log to `<log_file>.corrupt-<stamp>` so appends
    /// start a new file without losing it
    async fn set_aside(&self) -> Result<PathBuf, StoreError> {
        let mut name = self.log_file.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", format_file_stamp(Utc::now())));
        let target = PathBuf::from(name);
        fs::rename(&self.log_file, &target).await?;
        warn!(
            "Moved unreadable attack log {} to {}",
            self.log_file.display(),
            target.display()
        );
        Ok(target)
    }

    async fn write_events(&self, events: &[AttackEvent]) -> Result<(), StoreError> {
        if let Some(parent) = self.log_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(events)?;
        fs::write(&self.log_file, body).await?;
        Ok(())
    }
}

#[async_trait]
impl AttackLog for FileStore {
    async fn log_attack(&self, event: &AttackEvent) -> Result<(), StoreError> {
        let _guard = self.log_lock.lock().await;
        let mut events = match self.parse_events().await? {
            Some(events) => events,
            None => {
                self.set_aside().await?;
                Vec::new()
            }
        };
        events.push(event.clone());
        self.write_events(&events).await?;

        info!(
            "Logged attack: {} from {}",
            event.attack_type, event.source
        );
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AttackEvent>, StoreError> {
        let _guard = self.log_lock.lock().await;
        let mut events = self.read_events().await?;
        // Stable sort keeps append order among equal timestamps; reverse after
        // so later appends come first.
        events.sort_by_key(|event| event.timestamp);
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.log_lock.lock().await;
        self.write_events(&[]).await
    }
}

#[async_trait]
impl RecordSink for FileStore {
    async fn insert_batch(
        &self,
        collection: &str,
        records: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        self.snapshots.write_snapshot(collection, records).await?;
        Ok(())
    }
}
