//! Capped, most-recent-first ledger of task summaries.
//!
//! The backing JSON file is shared by every view on the device. Mutations
//! re-read the file, apply the change and write it back straight away; other
//! views pick the change up through [`HistoryStore::spawn_sync`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::core::error::StorageError;
use crate::core::task::{TaskRecord, TaskStatus};
use crate::utils::fs::{read_json, write_json_atomic};

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    capacity: usize,
    records: RwLock<Vec<TaskRecord>>,
    tx: watch::Sender<Vec<TaskRecord>>,
}

async fn load_records(path: &Path) -> Option<Vec<TaskRecord>> {
    match read_json::<Vec<TaskRecord>>(path).await {
        Ok(records) => Some(records.unwrap_or_default()),
        Err(e) => {
            tracing::warn!("Ignoring unreadable history file {}: {}", path.display(), e);
            None
        }
    }
}

impl HistoryStore {
    pub async fn open(path: PathBuf, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut records = load_records(&path).await.unwrap_or_default();
        records.truncate(capacity);
        tracing::debug!("Opened history at {} ({} records)", path.display(), records.len());

        let (tx, _) = watch::channel(records.clone());
        Self {
            inner: Arc::new(Inner {
                path,
                capacity,
                records: RwLock::new(records),
                tx,
            }),
        }
    }

    /// Insert a new record at the front, or update an existing one in place.
    pub async fn save(&self, record: TaskRecord) -> Result<(), StorageError> {
        self.mutate(move |records| {
            if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
                *existing = record;
            } else {
                records.insert(0, record);
            }
        })
        .await
    }

    /// Returns false when the record is missing or already terminal.
    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<bool, StorageError> {
        self.mutate(|records| match records.iter_mut().find(|r| r.id == id) {
            Some(record) if record.status == status => true,
            Some(record) if record.status.can_transition_to(status) => {
                record.status = status;
                true
            }
            Some(record) => {
                tracing::debug!(
                    "Ignoring status change {} -> {} for task {}",
                    record.status,
                    status,
                    id
                );
                false
            }
            None => false,
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            records.len() != before
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.mutate(|records| records.clear()).await
    }

    pub async fn list(&self) -> Vec<TaskRecord> {
        self.inner.records.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        self.inner
            .records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TaskRecord>> {
        self.inner.tx.subscribe()
    }

    /// Pick up changes written by another view. Returns whether anything changed.
    pub async fn reload(&self) -> bool {
        let Some(mut latest) = load_records(&self.inner.path).await else {
            return false;
        };
        latest.truncate(self.inner.capacity);

        let mut guard = self.inner.records.write().await;
        if *guard == latest {
            return false;
        }
        *guard = latest.clone();
        drop(guard);

        tracing::debug!("History changed on disk ({} records)", latest.len());
        self.inner.tx.send_replace(latest);
        true
    }

    /// Periodically re-read the shared file so changes from other views show
    /// up within `interval`.
    pub fn spawn_sync(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.reload().await;
            }
        })
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut Vec<TaskRecord>) -> R) -> Result<R, StorageError> {
        let mut guard = self.inner.records.write().await;
        let mut records = match load_records(&self.inner.path).await {
            Some(on_disk) => on_disk,
            None => guard.clone(),
        };

        let out = f(&mut records);
        // Newest first, so the tail holds the oldest inserted records.
        records.truncate(self.inner.capacity);

        write_json_atomic(&self.inner.path, &records).await?;
        *guard = records.clone();
        drop(guard);

        self.inner.tx.send_replace(records);
        Ok(out)
    }
}
