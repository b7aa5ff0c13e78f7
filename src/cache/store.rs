//! Byte stores backing each cache tier.
//!
//! Memory tiers keep page bytes in a sharded map; storage tiers write one
//! file per page under a two-level shard directory. Disk writes go to a
//! temporary file first and are renamed into place, so a reader never sees
//! a partially written page.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cache::page::{PageKey, Tier};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Page {0} not present in store")]
    NotFound(PageKey),

    #[error("Writes to {0} tier are failing")]
    WriteFailed(Tier),
}

/// Byte storage for one tier.
#[async_trait]
pub trait TierStore: Send + Sync {
    fn tier(&self) -> Tier;

    async fn write(&self, key: PageKey, data: Bytes) -> Result<(), StoreError>;

    async fn read(&self, key: PageKey) -> Result<Bytes, StoreError>;

    /// Remove a page. Removing an absent page is not an error.
    async fn delete(&self, key: PageKey) -> Result<(), StoreError>;

    fn stats(&self) -> StoreStats;
}

/// I/O counters for a store.
#[derive(Debug, Default)]
struct IoCounters {
    writes: AtomicU64,
    reads: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl IoCounters {
    fn record_write(&self, n: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_read(&self, n: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            total_writes: self.writes.load(Ordering::Relaxed),
            total_reads: self.reads.load(Ordering::Relaxed),
            total_bytes_written: self.bytes_written.load(Ordering::Relaxed),
            total_bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_writes: u64,
    pub total_reads: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

/// In-memory store for the device and host tiers.
#[derive(Debug)]
pub struct MemoryStore {
    tier: Tier,
    pages: DashMap<PageKey, Bytes>,
    fail_writes: AtomicBool,
    counters: IoCounters,
}

impl MemoryStore {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            pages: DashMap::new(),
            fail_writes: AtomicBool::new(false),
            counters: IoCounters::default(),
        }
    }

    /// Make subsequent writes fail, as a full or faulty device would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Replace stored bytes without bookkeeping. Used to simulate bit rot.
    pub fn overwrite(&self, key: PageKey, data: Bytes) {
        self.pages.insert(key, data);
    }

    pub fn contains(&self, key: PageKey) -> bool {
        self.pages.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[async_trait]
impl TierStore for MemoryStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn write(&self, key: PageKey, data: Bytes) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::WriteFailed(self.tier));
        }
        self.counters.record_write(data.len());
        self.pages.insert(key, data);
        Ok(())
    }

    async fn read(&self, key: PageKey) -> Result<Bytes, StoreError> {
        let data = self
            .pages
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(key))?;
        self.counters.record_read(data.len());
        Ok(data)
    }

    async fn delete(&self, key: PageKey) -> Result<(), StoreError> {
        self.pages.remove(&key);
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }
}

/// File-per-page store for the local storage and remote object tiers.
#[derive(Debug)]
pub struct DiskStore {
    tier: Tier,
    root: PathBuf,
    fail_writes: AtomicBool,
    counters: IoCounters,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(tier: Tier, root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            tier,
            root,
            fail_writes: AtomicBool::new(false),
            counters: IoCounters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// File path for a page.
    ///
    /// Uses a two-level directory structure to avoid too many files in one
    /// directory: key 0xab12... → ab/ab12....kvpage
    pub fn page_path(&self, key: PageKey) -> PathBuf {
        let shard = key.0 >> 56;
        self.root
            .join(format!("{shard:02x}"))
            .join(format!("{key}.kvpage"))
    }

    /// Bytes on disk under the store root.
    pub async fn disk_usage(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                total += meta.len();
            } else if meta.is_dir() {
                let mut sub_entries = fs::read_dir(entry.path()).await?;
                while let Some(sub) = sub_entries.next_entry().await? {
                    let sub_meta = sub.metadata().await?;
                    if sub_meta.is_file() {
                        total += sub_meta.len();
                    }
                }
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl TierStore for DiskStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn write(&self, key: PageKey, data: Bytes) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::WriteFailed(self.tier));
        }
        let path = self.page_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("kvpage.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        // Contents must be durable before the rename makes them visible.
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        debug!(
            key = %key,
            path = %path.display(),
            size = data.len(),
            tier = %self.tier,
            "Wrote page to disk"
        );
        self.counters.record_write(data.len());
        Ok(())
    }

    async fn read(&self, key: PageKey) -> Result<Bytes, StoreError> {
        let path = self.page_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key))
            }
            Err(e) => return Err(e.into()),
        };
        debug!(key = %key, size = data.len(), tier = %self.tier, "Read page from disk");
        self.counters.record_read(data.len());
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: PageKey) -> Result<(), StoreError> {
        let path = self.page_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, path = %path.display(), "Deleted page file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_page() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(Tier::LocalStorage, tmp.path().join("ssd"))
            .await
            .unwrap();

        let data = Bytes::from(vec![42u8; 4096]);
        store.write(PageKey(0xab00_0000_0000_0001), data.clone()).await.unwrap();
        let path = store.page_path(PageKey(0xab00_0000_0000_0001));
        assert!(path.exists());
        assert!(path.parent().unwrap().ends_with("ab"));

        let read = store.read(PageKey(0xab00_0000_0000_0001)).await.unwrap();
        assert_eq!(read, data);
        assert_eq!(store.stats().total_writes, 1);
        assert_eq!(store.disk_usage().await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_page_and_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(Tier::LocalStorage, tmp.path().to_path_buf())
            .await
            .unwrap();

        store.write(PageKey(9), Bytes::from(vec![1u8; 512])).await.unwrap();
        store.write(PageKey(9), Bytes::from(vec![2u8; 256])).await.unwrap();
        assert_eq!(store.read(PageKey(9)).await.unwrap(), Bytes::from(vec![2u8; 256]));

        let path = store.page_path(PageKey(9));
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![path.file_name().unwrap().to_os_string()]);
    }

    #[tokio::test]
    async fn test_delete_page() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(Tier::LocalStorage, tmp.path().to_path_buf())
            .await
            .unwrap();

        store.write(PageKey(5), Bytes::from(vec![1u8; 1024])).await.unwrap();
        store.delete(PageKey(5)).await.unwrap();
        store.delete(PageKey(5)).await.unwrap();

        let result = store.read(PageKey(5)).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store_fault_injection() {
        let store = MemoryStore::new(Tier::HostMemory);
        store.set_fail_writes(true);
        assert!(matches!(
            store.write(PageKey(1), Bytes::from_static(b"ab")).await,
            Err(StoreError::WriteFailed(Tier::HostMemory))
        ));
        store.set_fail_writes(false);
        store.write(PageKey(1), Bytes::from_static(b"ab")).await.unwrap();
        assert!(store.contains(PageKey(1)));
    }
}
