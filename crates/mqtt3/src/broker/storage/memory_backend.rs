//! In-memory journal backend (testing and non-persistent brokers)
//!
//! Keeps records in a vector. Nothing survives the process.

use super::{RecordIter, StorageBackend, StorageRecord};
use crate::{MqttError, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<StorageRecord>>,
    size: AtomicU64,
    failures_remaining: AtomicUsize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail.
    pub fn inject_failures(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::Release);
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    fn encoded_len(record: &StorageRecord) -> u64 {
        serde_json::to_vec(record).map_or(0, |v| v.len() as u64 + 1)
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StorageBackend for MemoryBackend {
    async fn append(&self, record: &StorageRecord) -> Result<()> {
        if self.take_failure() {
            return Err(MqttError::Io("injected append failure".to_string()));
        }
        self.size
            .fetch_add(Self::encoded_len(record), Ordering::AcqRel);
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn iterate(&self) -> Result<RecordIter> {
        let snapshot = self.records.lock().clone();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    async fn compact_to(&self, _path: &Path, records: &[StorageRecord]) -> Result<()> {
        let size = records.iter().map(Self::encoded_len).sum();
        *self.records.lock() = records.to_vec();
        self.size.store(size, Ordering::Release);
        debug!("Compacted in-memory journal to {} records", records.len());
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    async fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        self.size.store(0, Ordering::Release);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
