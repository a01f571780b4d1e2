//! Storage layer for broker persistence
//!
//! State changes that must survive a restart are appended as
//! [`StorageRecord`]s to a journal. On startup the journal is folded into a
//! [`RecoveredState`]; while running, the same fold is kept in memory so the
//! journal can be compacted down to it once it grows past the size limit.

pub mod file_backend;
pub mod memory_backend;

pub use file_backend::FileBackend;
pub use memory_backend::MemoryBackend;


use super::config::BrokerConfig;
use super::message::{Delivery, Message};
use crate::{MqttError, QoS, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub arrived_at: u64,
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload.to_vec(),
            qos: message.qos,
            retain: message.retain,
            arrived_at: message.arrived_at,
        }
    }
}

impl StoredMessage {
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: Bytes::from(self.payload.clone()),
            qos: self.qos,
            retain: self.retain,
            arrived_at: self.arrived_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub client_id: String,
    pub subscriptions: BTreeMap<String, QoS>,
}

/// One journal entry. Only persistent sessions and retained messages are
/// journaled; clean sessions end with their connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageRecord {
    RetainedSet {
        message: StoredMessage,
    },
    RetainedCleared {
        topic: String,
    },
    SessionSaved {
        session: StoredSession,
    },
    SessionRemoved {
        client_id: String,
    },
    OutboundStored {
        client_id: String,
        packet_id: u16,
        qos: QoS,
        retain: bool,
        message: StoredMessage,
    },
    /// PUBREC received for an outbound QoS 2 copy.
    OutboundReleased {
        client_id: String,
        packet_id: u16,
    },
    OutboundAcked {
        client_id: String,
        packet_id: u16,
    },
    IncomingStored {
        client_id: String,
        packet_id: u16,
        message: StoredMessage,
    },
    IncomingReleased {
        client_id: String,
        packet_id: u16,
    },
    Queued {
        client_id: String,
        qos: QoS,
        message: StoredMessage,
    },
    QueueDrained {
        client_id: String,
    },
}

impl StorageRecord {
    #[must_use]
    pub fn outbound_stored(client_id: &str, packet_id: u16, delivery: &Delivery) -> Self {
        Self::OutboundStored {
            client_id: client_id.to_string(),
            packet_id,
            qos: delivery.qos,
            retain: delivery.retain,
            message: StoredMessage::from(delivery.message.as_ref()),
        }
    }

    /// Records describing QoS handshake state are synced to disk before the
    /// append returns.
    #[must_use]
    pub fn requires_sync(&self) -> bool {
        !matches!(
            self,
            Self::RetainedSet { .. }
                | Self::RetainedCleared { .. }
                | Self::SessionSaved { .. }
                | Self::SessionRemoved { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredOutbound {
    pub packet_id: u16,
    pub qos: QoS,
    pub retain: bool,
    pub message: StoredMessage,
    pub released: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredSession {
    pub session: StoredSession,
    /// Oldest first.
    pub outbound: Vec<RecoveredOutbound>,
    pub incoming: BTreeMap<u16, StoredMessage>,
    pub queued: Vec<(QoS, StoredMessage)>,
}

impl RecoveredSession {
    fn new(session: StoredSession) -> Self {
        Self {
            session,
            outbound: Vec::new(),
            incoming: BTreeMap::new(),
            queued: Vec::new(),
        }
    }
}

/// The journal folded into the state it describes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredState {
    pub retained: BTreeMap<String, StoredMessage>,
    pub sessions: BTreeMap<String, RecoveredSession>,
}

impl RecoveredState {
    /// Folds records in journal order. Unreadable records are skipped.
    pub fn fold(records: impl IntoIterator<Item = Result<StorageRecord>>) -> Self {
        let mut state = Self::default();
        let mut skipped = 0usize;
        for record in records {
            match record {
                Ok(record) => state.apply(&record),
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping unreadable journal record: {e}");
                }
            }
        }
        if skipped > 0 {
            warn!("Recovered journal with {skipped} unreadable records");
        }
        state
    }

    pub fn apply(&mut self, record: &StorageRecord) {
        match record {
            StorageRecord::RetainedSet { message } => {
                self.retained.insert(message.topic.clone(), message.clone());
            }
            StorageRecord::RetainedCleared { topic } => {
                self.retained.remove(topic);
            }
            StorageRecord::SessionSaved { session } => {
                self.sessions
                    .entry(session.client_id.clone())
                    .and_modify(|existing| existing.session = session.clone())
                    .or_insert_with(|| RecoveredSession::new(session.clone()));
            }
            StorageRecord::SessionRemoved { client_id } => {
                self.sessions.remove(client_id);
            }
            StorageRecord::OutboundStored {
                client_id,
                packet_id,
                qos,
                retain,
                message,
            } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.outbound.retain(|o| o.packet_id != *packet_id);
                    session.outbound.push(RecoveredOutbound {
                        packet_id: *packet_id,
                        qos: *qos,
                        retain: *retain,
                        message: message.clone(),
                        released: false,
                    });
                }
            }
            StorageRecord::OutboundReleased {
                client_id,
                packet_id,
            } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    if let Some(outbound) = session
                        .outbound
                        .iter_mut()
                        .find(|o| o.packet_id == *packet_id)
                    {
                        outbound.released = true;
                    }
                }
            }
            StorageRecord::OutboundAcked {
                client_id,
                packet_id,
            } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.outbound.retain(|o| o.packet_id != *packet_id);
                }
            }
            StorageRecord::IncomingStored {
                client_id,
                packet_id,
                message,
            } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.incoming.insert(*packet_id, message.clone());
                }
            }
            StorageRecord::IncomingReleased {
                client_id,
                packet_id,
            } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.incoming.remove(packet_id);
                }
            }
            StorageRecord::Queued {
                client_id,
                qos,
                message,
            } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.queued.push((*qos, message.clone()));
                }
            }
            StorageRecord::QueueDrained { client_id } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.queued.clear();
                }
            }
        }
    }

    /// The shortest record sequence that folds back into this state.
    #[must_use]
    pub fn to_records(&self) -> Vec<StorageRecord> {
        let mut records: Vec<StorageRecord> = self
            .retained
            .values()
            .map(|message| StorageRecord::RetainedSet {
                message: message.clone(),
            })
            .collect();

        for (client_id, recovered) in &self.sessions {
            records.push(StorageRecord::SessionSaved {
                session: recovered.session.clone(),
            });
            for outbound in &recovered.outbound {
                records.push(StorageRecord::OutboundStored {
                    client_id: client_id.clone(),
                    packet_id: outbound.packet_id,
                    qos: outbound.qos,
                    retain: outbound.retain,
                    message: outbound.message.clone(),
                });
                if outbound.released {
                    records.push(StorageRecord::OutboundReleased {
                        client_id: client_id.clone(),
                        packet_id: outbound.packet_id,
                    });
                }
            }
            for (packet_id, message) in &recovered.incoming {
                records.push(StorageRecord::IncomingStored {
                    client_id: client_id.clone(),
                    packet_id: *packet_id,
                    message: message.clone(),
                });
            }
            for (qos, message) in &recovered.queued {
                records.push(StorageRecord::Queued {
                    client_id: client_id.clone(),
                    qos: *qos,
                    message: message.clone(),
                });
            }
        }
        records
    }
}

pub type RecordIter = Box<dyn Iterator<Item = Result<StorageRecord>> + Send>;

/// Append-only record store.
pub trait StorageBackend: Send + Sync {
    /// Appends one record at the end of the journal.
    fn append(&self, record: &StorageRecord) -> impl Future<Output = Result<()>> + Send;

    /// A fresh lazy iterator over every record, oldest first. Each call
    /// starts again from the beginning.
    ///
    /// # Errors
    /// Returns an error if the journal cannot be opened.
    fn iterate(&self) -> Result<RecordIter>;

    /// Writes `records` into `path` and makes that file the journal.
    fn compact_to(
        &self,
        path: &Path,
        records: &[StorageRecord],
    ) -> impl Future<Output = Result<()>> + Send;

    fn size_bytes(&self) -> u64;

    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    /// Forces appended records to durable storage.
    fn flush(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Dynamic storage backend that can hold different implementations
#[derive(Debug)]
pub enum DynamicStorage {
    File(FileBackend),
    Memory(MemoryBackend),
}

impl StorageBackend for DynamicStorage {
    async fn append(&self, record: &StorageRecord) -> Result<()> {
        match self {
            Self::File(backend) => backend.append(record).await,
            Self::Memory(backend) => backend.append(record).await,
        }
    }

    fn iterate(&self) -> Result<RecordIter> {
        match self {
            Self::File(backend) => backend.iterate(),
            Self::Memory(backend) => backend.iterate(),
        }
    }

    async fn compact_to(&self, path: &Path, records: &[StorageRecord]) -> Result<()> {
        match self {
            Self::File(backend) => backend.compact_to(path, records).await,
            Self::Memory(backend) => backend.compact_to(path, records).await,
        }
    }

    fn size_bytes(&self) -> u64 {
        match self {
            Self::File(backend) => backend.size_bytes(),
            Self::Memory(backend) => backend.size_bytes(),
        }
    }

    async fn clear(&self) -> Result<()> {
        match self {
            Self::File(backend) => backend.clear().await,
            Self::Memory(backend) => backend.clear().await,
        }
    }

    async fn flush(&self) -> Result<()> {
        match self {
            Self::File(backend) => backend.flush().await,
            Self::Memory(backend) => backend.flush().await,
        }
    }
}

/// Bounded exponential backoff for journal appends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageRetry {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: f64,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

impl StorageRetry {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial_delay
            .mul_f64(self.factor.powi(attempt.try_into().unwrap_or(i32::MAX)))
    }
}

/// Journal facade used by the broker.
#[derive(Debug)]
pub struct Storage {
    backend: DynamicStorage,
    retry: StorageRetry,
    /// Folded view of everything appended so far; its lock also orders
    /// appends against compaction.
    state: Mutex<RecoveredState>,
    size_limit: u64,
    compaction_path: PathBuf,
    healthy: AtomicBool,
}

impl Storage {
    #[must_use]
    pub fn new(
        backend: DynamicStorage,
        state: RecoveredState,
        size_limit: u64,
        compaction_path: PathBuf,
    ) -> Self {
        Self {
            backend,
            retry: StorageRetry::default(),
            state: Mutex::new(state),
            size_limit,
            compaction_path,
            healthy: AtomicBool::new(true),
        }
    }

    /// Volatile storage with the default size limit.
    #[must_use]
    pub fn memory() -> Self {
        Self::volatile(BrokerConfig::default().storage_size_limit)
    }

    /// Volatile storage for brokers without persistence. The record list is
    /// still compacted once it grows past `size_limit` bytes.
    #[must_use]
    pub fn volatile(size_limit: u64) -> Self {
        Self::new(
            DynamicStorage::Memory(MemoryBackend::new()),
            RecoveredState::default(),
            size_limit,
            PathBuf::new(),
        )
    }

    /// Opens the configured backend and replays its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be prepared or read
    pub async fn open(config: &BrokerConfig) -> Result<(Self, RecoveredState)> {
        if !config.enable_persistence {
            info!("Persistence disabled, using in-memory storage");
            return Ok((
                Self::volatile(config.storage_size_limit),
                RecoveredState::default(),
            ));
        }

        let backend = FileBackend::new(&config.storage_path).await?;
        let state = RecoveredState::fold(backend.iterate()?);
        info!(
            "Recovered {} retained messages and {} persistent sessions from {}",
            state.retained.len(),
            state.sessions.len(),
            config.storage_path.display()
        );

        let storage = Self::new(
            DynamicStorage::File(backend),
            state.clone(),
            config.storage_size_limit,
            config.storage_path.join(file_backend::COMPACTION_FILE),
        )
        .with_retry(StorageRetry::default());
        Ok((storage, state))
    }

    #[must_use]
    pub fn with_retry(mut self, retry: StorageRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(&self) -> &DynamicStorage {
        &self.backend
    }

    /// False after an append exhausted its retries, until one succeeds again.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Appends with bounded retries.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::Storage` once every retry failed
    pub async fn append(&self, record: StorageRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut attempt = 0;
        loop {
            match self.backend.append(&record).await {
                Ok(()) => {
                    state.apply(&record);
                    self.healthy.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Storage append failed (attempt {}), retrying in {:?}: {e}",
                        attempt + 1,
                        delay
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.healthy.store(false, Ordering::Release);
                    error!(
                        "Storage append failed after {} attempts: {e}",
                        attempt + 1
                    );
                    return Err(MqttError::Storage(e.to_string()));
                }
            }
        }
    }

    /// Rewrites the journal as its folded state when it exceeds the size
    /// limit. Returns whether a compaction ran.
    ///
    /// # Errors
    ///
    /// Returns an error if rewriting the journal fails
    pub async fn compact_if_needed(&self) -> Result<bool> {
        if self.backend.size_bytes() <= self.size_limit {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns an error if rewriting the journal fails
    pub async fn compact(&self) -> Result<()> {
        let state = self.state.lock().await;
        let before = self.backend.size_bytes();
        let records = state.to_records();
        self.backend
            .compact_to(&self.compaction_path, &records)
            .await?;
        debug!(
            "Compacted journal from {} to {} bytes ({} records)",
            before,
            self.backend.size_bytes(),
            records.len()
        );
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the backend cannot sync
    pub async fn flush(&self) -> Result<()> {
        let _state = self.state.lock().await;
        self.backend.flush().await
    }

    /// Drops every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be truncated
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.backend.clear().await?;
        *state = RecoveredState::default();
        Ok(())
    }

    /// Snapshot of the folded state.
    pub async fn snapshot(&self) -> RecoveredState {
        self.state.lock().await.clone()
    }
}

/// Shared handle type used across the broker.
pub type SharedStorage = Arc<Storage>;
