//! File-based journal backend
//!
//! Records are stored one JSON object per line in `journal.log` under the
//! storage directory. Appends go to the end of the file; compaction writes a
//! replacement file and renames it over the journal.

use super::{RecordIter, StorageBackend, StorageRecord};
use crate::{MqttError, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Storage format version
///
/// Only increment this when the record layout or file naming changes.
///
/// Version History:
/// - 1: Initial line-delimited JSON journal
const STORAGE_VERSION: &str = "1";

pub const JOURNAL_FILE: &str = "journal.log";
pub const COMPACTION_FILE: &str = "journal.compact";
const VERSION_FILE: &str = ".storage_version";

#[derive(Debug)]
pub struct FileBackend {
    base_dir: PathBuf,
    journal_path: PathBuf,
    writer: Mutex<File>,
    size: AtomicU64,
}

impl FileBackend {
    /// Opens (creating if needed) the journal in `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or a version mismatch
    /// is detected
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();

        fs::create_dir_all(&base_dir).await.map_err(|e| {
            MqttError::Configuration(format!(
                "Failed to create storage dir {}: {e}",
                base_dir.display()
            ))
        })?;
        Self::check_storage_version(&base_dir).await?;

        let journal_path = base_dir.join(JOURNAL_FILE);
        let writer = Self::open_writer(&journal_path).await?;
        let size = writer.metadata().await?.len();

        info!(
            "Initialized file storage backend at: {} ({} bytes)",
            base_dir.display(),
            size
        );

        Ok(Self {
            base_dir,
            journal_path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(size),
        })
    }

    async fn check_storage_version(base_dir: &Path) -> Result<()> {
        let version_file = base_dir.join(VERSION_FILE);

        if fs::try_exists(&version_file).await? {
            let stored_version = fs::read_to_string(&version_file).await.map_err(|e| {
                MqttError::Configuration(format!("Failed to read storage version: {e}"))
            })?;
            let stored_version = stored_version.trim();

            if stored_version != STORAGE_VERSION {
                return Err(MqttError::Configuration(format!(
                    "Storage version mismatch in {}: found version {}, expected version {}. \
                     Remove the directory or start with a different storage path.",
                    base_dir.display(),
                    stored_version,
                    STORAGE_VERSION
                )));
            }
        } else {
            fs::write(&version_file, STORAGE_VERSION).await.map_err(|e| {
                MqttError::Configuration(format!("Failed to write storage version: {e}"))
            })?;
            debug!("Wrote storage version {STORAGE_VERSION}");
        }
        Ok(())
    }

    async fn open_writer(path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?)
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    fn encode(record: &StorageRecord) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| MqttError::Storage(format!("Failed to encode record: {e}")))?;
        line.push(b'\n');
        Ok(line)
    }
}

impl StorageBackend for FileBackend {
    async fn append(&self, record: &StorageRecord) -> Result<()> {
        let line = Self::encode(record)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        if record.requires_sync() {
            writer.sync_data().await?;
        }
        self.size.fetch_add(line.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    fn iterate(&self) -> Result<RecordIter> {
        let file = match std::fs::File::open(&self.journal_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()));
            }
            Err(e) => return Err(e.into()),
        };

        let records = BufReader::new(file)
            .lines()
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .map(|line| {
                let line = line?;
                serde_json::from_str::<StorageRecord>(&line)
                    .map_err(|e| MqttError::Storage(format!("Corrupt journal record: {e}")))
            });
        Ok(Box::new(records))
    }

    async fn compact_to(&self, path: &Path, records: &[StorageRecord]) -> Result<()> {
        let mut writer = self.writer.lock().await;

        let mut contents = Vec::new();
        for record in records {
            contents.extend_from_slice(&Self::encode(record)?);
        }

        let mut file = File::create(path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(path, &self.journal_path).await?;
        *writer = Self::open_writer(&self.journal_path).await?;
        self.size.store(contents.len() as u64, Ordering::Release);
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    async fn clear(&self) -> Result<()> {
        let writer = self.writer.lock().await;
        writer.set_len(0).await?;
        writer.sync_all().await?;
        self.size.store(0, Ordering::Release);
        info!("Cleared journal at {}", self.journal_path.display());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.sync_all().await?;
        Ok(())
    }
}
