//! Record store: persisted job records plus the seen-set used for dedup.
//!
//! Layout on disk is two JSON files: an append-accumulating array of job
//! records and a map from dedup key to first-seen timestamp. Seen-entries
//! strictly older than the retention window are pruned on the next save
//! pass, trading recall for bounded growth: a posting that reappears after
//! the window is reported as new again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use seekwatch_core::{JobRecord, KeyField};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "seekwatch-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed data in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

type SeenMap = BTreeMap<String, DateTime<Utc>>;

/// JSON-file-backed record store.
///
/// The seen-set is held in memory behind a lock and flushed on every save;
/// both files are replaced with a write-to-temp-then-rename so a crash
/// mid-write never corrupts previously persisted data.
#[derive(Debug)]
pub struct JsonRecordStore {
    records_path: PathBuf,
    seen_path: PathBuf,
    retention: Duration,
    key_field: KeyField,
    seen: Mutex<SeenMap>,
}

impl JsonRecordStore {
    pub async fn open(
        records_path: impl Into<PathBuf>,
        seen_path: impl Into<PathBuf>,
        retention_days: i64,
        key_field: KeyField,
    ) -> Result<Self, StorageError> {
        let records_path = records_path.into();
        let seen_path = seen_path.into();
        let seen = read_json_or_default::<SeenMap>(&seen_path).await?;
        Ok(Self {
            records_path,
            seen_path,
            retention: Duration::days(retention_days),
            key_field,
            seen: Mutex::new(seen),
        })
    }

    pub fn key_field(&self) -> KeyField {
        self.key_field
    }

    /// True iff a non-expired seen-entry for `key` is present. Expiry is
    /// evaluated against the current clock, so an entry that outlived the
    /// retention window reads as absent even before the next prune pass.
    pub async fn exists(&self, key: &str) -> bool {
        let now = Utc::now();
        let seen = self.seen.lock().await;
        seen.get(key).is_some_and(|first| self.is_live(*first, now))
    }

    /// First-seen timestamp for `key`, expired entries included.
    pub async fn first_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        self.seen.lock().await.get(key).copied()
    }

    /// Append `records` to the persisted set and stamp their dedup keys as
    /// seen now. Keys already in the seen-set keep their original first-seen
    /// timestamp; entries older than the retention window are pruned.
    pub async fn save(&self, records: &[JobRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut seen = self.seen.lock().await;

        // Stage the new stamps and the prune aside; the shared map only
        // changes once both files are on disk, so a failed save never
        // suppresses a retry of the same batch.
        let mut staged = seen.clone();
        for record in records {
            let key = record.dedup_key(self.key_field);
            staged.entry(key.to_string()).or_insert(now);
        }

        let before = staged.len();
        staged.retain(|_, first| self.is_live(*first, now));
        let pruned = before - staged.len();
        if pruned > 0 {
            debug!(pruned, "pruned expired seen-entries");
        }

        write_json_atomic(&self.seen_path, &staged).await?;

        let mut all = read_json_or_default::<Vec<JobRecord>>(&self.records_path).await?;
        all.extend_from_slice(records);
        write_json_atomic(&self.records_path, &all).await?;

        *seen = staged;

        info!(
            saved = records.len(),
            total = all.len(),
            path = %self.records_path.display(),
            "persisted job records"
        );
        Ok(())
    }

    /// All persisted records, oldest first. Missing file reads as empty.
    pub async fn load(&self) -> Result<Vec<JobRecord>, StorageError> {
        read_json_or_default::<Vec<JobRecord>>(&self.records_path).await
    }

    /// Write the full record set to `path` as CSV, same atomic discipline as
    /// the JSON files. Returns the number of rows written.
    pub async fn export_csv(&self, path: &Path) -> Result<usize, StorageError> {
        let records = self.load().await?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record([
            "title",
            "company",
            "location",
            "classification",
            "subcategory",
            "job_url",
            "salary",
            "posted_date",
            "job_type",
            "description",
            "scraped_at",
        ])?;
        for record in &records {
            let scraped_at = record.scraped_at.to_rfc3339();
            writer.write_record([
                record.title.as_str(),
                record.company.as_str(),
                record.location.as_str(),
                record.classification.as_str(),
                record.subcategory.as_str(),
                record.job_url.as_str(),
                record.salary.as_deref().unwrap_or(""),
                record.posted_date.as_deref().unwrap_or(""),
                record.job_type.as_deref().unwrap_or(""),
                record.description.as_deref().unwrap_or(""),
                scraped_at.as_str(),
            ])?;
        }
        let bytes = writer.into_inner().map_err(|e| io_err(path, e.into_error()))?;
        write_atomic(path, &bytes).await?;
        info!(rows = records.len(), path = %path.display(), "exported csv");
        Ok(records.len())
    }

    fn is_live(&self, first_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(first_seen) <= self.retention
    }
}

async fn read_json_or_default<T>(path: &Path) -> Result<T, StorageError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Malformed {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(io_err(path, err)),
    }
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await
}

/// Write bytes to a sibling temp file, flush, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
    }

    let temp_name = format!(".{}.tmp", Uuid::new_v4());
    let temp_path = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(&temp_name),
        _ => PathBuf::from(&temp_name),
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    if let Err(err) = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await
    {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(&temp_path, err));
    }
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(io_err(path, err))
        }
    }
}
