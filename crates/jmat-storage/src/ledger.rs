//! Dedup Ledger: job id -> first-seen timestamp, persisted as a JSON object.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use jmat_core::JobId;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::write_atomic;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("reading ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger {path} is not a JSON object of timestamps: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding ledger: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing ledger {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub last_7_days: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

type Entries = Arc<RwLock<BTreeMap<String, DateTime<Utc>>>>;

/// Single-writer ledger. Mutations stay in memory until [`DedupLedger::flush`].
#[derive(Debug)]
pub struct DedupLedger {
    path: PathBuf,
    entries: Entries,
}

/// Read-only view of the ledger. It either shares a live writer's entries
/// or re-reads the persisted file on every query; it never writes.
#[derive(Debug, Clone)]
pub struct LedgerReader {
    source: ReaderSource,
}

#[derive(Debug, Clone)]
enum ReaderSource {
    Shared(Entries),
    File { path: PathBuf, retention: Duration },
}

impl DedupLedger {
    /// Load the ledger (a missing file is an empty ledger) and drop entries
    /// older than `retention`, persisting the result if anything was pruned.
    pub async fn open(
        path: impl Into<PathBuf>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<(Self, usize), LedgerError> {
        let path = path.into();
        let entries = load_entries(&path, now).await?;
        info!(path = %path.display(), entries = entries.len(), "loaded dedup ledger");

        let ledger = Self {
            path,
            entries: Arc::new(RwLock::new(entries)),
        };
        let pruned = ledger.prune(retention, now).await;
        if pruned > 0 {
            ledger.flush().await?;
        }
        Ok((ledger, pruned))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reader(&self) -> LedgerReader {
        LedgerReader {
            source: ReaderSource::Shared(Arc::clone(&self.entries)),
        }
    }

    pub async fn has_seen(&self, id: &JobId) -> bool {
        self.entries.read().await.contains_key(id.as_str())
    }

    /// Returns false when the id was already present; its first-seen
    /// timestamp is left untouched.
    pub async fn mark_seen(&self, id: &JobId, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(id.as_str()) {
            return false;
        }
        entries.insert(id.as_str().to_string(), now);
        true
    }

    /// Drop marks that never reached disk. Returns how many were removed.
    pub async fn unmark_batch(&self, ids: &[JobId]) -> usize {
        let mut entries = self.entries.write().await;
        ids.iter()
            .filter(|id| entries.remove(id.as_str()).is_some())
            .count()
    }

    pub async fn first_seen(&self, id: &JobId) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(id.as_str()).copied()
    }

    /// Remove entries strictly older than `retention`.
    pub async fn prune(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, first_seen| now.signed_duration_since(*first_seen) <= retention);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "pruned dedup ledger");
        }
        removed
    }

    pub async fn flush(&self) -> Result<(), LedgerError> {
        let bytes = {
            let entries = self.entries.read().await;
            serde_json::to_vec_pretty(&*entries)?
        };
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| LedgerError::Write {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> LedgerStats {
        stats_of(&*self.entries.read().await, now)
    }
}

impl LedgerReader {
    /// Reader over the persisted file, for processes that must not write the
    /// ledger. The file is validated here and re-read on every query; entries
    /// past `retention` are hidden, not removed.
    pub async fn load(path: impl Into<PathBuf>, retention: Duration) -> Result<Self, LedgerError> {
        let path = path.into();
        let entries = load_entries(&path, Utc::now()).await?;
        info!(path = %path.display(), entries = entries.len(), "opened dedup ledger read-only");
        Ok(Self {
            source: ReaderSource::File { path, retention },
        })
    }

    pub async fn has_seen(&self, id: &JobId) -> Result<bool, LedgerError> {
        match &self.source {
            ReaderSource::Shared(entries) => Ok(entries.read().await.contains_key(id.as_str())),
            ReaderSource::File { path, retention } => {
                let entries = file_snapshot(path, *retention, Utc::now()).await?;
                Ok(entries.contains_key(id.as_str()))
            }
        }
    }

    pub async fn len(&self) -> Result<usize, LedgerError> {
        match &self.source {
            ReaderSource::Shared(entries) => Ok(entries.read().await.len()),
            ReaderSource::File { path, retention } => {
                Ok(file_snapshot(path, *retention, Utc::now()).await?.len())
            }
        }
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<LedgerStats, LedgerError> {
        match &self.source {
            ReaderSource::Shared(entries) => Ok(stats_of(&*entries.read().await, now)),
            ReaderSource::File { path, retention } => {
                Ok(stats_of(&file_snapshot(path, *retention, now).await?, now))
            }
        }
    }
}

/// Current file contents minus entries past `retention`; the file is untouched.
async fn file_snapshot(
    path: &Path,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, DateTime<Utc>>, LedgerError> {
    let mut entries = load_entries(path, now).await?;
    entries.retain(|_, first_seen| now.signed_duration_since(*first_seen) <= retention);
    Ok(entries)
}

fn stats_of(entries: &BTreeMap<String, DateTime<Utc>>, now: DateTime<Utc>) -> LedgerStats {
    let week_ago = now - Duration::days(7);
    LedgerStats {
        total: entries.len(),
        last_7_days: entries.values().filter(|ts| **ts > week_ago).count(),
        oldest: entries.values().min().copied(),
        newest: entries.values().max().copied(),
    }
}

async fn load_entries(
    path: &Path,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, DateTime<Utc>>, LedgerError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(LedgerError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let raw: BTreeMap<String, String> =
        serde_json::from_str(&text).map_err(|source| LedgerError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    let mut entries = BTreeMap::new();
    for (id, stamp) in raw {
        let first_seen = parse_timestamp(&stamp).unwrap_or_else(|| {
            warn!(%id, %stamp, "unreadable first-seen timestamp; restarting its retention clock");
            now
        });
        entries.insert(id, first_seen);
    }
    Ok(entries)
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(stamp) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
