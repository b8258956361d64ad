//! Application Ledger: at most one "applied" record per job URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jmat_core::{ApplicationRecord, JobReference};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::write_atomic;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("application store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("application store {path} is not a JSON array of records: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding application records: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    fn backend(&self) -> &'static str;
    async fn exists(&self, job_url: &str) -> Result<bool, StoreError>;
    async fn insert(&self, record: &ApplicationRecord) -> Result<InsertOutcome, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryApplicationStore {
    records: Mutex<Vec<ApplicationRecord>>,
}

impl MemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ApplicationRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ApplicationStore for MemoryApplicationStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, job_url: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.iter().any(|r| r.job_url == job_url))
    }

    async fn insert(&self, record: &ApplicationRecord) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.job_url == record.job_url) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        records.push(record.clone());
        Ok(InsertOutcome::Created)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.lock().await.len())
    }
}

/// JSON array of records, re-read and atomically rewritten on every insert.
#[derive(Debug)]
pub struct FileApplicationStore {
    path: PathBuf,
    io: Mutex<()>,
}

impl FileApplicationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn records(&self) -> Result<Vec<ApplicationRecord>, StoreError> {
        let _io = self.io.lock().await;
        self.load().await
    }

    async fn load(&self) -> Result<Vec<ApplicationRecord>, StoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl ApplicationStore for FileApplicationStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn exists(&self, job_url: &str) -> Result<bool, StoreError> {
        let _io = self.io.lock().await;
        Ok(self.load().await?.iter().any(|r| r.job_url == job_url))
    }

    async fn insert(&self, record: &ApplicationRecord) -> Result<InsertOutcome, StoreError> {
        let _io = self.io.lock().await;
        let mut records = self.load().await?;
        if records.iter().any(|r| r.job_url == record.job_url) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        records.push(record.clone());
        let bytes = serde_json::to_vec_pretty(&records)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(InsertOutcome::Created)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let _io = self.io.lock().await;
        Ok(self.load().await?.len())
    }
}

#[derive(Debug, Clone)]
pub struct PgApplicationStore {
    pool: PgPool,
}

impl PgApplicationStore {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ApplicationStore for PgApplicationStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn exists(&self, job_url: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (SELECT 1 FROM applications WHERE job_url = $1) AS present
            "#,
        )
        .bind(job_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert(&self, record: &ApplicationRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO applications
                (job_url, actor, logged_at, score, profile, note,
                 title, company, location, concepts, source, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (job_url) DO NOTHING
            "#,
        )
        .bind(&record.job_url)
        .bind(&record.actor)
        .bind(record.logged_at)
        .bind(record.score as i32)
        .bind(&record.profile)
        .bind(&record.note)
        .bind(&record.title)
        .bind(&record.company)
        .bind(&record.location)
        .bind(&record.concepts)
        .bind(&record.source)
        .bind(&record.status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Created)
        }
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM applications")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(usize::try_from(total).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    AlreadyPresent,
}

/// Idempotent recorder. Acknowledgments for the same URL are serialized
/// through a per-URL gate, so concurrent callers cannot both write.
pub struct ApplicationLedger {
    store: Arc<dyn ApplicationStore>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ApplicationLedger {
    pub fn new(store: Arc<dyn ApplicationStore>) -> Self {
        Self {
            store,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ApplicationStore> {
        &self.store
    }

    async fn gate_for(&self, job_url: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(job_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_gate(&self, job_url: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().await;
        // our clone goes while the map is locked; only the entry may remain
        drop(gate);
        if gates
            .get(job_url)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            gates.remove(job_url);
        }
    }

    pub async fn record_if_absent(
        &self,
        reference: &JobReference,
        actor: &str,
        logged_at: DateTime<Utc>,
        note: &str,
    ) -> Result<RecordOutcome, StoreError> {
        let gate = self.gate_for(&reference.url).await;
        let outcome = {
            let _held = gate.lock().await;
            self.record_locked(reference, actor, logged_at, note).await
        };
        self.release_gate(&reference.url, gate).await;
        outcome
    }

    async fn record_locked(
        &self,
        reference: &JobReference,
        actor: &str,
        logged_at: DateTime<Utc>,
        note: &str,
    ) -> Result<RecordOutcome, StoreError> {
        if self.store.exists(&reference.url).await? {
            info!(url = %reference.url, "application already recorded");
            return Ok(RecordOutcome::AlreadyPresent);
        }

        let record = ApplicationRecord::from_reference(reference, actor, logged_at, note);
        match self.store.insert(&record).await? {
            InsertOutcome::Created => {
                info!(
                    url = %record.job_url,
                    company = %record.company,
                    title = %record.title,
                    backend = self.store.backend(),
                    "application recorded"
                );
                Ok(RecordOutcome::Created)
            }
            InsertOutcome::AlreadyExists => {
                warn!(
                    url = %record.job_url,
                    backend = self.store.backend(),
                    "store reported an existing record after a negative existence check"
                );
                Ok(RecordOutcome::AlreadyPresent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn reference(url: &str) -> JobReference {
        JobReference {
            url: url.to_string(),
            title: "Senior Product Manager".into(),
            company: "Figma".into(),
            location: Some("San Francisco, CA".into()),
            profile: Some("Resume B".into()),
            score: 75,
            concepts: Some("developer_tools, observability".into()),
        }
    }

    fn logged_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 3, 10, 0, 0)
            .single()
            .expect("valid ts")
    }

    /// Always answers "absent" to the existence check, like a second process
    /// racing in between.
    #[derive(Default)]
    struct RacingStore {
        inner: MemoryApplicationStore,
    }

    #[async_trait]
    impl ApplicationStore for RacingStore {
        fn backend(&self) -> &'static str {
            "racing"
        }

        async fn exists(&self, _job_url: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn insert(&self, record: &ApplicationRecord) -> Result<InsertOutcome, StoreError> {
            self.inner.insert(record).await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn second_acknowledgment_is_already_present() {
        let store = Arc::new(MemoryApplicationStore::new());
        let ledger = ApplicationLedger::new(store.clone());
        let job = reference("https://boards.greenhouse.io/figma/jobs/1");

        let first = ledger
            .record_if_absent(&job, "U1", logged_at(), "")
            .await
            .expect("first");
        let second = ledger
            .record_if_absent(&job, "U2", logged_at(), "")
            .await
            .expect("second");

        assert_eq!(first, RecordOutcome::Created);
        assert_eq!(second, RecordOutcome::AlreadyPresent);
        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].actor, "U1");
        assert_eq!(records[0].source, "greenhouse");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acknowledgments_create_exactly_one_record() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FileApplicationStore::new(dir.path().join("applications.json")));
        let ledger = Arc::new(ApplicationLedger::new(store.clone()));
        let job = reference("https://jobs.lever.co/acme/123");

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = Arc::clone(&ledger);
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .record_if_absent(&job, &format!("U{i}"), logged_at(), "")
                    .await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.expect("join").expect("record") {
                RecordOutcome::Created => created += 1,
                RecordOutcome::AlreadyPresent => {}
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.count().await.expect("count"), 1);
        assert!(ledger.gates.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_releases_leave_no_gates_behind() {
        let store = Arc::new(MemoryApplicationStore::new());
        let ledger = Arc::new(ApplicationLedger::new(store.clone()));

        for round in 0..50 {
            let mut handles = Vec::new();
            for i in 0..16 {
                let ledger = Arc::clone(&ledger);
                let job = reference(&format!("https://jobs.lever.co/acme/{round}-{}", i % 4));
                handles.push(tokio::spawn(async move {
                    ledger.record_if_absent(&job, "U1", logged_at(), "").await
                }));
            }
            for handle in handles {
                handle.await.expect("join").expect("record");
            }
            assert!(ledger.gates.lock().await.is_empty(), "round {round}");
        }
        assert_eq!(store.records().await.len(), 200);
    }

    #[tokio::test]
    async fn store_level_conflict_maps_to_already_present() {
        let ledger = ApplicationLedger::new(Arc::new(RacingStore::default()));
        let job = reference("https://jobs.lever.co/acme/9");

        let first = ledger.record_if_absent(&job, "U1", logged_at(), "").await;
        let second = ledger.record_if_absent(&job, "U1", logged_at(), "").await;
        assert_eq!(first.expect("first"), RecordOutcome::Created);
        assert_eq!(second.expect("second"), RecordOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("applications.json");
        let record = ApplicationRecord::from_reference(
            &reference("https://jobs.lever.co/acme/1"),
            "U1",
            logged_at(),
            "referral",
        );

        let store = FileApplicationStore::new(&path);
        assert_eq!(store.insert(&record).await.expect("insert"), InsertOutcome::Created);
        assert_eq!(
            store.insert(&record).await.expect("insert again"),
            InsertOutcome::AlreadyExists
        );

        let reopened = FileApplicationStore::new(&path);
        assert!(reopened.exists(&record.job_url).await.expect("exists"));
        let records = reopened.records().await.expect("records");
        assert_eq!(records, vec![record]);
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("applications.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileApplicationStore::new(&path)
            .count()
            .await
            .expect_err("corrupt store");
        assert!(matches!(err, StoreError::Decode { .. }));
    }
}
