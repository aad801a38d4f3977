//! Persistent embedding cache.
//!
//! The [`CacheStore`] owns the published cache: an in-memory snapshot of
//! every image vector, backed by a SQLite file. Generation runs in the
//! background and builds a fresh file next to the published one; only a
//! fully written file is renamed into place and swapped into memory, so
//! readers see either the previous cache or the new one, never a mix.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::corpus::ImageCorpus;
use crate::config::CacheSettings;
use crate::domain::{ImageId, ImageRecord};
use crate::embedding::{Embedding, EmbeddingInput, EmbeddingProvider};
use crate::storage::{Database, DatabaseError};

const STATUS_BUILDING: &str = "building";
const STATUS_COMPLETE: &str = "complete";

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to enumerate images: {0:#}")]
    Corpus(anyhow::Error),

    #[error("no embedding provider is active")]
    NoActiveProvider,

    #[error("a cache generation is already running")]
    GenerationRunning,

    #[error("{failed} of {total} images failed to embed")]
    TooManyFailures { failed: usize, total: usize },

    #[error("cache generation was cancelled")]
    Cancelled,

    #[error("cache file is corrupt: {0}")]
    Corrupt(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// One cached image and its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub image: ImageRecord,
    pub vector: Embedding,
    /// Model that produced `vector`; always equals the cache provenance.
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable, fully published cache.
#[derive(Debug)]
pub struct CacheSnapshot {
    provenance: String,
    dimension: usize,
    created_at: DateTime<Utc>,
    entries: Vec<CacheEntry>,
}

impl CacheSnapshot {
    /// Model id every entry was produced by.
    pub fn provenance(&self) -> &str {
        &self.provenance
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in generation order. Call again (or clone the iterator) to
    /// restart.
    pub fn entries(&self) -> std::slice::Iter<'_, CacheEntry> {
        self.entries.iter()
    }

    /// Whether vectors from `model_id` are incomparable with this cache.
    pub fn is_stale_for(&self, model_id: &str) -> bool {
        self.provenance != model_id
    }
}

/// Lifecycle of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    NotStarted,
    Running,
    Complete,
    Failed,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Progress report for a generation job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub status: GenerationStatus,
    /// Images attempted so far.
    pub processed: usize,
    /// Images in the corpus, once enumerated.
    pub total: usize,
    /// Images whose embedding failed.
    pub failed: usize,
    /// Failure reason for a failed job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgress {
    fn not_started() -> Self {
        Self {
            status: GenerationStatus::NotStarted,
            processed: 0,
            total: 0,
            failed: 0,
            error: None,
        }
    }
}

/// Handle to a background generation.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    id: Uuid,
    progress: watch::Receiver<JobProgress>,
    cancel: CancellationToken,
}

impl GenerationJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> JobProgress {
        self.progress.borrow().clone()
    }

    pub fn status(&self) -> GenerationStatus {
        self.progress.borrow().status
    }

    /// Asks the job to stop before its next image. The published cache is
    /// left untouched.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits until the job completes or fails.
    pub async fn wait(&self) -> JobProgress {
        let mut rx = self.progress.clone();
        let finished = rx
            .wait_for(|p| p.status.is_terminal())
            .await
            .map(|progress| progress.clone());
        if let Ok(progress) = finished {
            return progress;
        }
        let current = rx.borrow().clone();
        current
    }
}

/// Result of a generation request.
#[derive(Debug, Clone)]
pub struct GenerationStarted {
    /// False when a generation was already running or the cache was already
    /// current for the provider.
    pub started: bool,
    /// The running job, if any.
    pub job: Option<GenerationJob>,
}

/// Persistent store of image embeddings.
pub struct CacheStore {
    path: PathBuf,
    max_failure_ratio: f32,
    concurrency: usize,
    snapshot: RwLock<Option<Arc<CacheSnapshot>>>,
    generating: AtomicBool,
    job: RwLock<Option<GenerationJob>>,
}

impl CacheStore {
    /// Opens the store, loading the published cache file if there is one.
    ///
    /// A leftover partial file from an interrupted generation is removed. A
    /// published file that fails validation is ignored as if absent.
    pub async fn open(settings: &CacheSettings) -> CacheResult<Self> {
        let path = settings.path.clone();
        remove_if_exists(&staging_path(&path)).await?;

        let snapshot = match load_snapshot(&path).await {
            Ok(snapshot) => snapshot,
            Err(CacheError::Corrupt(reason)) => {
                warn!(path = %path.display(), reason = %reason, "Discarding corrupt embedding cache");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(snapshot) = &snapshot {
            info!(
                model_id = %snapshot.provenance(),
                entries = snapshot.len(),
                "Loaded embedding cache"
            );
        }

        Ok(Self {
            path,
            max_failure_ratio: settings.max_failure_ratio,
            concurrency: settings.concurrency.max(1),
            snapshot: RwLock::new(snapshot.map(Arc::new)),
            generating: AtomicBool::new(false),
            job: RwLock::new(None),
        })
    }

    /// Path of the published cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a complete cache is available for search.
    pub fn has_cache(&self) -> bool {
        self.read_snapshot().is_some()
    }

    /// The published cache, if any.
    pub fn lookup_all(&self) -> Option<Arc<CacheSnapshot>> {
        self.read_snapshot()
    }

    /// Model id the published cache was built with.
    pub fn provenance(&self) -> Option<String> {
        self.read_snapshot().map(|s| s.provenance().to_string())
    }

    /// Whether a cache exists but was built by a different model.
    pub fn is_stale_for(&self, model_id: &str) -> bool {
        self.read_snapshot()
            .map(|s| s.is_stale_for(model_id))
            .unwrap_or(false)
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Most recent generation job.
    pub fn current_job(&self) -> Option<GenerationJob> {
        self.job.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Progress of the most recent job, or `NotStarted`.
    pub fn generation_status(&self) -> JobProgress {
        self.current_job()
            .map(|job| job.progress())
            .unwrap_or_else(JobProgress::not_started)
    }

    /// Cancels the running job. Returns false when nothing is running.
    pub fn cancel_generation(&self) -> bool {
        match self.current_job() {
            Some(job) if !job.status().is_terminal() => {
                job.cancel();
                true
            }
            _ => false,
        }
    }

    /// Starts building a cache from `corpus` with `provider` in the
    /// background.
    ///
    /// At most one generation runs at a time; a second request while one is
    /// running returns `started: false` with the running job. Unless `force`
    /// is set, a request is also skipped when the published cache was
    /// already built by `provider`'s model.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn generate_cache(
        self: &Arc<Self>,
        provider: Arc<dyn EmbeddingProvider>,
        corpus: Arc<dyn ImageCorpus>,
        force: bool,
    ) -> GenerationStarted {
        if self
            .generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Cache generation already running");
            return GenerationStarted {
                started: false,
                job: self.current_job(),
            };
        }

        if !force {
            if let Some(snapshot) = self.read_snapshot() {
                if !snapshot.is_stale_for(provider.model_id()) {
                    self.generating.store(false, Ordering::SeqCst);
                    debug!(model_id = %provider.model_id(), "Cache already current");
                    return GenerationStarted {
                        started: false,
                        job: None,
                    };
                }
            }
        }

        let (tx, rx) = watch::channel(JobProgress::not_started());
        let job = GenerationJob {
            id: Uuid::new_v4(),
            progress: rx,
            cancel: CancellationToken::new(),
        };
        *self.job.write().unwrap_or_else(PoisonError::into_inner) = Some(job.clone());

        let guard = JobGuard {
            store: Arc::clone(self),
            tx,
        };
        let cancel = job.cancel.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            guard.tx.send_modify(|p| p.status = GenerationStatus::Running);
            info!(job_id = %job_id, model_id = %provider.model_id(), "Cache generation started");

            let result = guard
                .store
                .run_generation(provider, corpus, &guard.tx, &cancel)
                .await;

            match result {
                Ok(count) => {
                    info!(job_id = %job_id, entries = count, "Cache generation complete");
                    guard.finish(GenerationStatus::Complete, None);
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Cache generation failed");
                    guard.finish(GenerationStatus::Failed, Some(e.to_string()));
                }
            }
        });

        GenerationStarted {
            started: true,
            job: Some(job),
        }
    }

    /// Deletes the published cache.
    pub async fn clear(&self) -> CacheResult<()> {
        if self.is_generating() {
            return Err(CacheError::GenerationRunning);
        }
        remove_if_exists(&self.path).await?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!(path = %self.path.display(), "Cleared embedding cache");
        Ok(())
    }

    fn read_snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_generation(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
        corpus: Arc<dyn ImageCorpus>,
        progress: &watch::Sender<JobProgress>,
        cancel: &CancellationToken,
    ) -> CacheResult<usize> {
        let images = tokio::task::spawn_blocking(move || corpus.images())
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
            .map_err(CacheError::Corpus)?;

        let mut seen: HashSet<ImageId> = HashSet::with_capacity(images.len());
        let images: Vec<ImageRecord> = images
            .into_iter()
            .filter(|image| {
                let fresh = seen.insert(image.id.clone());
                if !fresh {
                    warn!(image_id = %image.id, "Skipping duplicate image id");
                }
                fresh
            })
            .collect();

        let total = images.len();
        progress.send_modify(|p| p.total = total);

        let model_id = provider.model_id().to_string();
        let mut dimension = provider.dimension();
        let mut entries = Vec::with_capacity(total);
        let mut failed = 0;

        // Requests overlap; results arrive in corpus order.
        let provider = &provider;
        let mut embedded = futures::stream::iter(images)
            .map(|image| async move {
                let result = provider.embed(EmbeddingInput::Image(&image)).await;
                (image, result)
            })
            .buffered(self.concurrency);

        while let Some((image, result)) = embedded.next().await {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            match result {
                Ok(vector) => {
                    let expected = *dimension.get_or_insert(vector.dimension());
                    if vector.dimension() == 0 || vector.dimension() != expected {
                        warn!(
                            image_id = %image.id,
                            expected,
                            actual = vector.dimension(),
                            "Embedding has the wrong dimension"
                        );
                        failed += 1;
                    } else {
                        entries.push(CacheEntry {
                            image,
                            vector,
                            model_id: model_id.clone(),
                            created_at: Utc::now(),
                        });
                    }
                }
                Err(e) => {
                    warn!(image_id = %image.id, error = %e, "Failed to embed image");
                    failed += 1;
                }
            }

            progress.send_modify(|p| {
                p.processed += 1;
                p.failed = failed;
            });
        }
        drop(embedded);

        if total > 0 && failed as f32 / total as f32 > self.max_failure_ratio {
            return Err(CacheError::TooManyFailures { failed, total });
        }
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let snapshot = CacheSnapshot {
            provenance: model_id,
            dimension: dimension.unwrap_or(0),
            created_at: Utc::now(),
            entries,
        };
        let count = snapshot.len();
        self.publish(snapshot).await?;
        Ok(count)
    }

    /// Writes `snapshot` to a staging file, renames it over the published
    /// file and swaps it into memory.
    async fn publish(&self, snapshot: CacheSnapshot) -> CacheResult<()> {
        let staging = staging_path(&self.path);
        remove_if_exists(&staging).await?;

        let header = (
            snapshot.provenance.clone(),
            snapshot.dimension as i64,
            snapshot.entries.len() as i64,
            snapshot.created_at.to_rfc3339(),
        );
        let rows = snapshot
            .entries
            .iter()
            .map(EntryRow::from_entry)
            .collect::<CacheResult<Vec<_>>>()?;

        let db = Database::open(&staging).await?;
        let written = db
            .transaction(move |tx| {
                let (model, dimension, count, created_at) = header;
                tx.execute(
                    "INSERT INTO cache_header (id, provenance_model, status, dimension, entry_count, created_at)
                     VALUES (1, ?1, ?2, ?3, ?4, ?5)",
                    params![model, STATUS_BUILDING, dimension, count, created_at],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO cache_entries (image_id, source, description, metadata, vector, model_id, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )?;
                    for row in &rows {
                        stmt.execute(params![
                            row.image_id,
                            row.source,
                            row.description,
                            row.metadata,
                            row.vector,
                            row.model_id,
                            row.created_at,
                        ])?;
                    }
                }
                tx.execute(
                    "UPDATE cache_header SET status = ?1 WHERE id = 1",
                    params![STATUS_COMPLETE],
                )?;
                Ok(rows.len())
            })
            .await;
        drop(db);

        if let Err(e) = written {
            remove_if_exists(&staging).await.ok();
            return Err(e.into());
        }

        tokio::fs::rename(&staging, &self.path).await?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(snapshot));
        Ok(())
    }
}

/// Owns a running job's progress sender and releases the single-flight
/// guard when the job task ends, including by panic or runtime shutdown.
struct JobGuard {
    store: Arc<CacheStore>,
    tx: watch::Sender<JobProgress>,
}

impl JobGuard {
    /// Clears the guard, then publishes the terminal status.
    fn finish(&self, status: GenerationStatus, error: Option<String>) {
        self.store.generating.store(false, Ordering::SeqCst);
        self.tx.send_modify(|p| {
            p.status = status;
            p.error = error;
        });
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.tx.borrow().status.is_terminal() {
            return;
        }
        warn!("Cache generation task ended without a result");
        self.finish(
            GenerationStatus::Failed,
            Some("generation task aborted".to_string()),
        );
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .field("generating", &self.is_generating())
            .finish_non_exhaustive()
    }
}

/// Row shape of `cache_entries`.
struct EntryRow {
    image_id: String,
    source: String,
    description: String,
    metadata: Option<String>,
    vector: Vec<u8>,
    model_id: String,
    created_at: String,
}

impl EntryRow {
    fn from_entry(entry: &CacheEntry) -> CacheResult<Self> {
        let metadata = if entry.image.metadata.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&entry.image.metadata)
                    .map_err(|e| CacheError::Corrupt(e.to_string()))?,
            )
        };
        Ok(Self {
            image_id: entry.image.id.to_string(),
            source: entry.image.source.to_string_lossy().into_owned(),
            description: entry.image.description.clone(),
            metadata,
            vector: entry.vector.to_le_bytes(),
            model_id: entry.model_id.clone(),
            created_at: entry.created_at.to_rfc3339(),
        })
    }

    fn into_entry(self) -> CacheResult<CacheEntry> {
        let vector = Embedding::from_le_bytes(&self.vector).ok_or_else(|| {
            CacheError::Corrupt(format!("vector for '{}' has a ragged length", self.image_id))
        })?;
        let metadata: BTreeMap<String, String> = match self.metadata {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| CacheError::Corrupt(format!("metadata for '{}': {e}", self.image_id)))?,
            None => BTreeMap::new(),
        };
        let mut image = ImageRecord::new(self.image_id, self.source, self.description);
        image.metadata = metadata;

        Ok(CacheEntry {
            image,
            vector,
            model_id: self.model_id,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct HeaderRow {
    provenance: String,
    status: String,
    dimension: i64,
    entry_count: i64,
    created_at: String,
}

/// Reads the raw header and entry rows of a cache file.
async fn read_rows(path: &Path) -> Result<(Option<HeaderRow>, Vec<EntryRow>), DatabaseError> {
    let db = Database::open(path).await?;
    let rows = db
        .with_conn(|conn| {
            let header = conn
                .query_row(
                    "SELECT provenance_model, status, dimension, entry_count, created_at
                     FROM cache_header WHERE id = 1",
                    [],
                    |row| {
                        Ok(HeaderRow {
                            provenance: row.get(0)?,
                            status: row.get(1)?,
                            dimension: row.get(2)?,
                            entry_count: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;

            let mut stmt = conn.prepare(
                "SELECT image_id, source, description, metadata, vector, model_id, created_at
                 FROM cache_entries ORDER BY seq",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(EntryRow {
                        image_id: row.get(0)?,
                        source: row.get(1)?,
                        description: row.get(2)?,
                        metadata: row.get(3)?,
                        vector: row.get(4)?,
                        model_id: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok((header, entries))
        })
        .await;
    drop(db);
    rows
}

/// Loads and validates a published cache file.
async fn load_snapshot(path: &Path) -> CacheResult<Option<CacheSnapshot>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }

    let (header, rows) = match read_rows(path).await {
        Ok(loaded) => loaded,
        // Not a cache database at all.
        Err(DatabaseError::Sqlite(e)) => return Err(CacheError::Corrupt(e.to_string())),
        Err(DatabaseError::MigrationFailed(e)) => return Err(CacheError::Corrupt(e)),
        Err(e) => return Err(e.into()),
    };

    let Some(header) = header else {
        return Err(CacheError::Corrupt("missing header".to_string()));
    };
    if header.status != STATUS_COMPLETE {
        return Err(CacheError::Corrupt(format!(
            "cache was never completed (status '{}')",
            header.status
        )));
    }
    if header.entry_count != rows.len() as i64 {
        return Err(CacheError::Corrupt(format!(
            "header lists {} entries, found {}",
            header.entry_count,
            rows.len()
        )));
    }

    let dimension = usize::try_from(header.dimension)
        .map_err(|_| CacheError::Corrupt(format!("invalid dimension {}", header.dimension)))?;
    let entries = rows
        .into_iter()
        .map(EntryRow::into_entry)
        .collect::<CacheResult<Vec<_>>>()?;

    for entry in &entries {
        if entry.model_id != header.provenance {
            return Err(CacheError::Corrupt(format!(
                "entry '{}' was embedded by '{}', cache provenance is '{}'",
                entry.image.id, entry.model_id, header.provenance
            )));
        }
        if entry.vector.dimension() != dimension {
            return Err(CacheError::Corrupt(format!(
                "entry '{}' has dimension {}, expected {}",
                entry.image.id,
                entry.vector.dimension(),
                dimension
            )));
        }
    }

    Ok(Some(CacheSnapshot {
        provenance: header.provenance,
        dimension,
        created_at: parse_timestamp(&header.created_at)?,
        entries,
    }))
}

fn parse_timestamp(value: &str) -> CacheResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CacheError::Corrupt(format!("bad timestamp '{value}': {e}")))
}

/// Sibling file a generation writes before publishing.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
