//! Local embedding model catalog.
//!
//! The [`ModelRegistry`] tracks which configured models are installed,
//! downloads missing ones through a [`ModelTransport`] and validates them
//! before marking them ready.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use super::transport::ModelTransport;
use crate::config::{ModelEntry, ModelSettings};
use crate::domain::PerformanceTier;

/// Encoder configuration file.
pub const CONFIG_FILE: &str = "config.json";
/// Tokenizer definition file.
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Model weights file.
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Files a model directory must contain to be usable.
pub const REQUIRED_FILES: [&str; 3] = [CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE];

/// Model download status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Model is not downloaded.
    NotDownloaded,
    /// Model is being downloaded.
    Downloading,
    /// Model is downloaded and ready.
    Ready,
    /// Last download attempt failed.
    Failed,
}

/// Information about a configured model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    /// Short identifier.
    pub id: String,
    /// Hugging Face repository the weights come from.
    pub repo_id: String,
    /// Quality/cost tier.
    pub performance: PerformanceTier,
    /// Directory holding the model files once downloaded.
    pub storage_path: PathBuf,
    /// Download status.
    pub status: DownloadStatus,
    /// Maximum tokens fed to the encoder.
    pub max_seq_length: usize,
    /// Prefix for query text.
    pub query_prefix: Option<String>,
    /// Prefix for indexed text.
    pub document_prefix: Option<String>,
    /// Expected SHA-256 of the weights file.
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    fn from_entry(entry: &ModelEntry, models_dir: &Path) -> Self {
        Self {
            id: entry.id.clone(),
            repo_id: entry.repo_id.clone(),
            performance: entry.performance,
            storage_path: models_dir.join(&entry.id),
            status: DownloadStatus::NotDownloaded,
            max_seq_length: entry.max_seq_length,
            query_prefix: entry.query_prefix.clone(),
            document_prefix: entry.document_prefix.clone(),
            sha256: entry.sha256.clone(),
        }
    }

    /// Whether the model is installed and validated.
    pub fn is_downloaded(&self) -> bool {
        self.status == DownloadStatus::Ready
    }
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The id is not in the configured catalog.
    #[error("model '{0}' is not defined in configuration")]
    UnknownModel(String),

    /// Transfer or integrity validation failed; the model stays not downloaded.
    #[error("download of model '{model_id}' failed: {source}")]
    DownloadFailed {
        model_id: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// What a download call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// The model was already installed; nothing was fetched.
    AlreadyDownloaded,
    /// The model was fetched and validated.
    Downloaded,
}

/// Restartable iterator over catalog snapshots; clone it to iterate again.
pub type Catalog = std::vec::IntoIter<ModelDescriptor>;

/// Model registry for managing available models.
pub struct ModelRegistry {
    models: RwLock<Vec<ModelDescriptor>>,
    models_dir: PathBuf,
    transport: Arc<dyn ModelTransport>,
    /// Per-model locks so concurrent downloads of one id share a transfer.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelRegistry {
    /// Creates a registry from configuration.
    ///
    /// Models whose directory already holds the required files start out
    /// ready. Checksums are only verified after a download.
    pub fn new(settings: &ModelSettings, transport: Arc<dyn ModelTransport>) -> Self {
        let models = settings
            .catalog
            .iter()
            .map(|entry| {
                let mut descriptor = ModelDescriptor::from_entry(entry, &settings.models_dir);
                if validate_model_dir(&descriptor.storage_path, None).is_ok() {
                    descriptor.status = DownloadStatus::Ready;
                }
                descriptor
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            count = models.len(),
            ready = models.iter().filter(|m| m.is_downloaded()).count(),
            "Model registry initialized"
        );

        Self {
            models: RwLock::new(models),
            models_dir: settings.models_dir.clone(),
            transport,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// All configured models, in configuration order.
    pub fn catalog(&self) -> Catalog {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .into_iter()
    }

    /// Looks up a model by id.
    pub fn get(&self, model_id: &str) -> RegistryResult<ModelDescriptor> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownModel(model_id.to_string()))
    }

    /// Whether a configured model is installed.
    pub fn is_downloaded(&self, model_id: &str) -> RegistryResult<bool> {
        Ok(self.get(model_id)?.is_downloaded())
    }

    /// Downloads and validates a model unless it is already installed.
    ///
    /// Safe to call concurrently: callers for the same id serialize on a
    /// per-model lock and later callers observe the first one's result.
    pub async fn download(&self, model_id: &str) -> RegistryResult<DownloadOutcome> {
        let descriptor = self.get(model_id)?;
        if descriptor.is_downloaded() {
            tracing::debug!(model_id, "Model already downloaded");
            return Ok(DownloadOutcome::AlreadyDownloaded);
        }

        let lock = {
            let mut in_flight = self.in_flight.lock().await;
            Arc::clone(
                in_flight
                    .entry(model_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        if self.is_downloaded(model_id)? {
            return Ok(DownloadOutcome::AlreadyDownloaded);
        }

        tracing::info!(model_id, repo_id = %descriptor.repo_id, "Downloading model");
        self.set_status(model_id, DownloadStatus::Downloading);

        match self.fetch_and_install(&descriptor).await {
            Ok(()) => {
                self.set_status(model_id, DownloadStatus::Ready);
                tracing::info!(model_id, "Model downloaded and validated");
                Ok(DownloadOutcome::Downloaded)
            }
            Err(e) => {
                self.set_status(model_id, DownloadStatus::Failed);
                tracing::warn!(model_id, error = %e, "Model download failed");
                Err(RegistryError::DownloadFailed {
                    model_id: model_id.to_string(),
                    source: e.into(),
                })
            }
        }
    }

    /// Fetches into a staging directory, validates, then moves into place.
    async fn fetch_and_install(&self, descriptor: &ModelDescriptor) -> anyhow::Result<()> {
        let staging = self.models_dir.join(format!(".{}.partial", descriptor.id));
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let result = self.stage(descriptor, &staging).await;
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        result
    }

    async fn stage(&self, descriptor: &ModelDescriptor, staging: &Path) -> anyhow::Result<()> {
        self.transport
            .fetch(descriptor, staging)
            .await
            .context("transfer failed")?;

        let dir = staging.to_path_buf();
        let sha256 = descriptor.sha256.clone();
        tokio::task::spawn_blocking(move || validate_model_dir(&dir, sha256.as_deref()))
            .await
            .context("validation task failed")?
            .context("integrity validation failed")?;

        if descriptor.storage_path.exists() {
            tokio::fs::remove_dir_all(&descriptor.storage_path).await?;
        }
        tokio::fs::rename(staging, &descriptor.storage_path)
            .await
            .context("failed to install model directory")?;
        Ok(())
    }

    fn set_status(&self, model_id: &str, status: DownloadStatus) {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = models.iter_mut().find(|m| m.id == model_id) {
            model.status = status;
        }
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models_dir", &self.models_dir)
            .finish_non_exhaustive()
    }
}

/// Checks that a model directory is complete and, if given, that the
/// weights match the expected SHA-256.
pub fn validate_model_dir(dir: &Path, sha256: Option<&str>) -> anyhow::Result<()> {
    for file in REQUIRED_FILES {
        let path = dir.join(file);
        let meta = std::fs::metadata(&path)
            .with_context(|| format!("missing {}", path.display()))?;
        if meta.len() == 0 {
            bail!("{} is empty", path.display());
        }
    }

    let raw = std::fs::read_to_string(dir.join(CONFIG_FILE))?;
    let config: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", CONFIG_FILE))?;
    if !config.is_object() {
        bail!("{} is not a JSON object", CONFIG_FILE);
    }

    if let Some(expected) = sha256 {
        let actual = sha256_hex(&dir.join(WEIGHTS_FILE))?;
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            bail!("checksum mismatch: expected {}, got {}", expected, actual);
        }
    }

    Ok(())
}

fn sha256_hex(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }
    Ok(context
        .finish()
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Writes a minimal model directory, optionally failing or omitting weights.
    struct FakeTransport {
        calls: AtomicUsize,
        fail: bool,
        skip_weights: bool,
        delay: Duration,
    }

    impl FakeTransport {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                skip_weights: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ModelTransport for FakeTransport {
        async fn fetch(&self, _descriptor: &ModelDescriptor, dest: &Path) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                bail!("connection reset");
            }
            write_model_files(dest, !self.skip_weights);
            Ok(())
        }
    }

    fn write_model_files(dir: &Path, weights: bool) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), r#"{"hidden_size": 8}"#).unwrap();
        std::fs::write(dir.join(TOKENIZER_FILE), "{}").unwrap();
        if weights {
            std::fs::write(dir.join(WEIGHTS_FILE), b"weights").unwrap();
        }
    }

    fn settings(dir: &Path) -> ModelSettings {
        ModelSettings {
            models_dir: dir.to_path_buf(),
            catalog: vec![
                ModelEntry::new("clip-s", "org/clip-s", PerformanceTier::Low),
                ModelEntry::new("clip-l", "org/clip-l", PerformanceTier::High),
            ],
        }
    }

    #[test]
    fn catalog_is_ordered_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&settings(dir.path()), Arc::new(FakeTransport::ok()));

        let catalog = registry.catalog();
        let first: Vec<_> = catalog.clone().map(|m| m.id).collect();
        let second: Vec<_> = catalog.map(|m| m.id).collect();

        assert_eq!(first, vec!["clip-s".to_string(), "clip-l".to_string()]);
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_model_is_distinct_from_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&settings(dir.path()), Arc::new(FakeTransport::ok()));

        assert!(!registry.is_downloaded("clip-s").unwrap());
        assert!(matches!(
            registry.is_downloaded("nope"),
            Err(RegistryError::UnknownModel(id)) if id == "nope"
        ));
    }

    #[test]
    fn installed_models_start_ready() {
        let dir = tempfile::tempdir().unwrap();
        write_model_files(&dir.path().join("clip-l"), true);

        let registry = ModelRegistry::new(&settings(dir.path()), Arc::new(FakeTransport::ok()));
        assert!(registry.is_downloaded("clip-l").unwrap());
        assert!(!registry.is_downloaded("clip-s").unwrap());
    }

    #[tokio::test]
    async fn download_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::ok());
        let registry = ModelRegistry::new(&settings(dir.path()), transport.clone());

        assert_eq!(registry.download("clip-s").await.unwrap(), DownloadOutcome::Downloaded);
        assert_eq!(
            registry.download("clip-s").await.unwrap(),
            DownloadOutcome::AlreadyDownloaded
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_downloaded("clip-s").unwrap());
        assert!(dir.path().join("clip-s").join(WEIGHTS_FILE).exists());
        assert!(!dir.path().join(".clip-s.partial").exists());
    }

    #[tokio::test]
    async fn transfer_failure_leaves_model_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport {
            fail: true,
            ..FakeTransport::ok()
        });
        let registry = ModelRegistry::new(&settings(dir.path()), transport);

        let err = registry.download("clip-s").await.unwrap_err();
        assert!(matches!(err, RegistryError::DownloadFailed { ref model_id, .. } if model_id == "clip-s"));
        assert!(err.to_string().contains("transfer failed"));
        assert!(!registry.is_downloaded("clip-s").unwrap());
        assert_eq!(registry.get("clip-s").unwrap().status, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn incomplete_transfer_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport {
            skip_weights: true,
            ..FakeTransport::ok()
        });
        let registry = ModelRegistry::new(&settings(dir.path()), transport);

        let err = registry.download("clip-s").await.unwrap_err();
        assert!(err.to_string().contains("integrity validation failed"));
        assert!(!dir.path().join("clip-s").exists());
        assert!(!dir.path().join(".clip-s.partial").exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.catalog[0].sha256 = Some("00".repeat(32));
        let registry = ModelRegistry::new(&settings, Arc::new(FakeTransport::ok()));

        assert!(registry.download("clip-s").await.is_err());
        assert!(!registry.is_downloaded("clip-s").unwrap());
    }

    #[tokio::test]
    async fn checksum_match_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        // SHA-256 of b"weights"
        let expected = {
            let digest = ring::digest::digest(&ring::digest::SHA256, b"weights");
            digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect::<String>()
        };
        settings.catalog[0].sha256 = Some(expected.to_uppercase());
        let registry = ModelRegistry::new(&settings, Arc::new(FakeTransport::ok()));

        assert_eq!(registry.download("clip-s").await.unwrap(), DownloadOutcome::Downloaded);
    }

    #[tokio::test]
    async fn concurrent_downloads_share_one_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport {
            delay: Duration::from_millis(50),
            ..FakeTransport::ok()
        });
        let registry = Arc::new(ModelRegistry::new(&settings(dir.path()), transport.clone()));

        let (a, b) = tokio::join!(registry.download("clip-s"), registry.download("clip-s"));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == DownloadOutcome::Downloaded);

        assert_eq!(
            outcomes,
            vec![DownloadOutcome::AlreadyDownloaded, DownloadOutcome::Downloaded]
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn download_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&settings(dir.path()), Arc::new(FakeTransport::ok()));
        assert!(matches!(
            registry.download("ghost").await,
            Err(RegistryError::UnknownModel(_))
        ));
    }

    #[test]
    fn download_status_serialization() {
        let json = serde_json::to_string(&DownloadStatus::NotDownloaded).unwrap();
        assert_eq!(json, "\"not_downloaded\"");
    }
}
