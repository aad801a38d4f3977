//! Application settings and configuration types.
//!
//! Settings are persisted to `~/.config/vvquest/settings.json` (or XDG equivalent)
//! and loaded at startup. Every section has a usable default so a missing
//! file yields a working configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{ModeKind, PerformanceTier};

/// Top-level application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Locally installable embedding models.
    pub models: ModelSettings,
    /// Remote embedding API configuration.
    pub api: ApiSettings,
    /// Embedding cache location and generation policy.
    pub cache: CacheSettings,
    /// Where indexed images live.
    pub corpus: CorpusSettings,
    /// Search defaults.
    pub search: SearchSettings,
    /// What to activate when the process starts.
    pub startup: StartupSettings,
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> PathBuf {
        config_dir().join("settings.json")
    }

    /// Loads settings from `path`, falling back to defaults if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let settings = serde_json::from_str(&raw)
            .with_context(|| format!("invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    /// Writes settings to `path` as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write settings to {}", path.display()))?;
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "vvquest", "vvquest")
}

fn config_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".vvquest"))
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".vvquest"))
}

/// Local model catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Directory that holds one sub-directory per downloaded model.
    pub models_dir: PathBuf,
    /// Configured models, in presentation order.
    pub catalog: Vec<ModelEntry>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            models_dir: data_dir().join("models"),
            catalog: vec![
                ModelEntry::new(
                    "bge-small-zh-v1.5",
                    "BAAI/bge-small-zh-v1.5",
                    PerformanceTier::Low,
                ),
                ModelEntry::new(
                    "bge-base-zh-v1.5",
                    "BAAI/bge-base-zh-v1.5",
                    PerformanceTier::Medium,
                ),
                ModelEntry::new(
                    "bge-large-zh-v1.5",
                    "BAAI/bge-large-zh-v1.5",
                    PerformanceTier::High,
                ),
            ],
        }
    }
}

/// A single configured local model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Short identifier used by callers.
    pub id: String,
    /// Hugging Face repository to fetch weights from.
    pub repo_id: String,
    /// Relative quality/cost tier.
    pub performance: PerformanceTier,
    /// Maximum tokens fed to the encoder.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Prefix prepended to search queries (e.g. `"query: "` for E5 models).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_prefix: Option<String>,
    /// Prefix prepended to indexed image descriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_prefix: Option<String>,
    /// Expected hex SHA-256 of `model.safetensors`, checked after download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

fn default_max_seq_length() -> usize {
    512
}

impl ModelEntry {
    /// Creates an entry with default sequence length and no prefixes.
    pub fn new(id: impl Into<String>, repo_id: impl Into<String>, performance: PerformanceTier) -> Self {
        Self {
            id: id.into(),
            repo_id: repo_id.into(),
            performance,
            max_seq_length: default_max_seq_length(),
            query_prefix: None,
            document_prefix: None,
            sha256: None,
        }
    }
}

/// Remote embedding API configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Bearer token for the embedding endpoint.
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API (without `/embeddings`).
    pub base_url: String,
    /// Remote model name.
    pub model: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Send images as base64 data URLs instead of their description text.
    pub multimodal: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            model: "BAAI/bge-m3".to_string(),
            timeout_secs: 30,
            multimodal: false,
        }
    }
}

impl ApiSettings {
    /// Whether both the key and the base URL are present.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.base_url.trim().is_empty()
    }

    /// The API key with all but the last four characters hidden.
    pub fn masked_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 4 {
            return "*".repeat(chars.len());
        }
        let visible: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - 4), visible)
    }
}

impl std::fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSettings")
            .field("api_key", &self.masked_key())
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("multimodal", &self.multimodal)
            .finish()
    }
}

/// Embedding cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// SQLite file holding the published cache.
    pub path: PathBuf,
    /// Fraction of images allowed to fail before a generation is abandoned.
    pub max_failure_ratio: f32,
    /// Embedding requests in flight during generation.
    pub concurrency: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: data_dir().join("embedding_cache.db"),
            max_failure_ratio: 0.2,
            concurrency: 4,
        }
    }
}

/// Image corpus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusSettings {
    /// Directory scanned for images.
    pub image_dir: PathBuf,
    /// Accepted file extensions, lowercase, without the dot.
    pub extensions: Vec<String>,
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            image_dir: data_dir().join("images"),
            extensions: ["png", "jpg", "jpeg", "gif", "webp"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

/// Settings for semantic search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Number of results when the caller does not ask for a specific count.
    pub default_k: usize,
    /// Drop hits scoring below this value.
    pub min_similarity: Option<f32>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_k: 5,
            min_similarity: None,
        }
    }
}

/// What the process activates on startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Mode to enter, if any.
    pub mode: Option<ModeKind>,
    /// Local model to select in `local` mode.
    pub model: Option<String>,
    /// Download the startup model if it is missing.
    pub download_missing: bool,
    /// Trigger cache generation once a provider is active.
    pub generate_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.models.catalog.len(), 3);
        assert_eq!(settings.search.default_k, 5);
        assert!(!settings.api.has_credentials());
        assert!(settings.startup.mode.is_none());
    }

    #[test]
    fn catalog_preserves_configuration_order() {
        let json = r#"{
            "models": {
                "models_dir": "/tmp/models",
                "catalog": [
                    {"id": "z-model", "repo_id": "org/z", "performance": "high"},
                    {"id": "a-model", "repo_id": "org/a", "performance": "low"}
                ]
            }
        }"#;

        let settings: Settings = serde_json::from_str(json).unwrap();
        let ids: Vec<_> = settings.models.catalog.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["z-model", "a-model"]);
        assert_eq!(settings.models.catalog[0].max_seq_length, 512);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"startup": {"mode": "api", "generate_cache": true}}"#).unwrap();
        assert_eq!(settings.startup.mode, Some(ModeKind::Api));
        assert!(settings.startup.generate_cache);
        assert_eq!(settings.api.timeout_secs, 30);
    }

    #[test]
    fn masked_key_hides_prefix() {
        let mut api = ApiSettings::default();
        api.api_key = "sk-secret-1234".to_string();
        assert_eq!(api.masked_key(), "**********1234");
        assert!(!format!("{:?}", api).contains("secret"));

        api.api_key = "abc".to_string();
        assert_eq!(api.masked_key(), "***");
    }

    #[test]
    fn settings_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.startup.mode = Some(ModeKind::Local);
        settings.startup.model = Some("bge-small-zh-v1.5".to_string());
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.startup.model.as_deref(), Some("bge-small-zh-v1.5"));
        assert_eq!(loaded.models.catalog, settings.models.catalog);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.cache.max_failure_ratio, 0.2);
    }
}
