//! Application context.
//!
//! [`App`] owns one instance of every service and exposes the operations a
//! front end (the CLI, or an HTTP layer) needs. There is no global state:
//! everything hangs off the `App` value.

mod builder;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

pub use builder::AppBuilder;

use crate::config::{ApiSettings, Settings};
use crate::domain::{ImageRecord, ModeKind, PerformanceTier};
use crate::embedding::{DownloadOutcome, ModelRegistry, RegistryResult};
use crate::services::{
    ApiConfigView, CacheError, CacheResult, CacheStore, ControllerState, GenerationStarted,
    ImageCorpus, JobProgress, ModeController, ModeError, ModeInfo, ModeResult, SearchEngine,
    SearchHit, SearchResult,
};

/// Catalog entry as listed to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub performance: PerformanceTier,
    pub downloaded: bool,
}

/// The image search engine with all of its services.
pub struct App {
    settings: Settings,
    registry: Arc<ModelRegistry>,
    mode: Arc<ModeController>,
    cache: Arc<CacheStore>,
    search: SearchEngine,
    corpus: Arc<dyn ImageCorpus>,
}

impl App {
    pub fn builder(settings: Settings) -> AppBuilder {
        AppBuilder::new(settings)
    }

    /// Builds an app with the default transport, providers and corpus.
    pub async fn new(settings: Settings) -> Result<Self> {
        AppBuilder::new(settings).build().await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Applies the startup settings: enters the configured mode (downloading
    /// the model first if allowed) and starts cache generation.
    pub async fn bootstrap(&self) -> Result<()> {
        let startup = &self.settings.startup;

        match startup.mode {
            Some(ModeKind::Local) => {
                let model_id = startup
                    .model
                    .as_deref()
                    .ok_or(ModeError::ModelNotConfigured)?;
                if startup.download_missing && !self.registry.is_downloaded(model_id)? {
                    info!(model_id, "Downloading startup model");
                    self.registry.download(model_id).await?;
                }
                self.mode
                    .set_mode(ModeKind::Local, Some(model_id))
                    .await
                    .with_context(|| format!("failed to activate local model '{model_id}'"))?;
            }
            Some(ModeKind::Api) => {
                self.mode
                    .set_mode(ModeKind::Api, None)
                    .await
                    .context("failed to activate api mode")?;
            }
            None => {}
        }

        if startup.generate_cache {
            match self.generate_cache() {
                Ok(started) if started.started => info!("Cache generation started"),
                Ok(_) => info!("Cache is current"),
                Err(CacheError::NoActiveProvider) => {
                    warn!("Skipping cache generation, no embedding provider is active")
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Returns up to `k` images most similar to `query`.
    pub async fn search(&self, query: &str, k: usize) -> SearchResult<Vec<SearchHit>> {
        self.search.search(query, k).await
    }

    /// Search with the configured default result count.
    pub async fn search_default(&self, query: &str) -> SearchResult<Vec<SearchHit>> {
        self.search.search(query, self.settings.search.default_k).await
    }

    pub async fn search_by_image(&self, image: &ImageRecord, k: usize) -> SearchResult<Vec<SearchHit>> {
        self.search.search_by_image(image, k).await
    }

    /// Starts cache generation with the active provider unless the cache is
    /// already current or a generation is running.
    pub fn generate_cache(&self) -> CacheResult<GenerationStarted> {
        self.start_generation(false)
    }

    /// Rebuilds the cache even if it is current, e.g. after the corpus changed.
    pub fn regenerate_cache(&self) -> CacheResult<GenerationStarted> {
        self.start_generation(true)
    }

    fn start_generation(&self, force: bool) -> CacheResult<GenerationStarted> {
        let active = self.mode.get_active().ok_or(CacheError::NoActiveProvider)?;
        Ok(self
            .cache
            .generate_cache(active.provider().clone(), self.corpus.clone(), force))
    }

    pub fn generation_status(&self) -> JobProgress {
        self.cache.generation_status()
    }

    pub fn cancel_generation(&self) -> bool {
        self.cache.cancel_generation()
    }

    pub fn has_cache(&self) -> bool {
        self.cache.has_cache()
    }

    pub async fn clear_cache(&self) -> CacheResult<()> {
        self.cache.clear().await
    }

    pub fn get_mode(&self) -> ModeInfo {
        self.mode.get_mode()
    }

    pub fn controller_state(&self) -> ControllerState {
        self.mode.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.mode.last_error()
    }

    pub async fn set_mode(&self, mode: ModeKind, model_id: Option<&str>) -> ModeResult<()> {
        self.mode.set_mode(mode, model_id).await
    }

    pub async fn switch_model(&self, model_id: &str) -> ModeResult<()> {
        self.mode.switch_model(model_id).await
    }

    /// Configured models in catalog order.
    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.registry
            .catalog()
            .map(|m| ModelSummary {
                downloaded: m.is_downloaded(),
                id: m.id,
                performance: m.performance,
            })
            .collect()
    }

    pub async fn download_model(&self, model_id: &str) -> RegistryResult<DownloadOutcome> {
        self.registry.download(model_id).await
    }

    pub fn api_config(&self) -> ApiConfigView {
        self.mode.api_config()
    }

    /// Unmasked API settings, for persisting back to the settings file.
    pub fn api_settings(&self) -> ApiSettings {
        self.mode.api_settings()
    }

    pub async fn update_api_config(
        &self,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> ModeResult<()> {
        self.mode.update_api_config(api_key, base_url).await
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("mode", &self.mode)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
