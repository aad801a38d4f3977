//! Wiring for [`App`].

use std::sync::Arc;

use anyhow::{Context, Result};

use super::App;
use crate::config::Settings;
use crate::embedding::{DefaultProviderFactory, HfHubTransport, ModelRegistry, ModelTransport, ProviderFactory};
use crate::services::{CacheStore, DirectoryCorpus, ImageCorpus, ModeController, SearchEngine};

/// Builds an [`App`], with optional replacements for the pieces that touch
/// the network or the filesystem.
pub struct AppBuilder {
    settings: Settings,
    transport: Option<Arc<dyn ModelTransport>>,
    factory: Option<Arc<dyn ProviderFactory>>,
    corpus: Option<Arc<dyn ImageCorpus>>,
}

impl AppBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            transport: None,
            factory: None,
            corpus: None,
        }
    }

    /// Model download transport. Defaults to the Hugging Face hub.
    pub fn with_transport(mut self, transport: Arc<dyn ModelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Provider factory. Defaults to Candle and HTTP providers.
    pub fn with_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Image corpus. Defaults to the configured image directory.
    pub fn with_corpus(mut self, corpus: Arc<dyn ImageCorpus>) -> Self {
        self.corpus = Some(corpus);
        self
    }

    pub async fn build(self) -> Result<App> {
        let settings = self.settings;

        let transport: Arc<dyn ModelTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HfHubTransport::new().with_cache_dir(settings.models.models_dir.join(".hf-cache")),
            ),
        };
        let factory: Arc<dyn ProviderFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DefaultProviderFactory),
        };
        let corpus: Arc<dyn ImageCorpus> = match self.corpus {
            Some(corpus) => corpus,
            None => Arc::new(DirectoryCorpus::from_settings(&settings.corpus)),
        };

        let registry = Arc::new(ModelRegistry::new(&settings.models, transport));
        let mode = Arc::new(ModeController::new(registry.clone(), factory, settings.api.clone()));
        let cache = Arc::new(
            CacheStore::open(&settings.cache)
                .await
                .with_context(|| format!("failed to open cache at {}", settings.cache.path.display()))?,
        );
        let search = SearchEngine::new(mode.clone(), cache.clone())
            .with_min_similarity(settings.search.min_similarity);

        Ok(App {
            settings,
            registry,
            mode,
            cache,
            search,
            corpus,
        })
    }
}
