//! Embedding mode state machine.
//!
//! The [`ModeController`] owns the single active embedding provider. It
//! moves between local-model and remote-API modes, loads local models via a
//! [`ProviderFactory`], and hands out the active provider as an immutable
//! `Arc` snapshot: a search that grabbed the old provider finishes with it
//! even while a switch installs a new one.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ApiSettings;
use crate::domain::ModeKind;
use crate::embedding::{EmbeddingProvider, ModelRegistry, ProviderError, ProviderFactory, RegistryError};

/// Errors from mode transitions.
#[derive(Debug, Error)]
pub enum ModeError {
    /// API mode requested without usable credentials, or an invalid base URL.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Local mode requested with no model given and none previously used.
    #[error("no local model selected")]
    ModelNotConfigured,

    #[error("model '{0}' is not defined in configuration")]
    UnknownModel(String),

    #[error("model '{0}' is not downloaded")]
    ModelNotDownloaded(String),

    /// Model switching only applies to local mode.
    #[error("switch to local mode before changing model (current mode: {current})")]
    ModeMismatch { current: String },

    #[error("failed to load model '{model_id}': {source}")]
    ModelLoad {
        model_id: String,
        #[source]
        source: ProviderError,
    },
}

/// Result type for mode operations.
pub type ModeResult<T> = Result<T, ModeError>;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Uninitialized,
    LocalReady,
    ApiReady,
    /// The last transition failed. Any previously active provider keeps
    /// serving.
    Error,
}

/// The provider currently serving embeddings, frozen at activation time.
pub struct ActiveProvider {
    mode: ModeKind,
    model_id: Option<String>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl ActiveProvider {
    pub fn mode(&self) -> ModeKind {
        self.mode
    }

    /// Local model id; `None` in API mode.
    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Identity caches are tagged with.
    pub fn provenance(&self) -> &str {
        self.provider.model_id()
    }
}

impl std::fmt::Debug for ActiveProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveProvider")
            .field("mode", &self.mode)
            .field("model_id", &self.model_id)
            .field("provenance", &self.provenance())
            .finish()
    }
}

/// Current mode as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeInfo {
    pub mode: Option<ModeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// API settings with the key masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiConfigView {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub multimodal: bool,
}

struct ModeInner {
    state: ControllerState,
    active: Option<Arc<ActiveProvider>>,
    last_local_model: Option<String>,
    last_error: Option<String>,
}

/// Owns the active embedding provider and serializes mode transitions.
pub struct ModeController {
    registry: Arc<ModelRegistry>,
    factory: Arc<dyn ProviderFactory>,
    api: RwLock<ApiSettings>,
    inner: RwLock<ModeInner>,
    /// Held for the whole of a transition, including model loading.
    transition: Mutex<()>,
}

impl ModeController {
    pub fn new(
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn ProviderFactory>,
        api: ApiSettings,
    ) -> Self {
        Self {
            registry,
            factory,
            api: RwLock::new(api),
            inner: RwLock::new(ModeInner {
                state: ControllerState::Uninitialized,
                active: None,
                last_local_model: None,
                last_error: None,
            }),
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.read_inner().state
    }

    /// Message of the last failed transition, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.read_inner().last_error.clone()
    }

    /// The serving provider, if any.
    pub fn get_active(&self) -> Option<Arc<ActiveProvider>> {
        self.read_inner().active.clone()
    }

    /// Mode and model of the serving provider.
    ///
    /// Before any provider is active this reports `local` with no model,
    /// the mode `switch_model` operates in until `set_mode` is called.
    pub fn get_mode(&self) -> ModeInfo {
        let inner = self.read_inner();
        match &inner.active {
            Some(active) => ModeInfo {
                mode: Some(active.mode),
                model_id: active.model_id.clone(),
            },
            None => ModeInfo {
                mode: Some(ModeKind::Local),
                model_id: None,
            },
        }
    }

    /// Current API settings, unmasked.
    pub fn api_settings(&self) -> ApiSettings {
        self.api.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn api_config(&self) -> ApiConfigView {
        let api = self.api_settings();
        ApiConfigView {
            api_key: api.masked_key(),
            base_url: api.base_url,
            model: api.model,
            multimodal: api.multimodal,
        }
    }

    /// Enters `mode`.
    ///
    /// For local mode, `model_id` selects the model; without it the most
    /// recently active local model is reused. Requesting the model that is
    /// already active is a no-op. `model_id` is ignored in API mode.
    ///
    /// On any failure the previous provider stays active.
    pub async fn set_mode(&self, mode: ModeKind, model_id: Option<&str>) -> ModeResult<()> {
        let _guard = self.transition.lock().await;

        match mode {
            ModeKind::Local => {
                let model_id = match model_id {
                    Some(id) => id.to_string(),
                    None => self
                        .read_inner()
                        .last_local_model
                        .clone()
                        .ok_or(ModeError::ModelNotConfigured)?,
                };
                self.activate_local(&model_id).await
            }
            ModeKind::Api => self.activate_api(),
        }
    }

    /// Switches the local model. Fails in API mode; before any provider is
    /// active the mode defaults to local.
    pub async fn switch_model(&self, model_id: &str) -> ModeResult<()> {
        let _guard = self.transition.lock().await;

        if let Some(active) = self.get_active() {
            if active.mode != ModeKind::Local {
                return Err(ModeError::ModeMismatch {
                    current: active.mode.to_string(),
                });
            }
        }
        self.activate_local(model_id).await
    }

    /// Replaces the API key and/or base URL.
    ///
    /// When API mode is active the remote provider is rebuilt with the new
    /// settings; if that fails the old settings and provider stay in place.
    pub async fn update_api_config(
        &self,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> ModeResult<()> {
        let _guard = self.transition.lock().await;

        let mut next = self.api_settings();
        if let Some(key) = api_key {
            next.api_key = key.trim().to_string();
        }
        if let Some(base_url) = base_url {
            next.base_url = validate_base_url(&base_url)?;
        }

        let api_active = self
            .get_active()
            .map(|a| a.mode == ModeKind::Api)
            .unwrap_or(false);

        if api_active {
            if !next.has_credentials() {
                return Err(ModeError::Configuration("api key is empty".to_string()));
            }
            let provider = self
                .factory
                .remote(&next)
                .map_err(|e| self.fail(ModeError::Configuration(e.to_string())))?;
            *self.api.write().unwrap_or_else(PoisonError::into_inner) = next;
            self.commit(ActiveProvider {
                mode: ModeKind::Api,
                model_id: None,
                provider,
            });
        } else {
            *self.api.write().unwrap_or_else(PoisonError::into_inner) = next;
        }

        info!(api = ?self.api_settings(), "Updated API configuration");
        Ok(())
    }

    async fn activate_local(&self, model_id: &str) -> ModeResult<()> {
        let descriptor = self.registry.get(model_id).map_err(|e| match e {
            RegistryError::UnknownModel(id) => ModeError::UnknownModel(id),
            other => ModeError::Configuration(other.to_string()),
        })?;
        if !descriptor.is_downloaded() {
            return Err(ModeError::ModelNotDownloaded(model_id.to_string()));
        }

        if let Some(active) = self.get_active() {
            if active.mode == ModeKind::Local && active.model_id() == Some(model_id) {
                debug!(model_id, "Model already active");
                self.recover();
                return Ok(());
            }
        }

        info!(model_id, "Loading local embedding model");
        let provider = self.factory.local(&descriptor).await.map_err(|source| {
            self.fail(ModeError::ModelLoad {
                model_id: model_id.to_string(),
                source,
            })
        })?;

        self.commit(ActiveProvider {
            mode: ModeKind::Local,
            model_id: Some(model_id.to_string()),
            provider,
        });
        Ok(())
    }

    fn activate_api(&self) -> ModeResult<()> {
        let api = self.api_settings();
        if !api.has_credentials() {
            return Err(ModeError::Configuration(
                "api key is required for api mode".to_string(),
            ));
        }
        validate_base_url(&api.base_url)?;

        let provider = self
            .factory
            .remote(&api)
            .map_err(|e| self.fail(ModeError::Configuration(e.to_string())))?;
        self.commit(ActiveProvider {
            mode: ModeKind::Api,
            model_id: None,
            provider,
        });
        Ok(())
    }

    /// Installs `active` as the serving provider.
    fn commit(&self, active: ActiveProvider) {
        let state = match active.mode {
            ModeKind::Local => ControllerState::LocalReady,
            ModeKind::Api => ControllerState::ApiReady,
        };
        info!(mode = %active.mode, provenance = %active.provenance(), "Embedding provider active");

        let previous = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if active.mode == ModeKind::Local {
                inner.last_local_model = active.model_id.clone();
            }
            inner.state = state;
            inner.last_error = None;
            inner.active.replace(Arc::new(active))
        };

        if let Some(previous) = previous {
            debug!(provenance = %previous.provenance(), "Released previous provider");
        }
    }

    /// Leaves `Error` when the serving provider is re-selected unchanged.
    fn recover(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let state = match inner.active.as_ref().map(|active| active.mode) {
            Some(ModeKind::Local) => ControllerState::LocalReady,
            Some(ModeKind::Api) => ControllerState::ApiReady,
            None => return,
        };
        inner.state = state;
        inner.last_error = None;
    }

    /// Records a failed transition and returns the error.
    fn fail(&self, err: ModeError) -> ModeError {
        warn!(error = %err, "Mode transition failed");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.state = ControllerState::Error;
        inner.last_error = Some(err.to_string());
        err
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, ModeInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeController")
            .field("state", &self.state())
            .field("mode", &self.get_mode())
            .finish_non_exhaustive()
    }
}

fn validate_base_url(raw: &str) -> ModeResult<String> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| ModeError::Configuration(format!("invalid base url '{trimmed}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ModeError::Configuration(format!(
            "base url must use http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}
