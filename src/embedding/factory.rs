//! Provider construction.
//!
//! The mode controller never builds providers itself; it asks a
//! [`ProviderFactory`], which keeps model loading swappable in tests.

use std::sync::Arc;

use async_trait::async_trait;

use super::local::LocalModel;
use super::models::ModelDescriptor;
use super::provider::{EmbeddingProvider, ProviderError, ProviderResult};
use super::remote::RemoteApiProvider;
use crate::config::ApiSettings;

/// Builds embedding providers for the mode controller.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Loads a local model. Must fail with [`ProviderError::ModelLoad`] when
    /// the weights are absent or unusable.
    async fn local(&self, descriptor: &ModelDescriptor) -> ProviderResult<Arc<dyn EmbeddingProvider>>;

    /// Creates a remote API provider.
    fn remote(&self, settings: &ApiSettings) -> ProviderResult<Arc<dyn EmbeddingProvider>>;
}

/// Factory producing the Candle and HTTP providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProviderFactory;

#[async_trait]
impl ProviderFactory for DefaultProviderFactory {
    async fn local(&self, descriptor: &ModelDescriptor) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        let descriptor = descriptor.clone();
        let model = tokio::task::spawn_blocking(move || LocalModel::load(&descriptor))
            .await
            .map_err(|e| ProviderError::ModelLoad(format!("load task failed: {}", e)))??;
        Ok(Arc::new(model))
    }

    fn remote(&self, settings: &ApiSettings) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        Ok(Arc::new(RemoteApiProvider::new(settings)?))
    }
}
