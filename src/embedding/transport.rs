//! Model file transport.
//!
//! The registry only decides *when* to download and whether the result is
//! valid; moving bytes is delegated to a [`ModelTransport`].

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;

use super::models::{ModelDescriptor, REQUIRED_FILES};

/// Fetches a model's files into a destination directory.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Places every file the model needs under `dest`.
    async fn fetch(&self, descriptor: &ModelDescriptor, dest: &Path) -> anyhow::Result<()>;
}

/// Transport pulling files from the Hugging Face hub.
#[derive(Debug, Clone, Default)]
pub struct HfHubTransport {
    cache_dir: Option<PathBuf>,
    token: Option<String>,
}

impl HfHubTransport {
    /// Uses the default hub cache and no token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the hub cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Authenticates against gated repositories.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl ModelTransport for HfHubTransport {
    async fn fetch(&self, descriptor: &ModelDescriptor, dest: &Path) -> anyhow::Result<()> {
        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(self.token.clone());
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().context("failed to initialize hub client")?;
        let repo = api.model(descriptor.repo_id.clone());

        tokio::fs::create_dir_all(dest).await?;
        for file in REQUIRED_FILES {
            tracing::debug!(repo_id = %descriptor.repo_id, file, "Fetching model file");
            let cached = repo
                .get(file)
                .await
                .with_context(|| format!("failed to fetch {} from {}", file, descriptor.repo_id))?;
            tokio::fs::copy(&cached, dest.join(file))
                .await
                .with_context(|| format!("failed to copy {}", file))?;
        }

        Ok(())
    }
}
