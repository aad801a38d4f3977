//! Similarity search over the embedding cache.
//!
//! A search embeds the query with the active provider and ranks every cached
//! image by cosine similarity. The cache and the query must come from the
//! same model; mismatches are reported instead of producing meaningless
//! scores.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::cache_store::{CacheEntry, CacheStore};
use super::mode_controller::ModeController;
use crate::domain::{ImageId, ImageRecord};
use crate::embedding::{Embedding, EmbeddingInput, ProviderError};

/// Errors from search operations.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("embedding cache is not ready")]
    CacheNotReady,

    /// The cache was built by a different model than the active one.
    #[error("cache was built with '{cache_model}' but the active model is '{active_model}'; regenerate the cache")]
    ModelMismatch {
        cache_model: String,
        active_model: String,
    },

    #[error("no embedding provider is active")]
    NotInitialized,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Result type for search operations.
pub type SearchResult<T> = Result<T, SearchError>;

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: ImageId,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
    pub source: PathBuf,
}

/// Ranks cached images against queries.
#[derive(Debug)]
pub struct SearchEngine {
    mode: Arc<ModeController>,
    cache: Arc<CacheStore>,
    min_similarity: Option<f32>,
}

impl SearchEngine {
    pub fn new(mode: Arc<ModeController>, cache: Arc<CacheStore>) -> Self {
        Self {
            mode,
            cache,
            min_similarity: None,
        }
    }

    /// Drops hits scoring below `threshold`.
    pub fn with_min_similarity(mut self, threshold: Option<f32>) -> Self {
        self.min_similarity = threshold;
        self
    }

    /// Returns up to `k` images most similar to `query`, best first.
    pub async fn search(&self, query: &str, k: usize) -> SearchResult<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidArgument("query must not be empty".to_string()));
        }
        self.run(EmbeddingInput::Query(query), k).await
    }

    /// Returns up to `k` cached images most similar to `image`.
    pub async fn search_by_image(&self, image: &ImageRecord, k: usize) -> SearchResult<Vec<SearchHit>> {
        self.run(EmbeddingInput::Image(image), k).await
    }

    async fn run(&self, input: EmbeddingInput<'_>, k: usize) -> SearchResult<Vec<SearchHit>> {
        if k == 0 {
            return Err(SearchError::InvalidArgument("k must be at least 1".to_string()));
        }

        let snapshot = self.cache.lookup_all().ok_or(SearchError::CacheNotReady)?;
        let active = self.mode.get_active().ok_or(SearchError::NotInitialized)?;

        if snapshot.is_stale_for(active.provenance()) {
            return Err(SearchError::ModelMismatch {
                cache_model: snapshot.provenance().to_string(),
                active_model: active.provenance().to_string(),
            });
        }

        let query = active.provider().embed(input).await?;
        if !snapshot.is_empty() && query.dimension() != snapshot.dimension() {
            return Err(SearchError::ModelMismatch {
                cache_model: format!("{} ({} dims)", snapshot.provenance(), snapshot.dimension()),
                active_model: format!("{} ({} dims)", active.provenance(), query.dimension()),
            });
        }

        let hits = rank(&query, snapshot.entries(), k, self.min_similarity);
        debug!(
            model_id = %active.provenance(),
            candidates = snapshot.len(),
            hits = hits.len(),
            "Search complete"
        );
        Ok(hits)
    }
}

/// Scores `entries` against `query` and keeps the best `k`.
///
/// Ties keep cache order. NaN scores sort last.
pub fn rank<'a>(
    query: &Embedding,
    entries: impl Iterator<Item = &'a CacheEntry>,
    k: usize,
    min_similarity: Option<f32>,
) -> Vec<SearchHit> {
    let mut scored: Vec<(f32, &CacheEntry)> = entries
        .map(|entry| {
            let score = query.cosine_similarity(&entry.vector);
            (if score.is_nan() { f32::NEG_INFINITY } else { score }, entry)
        })
        .collect();

    // stable
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    scored
        .into_iter()
        .filter(|(score, _)| min_similarity.map_or(true, |min| *score >= min))
        .take(k)
        .map(|(score, entry)| SearchHit {
            id: entry.image.id.clone(),
            score,
            source: entry.image.source.clone(),
        })
        .collect()
}
