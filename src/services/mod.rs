//! Search services layer.
//!
//! This module contains the services that coordinate embedding providers,
//! the model registry and the persistent cache.
//!
//! # Architecture
//!
//! ```text
//! Application Layer (App, CLI)
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Infrastructure (Embedding providers, Storage)
//! ```
//!
//! # Services Overview
//!
//! - [`ModeController`]: Owns the active embedding provider and mode transitions
//! - [`CacheStore`]: Generates, persists and serves image embeddings
//! - [`SearchEngine`]: Ranks cached images against a query
//! - [`ImageCorpus`]: Supplies the images to index

mod cache_store;
mod corpus;
mod mode_controller;
mod search_engine;

pub use cache_store::{
    CacheEntry, CacheError, CacheResult, CacheSnapshot, CacheStore, GenerationJob,
    GenerationStarted, GenerationStatus, JobProgress,
};
pub use corpus::{DirectoryCorpus, ImageCorpus, StaticCorpus};
pub use mode_controller::{
    ActiveProvider, ApiConfigView, ControllerState, ModeController, ModeError, ModeInfo,
    ModeResult,
};
pub use search_engine::{rank, SearchEngine, SearchError, SearchHit, SearchResult};
