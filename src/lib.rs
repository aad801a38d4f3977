//! vvquest - Semantic image search over a local embedding cache
//!
//! This crate provides the core functionality for vvquest, including
//! embedding providers (local Candle models and remote APIs), the model
//! registry, the persistent embedding cache and similarity search.

pub mod app;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod services;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use app::App;
