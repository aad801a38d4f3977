//! Vector embeddings and the providers that produce them.
//!
//! # Architecture
//!
//! - [`EmbeddingProvider`] - Turns a query or an image into an [`Embedding`]
//! - [`LocalModel`] - Candle sentence encoder loaded from a model directory
//! - [`RemoteApiProvider`] - OpenAI-compatible `/embeddings` endpoint
//! - [`ModelRegistry`] - Catalog of installable models and their download state
//! - [`ProviderFactory`] - Builds providers for the mode controller
//!
//! # Example
//!
//! ```ignore
//! use vvquest::embedding::{DefaultProviderFactory, EmbeddingInput, ProviderFactory};
//!
//! let provider = DefaultProviderFactory.local(&descriptor).await?;
//! let query = provider.embed(EmbeddingInput::Query("cat")).await?;
//! ```

mod factory;
mod local;
mod models;
mod provider;
mod remote;
mod transport;
mod vector;

pub use factory::{DefaultProviderFactory, ProviderFactory};
pub use local::LocalModel;
pub use models::{
    validate_model_dir, Catalog, DownloadOutcome, DownloadStatus, ModelDescriptor, ModelRegistry,
    RegistryError, RegistryResult, CONFIG_FILE, REQUIRED_FILES, TOKENIZER_FILE, WEIGHTS_FILE,
};
pub use provider::{EmbeddingInput, EmbeddingProvider, ProviderError, ProviderResult};
pub use remote::RemoteApiProvider;
pub use transport::{HfHubTransport, ModelTransport};
pub use vector::Embedding;
