//! Local embedding provider backed by Candle.
//!
//! Loads a BERT-family sentence encoder from a model directory containing
//! `config.json`, `tokenizer.json` and `model.safetensors`, and produces
//! mean-pooled, L2-normalized sentence embeddings on the CPU.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use tokenizers::{Tokenizer, TruncationParams};

use super::models::{ModelDescriptor, CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE};
use super::provider::{EmbeddingInput, EmbeddingProvider, ProviderError, ProviderResult};
use crate::embedding::Embedding;

/// Loaded model state shared with blocking inference tasks.
struct Inner {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

/// Provider running a sentence encoder in-process.
pub struct LocalModel {
    inner: Arc<Inner>,
    model_id: String,
    dimension: usize,
    query_prefix: Option<String>,
    document_prefix: Option<String>,
}

impl LocalModel {
    /// Loads the model described by `descriptor` from its storage location.
    ///
    /// This is CPU and IO heavy; async callers should run it on a blocking
    /// thread.
    pub fn load(descriptor: &ModelDescriptor) -> ProviderResult<Self> {
        let dir = descriptor.storage_path.as_path();
        tracing::info!(
            model_id = %descriptor.id,
            path = %dir.display(),
            "Loading local embedding model"
        );

        let config = read_config(dir)?;
        let dimension = config.hidden_size;

        let mut tokenizer = Tokenizer::from_file(dir.join(TOKENIZER_FILE))
            .map_err(|e| ProviderError::ModelLoad(format!("invalid tokenizer: {}", e)))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: descriptor.max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| ProviderError::ModelLoad(format!("invalid truncation: {}", e)))?;
        tokenizer.with_padding(None);

        let device = Device::Cpu;
        let weights = std::fs::read(dir.join(WEIGHTS_FILE))
            .map_err(|e| ProviderError::ModelLoad(format!("cannot read weights: {}", e)))?;
        let vb = VarBuilder::from_buffered_safetensors(weights, DTYPE, &device)
            .map_err(|e| ProviderError::ModelLoad(format!("corrupt weights: {}", e)))?;
        let model = BertModel::load(vb, &config)
            .map_err(|e| ProviderError::ModelLoad(format!("incompatible weights: {}", e)))?;

        tracing::info!(model_id = %descriptor.id, dimension, "Local embedding model loaded");

        Ok(Self {
            inner: Arc::new(Inner {
                model,
                tokenizer,
                device,
            }),
            model_id: descriptor.id.clone(),
            dimension,
            query_prefix: descriptor.query_prefix.clone(),
            document_prefix: descriptor.document_prefix.clone(),
        })
    }

    /// Applies the model's query or document prefix.
    fn prepare_text(&self, input: EmbeddingInput<'_>) -> String {
        let prefix = match input {
            EmbeddingInput::Query(_) => self.query_prefix.as_deref(),
            EmbeddingInput::Image(_) => self.document_prefix.as_deref(),
        };
        format!("{}{}", prefix.unwrap_or_default(), input.text())
    }
}

fn read_config(dir: &Path) -> ProviderResult<BertConfig> {
    let raw = std::fs::read_to_string(dir.join(CONFIG_FILE))
        .map_err(|e| ProviderError::ModelLoad(format!("cannot read {}: {}", CONFIG_FILE, e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| ProviderError::ModelLoad(format!("invalid {}: {}", CONFIG_FILE, e)))
}

impl Inner {
    /// Tokenizes, runs a forward pass and mean-pools the last hidden state.
    fn encode(&self, text: &str) -> candle_core::Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenization failed: {}", e)))?;

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = input_ids.zeros_like()?;
        let attention_mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let (_batch, n_tokens, _hidden) = hidden.dims3()?;
        let pooled = (hidden.sum(1)? / (n_tokens as f64))?;

        pooled.squeeze(0)?.to_vec1::<f32>()
    }
}

#[async_trait]
impl EmbeddingProvider for LocalModel {
    fn name(&self) -> &str {
        "local"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn embed(&self, input: EmbeddingInput<'_>) -> ProviderResult<Embedding> {
        let text = self.prepare_text(input);
        let inner = Arc::clone(&self.inner);

        let values = tokio::task::spawn_blocking(move || inner.encode(&text))
            .await
            .map_err(|e| ProviderError::Permanent(format!("inference task failed: {}", e)))?
            .map_err(|e| ProviderError::Permanent(format!("inference failed: {}", e)))?;

        Ok(Embedding::new(values).normalized())
    }
}
