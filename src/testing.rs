//! Deterministic fakes shared by unit tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::{ApiSettings, ModelEntry, ModelSettings};
use crate::domain::{ImageRecord, PerformanceTier};
use crate::embedding::{
    Embedding, EmbeddingInput, EmbeddingProvider, ModelDescriptor, ModelTransport, ProviderError,
    ProviderFactory, ProviderResult, CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE,
};

pub const DIM: usize = 8;

/// Hashes text into a vector seeded by the model id, so identical text under
/// one model always matches and different models disagree.
pub fn hash_vector(model_id: &str, text: &str, dim: usize) -> Embedding {
    let mut values = Vec::with_capacity(dim);
    for i in 0..dim {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ (i as u64);
        for b in model_id.bytes().chain([0u8]).chain(text.bytes()) {
            h ^= b as u64;
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        values.push(((h % 2001) as f32 / 1000.0) - 1.0);
    }
    Embedding::new(values).normalized()
}

pub struct HashProvider {
    model_id: String,
    dim: usize,
    pub calls: AtomicUsize,
    failing: HashSet<String>,
    misshapen: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
}

impl HashProvider {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            dim: DIM,
            calls: AtomicUsize::new(0),
            failing: HashSet::new(),
            misshapen: HashSet::new(),
            gate: None,
        }
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    /// Image ids whose embedding fails.
    pub fn failing(mut self, ids: &[&str]) -> Self {
        self.failing = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Image ids embedded with one extra component.
    pub fn misshapen(mut self, ids: &[&str]) -> Self {
        self.misshapen = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Blocks every embed call until the semaphore gets permits.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &str {
        "hash"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }

    async fn embed(&self, input: EmbeddingInput<'_>) -> ProviderResult<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;
        }
        let mut dim = self.dim;
        if let EmbeddingInput::Image(record) = input {
            if self.failing.contains(record.id.as_str()) {
                return Err(ProviderError::Transient(format!("cannot embed {}", record.id)));
            }
            if self.misshapen.contains(record.id.as_str()) {
                dim += 1;
            }
        }
        Ok(hash_vector(&self.model_id, input.text(), dim))
    }
}

/// Factory handing out hash providers. Local loads of ids listed in
/// `broken` fail.
#[derive(Default)]
pub struct HashFactory {
    pub broken: HashSet<String>,
    pub loads: AtomicUsize,
}

impl HashFactory {
    pub fn broken(ids: &[&str]) -> Self {
        Self {
            broken: ids.iter().map(|s| s.to_string()).collect(),
            loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProviderFactory for HashFactory {
    async fn local(&self, descriptor: &ModelDescriptor) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(&descriptor.id) {
            return Err(ProviderError::ModelLoad(format!("weights for {} are unusable", descriptor.id)));
        }
        Ok(Arc::new(HashProvider::new(&descriptor.id)))
    }

    fn remote(&self, settings: &ApiSettings) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        Ok(Arc::new(HashProvider::new(&format!("api:{}", settings.model))))
    }
}

/// Transport that writes a minimal model directory.
#[derive(Default)]
pub struct FileTransport {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ModelTransport for FileTransport {
    async fn fetch(&self, _descriptor: &ModelDescriptor, dest: &Path) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        write_model_files(dest);
        Ok(())
    }
}

pub fn write_model_files(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(CONFIG_FILE), r#"{"hidden_size": 8}"#).unwrap();
    std::fs::write(dir.join(TOKENIZER_FILE), "{}").unwrap();
    std::fs::write(dir.join(WEIGHTS_FILE), b"weights").unwrap();
}

pub fn model_settings(dir: &Path) -> ModelSettings {
    ModelSettings {
        models_dir: dir.to_path_buf(),
        catalog: vec![
            ModelEntry::new("clip-s", "org/clip-s", PerformanceTier::Low),
            ModelEntry::new("clip-l", "org/clip-l", PerformanceTier::High),
        ],
    }
}

pub fn records(names: &[&str]) -> Vec<ImageRecord> {
    names
        .iter()
        .map(|name| ImageRecord::new(*name, format!("/images/{name}.png"), name.replace('_', " ")))
        .collect()
}
