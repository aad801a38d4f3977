//! Image corpus enumeration.
//!
//! Cache generation asks an [`ImageCorpus`] for the images to index. How the
//! images got there is not this crate's concern.

use std::path::PathBuf;

use anyhow::Context;

use crate::config::CorpusSettings;
use crate::domain::ImageRecord;

/// Source of images to index.
#[cfg_attr(test, mockall::automock)]
pub trait ImageCorpus: Send + Sync {
    /// Lists every image, in a stable order.
    fn images(&self) -> anyhow::Result<Vec<ImageRecord>>;
}

/// Corpus backed by a single directory of image files.
#[derive(Debug, Clone)]
pub struct DirectoryCorpus {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirectoryCorpus {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_settings(settings: &CorpusSettings) -> Self {
        Self::new(settings.image_dir.clone(), settings.extensions.clone())
    }

    fn accepts(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

impl ImageCorpus for DirectoryCorpus {
    fn images(&self) -> anyhow::Result<Vec<ImageRecord>> {
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("cannot read image directory {}", self.root.display()))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && self.accepts(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(paths
            .iter()
            .filter_map(|path| ImageRecord::from_path(&self.root, path))
            .collect())
    }
}

/// Corpus over a fixed list of records.
#[derive(Debug, Clone, Default)]
pub struct StaticCorpus {
    images: Vec<ImageRecord>,
}

impl StaticCorpus {
    pub fn new(images: Vec<ImageRecord>) -> Self {
        Self { images }
    }
}

impl ImageCorpus for StaticCorpus {
    fn images(&self) -> anyhow::Result<Vec<ImageRecord>> {
        Ok(self.images.clone())
    }
}
