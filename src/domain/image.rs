//! Indexed image records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ImageId;

/// An image known to the corpus.
///
/// Records are immutable once created; the cache stores them alongside
/// their embeddings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Stable identifier, unique within the corpus.
    pub id: ImageId,
    /// Where the image lives on disk.
    pub source: PathBuf,
    /// Text that text-only models embed in place of pixels.
    pub description: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ImageRecord {
    /// Creates a record with an explicit description.
    pub fn new(
        id: impl Into<ImageId>,
        source: impl Into<PathBuf>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            description: description.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Creates a record for a file inside `root`, deriving id and description
    /// from the file name.
    ///
    /// Returns `None` for paths without a usable file name.
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let id = relative.to_str()?.replace('\\', "/");
        let stem = path.file_stem()?.to_str()?;

        Some(Self::new(id, path, describe_stem(stem)))
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Turns a file stem like `cat_waving-hello` into `cat waving hello`.
fn describe_stem(stem: &str) -> String {
    stem.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
