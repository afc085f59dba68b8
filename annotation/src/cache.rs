//! On-disk result cache
//!
//! Layout under the task output root:
//!
//! ```text
//! {root}/{name}/{model}/{stem}.json                                   single mode
//! {root}/{name}/{model}/sampling[_{temperature}]/sample_{i}/{stem}.json  sampling mode
//! {root}/voted_results/{stem}.json                                    consensus
//! ```
//!
//! Every (voter, image, sample) triple maps to exactly one path, so each path
//! has a single writer. Writes go to a temporary sibling and are renamed into
//! place; a reader either sees a complete file or no file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{AnnotationResult, AnnotatorIdentity, VotedResult};

/// Directory holding consensus records, relative to the output root.
pub const VOTED_DIR: &str = "voted_results";

/// Errors from cache writes
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid cache path: {0}")]
    InvalidPath(PathBuf),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Sampling directory suffix: `0.7` renders as `0.7`, `1` as `1.0`.
pub fn format_temperature(temperature: f64) -> String {
    if temperature.is_finite() && temperature.fract() == 0.0 {
        format!("{temperature:.1}")
    } else {
        format!("{temperature}")
    }
}

/// Path arithmetic and persistence for one output root.
#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
}

impl ResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn annotator_dir(&self, identity: &AnnotatorIdentity) -> PathBuf {
        self.root.join(&identity.name).join(&identity.model)
    }

    pub fn single_path(&self, identity: &AnnotatorIdentity, stem: &str) -> PathBuf {
        self.annotator_dir(identity).join(format!("{stem}.json"))
    }

    pub fn sampling_dir(&self, identity: &AnnotatorIdentity, temperature: Option<f64>) -> PathBuf {
        let dir = match temperature {
            Some(t) => format!("sampling_{}", format_temperature(t)),
            None => "sampling".to_string(),
        };
        self.annotator_dir(identity).join(dir)
    }

    pub fn sample_path(
        &self,
        identity: &AnnotatorIdentity,
        temperature: Option<f64>,
        sample: usize,
        stem: &str,
    ) -> PathBuf {
        self.sampling_dir(identity, temperature)
            .join(format!("sample_{sample}"))
            .join(format!("{stem}.json"))
    }

    pub fn voted_dir(&self) -> PathBuf {
        self.root.join(VOTED_DIR)
    }

    pub fn voted_path(&self, stem: &str) -> PathBuf {
        self.voted_dir().join(format!("{stem}.json"))
    }

    /// Load a cached annotation. Missing, unreadable and field-less entries
    /// are all reported as absent.
    pub async fn load_annotation(&self, path: &Path) -> Option<AnnotationResult> {
        let result: AnnotationResult = read_json(path).await?;
        if result.is_empty() {
            debug!(path = %path.display(), "Cached result has no fields, ignoring");
            return None;
        }
        Some(result)
    }

    pub async fn load_voted(&self, path: &Path) -> Option<VotedResult> {
        read_json(path).await
    }

    pub async fn save_annotation(&self, path: &Path, result: &AnnotationResult) -> CacheResult<()> {
        write_json_atomic(path, result).await
    }

    pub async fn save_voted(&self, path: &Path, result: &VotedResult) -> CacheResult<()> {
        write_json_atomic(path, result).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read cache entry");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt cache entry, treating as missing");
            None
        }
    }
}

/// Serialize `value` as pretty JSON and move it into place with a rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> CacheResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CacheError::InvalidPath(path.to_path_buf()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| CacheError::InvalidPath(path.to_path_buf()))?
        .to_string_lossy();

    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');

    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| CacheError::Io {
            path: parent.to_path_buf(),
            source,
        })?;

    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    if let Err(source) = tokio::fs::write(&tmp, &bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(CacheError::Io { path: tmp, source });
    }
    if let Err(source) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
