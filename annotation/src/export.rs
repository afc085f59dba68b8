//! Dataset export from consensus records
//!
//! Turns the voted-results directory into a split JSONL dataset:
//!
//! ```text
//! {output_dir}/{name}/train.jsonl
//! {output_dir}/{name}/test.jsonl
//! {output_dir}/{name}/validation.jsonl
//! {output_dir}/{name}/dataset_info.json
//! ```
//!
//! Records are shuffled with a fixed seed, so the same voted directory always
//! yields the same splits.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cache::{write_json_atomic, CacheError};
use crate::config::DatasetConfig;
use crate::types::{now_rfc3339, Field, VotedResult};

/// Seed for the split shuffle
pub const SPLIT_SEED: u64 = 42;

/// Errors from dataset export
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("No valid voted results found in {0}")]
    Empty(PathBuf),

    #[error("Unsupported dataset format: {0}")]
    UnsupportedFormat(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;

/// One dataset row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub image_path: String,
    pub filename: String,
    pub fields: Vec<Field>,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub task_id: String,
    pub timestamp: String,
    pub annotators: Vec<String>,
}

impl DatasetRecord {
    fn from_voted(voted: VotedResult, filename: String) -> Self {
        Self {
            image_path: voted.metadata.image_path,
            filename,
            fields: voted.result.fields,
            metadata: RecordMetadata {
                task_id: voted.metadata.task_id,
                timestamp: voted.metadata.timestamp,
                annotators: voted.metadata.annotators,
            },
        }
    }
}

/// Split sizes and location of an exported dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub output_dir: PathBuf,
    pub train: usize,
    pub test: usize,
    pub validation: usize,
}

impl ExportSummary {
    pub fn total(&self) -> usize {
        self.train + self.test + self.validation
    }
}

/// Turns a voted-results directory into a dataset.
#[async_trait]
pub trait DatasetExporter: Send + Sync {
    async fn export(&self, voted_dir: &Path) -> ExportResult<ExportSummary>;
}

/// JSONL exporter driven by the task's `dataset` section.
#[derive(Debug, Clone)]
pub struct JsonlDatasetExporter {
    config: DatasetConfig,
    name: String,
}

impl JsonlDatasetExporter {
    pub fn new(config: DatasetConfig, name: impl Into<String>) -> Self {
        Self {
            config,
            name: name.into(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir.join(&self.name)
    }

    async fn write_split(&self, dir: &Path, split: &str, records: &[DatasetRecord]) -> ExportResult<()> {
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        let path = dir.join(format!("{split}.jsonl"));
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| ExportError::Io { path, source })
    }
}

/// Train share is `split_ratio`; the rest is halved between test and
/// validation, test taking the odd record.
pub fn split_sizes(total: usize, split_ratio: f64) -> (usize, usize, usize) {
    let train = ((total as f64) * split_ratio.clamp(0.0, 1.0)).round() as usize;
    let train = train.min(total);
    let rest = total - train;
    let validation = rest / 2;
    (train, rest - validation, validation)
}

/// Load every readable voted result, sorted by file name.
pub async fn load_voted_results(voted_dir: &Path) -> ExportResult<Vec<DatasetRecord>> {
    let mut entries = tokio::fs::read_dir(voted_dir)
        .await
        .map_err(|source| ExportError::Io {
            path: voted_dir.to_path_buf(),
            source,
        })?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| ExportError::Io {
        path: voted_dir.to_path_buf(),
        source,
    })? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();

    let mut records = Vec::with_capacity(files.len());
    for path in files {
        let parsed = tokio::fs::read(&path)
            .await
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<VotedResult>(&bytes).map_err(|e| e.to_string()));
        match parsed {
            Ok(voted) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                records.push(DatasetRecord::from_voted(voted, filename));
            }
            Err(e) => error!(path = %path.display(), error = %e, "Skipping unreadable voted result"),
        }
    }
    Ok(records)
}

#[async_trait]
impl DatasetExporter for JsonlDatasetExporter {
    async fn export(&self, voted_dir: &Path) -> ExportResult<ExportSummary> {
        if !self.config.format.eq_ignore_ascii_case("jsonl") {
            return Err(ExportError::UnsupportedFormat(self.config.format.clone()));
        }

        let mut records = load_voted_results(voted_dir).await?;
        if records.is_empty() {
            return Err(ExportError::Empty(voted_dir.to_path_buf()));
        }

        let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
        records.shuffle(&mut rng);
        if let Some(limit) = self.config.record_limit() {
            records.truncate(limit);
        }

        let (train, test, validation) = split_sizes(records.len(), self.config.split_ratio);
        let dir = self.output_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ExportError::Io {
                path: dir.clone(),
                source,
            })?;

        self.write_split(&dir, "train", &records[..train]).await?;
        self.write_split(&dir, "test", &records[train..train + test]).await?;
        self.write_split(&dir, "validation", &records[train + test..]).await?;

        let info = serde_json::json!({
            "name": self.name,
            "version": self.config.version,
            "description": self.config.description,
            "format": self.config.format,
            "source": voted_dir.display().to_string(),
            "created_at": now_rfc3339(),
            "num_records": records.len(),
            "splits": {"train": train, "test": test, "validation": validation},
        });
        write_json_atomic(&dir.join("dataset_info.json"), &info).await?;

        let summary = ExportSummary {
            output_dir: dir,
            train,
            test,
            validation,
        };
        info!(
            dataset = %self.name,
            output = %summary.output_dir.display(),
            train,
            test,
            validation,
            "Dataset exported"
        );
        Ok(summary)
    }
}
