//! Task configuration loaded from YAML
//!
//! A task file names the input/output directories, the annotator backends,
//! the ensemble strategy and the optional dataset export settings. The loaded
//! [`ConfigManager`] is passed explicitly to the driver; nothing here is
//! process-global.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{AnnotatorIdentity, VoterId};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration at {path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Ensemble voting method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleStrategy {
    SimpleVote,
    WeightedVote,
    /// Named in task files but has no voter behind it.
    HighestConfidence,
}

impl std::fmt::Display for EnsembleStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SimpleVote => write!(f, "simple_vote"),
            Self::WeightedVote => write!(f, "weighted_vote"),
            Self::HighestConfidence => write!(f, "highest_confidence"),
        }
    }
}

/// Backend family of an annotator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotatorKind {
    Openai,
    Claude,
    Gemini,
}

impl AnnotatorKind {
    /// Environment variable consulted when no `api_key` is configured
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::Openai => "OPENAI_API_KEY",
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }

    /// Provider section name in prompt template files
    pub fn prompt_key(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }
}

/// Configuration for a single annotator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AnnotatorKind,
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub prompt_path: Option<PathBuf>,
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
}

const ANNOTATOR_KEYS: &[&str] = &[
    "name",
    "type",
    "task",
    "api_key",
    "model",
    "base_url",
    "weight",
    "output_format",
    "max_tokens",
    "temperature",
    "enabled",
    "prompt_path",
    "num_samples",
];

impl AnnotatorConfig {
    /// Minimal config for a backend; the remaining fields take their defaults.
    pub fn new(name: impl Into<String>, kind: AnnotatorKind, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            task: default_task(),
            api_key: None,
            model: Some(model.into()),
            base_url: None,
            weight: default_weight(),
            output_format: default_output_format(),
            max_tokens: None,
            temperature: None,
            enabled: true,
            prompt_path: None,
            num_samples: default_num_samples(),
        }
    }

    pub fn identity(&self) -> AnnotatorIdentity {
        AnnotatorIdentity::new(
            self.name.clone(),
            self.model.clone().unwrap_or_else(|| "default".to_string()),
        )
    }

    pub fn is_sampling(&self) -> bool {
        self.num_samples > 1
    }

    /// Configured key, falling back to the provider environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(self.kind.api_key_env()).ok())
    }

    /// Every voter id this annotator contributes.
    pub fn voter_ids(&self) -> Vec<VoterId> {
        let identity = self.identity();
        if self.is_sampling() {
            (0..self.num_samples)
                .map(|i| identity.sample_voter_id(i))
                .collect()
        } else {
            vec![identity.voter_id()]
        }
    }
}

/// Configuration for ensemble voting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub method: EnsembleStrategy,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default)]
    pub agreement_threshold: f64,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

const ENSEMBLE_KEYS: &[&str] = &[
    "method",
    "min_confidence",
    "agreement_threshold",
    "output_format",
];

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            method: EnsembleStrategy::WeightedVote,
            min_confidence: 0.0,
            agreement_threshold: 0.0,
            output_format: default_output_format(),
        }
    }
}

/// Configuration for dataset generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_dataset_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_dataset_format")]
    pub format: String,
    #[serde(default = "default_dataset_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_split_ratio")]
    pub split_ratio: f64,
    /// -1 means use all available records
    #[serde(default = "default_unlimited")]
    pub num_samples: i64,
}

const DATASET_KEYS: &[&str] = &[
    "name",
    "version",
    "description",
    "format",
    "output_dir",
    "split_ratio",
    "num_samples",
];

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: None,
            version: default_dataset_version(),
            description: String::new(),
            format: default_dataset_format(),
            output_dir: default_dataset_dir(),
            split_ratio: default_split_ratio(),
            num_samples: default_unlimited(),
        }
    }
}

impl DatasetConfig {
    pub fn record_limit(&self) -> Option<usize> {
        usize::try_from(self.num_samples).ok().filter(|n| *n > 0)
    }
}

/// Main task configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_task_id")]
    pub task_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub prompt_path: Option<PathBuf>,
    /// -1 means no limit
    #[serde(default = "default_unlimited")]
    pub max_files: i64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    pub annotators: Vec<AnnotatorConfig>,
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
}

const TASK_KEYS: &[&str] = &[
    "task_id",
    "input_dir",
    "output_dir",
    "prompt_path",
    "max_files",
    "max_workers",
    "annotators",
    "ensemble",
    "dataset",
];

impl TaskConfig {
    pub fn file_limit(&self) -> Option<usize> {
        usize::try_from(self.max_files).ok()
    }

    /// Directory holding consensus records
    pub fn voted_dir(&self) -> PathBuf {
        self.output_dir.join(crate::cache::VOTED_DIR)
    }

    pub fn dataset_name(&self) -> String {
        self.dataset
            .name
            .clone()
            .unwrap_or_else(|| self.task_id.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default = "default_version")]
    version: String,
    task: serde_yaml::Value,
}

/// Loaded and validated task configuration.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    version: String,
    task: TaskConfig,
}

impl ConfigManager {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        warn_unknown_keys(&file.task);
        let task: TaskConfig = serde_yaml::from_value(file.task)?;
        validate(&task)?;
        Ok(Self {
            version: file.version,
            task,
        })
    }

    /// Build from an already-constructed task (used by tests and embedders)
    pub fn from_task(task: TaskConfig) -> ConfigResult<Self> {
        validate(&task)?;
        Ok(Self {
            version: default_version(),
            task,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn task(&self) -> &TaskConfig {
        &self.task
    }

    pub fn ensemble(&self) -> &EnsembleConfig {
        &self.task.ensemble
    }

    pub fn dataset(&self) -> &DatasetConfig {
        &self.task.dataset
    }

    pub fn enabled_annotators(&self) -> Vec<AnnotatorConfig> {
        self.task
            .annotators
            .iter()
            .filter(|a| a.enabled)
            .cloned()
            .collect()
    }

    /// Voting weights for every enabled voter id. Sample voters inherit the
    /// weight of their annotator.
    pub fn annotator_weights(&self) -> HashMap<VoterId, f64> {
        let mut weights = HashMap::new();
        for ann in self.task.annotators.iter().filter(|a| a.enabled) {
            weights.insert(ann.identity().voter_id(), ann.weight);
            if ann.is_sampling() {
                for id in ann.voter_ids() {
                    weights.insert(id, ann.weight);
                }
            }
        }
        weights
    }
}

fn validate(task: &TaskConfig) -> ConfigResult<()> {
    if task.max_workers == 0 {
        return Err(invalid("task.max_workers", "must be at least 1"));
    }
    if !(0.0..=1.0).contains(&task.dataset.split_ratio) {
        return Err(invalid("dataset.split_ratio", "must be within [0, 1]"));
    }

    let mut seen = BTreeSet::new();
    for (i, ann) in task.annotators.iter().enumerate() {
        let path = format!("annotators[{i}]");
        if ann.name.trim().is_empty() {
            return Err(invalid(&path, "name must not be empty"));
        }
        if !is_path_segment(&ann.name) {
            return Err(invalid(&path, "name must not contain path separators or '..'"));
        }
        if ann.model.as_deref().is_some_and(|m| !m.is_empty() && !is_path_segment(m)) {
            return Err(invalid(&path, "model must not contain path separators or '..'"));
        }
        if ann.num_samples == 0 {
            return Err(invalid(&path, "num_samples must be at least 1"));
        }
        if ann.weight.is_nan() || ann.weight < 0.0 {
            return Err(invalid(&path, "weight must be non-negative"));
        }
        if !ann.enabled {
            continue;
        }
        if ann.model.as_deref().map_or(true, str::is_empty) {
            return Err(invalid(&path, "enabled annotator requires a model"));
        }
        if !seen.insert(ann.identity()) {
            return Err(invalid(
                &path,
                &format!("duplicate annotator identity {}", ann.identity()),
            ));
        }
    }
    Ok(())
}

/// Names and models become cache directories and voter ids.
fn is_path_segment(value: &str) -> bool {
    !value.contains(['/', '\\']) && value != "." && !value.contains("..")
}

fn invalid(path: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn warn_unknown_keys(task: &serde_yaml::Value) {
    check_keys(task, TASK_KEYS, "task");
    if let Some(annotators) = task.get("annotators").and_then(|a| a.as_sequence()) {
        for (i, ann) in annotators.iter().enumerate() {
            check_keys(ann, ANNOTATOR_KEYS, &format!("annotators[{i}]"));
        }
    }
    if let Some(ensemble) = task.get("ensemble") {
        check_keys(ensemble, ENSEMBLE_KEYS, "ensemble");
    }
    if let Some(dataset) = task.get("dataset") {
        check_keys(dataset, DATASET_KEYS, "dataset");
    }
}

fn check_keys(value: &serde_yaml::Value, valid: &[&str], path: &str) -> Vec<String> {
    let Some(map) = value.as_mapping() else {
        return Vec::new();
    };
    let unknown: Vec<String> = map
        .keys()
        .filter_map(|k| k.as_str())
        .filter(|k| !valid.contains(k))
        .map(str::to_string)
        .collect();
    if !unknown.is_empty() {
        warn!(
            path,
            unknown = ?unknown,
            valid = ?valid,
            "Unknown configuration fields"
        );
    }
    unknown
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_task() -> String {
    "vision_extraction".to_string()
}
fn default_task_id() -> String {
    "default_task".to_string()
}
fn default_weight() -> f64 {
    1.0
}
fn default_output_format() -> String {
    "json".to_string()
}
fn default_true() -> bool {
    true
}
fn default_num_samples() -> usize {
    1
}
fn default_unlimited() -> i64 {
    -1
}
fn default_max_workers() -> usize {
    8
}
fn default_dataset_version() -> String {
    "1.0".to_string()
}
fn default_dataset_format() -> String {
    "jsonl".to_string()
}
fn default_dataset_dir() -> PathBuf {
    PathBuf::from("./datasets")
}
fn default_split_ratio() -> f64 {
    0.8
}
