//! Multi-Model Document Annotation Library
//!
//! This library provides:
//! - Vision-model annotator backends (OpenAI-compatible, Claude, Gemini)
//! - A resumable, file-backed result cache with atomic writes
//! - Concurrent per-annotator processing with bounded worker pools
//! - Field-level ensemble voting with deterministic tie-breaking
//! - Dataset export and ground-truth evaluation
//!
//! # Pipeline
//!
//! ```text
//! find_images ─► ParallelOrchestrator ─► Processor (one per annotator)
//!                                           │ annotate ─► parse ─► cache
//!                                           ▼
//!                 ResultCollector ─► Voter ─► voted_results/{stem}.json
//!                                               │
//!                                               ▼
//!                                       DatasetExporter (optional)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use annotation::{BatchDriver, ConfigManager, HttpAnnotatorFactory};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::from_file("config/task.yaml")?;
//! let factory = HttpAnnotatorFactory::default()
//!     .with_prompt_path(config.task().prompt_path.clone());
//! let driver = BatchDriver::new(config, Arc::new(factory))?;
//! let images = driver.discover_images(false)?;
//! let summary = driver.run(&images).await?;
//! println!("voted {} of {}", summary.voted, summary.total);
//! # Ok(())
//! # }
//! ```

pub mod annotator;
pub mod cache;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod evaluate;
pub mod export;
pub mod orchestrator;
pub mod parse;
pub mod processor;
pub mod retry;
pub mod types;
pub mod voting;

// Re-export key annotator types
pub use annotator::{
    Annotator, AnnotatorError, AnnotatorFactory, AnnotatorResult, HttpAnnotatorFactory, RawOutput,
    RawResult,
};

// Re-export cache and pipeline types
pub use cache::{CacheError, ResultCache, VOTED_DIR};
pub use collector::{ResultCollector, VoterSource};
pub use driver::{BatchDriver, BatchSummary, DriverError, DriverResult, VoteOutcome};
pub use orchestrator::{ParallelOrchestrator, UnitOutcome, UnitReport};
pub use processor::{ProcessSummary, Processor, ProcessorError};

// Re-export configuration types
pub use config::{
    AnnotatorConfig, AnnotatorKind, ConfigError, ConfigManager, DatasetConfig, EnsembleConfig,
    EnsembleStrategy, TaskConfig,
};

// Re-export voting types
pub use voting::{create_voter, MajorityVoter, Voter, VotingError, VotingWeights, WeightedVoter};

// Re-export data model
pub use types::{
    AnnotationMetadata, AnnotationResult, AnnotatorIdentity, Field, FieldSet, VotedMetadata,
    VotedResult, VoterId,
};

// Re-export export and evaluation types
pub use discovery::find_images;
pub use evaluate::{FieldEvaluator, FieldMatcher, SamplingEvaluator};
pub use export::{DatasetExporter, ExportError, ExportSummary, JsonlDatasetExporter};
pub use parse::{extract_json_from_text, ParseError};
pub use retry::RetryPolicy;
