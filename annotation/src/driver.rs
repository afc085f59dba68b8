//! Batch driver: annotate, collect, vote, persist, export.
//!
//! Configuration-level problems (an unsupported voting strategy, no enabled
//! annotators) surface from [`BatchDriver::new`] before any work starts.
//! Everything after that is per image: a failure is logged with the task id,
//! the image and the cause, counted, and the loop moves on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::annotator::AnnotatorFactory;
use crate::cache::{CacheError, ResultCache};
use crate::collector::{ResultCollector, VoterSource};
use crate::config::{AnnotatorConfig, ConfigError, ConfigManager, EnsembleConfig};
use crate::discovery::{find_images, DiscoveryError};
use crate::export::{DatasetExporter, ExportError};
use crate::orchestrator::ParallelOrchestrator;
use crate::processor::{image_stem, ProcessorError};
use crate::types::VotedResult;
use crate::voting::{create_voter, Voter, VotingError};

/// Errors surfaced by the batch driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Voting error: {0}")]
    Voting(#[from] VotingError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Invalid image: {0}")]
    Image(#[from] ProcessorError),

    #[error("No enabled annotators in task {0}")]
    NoAnnotators(String),
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// What happened to one image's consensus record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Written,
    /// Existing record already holds the same consensus
    Unchanged,
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub voted: usize,
    pub failed: usize,
    /// Records written by the dataset exporter, 0 when export is off
    pub exported: usize,
}

pub struct BatchDriver {
    config: ConfigManager,
    annotators: Vec<AnnotatorConfig>,
    factory: Arc<dyn AnnotatorFactory>,
    voter: Box<dyn Voter>,
    exporter: Option<Box<dyn DatasetExporter>>,
    cache: ResultCache,
    max_workers: usize,
    skip_annotation: bool,
}

impl BatchDriver {
    /// Resolve the voter and annotator set. Fails fast on configuration
    /// problems.
    pub fn new(config: ConfigManager, factory: Arc<dyn AnnotatorFactory>) -> DriverResult<Self> {
        let voter = create_voter(config.ensemble().method, config.annotator_weights())?;
        let annotators = config.enabled_annotators();
        if annotators.is_empty() {
            return Err(DriverError::NoAnnotators(config.task().task_id.clone()));
        }
        let cache = ResultCache::new(&config.task().output_dir);
        let max_workers = config.task().max_workers;

        Ok(Self {
            config,
            annotators,
            factory,
            voter,
            exporter: None,
            cache,
            max_workers,
            skip_annotation: false,
        })
    }

    pub fn with_exporter(mut self, exporter: Box<dyn DatasetExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Vote over whatever is cached without calling any annotator.
    pub fn skip_annotation(mut self, skip: bool) -> Self {
        self.skip_annotation = skip;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.config.task().task_id
    }

    /// Images under the task's input directory, honoring `max_files`.
    pub fn discover_images(&self, recursive: bool) -> DriverResult<Vec<PathBuf>> {
        let task = self.config.task();
        Ok(find_images(&task.input_dir, recursive, task.file_limit())?)
    }

    /// Run the whole pipeline over `images`.
    pub async fn run(&self, images: &[PathBuf]) -> DriverResult<BatchSummary> {
        let start = Instant::now();
        let task_id = self.task_id();
        info!(
            task_id,
            images = images.len(),
            annotators = self.annotators.len(),
            strategy = %self.voter.strategy(),
            "Starting batch"
        );

        if self.skip_annotation {
            info!(task_id, "Skipping annotation, voting over cached results");
        } else {
            let orchestrator =
                ParallelOrchestrator::new(self.factory.clone(), self.cache.clone(), self.max_workers);
            orchestrator.run_all(&self.annotators, images).await;
        }

        let collector = ResultCollector::new(self.cache.clone());
        let sources: Vec<VoterSource> = self.annotators.iter().map(VoterSource::from).collect();
        let mut summary = BatchSummary {
            total: images.len(),
            ..BatchSummary::default()
        };

        for image in images {
            match self.vote_image(&collector, &sources, image).await {
                Ok(_) => summary.voted += 1,
                Err(e) => {
                    error!(task_id, image = %image.display(), error = %e, "Failed to vote image");
                    summary.failed += 1;
                }
            }
        }

        if let Some(exporter) = &self.exporter {
            match exporter.export(&self.cache.voted_dir()).await {
                Ok(export) => summary.exported = export.total(),
                Err(e) => error!(task_id, error = %e, "Dataset export failed"),
            }
        }

        info!(
            task_id,
            total = summary.total,
            voted = summary.voted,
            failed = summary.failed,
            exported = summary.exported,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch complete"
        );
        Ok(summary)
    }

    /// Collect, vote and persist one image's consensus record. The record is
    /// rewritten only when the consensus differs from what is on disk.
    pub async fn vote_image(
        &self,
        collector: &ResultCollector,
        sources: &[VoterSource],
        image: &Path,
    ) -> DriverResult<VoteOutcome> {
        let stem = image_stem(image)?;
        let results = collector.collect(&stem, sources).await;
        let voted = self
            .voter
            .vote(&results)?
            .with_task(self.task_id(), image.display().to_string());

        report_thresholds(self.task_id(), &stem, &voted, self.config.ensemble());

        let path = self.cache.voted_path(&stem);
        if let Some(existing) = self.cache.load_voted(&path).await {
            if existing.same_consensus(&voted) {
                debug!(task_id = self.task_id(), image = %stem, "Consensus unchanged");
                return Ok(VoteOutcome::Unchanged);
            }
        }
        self.cache.save_voted(&path, &voted).await?;
        debug!(
            task_id = self.task_id(),
            image = %stem,
            voters = voted.metadata.annotators.len(),
            "Saved consensus"
        );
        Ok(VoteOutcome::Written)
    }
}

/// Log low-confidence fields and the agreement share. Never alters the record.
fn report_thresholds(task_id: &str, image: &str, voted: &VotedResult, ensemble: &EnsembleConfig) {
    if ensemble.min_confidence > 0.0 {
        for field in voted.fields() {
            if field.confidence < ensemble.min_confidence {
                warn!(
                    task_id,
                    image,
                    field = %field.field_name,
                    confidence = field.confidence,
                    min_confidence = ensemble.min_confidence,
                    "Low-confidence consensus field"
                );
            }
        }
    }

    if ensemble.agreement_threshold > 0.0 && !voted.fields().is_empty() {
        let agreed = voted
            .fields()
            .iter()
            .filter(|f| f.confidence >= ensemble.agreement_threshold)
            .count();
        debug!(
            task_id,
            image,
            agreed,
            fields = voted.fields().len(),
            share = agreed as f64 / voted.fields().len() as f64,
            "Field agreement"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::{Annotator, AnnotatorResult, RawResult};
    use crate::config::EnsembleStrategy;
    use crate::types::AnnotatorIdentity;
    use async_trait::async_trait;

    struct NeverFactory;

    impl AnnotatorFactory for NeverFactory {
        fn create(&self, config: &AnnotatorConfig) -> AnnotatorResult<Arc<dyn Annotator>> {
            Err(crate::annotator::AnnotatorError::Configuration(config.name.clone()))
        }
    }

    struct Fixed;

    #[async_trait]
    impl Annotator for Fixed {
        fn identity(&self) -> AnnotatorIdentity {
            AnnotatorIdentity::new("fixed", "m")
        }
        async fn annotate(&self, _: &Path, _: usize) -> AnnotatorResult<RawResult> {
            Ok(RawResult::text(r#"{"fields":[{"field_name":"k","value":"v"}]}"#))
        }
    }

    struct FixedFactory;

    impl AnnotatorFactory for FixedFactory {
        fn create(&self, _: &AnnotatorConfig) -> AnnotatorResult<Arc<dyn Annotator>> {
            Ok(Arc::new(Fixed))
        }
    }

    fn manager(output: &Path, method: EnsembleStrategy) -> ConfigManager {
        let yaml = format!(
            r#"
task:
  task_id: unit
  input_dir: {input}
  output_dir: {output}
  annotators:
    - name: fixed
      type: openai
      model: m
  ensemble:
    method: {method}
"#,
            input = output.display(),
            output = output.display(),
        );
        ConfigManager::from_yaml_str(&yaml).unwrap()
    }

    #[test]
    fn test_highest_confidence_fails_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let result = BatchDriver::new(
            manager(dir.path(), EnsembleStrategy::HighestConfidence),
            Arc::new(NeverFactory),
        );
        assert!(matches!(
            result,
            Err(DriverError::Voting(VotingError::NotImplemented(_)))
        ));
    }

    #[tokio::test]
    async fn test_failed_annotators_mean_failed_images() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BatchDriver::new(
            manager(dir.path(), EnsembleStrategy::WeightedVote),
            Arc::new(NeverFactory),
        )
        .unwrap();
        let images = vec![dir.path().join("a.png"), dir.path().join("b.png")];

        let summary = driver.run(&images).await.unwrap();
        assert_eq!(
            summary,
            BatchSummary {
                total: 2,
                voted: 0,
                failed: 2,
                exported: 0
            }
        );
        assert!(!dir.path().join("voted_results").exists());
    }

    #[tokio::test]
    async fn test_unchanged_consensus_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BatchDriver::new(
            manager(dir.path(), EnsembleStrategy::SimpleVote),
            Arc::new(FixedFactory),
        )
        .unwrap();
        let image = dir.path().join("scan.png");
        let collector = ResultCollector::new(ResultCache::new(dir.path()));
        let sources = vec![VoterSource::single(AnnotatorIdentity::new("fixed", "m"))];

        driver.run(std::slice::from_ref(&image)).await.unwrap();
        let outcome = driver.vote_image(&collector, &sources, &image).await.unwrap();
        assert_eq!(outcome, VoteOutcome::Unchanged);
    }
}
