//! Cross-annotator fan-out
//!
//! One tokio task per annotator configuration. Each task builds its own
//! backend through the [`AnnotatorFactory`] and owns its own [`Processor`],
//! so units share nothing but the append-only cache tree, and every unit
//! writes only below its own `{name}/{model}` subtree.
//!
//! A unit that fails to start or panics is logged and reported; siblings
//! keep running to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::annotator::AnnotatorFactory;
use crate::cache::ResultCache;
use crate::config::AnnotatorConfig;
use crate::processor::{ProcessSummary, Processor};
use crate::types::AnnotatorIdentity;

/// How one execution unit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed(ProcessSummary),
    Failed(String),
}

/// Outcome of one unit, tagged with the annotator it ran.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub identity: AnnotatorIdentity,
    pub outcome: UnitOutcome,
}

impl UnitReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Completed(_))
    }
}

/// Runs every configured annotator concurrently over the same images.
pub struct ParallelOrchestrator {
    factory: Arc<dyn AnnotatorFactory>,
    cache: ResultCache,
    max_workers: usize,
}

impl ParallelOrchestrator {
    pub fn new(factory: Arc<dyn AnnotatorFactory>, cache: ResultCache, max_workers: usize) -> Self {
        Self {
            factory,
            cache,
            max_workers: max_workers.max(1),
        }
    }

    /// Spawn one unit per config and wait for all of them.
    pub async fn run_all(&self, configs: &[AnnotatorConfig], images: &[PathBuf]) -> Vec<UnitReport> {
        let start = Instant::now();
        let images = Arc::new(images.to_vec());
        info!(
            annotators = configs.len(),
            images = images.len(),
            max_workers = self.max_workers,
            "Starting annotator units"
        );

        let handles: Vec<_> = configs
            .iter()
            .map(|config| {
                let identity = config.identity();
                let config = config.clone();
                let factory = self.factory.clone();
                let cache = self.cache.clone();
                let images = images.clone();
                let max_workers = self.max_workers;
                let handle = tokio::spawn(async move {
                    let annotator = factory
                        .create(&config)
                        .map_err(|e| format!("failed to create annotator: {e}"))?;
                    let processor = Processor::from_config(annotator, cache, &config);
                    Ok::<_, String>(processor.process_images(&images, max_workers).await)
                });
                (identity, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (identity, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(summary)) => UnitOutcome::Completed(summary),
                Ok(Err(reason)) => {
                    error!(annotator = %identity, error = %reason, "Annotator unit failed");
                    UnitOutcome::Failed(reason)
                }
                Err(e) => {
                    error!(annotator = %identity, error = %e, "Annotator unit panicked");
                    UnitOutcome::Failed(format!("unit panicked: {e}"))
                }
            };
            reports.push(UnitReport { identity, outcome });
        }

        let completed = reports.iter().filter(|r| r.is_completed()).count();
        info!(
            completed,
            failed = reports.len() - completed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "All annotator units finished"
        );
        reports
    }
}
