//! Per-annotator processor
//!
//! Drives one annotator over a batch of images. For every image the cache is
//! consulted first; only missing entries reach the remote annotator. Raw
//! output is parsed and validated before it is persisted, so a malformed
//! answer never becomes a cache hit and is simply retried on the next run.
//!
//! ## Partial failure policy
//!
//! Every error for one image (annotate, parse, save) is logged and turned
//! into "no result for that image". It never aborts the rest of the batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::annotator::{Annotator, AnnotatorError, RawResult};
use crate::cache::{CacheError, ResultCache};
use crate::config::AnnotatorConfig;
use crate::parse::{parse_output, ParseError};
use crate::types::{now_rfc3339, AnnotationMetadata, AnnotationResult, AnnotatorIdentity, Field};

/// Default size of the per-annotator worker pool
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Errors while processing one image
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Annotator error: {0}")]
    Annotator(#[from] AnnotatorError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Annotator returned no output")]
    NoOutput,

    #[error("Image path has no file stem: {0}")]
    InvalidImagePath(PathBuf),
}

/// Result type for processor operations
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Counts from one `process_images` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Converts images into persisted annotation results for one annotator.
#[derive(Clone)]
pub struct Processor {
    annotator: Arc<dyn Annotator>,
    cache: ResultCache,
    identity: AnnotatorIdentity,
    num_samples: usize,
    temperature: Option<f64>,
}

impl Processor {
    /// Single-result processor filing under the annotator's own identity.
    pub fn new(annotator: Arc<dyn Annotator>, cache: ResultCache) -> Self {
        let identity = annotator.identity();
        Self {
            annotator,
            cache,
            identity,
            num_samples: 1,
            temperature: None,
        }
    }

    /// Processor configured from an annotator descriptor.
    pub fn from_config(
        annotator: Arc<dyn Annotator>,
        cache: ResultCache,
        config: &AnnotatorConfig,
    ) -> Self {
        Self {
            annotator,
            cache,
            identity: config.identity(),
            num_samples: config.num_samples.max(1),
            temperature: config.temperature,
        }
    }

    pub fn with_sampling(mut self, num_samples: usize, temperature: Option<f64>) -> Self {
        self.num_samples = num_samples.max(1);
        self.temperature = temperature;
        self
    }

    pub fn identity(&self) -> &AnnotatorIdentity {
        &self.identity
    }

    pub fn is_sampling(&self) -> bool {
        self.num_samples > 1
    }

    /// Single mode: return the cached result or annotate, parse and persist
    /// a new one.
    pub async fn process_image(&self, image_path: &Path) -> Option<AnnotationResult> {
        match self.try_process_single(image_path).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    annotator = %self.identity,
                    image = %image_path.display(),
                    error = %e,
                    "Failed to process image"
                );
                None
            }
        }
    }

    async fn try_process_single(&self, image_path: &Path) -> ProcessorResult<AnnotationResult> {
        let stem = image_stem(image_path)?;
        let path = self.cache.single_path(&self.identity, &stem);
        if let Some(cached) = self.cache.load_annotation(&path).await {
            debug!(annotator = %self.identity, image = %stem, "Cache hit");
            return Ok(cached);
        }

        let raw = self.annotator.annotate(image_path, 1).await?;
        let output = raw.outputs.first().ok_or(ProcessorError::NoOutput)?;
        let fields = parse_output(output)?;

        let result = self.build_result(fields, image_path, &raw, None);
        self.cache.save_annotation(&path, &result).await?;
        debug!(annotator = %self.identity, image = %stem, "Saved annotation");
        Ok(result)
    }

    /// Sampling mode: fill every missing sample slot with one call to the
    /// annotator. Returns whatever samples exist afterwards, `None` when
    /// there are none.
    pub async fn process_image_sampled(&self, image_path: &Path) -> Option<Vec<AnnotationResult>> {
        let stem = match image_stem(image_path) {
            Ok(stem) => stem,
            Err(e) => {
                warn!(annotator = %self.identity, error = %e, "Skipping image");
                return None;
            }
        };

        let mut slots: Vec<Option<AnnotationResult>> = Vec::with_capacity(self.num_samples);
        for sample in 0..self.num_samples {
            let path = self.sample_path(sample, &stem);
            slots.push(self.cache.load_annotation(&path).await);
        }

        let missing: Vec<usize> = (0..self.num_samples)
            .filter(|i| slots[*i].is_none())
            .collect();

        if !missing.is_empty() {
            debug!(
                annotator = %self.identity,
                image = %stem,
                missing = missing.len(),
                "Requesting missing samples"
            );
            match self.annotator.annotate(image_path, missing.len()).await {
                Ok(raw) => self.fill_samples(&mut slots, &missing, &raw, image_path, &stem).await,
                Err(e) => warn!(
                    annotator = %self.identity,
                    image = %stem,
                    error = %e,
                    "Sampling request failed"
                ),
            }
        }

        let results: Vec<AnnotationResult> = slots.into_iter().flatten().collect();
        if results.len() < self.num_samples {
            warn!(
                annotator = %self.identity,
                image = %stem,
                present = results.len(),
                expected = self.num_samples,
                "Incomplete sampling group"
            );
        }
        (!results.is_empty()).then_some(results)
    }

    async fn fill_samples(
        &self,
        slots: &mut [Option<AnnotationResult>],
        missing: &[usize],
        raw: &RawResult,
        image_path: &Path,
        stem: &str,
    ) {
        if raw.outputs.len() < missing.len() {
            warn!(
                annotator = %self.identity,
                image = %stem,
                requested = missing.len(),
                received = raw.outputs.len(),
                "Annotator returned fewer samples than requested"
            );
        }

        for (&sample, output) in missing.iter().zip(&raw.outputs) {
            let fields = match parse_output(output) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(annotator = %self.identity, image = %stem, sample, error = %e, "Invalid sample output");
                    continue;
                }
            };
            let result = self.build_result(fields, image_path, raw, Some(sample));
            let path = self.sample_path(sample, stem);
            match self.cache.save_annotation(&path, &result).await {
                Ok(()) => slots[sample] = Some(result),
                Err(e) => {
                    error!(annotator = %self.identity, image = %stem, sample, error = %e, "Failed to save sample")
                }
            }
        }
    }

    fn sample_path(&self, sample: usize, stem: &str) -> PathBuf {
        self.cache
            .sample_path(&self.identity, self.temperature, sample, stem)
    }

    fn build_result(
        &self,
        fields: Vec<Field>,
        image_path: &Path,
        raw: &RawResult,
        sample: Option<usize>,
    ) -> AnnotationResult {
        let mut result = AnnotationResult::new(fields);
        result.metadata = AnnotationMetadata {
            timestamp: now_rfc3339(),
            annotator: Some(self.identity.name.clone()),
            model: Some(self.identity.model.clone()),
            image_path: Some(image_path.display().to_string()),
            sample_id: sample,
            temperature: sample.and(self.temperature),
            extra: raw.metadata.clone(),
        };
        result
    }

    /// Process one image in whichever mode this processor is configured for.
    /// Returns whether at least one result exists afterwards.
    pub async fn process(&self, image_path: &Path) -> bool {
        if self.is_sampling() {
            self.process_image_sampled(image_path).await.is_some()
        } else {
            self.process_image(image_path).await.is_some()
        }
    }

    /// Process a batch on a pool of at most `max_workers` concurrent images.
    pub async fn process_images(&self, image_paths: &[PathBuf], max_workers: usize) -> ProcessSummary {
        let start = Instant::now();
        let sem = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut join_set: JoinSet<bool> = JoinSet::new();

        for path in image_paths {
            let sem = sem.clone();
            let processor = self.clone();
            let path = path.clone();
            join_set.spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return false;
                };
                processor.process(&path).await
            });
        }

        let mut summary = ProcessSummary {
            total: image_paths.len(),
            ..ProcessSummary::default()
        };
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!(annotator = %self.identity, error = %e, "Image worker panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            annotator = %self.identity,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Annotator batch complete"
        );
        summary
    }
}

/// File stem used as the cache key for an image.
pub fn image_stem(image_path: &Path) -> ProcessorResult<String> {
    image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProcessorError::InvalidImagePath(image_path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::{AnnotatorResult, RawOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted responses and counts calls.
    struct ScriptedAnnotator {
        responses: Mutex<Vec<AnnotatorResult<RawResult>>>,
        calls: AtomicUsize,
        requested: Mutex<Vec<usize>>,
    }

    impl ScriptedAnnotator {
        fn new(responses: Vec<AnnotatorResult<RawResult>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Annotator for ScriptedAnnotator {
        fn identity(&self) -> AnnotatorIdentity {
            AnnotatorIdentity::new("scripted", "v1")
        }

        async fn annotate(&self, _image_path: &Path, num_samples: usize) -> AnnotatorResult<RawResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(num_samples);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(AnnotatorError::RequestFailed("script exhausted".into()));
            }
            responses.remove(0)
        }
    }

    fn fields_text(value: &str) -> String {
        format!("```json\n{{\"fields\": [{{\"field_name\": \"total\", \"value\": \"{value}\", \"confidence\": 0.9}}]}}\n```")
    }

    #[tokio::test]
    async fn test_single_mode_caches_result() {
        let dir = tempfile::tempdir().unwrap();
        let annotator = ScriptedAnnotator::new(vec![Ok(RawResult::text(fields_text("10")))]);
        let processor = Processor::new(annotator.clone(), ResultCache::new(dir.path()));
        let image = dir.path().join("receipt.png");

        let first = processor.process_image(&image).await.unwrap();
        assert_eq!(first.fields()[0].value, "10");
        assert_eq!(first.metadata.annotator.as_deref(), Some("scripted"));

        let second = processor.process_image(&image).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(annotator.calls(), 1);
        assert!(dir.path().join("scripted/v1/receipt.json").exists());
    }

    #[tokio::test]
    async fn test_invalid_output_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let annotator = ScriptedAnnotator::new(vec![
            Ok(RawResult::text("```json\n{\"fields\": []}\n```")),
            Ok(RawResult::structured(json!({"fields": [{"field_name": "a", "value": "b"}]}))),
        ]);
        let processor = Processor::new(annotator.clone(), ResultCache::new(dir.path()));
        let image = dir.path().join("doc.jpg");

        assert!(processor.process_image(&image).await.is_none());
        assert!(!dir.path().join("scripted/v1/doc.json").exists());

        let retried = processor.process_image(&image).await.unwrap();
        assert_eq!(retried.fields()[0].confidence, 1.0);
        assert_eq!(annotator.calls(), 2);
    }

    #[tokio::test]
    async fn test_annotator_error_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let annotator = ScriptedAnnotator::new(vec![Err(AnnotatorError::Api {
            status: 401,
            body: "unauthorized".into(),
        })]);
        let processor = Processor::new(annotator, ResultCache::new(dir.path()));
        assert!(processor.process_image(&dir.path().join("a.png")).await.is_none());
    }

    #[tokio::test]
    async fn test_sampling_requests_only_missing_slots() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let annotator = ScriptedAnnotator::new(vec![
            Ok(RawResult {
                outputs: vec![
                    RawOutput::Text(fields_text("a")),
                    RawOutput::Text("no json here".into()),
                    RawOutput::Text(fields_text("c")),
                ],
                ..RawResult::default()
            }),
            Ok(RawResult::text(fields_text("b"))),
        ]);
        let processor =
            Processor::new(annotator.clone(), cache.clone()).with_sampling(3, Some(0.7));
        let image = dir.path().join("form.webp");

        let first = processor.process_image_sampled(&image).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].metadata.sample_id, Some(2));
        assert_eq!(first[1].metadata.temperature, Some(0.7));

        let identity = AnnotatorIdentity::new("scripted", "v1");
        assert!(cache.sample_path(&identity, Some(0.7), 0, "form").exists());
        assert!(!cache.sample_path(&identity, Some(0.7), 1, "form").exists());

        let second = processor.process_image_sampled(&image).await.unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].fields()[0].value, "b");
        assert_eq!(*annotator.requested.lock().unwrap(), vec![3, 1]);

        processor.process_image_sampled(&image).await.unwrap();
        assert_eq!(annotator.calls(), 2);
    }

    #[tokio::test]
    async fn test_process_images_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let annotator = ScriptedAnnotator::new(vec![
            Ok(RawResult::text(fields_text("1"))),
            Ok(RawResult::text(fields_text("2"))),
        ]);
        let processor = Processor::new(annotator.clone(), ResultCache::new(dir.path()));
        let images: Vec<PathBuf> = ["a.png", "b.png", "c.png"]
            .iter()
            .map(|n| dir.path().join(n))
            .collect();

        let summary = processor.process_images(&images, 2).await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(annotator.calls(), 3);
    }

    #[test]
    fn test_image_stem() {
        assert_eq!(image_stem(Path::new("/data/scan.01.png")).unwrap(), "scan.01");
        assert!(image_stem(Path::new("/")).is_err());
    }
}
