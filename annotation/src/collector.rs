//! Gathers every cached annotation for one image, keyed by voter id.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::cache::ResultCache;
use crate::config::AnnotatorConfig;
use crate::types::{AnnotationResult, AnnotatorIdentity, VoterId};

/// Where one annotator's votes live in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct VoterSource {
    pub identity: AnnotatorIdentity,
    /// 1 for single mode, otherwise the size of the sampling group
    pub num_samples: usize,
    pub temperature: Option<f64>,
}

impl VoterSource {
    pub fn single(identity: AnnotatorIdentity) -> Self {
        Self {
            identity,
            num_samples: 1,
            temperature: None,
        }
    }

    pub fn sampled(identity: AnnotatorIdentity, num_samples: usize, temperature: Option<f64>) -> Self {
        Self {
            identity,
            num_samples,
            temperature,
        }
    }
}

impl From<&AnnotatorConfig> for VoterSource {
    fn from(config: &AnnotatorConfig) -> Self {
        Self::sampled(config.identity(), config.num_samples, config.temperature)
    }
}

/// Read-only view over the result cache.
#[derive(Debug, Clone)]
pub struct ResultCollector {
    cache: ResultCache,
}

impl ResultCollector {
    pub fn new(cache: ResultCache) -> Self {
        Self { cache }
    }

    /// Load every available result for `stem`. Missing entries are logged
    /// and left out of the map.
    pub async fn collect(&self, stem: &str, sources: &[VoterSource]) -> BTreeMap<VoterId, AnnotationResult> {
        let mut results = BTreeMap::new();

        for source in sources {
            let id = &source.identity;
            if source.num_samples > 1 {
                for sample in 0..source.num_samples {
                    let path = self.cache.sample_path(id, source.temperature, sample, stem);
                    match self.cache.load_annotation(&path).await {
                        Some(result) => {
                            results.insert(id.sample_voter_id(sample), result);
                        }
                        None => warn!(
                            image = stem,
                            voter = %id.sample_voter_id(sample),
                            path = %path.display(),
                            "No cached sample"
                        ),
                    }
                }
            } else {
                let path = self.cache.single_path(id, stem);
                match self.cache.load_annotation(&path).await {
                    Some(result) => {
                        results.insert(id.voter_id(), result);
                    }
                    None => warn!(
                        image = stem,
                        voter = %id.voter_id(),
                        path = %path.display(),
                        "No cached result"
                    ),
                }
            }
        }

        debug!(image = stem, voters = results.len(), "Collected results");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    fn result(value: &str) -> AnnotationResult {
        AnnotationResult::new(vec![Field::new("name", value, 1.0)])
    }

    #[tokio::test]
    async fn test_collects_single_and_sampled_voters() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let single = AnnotatorIdentity::new("claude", "opus");
        let sampled = AnnotatorIdentity::new("openai", "gpt-4o");

        cache
            .save_annotation(&cache.single_path(&single, "img"), &result("a"))
            .await
            .unwrap();
        for sample in [0, 1, 3] {
            let path = cache.sample_path(&sampled, Some(0.7), sample, "img");
            cache.save_annotation(&path, &result("b")).await.unwrap();
        }

        let collector = ResultCollector::new(cache);
        let sources = vec![
            VoterSource::single(single),
            VoterSource::sampled(sampled, 4, Some(0.7)),
        ];
        let results = collector.collect("img", &sources).await;

        let ids: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec![
                "claude/opus",
                "openai/gpt-4o/sample_0",
                "openai/gpt-4o/sample_1",
                "openai/gpt-4o/sample_3"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_everything_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ResultCollector::new(ResultCache::new(dir.path()));
        let sources = vec![VoterSource::single(AnnotatorIdentity::new("a", "b"))];
        assert!(collector.collect("nothing", &sources).await.is_empty());
    }
}
