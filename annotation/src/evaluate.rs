//! Evaluation of annotations against ground truth
//!
//! Ground truth and prediction files share the persisted record shape
//! (`{"result": {"fields": [...]}}`) and are paired by file name. Fields are
//! compared with a per-field [`FieldMatcher`], exact string equality unless
//! configured otherwise. Fields present only in the prediction are ignored.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Field, FieldSet};

/// Errors from evaluation runs
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Directory not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown matcher '{0}' (expected exact, case_insensitive, numeric, date or currency)")]
    UnknownMatcher(String),
}

/// Result type for evaluation
pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// Comparison strategy for one field.
pub trait FieldMatcher: Send + Sync {
    fn matches(&self, expected: &str, predicted: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl FieldMatcher for ExactMatcher {
    fn matches(&self, expected: &str, predicted: &str) -> bool {
        expected == predicted
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaseInsensitiveMatcher;

impl FieldMatcher for CaseInsensitiveMatcher {
    fn matches(&self, expected: &str, predicted: &str) -> bool {
        expected.to_lowercase() == predicted.to_lowercase()
    }
}

/// Numbers equal within `tolerance`; `,` is read as a thousands separator.
/// Non-numeric values fall back to exact comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericMatcher {
    pub tolerance: f64,
}

impl FieldMatcher for NumericMatcher {
    fn matches(&self, expected: &str, predicted: &str) -> bool {
        let parse = |s: &str| s.trim().replace(',', "").parse::<f64>().ok();
        match (parse(expected), parse(predicted)) {
            (Some(a), Some(b)) => (a - b).abs() <= self.tolerance,
            _ => expected == predicted,
        }
    }
}

/// Same calendar date in any of the accepted formats.
#[derive(Debug, Clone)]
pub struct DateMatcher {
    pub formats: Vec<String>,
}

impl Default for DateMatcher {
    fn default() -> Self {
        Self {
            formats: ["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

impl DateMatcher {
    fn parse(&self, value: &str) -> Option<NaiveDate> {
        self.formats
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(value.trim(), fmt).ok())
    }
}

impl FieldMatcher for DateMatcher {
    fn matches(&self, expected: &str, predicted: &str) -> bool {
        match (self.parse(expected), self.parse(predicted)) {
            (Some(a), Some(b)) => a == b,
            (None, None) => expected == predicted,
            _ => false,
        }
    }
}

static CURRENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9][0-9,.]*)\s*([A-Z]{3})?|([A-Z]{3})?\s*([0-9][0-9,.]*)")
        .expect("CURRENCY_RE regex should compile")
});

/// Monetary amounts within `tolerance`, accepting `1,234.56 USD`,
/// `1.234,56 EUR`, `USD 1234.56` and bare amounts. Currency codes must agree
/// when both sides carry one.
#[derive(Debug, Clone, Copy)]
pub struct CurrencyMatcher {
    pub tolerance: f64,
}

impl Default for CurrencyMatcher {
    fn default() -> Self {
        Self { tolerance: 0.01 }
    }
}

impl CurrencyMatcher {
    /// Amount and (possibly empty) currency code. Unparseable input reads as
    /// zero with no currency.
    pub fn amount_and_currency(value: &str) -> (f64, String) {
        let value = value.trim();
        let Some(caps) = CURRENCY_RE.captures(value) else {
            return (0.0, String::new());
        };
        let amount = caps.get(1).or_else(|| caps.get(4)).map(|m| m.as_str()).unwrap_or("");
        let currency = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let normalized = match (amount.find(','), amount.find('.')) {
            (Some(comma), Some(dot)) if comma < dot => amount.replace(',', ""),
            (Some(_), Some(_)) => amount.replace('.', "").replace(',', "."),
            (Some(_), None) => {
                let parts: Vec<&str> = amount.split(',').collect();
                if parts.len() == 2 && parts[1].len() == 2 {
                    amount.replace(',', ".")
                } else {
                    amount.replace(',', "")
                }
            }
            _ => amount.to_string(),
        };

        match normalized.parse::<f64>() {
            Ok(amount) => (amount, currency),
            Err(_) => (0.0, String::new()),
        }
    }
}

impl FieldMatcher for CurrencyMatcher {
    fn matches(&self, expected: &str, predicted: &str) -> bool {
        let (a, a_cur) = Self::amount_and_currency(expected);
        let (b, b_cur) = Self::amount_and_currency(predicted);
        if !a_cur.is_empty() && !b_cur.is_empty() && a_cur != b_cur {
            return false;
        }
        (a - b).abs() <= self.tolerance
    }
}

/// Build a matcher from its name, as used on the command line.
pub fn matcher_by_name(name: &str) -> EvaluationResult<Box<dyn FieldMatcher>> {
    match name {
        "exact" => Ok(Box::new(ExactMatcher)),
        "case_insensitive" => Ok(Box::new(CaseInsensitiveMatcher)),
        "numeric" => Ok(Box::new(NumericMatcher::default())),
        "date" => Ok(Box::new(DateMatcher::default())),
        "currency" => Ok(Box::new(CurrencyMatcher::default())),
        other => Err(EvaluationError::UnknownMatcher(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOutcome {
    pub correct: bool,
    pub ground_truth: String,
    pub prediction: Option<String>,
}

/// Field-level comparison of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvaluation {
    pub field_results: BTreeMap<String, FieldOutcome>,
    pub exact_match: bool,
    pub accuracy: f64,
    pub field_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAccuracy {
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
}

/// Aggregate over a ground-truth directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEvaluation {
    pub per_document: BTreeMap<String, DocumentEvaluation>,
    pub field_accuracy: BTreeMap<String, FieldAccuracy>,
    /// Mean document accuracy; documents without a prediction count as 0
    pub overall_accuracy: f64,
    pub document_perfect_match_rate: f64,
    pub exact_match_count: usize,
    pub total_documents: usize,
    pub missing_predictions: Vec<String>,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    result: FieldSet,
}

fn load_fields(path: &Path) -> EvaluationResult<Vec<Field>> {
    let bytes = std::fs::read(path).map_err(|source| EvaluationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: Document = serde_json::from_slice(&bytes).map_err(|source| EvaluationError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(doc.result.fields)
}

/// Sorted `*.json` files directly under `dir`.
fn json_files(dir: &Path) -> EvaluationResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(EvaluationError::NotFound(dir.to_path_buf()));
    }
    let entries = std::fs::read_dir(dir).map_err(|source| EvaluationError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Compares predictions with ground truth field by field.
pub struct FieldEvaluator {
    matchers: HashMap<String, Box<dyn FieldMatcher>>,
    default_matcher: Box<dyn FieldMatcher>,
}

impl Default for FieldEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldEvaluator {
    pub fn new() -> Self {
        Self {
            matchers: HashMap::new(),
            default_matcher: Box::new(ExactMatcher),
        }
    }

    pub fn with_matcher(mut self, field_name: impl Into<String>, matcher: Box<dyn FieldMatcher>) -> Self {
        self.matchers.insert(field_name.into(), matcher);
        self
    }

    fn matcher(&self, field_name: &str) -> &dyn FieldMatcher {
        self.matchers
            .get(field_name)
            .map(|m| m.as_ref())
            .unwrap_or(self.default_matcher.as_ref())
    }

    pub fn evaluate_single(&self, ground_truth: &[Field], prediction: &[Field]) -> DocumentEvaluation {
        let expected: BTreeMap<&str, &str> = ground_truth
            .iter()
            .map(|f| (f.field_name.as_str(), f.value.as_str()))
            .collect();
        let predicted: HashMap<&str, &str> = prediction
            .iter()
            .map(|f| (f.field_name.as_str(), f.value.as_str()))
            .collect();

        let mut field_results = BTreeMap::new();
        let mut correct = 0;
        for (name, gt_value) in &expected {
            let pred_value = predicted.get(name).copied();
            let is_correct = pred_value.is_some_and(|p| self.matcher(name).matches(gt_value, p));
            correct += usize::from(is_correct);
            field_results.insert(
                name.to_string(),
                FieldOutcome {
                    correct: is_correct,
                    ground_truth: gt_value.to_string(),
                    prediction: pred_value.map(str::to_string),
                },
            );
        }

        let field_count = expected.len();
        if field_count == 0 {
            warn!("Ground truth contains no fields");
        }
        DocumentEvaluation {
            field_results,
            exact_match: field_count > 0 && correct == field_count,
            accuracy: if field_count > 0 {
                correct as f64 / field_count as f64
            } else {
                0.0
            },
            field_count,
        }
    }

    /// Evaluate every ground-truth file against the prediction of the same
    /// name. Unreadable pairs are logged and counted as zero-accuracy
    /// documents.
    pub fn evaluate_batch(&self, ground_truth_dir: &Path, prediction_dir: &Path) -> EvaluationResult<BatchEvaluation> {
        let mut batch = BatchEvaluation::default();
        let mut field_totals: BTreeMap<String, (usize, usize)> = BTreeMap::new();

        for gt_path in json_files(ground_truth_dir)? {
            let doc_id = file_stem(&gt_path);
            batch.total_documents += 1;

            let Some(file_name) = gt_path.file_name() else {
                continue;
            };
            let pred_path = prediction_dir.join(file_name);
            if !pred_path.exists() {
                warn!(document = %doc_id, "No prediction found");
                batch.missing_predictions.push(doc_id);
                continue;
            }

            let evaluation = match (load_fields(&gt_path), load_fields(&pred_path)) {
                (Ok(gt), Ok(pred)) => self.evaluate_single(&gt, &pred),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(document = %doc_id, error = %e, "Failed to evaluate document");
                    continue;
                }
            };

            for (name, outcome) in &evaluation.field_results {
                let entry = field_totals.entry(name.clone()).or_default();
                entry.0 += usize::from(outcome.correct);
                entry.1 += 1;
            }
            if evaluation.exact_match {
                batch.exact_match_count += 1;
            }
            batch.per_document.insert(doc_id, evaluation);
        }

        if batch.total_documents > 0 {
            let total = batch.total_documents as f64;
            batch.overall_accuracy =
                batch.per_document.values().map(|d| d.accuracy).sum::<f64>() / total;
            batch.document_perfect_match_rate = batch.exact_match_count as f64 / total;
        }
        batch.field_accuracy = field_totals
            .into_iter()
            .map(|(name, (correct, total))| {
                let accuracy = correct as f64 / total as f64;
                (name, FieldAccuracy { accuracy, correct, total })
            })
            .collect();
        Ok(batch)
    }
}

/// Accuracy spread over the samples of one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub mean_accuracy: f64,
    pub max_accuracy: f64,
    pub min_accuracy: f64,
    pub exact_match_rate: f64,
    pub total_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSamplingEvaluation {
    /// Index of the most accurate sample (first one on ties)
    pub best_sample: usize,
    pub best: DocumentEvaluation,
    pub stats: SampleStats,
}

/// Gain of best-of-N over the mean sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingEffectiveness {
    pub mean_improvement: f64,
    pub max_improvement: f64,
    pub min_improvement: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingBatchEvaluation {
    pub per_image: BTreeMap<String, ImageSamplingEvaluation>,
    pub images_without_samples: Vec<String>,
    /// Per-image stats averaged over images that have samples
    pub overall: SampleStats,
    pub sampling_effectiveness: Option<SamplingEffectiveness>,
}

/// Evaluates sampling groups laid out as `{dir}/sample_{i}/{stem}.json`.
pub struct SamplingEvaluator {
    fields: FieldEvaluator,
    num_samples: usize,
}

impl SamplingEvaluator {
    pub fn new(fields: FieldEvaluator, num_samples: usize) -> Self {
        Self { fields, num_samples }
    }

    pub fn evaluate_single(&self, ground_truth: &[Field], sampling_dir: &Path, stem: &str) -> Option<ImageSamplingEvaluation> {
        let mut scored: Vec<(usize, DocumentEvaluation)> = Vec::new();
        for sample in 0..self.num_samples {
            let path = sampling_dir.join(format!("sample_{sample}")).join(format!("{stem}.json"));
            if !path.exists() {
                continue;
            }
            match load_fields(&path) {
                Ok(pred) => scored.push((sample, self.fields.evaluate_single(ground_truth, &pred))),
                Err(e) => warn!(image = stem, sample, error = %e, "Failed to load sample"),
            }
        }

        let (first, rest) = scored.split_first()?;
        let mut best = first;
        for candidate in rest {
            if candidate.1.accuracy > best.1.accuracy {
                best = candidate;
            }
        }

        let n = scored.len() as f64;
        let accuracies = scored.iter().map(|(_, e)| e.accuracy);
        let stats = SampleStats {
            mean_accuracy: accuracies.clone().sum::<f64>() / n,
            max_accuracy: accuracies.clone().fold(f64::MIN, f64::max),
            min_accuracy: accuracies.fold(f64::MAX, f64::min),
            exact_match_rate: scored.iter().filter(|(_, e)| e.exact_match).count() as f64 / n,
            total_samples: scored.len(),
        };
        Some(ImageSamplingEvaluation {
            best_sample: best.0,
            best: best.1.clone(),
            stats,
        })
    }

    pub fn evaluate_batch(&self, ground_truth_dir: &Path, sampling_dir: &Path) -> EvaluationResult<SamplingBatchEvaluation> {
        let mut batch = SamplingBatchEvaluation::default();

        for gt_path in json_files(ground_truth_dir)? {
            let stem = file_stem(&gt_path);
            let ground_truth = match load_fields(&gt_path) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(image = %stem, error = %e, "Failed to load ground truth");
                    continue;
                }
            };
            match self.evaluate_single(&ground_truth, sampling_dir, &stem) {
                Some(evaluation) => {
                    batch.per_image.insert(stem, evaluation);
                }
                None => {
                    warn!(image = %stem, "No samples found");
                    batch.images_without_samples.push(stem);
                }
            }
        }

        if batch.per_image.is_empty() {
            return Ok(batch);
        }

        let n = batch.per_image.len() as f64;
        let all: Vec<&SampleStats> = batch.per_image.values().map(|e| &e.stats).collect();
        batch.overall = SampleStats {
            mean_accuracy: all.iter().map(|s| s.mean_accuracy).sum::<f64>() / n,
            max_accuracy: all.iter().map(|s| s.max_accuracy).sum::<f64>() / n,
            min_accuracy: all.iter().map(|s| s.min_accuracy).sum::<f64>() / n,
            exact_match_rate: all.iter().map(|s| s.exact_match_rate).sum::<f64>() / n,
            total_samples: all.iter().map(|s| s.total_samples).sum(),
        };

        let improvements: Vec<f64> = all.iter().map(|s| s.max_accuracy - s.mean_accuracy).collect();
        batch.sampling_effectiveness = Some(SamplingEffectiveness {
            mean_improvement: improvements.iter().sum::<f64>() / n,
            max_improvement: improvements.iter().copied().fold(f64::MIN, f64::max),
            min_improvement: improvements.iter().copied().fold(f64::MAX, f64::min),
        });
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn f(name: &str, value: &str) -> Field {
        Field::new(name, value, 1.0)
    }

    fn write_doc(path: &Path, fields: &[(&str, &str)]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let fields: Vec<_> = fields
            .iter()
            .map(|(n, v)| json!({"field_name": n, "value": v, "confidence": 1.0}))
            .collect();
        std::fs::write(path, json!({"result": {"fields": fields}}).to_string()).unwrap();
    }

    #[test]
    fn test_numeric_and_case_matchers() {
        let numeric = NumericMatcher { tolerance: 0.01 };
        assert!(numeric.matches("1,234.50", "1234.5"));
        assert!(!numeric.matches("10", "10.5"));
        assert!(numeric.matches("N/A", "N/A"));
        assert!(CaseInsensitiveMatcher.matches("ACME Corp", "acme corp"));
        assert!(!ExactMatcher.matches("ACME", "acme"));
    }

    #[test]
    fn test_date_matcher_across_formats() {
        let date = DateMatcher::default();
        assert!(date.matches("2023-03-28", "28/03/2023"));
        assert!(date.matches("2023/03/28", "2023-03-28"));
        assert!(!date.matches("2023-03-28", "2023-03-29"));
        assert!(!date.matches("2023-03-28", "March 28"));
    }

    #[test]
    fn test_currency_matcher() {
        assert_eq!(CurrencyMatcher::amount_and_currency("1,234.56 USD"), (1234.56, "USD".into()));
        assert_eq!(CurrencyMatcher::amount_and_currency("1.234,56 EUR"), (1234.56, "EUR".into()));
        assert_eq!(CurrencyMatcher::amount_and_currency("USD 1234.56"), (1234.56, "USD".into()));
        assert_eq!(CurrencyMatcher::amount_and_currency("1234,56"), (1234.56, String::new()));

        let m = CurrencyMatcher::default();
        assert!(m.matches("85,600.00 USD", "85600 USD"));
        assert!(m.matches("85,600.00 USD", "85600.00"));
        assert!(!m.matches("100 USD", "100 EUR"));
    }

    #[test]
    fn test_matcher_by_name() {
        assert!(matcher_by_name("currency").is_ok());
        assert!(matches!(
            matcher_by_name("fuzzy"),
            Err(EvaluationError::UnknownMatcher(_))
        ));
    }

    #[test]
    fn test_evaluate_single() {
        let evaluator = FieldEvaluator::new().with_matcher("date", Box::new(DateMatcher::default()));
        let gt = vec![f("date", "2024-01-02"), f("total", "5"), f("vendor", "ACME")];
        let pred = vec![f("date", "02/01/2024"), f("total", "6"), f("extra", "ignored")];

        let eval = evaluator.evaluate_single(&gt, &pred);
        assert_eq!(eval.field_count, 3);
        assert!(eval.field_results["date"].correct);
        assert!(!eval.field_results["total"].correct);
        assert_eq!(eval.field_results["vendor"].prediction, None);
        assert!((eval.accuracy - 1.0 / 3.0).abs() < 1e-9);
        assert!(!eval.exact_match);
    }

    #[test]
    fn test_evaluate_batch_counts_missing_predictions() {
        let gt = tempfile::tempdir().unwrap();
        let pred = tempfile::tempdir().unwrap();
        write_doc(&gt.path().join("a.json"), &[("x", "1"), ("y", "2")]);
        write_doc(&gt.path().join("b.json"), &[("x", "1")]);
        write_doc(&pred.path().join("a.json"), &[("x", "1"), ("y", "2")]);

        let batch = FieldEvaluator::new()
            .evaluate_batch(gt.path(), pred.path())
            .unwrap();
        assert_eq!(batch.total_documents, 2);
        assert_eq!(batch.exact_match_count, 1);
        assert_eq!(batch.overall_accuracy, 0.5);
        assert_eq!(batch.document_perfect_match_rate, 0.5);
        assert_eq!(batch.missing_predictions, vec!["b"]);
        assert_eq!(batch.field_accuracy["x"].total, 1);
    }

    #[test]
    fn test_sampling_evaluator_picks_best_sample() {
        let gt = tempfile::tempdir().unwrap();
        let sampling = tempfile::tempdir().unwrap();
        write_doc(&gt.path().join("img.json"), &[("x", "1"), ("y", "2")]);
        write_doc(&gt.path().join("lonely.json"), &[("x", "1")]);
        write_doc(&sampling.path().join("sample_0/img.json"), &[("x", "1"), ("y", "0")]);
        write_doc(&sampling.path().join("sample_2/img.json"), &[("x", "1"), ("y", "2")]);

        let evaluator = SamplingEvaluator::new(FieldEvaluator::new(), 4);
        let batch = evaluator.evaluate_batch(gt.path(), sampling.path()).unwrap();

        let img = &batch.per_image["img"];
        assert_eq!(img.best_sample, 2);
        assert_eq!(img.stats.total_samples, 2);
        assert_eq!(img.stats.mean_accuracy, 0.75);
        assert_eq!(img.stats.min_accuracy, 0.5);
        assert_eq!(img.stats.exact_match_rate, 0.5);
        assert_eq!(batch.images_without_samples, vec!["lonely"]);
        let eff = batch.sampling_effectiveness.unwrap();
        assert_eq!(eff.mean_improvement, 0.25);
    }
}
