//! Confidence-weighted vote per field

use std::collections::BTreeMap;

use super::{tally, Voter, VotingWeights};
use crate::config::EnsembleStrategy;
use crate::types::{AnnotationResult, Field, VoterId};

const DEFAULT_WEIGHT: f64 = 1.0;

/// Accumulates `weight(voter) * confidence` per value and reports the
/// winner's share of the field's total score.
#[derive(Debug, Clone, Default)]
pub struct WeightedVoter {
    weights: VotingWeights,
}

impl WeightedVoter {
    pub fn new(weights: VotingWeights) -> Self {
        Self { weights }
    }

    pub fn weight(&self, voter: &str) -> f64 {
        self.weights.get(voter).copied().unwrap_or(DEFAULT_WEIGHT)
    }
}

impl Voter for WeightedVoter {
    fn strategy(&self) -> EnsembleStrategy {
        EnsembleStrategy::WeightedVote
    }

    fn vote_fields(&self, results: &BTreeMap<VoterId, AnnotationResult>) -> Vec<Field> {
        tally(results, |voter, field| self.weight(voter) * field.confidence)
            .iter()
            .filter_map(|t| {
                let (value, score) = t.winner()?;
                let confidence = if t.total > 0.0 { score / t.total } else { 0.0 };
                Some(Field::new(t.field_name.clone(), value, confidence))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voting::results_of;

    #[test]
    fn test_weight_outvotes_count() {
        let results = results_of(&[("v1/m", &[("f", "X", 0.6)]), ("v2/m", &[("f", "Y", 0.9)])]);
        let voter = WeightedVoter::new(VotingWeights::from([
            ("v1/m".to_string(), 1.0),
            ("v2/m".to_string(), 2.0),
        ]));

        let fields = voter.vote_fields(&results);
        assert_eq!(fields[0].value, "Y");
        assert!((fields[0].confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_unmapped_voters_weigh_one() {
        let voter = WeightedVoter::default();
        assert_eq!(voter.weight("anything/else"), 1.0);

        let results = results_of(&[
            ("a/m", &[("f", "P", 0.5)]),
            ("b/m", &[("f", "Q", 0.4)]),
            ("c/m", &[("f", "Q", 0.4)]),
        ]);
        let fields = voter.vote_fields(&results);
        assert_eq!(fields[0].value, "Q");
        assert!((fields[0].confidence - 0.8 / 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_reports_zero_confidence() {
        let results = results_of(&[("a/m", &[("f", "P", 0.0)]), ("b/m", &[("f", "Q", 0.0)])]);
        let fields = WeightedVoter::default().vote_fields(&results);
        assert_eq!(fields[0], Field::new("f", "P", 0.0));
    }

    #[test]
    fn test_sample_voters_use_their_own_weights() {
        let results = results_of(&[
            ("gpt/4o/sample_0", &[("f", "A", 1.0)]),
            ("gpt/4o/sample_1", &[("f", "A", 1.0)]),
            ("gpt/4o/sample_2", &[("f", "A", 1.0)]),
            ("claude/opus", &[("f", "B", 1.0)]),
        ]);
        let voter = WeightedVoter::new(VotingWeights::from([
            ("gpt/4o/sample_0".to_string(), 0.5),
            ("gpt/4o/sample_1".to_string(), 0.5),
            ("gpt/4o/sample_2".to_string(), 0.5),
            ("claude/opus".to_string(), 2.0),
        ]));
        let fields = voter.vote_fields(&results);
        assert_eq!(fields[0].value, "B");
    }

    #[test]
    fn test_tie_resolves_to_first_sorted_voter() {
        let results = results_of(&[("m/2", &[("f", "late", 0.5)]), ("m/1", &[("f", "early", 0.5)])]);
        let fields = WeightedVoter::default().vote_fields(&results);
        assert_eq!(fields[0].value, "early");
    }
}
