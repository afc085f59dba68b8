//! Unweighted majority per field

use std::collections::BTreeMap;

use super::{tally, Voter};
use crate::config::EnsembleStrategy;
use crate::types::{AnnotationResult, Field, VoterId};

/// Picks the most frequent value per field. Confidence is the winning share
/// of the votes cast for that field.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityVoter;

impl Voter for MajorityVoter {
    fn strategy(&self) -> EnsembleStrategy {
        EnsembleStrategy::SimpleVote
    }

    fn vote_fields(&self, results: &BTreeMap<VoterId, AnnotationResult>) -> Vec<Field> {
        tally(results, |_, _| 1.0)
            .iter()
            .filter_map(|t| {
                let (value, count) = t.winner()?;
                Some(Field::new(t.field_name.clone(), value, count / t.total))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voting::results_of;

    #[test]
    fn test_majority_wins() {
        let results = results_of(&[
            ("v1/m", &[("f", "A", 0.1)]),
            ("v2/m", &[("f", "B", 0.99)]),
            ("v3/m", &[("f", "A", 0.2)]),
        ]);
        let fields = MajorityVoter.vote_fields(&results);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, "A");
        assert!((fields[0].confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_tie_resolves_to_first_sorted_voter() {
        // Insertion order differs from sorted order on purpose
        let results = results_of(&[("zeta/m", &[("f", "Y", 1.0)]), ("alpha/m", &[("f", "X", 1.0)])]);
        for _ in 0..10 {
            let fields = MajorityVoter.vote_fields(&results);
            assert_eq!(fields[0].value, "X");
            assert_eq!(fields[0].confidence, 0.5);
        }
    }

    #[test]
    fn test_absent_fields_are_skipped() {
        let results = results_of(&[
            ("a/m", &[("name", "Ann", 1.0), ("city", "Oslo", 1.0)]),
            ("b/m", &[("name", "Ann", 1.0)]),
        ]);
        let fields = MajorityVoter.vote_fields(&results);
        assert_eq!(fields[1], Field::new("city", "Oslo", 1.0));
    }

    #[test]
    fn test_inputs_are_untouched() {
        let results = results_of(&[("a/m", &[("f", "1", 0.3)]), ("b/m", &[("f", "2", 0.3)])]);
        let before = results.clone();
        MajorityVoter.vote(&results).unwrap();
        assert_eq!(results, before);
    }
}
