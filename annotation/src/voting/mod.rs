//! Field-level ensemble voting
//!
//! A voter reduces `voter id -> AnnotationResult` to one [`VotedResult`].
//! Inputs arrive in a `BTreeMap`, so voters are always visited in sorted id
//! order. Candidate values are kept in first-seen order and a later value
//! replaces the leader only with a strictly higher score, which makes every
//! tie resolve to the value met first.
//!
//! | Strategy | Voter | Score per vote |
//! |----------|-------|----------------|
//! | `simple_vote` | [`MajorityVoter`] | 1 |
//! | `weighted_vote` | [`WeightedVoter`] | `weight(voter) * confidence` |
//! | `highest_confidence` | none | rejected with [`VotingError::NotImplemented`] |

pub mod majority;
pub mod weighted;

use std::collections::{BTreeMap, HashMap};

use crate::config::EnsembleStrategy;
use crate::types::{AnnotationResult, Field, VotedResult, VoterId};

pub use majority::MajorityVoter;
pub use weighted::WeightedVoter;

/// Error type for voting operations
#[derive(Debug, thiserror::Error)]
pub enum VotingError {
    #[error("No annotations available for voting")]
    NoAnnotations,

    #[error("Voting strategy '{0}' is not implemented")]
    NotImplemented(EnsembleStrategy),
}

/// Result type for voting operations
pub type VotingResult<T> = Result<T, VotingError>;

/// Voter id to weight. Unmapped voters weigh 1.0.
pub type VotingWeights = HashMap<VoterId, f64>;

/// A pure reduction from per-voter results to a consensus record.
pub trait Voter: Send + Sync {
    fn strategy(&self) -> EnsembleStrategy;

    /// Consensus fields, in first-seen field order.
    fn vote_fields(&self, results: &BTreeMap<VoterId, AnnotationResult>) -> Vec<Field>;

    /// Consensus record listing every voter that contributed.
    fn vote(&self, results: &BTreeMap<VoterId, AnnotationResult>) -> VotingResult<VotedResult> {
        if results.is_empty() {
            return Err(VotingError::NoAnnotations);
        }
        let fields = self.vote_fields(results);
        Ok(VotedResult::new(fields, results.keys().cloned().collect()))
    }
}

/// Resolve a configured strategy. Unsupported strategies fail here, before
/// any annotation work starts.
pub fn create_voter(strategy: EnsembleStrategy, weights: VotingWeights) -> VotingResult<Box<dyn Voter>> {
    match strategy {
        EnsembleStrategy::SimpleVote => Ok(Box::new(MajorityVoter)),
        EnsembleStrategy::WeightedVote => Ok(Box::new(WeightedVoter::new(weights))),
        EnsembleStrategy::HighestConfidence => Err(VotingError::NotImplemented(strategy)),
    }
}

/// Accumulated scores for one field name.
#[derive(Debug, Clone)]
pub(crate) struct FieldTally {
    pub field_name: String,
    /// Distinct values with their scores, in first-seen order
    pub candidates: Vec<(String, f64)>,
    pub total: f64,
}

impl FieldTally {
    fn add(&mut self, value: &str, score: f64) {
        match self.candidates.iter_mut().find(|(v, _)| v == value) {
            Some((_, s)) => *s += score,
            None => self.candidates.push((value.to_string(), score)),
        }
        self.total += score;
    }

    /// Highest score; ties keep the earlier candidate.
    pub fn winner(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (value, score) in &self.candidates {
            match best {
                Some((_, top)) if *score <= top => {}
                _ => best = Some((value.as_str(), *score)),
            }
        }
        best
    }
}

/// Tally every field across all voters with a caller-supplied score.
pub(crate) fn tally<F>(results: &BTreeMap<VoterId, AnnotationResult>, score: F) -> Vec<FieldTally>
where
    F: Fn(&VoterId, &Field) -> f64,
{
    let mut tallies: Vec<FieldTally> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (voter, result) in results {
        for field in result.fields() {
            let slot = *index.entry(field.field_name.clone()).or_insert_with(|| {
                tallies.push(FieldTally {
                    field_name: field.field_name.clone(),
                    candidates: Vec::new(),
                    total: 0.0,
                });
                tallies.len() - 1
            });
            tallies[slot].add(&field.value, score(voter, field));
        }
    }
    tallies
}

#[cfg(test)]
pub(crate) fn results_of(votes: &[(&str, &[(&str, &str, f64)])]) -> BTreeMap<VoterId, AnnotationResult> {
    votes
        .iter()
        .map(|(voter, fields)| {
            let fields = fields
                .iter()
                .map(|(name, value, conf)| Field::new(*name, *value, *conf))
                .collect();
            (voter.to_string(), AnnotationResult::new(fields))
        })
        .collect()
}
