//! Disambiguation scoring.
//!
//! When an observation batch matches claims held by one or more existing
//! principals, the scorer estimates how likely the batch describes each of
//! them. Affinity is a weighted mean of three signals in [0, 1]:
//!
//! - overlap: how many of the batch's identifiers the candidate already holds
//! - name: similarity of the batch's display name to the candidate's
//! - recency: how recently the candidate's matching claims were seen
//!
//! Every signal is reported separately in a [`ScoreBreakdown`] so decisions
//! can be audited.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;

/// Bounded similarity between two display names.
pub trait NameSimilarity: Send + Sync {
    /// Returns a similarity in [0, 1]; 1 means identical.
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Jaro-Winkler similarity over case-folded, whitespace-collapsed names.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaroWinklerSimilarity;

fn fold_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

impl NameSimilarity for JaroWinklerSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = fold_name(a);
        let b = fold_name(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        strsim::jaro_winkler(&a, &b).clamp(0.0, 1.0)
    }
}

/// Per-signal scores for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Identifier overlap signal.
    pub overlap: f64,
    /// Display-name similarity signal.
    pub name: f64,
    /// Recency signal.
    pub recency: f64,
    /// Weighted mean of the three.
    pub affinity: f64,
}

impl ScoreBreakdown {
    /// JSON form stored in audit snapshots.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "overlap": self.overlap,
            "name": self.name,
            "recency": self.recency,
            "affinity": self.affinity,
        })
    }
}

/// What the scorer needs to know about one candidate.
#[derive(Debug, Clone, Copy)]
pub struct CandidateEvidence<'a> {
    /// Distinct normalized keys in the batch.
    pub batch_keys: usize,
    /// How many of those keys the candidate holds.
    pub matched_keys: usize,
    /// Display name carried by the batch.
    pub batch_name: Option<&'a str>,
    /// Display name of the candidate principal.
    pub candidate_name: Option<&'a str>,
    /// Latest `last_seen` among the candidate's matching claims.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Scores candidates against an observation batch.
#[derive(Clone)]
pub struct Scorer {
    config: ScoringConfig,
    names: Arc<dyn NameSimilarity>,
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scorer {
    /// Creates a scorer using Jaro-Winkler name similarity.
    #[must_use]
    pub fn new(config: ScoringConfig) -> Self {
        Self::with_name_similarity(config, Arc::new(JaroWinklerSimilarity))
    }

    /// Creates a scorer with a custom name similarity.
    #[must_use]
    pub fn with_name_similarity(config: ScoringConfig, names: Arc<dyn NameSimilarity>) -> Self {
        Self { config, names }
    }

    /// Scoring configuration.
    #[must_use]
    pub const fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// `(|M| - 1) / (|K| - 1)`; a single shared identifier is no evidence.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn overlap(batch_keys: usize, matched_keys: usize) -> f64 {
        if batch_keys <= 1 || matched_keys == 0 {
            return 0.0;
        }
        let matched = matched_keys.min(batch_keys);
        (matched - 1) as f64 / (batch_keys - 1) as f64
    }

    /// Name signal; 0 when either name is absent.
    #[must_use]
    pub fn name(&self, batch_name: Option<&str>, candidate_name: Option<&str>) -> f64 {
        match (batch_name, candidate_name) {
            (Some(a), Some(b)) => {
                let s = self.names.similarity(a, b);
                if s.is_finite() {
                    s.clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// `exp(-dt / tau)`; 0 when the candidate has no matching claims.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recency(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        let Some(last_seen) = last_seen else {
            return 0.0;
        };
        let elapsed = (now - last_seen).num_milliseconds().max(0) as f64 / 1000.0;
        (-elapsed / self.config.recency_tau_secs).exp().clamp(0.0, 1.0)
    }

    /// Full breakdown for one candidate as of `now`.
    #[must_use]
    pub fn score(&self, evidence: &CandidateEvidence<'_>, now: DateTime<Utc>) -> ScoreBreakdown {
        let overlap = Self::overlap(evidence.batch_keys, evidence.matched_keys);
        let name = self.name(evidence.batch_name, evidence.candidate_name);
        let recency = self.recency(evidence.last_seen, now);

        let c = &self.config;
        let total = c.total_weight();
        let affinity = if total > 0.0 {
            ((c.overlap_weight * overlap + c.name_weight * name + c.recency_weight * recency)
                / total)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };
        ScoreBreakdown {
            overlap,
            name,
            recency,
            affinity,
        }
    }

    /// Returns true if `affinity` clears the acceptance threshold.
    #[must_use]
    pub fn accepts(&self, affinity: f64) -> bool {
        affinity > self.config.threshold
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct Fixed(f64);

    impl NameSimilarity for Fixed {
        fn similarity(&self, _a: &str, _b: &str) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_overlap_signal() {
        assert_eq!(Scorer::overlap(1, 1), 0.0);
        assert_eq!(Scorer::overlap(2, 1), 0.0);
        assert_eq!(Scorer::overlap(3, 2), 0.5);
        assert_eq!(Scorer::overlap(3, 3), 1.0);
        assert_eq!(Scorer::overlap(4, 0), 0.0);
    }

    #[test]
    fn test_name_signal() {
        let scorer = Scorer::default();
        assert_eq!(scorer.name(Some("Alice Smith"), None), 0.0);
        assert_eq!(scorer.name(None, None), 0.0);
        assert!((scorer.name(Some("alice  SMITH"), Some("Alice Smith")) - 1.0).abs() < 1e-9);
        let close = scorer.name(Some("Jon Smith"), Some("John Smith"));
        let far = scorer.name(Some("Jon Smith"), Some("Zed Quorra"));
        assert!(close > far);
        assert!((0.0..=1.0).contains(&far));
    }

    #[test]
    fn test_name_signal_clamps_collaborator() {
        let scorer = Scorer::with_name_similarity(ScoringConfig::default(), Arc::new(Fixed(7.0)));
        assert_eq!(scorer.name(Some("a"), Some("b")), 1.0);
        let scorer =
            Scorer::with_name_similarity(ScoringConfig::default(), Arc::new(Fixed(f64::NAN)));
        assert_eq!(scorer.name(Some("a"), Some("b")), 0.0);
    }

    #[test]
    fn test_recency_signal_decays() {
        let scorer = Scorer::default();
        let now = Utc::now();
        assert_eq!(scorer.recency(None, now), 0.0);
        assert!((scorer.recency(Some(now), now) - 1.0).abs() < 1e-9);
        let month = scorer.recency(Some(now - Duration::days(30)), now);
        assert!((month - (-1.0f64).exp()).abs() < 1e-6);
        assert!((scorer.recency(Some(now + Duration::days(1)), now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_affinity_is_weighted_mean() {
        let scorer = Scorer::with_name_similarity(ScoringConfig::default(), Arc::new(Fixed(1.0)));
        let now = Utc::now();
        let breakdown = scorer.score(
            &CandidateEvidence {
                batch_keys: 3,
                matched_keys: 2,
                batch_name: Some("Alice"),
                candidate_name: Some("Alice"),
                last_seen: Some(now),
            },
            now,
        );
        assert_eq!(breakdown.overlap, 0.5);
        assert!((breakdown.affinity - 0.75).abs() < 1e-9);
        assert!(scorer.accepts(breakdown.affinity));
    }

    #[test]
    fn test_shared_mailbox_alone_stays_below_threshold() {
        let scorer = Scorer::default();
        let now = Utc::now();
        let breakdown = scorer.score(
            &CandidateEvidence {
                batch_keys: 2,
                matched_keys: 1,
                batch_name: None,
                candidate_name: None,
                last_seen: Some(now),
            },
            now,
        );
        assert!((breakdown.affinity - 0.2).abs() < 1e-9);
        assert!(!scorer.accepts(breakdown.affinity));
        assert!(!scorer.accepts(0.6));
        assert_eq!(breakdown.to_json()["recency"], 1.0);
    }
}
