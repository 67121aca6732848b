//! Resolver configuration.
//!
//! Every tunable of the resolution engine lives in one named-field struct so
//! deployments can adjust weights and thresholds without code changes. Only
//! parsing from a JSON document is provided; where that document comes from
//! is the caller's business.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::claim::Platform;
use crate::confidence::Confidence;
use crate::error::ValidationError;

fn invalid(reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        reason: reason.into(),
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(invalid(format!("{name} must be within [0.0, 1.0], got {value}")));
    }
    Ok(())
}

/// Weights and threshold of the disambiguation scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weight of the identifier-overlap signal.
    pub overlap_weight: f64,
    /// Weight of the display-name similarity signal.
    pub name_weight: f64,
    /// Weight of the recency signal.
    pub recency_weight: f64,
    /// Decay constant of the recency signal, in seconds.
    pub recency_tau_secs: f64,
    /// A candidate must score strictly above this to be attached to.
    pub threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            overlap_weight: 0.5,
            name_weight: 0.3,
            recency_weight: 0.2,
            recency_tau_secs: 30.0 * 24.0 * 3600.0,
            threshold: 0.6,
        }
    }
}

impl ScoringConfig {
    /// Sum of the three signal weights.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.overlap_weight + self.name_weight + self.recency_weight
    }

    /// Validates weights, decay and threshold.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for negative or non-finite
    /// weights, an all-zero weight vector, a non-positive decay, or a
    /// threshold outside [0, 1].
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, w) in [
            ("overlap_weight", self.overlap_weight),
            ("name_weight", self.name_weight),
            ("recency_weight", self.recency_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(invalid(format!("{name} must be a non-negative number")));
            }
        }
        if self.total_weight() <= 0.0 {
            return Err(invalid("at least one scoring weight must be positive"));
        }
        if !self.recency_tau_secs.is_finite() || self.recency_tau_secs <= 0.0 {
            return Err(invalid("recency_tau_secs must be positive"));
        }
        check_unit("threshold", self.threshold)
    }
}

/// Configuration of the resolution engine.
///
/// # Examples
///
/// ```
/// use principal_graph::ResolverConfig;
///
/// let config = ResolverConfig::from_json_str(r#"{"max_retries": 5, "scoring": {"threshold": 0.7}}"#).unwrap();
/// assert_eq!(config.max_retries, 5);
/// assert_eq!(config.scoring.threshold, 0.7);
/// assert_eq!(config.scoring.overlap_weight, 0.5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Scorer weights and threshold.
    pub scoring: ScoringConfig,
    /// Confidence boost applied on repeat observation.
    pub confidence_boost: f32,
    /// Confidence of newly observed claims on platforms without an override.
    pub default_confidence: f32,
    /// Per-platform confidence of newly observed claims.
    pub platform_confidence: BTreeMap<String, f32>,
    /// Retries after a contended commit before deferring to review.
    pub max_retries: usize,
    /// Bound on successor-chain walks.
    pub max_successor_hops: usize,
    /// How long merge and split wait for principal locks.
    pub lock_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let platform_confidence = [("contacts", 0.95), ("manual", 1.0), ("photos", 0.7)]
            .into_iter()
            .map(|(p, c)| (p.to_string(), c))
            .collect();
        Self {
            scoring: ScoringConfig::default(),
            confidence_boost: 0.1,
            default_confidence: 0.9,
            platform_confidence,
            max_retries: 3,
            max_successor_hops: 64,
            lock_timeout_ms: 5_000,
        }
    }
}

impl ResolverConfig {
    /// Parses and validates a JSON document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if the document is malformed
    /// or describes an invalid configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.scoring.validate()?;
        check_unit("confidence_boost", f64::from(self.confidence_boost))?;
        check_unit("default_confidence", f64::from(self.default_confidence))?;
        for (platform, confidence) in &self.platform_confidence {
            Platform::new(platform)?;
            check_unit(
                &format!("platform_confidence[{platform}]"),
                f64::from(*confidence),
            )?;
        }
        if self.max_successor_hops == 0 {
            return Err(invalid("max_successor_hops must be at least 1"));
        }
        Ok(())
    }

    /// Confidence assigned to a new claim observed on `platform`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ConfidenceOutOfRange` if the configured value
    /// is invalid (only possible when `validate` was skipped).
    pub fn confidence_for(&self, platform: &Platform) -> Result<Confidence, ValidationError> {
        let value = self
            .platform_confidence
            .get(platform.as_str())
            .copied()
            .unwrap_or(self.default_confidence);
        Confidence::new(value)
    }

    /// Principal lock timeout.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
