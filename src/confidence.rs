//! Claim confidence.
//!
//! Confidence expresses how strongly an identity claim is believed to belong
//! to its principal. It is always within [0.0, 1.0]; repeat observations push
//! it toward 1.0 and never past it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A validated confidence value in [0.0, 1.0].
///
/// # Examples
///
/// ```
/// use principal_graph::Confidence;
///
/// let conf = Confidence::new(0.5).unwrap();
/// let boosted = conf.reinforce(0.1);
/// assert!((boosted.value() - 0.55).abs() < 1e-6);
/// assert!(Confidence::new(1.5).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Confidence(f32);

impl Confidence {
    /// Minimum valid confidence value.
    pub const MIN_VALUE: f32 = 0.0;

    /// Maximum valid confidence value.
    pub const MAX_VALUE: f32 = 1.0;

    /// Creates a new confidence with validation.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ConfidenceOutOfRange` if the value is NaN or
    /// not in [0.0, 1.0].
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        Self::validate_value(value)?;
        Ok(Self(value))
    }

    /// Confidence of zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0.0)
    }

    /// Full confidence.
    #[must_use]
    pub const fn one() -> Self {
        Self(1.0)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> f32 {
        self.0
    }

    /// Moves the value toward 1.0: `new = old + (1 - old) * boost`.
    ///
    /// `boost` is clamped to [0.0, 1.0], so the result never leaves the valid range.
    #[must_use]
    pub fn reinforce(self, boost: f32) -> Self {
        let boost = if boost.is_nan() { 0.0 } else { boost.clamp(0.0, 1.0) };
        let next = self.0 + (1.0 - self.0) * boost;
        Self(next.clamp(Self::MIN_VALUE, Self::MAX_VALUE))
    }

    /// Returns the larger of two confidences.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }

    fn validate_value(value: f32) -> Result<(), ValidationError> {
        if value.is_nan() {
            return Err(ValidationError::ConfidenceOutOfRange { value });
        }
        if !(Self::MIN_VALUE..=Self::MAX_VALUE).contains(&value) {
            return Err(ValidationError::ConfidenceOutOfRange { value });
        }
        Ok(())
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::zero()
    }
}

impl TryFrom<f32> for Confidence {
    type Error = ValidationError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f32 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bounds() {
        assert!(Confidence::new(0.0).is_ok());
        assert!(Confidence::new(1.0).is_ok());
        assert!(Confidence::new(-0.01).is_err());
        assert!(Confidence::new(1.01).is_err());
        assert!(Confidence::new(f32::NAN).is_err());
    }

    #[test]
    fn test_reinforce_moves_toward_one() {
        let c = Confidence::new(0.9).unwrap().reinforce(0.1);
        assert!((c.value() - 0.91).abs() < 1e-6);

        let mut c = Confidence::zero();
        for _ in 0..200 {
            c = c.reinforce(0.5);
        }
        assert!(c.value() <= 1.0);
        assert!(c.value() > 0.999);
    }

    #[test]
    fn test_reinforce_clamps_boost() {
        let c = Confidence::new(0.4).unwrap();
        assert_eq!(c.reinforce(-3.0), c);
        assert_eq!(c.reinforce(7.0), Confidence::one());
        assert_eq!(c.reinforce(f32::NAN), c);
    }

    #[test]
    fn test_serde_rejects_out_of_range() {
        let ok: Confidence = serde_json::from_str("0.25").unwrap();
        assert_eq!(ok.value(), 0.25);
        assert!(serde_json::from_str::<Confidence>("2.0").is_err());
    }
}
