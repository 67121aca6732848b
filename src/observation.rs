//! Observation batches: the unit of work handed to the resolution engine.
//!
//! A batch groups every identifier that co-occurred in one source record
//! (all addresses on one inbound message, all fields of one contact card).
//! Batches are transient; only the claims they produce are stored.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::claim::{IdentityKind, Platform};
use crate::confidence::Confidence;
use crate::error::ValidationError;

/// One raw identifier as extracted by a source reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Where the identifier was seen.
    pub platform: Platform,
    /// Identifier kind.
    pub kind: IdentityKind,
    /// Value exactly as extracted.
    pub raw_value: String,
}

/// An identifier the caller already knows belongs with this batch, with an
/// explicit confidence and evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextClaim {
    /// Where the identifier comes from.
    pub platform: Platform,
    /// Identifier kind.
    pub kind: IdentityKind,
    /// Value as known to the caller.
    pub raw_value: String,
    /// Caller-assigned confidence.
    pub confidence: Confidence,
    /// Evidence metadata stored on the resulting claim.
    #[serde(default)]
    pub evidence: serde_json::Value,
}

/// Blake3 fingerprint of a batch's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchFingerprint([u8; 32]);

impl BatchFingerprint {
    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BatchFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Identifiers that co-occurred in one source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    /// Observed identifiers, in extraction order.
    pub observations: Vec<Observation>,
    /// Display name text found alongside the identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Already-known identifiers supplied by the caller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextClaim>,
    /// Opaque reference to the source record (message id, card id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

impl ObservationBatch {
    /// Conservative bound on identifiers per batch.
    pub const MAX_ITEMS: usize = 512;

    /// Maximum raw value length.
    pub const MAX_VALUE_LEN: usize = 500;

    /// Maximum display name length.
    pub const MAX_DISPLAY_NAME_LEN: usize = 200;

    /// Starts a builder.
    #[must_use]
    pub fn builder() -> ObservationBatchBuilder {
        ObservationBatchBuilder::default()
    }

    /// Number of identifiers (observations plus context claims).
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len() + self.context.len()
    }

    /// Returns true if the batch carries no identifiers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks size limits and emptiness.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` describing the first violated limit.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if self.len() > Self::MAX_ITEMS {
            return Err(ValidationError::FieldTooLong {
                field: "observations".to_string(),
                max_length: Self::MAX_ITEMS,
            });
        }
        let values = self
            .observations
            .iter()
            .map(|o| &o.raw_value)
            .chain(self.context.iter().map(|c| &c.raw_value));
        for value in values {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "raw_value".to_string(),
                });
            }
            if value.len() > Self::MAX_VALUE_LEN {
                return Err(ValidationError::FieldTooLong {
                    field: "raw_value".to_string(),
                    max_length: Self::MAX_VALUE_LEN,
                });
            }
        }
        if self
            .display_name
            .as_ref()
            .is_some_and(|n| n.len() > Self::MAX_DISPLAY_NAME_LEN)
        {
            return Err(ValidationError::FieldTooLong {
                field: "display_name".to_string(),
                max_length: Self::MAX_DISPLAY_NAME_LEN,
            });
        }
        Ok(())
    }

    /// Content fingerprint, independent of observation order.
    #[must_use]
    pub fn fingerprint(&self) -> BatchFingerprint {
        let mut items: Vec<String> = self
            .observations
            .iter()
            .map(|o| format!("o\u{1f}{}\u{1f}{}\u{1f}{}", o.platform, o.kind, o.raw_value))
            .chain(
                self.context
                    .iter()
                    .map(|c| format!("c\u{1f}{}\u{1f}{}\u{1f}{}", c.platform, c.kind, c.raw_value)),
            )
            .collect();
        items.sort();

        let mut hasher = blake3::Hasher::new();
        for item in &items {
            hasher.update(item.as_bytes());
            hasher.update(b"\x1e");
        }
        if let Some(name) = &self.display_name {
            hasher.update(b"n");
            hasher.update(name.as_bytes());
        }
        if let Some(source) = &self.source_ref {
            hasher.update(b"s");
            hasher.update(source.as_bytes());
        }
        BatchFingerprint(*hasher.finalize().as_bytes())
    }
}

/// Fluent builder for [`ObservationBatch`].
///
/// # Example
/// ```
/// use principal_graph::{IdentityKind, ObservationBatch};
///
/// let batch = ObservationBatch::builder()
///     .observe("email", IdentityKind::Email, "Alice <alice@example.com>")
///     .observe("email", IdentityKind::DisplayName, "Alice")
///     .display_name("Alice")
///     .build()
///     .unwrap();
/// assert_eq!(batch.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ObservationBatchBuilder {
    observations: Vec<(String, IdentityKind, String)>,
    context: Vec<(String, IdentityKind, String, f32, serde_json::Value)>,
    display_name: Option<String>,
    source_ref: Option<String>,
}

impl ObservationBatchBuilder {
    /// Adds an observed identifier.
    #[must_use]
    pub fn observe(
        mut self,
        platform: impl Into<String>,
        kind: IdentityKind,
        raw_value: impl Into<String>,
    ) -> Self {
        self.observations
            .push((platform.into(), kind, raw_value.into()));
        self
    }

    /// Adds an already-known context identifier.
    #[must_use]
    pub fn context(
        mut self,
        platform: impl Into<String>,
        kind: IdentityKind,
        raw_value: impl Into<String>,
        confidence: f32,
    ) -> Self {
        self.context.push((
            platform.into(),
            kind,
            raw_value.into(),
            confidence,
            serde_json::Value::Null,
        ));
        self
    }

    /// Adds a context identifier with evidence metadata.
    #[must_use]
    pub fn context_with_evidence(
        mut self,
        platform: impl Into<String>,
        kind: IdentityKind,
        raw_value: impl Into<String>,
        confidence: f32,
        evidence: serde_json::Value,
    ) -> Self {
        self.context
            .push((platform.into(), kind, raw_value.into(), confidence, evidence));
        self
    }

    /// Sets the display name seen alongside the identifiers.
    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the source record reference.
    #[must_use]
    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    /// Builds and validates the batch.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for bad platforms, confidences or limits.
    pub fn build(self) -> Result<ObservationBatch, ValidationError> {
        let observations = self
            .observations
            .into_iter()
            .map(|(platform, kind, raw_value)| {
                Ok(Observation {
                    platform: Platform::new(platform)?,
                    kind,
                    raw_value,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        let context = self
            .context
            .into_iter()
            .map(|(platform, kind, raw_value, confidence, evidence)| {
                Ok(ContextClaim {
                    platform: Platform::new(platform)?,
                    kind,
                    raw_value,
                    confidence: Confidence::new(confidence)?,
                    evidence,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        let batch = ObservationBatch {
            observations,
            display_name: self
                .display_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            context,
            source_ref: self.source_ref,
        };
        batch.validate()?;
        Ok(batch)
    }
}
