//! Downstream associations between principals and stored content.
//!
//! Messages, media and documents reference principals, never the other way
//! round. Each association remembers which claims justified it so that a
//! split can tell which links follow the moved claims.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::claim::ClaimId;
use crate::confidence::Confidence;
use crate::principal::PrincipalId;

/// Unique identifier for an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssociationId(Uuid);

impl AssociationId {
    /// Creates a new random association ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AssociationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a principal is linked to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssociationTarget {
    /// A message, with the principal's role (`sender`, `recipient`, ...).
    Message {
        /// Message identifier.
        id: String,
        /// Role of the principal on the message.
        role: String,
    },
    /// A media asset (photo, recording).
    Media {
        /// Media identifier.
        id: String,
    },
    /// A document, with the principal's role (`author`, `mentioned`, ...).
    Document {
        /// Document identifier.
        id: String,
        /// Role of the principal in the document.
        role: String,
    },
}

impl fmt::Display for AssociationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message { id, role } => write!(f, "message({id}, {role})"),
            Self::Media { id } => write!(f, "media({id})"),
            Self::Document { id, role } => write!(f, "document({id}, {role})"),
        }
    }
}

/// A link from stored content to a principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    /// Unique identifier.
    pub id: AssociationId,
    /// Linked principal.
    pub principal_id: PrincipalId,
    /// Linked content.
    pub target: AssociationTarget,
    /// Confidence of the link.
    pub confidence: Confidence,
    /// Claims that justified the link.
    #[serde(default)]
    pub evidence: BTreeSet<ClaimId>,
}

impl Association {
    /// Creates an association.
    #[must_use]
    pub fn new(
        principal_id: PrincipalId,
        target: AssociationTarget,
        confidence: Confidence,
        evidence: impl IntoIterator<Item = ClaimId>,
    ) -> Self {
        Self {
            id: AssociationId::new(),
            principal_id,
            target,
            confidence,
            evidence: evidence.into_iter().collect(),
        }
    }

    /// Returns true if every evidence claim is in `moved` (and there is evidence at all).
    #[must_use]
    pub fn evidence_within(&self, moved: &BTreeSet<ClaimId>) -> bool {
        !self.evidence.is_empty() && self.evidence.is_subset(moved)
    }

    /// Returns true if some, but not all, evidence claims are in `moved`.
    #[must_use]
    pub fn evidence_straddles(&self, moved: &BTreeSet<ClaimId>) -> bool {
        !self.evidence.is_disjoint(moved) && !self.evidence.is_subset(moved)
    }

    /// Absorbs a duplicate link to the same target.
    pub fn absorb(&mut self, other: &Self) {
        self.confidence = self.confidence.max(other.confidence);
        self.evidence.extend(other.evidence.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> AssociationTarget {
        AssociationTarget::Message {
            id: "m-1".to_string(),
            role: "sender".to_string(),
        }
    }

    #[test]
    fn test_evidence_classification() {
        let a = ClaimId::new();
        let b = ClaimId::new();
        let assoc = Association::new(PrincipalId::new(), message(), Confidence::one(), [a, b]);

        let only_a: BTreeSet<ClaimId> = [a].into_iter().collect();
        let both: BTreeSet<ClaimId> = [a, b].into_iter().collect();
        let neither: BTreeSet<ClaimId> = [ClaimId::new()].into_iter().collect();

        assert!(!assoc.evidence_within(&only_a));
        assert!(assoc.evidence_straddles(&only_a));
        assert!(assoc.evidence_within(&both));
        assert!(!assoc.evidence_straddles(&both));
        assert!(!assoc.evidence_within(&neither));
        assert!(!assoc.evidence_straddles(&neither));
    }

    #[test]
    fn test_without_evidence_never_follows_split() {
        let assoc = Association::new(PrincipalId::new(), message(), Confidence::one(), []);
        let moved: BTreeSet<ClaimId> = [ClaimId::new()].into_iter().collect();
        assert!(!assoc.evidence_within(&moved));
        assert!(!assoc.evidence_straddles(&moved));
    }

    #[test]
    fn test_absorb_keeps_max_confidence_and_unions_evidence() {
        let a = ClaimId::new();
        let b = ClaimId::new();
        let p = PrincipalId::new();
        let mut keep = Association::new(p, message(), Confidence::new(0.4).unwrap(), [a]);
        let other = Association::new(p, message(), Confidence::new(0.8).unwrap(), [b]);
        keep.absorb(&other);
        assert_eq!(keep.confidence.value(), 0.8);
        assert_eq!(keep.evidence.len(), 2);
    }

    #[test]
    fn test_target_serde_tagging() {
        let json = serde_json::to_value(message()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["role"], "sender");
    }
}
