//! Principals: canonical person records.
//!
//! A principal is the stable anchor every identity claim and every downstream
//! association points at. Principals are never deleted; a merged principal
//! keeps its record and redirects to a successor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, stable principal identifier.
///
/// # Examples
///
/// ```
/// use principal_graph::PrincipalId;
///
/// let id = PrincipalId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    /// Creates a new random principal ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a principal ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for PrincipalId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Lifecycle state of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PrincipalState {
    /// Created by the resolution engine from observed evidence.
    Provisional,
    /// Created or vouched for by a caller with verified data.
    Confirmed,
    /// Absorbed into another principal; no longer authoritative.
    Merged {
        /// The principal this one redirects to.
        successor: PrincipalId,
    },
}

impl PrincipalState {
    /// Returns the successor if this principal has been merged.
    #[must_use]
    pub const fn successor(&self) -> Option<PrincipalId> {
        match self {
            Self::Merged { successor } => Some(*successor),
            _ => None,
        }
    }
}

impl fmt::Display for PrincipalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional => write!(f, "provisional"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Merged { successor } => write!(f, "merged({successor})"),
        }
    }
}

/// A canonical person.
///
/// # Examples
///
/// ```
/// use principal_graph::{Principal, PrincipalState};
///
/// let principal = Principal::provisional(Some("Ada Lovelace".to_string()));
/// assert_eq!(principal.state, PrincipalState::Provisional);
/// assert_eq!(principal.version, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Globally unique identifier.
    pub id: PrincipalId,

    /// Human readable name, if one has been observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Organization the person belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    /// Principals absorbed into this one via merge, oldest first.
    #[serde(default)]
    pub ancestors: Vec<PrincipalId>,

    /// Lifecycle state.
    pub state: PrincipalState,

    /// When the principal was created.
    pub created_at: DateTime<Utc>,

    /// When the principal was last modified.
    pub updated_at: DateTime<Utc>,

    /// Version number (incremented on every modification).
    pub version: u64,

    /// Arbitrary metadata key-values.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Principal {
    fn with_state(display_name: Option<String>, state: PrincipalState) -> Self {
        let now = Utc::now();
        Self {
            id: PrincipalId::new(),
            display_name: display_name.filter(|n| !n.trim().is_empty()),
            organization: None,
            ancestors: Vec::new(),
            state,
            created_at: now,
            updated_at: now,
            version: 1,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Creates a provisional principal, as the resolution engine does.
    #[must_use]
    pub fn provisional(display_name: Option<String>) -> Self {
        Self::with_state(display_name, PrincipalState::Provisional)
    }

    /// Creates a confirmed principal from verified data.
    #[must_use]
    pub fn confirmed(display_name: Option<String>) -> Self {
        Self::with_state(display_name, PrincipalState::Confirmed)
    }

    /// Returns true unless the principal has been merged away.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !matches!(self.state, PrincipalState::Merged { .. })
    }

    /// Sets the display name if none is known yet. Returns true on change.
    pub fn adopt_display_name(&mut self, name: Option<&str>) -> bool {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return false;
        };
        if self.display_name.is_some() {
            return false;
        }
        self.display_name = Some(name.to_string());
        self.touch();
        true
    }

    /// This principal's id followed by every principal merged into it.
    pub fn lineage(&self) -> impl Iterator<Item = PrincipalId> + '_ {
        std::iter::once(self.id).chain(self.ancestors.iter().copied())
    }

    /// Appends `absorbed` and its ancestors, preserving order and skipping duplicates.
    pub fn absorb_ancestors(&mut self, absorbed: PrincipalId, inherited: &[PrincipalId]) {
        for id in std::iter::once(&absorbed).chain(inherited) {
            if *id != self.id && !self.ancestors.contains(id) {
                self.ancestors.push(*id);
            }
        }
        self.touch();
    }

    /// Marks this principal as merged into `successor`.
    pub fn redirect_to(&mut self, successor: PrincipalId) {
        self.state = PrincipalState::Merged { successor };
        self.touch();
    }

    /// Promotes a provisional principal to confirmed. Returns true on change.
    pub fn confirm(&mut self) -> bool {
        if self.state == PrincipalState::Provisional {
            self.state = PrincipalState::Confirmed;
            self.touch();
            return true;
        }
        false
    }

    /// Updates the `updated_at` timestamp and increments the version.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

impl PartialEq for Principal {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Principal {}

impl std::hash::Hash for Principal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_id_creation() {
        let id1 = PrincipalId::new();
        let id2 = PrincipalId::new();
        assert_ne!(id1, id2);
        assert!(!id1.is_nil());
    }

    #[test]
    fn test_principal_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = PrincipalId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), &uuid);
    }

    #[test]
    fn test_blank_display_name_is_dropped() {
        let p = Principal::provisional(Some("   ".to_string()));
        assert!(p.display_name.is_none());
    }

    #[test]
    fn test_adopt_display_name_only_when_missing() {
        let mut p = Principal::provisional(None);
        assert!(p.adopt_display_name(Some(" Grace Hopper ")));
        assert_eq!(p.display_name.as_deref(), Some("Grace Hopper"));
        assert_eq!(p.version, 2);

        assert!(!p.adopt_display_name(Some("Someone Else")));
        assert_eq!(p.display_name.as_deref(), Some("Grace Hopper"));
        assert_eq!(p.version, 2);
    }

    #[test]
    fn test_absorb_ancestors_dedupes_and_preserves_order() {
        let mut dest = Principal::confirmed(None);
        let a = PrincipalId::new();
        let b = PrincipalId::new();
        let c = PrincipalId::new();
        dest.ancestors.push(b);

        dest.absorb_ancestors(a, &[b, c, dest.id]);
        assert_eq!(dest.ancestors, vec![b, a, c]);
    }

    #[test]
    fn test_lineage_starts_with_own_id() {
        let mut dest = Principal::confirmed(None);
        let (a, b) = (PrincipalId::new(), PrincipalId::new());
        dest.absorb_ancestors(a, &[b]);
        assert_eq!(dest.lineage().collect::<Vec<_>>(), vec![dest.id, a, b]);
    }

    #[test]
    fn test_redirect_and_confirm() {
        let mut p = Principal::provisional(None);
        assert!(p.confirm());
        assert!(!p.confirm());
        assert_eq!(p.state, PrincipalState::Confirmed);

        let successor = PrincipalId::new();
        p.redirect_to(successor);
        assert!(!p.is_live());
        assert_eq!(p.state.successor(), Some(successor));
        assert!(!p.confirm());
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let successor = PrincipalId::new();
        let state = PrincipalState::Merged { successor };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("merged"));
        let back: PrincipalState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
