//! Identity claims: observed identifiers bound to principals.
//!
//! A claim records one platform-specific identifier (an email address, a
//! phone number, a contact id) together with where it was seen, how it
//! normalizes, and how confident we are that it belongs to its principal.
//!
//! The store enforces exactly one hard constraint on claims: no two claims
//! share `(principal, platform, normalized)`. The same `(platform, normalized)`
//! pair may legitimately appear under several principals (team mailboxes,
//! recycled phone numbers).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confidence::Confidence;
use crate::error::ValidationError;
use crate::principal::PrincipalId;

/// Unique identifier for a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(Uuid);

impl ClaimId {
    /// Creates a new random claim ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of identifier. The set is closed: new kinds are a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IdentityKind {
    /// An email address.
    Email,
    /// A phone number.
    Phone,
    /// A display name as shown by the source.
    DisplayName,
    /// A platform username or handle.
    Username,
    /// An address-book contact identifier.
    ContactId,
    /// A nickname or alternate spelling.
    Alias,
    /// A `memory://` permalink to a notes page about the person.
    MemoryUrl,
    /// A photo library person identifier.
    PersonUuid,
}

impl IdentityKind {
    /// All known kinds.
    pub const ALL: [Self; 8] = [
        Self::Email,
        Self::Phone,
        Self::DisplayName,
        Self::Username,
        Self::ContactId,
        Self::Alias,
        Self::MemoryUrl,
        Self::PersonUuid,
    ];

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::DisplayName => "display_name",
            Self::Username => "username",
            Self::ContactId => "contact_id",
            Self::Alias => "alias",
            Self::MemoryUrl => "memory_url",
            Self::PersonUuid => "person_uuid",
        }
    }
}

impl TryFrom<String> for IdentityKind {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for IdentityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(key))
            .ok_or_else(|| ValidationError::UnknownIdentityKind {
                kind: s.to_string(),
            })
    }
}

impl From<IdentityKind> for String {
    fn from(value: IdentityKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin system of an observation (`contacts`, `imessage`, `email`, ...).
///
/// Platforms are an open set; the label is trimmed and lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform(String);

impl Platform {
    /// Maximum label length.
    pub const MAX_LEN: usize = 64;

    /// Creates a platform label.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidPlatform` for empty, overlong, or
    /// whitespace-containing labels.
    pub fn new(label: impl AsRef<str>) -> Result<Self, ValidationError> {
        let raw = label.as_ref();
        let label = raw.trim().to_lowercase();
        let reason = if label.is_empty() {
            Some("platform cannot be empty")
        } else if label.len() > Self::MAX_LEN {
            Some("platform label is too long")
        } else if label.chars().any(char::is_whitespace) {
            Some("platform cannot contain whitespace")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ValidationError::InvalidPlatform {
                platform: raw.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(Self(label))
    }

    /// Returns the label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Platform {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Candidate lookup key: `(platform, kind, normalized)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClaimKey {
    /// Origin platform.
    pub platform: Platform,
    /// Identifier kind.
    pub kind: IdentityKind,
    /// Normalized value; never empty.
    pub normalized: String,
}

impl ClaimKey {
    /// Creates a key.
    #[must_use]
    pub fn new(platform: Platform, kind: IdentityKind, normalized: impl Into<String>) -> Self {
        Self {
            platform,
            kind,
            normalized: normalized.into(),
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.platform, self.kind, self.normalized)
    }
}

/// The hard uniqueness key: `(principal, platform, normalized)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueKey {
    /// Owning principal.
    pub principal_id: PrincipalId,
    /// Origin platform.
    pub platform: Platform,
    /// Normalized value.
    pub normalized: String,
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.principal_id, self.platform, self.normalized)
    }
}

/// One observed identifier tied to (at most) one principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaim {
    /// Unique identifier.
    pub id: ClaimId,

    /// Owning principal. `None` only for unnormalized claims awaiting manual attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<PrincipalId>,

    /// Where the identifier was observed.
    pub platform: Platform,

    /// Identifier kind.
    pub kind: IdentityKind,

    /// Value exactly as observed.
    pub raw_value: String,

    /// Canonical value; `None` when normalization failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<String>,

    /// Belief that the claim belongs to its principal.
    pub confidence: Confidence,

    /// First observation.
    pub first_seen: DateTime<Utc>,

    /// Most recent observation.
    pub last_seen: DateTime<Utc>,

    /// Free-form evidence metadata (JSON object).
    #[serde(default)]
    pub evidence: serde_json::Value,
}

impl IdentityClaim {
    /// Creates a claim observed now.
    #[must_use]
    pub fn new(
        principal_id: Option<PrincipalId>,
        platform: Platform,
        kind: IdentityKind,
        raw_value: impl Into<String>,
        normalized: Option<String>,
        confidence: Confidence,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ClaimId::new(),
            principal_id,
            platform,
            kind,
            raw_value: raw_value.into(),
            normalized: normalized.filter(|n| !n.is_empty()),
            confidence,
            first_seen: now,
            last_seen: now,
            evidence: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Lookup key, if the claim is normalized.
    #[must_use]
    pub fn key(&self) -> Option<ClaimKey> {
        self.normalized
            .as_ref()
            .map(|n| ClaimKey::new(self.platform.clone(), self.kind, n.clone()))
    }

    /// Uniqueness key, if the claim is attached and normalized.
    #[must_use]
    pub fn unique_key(&self) -> Option<UniqueKey> {
        match (self.principal_id, self.normalized.as_ref()) {
            (Some(principal_id), Some(normalized)) => Some(UniqueKey {
                principal_id,
                platform: self.platform.clone(),
                normalized: normalized.clone(),
            }),
            _ => None,
        }
    }

    /// Records a repeat observation.
    pub fn refresh(&mut self, seen_at: DateTime<Utc>, boost: f32) {
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
        self.confidence = self.confidence.reinforce(boost);
    }

    /// Copies evidence keys from `other` that this claim does not have yet.
    ///
    /// Returns `false` when either side is a non-null, non-object value that
    /// cannot be combined.
    pub fn fold_evidence(&mut self, other: &serde_json::Value) -> bool {
        match fold_metadata(&self.evidence, other) {
            Some(folded) => {
                self.evidence = folded;
                true
            }
            None => false,
        }
    }
}

/// Combines two metadata values, keeping `primary` keys on collision.
///
/// `Null` on either side yields the other side. Two objects are unioned. Any
/// other combination cannot be reconciled and yields `None`.
#[must_use]
pub fn fold_metadata(
    primary: &serde_json::Value,
    secondary: &serde_json::Value,
) -> Option<serde_json::Value> {
    use serde_json::Value;

    match (primary, secondary) {
        (Value::Null, other) => Some(other.clone()),
        (a, Value::Null) => Some(a.clone()),
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Some(Value::Object(out))
        }
        (a, b) if a == b => Some(a.clone()),
        _ => None,
    }
}
