//! Resolution audit log records.
//!
//! Every attach, merge, split and block decision leaves exactly one immutable
//! `ResolutionEvent` behind, together with the scores (or counts) that drove
//! it. Events are append-only: stores never update or delete them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::principal::PrincipalId;

/// Stable identifier for a resolution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(uuid::Uuid);

impl EventId {
    /// Creates a new random event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who made a decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Actor {
    /// The resolution engine acting on its own.
    System,
    /// A named human or tool operator.
    Operator(String),
}

impl Actor {
    /// Maximum operator name length.
    pub const MAX_NAME_LEN: usize = 128;

    /// Creates an operator actor.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the name is empty or too long.
    pub fn operator(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "actor".to_string(),
            });
        }
        if name.len() > Self::MAX_NAME_LEN {
            return Err(ValidationError::FieldTooLong {
                field: "actor".to_string(),
                max_length: Self::MAX_NAME_LEN,
            });
        }
        Ok(Self::Operator(name))
    }

    /// Returns true for the engine itself.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl TryFrom<String> for Actor {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "system" {
            return Ok(Self::System);
        }
        match value.strip_prefix("operator:") {
            Some(name) => Self::operator(name),
            None => Self::operator(value),
        }
    }
}

impl From<Actor> for String {
    fn from(value: Actor) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Operator(name) => write!(f, "operator:{name}"),
        }
    }
}

/// Kind of graph decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Evidence attached to an existing principal under ambiguity, or a
    /// manual attach of an unnormalized claim.
    Attach,
    /// One principal absorbed into another.
    Merge,
    /// Claims moved out of a principal.
    Split,
    /// Two principals declared distinct.
    Block,
    /// Verified correction of a principal's name or one of its claims.
    Update,
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attach => write!(f, "attach"),
            Self::Merge => write!(f, "merge"),
            Self::Split => write!(f, "split"),
            Self::Block => write!(f, "block"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Immutable audit record of one resolution decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEvent {
    /// Event identifier.
    pub id: EventId,

    /// When the decision was recorded.
    pub happened_at: DateTime<Utc>,

    /// Who decided.
    pub actor: Actor,

    /// What was decided.
    pub action: ResolutionAction,

    /// Principals the decision took evidence from.
    pub from_principals: Vec<PrincipalId>,

    /// Principal the decision moved evidence to.
    pub to_principal: PrincipalId,

    /// Free-text reason.
    pub reason: String,

    /// Scores or counts behind the decision (JSON object).
    #[serde(default)]
    pub score_snapshot: serde_json::Value,
}

impl ResolutionEvent {
    /// Maximum reason length.
    pub const MAX_REASON_LEN: usize = 2048;

    /// Creates an event stamped now.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the reason is too long.
    pub fn new(
        actor: Actor,
        action: ResolutionAction,
        from_principals: Vec<PrincipalId>,
        to_principal: PrincipalId,
        reason: impl Into<String>,
        score_snapshot: serde_json::Value,
    ) -> Result<Self, ValidationError> {
        let reason = reason.into();
        if reason.len() > Self::MAX_REASON_LEN {
            return Err(ValidationError::FieldTooLong {
                field: "reason".to_string(),
                max_length: Self::MAX_REASON_LEN,
            });
        }
        Ok(Self {
            id: EventId::new(),
            happened_at: Utc::now(),
            actor,
            action,
            from_principals,
            to_principal,
            reason,
            score_snapshot,
        })
    }

    /// Returns true if the event mentions `principal` on either side.
    #[must_use]
    pub fn involves(&self, principal: PrincipalId) -> bool {
        self.to_principal == principal || self.from_principals.contains(&principal)
    }

    /// For block events, the unordered principal pair.
    #[must_use]
    pub fn blocked_pair(&self) -> Option<(PrincipalId, PrincipalId)> {
        if self.action != ResolutionAction::Block {
            return None;
        }
        self.from_principals
            .first()
            .map(|a| ordered_pair(*a, self.to_principal))
    }
}

/// Orders two ids so a pair has one canonical representation.
#[must_use]
pub fn ordered_pair(a: PrincipalId, b: PrincipalId) -> (PrincipalId, PrincipalId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
