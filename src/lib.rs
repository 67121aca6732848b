//! # principal-graph - Identity Resolution for a People-Centric Store
//!
//! Every message, photo and document that enters the store carries loose
//! identifiers: an email address in a header, a phone number on an SMS, a
//! handle on a chat message. This crate maps those identifiers onto stable
//! canonical *principals* (people) so that everything a person sent or
//! appeared in can be found from one id.
//!
//! ## Core Concepts
//!
//! - **Principal**: a canonical person, provisional until confirmed, and
//!   redirecting to a successor once merged
//! - **IdentityClaim**: one observed identifier, normalized per platform
//! - **ObservationBatch**: identifiers that co-occurred in one source record
//! - **Resolution**: candidate lookup, disambiguation scoring and attachment
//! - **Graph edits**: merge, split and block, each recorded in an audit log
//! - **Manual review**: anything the engine will not decide on its own
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use principal_graph::{IdentityEngine, IdentityKind, InMemoryIdentityStore, ObservationBatch};
//!
//! let engine = IdentityEngine::new(Arc::new(InMemoryIdentityStore::new()));
//!
//! let batch = ObservationBatch::builder()
//!     .observe("email", IdentityKind::Email, "Alice <alice@example.com>")
//!     .observe("sms", IdentityKind::Phone, "+1 (555) 010-2000")
//!     .display_name("Alice")
//!     .build()?;
//!
//! let first = engine.resolve_or_create(&batch)?;
//! let again = engine.resolve_or_create(&batch)?;
//! assert_eq!(first.principal_id(), again.principal_id());
//!
//! let hits = engine.lookup_claim("email", IdentityKind::Email, "alice@example.com")?;
//! assert_eq!(hits.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod association;
pub mod audit;
pub mod claim;
pub mod confidence;
pub mod error;
pub mod observation;
pub mod principal;
pub mod review;

// Resolution
pub mod config;
pub mod engine;
pub mod normalize;
pub mod scoring;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use association::{Association, AssociationId, AssociationTarget};
pub use audit::{Actor, EventId, ResolutionAction, ResolutionEvent};
pub use claim::{ClaimId, ClaimKey, IdentityClaim, IdentityKind, Platform};
pub use confidence::Confidence;
pub use config::{ResolverConfig, ScoringConfig};
pub use engine::{
    Attribution, ClaimMatch, ClaimOutcome, ClaimUpdate, Decision, IdentityEngine, NewClaim,
    NewPrincipal, PrincipalSelector, ResolveOutcome, Selection, SplitTarget,
};
pub use error::{ExecutionError, IdentityError, IdentityResult, ValidationError};
pub use normalize::{BasicNormalizer, Normalizer};
pub use observation::{BatchFingerprint, ContextClaim, Observation, ObservationBatch};
pub use principal::{Principal, PrincipalId, PrincipalState};
pub use review::{ReviewDrain, ReviewItem, ReviewItemId, ReviewPayload, ReviewStatus};
pub use scoring::{JaroWinklerSimilarity, NameSimilarity, ScoreBreakdown, Scorer};
pub use storage::{InMemoryIdentityStore, IdentityStore, StorageError, StoreTransaction};
