//! Abstract storage traits for the principal graph.
//!
//! The engine only assumes transactional semantics from its store:
//! - reads inside a transaction see the transaction's own buffered writes
//! - commit applies every buffered write or none of them
//! - commit fails with [`StorageError::UniqueViolation`] when a claim would
//!   duplicate `(principal, platform, normalized)`
//! - commit fails with [`StorageError::WriteConflict`] when something the
//!   transaction read was changed by another writer in the meantime
//!
//! The last two are "contention" and are retried by the resolution engine.

use thiserror::Error;

use crate::association::{Association, AssociationId};
use crate::audit::ResolutionEvent;
use crate::claim::{ClaimId, ClaimKey, IdentityClaim, IdentityKind, UniqueKey};
use crate::principal::{Principal, PrincipalId};
use crate::review::{ReviewItem, ReviewItemId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Principal not found.
    #[error("Principal not found: {0}")]
    PrincipalNotFound(PrincipalId),

    /// Claim not found.
    #[error("Claim not found: {0}")]
    ClaimNotFound(ClaimId),

    /// Association not found.
    #[error("Association not found: {0}")]
    AssociationNotFound(AssociationId),

    /// Review item not found.
    #[error("Review item not found: {0}")]
    ReviewItemNotFound(ReviewItemId),

    /// A claim would duplicate `(principal, platform, normalized)`.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(UniqueKey),

    /// Data read by the transaction was changed by a concurrent commit.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

impl StorageError {
    /// Returns true for failures caused by a concurrent writer.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::UniqueViolation(_) | Self::WriteConflict(_))
    }
}

/// A durable principal graph: principals, claims, associations, the audit
/// log and the manual-review queue.
///
/// All mutation goes through [`StoreTransaction`]. The audit log and review
/// queue can also be scanned outside a transaction.
pub trait IdentityStore: Send + Sync {
    /// Opens a transaction.
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StorageError>;

    /// Returns the full audit log in append order.
    fn events(&self) -> Result<Vec<ResolutionEvent>, StorageError>;

    /// Returns the sequence number of the most recently enqueued review
    /// item (0 when the queue has never been written).
    fn review_high_water(&self) -> Result<u64, StorageError>;

    /// Returns up to `limit` pending review items with `seq > after`, in
    /// sequence order.
    fn pending_review_after(&self, after: u64, limit: usize)
        -> Result<Vec<ReviewItem>, StorageError>;

    /// Enqueues `item` outside any transaction unless a pending item with the
    /// same subject (see [`crate::review::ReviewPayload::same_subject`]) exists, returning
    /// the id of whichever item is queued.
    ///
    /// The check and the append are atomic and take no part in optimistic
    /// conflict detection, so this never fails with contention.
    fn enqueue_review_once(&self, item: ReviewItem) -> Result<ReviewItemId, StorageError>;
}

/// One optimistic unit of work against an [`IdentityStore`].
///
/// Dropping a transaction without committing discards its writes.
pub trait StoreTransaction {
    /// Reads a principal.
    fn principal(&mut self, id: PrincipalId) -> Result<Option<Principal>, StorageError>;

    /// Reads a claim.
    fn claim(&mut self, id: ClaimId) -> Result<Option<IdentityClaim>, StorageError>;

    /// Reads every claim with the given lookup key, across all principals.
    fn claims_by_key(&mut self, key: &ClaimKey) -> Result<Vec<IdentityClaim>, StorageError>;

    /// Reads every claim of `kind` with the given normalized value, on any
    /// platform.
    fn claims_by_value(
        &mut self,
        kind: IdentityKind,
        normalized: &str,
    ) -> Result<Vec<IdentityClaim>, StorageError>;

    /// Reads every principal, merged ones included, whose display name
    /// contains `fragment` ignoring case.
    fn principals_named(&mut self, fragment: &str) -> Result<Vec<Principal>, StorageError>;

    /// Reads the claims owned by a principal.
    fn claims_for_principal(
        &mut self,
        id: PrincipalId,
    ) -> Result<Vec<IdentityClaim>, StorageError>;

    /// Reads the associations pointing at a principal.
    fn associations_for_principal(
        &mut self,
        id: PrincipalId,
    ) -> Result<Vec<Association>, StorageError>;

    /// Returns true if a block event exists for the unordered pair.
    fn is_blocked(&mut self, a: PrincipalId, b: PrincipalId) -> Result<bool, StorageError>;

    /// Reads a review item.
    fn review_item(&mut self, id: ReviewItemId) -> Result<Option<ReviewItem>, StorageError>;

    /// Reads every pending review item, in queue order.
    fn pending_reviews(&mut self) -> Result<Vec<ReviewItem>, StorageError>;

    /// Inserts or replaces a principal.
    fn put_principal(&mut self, principal: Principal) -> Result<(), StorageError>;

    /// Inserts or replaces a claim.
    fn put_claim(&mut self, claim: IdentityClaim) -> Result<(), StorageError>;

    /// Deletes a claim. Only merge-time consolidation of exact duplicates does this.
    fn delete_claim(&mut self, id: ClaimId) -> Result<(), StorageError>;

    /// Inserts or replaces an association.
    fn put_association(&mut self, association: Association) -> Result<(), StorageError>;

    /// Deletes an association.
    fn delete_association(&mut self, id: AssociationId) -> Result<(), StorageError>;

    /// Appends an audit event.
    fn append_event(&mut self, event: ResolutionEvent) -> Result<(), StorageError>;

    /// Enqueues a review item; the store assigns its sequence number on commit.
    fn enqueue_review(&mut self, item: ReviewItem) -> Result<ReviewItemId, StorageError>;

    /// Marks a review item resolved.
    fn resolve_review(&mut self, id: ReviewItemId, note: String) -> Result<(), StorageError>;

    /// Applies every buffered write atomically.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discards every buffered write.
    fn rollback(self: Box<Self>);
}
