//! Manual-review queue.
//!
//! The queue is a durable list of work the engine refused to decide on its
//! own: batches that lost every retry, claims that failed normalization,
//! associations left ambiguous by a split, and proposed merges. It is a data
//! structure, not a workflow tool; items stay pending until someone marks
//! them resolved.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::association::AssociationId;
use crate::audit::EventId;
use crate::claim::ClaimId;
use crate::observation::{BatchFingerprint, ObservationBatch};
use crate::principal::PrincipalId;
use crate::storage::{IdentityStore, StorageError};

/// Unique identifier for a review item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewItemId(uuid::Uuid);

impl ReviewItemId {
    /// Creates a new random review item ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ReviewItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReviewItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why something needs a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewPayload {
    /// A batch the engine could not attribute.
    UnattributedBatch {
        /// The full batch, so nothing observed is lost.
        batch: ObservationBatch,
        /// Content fingerprint used to avoid queueing the same batch twice.
        fingerprint: BatchFingerprint,
        /// Why the batch was deferred.
        reason: String,
    },
    /// A stored claim whose value could not be normalized.
    UnnormalizedClaim {
        /// The unattached claim.
        claim_id: ClaimId,
    },
    /// Associations a split could not move or keep with certainty.
    AssociationReview {
        /// Associations with evidence on both sides of the split.
        association_ids: Vec<AssociationId>,
        /// The split event that flagged them.
        event_id: EventId,
    },
    /// A merge the engine suggests but will not perform on its own.
    MergeProposal {
        /// First principal.
        a: PrincipalId,
        /// Second principal.
        b: PrincipalId,
        /// Why the merge is suggested.
        reason: String,
        /// Scorer output between the two principals.
        scores: serde_json::Value,
    },
}

impl ReviewPayload {
    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UnattributedBatch { .. } => "unattributed_batch",
            Self::UnnormalizedClaim { .. } => "unnormalized_claim",
            Self::AssociationReview { .. } => "association_review",
            Self::MergeProposal { .. } => "merge_proposal",
        }
    }

    /// Returns true if both payloads ask for the same decision: the same
    /// batch content, claim, split event, or unordered principal pair.
    #[must_use]
    pub fn same_subject(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::UnattributedBatch { fingerprint: a, .. },
                Self::UnattributedBatch { fingerprint: b, .. },
            ) => a == b,
            (
                Self::UnnormalizedClaim { claim_id: a },
                Self::UnnormalizedClaim { claim_id: b },
            ) => a == b,
            (
                Self::AssociationReview { event_id: a, .. },
                Self::AssociationReview { event_id: b, .. },
            ) => a == b,
            (
                Self::MergeProposal { a, b, .. },
                Self::MergeProposal { a: c, b: d, .. },
            ) => crate::audit::ordered_pair(*a, *b) == crate::audit::ordered_pair(*c, *d),
            _ => false,
        }
    }
}

/// Status of a review item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for a decision.
    Pending,
    /// Handled.
    Resolved {
        /// When it was handled.
        resolved_at: DateTime<Utc>,
        /// Free-text note.
        note: String,
    },
}

/// One entry of the manual-review queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Identifier.
    pub id: ReviewItemId,
    /// Position in the queue; assigned by the store on commit.
    pub seq: u64,
    /// When the item was queued.
    pub enqueued_at: DateTime<Utc>,
    /// What needs review.
    pub payload: ReviewPayload,
    /// Current status.
    pub status: ReviewStatus,
}

impl ReviewItem {
    /// Creates a pending item. The store assigns `seq`.
    #[must_use]
    pub fn pending(payload: ReviewPayload) -> Self {
        Self {
            id: ReviewItemId::new(),
            seq: 0,
            enqueued_at: Utc::now(),
            payload,
            status: ReviewStatus::Pending,
        }
    }

    /// Returns true while the item awaits a decision.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ReviewStatus::Pending
    }
}

/// Finite, restartable iterator over pending review items in queue order.
///
/// The drain stops at the queue's high-water mark taken when it was created,
/// so items queued while draining are left for the next drain. Items are not
/// removed by reading them; call `IdentityEngine::resolve_review_item` once
/// handled. [`ReviewDrain::cursor`] can be fed back into
/// `IdentityEngine::drain_manual_review_queue_after` to resume.
pub struct ReviewDrain<'a> {
    store: &'a dyn IdentityStore,
    cursor: u64,
    high_water: u64,
    page_size: usize,
    buffer: VecDeque<ReviewItem>,
    exhausted: bool,
}

impl<'a> ReviewDrain<'a> {
    /// Items fetched from the store per page.
    pub const DEFAULT_PAGE_SIZE: usize = 64;

    /// Starts draining after `cursor` (0 = from the beginning).
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the high-water mark cannot be read.
    pub fn new(store: &'a dyn IdentityStore, cursor: u64) -> Result<Self, StorageError> {
        let high_water = store.review_high_water()?;
        Ok(Self {
            store,
            cursor,
            high_water,
            page_size: Self::DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: cursor >= high_water,
        })
    }

    /// Sequence number of the last item yielded.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Queue position this drain stops at.
    #[must_use]
    pub const fn high_water(&self) -> u64 {
        self.high_water
    }

    fn refill(&mut self) -> Result<(), StorageError> {
        let page = self.store.pending_review_after(self.cursor, self.page_size)?;
        let full_page = page.len() == self.page_size;
        self.buffer
            .extend(page.into_iter().filter(|item| item.seq <= self.high_water));
        if self.buffer.is_empty() || !full_page {
            self.exhausted = self.buffer.is_empty();
        }
        Ok(())
    }
}

impl Iterator for ReviewDrain<'_> {
    type Item = Result<ReviewItem, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let item = self.buffer.pop_front()?;
        self.cursor = item.seq;
        if self.cursor >= self.high_water {
            self.exhausted = true;
        }
        Some(Ok(item))
    }
}

impl fmt::Debug for ReviewDrain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewDrain")
            .field("cursor", &self.cursor)
            .field("high_water", &self.high_water)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryIdentityStore, StoreTransaction};

    fn enqueue(store: &InMemoryIdentityStore, n: usize) -> Vec<ReviewItemId> {
        let mut tx = store.begin().unwrap();
        let ids = (0..n)
            .map(|_| {
                tx.enqueue_review(ReviewItem::pending(ReviewPayload::UnnormalizedClaim {
                    claim_id: ClaimId::new(),
                }))
                .unwrap()
            })
            .collect();
        tx.commit().unwrap();
        ids
    }

    #[test]
    fn test_drain_yields_pending_in_order_and_is_finite() {
        let store = InMemoryIdentityStore::new();
        let ids = enqueue(&store, 150);

        let drained: Vec<ReviewItem> = ReviewDrain::new(&store, 0)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(drained.len(), 150);
        assert_eq!(drained.iter().map(|i| i.id).collect::<Vec<_>>(), ids);
        assert!(drained.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_drain_is_restartable_and_skips_resolved() {
        let store = InMemoryIdentityStore::new();
        let ids = enqueue(&store, 3);

        let mut tx = store.begin().unwrap();
        tx.resolve_review(ids[0], "handled".to_string()).unwrap();
        tx.commit().unwrap();

        let first: Vec<ReviewItemId> = ReviewDrain::new(&store, 0)
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(first, vec![ids[1], ids[2]]);

        let again: Vec<ReviewItemId> = ReviewDrain::new(&store, 0)
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(again, first);
    }

    #[test]
    fn test_drain_stops_at_high_water_and_resumes() {
        let store = InMemoryIdentityStore::new();
        enqueue(&store, 2);

        let mut drain = ReviewDrain::new(&store, 0).unwrap();
        let first = drain.next().unwrap().unwrap();
        let late = enqueue(&store, 1);

        let rest: Vec<ReviewItem> = drain.by_ref().map(Result::unwrap).collect();
        assert_eq!(rest.len(), 1);
        assert!(rest.iter().all(|i| i.id != late[0]));

        let resumed: Vec<ReviewItemId> = ReviewDrain::new(&store, first.seq)
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[1], late[0]);
    }

    #[test]
    fn test_empty_queue_drains_nothing() {
        let store = InMemoryIdentityStore::new();
        assert_eq!(ReviewDrain::new(&store, 0).unwrap().count(), 0);
    }
}
