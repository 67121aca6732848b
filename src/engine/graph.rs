//! Graph edits: merge, split, block and merge proposals.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde_json::{json, Value};

use super::{key_set, IdentityEngine};
use crate::association::Association;
use crate::audit::{ordered_pair, Actor, ResolutionAction, ResolutionEvent};
use crate::claim::{fold_metadata, ClaimId, IdentityClaim};
use crate::error::{IdentityResult, ValidationError};
use crate::principal::{Principal, PrincipalId};
use crate::review::{ReviewItem, ReviewItemId, ReviewPayload};
use crate::scoring::{CandidateEvidence, ScoreBreakdown};
use crate::storage::StoreTransaction;

/// Where split-off claims go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitTarget {
    /// A fresh provisional principal.
    New,
    /// An existing, non-merged principal.
    Existing(PrincipalId),
}

fn same_value(a: &IdentityClaim, b: &IdentityClaim) -> bool {
    a.platform == b.platform && a.normalized.is_some() && a.normalized == b.normalized
}

fn is_proposal_for(item: &ReviewItem, pair: (PrincipalId, PrincipalId)) -> bool {
    matches!(
        &item.payload,
        ReviewPayload::MergeProposal { a, b, .. } if ordered_pair(*a, *b) == pair
    )
}

/// Source claims that collide with destination claims, grouped for the merge.
struct Consolidation {
    /// `(source claim, destination claim)` pairs with the same value.
    duplicates: Vec<(IdentityClaim, IdentityClaim)>,
    /// Source claims with no counterpart.
    moves: Vec<IdentityClaim>,
}

fn plan_consolidation(
    source: Vec<IdentityClaim>,
    destination: &[IdentityClaim],
) -> Result<Consolidation, ValidationError> {
    let mut duplicates = Vec::new();
    let mut moves = Vec::new();
    let mut conflicts = Vec::new();
    for claim in source {
        match destination.iter().find(|d| same_value(&claim, d)) {
            Some(existing) => {
                if existing.kind != claim.kind
                    || fold_metadata(&existing.evidence, &claim.evidence).is_none()
                {
                    conflicts.push(claim.id);
                    conflicts.push(existing.id);
                } else {
                    duplicates.push((claim, existing.clone()));
                }
            }
            None => moves.push(claim),
        }
    }
    if !conflicts.is_empty() {
        return Err(ValidationError::MergeConflict {
            claim_ids: conflicts,
            reason: "duplicate claims differ in kind or carry incompatible evidence".to_string(),
        });
    }
    Ok(Consolidation { duplicates, moves })
}

/// Collapses two claims with the same value into the one seen last.
///
/// Returns the survivor and the id of the claim to delete.
fn consolidate(a: IdentityClaim, b: IdentityClaim, owner: PrincipalId) -> (IdentityClaim, ClaimId) {
    let (mut keeper, other) = if a.last_seen >= b.last_seen { (a, b) } else { (b, a) };
    keeper.fold_evidence(&other.evidence);
    keeper.confidence = keeper.confidence.max(other.confidence);
    keeper.first_seen = keeper.first_seen.min(other.first_seen);
    keeper.principal_id = Some(owner);
    (keeper, other.id)
}

impl IdentityEngine {
    /// Scores `b` as if its claims were a batch matched against `a`.
    pub(super) fn pair_breakdown(
        &self,
        tx: &mut dyn StoreTransaction,
        a: &Principal,
        b: &Principal,
    ) -> IdentityResult<ScoreBreakdown> {
        let a_claims = tx.claims_for_principal(a.id)?;
        let b_claims = tx.claims_for_principal(b.id)?;
        let a_keys = key_set(&a_claims);
        let b_keys = key_set(&b_claims);
        let last_seen = a_claims
            .iter()
            .filter(|c| c.key().is_some_and(|k| b_keys.contains(&k)))
            .map(|c| c.last_seen)
            .max();
        Ok(self.scorer.score(
            &CandidateEvidence {
                batch_keys: b_keys.len(),
                matched_keys: b_keys.intersection(&a_keys).count(),
                batch_name: b.display_name.as_deref(),
                candidate_name: a.display_name.as_deref(),
                last_seen,
            },
            Utc::now(),
        ))
    }

    /// Absorbs `source` into `destination`.
    ///
    /// Claims move to the destination; a claim both sides hold collapses into
    /// one. Associations follow. The source stays behind as a `merged` record
    /// pointing at the destination, so old ids keep resolving.
    ///
    /// A blocked pair can only be merged by an operator; the event records
    /// the override.
    ///
    /// # Errors
    ///
    /// - `ValidationError::SamePrincipal` if the ids are equal
    /// - `ValidationError::PrincipalMerged` if either side is already merged
    /// - `ValidationError::MergeBlocked` for a system merge of a blocked pair
    /// - `ValidationError::MergeConflict` if duplicate claims cannot be
    ///   reconciled; nothing is written
    /// - `ExecutionError::LockTimeout` if another edit holds either principal
    pub fn merge(
        &self,
        source: PrincipalId,
        destination: PrincipalId,
        reason: &str,
        actor: Actor,
    ) -> IdentityResult<ResolutionEvent> {
        if source == destination {
            return Err(ValidationError::SamePrincipal { id: source }.into());
        }
        let _guard = self
            .locks
            .acquire(&[source, destination], self.config.lock_timeout())?;

        let event = self.transact("merge", |tx| {
            let mut src = Self::live_principal(tx, source)?;
            let mut dst = Self::live_principal(tx, destination)?;

            let blocked = Self::blocked_between(tx, &src, &dst)?;
            if blocked && actor.is_system() {
                let (a, b) = ordered_pair(source, destination);
                return Err(ValidationError::MergeBlocked { a, b }.into());
            }

            let scores = if actor.is_system() {
                self.pair_breakdown(tx, &dst, &src)?.to_json()
            } else {
                Value::Null
            };

            let dst_claims = tx.claims_for_principal(destination)?;
            let plan = plan_consolidation(tx.claims_for_principal(source)?, &dst_claims)?;

            let mut replaced: HashMap<ClaimId, ClaimId> = HashMap::new();
            let consolidated = plan.duplicates.len();
            for (from_source, from_destination) in plan.duplicates {
                let (keeper, dropped) = consolidate(from_source, from_destination, destination);
                tx.delete_claim(dropped)?;
                replaced.insert(dropped, keeper.id);
                tx.put_claim(keeper)?;
            }
            let reparented = plan.moves.len();
            for mut claim in plan.moves {
                claim.principal_id = Some(destination);
                tx.put_claim(claim)?;
            }

            let (moved, collapsed) = Self::merge_associations(tx, source, destination, &replaced)?;

            dst.absorb_ancestors(source, &src.ancestors);
            dst.adopt_display_name(src.display_name.as_deref());
            if dst.organization.is_none() {
                dst.organization.clone_from(&src.organization);
            }
            if let Some(metadata) = fold_metadata(&dst.metadata, &src.metadata) {
                dst.metadata = metadata;
            }
            src.redirect_to(destination);
            tx.put_principal(dst)?;
            tx.put_principal(src)?;

            let event = ResolutionEvent::new(
                actor.clone(),
                ResolutionAction::Merge,
                vec![source],
                destination,
                reason,
                json!({
                    "reparented_claims": reparented,
                    "consolidated_claims": consolidated,
                    "associations_moved": moved,
                    "associations_collapsed": collapsed,
                    "block_overridden": blocked,
                    "scores": scores,
                }),
            )?;
            tx.append_event(event.clone())?;

            let pair = ordered_pair(source, destination);
            for item in tx.pending_reviews()? {
                if is_proposal_for(&item, pair) {
                    tx.resolve_review(item.id, format!("merged by {actor}"))?;
                }
            }
            Ok(event)
        })?;

        tracing::info!(
            source = %source,
            destination = %destination,
            actor = %event.actor,
            snapshot = %event.score_snapshot,
            "merged principals"
        );
        Ok(event)
    }

    /// Re-points the source's associations; same-target pairs collapse.
    ///
    /// Evidence ids of consolidated claims are rewritten to the survivor.
    fn merge_associations(
        tx: &mut dyn StoreTransaction,
        source: PrincipalId,
        destination: PrincipalId,
        replaced: &HashMap<ClaimId, ClaimId>,
    ) -> IdentityResult<(usize, usize)> {
        let remap = |association: &mut Association| -> bool {
            let before = association.evidence.clone();
            association.evidence = before
                .iter()
                .map(|id| replaced.get(id).copied().unwrap_or(*id))
                .collect();
            association.evidence != before
        };

        let mut kept = tx.associations_for_principal(destination)?;
        let mut dirty: BTreeSet<usize> = BTreeSet::new();
        for (i, association) in kept.iter_mut().enumerate() {
            if remap(association) {
                dirty.insert(i);
            }
        }

        let (mut moved, mut collapsed) = (0, 0);
        for mut association in tx.associations_for_principal(source)? {
            remap(&mut association);
            if let Some(i) = kept.iter().position(|k| k.target == association.target) {
                kept[i].absorb(&association);
                dirty.insert(i);
                tx.delete_association(association.id)?;
                collapsed += 1;
            } else {
                association.principal_id = destination;
                tx.put_association(association)?;
                moved += 1;
            }
        }
        for i in dirty {
            tx.put_association(kept[i].clone())?;
        }
        Ok((moved, collapsed))
    }

    /// Moves the named claims out of `principal_id`.
    ///
    /// Associations whose evidence lies entirely within the moved claims go
    /// with them. Associations with evidence on both sides stay, are listed in
    /// the event and are queued for review.
    ///
    /// # Errors
    ///
    /// - `ValidationError::MissingField` for an empty claim list
    /// - `ValidationError::SplitConflict` for a claim listed twice, or when
    ///   the destination already holds one of the values
    /// - `ValidationError::ClaimNotOwned` for claims of another principal
    /// - `ValidationError::SamePrincipal` / `PrincipalMerged` for a bad destination
    pub fn split(
        &self,
        principal_id: PrincipalId,
        claim_ids: &[ClaimId],
        target: SplitTarget,
        reason: &str,
        actor: Actor,
    ) -> IdentityResult<ResolutionEvent> {
        if claim_ids.is_empty() {
            return Err(ValidationError::MissingField {
                field: "claim_ids".to_string(),
            }
            .into());
        }
        let mut seen = BTreeSet::new();
        let repeated: Vec<ClaimId> = claim_ids
            .iter()
            .filter(|id| !seen.insert(**id))
            .copied()
            .collect();
        if !repeated.is_empty() {
            return Err(ValidationError::SplitConflict {
                claim_ids: repeated,
                reason: "claim listed more than once".to_string(),
            }
            .into());
        }
        let moving = seen;

        let mut lock_ids = vec![principal_id];
        if let SplitTarget::Existing(destination) = target {
            if destination == principal_id {
                return Err(ValidationError::SamePrincipal { id: principal_id }.into());
            }
            lock_ids.push(destination);
        }
        let _guard = self.locks.acquire(&lock_ids, self.config.lock_timeout())?;

        let event = self.transact("split", |tx| {
            let mut source = Self::live_principal(tx, principal_id)?;
            let owned = tx.claims_for_principal(principal_id)?;
            let mut claims = Vec::with_capacity(claim_ids.len());
            for id in claim_ids {
                let claim = owned.iter().find(|c| c.id == *id).cloned().ok_or(
                    ValidationError::ClaimNotOwned {
                        claim_id: *id,
                        principal_id,
                    },
                )?;
                claims.push(claim);
            }

            let (mut destination, created) = match target {
                SplitTarget::New => (Principal::provisional(None), true),
                SplitTarget::Existing(id) => (Self::live_principal(tx, id)?, false),
            };
            if !created {
                let held = tx.claims_for_principal(destination.id)?;
                let clashing: Vec<ClaimId> = claims
                    .iter()
                    .filter(|c| held.iter().any(|h| same_value(c, h)))
                    .map(|c| c.id)
                    .collect();
                if !clashing.is_empty() {
                    return Err(ValidationError::SplitConflict {
                        claim_ids: clashing,
                        reason: format!("destination {} already holds these values", destination.id),
                    }
                    .into());
                }
            }

            for mut claim in claims {
                claim.principal_id = Some(destination.id);
                tx.put_claim(claim)?;
            }

            let mut repointed = 0usize;
            let mut flagged = Vec::new();
            for mut association in tx.associations_for_principal(principal_id)? {
                if association.evidence_within(&moving) {
                    association.principal_id = destination.id;
                    tx.put_association(association)?;
                    repointed += 1;
                } else if association.evidence_straddles(&moving) {
                    flagged.push(association.id);
                }
            }

            destination.touch();
            source.touch();
            let destination_id = destination.id;
            tx.put_principal(destination)?;
            tx.put_principal(source)?;

            let event = ResolutionEvent::new(
                actor.clone(),
                ResolutionAction::Split,
                vec![principal_id],
                destination_id,
                reason,
                json!({
                    "moved_claims": claim_ids,
                    "new_principal": created,
                    "associations_moved": repointed,
                    "flagged_associations": flagged,
                }),
            )?;
            tx.append_event(event.clone())?;
            if !flagged.is_empty() {
                tx.enqueue_review(ReviewItem::pending(ReviewPayload::AssociationReview {
                    association_ids: flagged,
                    event_id: event.id,
                }))?;
            }
            Ok(event)
        })?;

        tracing::info!(
            source = %principal_id,
            destination = %event.to_principal,
            claims = claim_ids.len(),
            actor = %event.actor,
            "split principal"
        );
        Ok(event)
    }

    /// Declares two principals distinct.
    ///
    /// Both ids are resolved through merges first. Blocks stop the resolver
    /// from attaching ambiguous batches across the pair and stop system
    /// merges; operator merges override them.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::SamePrincipal` if both ids resolve to the
    /// same principal.
    pub fn block(
        &self,
        a: PrincipalId,
        b: PrincipalId,
        reason: &str,
        actor: Actor,
    ) -> IdentityResult<ResolutionEvent> {
        let event = self.transact("block", |tx| {
            let first = self.resolve_in(tx, a)?.id;
            let second = self.resolve_in(tx, b)?.id;
            if first == second {
                return Err(ValidationError::SamePrincipal { id: first }.into());
            }
            let event = ResolutionEvent::new(
                actor.clone(),
                ResolutionAction::Block,
                vec![first],
                second,
                reason,
                json!({}),
            )?;
            tx.append_event(event.clone())?;

            let pair = ordered_pair(first, second);
            for item in tx.pending_reviews()? {
                if is_proposal_for(&item, pair) {
                    tx.resolve_review(item.id, "pair blocked".to_string())?;
                }
            }
            Ok(event)
        })?;
        tracing::info!(
            a = %event.from_principals[0],
            b = %event.to_principal,
            actor = %event.actor,
            "blocked principal pair"
        );
        Ok(event)
    }

    /// Queues a suggested merge for a human instead of performing it.
    ///
    /// Proposing the same pair twice returns the pending item.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MergeBlocked` for a blocked pair and
    /// `ValidationError::SamePrincipal` if both ids resolve to one principal.
    pub fn propose_merge(
        &self,
        a: PrincipalId,
        b: PrincipalId,
        reason: &str,
    ) -> IdentityResult<ReviewItemId> {
        let id = self.transact("propose_merge", |tx| {
            let first = self.resolve_in(tx, a)?;
            let second = self.resolve_in(tx, b)?;
            if first.id == second.id {
                return Err(ValidationError::SamePrincipal { id: first.id }.into());
            }
            let pair = ordered_pair(first.id, second.id);
            if Self::blocked_between(tx, &first, &second)? {
                return Err(ValidationError::MergeBlocked {
                    a: pair.0,
                    b: pair.1,
                }
                .into());
            }
            if let Some(item) = tx
                .pending_reviews()?
                .into_iter()
                .find(|item| is_proposal_for(item, pair))
            {
                return Ok(item.id);
            }
            let scores = self.pair_breakdown(tx, &first, &second)?;
            Ok(tx.enqueue_review(ReviewItem::pending(ReviewPayload::MergeProposal {
                a: first.id,
                b: second.id,
                reason: reason.to_string(),
                scores: scores.to_json(),
            }))?)
        })?;
        tracing::info!(a = %a, b = %b, review_item = %id, "merge proposed for review");
        Ok(id)
    }
}
