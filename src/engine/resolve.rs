//! Attribution of observation batches to principals.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{key_set, IdentityEngine};
use crate::audit::{Actor, ResolutionAction, ResolutionEvent};
use crate::claim::{ClaimId, ClaimKey, IdentityClaim, IdentityKind, Platform};
use crate::confidence::Confidence;
use crate::error::{ExecutionError, IdentityError, IdentityResult};
use crate::observation::{BatchFingerprint, ObservationBatch};
use crate::principal::{Principal, PrincipalId};
use crate::review::{ReviewItem, ReviewItemId, ReviewPayload};
use crate::scoring::{CandidateEvidence, ScoreBreakdown};
use crate::storage::StoreTransaction;

const REASON_BLOCKED: &str = "candidate blocked";
const REASON_RACE: &str = "resolution race unresolved";

/// Where a batch ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// Attached to this principal (new or existing).
    Principal(PrincipalId),
    /// Deferred to the manual-review queue.
    Unattributed {
        /// The queued item.
        review_item: ReviewItemId,
    },
    /// No identifier normalized; everything was stored unattached.
    Unnormalized,
}

/// Why the engine attributed a batch the way it did.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No existing principal held any identifier; a new one was created.
    NoCandidates,
    /// An existing principal already held every identifier.
    Corroborated,
    /// The top-scoring candidate cleared the threshold.
    Scored {
        /// Scores of the winner.
        breakdown: ScoreBreakdown,
    },
    /// No candidate was a clear winner; a new principal was created.
    AmbiguousNoMatch {
        /// Best score seen, if any candidate was scored.
        best: Option<ScoreBreakdown>,
    },
    /// The winner is blocked against another candidate; deferred.
    Blocked {
        /// Top-scoring candidate.
        winner: PrincipalId,
        /// Candidates it is blocked against.
        blocked_with: Vec<PrincipalId>,
    },
    /// Concurrent writers kept invalidating the attempt; deferred.
    Contended {
        /// Attempts made.
        attempts: usize,
    },
    /// Nothing in the batch normalized.
    NothingNormalized,
}

/// What happened to one observed identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A new claim was stored.
    Created(ClaimId),
    /// An existing claim was refreshed.
    Refreshed(ClaimId),
    /// Stored unnormalized and unattached.
    Unnormalized(ClaimId),
    /// Carried by a deferred batch.
    Deferred,
}

/// Result of [`IdentityEngine::resolve_or_create`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOutcome {
    /// Where the batch went.
    pub attribution: Attribution,
    /// Why.
    pub decision: Decision,
    /// One entry per observation, then per context claim, in input order.
    pub claims: Vec<ClaimOutcome>,
    /// Content fingerprint of the batch.
    pub fingerprint: BatchFingerprint,
    /// Transaction attempts used.
    pub attempts: usize,
}

impl ResolveOutcome {
    /// The principal the batch was attributed to, if any.
    #[must_use]
    pub const fn principal_id(&self) -> Option<PrincipalId> {
        match self.attribution {
            Attribution::Principal(id) => Some(id),
            _ => None,
        }
    }
}

/// A normalized identifier of the batch, after collapsing duplicates.
#[derive(Debug, Clone)]
struct PlannedKey {
    key: ClaimKey,
    raw_value: String,
    confidence: Confidence,
    evidence: Value,
    items: Vec<usize>,
}

#[derive(Debug, Clone)]
struct PlannedRaw {
    item: usize,
    platform: Platform,
    kind: IdentityKind,
    raw_value: String,
    confidence: Confidence,
    evidence: Value,
}

#[derive(Debug)]
struct Plan {
    keys: Vec<PlannedKey>,
    raw: Vec<PlannedRaw>,
    items: usize,
}

impl Plan {
    fn key_set(&self) -> BTreeSet<ClaimKey> {
        self.keys.iter().map(|k| k.key.clone()).collect()
    }
}

#[derive(Debug, Default)]
struct Candidate {
    matched: BTreeSet<ClaimKey>,
    last_seen: Option<DateTime<Utc>>,
}

/// Per-item outcomes being filled in.
struct Outcomes(Vec<Option<ClaimOutcome>>);

impl Outcomes {
    fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    fn set(&mut self, items: &[usize], outcome: ClaimOutcome) {
        for &i in items {
            if let Some(slot) = self.0.get_mut(i) {
                *slot = Some(outcome);
            }
        }
    }

    fn finish(self) -> Vec<ClaimOutcome> {
        self.0
            .into_iter()
            .map(|o| o.unwrap_or(ClaimOutcome::Deferred))
            .collect()
    }
}

/// Result of one transaction attempt, before commit.
struct Attempt {
    attribution: Attribution,
    decision: Decision,
    outcomes: Outcomes,
}

impl Attempt {
    const fn done(attribution: Attribution, decision: Decision, outcomes: Outcomes) -> Self {
        Self {
            attribution,
            decision,
            outcomes,
        }
    }
}

impl IdentityEngine {
    /// Attributes a batch of co-occurring identifiers to a principal.
    ///
    /// Finds every principal already holding one of the identifiers and
    /// either reuses the one that holds them all, attaches to a clear scoring
    /// winner, creates a new provisional principal, or defers the batch to
    /// the manual-review queue. Identifiers that do not normalize are stored
    /// unattached and queued without holding up the rest.
    ///
    /// Lost races with concurrent writers are retried against a fresh
    /// snapshot; when retries run out the batch is deferred and the call
    /// still succeeds with [`Attribution::Unattributed`].
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an empty batch and an execution error
    /// for storage failures or a corrupted successor chain.
    pub fn resolve_or_create(&self, batch: &ObservationBatch) -> IdentityResult<ResolveOutcome> {
        batch.validate()?;
        let fingerprint = batch.fingerprint();
        let span = tracing::info_span!("resolve_or_create", fingerprint = %fingerprint);
        let _enter = span.enter();

        let plan = self.plan(batch)?;
        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            let mut tx = self.store.begin()?;
            let Attempt {
                attribution,
                decision,
                outcomes,
            } = self.attempt(tx.as_mut(), batch, &plan, fingerprint)?;
            match tx.commit() {
                Ok(()) => {
                    return Ok(ResolveOutcome {
                        attribution,
                        decision,
                        claims: outcomes.finish(),
                        fingerprint,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_contention() => {
                    tracing::debug!(attempt, error = %e, "resolution commit contended; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(attempts, "resolution race unresolved; deferring batch to review");
        let review_item = self
            .store
            .enqueue_review_once(deferral(batch, fingerprint, REASON_RACE))?;
        Ok(ResolveOutcome {
            attribution: Attribution::Unattributed { review_item },
            decision: Decision::Contended { attempts },
            claims: vec![ClaimOutcome::Deferred; plan.items],
            fingerprint,
            attempts,
        })
    }

    /// Normalizes every item and collapses duplicates by `(platform, normalized)`.
    fn plan(&self, batch: &ObservationBatch) -> IdentityResult<Plan> {
        let source = batch
            .source_ref
            .as_ref()
            .map_or(Value::Null, |s| json!({ "source_ref": s }));

        let observed = batch.observations.iter().map(|o| {
            Ok::<_, IdentityError>((
                &o.platform,
                o.kind,
                &o.raw_value,
                self.config.confidence_for(&o.platform)?,
                source.clone(),
            ))
        });
        let context = batch.context.iter().map(|c| {
            let evidence = crate::claim::fold_metadata(&c.evidence, &source)
                .unwrap_or_else(|| c.evidence.clone());
            Ok::<_, IdentityError>((&c.platform, c.kind, &c.raw_value, c.confidence, evidence))
        });

        let mut keys: Vec<PlannedKey> = Vec::new();
        let mut raw = Vec::new();
        let mut items = 0;
        for (item, entry) in observed.chain(context).enumerate() {
            let (platform, kind, raw_value, confidence, evidence) = entry?;
            items += 1;
            let Some(normalized) = self.normalize(platform, kind, raw_value) else {
                tracing::debug!(%platform, %kind, "identifier did not normalize");
                raw.push(PlannedRaw {
                    item,
                    platform: platform.clone(),
                    kind,
                    raw_value: raw_value.clone(),
                    confidence,
                    evidence,
                });
                continue;
            };
            if let Some(existing) = keys
                .iter_mut()
                .find(|k| k.key.platform == *platform && k.key.normalized == normalized)
            {
                existing.confidence = existing.confidence.max(confidence);
                if let Some(folded) = crate::claim::fold_metadata(&existing.evidence, &evidence) {
                    existing.evidence = folded;
                }
                existing.items.push(item);
                continue;
            }
            keys.push(PlannedKey {
                key: ClaimKey::new(platform.clone(), kind, normalized),
                raw_value: raw_value.clone(),
                confidence,
                evidence,
                items: vec![item],
            });
        }
        Ok(Plan { keys, raw, items })
    }

    fn attempt(
        &self,
        tx: &mut dyn StoreTransaction,
        batch: &ObservationBatch,
        plan: &Plan,
        fingerprint: BatchFingerprint,
    ) -> IdentityResult<Attempt> {
        let now = Utc::now();
        let mut outcomes = Outcomes::new(plan.items);
        self.store_unnormalized(tx, plan, now, &mut outcomes)?;

        if plan.keys.is_empty() {
            tracing::info!(stored = plan.raw.len(), "no identifier normalized");
            return Ok(Attempt::done(
                Attribution::Unnormalized,
                Decision::NothingNormalized,
                outcomes,
            ));
        }

        let candidates = self.candidates(tx, plan)?;
        if candidates.is_empty() {
            let id = self.create_provisional(tx, batch, plan, &mut outcomes)?;
            tracing::info!(principal = %id, "no candidates; created provisional principal");
            return Ok(Attempt::done(
                Attribution::Principal(id),
                Decision::NoCandidates,
                outcomes,
            ));
        }

        if let Some(id) = Self::corroborated(tx, plan, &candidates)? {
            self.reinforce(tx, id, batch, plan, now, &mut outcomes)?;
            tracing::debug!(principal = %id, "batch corroborates existing principal");
            return Ok(Attempt::done(
                Attribution::Principal(id),
                Decision::Corroborated,
                outcomes,
            ));
        }

        let mut scored: Vec<(Principal, ScoreBreakdown)> = Vec::with_capacity(candidates.len());
        for (id, candidate) in &candidates {
            let principal = tx
                .principal(*id)?
                .ok_or(ExecutionError::PrincipalNotFound { id: *id })?;
            let breakdown = self.scorer.score(
                &CandidateEvidence {
                    batch_keys: plan.keys.len(),
                    matched_keys: candidate.matched.len(),
                    batch_name: batch.display_name.as_deref(),
                    candidate_name: principal.display_name.as_deref(),
                    last_seen: candidate.last_seen,
                },
                now,
            );
            scored.push((principal, breakdown));
        }
        scored.sort_by(|a, b| b.1.affinity.total_cmp(&a.1.affinity));
        let snapshot = scores_snapshot(&scored);

        let (winner, best) = (scored[0].0.id, scored[0].1);
        let tied = scored
            .get(1)
            .is_some_and(|(_, second)| (second.affinity - best.affinity).abs() < f64::EPSILON);

        if tied || !self.scorer.accepts(best.affinity) {
            let id = self.create_provisional(tx, batch, plan, &mut outcomes)?;
            tracing::info!(
                principal = %id,
                candidates = scored.len(),
                best_affinity = best.affinity,
                tied,
                "ambiguous match; created provisional principal"
            );
            return Ok(Attempt::done(
                Attribution::Principal(id),
                Decision::AmbiguousNoMatch { best: Some(best) },
                outcomes,
            ));
        }

        let mut blocked_with = Vec::new();
        for (other, _) in &scored[1..] {
            if Self::blocked_between(tx, &scored[0].0, other)? {
                blocked_with.push(other.id);
            }
        }
        if !blocked_with.is_empty() {
            let review_item = Self::defer(tx, batch, fingerprint, REASON_BLOCKED)?;
            tracing::info!(
                winner = %winner,
                blocked = blocked_with.len(),
                review_item = %review_item,
                "winning candidate is blocked; deferring batch"
            );
            return Ok(Attempt::done(
                Attribution::Unattributed { review_item },
                Decision::Blocked {
                    winner,
                    blocked_with,
                },
                outcomes,
            ));
        }

        self.reinforce(tx, winner, batch, plan, now, &mut outcomes)?;
        let event = ResolutionEvent::new(
            Actor::System,
            ResolutionAction::Attach,
            Vec::new(),
            winner,
            "scored attach",
            json!({ "winner": best.to_json(), "candidates": snapshot }),
        )?;
        tx.append_event(event)?;
        tracing::info!(
            principal = %winner,
            affinity = best.affinity,
            candidates = scored.len(),
            "attached batch to best-scoring candidate"
        );
        Ok(Attempt::done(
            Attribution::Principal(winner),
            Decision::Scored { breakdown: best },
            outcomes,
        ))
    }

    /// Stores unnormalized items as unattached claims, queueing each once.
    fn store_unnormalized(
        &self,
        tx: &mut dyn StoreTransaction,
        plan: &Plan,
        now: DateTime<Utc>,
        outcomes: &mut Outcomes,
    ) -> IdentityResult<()> {
        if plan.raw.is_empty() {
            return Ok(());
        }
        let mut queued: Vec<IdentityClaim> = Vec::new();
        for item in tx.pending_reviews()? {
            if let ReviewPayload::UnnormalizedClaim { claim_id } = item.payload {
                if let Some(claim) = tx.claim(claim_id)? {
                    queued.push(claim);
                }
            }
        }

        for raw in &plan.raw {
            let existing = queued.iter_mut().find(|c| {
                c.principal_id.is_none()
                    && c.platform == raw.platform
                    && c.kind == raw.kind
                    && c.raw_value == raw.raw_value
            });
            let claim_id = if let Some(claim) = existing {
                claim.refresh(now, self.config.confidence_boost);
                claim.fold_evidence(&raw.evidence);
                tx.put_claim(claim.clone())?;
                claim.id
            } else {
                let mut claim = IdentityClaim::new(
                    None,
                    raw.platform.clone(),
                    raw.kind,
                    raw.raw_value.clone(),
                    None,
                    raw.confidence,
                );
                claim.fold_evidence(&raw.evidence);
                let claim_id = claim.id;
                tx.put_claim(claim.clone())?;
                tx.enqueue_review(ReviewItem::pending(ReviewPayload::UnnormalizedClaim {
                    claim_id,
                }))?;
                queued.push(claim);
                claim_id
            };
            outcomes.set(&[raw.item], ClaimOutcome::Unnormalized(claim_id));
        }
        Ok(())
    }

    /// Candidate set: every live principal holding one of the batch keys.
    fn candidates(
        &self,
        tx: &mut dyn StoreTransaction,
        plan: &Plan,
    ) -> IdentityResult<BTreeMap<PrincipalId, Candidate>> {
        let mut candidates: BTreeMap<PrincipalId, Candidate> = BTreeMap::new();
        for planned in &plan.keys {
            for hit in self.lookup_in(tx, &planned.key)? {
                let candidate = candidates.entry(hit.principal_id).or_default();
                candidate.matched.insert(planned.key.clone());
                if candidate.last_seen.map_or(true, |seen| hit.last_seen > seen) {
                    candidate.last_seen = Some(hit.last_seen);
                }
            }
        }
        Ok(candidates)
    }

    /// The principal to reuse without scoring, if exactly one qualifies.
    fn corroborated(
        tx: &mut dyn StoreTransaction,
        plan: &Plan,
        candidates: &BTreeMap<PrincipalId, Candidate>,
    ) -> IdentityResult<Option<PrincipalId>> {
        let holders: Vec<PrincipalId> = candidates
            .iter()
            .filter(|(_, c)| c.matched.len() == plan.keys.len())
            .map(|(id, _)| *id)
            .collect();
        match holders.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(*only)),
            several => {
                let wanted = plan.key_set();
                let mut exact = Vec::new();
                for id in several {
                    if key_set(&tx.claims_for_principal(*id)?) == wanted {
                        exact.push(*id);
                    }
                }
                Ok(match exact.as_slice() {
                    [only] => Some(*only),
                    _ => None,
                })
            }
        }
    }

    fn create_provisional(
        &self,
        tx: &mut dyn StoreTransaction,
        batch: &ObservationBatch,
        plan: &Plan,
        outcomes: &mut Outcomes,
    ) -> IdentityResult<PrincipalId> {
        let principal = Principal::provisional(batch.display_name.clone());
        let id = principal.id;
        tx.put_principal(principal)?;
        for planned in &plan.keys {
            let claim = new_claim(id, planned);
            outcomes.set(&planned.items, ClaimOutcome::Created(claim.id));
            tx.put_claim(claim)?;
        }
        Ok(id)
    }

    /// Folds the batch into an existing principal.
    fn reinforce(
        &self,
        tx: &mut dyn StoreTransaction,
        id: PrincipalId,
        batch: &ObservationBatch,
        plan: &Plan,
        now: DateTime<Utc>,
        outcomes: &mut Outcomes,
    ) -> IdentityResult<()> {
        let mut principal = tx
            .principal(id)?
            .ok_or(ExecutionError::PrincipalNotFound { id })?;
        let held = tx.claims_for_principal(id)?;
        for planned in &plan.keys {
            let existing = held.iter().find(|c| {
                c.platform == planned.key.platform
                    && c.normalized.as_deref() == Some(planned.key.normalized.as_str())
            });
            if let Some(existing) = existing {
                let mut claim = existing.clone();
                claim.refresh(now, self.config.confidence_boost);
                claim.fold_evidence(&planned.evidence);
                outcomes.set(&planned.items, ClaimOutcome::Refreshed(claim.id));
                tx.put_claim(claim)?;
            } else {
                let claim = new_claim(id, planned);
                outcomes.set(&planned.items, ClaimOutcome::Created(claim.id));
                tx.put_claim(claim)?;
            }
        }
        if !principal.adopt_display_name(batch.display_name.as_deref()) {
            principal.touch();
        }
        tx.put_principal(principal)?;
        Ok(())
    }

    /// Queues the batch for review unless an identical batch is already pending.
    fn defer(
        tx: &mut dyn StoreTransaction,
        batch: &ObservationBatch,
        fingerprint: BatchFingerprint,
        reason: &str,
    ) -> IdentityResult<ReviewItemId> {
        let item = deferral(batch, fingerprint, reason);
        if let Some(pending) = tx
            .pending_reviews()?
            .into_iter()
            .find(|queued| queued.payload.same_subject(&item.payload))
        {
            return Ok(pending.id);
        }
        Ok(tx.enqueue_review(item)?)
    }
}

fn deferral(batch: &ObservationBatch, fingerprint: BatchFingerprint, reason: &str) -> ReviewItem {
    ReviewItem::pending(ReviewPayload::UnattributedBatch {
        batch: batch.clone(),
        fingerprint,
        reason: reason.to_string(),
    })
}

fn new_claim(principal: PrincipalId, planned: &PlannedKey) -> IdentityClaim {
    let mut claim = IdentityClaim::new(
        Some(principal),
        planned.key.platform.clone(),
        planned.key.kind,
        planned.raw_value.clone(),
        Some(planned.key.normalized.clone()),
        planned.confidence,
    );
    claim.fold_evidence(&planned.evidence);
    claim
}

fn scores_snapshot(scored: &[(Principal, ScoreBreakdown)]) -> Value {
    Value::Array(
        scored
            .iter()
            .map(|(principal, b)| {
                let mut entry = b.to_json();
                entry["principal_id"] = json!(principal.id);
                entry
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::storage::InMemoryIdentityStore;

    fn engine() -> (Arc<InMemoryIdentityStore>, IdentityEngine) {
        let store = Arc::new(InMemoryIdentityStore::new());
        let engine = IdentityEngine::new(store.clone());
        (store, engine)
    }

    fn batch(items: &[(&str, IdentityKind, &str)]) -> ObservationBatch {
        items
            .iter()
            .fold(ObservationBatch::builder(), |b, (p, k, v)| b.observe(*p, *k, *v))
            .build()
            .unwrap()
    }

    #[test]
    fn test_first_batch_creates_provisional_principal() {
        let (store, engine) = engine();
        let outcome = engine
            .resolve_or_create(&batch(&[
                ("email", IdentityKind::Email, "Alice@Example.com"),
                ("sms", IdentityKind::Phone, "+1 555 010 9999"),
            ]))
            .unwrap();
        assert_eq!(outcome.decision, Decision::NoCandidates);
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.claims[0], ClaimOutcome::Created(_)));
        let principal = engine.principal(outcome.principal_id().unwrap()).unwrap();
        assert_eq!(principal.state, crate::principal::PrincipalState::Provisional);
        assert_eq!(store.principal_count().unwrap(), 1);
        assert_eq!(store.claim_count().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_items_collapse_to_one_claim() {
        let (store, engine) = engine();
        let outcome = engine
            .resolve_or_create(&batch(&[
                ("email", IdentityKind::Email, "bob@example.com"),
                ("email", IdentityKind::Email, "BOB@example.com "),
            ]))
            .unwrap();
        assert_eq!(outcome.claims.len(), 2);
        assert_eq!(outcome.claims[0], outcome.claims[1]);
        assert_eq!(store.claim_count().unwrap(), 1);
    }

    #[test]
    fn test_repeat_batch_refreshes_and_boosts() {
        let (store, engine) = engine();
        let b = batch(&[("email", IdentityKind::Email, "carol@example.com")]);
        let first = engine.resolve_or_create(&b).unwrap();
        let second = engine.resolve_or_create(&b).unwrap();
        assert_eq!(second.decision, Decision::Corroborated);
        assert_eq!(first.principal_id(), second.principal_id());
        let ClaimOutcome::Refreshed(id) = second.claims[0] else {
            panic!("expected refresh, got {:?}", second.claims[0]);
        };
        let claim = engine.claim(id).unwrap();
        assert!((claim.confidence.value() - 0.91).abs() < 1e-6);
        assert_eq!(store.principal_count().unwrap(), 1);
    }

    #[test]
    fn test_unnormalized_only_batch() {
        let (_store, engine) = engine();
        let b = batch(&[("email", IdentityKind::Email, "not an address")]);
        let outcome = engine.resolve_or_create(&b).unwrap();
        assert_eq!(outcome.attribution, Attribution::Unnormalized);
        assert_eq!(outcome.decision, Decision::NothingNormalized);
        let ClaimOutcome::Unnormalized(id) = outcome.claims[0] else {
            panic!("expected unnormalized outcome");
        };
        assert!(engine.claim(id).unwrap().principal_id.is_none());

        // The same garbage again is not queued twice.
        let again = engine.resolve_or_create(&b).unwrap();
        assert_eq!(again.claims[0], ClaimOutcome::Unnormalized(id));
        let items: Vec<_> = engine
            .drain_manual_review_queue()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload.label(), "unnormalized_claim");
    }

    #[test]
    fn test_context_claims_keep_their_confidence() {
        let (_store, engine) = engine();
        let b = ObservationBatch::builder()
            .observe("email", IdentityKind::Email, "dan@example.com")
            .context("contacts", IdentityKind::Username, "dan_w", 0.4)
            .build()
            .unwrap();
        let outcome = engine.resolve_or_create(&b).unwrap();
        assert_eq!(outcome.claims.len(), 2);
        let ClaimOutcome::Created(id) = outcome.claims[1] else {
            panic!("expected created context claim");
        };
        assert!((engine.claim(id).unwrap().confidence.value() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let (_store, engine) = engine();
        let empty = ObservationBatch {
            observations: Vec::new(),
            display_name: None,
            context: Vec::new(),
            source_ref: None,
        };
        assert!(engine.resolve_or_create(&empty).unwrap_err().is_validation());
    }

    #[test]
    #[traced_test]
    fn test_ambiguous_match_is_logged() {
        let (store, engine) = engine();
        let shared = |personal: &str| {
            ObservationBatch::builder()
                .observe("email", IdentityKind::Email, "support@company.com")
                .context("email", IdentityKind::Email, personal, 0.9)
                .build()
                .unwrap()
        };
        engine.resolve_or_create(&shared("alice@personal.com")).unwrap();
        let outcome = engine.resolve_or_create(&shared("bob@personal.com")).unwrap();
        assert!(matches!(outcome.decision, Decision::AmbiguousNoMatch { .. }));
        assert_eq!(store.principal_count().unwrap(), 2);
        assert!(logs_contain("ambiguous match; created provisional principal"));
    }
}
