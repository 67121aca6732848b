//! The identity resolution engine.
//!
//! [`IdentityEngine`] is the single entry point for everything that changes
//! the principal graph: attributing observation batches, verified writes,
//! merge/split/block, and the manual-review queue. It is cheap to clone and
//! safe to share across threads; all state lives in the [`IdentityStore`].

mod graph;
mod resolve;
mod select;

pub use graph::SplitTarget;
pub use resolve::{Attribution, ClaimOutcome, Decision, ResolveOutcome};
pub use select::{PrincipalSelector, Selection};

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::association::{Association, AssociationTarget};
use crate::audit::{Actor, ResolutionAction, ResolutionEvent};
use crate::claim::{ClaimId, ClaimKey, IdentityClaim, IdentityKind, Platform};
use crate::confidence::Confidence;
use crate::config::ResolverConfig;
use crate::error::{ExecutionError, IdentityResult, ValidationError};
use crate::normalize::{BasicNormalizer, Normalizer};
use crate::observation::ObservationBatch;
use crate::principal::{Principal, PrincipalId};
use crate::review::{ReviewDrain, ReviewItemId, ReviewPayload};
use crate::scoring::{NameSimilarity, Scorer};
use crate::storage::{IdentityStore, PrincipalLocks, StoreTransaction};

/// One claim returned by candidate lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimMatch {
    /// Owning principal, resolved through merges.
    pub principal_id: PrincipalId,
    /// The matching claim.
    pub claim_id: ClaimId,
    /// Claim confidence.
    pub confidence: Confidence,
    /// When the claim was last observed.
    pub last_seen: DateTime<Utc>,
}

/// A verified identifier supplied when creating a principal.
#[derive(Debug, Clone, PartialEq)]
pub struct NewClaim {
    /// Origin platform.
    pub platform: Platform,
    /// Identifier kind.
    pub kind: IdentityKind,
    /// Value as supplied.
    pub raw_value: String,
    /// Caller-assigned confidence.
    pub confidence: Confidence,
}

impl NewClaim {
    /// Creates a verified claim request.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an invalid platform or confidence.
    pub fn new(
        platform: &str,
        kind: IdentityKind,
        raw_value: impl Into<String>,
        confidence: f32,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            platform: Platform::new(platform)?,
            kind,
            raw_value: raw_value.into(),
            confidence: Confidence::new(confidence)?,
        })
    }
}

/// Verified data for a new, confirmed principal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewPrincipal {
    /// Display name.
    pub display_name: Option<String>,
    /// Organization.
    pub organization: Option<String>,
    /// Metadata (JSON object or null).
    pub metadata: serde_json::Value,
    /// Identifiers known to belong to the person.
    pub claims: Vec<NewClaim>,
}

impl NewPrincipal {
    /// Starts a request with a display name.
    #[must_use]
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..Self::default()
        }
    }

    /// Adds a verified identifier.
    #[must_use]
    pub fn with_claim(mut self, claim: NewClaim) -> Self {
        self.claims.push(claim);
        self
    }

    /// Sets the organization.
    #[must_use]
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

/// Corrections to one claim; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimUpdate {
    /// Replacement value, normalized like a verified write.
    pub raw_value: Option<String>,
    /// Replacement platform.
    pub platform: Option<String>,
    /// Replacement confidence.
    pub confidence: Option<f32>,
}

impl ClaimUpdate {
    /// Replaces the value.
    #[must_use]
    pub fn value(mut self, raw_value: impl Into<String>) -> Self {
        self.raw_value = Some(raw_value.into());
        self
    }

    /// Replaces the platform.
    #[must_use]
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Replaces the confidence.
    #[must_use]
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    fn is_empty(&self) -> bool {
        self.raw_value.is_none() && self.platform.is_none() && self.confidence.is_none()
    }
}

fn claim_snapshot(claim: &IdentityClaim) -> serde_json::Value {
    serde_json::json!({
        "platform": claim.platform,
        "raw_value": claim.raw_value,
        "normalized": claim.normalized,
        "confidence": claim.confidence.value(),
    })
}

/// Identity resolution and principal graph engine.
#[derive(Clone)]
pub struct IdentityEngine {
    store: Arc<dyn IdentityStore>,
    normalizer: Arc<dyn Normalizer>,
    scorer: Scorer,
    config: ResolverConfig,
    locks: Arc<PrincipalLocks>,
}

impl std::fmt::Debug for IdentityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdentityEngine {
    /// Creates an engine with the default configuration and the basic normalizer.
    #[must_use]
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        let config = ResolverConfig::default();
        Self {
            store,
            normalizer: Arc::new(BasicNormalizer::default()),
            scorer: Scorer::new(config.scoring.clone()),
            config,
            locks: Arc::new(PrincipalLocks::new()),
        }
    }

    /// Creates an engine with an explicit normalizer and configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if the configuration is invalid.
    pub fn with_config(
        store: Arc<dyn IdentityStore>,
        normalizer: Arc<dyn Normalizer>,
        config: ResolverConfig,
    ) -> IdentityResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            normalizer,
            scorer: Scorer::new(config.scoring.clone()),
            config,
            locks: Arc::new(PrincipalLocks::new()),
        })
    }

    /// Replaces the display-name similarity used by the scorer.
    #[must_use]
    pub fn with_name_similarity(mut self, names: Arc<dyn NameSimilarity>) -> Self {
        self.scorer = Scorer::with_name_similarity(self.config.scoring.clone(), names);
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// The active configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// The disambiguation scorer.
    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Runs `op` in a fresh transaction and commits, retrying on contention.
    ///
    /// `op` may run several times and must not have side effects outside the
    /// transaction.
    fn transact<T>(
        &self,
        op: &'static str,
        mut body: impl FnMut(&mut dyn StoreTransaction) -> IdentityResult<T>,
    ) -> IdentityResult<T> {
        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            let mut tx = self.store.begin()?;
            let value = body(tx.as_mut())?;
            match tx.commit() {
                Ok(()) => return Ok(value),
                Err(e) if e.is_contention() => {
                    tracing::debug!(op, attempt, error = %e, "commit contended; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(op, attempts, "giving up after repeated commit contention");
        Err(ExecutionError::Contention { attempts }.into())
    }

    /// Runs a read-only `op` in a transaction that is then discarded.
    fn read<T>(
        &self,
        op: impl FnOnce(&mut dyn StoreTransaction) -> IdentityResult<T>,
    ) -> IdentityResult<T> {
        let mut tx = self.store.begin()?;
        let value = op(tx.as_mut())?;
        tx.rollback();
        Ok(value)
    }

    /// Follows `merged -> successor` pointers from `id` to a live principal.
    fn resolve_in(&self, tx: &mut dyn StoreTransaction, id: PrincipalId) -> IdentityResult<Principal> {
        let mut current = tx
            .principal(id)?
            .ok_or(ExecutionError::PrincipalNotFound { id })?;
        let mut visited = HashSet::from([id]);
        let mut hops = 0usize;
        while let Some(next) = current.state.successor() {
            hops += 1;
            if hops > self.config.max_successor_hops || !visited.insert(next) {
                tracing::error!(
                    start = %id,
                    at = %next,
                    hops,
                    "successor chain is cyclic or too deep; merge history needs repair"
                );
                return Err(ExecutionError::CycleDetected { start: id, hops }.into());
            }
            current = tx
                .principal(next)?
                .ok_or(ExecutionError::PrincipalNotFound { id: next })?;
        }
        Ok(current)
    }

    /// Returns true if a block separates anything folded into `a` from
    /// anything folded into `b`.
    ///
    /// Blocks are recorded against the ids current at the time; a merge
    /// carries them along through the destination's ancestors.
    fn blocked_between(
        tx: &mut dyn StoreTransaction,
        a: &Principal,
        b: &Principal,
    ) -> IdentityResult<bool> {
        for x in a.lineage() {
            for y in b.lineage() {
                if x != y && tx.is_blocked(x, y)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Reads a principal that must exist and must not have been merged.
    fn live_principal(
        tx: &mut dyn StoreTransaction,
        id: PrincipalId,
    ) -> IdentityResult<Principal> {
        let principal = tx
            .principal(id)?
            .ok_or(ExecutionError::PrincipalNotFound { id })?;
        if let Some(successor) = principal.state.successor() {
            return Err(ValidationError::PrincipalMerged { id, successor }.into());
        }
        Ok(principal)
    }

    fn normalize(&self, platform: &Platform, kind: IdentityKind, raw: &str) -> Option<String> {
        self.normalizer
            .normalize(platform, kind, raw)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
    }

    fn normalize_verified(
        &self,
        platform: &Platform,
        kind: IdentityKind,
        raw: &str,
    ) -> Result<String, ValidationError> {
        self.normalize(platform, kind, raw)
            .ok_or_else(|| ValidationError::Unnormalized {
                platform: platform.clone(),
                kind,
                value: raw.to_string(),
            })
    }

    /// Resolves `id` through any merges to the live principal it now denotes.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::PrincipalNotFound` for unknown ids and the
    /// fatal `ExecutionError::CycleDetected` for corrupted merge history.
    pub fn principal(&self, id: PrincipalId) -> IdentityResult<Principal> {
        self.read(|tx| self.resolve_in(tx, id))
    }

    /// Reads a principal record as stored, without following merges.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub fn principal_record(&self, id: PrincipalId) -> IdentityResult<Option<Principal>> {
        self.read(|tx| Ok(tx.principal(id)?))
    }

    /// Every claim matching `(platform, kind, normalized)`, system-wide, one
    /// entry per owning principal.
    ///
    /// Owners are resolved through merges. When a principal holds several
    /// matching claims the most recently seen one is reported. An empty value
    /// is unnormalized and matches nothing.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an invalid platform, or an execution
    /// error if successor resolution fails.
    pub fn lookup_claim(
        &self,
        platform: &str,
        kind: IdentityKind,
        normalized: &str,
    ) -> IdentityResult<Vec<ClaimMatch>> {
        let platform = Platform::new(platform)?;
        if normalized.trim().is_empty() {
            return Ok(Vec::new());
        }
        let key = ClaimKey::new(platform, kind, normalized);
        self.read(|tx| self.lookup_in(tx, &key))
    }

    fn lookup_in(
        &self,
        tx: &mut dyn StoreTransaction,
        key: &ClaimKey,
    ) -> IdentityResult<Vec<ClaimMatch>> {
        let mut out: Vec<ClaimMatch> = Vec::new();
        for claim in tx.claims_by_key(key)? {
            let Some(owner) = claim.principal_id else {
                continue;
            };
            let principal_id = self.resolve_in(tx, owner)?.id;
            let candidate = ClaimMatch {
                principal_id,
                claim_id: claim.id,
                confidence: claim.confidence,
                last_seen: claim.last_seen,
            };
            match out.iter_mut().find(|m| m.principal_id == principal_id) {
                Some(existing) if existing.last_seen < candidate.last_seen => *existing = candidate,
                Some(_) => {}
                None => out.push(candidate),
            }
        }
        Ok(out)
    }

    /// Claims owned by the live principal `id` resolves to.
    ///
    /// # Errors
    ///
    /// Returns an execution error if the principal cannot be resolved.
    pub fn claims_for(&self, id: PrincipalId) -> IdentityResult<Vec<IdentityClaim>> {
        self.read(|tx| {
            let principal = self.resolve_in(tx, id)?;
            Ok(tx.claims_for_principal(principal.id)?)
        })
    }

    /// Reads one claim.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::ClaimNotFound` for unknown ids.
    pub fn claim(&self, id: ClaimId) -> IdentityResult<IdentityClaim> {
        self.read(|tx| Ok(tx.claim(id)?.ok_or(ExecutionError::ClaimNotFound { id })?))
    }

    /// Associations pointing at the live principal `id` resolves to.
    ///
    /// # Errors
    ///
    /// Returns an execution error if the principal cannot be resolved.
    pub fn associations_for(&self, id: PrincipalId) -> IdentityResult<Vec<Association>> {
        self.read(|tx| {
            let principal = self.resolve_in(tx, id)?;
            Ok(tx.associations_for_principal(principal.id)?)
        })
    }

    /// Returns true if the two principals have been declared distinct.
    ///
    /// Both ids are resolved through merges, and a block recorded against
    /// any principal since merged into either side still applies.
    ///
    /// # Errors
    ///
    /// Returns an execution error if either principal cannot be resolved.
    pub fn is_blocked(&self, a: PrincipalId, b: PrincipalId) -> IdentityResult<bool> {
        self.read(|tx| {
            let first = self.resolve_in(tx, a)?;
            let second = self.resolve_in(tx, b)?;
            if first.id == second.id {
                return Ok(tx.is_blocked(a, b)?);
            }
            Self::blocked_between(tx, &first, &second)
        })
    }

    /// The full audit log in append order.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub fn events(&self) -> IdentityResult<Vec<ResolutionEvent>> {
        Ok(self.store.events()?)
    }

    /// Audit events that mention `id` on either side.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub fn events_for(&self, id: PrincipalId) -> IdentityResult<Vec<ResolutionEvent>> {
        Ok(self
            .store
            .events()?
            .into_iter()
            .filter(|e| e.involves(id))
            .collect())
    }

    /// Creates a confirmed principal from verified data.
    ///
    /// Every supplied identifier must normalize; verified writes never store
    /// unnormalized claims.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Unnormalized` or `ValidationError::DuplicateClaim`
    /// for bad identifiers.
    pub fn create_principal(&self, request: NewPrincipal) -> IdentityResult<Principal> {
        let mut principal = Principal::confirmed(request.display_name);
        let mut planned: Vec<(NewClaim, String)> = Vec::with_capacity(request.claims.len());
        let mut seen: BTreeSet<(Platform, String)> = BTreeSet::new();
        for claim in request.claims {
            let normalized = self.normalize_verified(&claim.platform, claim.kind, &claim.raw_value)?;
            if !seen.insert((claim.platform.clone(), normalized.clone())) {
                return Err(ValidationError::DuplicateClaim {
                    principal_id: principal.id,
                    platform: claim.platform,
                    normalized,
                }
                .into());
            }
            planned.push((claim, normalized));
        }

        principal.organization = request.organization.filter(|o| !o.trim().is_empty());
        principal.metadata = crate::claim::fold_metadata(&principal.metadata, &request.metadata)
            .ok_or_else(|| ValidationError::MissingField {
                field: "metadata (must be a JSON object)".to_string(),
            })?;

        let claims: Vec<IdentityClaim> = planned
            .into_iter()
            .map(|(c, normalized)| {
                let mut claim = IdentityClaim::new(
                    Some(principal.id),
                    c.platform,
                    c.kind,
                    c.raw_value,
                    Some(normalized),
                    c.confidence,
                );
                claim.fold_evidence(&serde_json::json!({ "verified": true }));
                claim
            })
            .collect();

        self.transact("create_principal", |tx| {
            tx.put_principal(principal.clone())?;
            for claim in &claims {
                tx.put_claim(claim.clone())?;
            }
            Ok(())
        })?;
        tracing::info!(
            principal = %principal.id,
            claims = claims.len(),
            "created confirmed principal"
        );
        Ok(principal)
    }

    /// Adds a verified claim to an existing principal.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::PrincipalMerged` for merged principals,
    /// `ValidationError::Unnormalized` if the value does not normalize, and
    /// `ValidationError::DuplicateClaim` if the principal already holds it.
    pub fn add_claim(
        &self,
        principal_id: PrincipalId,
        platform: &str,
        kind: IdentityKind,
        raw_value: &str,
        confidence: f32,
    ) -> IdentityResult<IdentityClaim> {
        let platform = Platform::new(platform)?;
        let confidence = Confidence::new(confidence)?;
        let normalized = self.normalize_verified(&platform, kind, raw_value)?;

        let claim = self.transact("add_claim", |tx| {
            let mut principal = Self::live_principal(tx, principal_id)?;
            let held = tx.claims_for_principal(principal_id)?;
            if held
                .iter()
                .any(|c| c.platform == platform && c.normalized.as_deref() == Some(&normalized))
            {
                return Err(ValidationError::DuplicateClaim {
                    principal_id,
                    platform: platform.clone(),
                    normalized: normalized.clone(),
                }
                .into());
            }
            let mut claim = IdentityClaim::new(
                Some(principal_id),
                platform.clone(),
                kind,
                raw_value,
                Some(normalized.clone()),
                confidence,
            );
            claim.fold_evidence(&serde_json::json!({ "verified": true }));
            tx.put_claim(claim.clone())?;
            principal.touch();
            tx.put_principal(principal)?;
            Ok(claim)
        })?;
        tracing::info!(principal = %principal_id, claim = %claim.id, "added verified claim");
        Ok(claim)
    }

    /// Replaces a principal's display name and records the change.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` for a blank name,
    /// `ValidationError::FieldTooLong` for an overlong one, and
    /// `ValidationError::PrincipalMerged` for merged principals.
    pub fn rename_principal(
        &self,
        id: PrincipalId,
        display_name: &str,
        actor: Actor,
    ) -> IdentityResult<ResolutionEvent> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "display_name".to_string(),
            }
            .into());
        }
        if name.len() > ObservationBatch::MAX_DISPLAY_NAME_LEN {
            return Err(ValidationError::FieldTooLong {
                field: "display_name".to_string(),
                max_length: ObservationBatch::MAX_DISPLAY_NAME_LEN,
            }
            .into());
        }

        let event = self.transact("rename_principal", |tx| {
            let mut principal = Self::live_principal(tx, id)?;
            let before = principal.display_name.replace(name.to_string());
            principal.touch();
            tx.put_principal(principal)?;
            let event = ResolutionEvent::new(
                actor.clone(),
                ResolutionAction::Update,
                Vec::new(),
                id,
                "display name changed",
                serde_json::json!({
                    "field": "display_name",
                    "before": before,
                    "after": name,
                }),
            )?;
            tx.append_event(event.clone())?;
            Ok(event)
        })?;
        tracing::info!(principal = %id, actor = %event.actor, "renamed principal");
        Ok(event)
    }

    /// Corrects the value, platform or confidence of a principal's claim.
    ///
    /// A new value must normalize. The claim may not end up duplicating
    /// another claim of the same principal on the same platform. The change
    /// is recorded with before and after snapshots.
    ///
    /// # Errors
    ///
    /// - `ValidationError::MissingField` for an empty update
    /// - `ValidationError::ClaimNotOwned` if the claim belongs elsewhere
    /// - `ValidationError::Unnormalized` if the new value does not normalize
    /// - `ValidationError::DuplicateClaim` if the result would be a duplicate
    pub fn update_claim(
        &self,
        principal_id: PrincipalId,
        claim_id: ClaimId,
        update: ClaimUpdate,
        actor: Actor,
    ) -> IdentityResult<IdentityClaim> {
        if update.is_empty() {
            return Err(ValidationError::MissingField {
                field: "claim update".to_string(),
            }
            .into());
        }
        let platform = update.platform.as_deref().map(Platform::new).transpose()?;
        let confidence = update.confidence.map(Confidence::new).transpose()?;

        let claim = self.transact("update_claim", |tx| {
            let mut principal = Self::live_principal(tx, principal_id)?;
            let mut claim = tx
                .claim(claim_id)?
                .ok_or(ExecutionError::ClaimNotFound { id: claim_id })?;
            if claim.principal_id != Some(principal_id) {
                return Err(ValidationError::ClaimNotOwned {
                    claim_id,
                    principal_id,
                }
                .into());
            }
            let before = claim_snapshot(&claim);

            if let Some(platform) = &platform {
                claim.platform = platform.clone();
            }
            if let Some(raw_value) = &update.raw_value {
                claim.normalized =
                    Some(self.normalize_verified(&claim.platform, claim.kind, raw_value)?);
                claim.raw_value = raw_value.trim().to_string();
            }
            if let Some(confidence) = confidence {
                claim.confidence = confidence;
            }

            if let Some(normalized) = &claim.normalized {
                let clash = tx.claims_for_principal(principal_id)?.into_iter().any(|c| {
                    c.id != claim_id
                        && c.platform == claim.platform
                        && c.normalized.as_deref() == Some(normalized.as_str())
                });
                if clash {
                    return Err(ValidationError::DuplicateClaim {
                        principal_id,
                        platform: claim.platform.clone(),
                        normalized: normalized.clone(),
                    }
                    .into());
                }
            }

            claim.last_seen = Utc::now();
            tx.put_claim(claim.clone())?;
            principal.touch();
            tx.put_principal(principal)?;
            tx.append_event(ResolutionEvent::new(
                actor.clone(),
                ResolutionAction::Update,
                Vec::new(),
                principal_id,
                "claim corrected",
                serde_json::json!({
                    "claim_id": claim_id,
                    "before": before,
                    "after": claim_snapshot(&claim),
                }),
            )?)?;
            Ok(claim)
        })?;
        tracing::info!(
            principal = %principal_id,
            claim = %claim_id,
            actor = %actor,
            "updated claim"
        );
        Ok(claim)
    }

    /// Promotes a provisional principal to confirmed.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::PrincipalMerged` for merged principals.
    pub fn confirm_principal(&self, id: PrincipalId) -> IdentityResult<Principal> {
        self.transact("confirm_principal", |tx| {
            let mut principal = Self::live_principal(tx, id)?;
            if principal.confirm() {
                tx.put_principal(principal.clone())?;
            }
            Ok(principal)
        })
    }

    /// Attaches an unnormalized claim to a principal after manual review.
    ///
    /// `normalized_override` supplies a corrected value; it is run through the
    /// normalizer and must normalize. Without it the raw value is tried again
    /// and, if it still fails, the claim is attached unnormalized. The matching
    /// review item is marked resolved.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ClaimAlreadyAttached` if the claim already has
    /// an owner, and `ValidationError::DuplicateClaim` if the principal already
    /// holds the value.
    pub fn attach_unnormalized(
        &self,
        claim_id: ClaimId,
        principal_id: PrincipalId,
        normalized_override: Option<&str>,
        actor: Actor,
    ) -> IdentityResult<ResolutionEvent> {
        let event = self.transact("attach_unnormalized", |tx| {
            let mut claim = tx
                .claim(claim_id)?
                .ok_or(ExecutionError::ClaimNotFound { id: claim_id })?;
            if claim.principal_id.is_some() {
                return Err(ValidationError::ClaimAlreadyAttached { claim_id }.into());
            }
            let principal = self.resolve_in(tx, principal_id)?;

            let normalized = match normalized_override {
                Some(value) => Some(self.normalize_verified(&claim.platform, claim.kind, value)?),
                None => self.normalize(&claim.platform, claim.kind, &claim.raw_value),
            };
            if let Some(normalized) = &normalized {
                let held = tx.claims_for_principal(principal.id)?;
                if held.iter().any(|c| {
                    c.platform == claim.platform && c.normalized.as_deref() == Some(normalized)
                }) {
                    return Err(ValidationError::DuplicateClaim {
                        principal_id: principal.id,
                        platform: claim.platform.clone(),
                        normalized: normalized.clone(),
                    }
                    .into());
                }
            }

            claim.principal_id = Some(principal.id);
            claim.normalized = normalized.clone();
            tx.put_claim(claim)?;

            let event = ResolutionEvent::new(
                actor.clone(),
                ResolutionAction::Attach,
                Vec::new(),
                principal.id,
                "manual attach of unnormalized claim",
                serde_json::json!({
                    "claim_id": claim_id,
                    "normalized": normalized,
                }),
            )?;
            tx.append_event(event.clone())?;

            for item in tx.pending_reviews()? {
                if matches!(item.payload, ReviewPayload::UnnormalizedClaim { claim_id: c } if c == claim_id)
                {
                    tx.resolve_review(item.id, format!("attached to {}", principal.id))?;
                }
            }
            Ok(event)
        })?;
        tracing::info!(
            claim = %claim_id,
            principal = %event.to_principal,
            actor = %event.actor,
            "attached unnormalized claim"
        );
        Ok(event)
    }

    /// Records a downstream association (message, media, document).
    ///
    /// Idempotent per `(principal, target)`: a repeat call merges evidence and
    /// keeps the higher confidence. Evidence claims must belong to the principal.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ClaimNotOwned` for foreign evidence claims.
    pub fn link_association(
        &self,
        principal_id: PrincipalId,
        target: AssociationTarget,
        evidence: &[ClaimId],
        confidence: f32,
    ) -> IdentityResult<Association> {
        let confidence = Confidence::new(confidence)?;
        self.transact("link_association", |tx| {
            let principal = self.resolve_in(tx, principal_id)?;
            for claim_id in evidence {
                let claim = tx
                    .claim(*claim_id)?
                    .ok_or(ExecutionError::ClaimNotFound { id: *claim_id })?;
                if claim.principal_id != Some(principal.id) {
                    return Err(ValidationError::ClaimNotOwned {
                        claim_id: *claim_id,
                        principal_id: principal.id,
                    }
                    .into());
                }
            }
            let incoming =
                Association::new(principal.id, target.clone(), confidence, evidence.iter().copied());
            let association = match tx
                .associations_for_principal(principal.id)?
                .into_iter()
                .find(|a| a.target == target)
            {
                Some(mut existing) => {
                    existing.absorb(&incoming);
                    existing
                }
                None => incoming,
            };
            tx.put_association(association.clone())?;
            Ok(association)
        })
    }

    /// Finite iterator over pending review items, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub fn drain_manual_review_queue(&self) -> IdentityResult<ReviewDrain<'_>> {
        self.drain_manual_review_queue_after(0)
    }

    /// Like [`Self::drain_manual_review_queue`], resuming after sequence `seq`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub fn drain_manual_review_queue_after(&self, seq: u64) -> IdentityResult<ReviewDrain<'_>> {
        Ok(ReviewDrain::new(self.store.as_ref(), seq)?)
    }

    /// Marks a review item handled. Resolving twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::ReviewItemNotFound` for unknown ids.
    pub fn resolve_review_item(&self, id: ReviewItemId, note: &str) -> IdentityResult<()> {
        self.transact("resolve_review_item", |tx| {
            let item = tx
                .review_item(id)?
                .ok_or(ExecutionError::ReviewItemNotFound { id })?;
            if item.is_pending() {
                tx.resolve_review(id, note.to_string())?;
            }
            Ok(())
        })?;
        tracing::debug!(review_item = %id, "review item resolved");
        Ok(())
    }
}

/// Keys of the normalized claims in `claims`.
fn key_set(claims: &[IdentityClaim]) -> BTreeSet<ClaimKey> {
    claims.iter().filter_map(IdentityClaim::key).collect()
}
