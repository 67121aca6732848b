//! In-memory storage backend.
//!
//! A thread-safe, optimistic implementation of [`IdentityStore`] for embedded
//! use, tests, and as a reference for durable backends.
//!
//! Every committed write bumps a version counter for each item it touches
//! (the record itself plus the lookup indexes it lives in). A transaction
//! remembers the version of everything it read; commit re-checks those
//! versions under the write lock and refuses with
//! [`StorageError::WriteConflict`] if any moved. The state lock is held only
//! for a single read or for the commit itself.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use crate::association::{Association, AssociationId};
use crate::audit::{ordered_pair, ResolutionEvent};
use crate::claim::{ClaimId, ClaimKey, IdentityClaim, IdentityKind, UniqueKey};
use crate::principal::{Principal, PrincipalId};
use crate::review::{ReviewItem, ReviewItemId, ReviewStatus};
use crate::storage::traits::{IdentityStore, StorageError, StoreTransaction};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// What a transaction observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ReadKey {
    Principal(PrincipalId),
    Claim(ClaimId),
    ClaimKey(ClaimKey),
    ClaimValue(IdentityKind, String),
    PrincipalNames,
    PrincipalClaims(PrincipalId),
    PrincipalAssociations(PrincipalId),
    Blocks,
    Reviews,
}

#[derive(Debug, Default)]
struct GraphState {
    principals: HashMap<PrincipalId, Principal>,
    claims: HashMap<ClaimId, IdentityClaim>,
    claims_by_key: HashMap<ClaimKey, BTreeSet<ClaimId>>,
    claims_by_principal: HashMap<PrincipalId, BTreeSet<ClaimId>>,
    unique: HashMap<UniqueKey, ClaimId>,
    associations: HashMap<AssociationId, Association>,
    associations_by_principal: HashMap<PrincipalId, BTreeSet<AssociationId>>,
    events: Vec<ResolutionEvent>,
    blocks: HashSet<(PrincipalId, PrincipalId)>,
    reviews: BTreeMap<u64, ReviewItem>,
    review_seq: HashMap<ReviewItemId, u64>,
    last_review_seq: u64,
    versions: HashMap<ReadKey, u64>,
    commit_seq: u64,
}

impl GraphState {
    fn version(&self, key: &ReadKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: ReadKey) {
        self.versions.insert(key, self.commit_seq);
    }

    fn index_claim(&mut self, claim: &IdentityClaim) {
        if let Some(key) = claim.key() {
            self.claims_by_key.entry(key).or_default().insert(claim.id);
        }
        if let Some(principal_id) = claim.principal_id {
            self.claims_by_principal
                .entry(principal_id)
                .or_default()
                .insert(claim.id);
        }
        if let Some(unique) = claim.unique_key() {
            self.unique.insert(unique, claim.id);
        }
    }

    fn unindex_claim(&mut self, claim: &IdentityClaim) {
        if let Some(key) = claim.key() {
            if let Some(ids) = self.claims_by_key.get_mut(&key) {
                ids.remove(&claim.id);
                if ids.is_empty() {
                    self.claims_by_key.remove(&key);
                }
            }
        }
        if let Some(principal_id) = claim.principal_id {
            if let Some(ids) = self.claims_by_principal.get_mut(&principal_id) {
                ids.remove(&claim.id);
            }
        }
        if let Some(unique) = claim.unique_key() {
            if self.unique.get(&unique) == Some(&claim.id) {
                self.unique.remove(&unique);
            }
        }
    }

    fn touch_claim(&mut self, claim: &IdentityClaim) {
        self.bump(ReadKey::Claim(claim.id));
        if let Some(key) = claim.key() {
            self.bump(ReadKey::ClaimValue(key.kind, key.normalized.clone()));
            self.bump(ReadKey::ClaimKey(key));
        }
        if let Some(principal_id) = claim.principal_id {
            self.bump(ReadKey::PrincipalClaims(principal_id));
        }
    }

    fn append_review(&mut self, mut item: ReviewItem) -> ReviewItemId {
        self.last_review_seq += 1;
        item.seq = self.last_review_seq;
        let id = item.id;
        self.review_seq.insert(id, item.seq);
        self.reviews.insert(item.seq, item);
        id
    }
}

/// Thread-safe in-memory principal graph.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    state: RwLock<GraphState>,
}

impl InMemoryIdentityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of principals, merged ones included.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BackendError` if the lock is poisoned.
    pub fn principal_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("principal_count"))?;
        Ok(state.principals.len())
    }

    /// Number of stored claims, unattached ones included.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BackendError` if the lock is poisoned.
    pub fn claim_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("claim_count"))?;
        Ok(state.claims.len())
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StorageError> {
        Ok(Box::new(MemoryTransaction::new(self)))
    }

    fn events(&self) -> Result<Vec<ResolutionEvent>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("events"))?;
        Ok(state.events.clone())
    }

    fn review_high_water(&self) -> Result<u64, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review_high_water"))?;
        Ok(state.last_review_seq)
    }

    fn pending_review_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ReviewItem>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("pending_review_after"))?;
        Ok(state
            .reviews
            .range(after.saturating_add(1)..)
            .map(|(_, item)| item)
            .filter(|item| item.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    fn enqueue_review_once(&self, item: ReviewItem) -> Result<ReviewItemId, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("enqueue_review_once"))?;
        if let Some(existing) = state
            .reviews
            .values()
            .find(|queued| queued.is_pending() && queued.payload.same_subject(&item.payload))
        {
            return Ok(existing.id);
        }
        state.commit_seq += 1;
        state.bump(ReadKey::Reviews);
        Ok(state.append_review(item))
    }
}

/// Buffered writes plus the read set of one transaction.
struct MemoryTransaction<'a> {
    store: &'a InMemoryIdentityStore,
    read_set: HashMap<ReadKey, u64>,
    principals: HashMap<PrincipalId, Principal>,
    claims: HashMap<ClaimId, Option<IdentityClaim>>,
    associations: HashMap<AssociationId, Option<Association>>,
    events: Vec<ResolutionEvent>,
    enqueued: Vec<ReviewItem>,
    resolved: HashMap<ReviewItemId, ReviewStatus>,
}

impl<'a> MemoryTransaction<'a> {
    fn new(store: &'a InMemoryIdentityStore) -> Self {
        Self {
            store,
            read_set: HashMap::new(),
            principals: HashMap::new(),
            claims: HashMap::new(),
            associations: HashMap::new(),
            events: Vec::new(),
            enqueued: Vec::new(),
            resolved: HashMap::new(),
        }
    }

    fn observe(read_set: &mut HashMap<ReadKey, u64>, state: &GraphState, key: ReadKey) {
        let version = state.version(&key);
        read_set.entry(key).or_insert(version);
    }

    fn overlay_review(&self, mut item: ReviewItem) -> ReviewItem {
        if let Some(status) = self.resolved.get(&item.id) {
            item.status = status.clone();
        }
        item
    }
}

fn sort_claims(claims: &mut [IdentityClaim]) {
    claims.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.id.cmp(&b.id)));
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn principal(&mut self, id: PrincipalId) -> Result<Option<Principal>, StorageError> {
        if let Some(p) = self.principals.get(&id) {
            return Ok(Some(p.clone()));
        }
        let state = self.store.state.read().map_err(|_| lock_err("principal"))?;
        Self::observe(&mut self.read_set, &state, ReadKey::Principal(id));
        Ok(state.principals.get(&id).cloned())
    }

    fn claim(&mut self, id: ClaimId) -> Result<Option<IdentityClaim>, StorageError> {
        if let Some(entry) = self.claims.get(&id) {
            return Ok(entry.clone());
        }
        let state = self.store.state.read().map_err(|_| lock_err("claim"))?;
        Self::observe(&mut self.read_set, &state, ReadKey::Claim(id));
        Ok(state.claims.get(&id).cloned())
    }

    fn claims_by_key(&mut self, key: &ClaimKey) -> Result<Vec<IdentityClaim>, StorageError> {
        let mut out: Vec<IdentityClaim> = {
            let state = self.store.state.read().map_err(|_| lock_err("claims_by_key"))?;
            Self::observe(&mut self.read_set, &state, ReadKey::ClaimKey(key.clone()));
            state
                .claims_by_key
                .get(key)
                .into_iter()
                .flatten()
                .filter(|id| !self.claims.contains_key(*id))
                .filter_map(|id| state.claims.get(id).cloned())
                .collect()
        };
        out.extend(
            self.claims
                .values()
                .flatten()
                .filter(|c| c.key().as_ref() == Some(key))
                .cloned(),
        );
        sort_claims(&mut out);
        Ok(out)
    }

    fn claims_by_value(
        &mut self,
        kind: IdentityKind,
        normalized: &str,
    ) -> Result<Vec<IdentityClaim>, StorageError> {
        let matches = |key: &ClaimKey| key.kind == kind && key.normalized == normalized;
        let mut out: Vec<IdentityClaim> = {
            let state = self
                .store
                .state
                .read()
                .map_err(|_| lock_err("claims_by_value"))?;
            Self::observe(
                &mut self.read_set,
                &state,
                ReadKey::ClaimValue(kind, normalized.to_string()),
            );
            state
                .claims_by_key
                .iter()
                .filter(|(key, _)| matches(*key))
                .flat_map(|(_, ids)| ids)
                .filter(|id| !self.claims.contains_key(*id))
                .filter_map(|id| state.claims.get(id).cloned())
                .collect()
        };
        out.extend(
            self.claims
                .values()
                .flatten()
                .filter(|c| c.key().is_some_and(|k| matches(&k)))
                .cloned(),
        );
        sort_claims(&mut out);
        Ok(out)
    }

    fn principals_named(&mut self, fragment: &str) -> Result<Vec<Principal>, StorageError> {
        let needle = fragment.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let named = |p: &Principal| {
            p.display_name
                .as_ref()
                .is_some_and(|n| n.to_lowercase().contains(&needle))
        };
        let mut out: Vec<Principal> = {
            let state = self
                .store
                .state
                .read()
                .map_err(|_| lock_err("principals_named"))?;
            Self::observe(&mut self.read_set, &state, ReadKey::PrincipalNames);
            state
                .principals
                .values()
                .filter(|p| !self.principals.contains_key(&p.id))
                .filter(|&p| named(p))
                .cloned()
                .collect()
        };
        out.extend(self.principals.values().filter(|&p| named(p)).cloned());
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn claims_for_principal(
        &mut self,
        id: PrincipalId,
    ) -> Result<Vec<IdentityClaim>, StorageError> {
        let mut out: Vec<IdentityClaim> = {
            let state = self
                .store
                .state
                .read()
                .map_err(|_| lock_err("claims_for_principal"))?;
            Self::observe(&mut self.read_set, &state, ReadKey::PrincipalClaims(id));
            state
                .claims_by_principal
                .get(&id)
                .into_iter()
                .flatten()
                .filter(|cid| !self.claims.contains_key(*cid))
                .filter_map(|cid| state.claims.get(cid).cloned())
                .collect()
        };
        out.extend(
            self.claims
                .values()
                .flatten()
                .filter(|c| c.principal_id == Some(id))
                .cloned(),
        );
        sort_claims(&mut out);
        Ok(out)
    }

    fn associations_for_principal(
        &mut self,
        id: PrincipalId,
    ) -> Result<Vec<Association>, StorageError> {
        let mut out: Vec<Association> = {
            let state = self
                .store
                .state
                .read()
                .map_err(|_| lock_err("associations_for_principal"))?;
            Self::observe(
                &mut self.read_set,
                &state,
                ReadKey::PrincipalAssociations(id),
            );
            state
                .associations_by_principal
                .get(&id)
                .into_iter()
                .flatten()
                .filter(|aid| !self.associations.contains_key(*aid))
                .filter_map(|aid| state.associations.get(aid).cloned())
                .collect()
        };
        out.extend(
            self.associations
                .values()
                .flatten()
                .filter(|a| a.principal_id == id)
                .cloned(),
        );
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    fn is_blocked(&mut self, a: PrincipalId, b: PrincipalId) -> Result<bool, StorageError> {
        let pair = ordered_pair(a, b);
        if self
            .events
            .iter()
            .any(|e| e.blocked_pair() == Some(pair))
        {
            return Ok(true);
        }
        let state = self.store.state.read().map_err(|_| lock_err("is_blocked"))?;
        Self::observe(&mut self.read_set, &state, ReadKey::Blocks);
        Ok(state.blocks.contains(&pair))
    }

    fn review_item(&mut self, id: ReviewItemId) -> Result<Option<ReviewItem>, StorageError> {
        if let Some(item) = self.enqueued.iter().find(|i| i.id == id) {
            return Ok(Some(item.clone()));
        }
        let found = {
            let state = self.store.state.read().map_err(|_| lock_err("review_item"))?;
            Self::observe(&mut self.read_set, &state, ReadKey::Reviews);
            state
                .review_seq
                .get(&id)
                .and_then(|seq| state.reviews.get(seq))
                .cloned()
        };
        Ok(found.map(|item| self.overlay_review(item)))
    }

    fn pending_reviews(&mut self) -> Result<Vec<ReviewItem>, StorageError> {
        let committed: Vec<ReviewItem> = {
            let state = self
                .store
                .state
                .read()
                .map_err(|_| lock_err("pending_reviews"))?;
            Self::observe(&mut self.read_set, &state, ReadKey::Reviews);
            state
                .reviews
                .values()
                .filter(|item| item.is_pending())
                .cloned()
                .collect()
        };
        Ok(committed
            .into_iter()
            .map(|item| self.overlay_review(item))
            .chain(self.enqueued.iter().cloned())
            .filter(ReviewItem::is_pending)
            .collect())
    }

    fn put_principal(&mut self, principal: Principal) -> Result<(), StorageError> {
        self.principals.insert(principal.id, principal);
        Ok(())
    }

    fn put_claim(&mut self, claim: IdentityClaim) -> Result<(), StorageError> {
        self.claims.insert(claim.id, Some(claim));
        Ok(())
    }

    fn delete_claim(&mut self, id: ClaimId) -> Result<(), StorageError> {
        if self.claim(id)?.is_none() {
            return Err(StorageError::ClaimNotFound(id));
        }
        self.claims.insert(id, None);
        Ok(())
    }

    fn put_association(&mut self, association: Association) -> Result<(), StorageError> {
        self.associations.insert(association.id, Some(association));
        Ok(())
    }

    fn delete_association(&mut self, id: AssociationId) -> Result<(), StorageError> {
        let exists = match self.associations.get(&id) {
            Some(entry) => entry.is_some(),
            None => {
                let state = self
                    .store
                    .state
                    .read()
                    .map_err(|_| lock_err("delete_association"))?;
                state.associations.contains_key(&id)
            }
        };
        if !exists {
            return Err(StorageError::AssociationNotFound(id));
        }
        self.associations.insert(id, None);
        Ok(())
    }

    fn append_event(&mut self, event: ResolutionEvent) -> Result<(), StorageError> {
        self.events.push(event);
        Ok(())
    }

    fn enqueue_review(&mut self, item: ReviewItem) -> Result<ReviewItemId, StorageError> {
        let id = item.id;
        self.enqueued.push(item);
        Ok(id)
    }

    fn resolve_review(&mut self, id: ReviewItemId, note: String) -> Result<(), StorageError> {
        let status = ReviewStatus::Resolved {
            resolved_at: chrono::Utc::now(),
            note,
        };
        if let Some(item) = self.enqueued.iter_mut().find(|i| i.id == id) {
            item.status = status;
            return Ok(());
        }
        if self.review_item(id)?.is_none() {
            return Err(StorageError::ReviewItemNotFound(id));
        }
        self.resolved.insert(id, status);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTransaction {
            store,
            read_set,
            principals,
            claims,
            associations,
            events,
            enqueued,
            resolved,
        } = *self;

        let mut state = store.state.write().map_err(|_| lock_err("commit"))?;

        for (key, seen) in &read_set {
            if state.version(key) != *seen {
                return Err(StorageError::WriteConflict(format!(
                    "{key:?} changed since it was read"
                )));
            }
        }

        let mut staged_unique: HashMap<UniqueKey, ClaimId> = HashMap::new();
        for claim in claims.values().flatten() {
            let Some(unique) = claim.unique_key() else {
                continue;
            };
            if let Some(existing) = state.unique.get(&unique) {
                if *existing != claim.id && !claims.contains_key(existing) {
                    return Err(StorageError::UniqueViolation(unique));
                }
            }
            if staged_unique.insert(unique.clone(), claim.id).is_some() {
                return Err(StorageError::UniqueViolation(unique));
            }
        }

        for id in resolved.keys() {
            if !state.review_seq.contains_key(id) {
                return Err(StorageError::ReviewItemNotFound(*id));
            }
        }

        // Validation passed; from here on nothing fails.
        state.commit_seq += 1;

        if !principals.is_empty() {
            state.bump(ReadKey::PrincipalNames);
        }
        for (id, principal) in principals {
            state.bump(ReadKey::Principal(id));
            state.principals.insert(id, principal);
        }

        for (id, claim) in claims {
            if let Some(old) = state.claims.remove(&id) {
                state.unindex_claim(&old);
                state.touch_claim(&old);
            }
            state.bump(ReadKey::Claim(id));
            if let Some(claim) = claim {
                state.index_claim(&claim);
                state.touch_claim(&claim);
                state.claims.insert(id, claim);
            }
        }

        for (id, association) in associations {
            if let Some(old) = state.associations.remove(&id) {
                if let Some(ids) = state.associations_by_principal.get_mut(&old.principal_id) {
                    ids.remove(&id);
                }
                state.bump(ReadKey::PrincipalAssociations(old.principal_id));
            }
            if let Some(association) = association {
                state
                    .associations_by_principal
                    .entry(association.principal_id)
                    .or_default()
                    .insert(id);
                state.bump(ReadKey::PrincipalAssociations(association.principal_id));
                state.associations.insert(id, association);
            }
        }

        for event in events {
            if let Some(pair) = event.blocked_pair() {
                state.blocks.insert(pair);
                state.bump(ReadKey::Blocks);
            }
            state.events.push(event);
        }

        if !resolved.is_empty() || !enqueued.is_empty() {
            state.bump(ReadKey::Reviews);
        }
        for (id, status) in resolved {
            if let Some(seq) = state.review_seq.get(&id).copied() {
                if let Some(item) = state.reviews.get_mut(&seq) {
                    item.status = status;
                }
            }
        }
        for item in enqueued {
            state.append_review(item);
        }

        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}
