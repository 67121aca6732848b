//! Finding a principal from whatever a caller knows about the person.

use std::collections::BTreeMap;

use super::IdentityEngine;
use crate::claim::{IdentityKind, Platform};
use crate::error::{IdentityResult, ValidationError};
use crate::principal::{Principal, PrincipalId};
use crate::storage::StoreTransaction;

/// Identifier kinds in the order the selector trusts them.
const PRIORITY: [IdentityKind; 6] = [
    IdentityKind::Email,
    IdentityKind::Phone,
    IdentityKind::Username,
    IdentityKind::ContactId,
    IdentityKind::MemoryUrl,
    IdentityKind::PersonUuid,
];

fn rank(kind: IdentityKind) -> usize {
    PRIORITY
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(PRIORITY.len())
}

/// A loose description of a person: an id, identifiers, a name, or any mix.
///
/// # Examples
///
/// ```
/// use principal_graph::{IdentityKind, PrincipalSelector};
///
/// let selector = PrincipalSelector::by_name("Ada")
///     .with_identifier(IdentityKind::Email, "ada@example.com");
/// assert_eq!(selector.identifiers.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalSelector {
    /// Principal id; merged ids are followed to their successor.
    pub id: Option<PrincipalId>,
    /// Identifiers matched on any platform.
    pub identifiers: Vec<(IdentityKind, String)>,
    /// Display name, matched exactly first and then as a fragment.
    pub name: Option<String>,
}

impl PrincipalSelector {
    /// Selects by principal id.
    #[must_use]
    pub fn by_id(id: PrincipalId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Selects by one identifier.
    #[must_use]
    pub fn by_identifier(kind: IdentityKind, value: impl Into<String>) -> Self {
        Self::default().with_identifier(kind, value)
    }

    /// Selects by display name.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Adds an identifier.
    #[must_use]
    pub fn with_identifier(mut self, kind: IdentityKind, value: impl Into<String>) -> Self {
        self.identifiers.push((kind, value.into()));
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.identifiers.iter().all(|(_, v)| v.trim().is_empty())
            && self.name.as_deref().map_or(true, |n| n.trim().is_empty())
    }

    fn ranked(&self) -> Vec<(IdentityKind, &str)> {
        let mut ranked: Vec<(IdentityKind, &str)> = self
            .identifiers
            .iter()
            .map(|(kind, value)| (*kind, value.as_str()))
            .collect();
        ranked.sort_by_key(|(kind, _)| rank(*kind));
        ranked
    }
}

/// Result of [`IdentityEngine::find_principal`].
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Exactly one live principal fits.
    Found(Principal),
    /// Several live principals fit; the caller has to choose.
    Ambiguous(Vec<Principal>),
    /// Nothing fits.
    NotFound,
}

impl Selection {
    /// The selected principal, if exactly one fits.
    #[must_use]
    pub const fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Found(principal) => Some(principal),
            _ => None,
        }
    }

    fn from_candidates(candidates: BTreeMap<PrincipalId, Principal>) -> Self {
        let mut candidates: Vec<Principal> = candidates.into_values().collect();
        match candidates.len() {
            0 => Self::NotFound,
            1 => candidates.pop().map_or(Self::NotFound, Self::Found),
            _ => Self::Ambiguous(candidates),
        }
    }
}

impl IdentityEngine {
    /// Finds the live principal a selector describes.
    ///
    /// A known id wins outright. Otherwise identifiers are tried from the
    /// most to the least reliable kind (email, phone, username, contact id,
    /// memory URL, photo person id, then the rest), each narrowing the set of
    /// principals the earlier ones matched. The display name breaks remaining
    /// ties, or is the only evidence when no identifier matches anything.
    ///
    /// Identifiers that point at disjoint principals, and ties nothing can
    /// break, come back as [`Selection::Ambiguous`].
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` for an empty selector and an
    /// execution error if successor resolution fails.
    pub fn find_principal(&self, selector: &PrincipalSelector) -> IdentityResult<Selection> {
        if selector.is_empty() {
            return Err(ValidationError::MissingField {
                field: "selector".to_string(),
            }
            .into());
        }
        self.read(|tx| {
            if let Some(id) = selector.id {
                if tx.principal(id)?.is_some() {
                    return Ok(Selection::Found(self.resolve_in(tx, id)?));
                }
                tracing::debug!(principal = %id, "selector id unknown; trying identifiers");
            }

            let mut narrowed: Option<BTreeMap<PrincipalId, Principal>> = None;
            let mut matched = BTreeMap::new();
            for (kind, value) in selector.ranked() {
                let owners = self.owners_of(tx, kind, value)?;
                if owners.is_empty() {
                    continue;
                }
                matched.extend(owners.iter().map(|(id, p)| (*id, p.clone())));
                narrowed = Some(match narrowed {
                    None => owners,
                    Some(mut current) => {
                        current.retain(|id, _| owners.contains_key(id));
                        if current.is_empty() {
                            tracing::info!(
                                %kind,
                                matched = matched.len(),
                                "selector identifiers disagree"
                            );
                            return Ok(Selection::Ambiguous(matched.into_values().collect()));
                        }
                        current
                    }
                });
            }

            match (narrowed, selector.name.as_deref()) {
                (Some(found), _) if found.len() == 1 => Ok(Selection::from_candidates(found)),
                (Some(found), Some(name)) => {
                    let wanted = self.name_key(name);
                    let named: BTreeMap<PrincipalId, Principal> = found
                        .iter()
                        .filter(|(_, p)| wanted.is_some() && self.name_key_of(p) == wanted)
                        .map(|(id, p)| (*id, p.clone()))
                        .collect();
                    if named.len() == 1 {
                        Ok(Selection::from_candidates(named))
                    } else {
                        Ok(Selection::from_candidates(found))
                    }
                }
                (Some(found), None) => Ok(Selection::from_candidates(found)),
                (None, Some(name)) => self.select_by_name(tx, name),
                (None, None) => Ok(Selection::NotFound),
            }
        })
    }

    /// Live principals holding `value` as `kind` on any platform.
    fn owners_of(
        &self,
        tx: &mut dyn StoreTransaction,
        kind: IdentityKind,
        value: &str,
    ) -> IdentityResult<BTreeMap<PrincipalId, Principal>> {
        let platform = Platform::new(kind.as_str())?;
        let Some(normalized) = self.normalize(&platform, kind, value) else {
            return Ok(BTreeMap::new());
        };
        let mut owners = BTreeMap::new();
        for claim in tx.claims_by_value(kind, &normalized)? {
            if let Some(owner) = claim.principal_id {
                let principal = self.resolve_in(tx, owner)?;
                owners.insert(principal.id, principal);
            }
        }
        Ok(owners)
    }

    /// Exact name (display name or a name claim) first, then fragment match.
    fn select_by_name(
        &self,
        tx: &mut dyn StoreTransaction,
        name: &str,
    ) -> IdentityResult<Selection> {
        let Some(wanted) = self.name_key(name) else {
            return Ok(Selection::NotFound);
        };
        let mut exact = self.owners_of(tx, IdentityKind::DisplayName, name)?;
        exact.extend(self.owners_of(tx, IdentityKind::Alias, name)?);

        let mut partial = BTreeMap::new();
        for record in tx.principals_named(name.trim())? {
            let principal = self.resolve_in(tx, record.id)?;
            if self.name_key_of(&principal).as_deref() == Some(wanted.as_str()) {
                exact.insert(principal.id, principal);
            } else {
                partial.insert(principal.id, principal);
            }
        }
        if exact.is_empty() {
            Ok(Selection::from_candidates(partial))
        } else {
            Ok(Selection::from_candidates(exact))
        }
    }

    fn name_key(&self, name: &str) -> Option<String> {
        let platform = Platform::new(IdentityKind::DisplayName.as_str()).ok()?;
        self.normalize(&platform, IdentityKind::DisplayName, name)
    }

    fn name_key_of(&self, principal: &Principal) -> Option<String> {
        principal
            .display_name
            .as_deref()
            .and_then(|n| self.name_key(n))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::{NewClaim, NewPrincipal};
    use crate::storage::InMemoryIdentityStore;

    fn engine() -> IdentityEngine {
        IdentityEngine::new(Arc::new(InMemoryIdentityStore::new()))
    }

    fn person(engine: &IdentityEngine, name: &str, claims: &[(&str, IdentityKind, &str)]) -> PrincipalId {
        let request = claims.iter().fold(NewPrincipal::named(name), |r, (p, k, v)| {
            r.with_claim(NewClaim::new(p, *k, *v, 0.9).unwrap())
        });
        engine.create_principal(request).unwrap().id
    }

    #[test]
    fn test_empty_selector_is_rejected() {
        let engine = engine();
        let err = engine
            .find_principal(&PrincipalSelector::by_name("  "))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_identifier_matches_on_any_platform() {
        let engine = engine();
        let ada = person(&engine, "Ada", &[("gmail", IdentityKind::Email, "ada@example.com")]);
        let found = engine
            .find_principal(&PrincipalSelector::by_identifier(
                IdentityKind::Email,
                "ADA@example.com",
            ))
            .unwrap();
        assert_eq!(found.principal().map(|p| p.id), Some(ada));
    }

    #[test]
    fn test_unknown_id_falls_back_to_identifiers() {
        let engine = engine();
        let ada = person(&engine, "Ada", &[("sms", IdentityKind::Phone, "+1 415 555 2671")]);
        let selector = PrincipalSelector::by_id(PrincipalId::new())
            .with_identifier(IdentityKind::Phone, "(415) 555-2671");
        let found = engine.find_principal(&selector).unwrap();
        assert_eq!(found.principal().map(|p| p.id), Some(ada));
    }

    #[test]
    fn test_shared_identifier_is_ambiguous_until_narrowed() {
        let engine = engine();
        let a = person(
            &engine,
            "Alice",
            &[
                ("email", IdentityKind::Email, "team@example.com"),
                ("chat", IdentityKind::Username, "alice"),
            ],
        );
        let b = person(&engine, "Bob", &[("email", IdentityKind::Email, "team@example.com")]);

        let shared = PrincipalSelector::by_identifier(IdentityKind::Email, "team@example.com");
        let Selection::Ambiguous(candidates) = engine.find_principal(&shared).unwrap() else {
            panic!("expected ambiguity");
        };
        let ids: Vec<_> = candidates.iter().map(|p| p.id).collect();
        assert!(ids.contains(&a) && ids.contains(&b));

        let narrowed = shared.clone().with_identifier(IdentityKind::Username, "alice");
        assert_eq!(
            engine.find_principal(&narrowed).unwrap().principal().map(|p| p.id),
            Some(a)
        );
        let by_name = shared.with_name("bob");
        assert_eq!(
            engine.find_principal(&by_name).unwrap().principal().map(|p| p.id),
            Some(b)
        );
    }

    #[test]
    fn test_disagreeing_identifiers_are_ambiguous() {
        let engine = engine();
        person(&engine, "Carol", &[("email", IdentityKind::Email, "carol@x.com")]);
        person(&engine, "Dan", &[("sms", IdentityKind::Phone, "+1 415 555 0000")]);
        let selector = PrincipalSelector::by_identifier(IdentityKind::Phone, "+1 415 555 0000")
            .with_identifier(IdentityKind::Email, "carol@x.com");
        let Selection::Ambiguous(candidates) = engine.find_principal(&selector).unwrap() else {
            panic!("expected ambiguity");
        };
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_name_fallback_prefers_exact_matches() {
        let engine = engine();
        let eve = person(&engine, "Eve", &[]);
        person(&engine, "Steven", &[]);
        person(&engine, "Evelyn", &[]);
        let found = engine.find_principal(&PrincipalSelector::by_name("eve")).unwrap();
        assert_eq!(found.principal().map(|p| p.id), Some(eve));

        let Selection::Ambiguous(partial) =
            engine.find_principal(&PrincipalSelector::by_name("ev")).unwrap()
        else {
            panic!("expected several fragment matches");
        };
        assert_eq!(partial.len(), 3);
        assert_eq!(
            engine.find_principal(&PrincipalSelector::by_name("zed")).unwrap(),
            Selection::NotFound
        );
    }

    #[test]
    fn test_merged_principal_is_reported_as_its_successor() {
        let engine = engine();
        let a = person(&engine, "Fay", &[("email", IdentityKind::Email, "fay@x.com")]);
        let b = person(&engine, "Fay", &[("email", IdentityKind::Email, "fay@y.com")]);
        engine
            .merge(a, b, "same person", crate::audit::Actor::operator("op").unwrap())
            .unwrap();
        let by_id = engine.find_principal(&PrincipalSelector::by_id(a)).unwrap();
        assert_eq!(by_id.principal().map(|p| p.id), Some(b));
        let by_name = engine.find_principal(&PrincipalSelector::by_name("Fay")).unwrap();
        assert_eq!(by_name.principal().map(|p| p.id), Some(b));
    }
}
