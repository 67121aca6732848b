use principal_graph::{
    Actor, AssociationTarget, Attribution, ClaimUpdate, Decision, IdentityEngine, IdentityError,
    IdentityKind, InMemoryIdentityStore, NewClaim, NewPrincipal, ObservationBatch, PrincipalId,
    PrincipalState, ResolutionAction, ReviewPayload, SplitTarget, ValidationError,
};
use std::sync::Arc;

fn engine() -> IdentityEngine {
    IdentityEngine::new(Arc::new(InMemoryIdentityStore::new()))
}

fn operator() -> Actor {
    Actor::operator("operator1").unwrap()
}

fn create(engine: &IdentityEngine, name: &str, claims: Vec<NewClaim>) -> PrincipalId {
    let request = claims
        .into_iter()
        .fold(NewPrincipal::named(name), NewPrincipal::with_claim);
    engine.create_principal(request).unwrap().id
}

fn email(value: &str) -> NewClaim {
    NewClaim::new("email", IdentityKind::Email, value, 0.9).unwrap()
}

#[test]
fn merge_conflict_leaves_store_unchanged() {
    let engine = engine();
    let a = create(
        &engine,
        "Grace",
        vec![
            email("grace@x.com"),
            NewClaim::new("chat", IdentityKind::Username, "gracie", 0.8).unwrap(),
        ],
    );
    let b = create(
        &engine,
        "Gracie",
        vec![NewClaim::new("chat", IdentityKind::Alias, "Gracie", 0.6).unwrap()],
    );
    let before_a = engine.claims_for(a).unwrap();
    let before_b = engine.claims_for(b).unwrap();

    let err = engine.merge(b, a, "looks the same", operator()).unwrap_err();
    let IdentityError::Validation(ValidationError::MergeConflict { claim_ids, .. }) = err else {
        panic!("expected merge conflict, got {err:?}");
    };
    assert_eq!(claim_ids.len(), 2);
    assert!(claim_ids.contains(&before_b[0].id));

    assert_eq!(engine.claims_for(a).unwrap(), before_a);
    assert_eq!(engine.claims_for(b).unwrap(), before_b);
    assert_eq!(engine.principal(b).unwrap().id, b);
    assert!(engine.events().unwrap().is_empty());
}

#[test]
fn merge_keeps_latest_claim_and_inherits_ancestors() {
    let engine = engine();
    let root = create(&engine, "Hal", vec![email("hal@x.com")]);
    let middle = create(&engine, "", vec![email("hal@x.com"), email("hal@y.com")]);
    let top = create(&engine, "Hal Jordan", vec![email("hal@z.com")]);

    engine.merge(root, middle, "", operator()).unwrap();
    let record = engine.principal_record(middle).unwrap().unwrap();
    assert_eq!(record.display_name.as_deref(), Some("Hal"));
    assert_eq!(record.ancestors, vec![root]);
    assert_eq!(engine.claims_for(middle).unwrap().len(), 2);

    engine.merge(middle, top, "", operator()).unwrap();
    let record = engine.principal_record(top).unwrap().unwrap();
    assert_eq!(record.ancestors, vec![middle, root]);
    assert_eq!(record.display_name.as_deref(), Some("Hal Jordan"));
    assert_eq!(engine.principal(root).unwrap().id, top);
    assert_eq!(
        engine.principal_record(root).unwrap().unwrap().state,
        PrincipalState::Merged { successor: middle }
    );
    assert_eq!(engine.claims_for(top).unwrap().len(), 3);
}

#[test]
fn system_merge_records_scores() {
    let engine = engine();
    let a = create(&engine, "Ivy", vec![email("ivy@x.com"), email("ivy@y.com")]);
    let b = create(&engine, "Ivy", vec![email("ivy@x.com")]);
    let event = engine.merge(b, a, "proposal accepted", Actor::System).unwrap();
    let scores = &event.score_snapshot["scores"];
    assert_eq!(scores["name"], 1.0);
    assert!(scores["affinity"].as_f64().unwrap() > 0.0);
    assert_eq!(event.score_snapshot["block_overridden"], false);
}

#[test]
fn split_repoints_owned_associations_and_flags_mixed_ones() {
    let engine = engine();
    let p = create(&engine, "Jo", vec![email("jo@home.com"), email("jo@work.com")]);
    let claims = engine.claims_for(p).unwrap();
    let home = claims.iter().find(|c| c.raw_value == "jo@home.com").unwrap().id;
    let work = claims.iter().find(|c| c.raw_value == "jo@work.com").unwrap().id;

    let photo = AssociationTarget::Media {
        id: "photo-9".to_string(),
    };
    let thread = AssociationTarget::Message {
        id: "m-77".to_string(),
        role: "recipient".to_string(),
    };
    let memo = AssociationTarget::Document {
        id: "doc-3".to_string(),
        role: "author".to_string(),
    };
    engine.link_association(p, photo.clone(), &[work], 0.7).unwrap();
    let mixed = engine.link_association(p, thread, &[home, work], 0.9).unwrap();
    engine.link_association(p, memo.clone(), &[home], 0.9).unwrap();

    let event = engine
        .split(p, &[work], SplitTarget::New, "work account is a colleague", operator())
        .unwrap();
    assert_eq!(event.action, ResolutionAction::Split);
    assert_eq!(event.score_snapshot["associations_moved"], 1);
    assert_eq!(
        event.score_snapshot["flagged_associations"][0],
        serde_json::json!(mixed.id)
    );

    let colleague = event.to_principal;
    let moved = engine.associations_for(colleague).unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].target, photo);
    let stayed: Vec<_> = engine
        .associations_for(p)
        .unwrap()
        .into_iter()
        .map(|a| a.target)
        .collect();
    assert_eq!(stayed.len(), 2);
    assert!(stayed.contains(&memo));

    let queued: Vec<_> = engine
        .drain_manual_review_queue()
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(
        queued[0].payload,
        ReviewPayload::AssociationReview {
            association_ids: vec![mixed.id],
            event_id: event.id,
        }
    );
    engine.resolve_review_item(queued[0].id, "kept on Jo").unwrap();
    assert_eq!(engine.drain_manual_review_queue().unwrap().count(), 0);
}

#[test]
fn split_into_existing_principal() {
    let engine = engine();
    let p = create(&engine, "Kim", vec![email("kim@a.com"), email("kim@b.com")]);
    let q = create(&engine, "Kim B", vec![email("kim@c.com")]);
    let moving = engine
        .claims_for(p)
        .unwrap()
        .into_iter()
        .find(|c| c.raw_value == "kim@b.com")
        .unwrap()
        .id;

    let event = engine
        .split(p, &[moving], SplitTarget::Existing(q), "", operator())
        .unwrap();
    assert_eq!(event.to_principal, q);
    assert_eq!(engine.claims_for(q).unwrap().len(), 2);
    assert_eq!(engine.claims_for(p).unwrap().len(), 1);

    let err = engine
        .split(p, &[moving], SplitTarget::New, "", operator())
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::ClaimNotOwned { .. })
    ));
    let err = engine
        .split(p, &[moving], SplitTarget::Existing(p), "", operator())
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::SamePrincipal { .. })
    ));
}

#[test]
fn block_resolves_through_successors() {
    let engine = engine();
    let a = create(&engine, "Lou", vec![email("lou@x.com")]);
    let b = create(&engine, "Lou", vec![email("lou@y.com")]);
    let c = create(&engine, "Lu", vec![email("lu@z.com")]);
    engine.merge(a, b, "", operator()).unwrap();

    let event = engine.block(a, c, "different people", operator()).unwrap();
    assert_eq!(event.from_principals, vec![b]);
    assert_eq!(event.to_principal, c);
    assert!(engine.is_blocked(c, b).unwrap());

    let err = engine.block(a, b, "", operator()).unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::SamePrincipal { .. })
    ));
}

#[test]
fn link_association_is_idempotent_and_checks_ownership() {
    let engine = engine();
    let p = create(&engine, "Max", vec![email("max@x.com")]);
    let q = create(&engine, "Other", vec![email("other@x.com")]);
    let own = engine.claims_for(p).unwrap()[0].id;
    let foreign = engine.claims_for(q).unwrap()[0].id;
    let target = AssociationTarget::Message {
        id: "m-1".to_string(),
        role: "sender".to_string(),
    };

    let first = engine.link_association(p, target.clone(), &[own], 0.4).unwrap();
    let second = engine.link_association(p, target.clone(), &[own], 0.8).unwrap();
    assert_eq!(first.id, second.id);
    assert!((second.confidence.value() - 0.8).abs() < 1e-6);
    assert_eq!(engine.associations_for(p).unwrap().len(), 1);

    let err = engine.link_association(p, target, &[foreign], 0.5).unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::ClaimNotOwned { .. })
    ));
}

#[test]
fn block_survives_merge_into_another_principal() {
    let engine = engine();
    let a = create(&engine, "Lou", vec![email("lou@home.com"), email("lou@work.com")]);
    let b = create(&engine, "Lou", vec![email("lou@club.com")]);
    let c = create(&engine, "Carla", vec![email("carla@x.com")]);
    engine.block(a, c, "different people", operator()).unwrap();
    engine.merge(a, b, "same person", operator()).unwrap();

    assert!(engine.is_blocked(b, c).unwrap());
    assert!(engine.is_blocked(c, a).unwrap());

    let err = engine.merge(c, b, "auto", Actor::System).unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::MergeBlocked { .. })
    ));
    let err = engine.propose_merge(c, b, "looks close").unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::MergeBlocked { .. })
    ));

    let contested = ObservationBatch::builder()
        .observe("email", IdentityKind::Email, "lou@home.com")
        .observe("email", IdentityKind::Email, "lou@work.com")
        .observe("email", IdentityKind::Email, "lou@club.com")
        .observe("email", IdentityKind::Email, "carla@x.com")
        .display_name("Lou")
        .build()
        .unwrap();
    let outcome = engine.resolve_or_create(&contested).unwrap();
    assert!(matches!(
        outcome.decision,
        Decision::Blocked { winner, ref blocked_with } if winner == b && blocked_with == &vec![c]
    ));
    assert!(matches!(outcome.attribution, Attribution::Unattributed { .. }));
    assert_eq!(engine.claims_for(c).unwrap().len(), 1);

    let event = engine.merge(c, b, "operator knows better", operator()).unwrap();
    assert_eq!(event.score_snapshot["block_overridden"], true);
}

#[test]
fn rename_principal_records_before_and_after() {
    let engine = engine();
    let p = create(&engine, "Nina", vec![email("nina@x.com")]);
    let event = engine.rename_principal(p, "  Nina Simone ", operator()).unwrap();
    assert_eq!(event.action, ResolutionAction::Update);
    assert_eq!(event.score_snapshot["before"], "Nina");
    assert_eq!(event.score_snapshot["after"], "Nina Simone");
    assert_eq!(
        engine.principal(p).unwrap().display_name.as_deref(),
        Some("Nina Simone")
    );

    assert!(engine.rename_principal(p, "   ", operator()).unwrap_err().is_validation());
    let q = create(&engine, "Other", vec![email("other@x.com")]);
    engine.merge(q, p, "", operator()).unwrap();
    let err = engine.rename_principal(q, "Renamed", operator()).unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::PrincipalMerged { .. })
    ));
}

#[test]
fn update_claim_renormalizes_and_rechecks_uniqueness() {
    let engine = engine();
    let p = create(&engine, "Omar", vec![email("omar@old.com"), email("omar@new.com")]);
    let claims = engine.claims_for(p).unwrap();
    let old = claims.iter().find(|c| c.raw_value == "omar@old.com").unwrap().id;

    let updated = engine
        .update_claim(
            p,
            old,
            ClaimUpdate::default().value("Omar@Fixed.com").confidence(0.5),
            operator(),
        )
        .unwrap();
    assert_eq!(updated.normalized.as_deref(), Some("omar@fixed.com"));
    assert!((updated.confidence.value() - 0.5).abs() < 1e-6);
    assert_eq!(
        engine
            .lookup_claim("email", IdentityKind::Email, "omar@fixed.com")
            .unwrap()[0]
            .principal_id,
        p
    );
    assert!(engine
        .lookup_claim("email", IdentityKind::Email, "omar@old.com")
        .unwrap()
        .is_empty());

    let events = engine.events_for(p).unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.action, ResolutionAction::Update);
    assert_eq!(last.score_snapshot["before"]["normalized"], "omar@old.com");
    assert_eq!(last.score_snapshot["after"]["normalized"], "omar@fixed.com");

    let err = engine
        .update_claim(p, old, ClaimUpdate::default().value("omar@new.com"), operator())
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::DuplicateClaim { .. })
    ));
    let err = engine
        .update_claim(p, old, ClaimUpdate::default().value("not an address"), operator())
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::Unnormalized { .. })
    ));
    assert!(engine
        .update_claim(p, old, ClaimUpdate::default(), operator())
        .unwrap_err()
        .is_validation());

    let moved = engine
        .update_claim(p, old, ClaimUpdate::default().platform("gmail"), operator())
        .unwrap();
    assert_eq!(moved.platform.as_str(), "gmail");
    assert_eq!(moved.normalized.as_deref(), Some("omar@fixed.com"));

    let q = create(&engine, "Someone", vec![email("someone@x.com")]);
    let err = engine
        .update_claim(q, old, ClaimUpdate::default().confidence(0.1), operator())
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Validation(ValidationError::ClaimNotOwned { .. })
    ));
}
