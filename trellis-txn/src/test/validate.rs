use test_log::test;

use super::{define_social, test_context, write_tx};
use trellis_base::ErrorKind;
use trellis_lang::Datatype;

#[test]
fn test_unrelated_role_fails_validation() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    tx.put_role("lonely").unwrap();
    let err = tx.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err.diagnostics().iter().any(|d| d.contains("lonely")));
    // A failed validation closes the transaction.
    assert_eq!(
        tx.get_role("lonely").unwrap_err().kind(),
        ErrorKind::TransactionClosed
    );
}

#[test]
fn test_abstract_role_needs_no_relation() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    let lonely = tx.put_role("lonely").unwrap();
    tx.set_abstract(lonely, true).unwrap();
    tx.commit().unwrap();
}

#[test]
fn test_relation_type_without_roles_fails_validation() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    tx.put_relation_type("hollow").unwrap();
    let err = tx.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err.diagnostics().iter().any(|d| d.contains("hollow")));
}

#[test]
fn test_all_problems_are_reported_together() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    tx.put_role("lonely").unwrap();
    tx.put_relation_type("hollow").unwrap();
    let err = tx.commit().unwrap_err();
    let diags = err.diagnostics();
    assert!(diags.iter().any(|d| d.contains("lonely")));
    assert!(diags.iter().any(|d| d.contains("hollow")));
    assert!(diags.len() >= 2);
}

#[test]
fn test_relation_subtype_must_cover_super_roles() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    define_social(&tx);
    tx.commit().unwrap();

    // spouse sub friend covers friend: fine.
    let tx = write_tx(&ctx);
    let friendship = tx.get_relation_type("friendship").unwrap().unwrap();
    let friend = tx.get_role("friend").unwrap().unwrap();
    let marriage = tx.put_relation_type("marriage").unwrap();
    tx.set_sup(marriage, friendship).unwrap();
    let spouse = tx.put_role("spouse").unwrap();
    tx.set_sup(spouse, friend).unwrap();
    tx.add_relates(marriage, spouse).unwrap();
    let person = tx.get_entity_type("person").unwrap().unwrap();
    tx.add_plays(person, spouse, false).unwrap();
    tx.commit().unwrap();

    // partner is unrelated to friend: both directions of the cover break.
    let tx = write_tx(&ctx);
    let friendship = tx.get_relation_type("friendship").unwrap().unwrap();
    let partnership = tx.put_relation_type("partnership").unwrap();
    tx.set_sup(partnership, friendship).unwrap();
    let partner = tx.put_role("partner").unwrap();
    tx.add_relates(partnership, partner).unwrap();
    let err = tx.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err
        .diagnostics()
        .iter()
        .any(|d| d.contains("does not specialize")));
    assert!(err.diagnostics().iter().any(|d| d.contains("does not cover")));
}

#[test]
fn test_casting_requires_player_type_to_play_role() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    let (person, _friend, friendship) = define_social(&tx);
    let bystander = tx.put_role("bystander").unwrap();
    tx.add_relates(friendship, bystander).unwrap();
    // Somebody must be allowed to stand by, or the role itself fails
    // the role-linkage check.
    let observer = tx.put_entity_type("observer").unwrap();
    tx.add_plays(observer, bystander, false).unwrap();
    tx.commit().unwrap();

    let tx = write_tx(&ctx);
    let p = tx.insert_entity(person).unwrap();
    let r = tx.insert_relation(friendship).unwrap();
    // person does not play bystander.
    tx.add_role_player(r, bystander, p).unwrap();
    let err = tx.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err
        .diagnostics()
        .iter()
        .any(|d| d.contains("does not play role")));
}

#[test]
fn test_casting_role_must_be_related_by_relation_type() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    let (person, _friend, friendship) = define_social(&tx);
    // A second relation hierarchy with its own role.
    let employment = tx.put_relation_type("employment").unwrap();
    let employee = tx.put_role("employee").unwrap();
    tx.add_relates(employment, employee).unwrap();
    tx.add_plays(person, employee, false).unwrap();
    tx.commit().unwrap();

    let tx = write_tx(&ctx);
    let p = tx.insert_entity(person).unwrap();
    let r = tx.insert_relation(friendship).unwrap();
    // friendship does not relate employee.
    tx.add_role_player(r, employee, p).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(err
        .diagnostics()
        .iter()
        .any(|d| d.contains("does not relate role")));
}

#[test]
fn test_required_role_must_be_filled_exactly_once() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    let person = tx.put_entity_type("person").unwrap();
    let holder = tx.put_role("holder").unwrap();
    let tenure = tx.put_relation_type("tenure").unwrap();
    tx.add_relates(tenure, holder).unwrap();
    tx.add_plays(person, holder, true).unwrap();
    tx.commit().unwrap();

    // No filling at all.
    let tx = write_tx(&ctx);
    tx.insert_entity(person).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(err
        .diagnostics()
        .iter()
        .any(|d| d.contains("required role")));

    // Exactly one filling passes.
    let tx = write_tx(&ctx);
    let p = tx.insert_entity(person).unwrap();
    let t = tx.insert_relation(tenure).unwrap();
    tx.add_role_player(t, holder, p).unwrap();
    tx.commit().unwrap();
}

#[test]
fn test_key_values_are_unique_per_owner_type() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    let person = tx.put_entity_type("person").unwrap();
    let ssn = tx.put_attribute_type("ssn", Datatype::Text).unwrap();
    tx.add_key(person, ssn).unwrap();
    tx.commit().unwrap();

    let tx = write_tx(&ctx);
    let p1 = tx.insert_entity(person).unwrap();
    let p2 = tx.insert_entity(person).unwrap();
    let shared = tx.insert_attribute(ssn, "123-456".into()).unwrap();
    tx.add_has(p1, shared).unwrap();
    tx.add_has(p2, shared).unwrap();
    let err = tx.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err.diagnostics().iter().any(|d| d.contains("key")));

    // Distinct values are fine.
    let tx = write_tx(&ctx);
    let p1 = tx.insert_entity(person).unwrap();
    let p2 = tx.insert_entity(person).unwrap();
    let a = tx.insert_attribute(ssn, "123-456".into()).unwrap();
    let b = tx.insert_attribute(ssn, "789-000".into()).unwrap();
    tx.add_has(p1, a).unwrap();
    tx.add_has(p2, b).unwrap();
    tx.commit().unwrap();
}

#[test]
fn test_relations_must_keep_a_role_player() {
    let ctx = test_context();
    let tx = write_tx(&ctx);
    let (_, _, friendship) = define_social(&tx);
    tx.commit().unwrap();

    let tx = write_tx(&ctx);
    tx.insert_relation(friendship).unwrap();
    let err = tx.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err
        .diagnostics()
        .iter()
        .any(|d| d.contains("no role players")));
}

#[test]
fn test_conflicting_schema_commits_do_not_merge() {
    let ctx = test_context();
    // Both transactions define the same label; the second commit sees the
    // first and fails validation instead of silently merging.
    let tx1 = write_tx(&ctx);
    let tx2 = write_tx(&ctx);
    tx1.put_entity_type("dog").unwrap();
    tx2.put_entity_type("dog").unwrap();
    tx1.commit().unwrap();
    let err = tx2.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err
        .diagnostics()
        .iter()
        .any(|d| d.contains("defined concurrently")));
}
