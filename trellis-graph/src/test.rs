use std::sync::Arc;

use test_log::test;

use crate::{
    ChangeSet, Direction, Edge, EdgeKind, EdgeLabel, GraphView, MemStore, ThingData, TypeData,
    Vertex, VertexData, VertexStore, META_ENTITY, META_THING,
};
use trellis_base::ConceptId;
use trellis_lang::Value;

fn entity_type(id: u64, label: &str) -> Vertex {
    Vertex::new(
        ConceptId(id),
        VertexData::EntityType(TypeData {
            label: label.to_string(),
            is_abstract: false,
        }),
    )
}

fn entity(id: u64, type_id: ConceptId) -> Vertex {
    Vertex::new(
        ConceptId(id),
        VertexData::Entity(ThingData {
            type_id,
            shard: None,
            inferred: false,
        }),
    )
}

#[test]
fn test_fresh_store_is_seeded_with_metas() {
    let store = MemStore::new();
    assert_eq!(store.vertex_by_label("thing"), Some(META_THING));
    assert_eq!(store.vertex_by_label("entity"), Some(META_ENTITY));
    let subs = store.edges(META_THING, EdgeKind::Sub, Direction::In);
    assert_eq!(subs.len(), 3);
    assert_eq!(store.version(), 0);
}

#[test]
fn test_commit_applies_and_journals() {
    let store = MemStore::new();
    let person = entity_type(16, "person");
    store
        .commit(ChangeSet {
            put_vertices: vec![person.clone()],
            put_edges: vec![Edge::new(person.id, EdgeLabel::Sub, META_ENTITY)],
            ..ChangeSet::default()
        })
        .unwrap();
    assert_eq!(store.version(), 1);
    assert_eq!(store.journal_len(), 1);
    assert_eq!(store.vertex_by_label("person"), Some(person.id));
    assert_eq!(store.get_vertex(person.id), Some(person.clone()));
    let sups = store.edges(person.id, EdgeKind::Sub, Direction::Out);
    assert_eq!(sups, vec![Edge::new(person.id, EdgeLabel::Sub, META_ENTITY)]);
}

#[test]
fn test_view_pins_first_read() {
    let store = Arc::new(MemStore::new());
    let person = entity_type(16, "person");
    store
        .commit(ChangeSet {
            put_vertices: vec![person.clone()],
            put_edges: vec![Edge::new(person.id, EdgeLabel::Sub, META_ENTITY)],
            ..ChangeSet::default()
        })
        .unwrap();

    let mut view = GraphView::new(store.clone());
    assert_eq!(view.vertex(person.id), Some(person.clone()));

    // Another committer renames the row; the pinned view keeps the old
    // copy, a fresh view sees the new one.
    let mut renamed = person.clone();
    renamed.data = VertexData::EntityType(TypeData {
        label: "human".to_string(),
        is_abstract: false,
    });
    store
        .commit(ChangeSet {
            put_vertices: vec![renamed.clone()],
            ..ChangeSet::default()
        })
        .unwrap();
    assert_eq!(view.vertex(person.id), Some(person));
    let mut fresh = GraphView::new(store.clone());
    assert_eq!(fresh.vertex(renamed.id), Some(renamed));
}

#[test]
fn test_view_overlays_staged_mutations() {
    let store = Arc::new(MemStore::new());
    let mut view = GraphView::new(store.clone());

    let person = entity_type(16, "person");
    view.stage_vertex(person.clone());
    view.stage_edge(Edge::new(person.id, EdgeLabel::Sub, META_ENTITY));
    assert_eq!(view.concept_by_label("person"), Some(person.id));
    assert_eq!(view.sups(person.id), vec![person.id, META_ENTITY, META_THING]);

    // Nothing hit the store yet.
    assert_eq!(store.vertex_by_label("person"), None);

    store.commit(view.changeset()).unwrap();
    assert_eq!(store.vertex_by_label("person"), Some(person.id));
}

#[test]
fn test_view_staged_delete_hides_committed_edge() {
    let store = Arc::new(MemStore::new());
    let person = entity_type(16, "person");
    let p1 = entity(17, person.id);
    store
        .commit(ChangeSet {
            put_vertices: vec![person.clone(), p1.clone()],
            put_edges: vec![
                Edge::new(person.id, EdgeLabel::Sub, META_ENTITY),
                Edge::new(p1.id, EdgeLabel::Isa, person.id),
            ],
            ..ChangeSet::default()
        })
        .unwrap();

    let mut view = GraphView::new(store.clone());
    assert_eq!(view.instances(person.id), vec![p1.id]);
    view.stage_delete_edge(Edge::new(p1.id, EdgeLabel::Isa, person.id));
    view.stage_delete_vertex(p1.id);
    assert!(view.instances(person.id).is_empty());
    assert_eq!(view.vertex(p1.id), None);

    // The committed graph still has it until the changeset lands.
    assert!(store.get_vertex(p1.id).is_some());
    store.commit(view.changeset()).unwrap();
    assert!(store.get_vertex(p1.id).is_none());
    assert!(store
        .edges(person.id, EdgeKind::Isa, Direction::In)
        .is_empty());
}

#[test]
fn test_attributes_by_value_merges_staged_and_committed() {
    let store = Arc::new(MemStore::new());
    let name_type = Vertex::new(
        ConceptId(16),
        VertexData::AttributeType {
            base: TypeData {
                label: "name".to_string(),
                is_abstract: false,
            },
            datatype: trellis_lang::Datatype::Text,
        },
    );
    let committed = Vertex::new(
        ConceptId(17),
        VertexData::Attribute {
            base: ThingData {
                type_id: name_type.id,
                shard: None,
                inferred: false,
            },
            value: Value::from("ganesh"),
        },
    );
    store
        .commit(ChangeSet {
            put_vertices: vec![name_type.clone(), committed.clone()],
            ..ChangeSet::default()
        })
        .unwrap();

    let mut view = GraphView::new(store.clone());
    let staged = Vertex::new(
        ConceptId(18),
        VertexData::Attribute {
            base: ThingData {
                type_id: name_type.id,
                shard: None,
                inferred: false,
            },
            value: Value::from("ganesh"),
        },
    );
    view.stage_vertex(staged.clone());
    let got = view.attributes_by_value(&Value::from("ganesh"));
    assert_eq!(got, vec![committed.id, staged.id]);
    assert!(view.attributes_by_value(&Value::from("vishnu")).is_empty());
}
