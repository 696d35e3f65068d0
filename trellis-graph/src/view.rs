use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rapidhash::RapidHashMap;

use crate::store::{ChangeSet, Direction, VertexStore};
use crate::vertex::{Edge, EdgeKind, EdgeLabel, Vertex};
use trellis_base::ConceptId;
use trellis_lang::Value;

// A transaction's window onto one keyspace: the committed graph overlaid
// with this transaction's staged mutations. The first read of any row pins
// the committed copy for the life of the view, so data a transaction has
// already seen never shifts underneath it; rows it has not touched yet are
// read-committed. Commit validation calls drop_pins() to deliberately
// trade the former for a fresh look at the world.
pub struct GraphView {
    store: Arc<dyn VertexStore>,
    pinned_vertices: RapidHashMap<ConceptId, Option<Vertex>>,
    pinned_edges: RapidHashMap<(ConceptId, EdgeKind, Direction), Vec<Edge>>,
    staged_vertices: BTreeMap<ConceptId, Vertex>,
    staged_deleted_vertices: BTreeSet<ConceptId>,
    staged_edges: BTreeSet<Edge>,
    staged_deleted_edges: BTreeSet<Edge>,
}

impl GraphView {
    pub fn new(store: Arc<dyn VertexStore>) -> GraphView {
        GraphView {
            store,
            pinned_vertices: RapidHashMap::default(),
            pinned_edges: RapidHashMap::default(),
            staged_vertices: BTreeMap::new(),
            staged_deleted_vertices: BTreeSet::new(),
            staged_edges: BTreeSet::new(),
            staged_deleted_edges: BTreeSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn VertexStore> {
        &self.store
    }

    fn committed_vertex(&mut self, id: ConceptId) -> Option<Vertex> {
        if let Some(v) = self.pinned_vertices.get(&id) {
            return v.clone();
        }
        let v = self.store.get_vertex(id);
        self.pinned_vertices.insert(id, v.clone());
        v
    }

    pub fn vertex(&mut self, id: ConceptId) -> Option<Vertex> {
        if self.staged_deleted_vertices.contains(&id) {
            return None;
        }
        if let Some(v) = self.staged_vertices.get(&id) {
            return Some(v.clone());
        }
        self.committed_vertex(id)
    }

    pub fn stage_vertex(&mut self, v: Vertex) {
        self.staged_deleted_vertices.remove(&v.id);
        self.staged_vertices.insert(v.id, v);
    }

    pub fn stage_delete_vertex(&mut self, id: ConceptId) {
        self.staged_vertices.remove(&id);
        self.staged_deleted_vertices.insert(id);
        self.staged_edges.retain(|e| e.from != id && e.to != id);
    }

    // Back out a staged (never committed) vertex and everything staged
    // against it, as if it had not been created. Used when pruning
    // inference-only concepts at commit.
    pub fn unstage_vertex(&mut self, id: ConceptId) {
        self.staged_vertices.remove(&id);
        self.staged_edges.retain(|e| e.from != id && e.to != id);
    }

    pub fn stage_edge(&mut self, e: Edge) {
        self.staged_deleted_edges.remove(&e);
        self.staged_edges.insert(e);
    }

    pub fn stage_delete_edge(&mut self, e: Edge) {
        self.staged_edges.remove(&e);
        self.staged_deleted_edges.insert(e);
    }

    // Remove a staged (never committed) edge without recording a delete
    // against the store.
    pub fn discard_staged_edge(&mut self, e: &Edge) {
        self.staged_edges.remove(e);
    }

    // Merge a committed candidate list (e.g. from a session's attribute
    // index) with this view's staged attribute rows for the same value.
    pub fn overlay_attributes(&self, committed: Vec<ConceptId>, value: &Value) -> Vec<ConceptId> {
        let mut ids: BTreeSet<ConceptId> = committed
            .into_iter()
            .filter(|id| !self.staged_deleted_vertices.contains(id))
            .filter(|id| match self.staged_vertices.get(id) {
                Some(v) => v.data.value() == Some(value),
                None => true,
            })
            .collect();
        for (id, v) in &self.staged_vertices {
            if v.data.value() == Some(value) {
                ids.insert(*id);
            }
        }
        ids.into_iter().collect()
    }

    fn committed_edges(&mut self, v: ConceptId, kind: EdgeKind, dir: Direction) -> Vec<Edge> {
        let key = (v, kind, dir);
        if let Some(es) = self.pinned_edges.get(&key) {
            return es.clone();
        }
        let es = self.store.edges(v, kind, dir);
        self.pinned_edges.insert(key, es.clone());
        es
    }

    pub fn edges(&mut self, v: ConceptId, kind: EdgeKind, dir: Direction) -> Vec<Edge> {
        let mut out = self.committed_edges(v, kind, dir);
        out.retain(|e| !self.staged_deleted_edges.contains(e));
        for e in &self.staged_edges {
            let anchor = match dir {
                Direction::Out => e.from,
                Direction::In => e.to,
            };
            if anchor == v && e.label.kind() == kind && !out.contains(e) {
                out.push(*e);
            }
        }
        out.retain(|e| {
            !self.staged_deleted_vertices.contains(&e.from)
                && !self.staged_deleted_vertices.contains(&e.to)
        });
        out
    }

    pub fn has_staged(&self) -> bool {
        !self.staged_vertices.is_empty()
            || !self.staged_deleted_vertices.is_empty()
            || !self.staged_edges.is_empty()
            || !self.staged_deleted_edges.is_empty()
    }

    pub fn is_staged_vertex(&self, id: ConceptId) -> bool {
        self.staged_vertices.contains_key(&id)
    }

    pub fn staged_vertex_ids(&self) -> Vec<ConceptId> {
        self.staged_vertices.keys().copied().collect()
    }

    pub fn staged_new_edges(&self) -> Vec<Edge> {
        self.staged_edges.iter().copied().collect()
    }

    pub fn staged_removed_edges(&self) -> Vec<Edge> {
        self.staged_deleted_edges.iter().copied().collect()
    }

    pub fn drop_pins(&mut self) {
        self.pinned_vertices.clear();
        self.pinned_edges.clear();
    }

    pub fn changeset(&self) -> ChangeSet {
        ChangeSet {
            put_vertices: self.staged_vertices.values().cloned().collect(),
            delete_vertices: self.staged_deleted_vertices.iter().copied().collect(),
            put_edges: self.staged_edges.iter().copied().collect(),
            delete_edges: self.staged_deleted_edges.iter().copied().collect(),
        }
    }

    pub fn concept_by_label(&mut self, label: &str) -> Option<ConceptId> {
        for (id, v) in &self.staged_vertices {
            if v.data.label() == Some(label) {
                return Some(*id);
            }
        }
        let id = self.store.vertex_by_label(label)?;
        if self.staged_deleted_vertices.contains(&id) {
            None
        } else {
            Some(id)
        }
    }

    // Committed schema plus staged schema, minus staged deletes. Small by
    // construction; the schema-level validation checks sweep it whole.
    pub fn schema_concepts(&mut self) -> Vec<ConceptId> {
        let mut ids: BTreeSet<ConceptId> = self.store.schema_vertices().into_iter().collect();
        for (id, v) in &self.staged_vertices {
            if v.data.is_schema() {
                ids.insert(*id);
            }
        }
        ids.into_iter()
            .filter(|i| !self.staged_deleted_vertices.contains(i))
            .collect()
    }

    pub fn sup(&mut self, id: ConceptId) -> Option<ConceptId> {
        self.edges(id, EdgeKind::Sub, Direction::Out)
            .first()
            .map(|e| e.to)
    }

    // The supertype chain starting at (and including) id. Defensive about
    // staged sub-cycles, which validation reports separately.
    pub fn sups(&mut self, id: ConceptId) -> Vec<ConceptId> {
        let mut out = vec![id];
        let mut cur = id;
        while let Some(s) = self.sup(cur) {
            if out.contains(&s) {
                break;
            }
            out.push(s);
            cur = s;
        }
        out
    }

    // id plus its transitive subtypes.
    pub fn subs(&mut self, id: ConceptId) -> Vec<ConceptId> {
        let mut out = vec![id];
        let mut seen: BTreeSet<ConceptId> = out.iter().copied().collect();
        let mut stack = vec![id];
        while let Some(t) = stack.pop() {
            for e in self.edges(t, EdgeKind::Sub, Direction::In) {
                if seen.insert(e.from) {
                    out.push(e.from);
                    stack.push(e.from);
                }
            }
        }
        out
    }

    pub fn relates(&mut self, rel_type: ConceptId) -> Vec<ConceptId> {
        self.edges(rel_type, EdgeKind::Relates, Direction::Out)
            .iter()
            .map(|e| e.to)
            .collect()
    }

    pub fn relates_closure(&mut self, rel_type: ConceptId) -> BTreeSet<ConceptId> {
        let mut out = BTreeSet::new();
        for t in self.sups(rel_type) {
            out.extend(self.relates(t));
        }
        out
    }

    pub fn plays(&mut self, type_id: ConceptId) -> Vec<(ConceptId, bool)> {
        self.edges(type_id, EdgeKind::Plays, Direction::Out)
            .iter()
            .filter_map(|e| match e.label {
                EdgeLabel::Plays { required } => Some((e.to, required)),
                _ => None,
            })
            .collect()
    }

    pub fn plays_closure(&mut self, type_id: ConceptId) -> Vec<(ConceptId, bool)> {
        let mut out = Vec::new();
        for t in self.sups(type_id) {
            out.extend(self.plays(t));
        }
        out
    }

    pub fn keys_closure(&mut self, type_id: ConceptId) -> Vec<ConceptId> {
        let mut out = Vec::new();
        for t in self.sups(type_id) {
            out.extend(
                self.edges(t, EdgeKind::Key, Direction::Out)
                    .iter()
                    .map(|e| e.to),
            );
        }
        out
    }

    // Direct and indirect instances: everything isa id or isa a subtype.
    pub fn instances(&mut self, type_id: ConceptId) -> Vec<ConceptId> {
        let mut out = Vec::new();
        for t in self.subs(type_id) {
            out.extend(
                self.edges(t, EdgeKind::Isa, Direction::In)
                    .iter()
                    .map(|e| e.from),
            );
        }
        out
    }

    pub fn type_of(&mut self, thing: ConceptId) -> Option<ConceptId> {
        self.vertex(thing)?.data.thing().map(|t| t.type_id)
    }

    pub fn castings(&mut self, relation: ConceptId) -> Vec<(ConceptId, ConceptId)> {
        self.edges(relation, EdgeKind::RolePlayer, Direction::Out)
            .iter()
            .filter_map(|e| match e.label {
                EdgeLabel::RolePlayer { role } => Some((role, e.to)),
                _ => None,
            })
            .collect()
    }

    // Relations in which `player` fills `role` (any role when None).
    pub fn relations_playing(
        &mut self,
        player: ConceptId,
        role: Option<ConceptId>,
    ) -> Vec<ConceptId> {
        self.edges(player, EdgeKind::RolePlayer, Direction::In)
            .iter()
            .filter_map(|e| match e.label {
                EdgeLabel::RolePlayer { role: r } => match role {
                    Some(want) if r != want => None,
                    _ => Some(e.from),
                },
                _ => None,
            })
            .collect()
    }

    pub fn attributes_of(&mut self, owner: ConceptId) -> Vec<ConceptId> {
        self.edges(owner, EdgeKind::Has, Direction::Out)
            .iter()
            .map(|e| e.to)
            .collect()
    }

    pub fn owners_of(&mut self, attribute: ConceptId) -> Vec<ConceptId> {
        self.edges(attribute, EdgeKind::Has, Direction::In)
            .iter()
            .map(|e| e.from)
            .collect()
    }

    // Value scans are not pinned: they go to the live index, plus whatever
    // this transaction has staged. Same read-committed compromise as the
    // session-level attribute index.
    pub fn attributes_by_value(&mut self, value: &Value) -> Vec<ConceptId> {
        let mut ids: BTreeSet<ConceptId> = self
            .store
            .scan_by_index(value)
            .into_iter()
            .filter(|id| !self.staged_deleted_vertices.contains(id))
            .filter(|id| match self.staged_vertices.get(id) {
                // A staged override with a different value shadows the
                // committed row.
                Some(v) => v.data.value() == Some(value),
                None => true,
            })
            .collect();
        for (id, v) in &self.staged_vertices {
            if v.data.value() == Some(value) {
                ids.insert(*id);
            }
        }
        ids.into_iter().collect()
    }
}
