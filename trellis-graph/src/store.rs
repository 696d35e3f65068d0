use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vertex::{meta_edges, meta_vertices, Edge, EdgeKind, Vertex};
use trellis_base::{ConceptId, Result};
use trellis_lang::Value;

// Everything a transaction wants to durably change, in one atom. Mutation
// reaches the store only through commit(), which is also why this design
// needs no store-side rollback: an abandoned transaction simply never
// submits its changeset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub put_vertices: Vec<Vertex>,
    pub delete_vertices: Vec<ConceptId>,
    pub put_edges: Vec<Edge>,
    pub delete_edges: Vec<Edge>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.put_vertices.is_empty()
            && self.delete_vertices.is_empty()
            && self.put_edges.is_empty()
            && self.delete_edges.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Direction {
    Out,
    In,
}

// The keyspace's durable graph. Reads are row-at-a-time (read-committed for
// rows a transaction has not pinned yet); writes land atomically through
// commit(). The commit mutex serializes commits for one keyspace, and
// commit-time validation runs under it.
pub trait VertexStore: Send + Sync + 'static {
    fn get_vertex(&self, id: ConceptId) -> Option<Vertex>;
    fn edges(&self, v: ConceptId, kind: EdgeKind, dir: Direction) -> Vec<Edge>;
    fn scan_by_index(&self, value: &Value) -> Vec<ConceptId>;
    fn vertex_by_label(&self, label: &str) -> Option<ConceptId>;
    fn schema_vertices(&self) -> Vec<ConceptId>;
    fn version(&self) -> u64;
    fn commit(&self, staged: ChangeSet) -> Result<()>;
    fn commit_mutex(&self) -> &Mutex<()>;
}

struct StoreInner {
    vertices: BTreeMap<ConceptId, Vertex>,
    edges_out: BTreeMap<ConceptId, Vec<Edge>>,
    edges_in: BTreeMap<ConceptId, Vec<Edge>>,
    labels: BTreeMap<String, ConceptId>,
    value_index: BTreeMap<Value, BTreeSet<ConceptId>>,
    schema: BTreeSet<ConceptId>,
    version: u64,
    // Every committed changeset, msgpack-encoded, in commit order.
    journal: Vec<Box<[u8]>>,
}

pub struct MemStore {
    inner: RwLock<StoreInner>,
    commit_mutex: Mutex<()>,
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore::new()
    }
}

impl MemStore {
    pub fn new() -> MemStore {
        let store = MemStore {
            inner: RwLock::new(StoreInner {
                vertices: BTreeMap::new(),
                edges_out: BTreeMap::new(),
                edges_in: BTreeMap::new(),
                labels: BTreeMap::new(),
                value_index: BTreeMap::new(),
                schema: BTreeSet::new(),
                version: 0,
                journal: Vec::new(),
            }),
            commit_mutex: Mutex::new(()),
        };
        {
            let mut inner = store.inner.write();
            for v in meta_vertices() {
                inner.index_vertex(&v);
                inner.vertices.insert(v.id, v);
            }
            for e in meta_edges() {
                inner.insert_edge(e);
            }
        }
        store
    }

    pub fn journal_len(&self) -> usize {
        self.inner.read().journal.len()
    }
}

impl StoreInner {
    fn index_vertex(&mut self, v: &Vertex) {
        if let Some(label) = v.data.label() {
            self.labels.insert(label.to_string(), v.id);
        }
        if let Some(value) = v.data.value() {
            self.value_index.entry(value.clone()).or_default().insert(v.id);
        }
        if v.data.is_schema() {
            self.schema.insert(v.id);
        }
    }

    fn unindex_vertex(&mut self, v: &Vertex) {
        if let Some(label) = v.data.label() {
            if self.labels.get(label) == Some(&v.id) {
                self.labels.remove(label);
            }
        }
        if let Some(value) = v.data.value() {
            if let Some(owners) = self.value_index.get_mut(value) {
                owners.remove(&v.id);
                if owners.is_empty() {
                    self.value_index.remove(value);
                }
            }
        }
        self.schema.remove(&v.id);
    }

    fn insert_edge(&mut self, e: Edge) {
        let out = self.edges_out.entry(e.from).or_default();
        if !out.contains(&e) {
            out.push(e);
        }
        let inn = self.edges_in.entry(e.to).or_default();
        if !inn.contains(&e) {
            inn.push(e);
        }
    }

    fn remove_edge(&mut self, e: &Edge) {
        if let Some(out) = self.edges_out.get_mut(&e.from) {
            out.retain(|x| x != e);
        }
        if let Some(inn) = self.edges_in.get_mut(&e.to) {
            inn.retain(|x| x != e);
        }
    }

    // Deleting a vertex purges whatever edges still touch it; the
    // transaction stages explicit edge deletes for everything it knows
    // about, this is the backstop for the rest.
    fn purge_incident_edges(&mut self, id: ConceptId) {
        let incident: Vec<Edge> = self
            .edges_out
            .get(&id)
            .into_iter()
            .flatten()
            .chain(self.edges_in.get(&id).into_iter().flatten())
            .copied()
            .collect();
        for e in incident {
            self.remove_edge(&e);
        }
        self.edges_out.remove(&id);
        self.edges_in.remove(&id);
    }
}

impl VertexStore for MemStore {
    fn get_vertex(&self, id: ConceptId) -> Option<Vertex> {
        self.inner.read().vertices.get(&id).cloned()
    }

    fn edges(&self, v: ConceptId, kind: EdgeKind, dir: Direction) -> Vec<Edge> {
        let inner = self.inner.read();
        let map = match dir {
            Direction::Out => &inner.edges_out,
            Direction::In => &inner.edges_in,
        };
        map.get(&v)
            .into_iter()
            .flatten()
            .filter(|e| e.label.kind() == kind)
            .copied()
            .collect()
    }

    fn scan_by_index(&self, value: &Value) -> Vec<ConceptId> {
        self.inner
            .read()
            .value_index
            .get(value)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn vertex_by_label(&self, label: &str) -> Option<ConceptId> {
        self.inner.read().labels.get(label).copied()
    }

    fn schema_vertices(&self) -> Vec<ConceptId> {
        self.inner.read().schema.iter().copied().collect()
    }

    fn version(&self) -> u64 {
        self.inner.read().version
    }

    fn commit(&self, staged: ChangeSet) -> Result<()> {
        let record = rmp_serde::to_vec(&staged)?;
        let mut inner = self.inner.write();
        for e in &staged.delete_edges {
            inner.remove_edge(e);
        }
        for id in &staged.delete_vertices {
            if let Some(v) = inner.vertices.remove(id) {
                inner.unindex_vertex(&v);
            }
            inner.purge_incident_edges(*id);
        }
        for v in &staged.put_vertices {
            if let Some(old) = inner.vertices.remove(&v.id) {
                inner.unindex_vertex(&old);
            }
            inner.index_vertex(v);
            inner.vertices.insert(v.id, v.clone());
        }
        for e in &staged.put_edges {
            inner.insert_edge(*e);
        }
        inner.version += 1;
        inner.journal.push(record.into_boxed_slice());
        debug!(
            target: "trellis",
            version = inner.version,
            vertices = staged.put_vertices.len(),
            edges = staged.put_edges.len(),
            "committed changeset"
        );
        Ok(())
    }

    fn commit_mutex(&self) -> &Mutex<()> {
        &self.commit_mutex
    }
}
