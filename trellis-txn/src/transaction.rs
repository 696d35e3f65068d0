use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard};
use rapidhash::RapidHashMap;
use tracing::{debug, trace};

use trellis_base::{err, err_kind, ConceptId, Error, ErrorKind, Result};
use trellis_graph::{
    Direction, Edge, EdgeKind, EdgeLabel, GraphView, MetaKind, RuleData, ShardData, ThingData,
    TypeData, Vertex, VertexData, VertexStore, META_ATTRIBUTE, META_ENTITY, META_RELATION,
    META_THING,
};
use trellis_id::IdPool;
use trellis_lang::{Datatype, Pattern, Query, Value};

use crate::executor;
use crate::validator;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TxPhase {
    Open,
    Committing,
    Closed,
}

// Where a staged thing came from. Inference-only concepts are pruned at
// commit unless a written concept (transitively) references them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Provenance {
    Written,
    Inferred,
}

// The attribute-by-value cache a session shares across its transactions.
// The owning session invalidates it on its own commits; against other
// sessions' commits it revalidates by store version on every read, which
// bounds the staleness window to the gap between version check and use.
// That window is the documented read-committed-with-stale-cache behavior.
pub struct AttributeIndex {
    inner: Mutex<AttrIndexInner>,
}

struct AttrIndexInner {
    version: u64,
    by_value: RapidHashMap<Value, Vec<ConceptId>>,
}

impl Default for AttributeIndex {
    fn default() -> Self {
        AttributeIndex::new()
    }
}

impl AttributeIndex {
    pub fn new() -> AttributeIndex {
        AttributeIndex {
            inner: Mutex::new(AttrIndexInner {
                version: 0,
                by_value: RapidHashMap::default(),
            }),
        }
    }

    pub fn lookup(&self, store: &Arc<dyn VertexStore>, value: &Value) -> Vec<ConceptId> {
        let mut inner = self.inner.lock();
        let version = store.version();
        if inner.version != version {
            inner.by_value.clear();
            inner.version = version;
        }
        if let Some(hit) = inner.by_value.get(value) {
            return hit.clone();
        }
        let ids = store.scan_by_index(value);
        inner.by_value.insert(value.clone(), ids.clone());
        ids
    }

    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.by_value.clear();
    }
}

// Everything a transaction borrows from its session and server.
#[derive(Clone)]
pub struct TxContext {
    pub store: Arc<dyn VertexStore>,
    pub pool: Arc<IdPool>,
    pub attr_index: Arc<AttributeIndex>,
    pub sharding_threshold: u64,
}

pub(crate) struct TxState {
    pub(crate) phase: TxPhase,
    pub(crate) view: GraphView,
    pub(crate) provenance: RapidHashMap<ConceptId, Provenance>,
    pub(crate) inferred_edges: Vec<Edge>,
}

pub(crate) struct TxShared {
    pub(crate) mode: TxMode,
    pub(crate) owner: ThreadId,
    pub(crate) ctx: TxContext,
    pub(crate) state: Mutex<TxState>,
}

// A short-lived, thread-affine window onto one keyspace. All mutation is
// staged in the transaction's view and reaches the store only on commit,
// after validation. Using a transaction from any thread other than the one
// that opened it is answered with TransactionClosed, deliberately
// indistinguishable from use-after-close.
pub struct Transaction {
    shared: Arc<TxShared>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

// A session's weak grip on a transaction it minted: enough to see whether
// it is still open and to close it when the session shuts down, without
// keeping the transaction alive.
pub struct TxHandle(Weak<TxShared>);

impl TxHandle {
    pub fn is_open(&self) -> bool {
        match self.0.upgrade() {
            Some(shared) => !matches!(shared.state.lock().phase, TxPhase::Closed),
            None => false,
        }
    }

    pub fn force_close(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.state.lock().phase = TxPhase::Closed;
        }
    }
}

impl Transaction {
    pub fn new(ctx: TxContext, mode: TxMode) -> Transaction {
        let view = GraphView::new(ctx.store.clone());
        Transaction {
            shared: Arc::new(TxShared {
                mode,
                owner: thread::current().id(),
                ctx,
                state: Mutex::new(TxState {
                    phase: TxPhase::Open,
                    view,
                    provenance: RapidHashMap::default(),
                    inferred_edges: Vec::new(),
                }),
            }),
        }
    }

    pub fn handle(&self) -> TxHandle {
        TxHandle(Arc::downgrade(&self.shared))
    }

    pub fn mode(&self) -> TxMode {
        self.shared.mode
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.shared.state.lock().phase, TxPhase::Closed)
    }

    // Every public operation funnels through here: thread affinity first,
    // then lifecycle.
    fn guard(&self) -> Result<MutexGuard<'_, TxState>> {
        if thread::current().id() != self.shared.owner {
            return Err(err_kind(
                ErrorKind::TransactionClosed,
                "transaction used from a thread other than its owner",
            ));
        }
        let st = self.shared.state.lock();
        match st.phase {
            TxPhase::Open => Ok(st),
            _ => Err(err_kind(
                ErrorKind::TransactionClosed,
                "transaction is closed",
            )),
        }
    }

    pub fn check_mutation_allowed(&self) -> Result<()> {
        self.guard()?;
        if self.shared.mode == TxMode::Read {
            return Err(err_kind(
                ErrorKind::ReadOnly,
                "mutation attempted in a read transaction",
            ));
        }
        Ok(())
    }

    // ---- schema writes ------------------------------------------------

    pub fn put_entity_type(&self, label: &str) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.put_schema_vertex(&mut st, label, SchemaKind::EntityType, None)
    }

    pub fn put_relation_type(&self, label: &str) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.put_schema_vertex(&mut st, label, SchemaKind::RelationType, None)
    }

    pub fn put_attribute_type(&self, label: &str, datatype: Datatype) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.put_schema_vertex(&mut st, label, SchemaKind::AttributeType, Some(datatype))
    }

    pub fn put_role(&self, label: &str) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.put_schema_vertex(&mut st, label, SchemaKind::Role, None)
    }

    pub fn put_rule(&self, label: &str, when: Pattern, then: Pattern) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.put_rule_locked(&mut st, label, when, then)
    }

    pub fn set_sup(&self, type_id: ConceptId, sup: ConceptId) -> Result<()> {
        let mut st = self.guard()?;
        self.set_sup_locked(&mut st, type_id, sup)
    }

    pub fn set_abstract(&self, type_id: ConceptId, is_abstract: bool) -> Result<()> {
        let mut st = self.guard()?;
        self.set_abstract_locked(&mut st, type_id, is_abstract)
    }

    pub fn add_plays(&self, type_id: ConceptId, role: ConceptId, required: bool) -> Result<()> {
        let mut st = self.guard()?;
        self.add_plays_locked(&mut st, type_id, role, required)
    }

    pub fn add_relates(&self, rel_type: ConceptId, role: ConceptId) -> Result<()> {
        let mut st = self.guard()?;
        self.add_relates_locked(&mut st, rel_type, role)
    }

    pub fn add_key(&self, type_id: ConceptId, attr_type: ConceptId) -> Result<()> {
        let mut st = self.guard()?;
        self.add_key_locked(&mut st, type_id, attr_type)
    }

    pub(crate) fn put_entity_type_locked(&self, st: &mut TxState, label: &str) -> Result<ConceptId> {
        self.put_schema_vertex(st, label, SchemaKind::EntityType, None)
    }

    pub(crate) fn put_relation_type_locked(
        &self,
        st: &mut TxState,
        label: &str,
    ) -> Result<ConceptId> {
        self.put_schema_vertex(st, label, SchemaKind::RelationType, None)
    }

    pub(crate) fn put_attribute_type_locked(
        &self,
        st: &mut TxState,
        label: &str,
        datatype: Datatype,
    ) -> Result<ConceptId> {
        self.put_schema_vertex(st, label, SchemaKind::AttributeType, Some(datatype))
    }

    pub(crate) fn put_role_locked(&self, st: &mut TxState, label: &str) -> Result<ConceptId> {
        self.put_schema_vertex(st, label, SchemaKind::Role, None)
    }

    pub(crate) fn set_abstract_locked(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        is_abstract: bool,
    ) -> Result<()> {
        let mut v = st
            .view
            .vertex(type_id)
            .ok_or_else(|| err(format!("no such concept {}", type_id)))?;
        match &mut v.data {
            VertexData::EntityType(t)
            | VertexData::RelationType(t)
            | VertexData::Role(t)
            | VertexData::AttributeType { base: t, .. } => t.is_abstract = is_abstract,
            other => {
                return Err(err(format!(
                    "{} is a {}, not a type",
                    type_id,
                    other.kind_name()
                )))
            }
        }
        st.view.stage_vertex(v);
        Ok(())
    }

    pub(crate) fn add_plays_locked(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        role: ConceptId,
        required: bool,
    ) -> Result<()> {
        self.expect_kind(st, type_id, |d| d.is_type(), "type")?;
        self.expect_kind(st, role, |d| d.is_role(), "role")?;
        st.view
            .stage_edge(Edge::new(type_id, EdgeLabel::Plays { required }, role));
        Ok(())
    }

    pub(crate) fn add_relates_locked(
        &self,
        st: &mut TxState,
        rel_type: ConceptId,
        role: ConceptId,
    ) -> Result<()> {
        self.expect_kind(st, rel_type, |d| d.is_relation_type(), "relation type")?;
        self.expect_kind(st, role, |d| d.is_role(), "role")?;
        st.view.stage_edge(Edge::new(rel_type, EdgeLabel::Relates, role));
        Ok(())
    }

    pub(crate) fn add_key_locked(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        attr_type: ConceptId,
    ) -> Result<()> {
        self.expect_kind(st, type_id, |d| d.is_type(), "type")?;
        self.expect_kind(st, attr_type, |d| d.is_attribute_type(), "attribute type")?;
        st.view.stage_edge(Edge::new(type_id, EdgeLabel::Key, attr_type));
        Ok(())
    }

    // ---- schema reads -------------------------------------------------

    pub fn get_schema_concept(&self, label: &str) -> Result<Option<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st.view.concept_by_label(label))
    }

    pub fn get_entity_type(&self, label: &str) -> Result<Option<ConceptId>> {
        self.get_filtered(label, |d| matches!(d, VertexData::EntityType(_)))
    }

    pub fn get_relation_type(&self, label: &str) -> Result<Option<ConceptId>> {
        self.get_filtered(label, |d| d.is_relation_type())
    }

    pub fn get_attribute_type(&self, label: &str) -> Result<Option<ConceptId>> {
        self.get_filtered(label, |d| d.is_attribute_type())
    }

    pub fn get_role(&self, label: &str) -> Result<Option<ConceptId>> {
        self.get_filtered(label, |d| d.is_role())
    }

    pub fn get_rule(&self, label: &str) -> Result<Option<ConceptId>> {
        self.get_filtered(label, |d| d.is_rule())
    }

    fn get_filtered(
        &self,
        label: &str,
        want: impl Fn(&VertexData) -> bool,
    ) -> Result<Option<ConceptId>> {
        let mut st = self.guard()?;
        let id = match st.view.concept_by_label(label) {
            Some(id) => id,
            None => return Ok(None),
        };
        match st.view.vertex(id) {
            Some(v) if want(&v.data) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    pub fn sup(&self, id: ConceptId) -> Result<Option<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st.view.sup(id))
    }

    pub fn sups(&self, id: ConceptId) -> Result<Vec<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st.view.sups(id))
    }

    pub fn relates(&self, rel_type: ConceptId) -> Result<Vec<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st.view.relates_closure(rel_type).into_iter().collect())
    }

    pub fn plays(&self, type_id: ConceptId) -> Result<Vec<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st.view.plays_closure(type_id).into_iter().map(|(r, _)| r).collect())
    }

    pub fn instances(&self, type_id: ConceptId) -> Result<Vec<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st.view.instances(type_id))
    }

    pub fn get_attributes_by_value(&self, value: &Value) -> Result<Vec<ConceptId>> {
        let mut st = self.guard()?;
        let committed = self
            .shared
            .ctx
            .attr_index
            .lookup(&self.shared.ctx.store, value);
        Ok(st.view.overlay_attributes(committed, value))
    }

    // ---- instance writes ----------------------------------------------

    pub fn insert_entity(&self, type_id: ConceptId) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.insert_entity_locked(&mut st, type_id, Provenance::Written)
    }

    pub fn insert_relation(&self, type_id: ConceptId) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.insert_relation_locked(&mut st, type_id, Provenance::Written)
    }

    pub fn insert_attribute(&self, type_id: ConceptId, value: Value) -> Result<ConceptId> {
        let mut st = self.guard()?;
        self.insert_attribute_locked(&mut st, type_id, value, Provenance::Written)
    }

    pub fn add_role_player(
        &self,
        relation: ConceptId,
        role: ConceptId,
        player: ConceptId,
    ) -> Result<()> {
        let mut st = self.guard()?;
        self.add_role_player_locked(&mut st, relation, role, player, Provenance::Written)
    }

    pub fn add_has(&self, owner: ConceptId, attribute: ConceptId) -> Result<()> {
        let mut st = self.guard()?;
        self.add_has_locked(&mut st, owner, attribute, Provenance::Written)
    }

    pub fn delete_thing(&self, id: ConceptId) -> Result<()> {
        let mut st = self.guard()?;
        self.delete_thing_locked(&mut st, id)
    }

    // Manually open a new current-shard for a type; subsequent instance
    // creations of that type attach to it.
    pub fn shard(&self, type_id: ConceptId) -> Result<()> {
        let mut st = self.guard()?;
        self.expect_kind(&mut st, type_id, |d| d.is_type(), "type")?;
        self.open_shard_locked(&mut st, type_id)?;
        Ok(())
    }

    pub fn shards(&self, type_id: ConceptId) -> Result<Vec<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st
            .view
            .edges(type_id, EdgeKind::Shard, Direction::Out)
            .iter()
            .map(|e| e.to)
            .collect())
    }

    pub fn shard_of(&self, thing: ConceptId) -> Result<Option<ConceptId>> {
        let mut st = self.guard()?;
        Ok(st.view.vertex(thing).and_then(|v| v.data.thing().and_then(|t| t.shard)))
    }

    // ---- queries ------------------------------------------------------

    pub fn execute(&self, query: &Query, infer: bool) -> Result<Vec<executor::Answer>> {
        let mut st = self.guard()?;
        executor::execute(self, &mut st, query, infer)
    }

    // ---- lifecycle ----------------------------------------------------

    // Runs validation and persists the staged changeset. No-op on an
    // already-closed transaction and on a transaction with nothing staged.
    // Every other outcome, success or failure, leaves the transaction
    // closed.
    pub fn commit(&self) -> Result<()> {
        if thread::current().id() != self.shared.owner {
            return Err(err_kind(
                ErrorKind::TransactionClosed,
                "transaction used from a thread other than its owner",
            ));
        }
        let mut st = self.shared.state.lock();
        if st.phase == TxPhase::Closed {
            return Ok(());
        }
        // Inference-only staging is pruned first, so a read transaction
        // that merely materialized some derivations still commits as a
        // no-op.
        if let Err(e) = self.prune_inference_only(&mut st) {
            st.phase = TxPhase::Closed;
            return Err(e);
        }
        if !st.view.has_staged() {
            st.phase = TxPhase::Closed;
            return Ok(());
        }
        if self.shared.mode == TxMode::Read {
            st.phase = TxPhase::Closed;
            return Err(err_kind(
                ErrorKind::ReadOnlyCommit,
                "commit of a read transaction with staged mutations",
            ));
        }
        st.phase = TxPhase::Committing;

        // Validation runs against freshly read committed state, under the
        // keyspace commit lock, so of two racing conflicting commits the
        // second sees the first and fails rather than silently merging.
        let store = self.shared.ctx.store.clone();
        let commit_lock = store.commit_mutex();
        let _serialized = commit_lock.lock();
        st.view.drop_pins();
        let diagnostics = validator::validate(&mut st.view);
        if !diagnostics.is_empty() {
            st.phase = TxPhase::Closed;
            debug!(
                target: "trellis",
                problems = diagnostics.len(),
                "commit failed validation"
            );
            return Err(Error::validation(diagnostics));
        }
        let staged = st.view.changeset();
        if let Err(e) = store.commit(staged) {
            st.phase = TxPhase::Closed;
            return Err(e);
        }
        self.shared.ctx.attr_index.invalidate();
        st.phase = TxPhase::Closed;
        trace!(target: "trellis", "transaction committed");
        Ok(())
    }

    // Idempotent; discards staged mutations.
    pub fn close(&self) {
        let mut st = self.shared.state.lock();
        st.phase = TxPhase::Closed;
    }

    // ---- internals ----------------------------------------------------

    fn expect_kind(
        &self,
        st: &mut TxState,
        id: ConceptId,
        want: impl Fn(&VertexData) -> bool,
        what: &str,
    ) -> Result<()> {
        match st.view.vertex(id) {
            Some(v) if want(&v.data) => Ok(()),
            Some(v) => Err(err(format!(
                "{} is a {}, expected a {}",
                id,
                v.data.kind_name(),
                what
            ))),
            None => Err(err(format!("no such concept {}", id))),
        }
    }

    fn fresh_id(&self) -> Result<ConceptId> {
        Ok(ConceptId(self.shared.ctx.pool.next_id()?))
    }

    fn put_schema_vertex(
        &self,
        st: &mut TxState,
        label: &str,
        kind: SchemaKind,
        datatype: Option<Datatype>,
    ) -> Result<ConceptId> {
        if let Some(existing) = st.view.concept_by_label(label) {
            let v = st
                .view
                .vertex(existing)
                .ok_or_else(|| err(format!("label index points at missing {}", existing)))?;
            if kind.matches(&v.data) {
                if let (Some(want), VertexData::AttributeType { datatype: have, .. }) =
                    (datatype, &v.data)
                {
                    if *have != want {
                        return Err(err(format!(
                            "attribute type '{}' already defined with a different datatype",
                            label
                        )));
                    }
                }
                return Ok(existing);
            }
            return Err(err(format!(
                "label '{}' already used by a {}",
                label,
                v.data.kind_name()
            )));
        }

        let id = self.fresh_id()?;
        let base = TypeData {
            label: label.to_string(),
            is_abstract: false,
        };
        let (data, default_sup) = match kind {
            SchemaKind::EntityType => (VertexData::EntityType(base), META_ENTITY),
            SchemaKind::RelationType => (VertexData::RelationType(base), META_RELATION),
            SchemaKind::AttributeType => (
                VertexData::AttributeType {
                    base,
                    datatype: datatype
                        .ok_or_else(|| err("attribute type needs a datatype"))?,
                },
                META_ATTRIBUTE,
            ),
            SchemaKind::Role => (VertexData::Role(base), META_THING),
        };
        st.view.stage_vertex(Vertex::new(id, data));
        st.view.stage_edge(Edge::new(id, EdgeLabel::Sub, default_sup));
        trace!(target: "trellis", label, "staged new schema concept");
        Ok(id)
    }

    pub(crate) fn put_rule_locked(
        &self,
        st: &mut TxState,
        label: &str,
        when: Pattern,
        then: Pattern,
    ) -> Result<ConceptId> {
        if let Some(existing) = st.view.concept_by_label(label) {
            let v = st
                .view
                .vertex(existing)
                .ok_or_else(|| err(format!("label index points at missing {}", existing)))?;
            return match &v.data {
                VertexData::Rule(_) => Ok(existing),
                other => Err(err(format!(
                    "label '{}' already used by a {}",
                    label,
                    other.kind_name()
                ))),
            };
        }
        let id = self.fresh_id()?;
        st.view.stage_vertex(Vertex::new(
            id,
            VertexData::Rule(RuleData {
                label: label.to_string(),
                when,
                then,
                positive_hypothesis: Default::default(),
                negative_hypothesis: Default::default(),
                conclusion: Default::default(),
            }),
        ));
        st.view.stage_edge(Edge::new(id, EdgeLabel::Sub, META_THING));
        Ok(id)
    }

    pub(crate) fn set_sup_locked(&self, st: &mut TxState, type_id: ConceptId, sup: ConceptId) -> Result<()> {
        let child = st
            .view
            .vertex(type_id)
            .ok_or_else(|| err(format!("no such concept {}", type_id)))?;
        let parent = st
            .view
            .vertex(sup)
            .ok_or_else(|| err(format!("no such concept {}", sup)))?;
        if !sup_compatible(&child.data, &parent.data) {
            return Err(err(format!(
                "{} cannot be a subtype of {}",
                child.data.kind_name(),
                parent.data.kind_name()
            )));
        }
        if let (
            VertexData::AttributeType { datatype: a, .. },
            VertexData::AttributeType { datatype: b, .. },
        ) = (&child.data, &parent.data)
        {
            if a != b {
                return Err(err("attribute subtype must keep its super's datatype"));
            }
        }
        for e in st.view.edges(type_id, EdgeKind::Sub, Direction::Out) {
            st.view.stage_delete_edge(e);
        }
        st.view.stage_edge(Edge::new(type_id, EdgeLabel::Sub, sup));
        Ok(())
    }

    fn thing_type_guard(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        want: impl Fn(&VertexData) -> bool,
        what: &str,
    ) -> Result<()> {
        self.expect_kind(st, type_id, want, what)
    }

    pub(crate) fn insert_entity_locked(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        provenance: Provenance,
    ) -> Result<ConceptId> {
        self.thing_type_guard(
            st,
            type_id,
            |d| matches!(d, VertexData::EntityType(_)),
            "entity type",
        )?;
        let shard = match provenance {
            Provenance::Written => Some(self.attach_shard_locked(st, type_id)?),
            Provenance::Inferred => None,
        };
        let id = self.fresh_id()?;
        st.view.stage_vertex(Vertex::new(
            id,
            VertexData::Entity(ThingData {
                type_id,
                shard,
                inferred: provenance == Provenance::Inferred,
            }),
        ));
        self.stage_thing_edge(st, Edge::new(id, EdgeLabel::Isa, type_id), provenance);
        st.provenance.insert(id, provenance);
        Ok(id)
    }

    pub(crate) fn insert_relation_locked(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        provenance: Provenance,
    ) -> Result<ConceptId> {
        self.thing_type_guard(st, type_id, |d| d.is_relation_type(), "relation type")?;
        let shard = match provenance {
            Provenance::Written => Some(self.attach_shard_locked(st, type_id)?),
            Provenance::Inferred => None,
        };
        let id = self.fresh_id()?;
        st.view.stage_vertex(Vertex::new(
            id,
            VertexData::Relation(ThingData {
                type_id,
                shard,
                inferred: provenance == Provenance::Inferred,
            }),
        ));
        self.stage_thing_edge(st, Edge::new(id, EdgeLabel::Isa, type_id), provenance);
        st.provenance.insert(id, provenance);
        Ok(id)
    }

    // Attributes are deduplicated per (type, value): putting the same value
    // twice hands back the same concept.
    pub(crate) fn insert_attribute_locked(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        value: Value,
        provenance: Provenance,
    ) -> Result<ConceptId> {
        self.thing_type_guard(st, type_id, |d| d.is_attribute_type(), "attribute type")?;
        let datatype = match st.view.vertex(type_id).map(|v| v.data) {
            Some(VertexData::AttributeType { datatype, .. }) => datatype,
            _ => return Err(err(format!("no such attribute type {}", type_id))),
        };
        if value.datatype() != datatype {
            return Err(err(format!(
                "value datatype {:?} does not match attribute type's {:?}",
                value.datatype(),
                datatype
            )));
        }
        for existing in st.view.attributes_by_value(&value) {
            if st.view.type_of(existing) == Some(type_id) {
                return Ok(existing);
            }
        }
        let shard = match provenance {
            Provenance::Written => Some(self.attach_shard_locked(st, type_id)?),
            Provenance::Inferred => None,
        };
        let id = self.fresh_id()?;
        st.view.stage_vertex(Vertex::new(
            id,
            VertexData::Attribute {
                base: ThingData {
                    type_id,
                    shard,
                    inferred: provenance == Provenance::Inferred,
                },
                value,
            },
        ));
        self.stage_thing_edge(st, Edge::new(id, EdgeLabel::Isa, type_id), provenance);
        st.provenance.insert(id, provenance);
        Ok(id)
    }

    pub(crate) fn add_role_player_locked(
        &self,
        st: &mut TxState,
        relation: ConceptId,
        role: ConceptId,
        player: ConceptId,
        provenance: Provenance,
    ) -> Result<()> {
        self.expect_kind(st, relation, |d| d.is_relation(), "relation")?;
        self.expect_kind(st, role, |d| d.is_role(), "role")?;
        self.expect_kind(st, player, |d| d.is_thing(), "thing")?;
        self.stage_thing_edge(
            st,
            Edge::new(relation, EdgeLabel::RolePlayer { role }, player),
            provenance,
        );
        Ok(())
    }

    pub(crate) fn add_has_locked(
        &self,
        st: &mut TxState,
        owner: ConceptId,
        attribute: ConceptId,
        provenance: Provenance,
    ) -> Result<()> {
        self.expect_kind(st, owner, |d| d.is_thing(), "thing")?;
        self.expect_kind(st, attribute, |d| d.is_attribute(), "attribute")?;
        self.stage_thing_edge(st, Edge::new(owner, EdgeLabel::Has, attribute), provenance);
        Ok(())
    }

    fn stage_thing_edge(&self, st: &mut TxState, e: Edge, provenance: Provenance) {
        if provenance == Provenance::Inferred {
            if !st.inferred_edges.contains(&e) {
                st.inferred_edges.push(e);
            }
        } else {
            st.inferred_edges.retain(|x| x != &e);
        }
        st.view.stage_edge(e);
    }

    pub(crate) fn delete_thing_locked(&self, st: &mut TxState, id: ConceptId) -> Result<()> {
        self.expect_kind(st, id, |d| d.is_thing(), "thing")?;
        let mut doomed = Vec::new();
        for kind in [EdgeKind::Isa, EdgeKind::Has, EdgeKind::RolePlayer] {
            doomed.extend(st.view.edges(id, kind, Direction::Out));
            doomed.extend(st.view.edges(id, kind, Direction::In));
        }
        for e in doomed {
            st.view.stage_delete_edge(e);
        }
        st.view.stage_delete_vertex(id);
        st.provenance.remove(&id);
        Ok(())
    }

    // The type's current shard, opening the first or a successor shard when
    // the member count has crossed the threshold. Deletions do not
    // decrement member counts; shard membership only ever grows.
    fn attach_shard_locked(&self, st: &mut TxState, type_id: ConceptId) -> Result<ConceptId> {
        let shard_ids: Vec<ConceptId> = st
            .view
            .edges(type_id, EdgeKind::Shard, Direction::Out)
            .iter()
            .map(|e| e.to)
            .collect();
        let mut current: Option<(ConceptId, ShardData)> = None;
        for sid in shard_ids {
            if let Some(VertexData::Shard(data)) = st.view.vertex(sid).map(|v| v.data) {
                if current.map_or(true, |(_, cur)| data.seq > cur.seq) {
                    current = Some((sid, data));
                }
            }
        }
        match current {
            Some((sid, mut data)) if data.members < self.shared.ctx.sharding_threshold => {
                data.members += 1;
                st.view.stage_vertex(Vertex::new(sid, VertexData::Shard(data)));
                Ok(sid)
            }
            Some((_, data)) => {
                let sid = self.open_shard_seq_locked(st, type_id, data.seq + 1)?;
                self.bump_shard_members(st, sid);
                Ok(sid)
            }
            None => {
                let sid = self.open_shard_seq_locked(st, type_id, 0)?;
                self.bump_shard_members(st, sid);
                Ok(sid)
            }
        }
    }

    fn bump_shard_members(&self, st: &mut TxState, shard: ConceptId) {
        if let Some(VertexData::Shard(mut data)) = st.view.vertex(shard).map(|v| v.data) {
            data.members += 1;
            st.view.stage_vertex(Vertex::new(shard, VertexData::Shard(data)));
        }
    }

    fn open_shard_locked(&self, st: &mut TxState, type_id: ConceptId) -> Result<ConceptId> {
        let next_seq = st
            .view
            .edges(type_id, EdgeKind::Shard, Direction::Out)
            .iter()
            .filter_map(|e| match st.view.vertex(e.to).map(|v| v.data) {
                Some(VertexData::Shard(d)) => Some(d.seq + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        self.open_shard_seq_locked(st, type_id, next_seq)
    }

    fn open_shard_seq_locked(
        &self,
        st: &mut TxState,
        type_id: ConceptId,
        seq: u64,
    ) -> Result<ConceptId> {
        let sid = self.fresh_id()?;
        st.view.stage_vertex(Vertex::new(
            sid,
            VertexData::Shard(ShardData {
                owner: type_id,
                seq,
                members: 0,
            }),
        ));
        st.view.stage_edge(Edge::new(type_id, EdgeLabel::Shard, sid));
        trace!(target: "trellis", seq, "opened new shard");
        Ok(sid)
    }

    // Drop inference-only concepts nothing written points at, keep (and
    // materialize for real) those a written concept transitively
    // references.
    fn prune_inference_only(&self, st: &mut TxState) -> Result<()> {
        let inferred: Vec<ConceptId> = st
            .provenance
            .iter()
            .filter(|(_, p)| **p == Provenance::Inferred)
            .map(|(id, _)| *id)
            .collect();
        if inferred.is_empty() && st.inferred_edges.is_empty() {
            return Ok(());
        }
        let is_inferred =
            |id: ConceptId, st: &TxState| st.provenance.get(&id) == Some(&Provenance::Inferred);

        // A concept is persisted when referenced, directly or through other
        // persisted concepts, by something that is not inference-only.
        let mut persisted: BTreeMap<ConceptId, bool> =
            inferred.iter().map(|id| (*id, false)).collect();
        let staged_edges = st.view.staged_new_edges();
        loop {
            let mut changed = false;
            for e in &staged_edges {
                if !matches!(e.label, EdgeLabel::Has | EdgeLabel::RolePlayer { .. }) {
                    continue;
                }
                let from_persists =
                    !is_inferred(e.from, st) || persisted.get(&e.from).copied().unwrap_or(false);
                if from_persists && is_inferred(e.to, st) {
                    let slot = persisted.entry(e.to).or_insert(false);
                    if !*slot {
                        *slot = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for id in &inferred {
            if persisted.get(id).copied().unwrap_or(false) {
                // Promoted: it persists as a regular concept, which is the
                // point where it finally joins its type's current shard.
                if let Some(mut v) = st.view.vertex(*id) {
                    let type_id = v.data.thing().map(|t| t.type_id);
                    let needs_shard = v.data.thing().map_or(false, |t| t.shard.is_none());
                    if let Some(t) = v.data.thing_mut() {
                        t.inferred = false;
                    }
                    if needs_shard {
                        if let Some(type_id) = type_id {
                            let shard = self.attach_shard_locked(st, type_id)?;
                            if let Some(t) = v.data.thing_mut() {
                                t.shard = Some(shard);
                            }
                        }
                    }
                    st.view.stage_vertex(v);
                }
            } else {
                st.view.unstage_vertex(*id);
                st.provenance.remove(id);
            }
        }

        // Inference-derived edges survive only as the structure OF a
        // persisted inferred concept (its isa, its castings): that is,
        // when their source is a persisted inferred vertex. A derived
        // ownership hanging off written concepts is not persisted.
        let survives = |id: ConceptId, st: &TxState| {
            is_inferred(id, st) && st.view.is_staged_vertex(id)
        };
        let doomed: Vec<Edge> = st
            .inferred_edges
            .iter()
            .filter(|e| !survives(e.from, st))
            .copied()
            .collect();
        for e in doomed {
            st.view.discard_staged_edge(&e);
        }
        st.inferred_edges.clear();
        Ok(())
    }
}

enum SchemaKind {
    EntityType,
    RelationType,
    AttributeType,
    Role,
}

impl SchemaKind {
    fn matches(&self, data: &VertexData) -> bool {
        match self {
            SchemaKind::EntityType => matches!(data, VertexData::EntityType(_)),
            SchemaKind::RelationType => data.is_relation_type(),
            SchemaKind::AttributeType => data.is_attribute_type(),
            SchemaKind::Role => data.is_role(),
        }
    }
}

fn sup_compatible(child: &VertexData, parent: &VertexData) -> bool {
    match child {
        VertexData::EntityType(_) => {
            matches!(parent, VertexData::EntityType(_) | VertexData::Meta(MetaKind::Entity))
        }
        VertexData::RelationType(_) => {
            matches!(parent, VertexData::RelationType(_) | VertexData::Meta(MetaKind::Relation))
        }
        VertexData::AttributeType { .. } => {
            matches!(
                parent,
                VertexData::AttributeType { .. } | VertexData::Meta(MetaKind::Attribute)
            )
        }
        VertexData::Role(_) => {
            matches!(parent, VertexData::Role(_) | VertexData::Meta(MetaKind::Thing))
        }
        _ => false,
    }
}

// The result row type: variable name to concept.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConceptMap {
    bindings: BTreeMap<String, ConceptId>,
}

impl ConceptMap {
    pub fn bind(&mut self, var: impl Into<String>, id: ConceptId) {
        self.bindings.insert(var.into(), id);
    }
    pub fn get(&self, var: &str) -> Option<ConceptId> {
        self.bindings.get(var).copied()
    }
    pub fn vars(&self) -> impl Iterator<Item = (&String, &ConceptId)> {
        self.bindings.iter()
    }
    pub fn retain_vars(&mut self, keep: &[String]) {
        self.bindings.retain(|k, _| keep.contains(k));
    }
}
