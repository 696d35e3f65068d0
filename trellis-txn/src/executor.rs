// AST-level query execution: a naive bind-and-filter matcher, insert/define
// staging, and a bounded forward-chaining materializer for rule inference.
// The matcher enumerates candidates statement by statement; keyspaces this
// engine is pointed at are small enough that planning would be premature.

use std::collections::BTreeSet;

use tracing::debug;

use trellis_base::{err, ConceptId, Result};
use trellis_graph::{VertexData, META_RELATION, META_THING};
use trellis_lang::{
    Aggregate, Conjunction, DefineItem, Pattern, Query, Statement, TypeDecl, TypeKind, ValueRef,
    Var,
};

use crate::transaction::{ConceptMap, Provenance, Transaction, TxState};

// Rule application stops after this many passes even without a fixpoint;
// commit validation is what guarantees rule sets terminate, and a query
// against not-yet-validated staged rules must not spin.
const MAX_INFERENCE_PASSES: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Answer {
    Map(ConceptMap),
    Count(u64),
}

pub(crate) fn execute(
    tx: &Transaction,
    st: &mut TxState,
    query: &Query,
    infer: bool,
) -> Result<Vec<Answer>> {
    match query {
        Query::Define(items) => {
            define(tx, st, items)?;
            Ok(Vec::new())
        }
        Query::Insert(stmts) => {
            let m = insert(tx, st, stmts)?;
            Ok(vec![Answer::Map(m)])
        }
        Query::Get { patterns, vars } => {
            if infer {
                materialize(tx, st)?;
            }
            let maps = match_statements(st, patterns, ConceptMap::default())?;
            let keep: Vec<String> = vars.iter().map(|v| v.0.clone()).collect();
            Ok(maps
                .into_iter()
                .map(|mut m| {
                    if !keep.is_empty() {
                        m.retain_vars(&keep);
                    }
                    Answer::Map(m)
                })
                .collect())
        }
        Query::Delete { patterns, delete } => {
            let maps = match_statements(st, patterns, ConceptMap::default())?;
            let mut doomed = BTreeSet::new();
            for m in &maps {
                for v in delete {
                    match m.get(&v.0) {
                        Some(id) => {
                            doomed.insert(id);
                        }
                        None => {
                            return Err(err(format!("delete variable ${} is not bound", v.0)))
                        }
                    }
                }
            }
            for id in doomed {
                tx.delete_thing_locked(st, id)?;
            }
            Ok(Vec::new())
        }
        Query::Aggregate {
            patterns,
            aggregate,
        } => {
            if infer {
                materialize(tx, st)?;
            }
            let maps = match_statements(st, patterns, ConceptMap::default())?;
            match aggregate {
                Aggregate::Count => Ok(vec![Answer::Count(maps.len() as u64)]),
            }
        }
    }
}

fn require_label(st: &mut TxState, label: &str) -> Result<ConceptId> {
    st.view
        .concept_by_label(label)
        .ok_or_else(|| err(format!("undefined schema concept '{}'", label)))
}

// ---- define -----------------------------------------------------------

fn create_type(tx: &Transaction, st: &mut TxState, decl: &TypeDecl) -> Result<ConceptId> {
    match &decl.kind {
        TypeKind::Entity => tx.put_entity_type_locked(st, &decl.label),
        TypeKind::Relation => tx.put_relation_type_locked(st, &decl.label),
        TypeKind::Attribute(dt) => tx.put_attribute_type_locked(st, &decl.label, *dt),
        TypeKind::Role => tx.put_role_locked(st, &decl.label),
    }
}

fn define(tx: &Transaction, st: &mut TxState, items: &[DefineItem]) -> Result<()> {
    // Two passes so forward references within one define resolve: create
    // every declared type and every role a relates clause mentions, then
    // wire hierarchy, plays, relates and keys.
    for item in items {
        if let DefineItem::Type(decl) = item {
            create_type(tx, st, decl)?;
            for role in &decl.relates {
                tx.put_role_locked(st, role)?;
            }
            for (role, _) in &decl.plays {
                tx.put_role_locked(st, role)?;
            }
        }
    }
    for item in items {
        match item {
            DefineItem::Type(decl) => {
                let id = require_label(st, &decl.label)?;
                if let Some(sup) = &decl.sup {
                    let sup_id = require_label(st, sup)?;
                    tx.set_sup_locked(st, id, sup_id)?;
                }
                if decl.is_abstract {
                    tx.set_abstract_locked(st, id, true)?;
                }
                for role in &decl.relates {
                    let role_id = require_label(st, role)?;
                    tx.add_relates_locked(st, id, role_id)?;
                }
                for (role, plays) in &decl.plays {
                    let role_id = require_label(st, role)?;
                    tx.add_plays_locked(st, id, role_id, plays.required)?;
                }
                for key in &decl.keys {
                    let attr_id = require_label(st, key)?;
                    tx.add_key_locked(st, id, attr_id)?;
                }
                for owned in &decl.owns {
                    require_label(st, owned)?;
                }
            }
            DefineItem::Rule(rule) => {
                tx.put_rule_locked(st, &rule.label, rule.when.clone(), rule.then.clone())?;
            }
        }
    }
    Ok(())
}

// ---- insert -----------------------------------------------------------

fn insert(tx: &Transaction, st: &mut TxState, stmts: &[Statement]) -> Result<ConceptMap> {
    let mut m = ConceptMap::default();
    // Bind id references first, then isa creations, then wire relations
    // and ownerships.
    for s in stmts {
        if let Statement::Id { var, id } = s {
            st.view
                .vertex(*id)
                .ok_or_else(|| err(format!("no concept with id {}", id)))?;
            m.bind(&var.0, *id);
        }
    }
    for s in stmts {
        if let Statement::Isa { var, label } = s {
            if m.get(&var.0).is_some() {
                continue;
            }
            let tid = require_label(st, label)?;
            let data = st
                .view
                .vertex(tid)
                .ok_or_else(|| err(format!("no such concept {}", tid)))?
                .data;
            let id = match data {
                VertexData::EntityType(_) => {
                    tx.insert_entity_locked(st, tid, Provenance::Written)?
                }
                VertexData::RelationType(_) => {
                    tx.insert_relation_locked(st, tid, Provenance::Written)?
                }
                VertexData::AttributeType { .. } => {
                    return Err(err(format!(
                        "attribute '{}' is inserted through has, with a value",
                        label
                    )))
                }
                other => {
                    return Err(err(format!(
                        "'{}' is a {}, not an instantiable type",
                        label,
                        other.kind_name()
                    )))
                }
            };
            m.bind(&var.0, id);
        }
    }
    for s in stmts {
        match s {
            Statement::Has { owner, attr, value } => {
                let owner_id = m
                    .get(&owner.0)
                    .ok_or_else(|| err(format!("owner ${} is not bound", owner.0)))?;
                let attr_type = require_label(st, attr)?;
                let val = match value {
                    ValueRef::Const(v) => v.clone(),
                    ValueRef::Var(v) => {
                        let aid = m
                            .get(&v.0)
                            .ok_or_else(|| err(format!("value ${} is not bound", v.0)))?;
                        st.view
                            .vertex(aid)
                            .and_then(|x| x.data.value().cloned())
                            .ok_or_else(|| err(format!("${} is not an attribute", v.0)))?
                    }
                };
                let aid = tx.insert_attribute_locked(st, attr_type, val, Provenance::Written)?;
                tx.add_has_locked(st, owner_id, aid, Provenance::Written)?;
            }
            Statement::Rel {
                var,
                label,
                players,
            } => {
                let rel_id = match m.get(&var.0) {
                    Some(id) => id,
                    None => {
                        let l = label
                            .as_ref()
                            .ok_or_else(|| err("relation insert needs a relation type"))?;
                        let tid = require_label(st, l)?;
                        let id = tx.insert_relation_locked(st, tid, Provenance::Written)?;
                        m.bind(&var.0, id);
                        id
                    }
                };
                for (role_label, pvar) in players {
                    let role_label = role_label
                        .as_ref()
                        .ok_or_else(|| err("insert requires explicit role names"))?;
                    let role = require_label(st, role_label)?;
                    let player = m
                        .get(&pvar.0)
                        .ok_or_else(|| err(format!("player ${} is not bound", pvar.0)))?;
                    tx.add_role_player_locked(st, rel_id, role, player, Provenance::Written)?;
                }
            }
            Statement::Cmp { .. } => return Err(err("comparisons cannot be inserted")),
            Statement::Isa { .. } | Statement::Id { .. } => {}
        }
    }
    Ok(m)
}

// ---- match ------------------------------------------------------------

pub(crate) fn match_statements(
    st: &mut TxState,
    stmts: &[Statement],
    seed: ConceptMap,
) -> Result<Vec<ConceptMap>> {
    let mut bindings = vec![seed];
    for s in stmts {
        let mut next = Vec::new();
        for b in std::mem::take(&mut bindings) {
            extend(st, s, &b, &mut next)?;
        }
        bindings = next;
        if bindings.is_empty() {
            break;
        }
    }
    bindings.sort();
    bindings.dedup();
    Ok(bindings)
}

fn all_things(st: &mut TxState) -> Vec<ConceptId> {
    st.view.instances(META_THING)
}

fn extend(
    st: &mut TxState,
    s: &Statement,
    b: &ConceptMap,
    out: &mut Vec<ConceptMap>,
) -> Result<()> {
    match s {
        Statement::Isa { var, label } => {
            let tid = require_label(st, label)?;
            match b.get(&var.0) {
                Some(bound) => {
                    if let Some(t) = st.view.type_of(bound) {
                        if st.view.subs(tid).contains(&t) {
                            out.push(b.clone());
                        }
                    }
                }
                None => {
                    for inst in st.view.instances(tid) {
                        let mut nb = b.clone();
                        nb.bind(&var.0, inst);
                        out.push(nb);
                    }
                }
            }
        }
        Statement::Id { var, id } => match b.get(&var.0) {
            Some(bound) => {
                if bound == *id {
                    out.push(b.clone());
                }
            }
            None => {
                if st.view.vertex(*id).is_some() {
                    let mut nb = b.clone();
                    nb.bind(&var.0, *id);
                    out.push(nb);
                }
            }
        },
        Statement::Has { owner, attr, value } => {
            let attr_type = require_label(st, attr)?;
            let attr_subs = st.view.subs(attr_type);
            let owners = match b.get(&owner.0) {
                Some(o) => vec![o],
                None => all_things(st),
            };
            for o in owners {
                for aid in st.view.attributes_of(o) {
                    let at = match st.view.type_of(aid) {
                        Some(t) => t,
                        None => continue,
                    };
                    if !attr_subs.contains(&at) {
                        continue;
                    }
                    let av = match st.view.vertex(aid).and_then(|v| v.data.value().cloned()) {
                        Some(v) => v,
                        None => continue,
                    };
                    let mut nb = b.clone();
                    nb.bind(&owner.0, o);
                    match value {
                        ValueRef::Const(want) => {
                            if av == *want {
                                out.push(nb);
                            }
                        }
                        ValueRef::Var(avar) => match b.get(&avar.0) {
                            Some(bound) => {
                                if bound == aid {
                                    out.push(nb);
                                }
                            }
                            None => {
                                nb.bind(&avar.0, aid);
                                out.push(nb);
                            }
                        },
                    }
                }
            }
        }
        Statement::Rel {
            var,
            label,
            players,
        } => {
            let candidates = match b.get(&var.0) {
                Some(r) => vec![r],
                None => {
                    let tid = match label {
                        Some(l) => require_label(st, l)?,
                        None => META_RELATION,
                    };
                    st.view.instances(tid)
                }
            };
            let mut role_filters: Vec<Option<Vec<ConceptId>>> = Vec::new();
            for (role_label, _) in players {
                role_filters.push(match role_label {
                    Some(l) => {
                        let rid = require_label(st, l)?;
                        Some(st.view.subs(rid))
                    }
                    None => None,
                });
            }
            for rel in candidates {
                if let Some(l) = label {
                    let tid = require_label(st, l)?;
                    match st.view.type_of(rel) {
                        Some(t) if st.view.subs(tid).contains(&t) => {}
                        _ => continue,
                    }
                }
                let castings = st.view.castings(rel);
                let mut m0 = b.clone();
                m0.bind(&var.0, rel);
                let mut used = vec![false; castings.len()];
                assign_players(players, &role_filters, &castings, 0, &mut used, &m0, out);
            }
        }
        Statement::Cmp { var, op, value } => {
            let aid = b
                .get(&var.0)
                .ok_or_else(|| err(format!("comparison on unbound variable ${}", var.0)))?;
            if let Some(av) = st.view.vertex(aid).and_then(|v| v.data.value().cloned()) {
                if op.test(&av, value) {
                    out.push(b.clone());
                }
            }
        }
    }
    Ok(())
}

// Match each player pattern to a distinct casting; two player variables
// never share one casting, but one relation may cast the same role twice.
fn assign_players(
    players: &[(Option<String>, Var)],
    role_filters: &[Option<Vec<ConceptId>>],
    castings: &[(ConceptId, ConceptId)],
    idx: usize,
    used: &mut Vec<bool>,
    m: &ConceptMap,
    out: &mut Vec<ConceptMap>,
) {
    if idx == players.len() {
        out.push(m.clone());
        return;
    }
    let (_, pvar) = &players[idx];
    for (ci, (crole, cplayer)) in castings.iter().enumerate() {
        if used[ci] {
            continue;
        }
        if let Some(filter) = &role_filters[idx] {
            if !filter.contains(crole) {
                continue;
            }
        }
        if let Some(bound) = m.get(&pvar.0) {
            if bound != *cplayer {
                continue;
            }
        }
        let mut nm = m.clone();
        nm.bind(&pvar.0, *cplayer);
        used[ci] = true;
        assign_players(players, role_filters, castings, idx + 1, used, &nm, out);
        used[ci] = false;
    }
}

// ---- inference --------------------------------------------------------

pub(crate) fn match_conjunction(
    st: &mut TxState,
    conj: &Conjunction,
) -> Result<Vec<ConceptMap>> {
    let mut maps = match_statements(st, &conj.statements, ConceptMap::default())?;
    for neg in &conj.negations {
        let mut kept = Vec::new();
        for m in maps {
            if match_statements(st, neg, m.clone())?.is_empty() {
                kept.push(m);
            }
        }
        maps = kept;
    }
    Ok(maps)
}

// Forward-chain every rule until nothing new materializes. Derived
// concepts are staged with Inferred provenance, which is what keeps them
// out of the commit unless written data comes to reference them.
fn materialize(tx: &Transaction, st: &mut TxState) -> Result<()> {
    let rule_ids: Vec<ConceptId> = st
        .view
        .schema_concepts()
        .into_iter()
        .filter(|id| {
            st.view
                .vertex(*id)
                .map_or(false, |v| v.data.is_rule())
        })
        .collect();
    if rule_ids.is_empty() {
        return Ok(());
    }
    for _pass in 0..MAX_INFERENCE_PASSES {
        let mut changed = false;
        for rid in &rule_ids {
            let rule = match st.view.vertex(*rid).map(|v| v.data) {
                Some(VertexData::Rule(r)) => r,
                _ => continue,
            };
            for conj in rule.when.dnf()? {
                for m in match_conjunction(st, &conj)? {
                    changed |= apply_conclusion(tx, st, &rule.then, &m)?;
                }
            }
        }
        if !changed {
            return Ok(());
        }
    }
    debug!(
        target: "trellis",
        passes = MAX_INFERENCE_PASSES,
        "inference stopped before reaching a fixpoint"
    );
    Ok(())
}

fn apply_conclusion(
    tx: &Transaction,
    st: &mut TxState,
    then: &Pattern,
    m: &ConceptMap,
) -> Result<bool> {
    let dnf = then.dnf()?;
    let conj = dnf
        .first()
        .ok_or_else(|| err("rule conclusion is empty"))?;
    let mut changed = false;
    for s in &conj.statements {
        match s {
            Statement::Has {
                owner,
                attr,
                value: ValueRef::Const(v),
            } => {
                let owner_id = m
                    .get(&owner.0)
                    .ok_or_else(|| err("rule conclusion references an unbound variable"))?;
                let attr_type = require_label(st, attr)?;
                let attr_subs = st.view.subs(attr_type);
                let owned = st.view.attributes_of(owner_id);
                let mut exists = false;
                for aid in owned {
                    let type_ok = st
                        .view
                        .type_of(aid)
                        .map_or(false, |t| attr_subs.contains(&t));
                    if type_ok
                        && st.view.vertex(aid).and_then(|x| x.data.value().cloned())
                            == Some(v.clone())
                    {
                        exists = true;
                        break;
                    }
                }
                if exists {
                    continue;
                }
                let aid =
                    tx.insert_attribute_locked(st, attr_type, v.clone(), Provenance::Inferred)?;
                tx.add_has_locked(st, owner_id, aid, Provenance::Inferred)?;
                changed = true;
            }
            Statement::Rel {
                var: _,
                label: Some(l),
                players,
            } => {
                let tid = require_label(st, l)?;
                let mut desired: Vec<(ConceptId, ConceptId)> = Vec::new();
                for (role_label, pvar) in players {
                    let role_label = role_label
                        .as_ref()
                        .ok_or_else(|| err("rule conclusion requires explicit role names"))?;
                    let role = require_label(st, role_label)?;
                    let player = m
                        .get(&pvar.0)
                        .ok_or_else(|| err("rule conclusion references an unbound variable"))?;
                    desired.push((role, player));
                }
                desired.sort();
                let existing = st.view.instances(tid);
                let mut exists = false;
                for r in existing {
                    let mut cs = st.view.castings(r);
                    cs.sort();
                    if cs == desired {
                        exists = true;
                        break;
                    }
                }
                if exists {
                    continue;
                }
                let rel = tx.insert_relation_locked(st, tid, Provenance::Inferred)?;
                for (role, player) in desired {
                    tx.add_role_player_locked(st, rel, role, player, Provenance::Inferred)?;
                }
                changed = true;
            }
            _ => return Err(err("unsupported rule conclusion form")),
        }
    }
    Ok(changed)
}
