// Commit-time validation: enumerate the staged mutations and verify the
// global schema and instance invariants, aggregating every problem into a
// human-readable diagnostic. Checks never short-circuit one another, so a
// failing commit reports everything it found, not just the first thing.
//
// Schema-level checks sweep the whole schema (schemas are small); the
// instance-level checks are scoped to what the transaction staged.

use std::collections::{BTreeMap, BTreeSet};

use trellis_base::ConceptId;
use trellis_graph::{Direction, EdgeKind, EdgeLabel, GraphView, VertexData};
use trellis_lang::{Conjunction, Statement};

use crate::rules::RuleGraph;

pub(crate) fn validate(view: &mut GraphView) -> Vec<String> {
    let mut diags = Vec::new();
    label_conflicts(view, &mut diags);
    let schema = view.schema_concepts();
    roles_are_related(view, &schema, &mut diags);
    relation_types_have_roles(view, &schema, &mut diags);
    relation_hierarchy_cover(view, &schema, &mut diags);
    casting_compatibility(view, &mut diags);
    required_role_cardinality(view, &mut diags);
    key_uniqueness(view, &mut diags);
    relations_not_empty(view, &mut diags);
    rules_well_formed(view, &mut diags);
    rules_stratifiable(view, &mut diags);
    diags
}

fn label_of(view: &mut GraphView, id: ConceptId) -> String {
    match view.vertex(id) {
        Some(v) => match v.data.label() {
            Some(l) => l.to_string(),
            None => format!("{}", id),
        },
        None => format!("{}", id),
    }
}

// Racing schema writers: the loser of a commit race may stage a label the
// winner just took.
fn label_conflicts(view: &mut GraphView, diags: &mut Vec<String>) {
    let mut seen: BTreeMap<String, ConceptId> = BTreeMap::new();
    for id in view.staged_vertex_ids() {
        let v = match view.vertex(id) {
            Some(v) => v,
            None => continue,
        };
        let label = match v.data.label() {
            Some(l) => l.to_string(),
            None => continue,
        };
        if let Some(committed) = view.store().vertex_by_label(&label) {
            if committed != id {
                diags.push(format!(
                    "label '{}' was defined concurrently by another transaction",
                    label
                ));
            }
        }
        if let Some(prev) = seen.insert(label.clone(), id) {
            if prev != id {
                diags.push(format!("label '{}' is staged twice", label));
            }
        }
    }
}

// (1) Every non-abstract role is related by at least one relation type.
fn roles_are_related(view: &mut GraphView, schema: &[ConceptId], diags: &mut Vec<String>) {
    for id in schema {
        let v = match view.vertex(*id) {
            Some(v) => v,
            None => continue,
        };
        if !v.data.is_role() || v.data.is_abstract() {
            continue;
        }
        if view.edges(*id, EdgeKind::Relates, Direction::In).is_empty() {
            diags.push(format!(
                "role '{}' is not related by any relation type",
                label_of(view, *id)
            ));
        }
    }
}

// (2) Every non-abstract relation type relates at least one role, possibly
// inherited.
fn relation_types_have_roles(view: &mut GraphView, schema: &[ConceptId], diags: &mut Vec<String>) {
    for id in schema {
        let v = match view.vertex(*id) {
            Some(v) => v,
            None => continue,
        };
        if !v.data.is_relation_type() || v.data.is_abstract() {
            continue;
        }
        if view.relates_closure(*id).is_empty() {
            diags.push(format!(
                "relation type '{}' relates no roles",
                label_of(view, *id)
            ));
        }
    }
}

// (3) Downward cover between a relation type and its non-abstract super:
// every declared role specializes a role from above, and every super role
// is covered by some declared role.
fn relation_hierarchy_cover(view: &mut GraphView, schema: &[ConceptId], diags: &mut Vec<String>) {
    for id in schema {
        let v = match view.vertex(*id) {
            Some(v) => v,
            None => continue,
        };
        if !v.data.is_relation_type() || v.data.is_abstract() {
            continue;
        }
        let sup = match view.sup(*id) {
            Some(s) => s,
            None => continue,
        };
        match view.vertex(sup) {
            Some(sv) if sv.data.is_relation_type() && !sv.data.is_abstract() => {}
            _ => continue,
        }
        let direct = view.relates(*id);
        let mut ancestor_roles: BTreeSet<ConceptId> = BTreeSet::new();
        for t in view.sups(*id).into_iter().skip(1) {
            ancestor_roles.extend(view.relates(t));
        }
        for role in &direct {
            let role_sups = view.sups(*role);
            if !role_sups.iter().any(|r| ancestor_roles.contains(r)) {
                diags.push(format!(
                    "role '{}' of relation type '{}' does not specialize any role of its supertypes",
                    label_of(view, *role),
                    label_of(view, *id)
                ));
            }
        }
        for role_s in view.relates(sup) {
            let descendants = view.subs(role_s);
            if !descendants.iter().any(|r| direct.contains(r)) {
                diags.push(format!(
                    "relation type '{}' does not cover role '{}' of its supertype '{}'",
                    label_of(view, *id),
                    label_of(view, role_s),
                    label_of(view, sup)
                ));
            }
        }
    }
}

fn role_fill_count(view: &mut GraphView, player: ConceptId, declared: ConceptId) -> usize {
    let role_subs = view.subs(declared);
    view.edges(player, EdgeKind::RolePlayer, Direction::In)
        .iter()
        .filter(|e| match e.label {
            EdgeLabel::RolePlayer { role } => role_subs.contains(&role),
            _ => false,
        })
        .count()
}

// (4) Every staged casting: the relation's type must relate the role, and
// the player's type chain must declare plays for it (a required entry also
// demands exactly one filling).
fn casting_compatibility(view: &mut GraphView, diags: &mut Vec<String>) {
    for e in view.staged_new_edges() {
        let role = match e.label {
            EdgeLabel::RolePlayer { role } => role,
            _ => continue,
        };
        let (relation, player) = (e.from, e.to);
        if view.vertex(relation).is_none() || view.vertex(player).is_none() {
            continue;
        }
        let role_sups = view.sups(role);
        if let Some(rt) = view.type_of(relation) {
            let exposed = view.relates_closure(rt);
            if !role_sups.iter().any(|r| exposed.contains(r)) {
                diags.push(format!(
                    "relation type '{}' does not relate role '{}'",
                    label_of(view, rt),
                    label_of(view, role)
                ));
            }
        }
        if let Some(pt) = view.type_of(player) {
            let plays = view.plays_closure(pt);
            match plays.iter().find(|(r, _)| role_sups.contains(r)).copied() {
                None => diags.push(format!(
                    "type '{}' of player {} does not play role '{}'",
                    label_of(view, pt),
                    player,
                    label_of(view, role)
                )),
                Some((declared, true)) => {
                    let count = role_fill_count(view, player, declared);
                    if count != 1 {
                        diags.push(format!(
                            "player {} must fill required role '{}' exactly once, found {}",
                            player,
                            label_of(view, declared),
                            count
                        ));
                    }
                }
                Some((_, false)) => {}
            }
        }
    }
}

// (5) Every staged instance, and every instance whose castings this
// transaction touched, fills each required role of its type chain exactly
// once.
fn required_role_cardinality(view: &mut GraphView, diags: &mut Vec<String>) {
    let mut affected: BTreeSet<ConceptId> = BTreeSet::new();
    for id in view.staged_vertex_ids() {
        if view.vertex(id).map_or(false, |v| v.data.is_thing()) {
            affected.insert(id);
        }
    }
    for e in view
        .staged_new_edges()
        .into_iter()
        .chain(view.staged_removed_edges())
    {
        if matches!(e.label, EdgeLabel::RolePlayer { .. }) {
            affected.insert(e.to);
        }
    }
    for i in affected {
        let t = match view.type_of(i) {
            Some(t) => t,
            None => continue,
        };
        for (role, required) in view.plays_closure(t) {
            if !required {
                continue;
            }
            let count = role_fill_count(view, i, role);
            if count != 1 {
                diags.push(format!(
                    "instance {} of type '{}' must fill required role '{}' exactly once, found {}",
                    i,
                    label_of(view, t),
                    label_of(view, role),
                    count
                ));
            }
        }
    }
}

// (6) Key uniqueness: for every staged ownership whose attribute falls
// under a key declaration on the owner's type chain, no two instances of
// the keyed type may own the same attribute value.
fn key_uniqueness(view: &mut GraphView, diags: &mut Vec<String>) {
    for e in view.staged_new_edges() {
        if e.label != EdgeLabel::Has {
            continue;
        }
        let (owner, attr) = (e.from, e.to);
        let ot = match view.type_of(owner) {
            Some(t) => t,
            None => continue,
        };
        let at = match view.type_of(attr) {
            Some(t) => t,
            None => continue,
        };
        for t in view.sups(ot) {
            for key_edge in view.edges(t, EdgeKind::Key, Direction::Out) {
                let key_attr = key_edge.to;
                if !view.subs(key_attr).contains(&at) {
                    continue;
                }
                let keyed_subs = view.subs(t);
                let owners: Vec<ConceptId> = view
                    .owners_of(attr)
                    .into_iter()
                    .filter(|o| view.type_of(*o).map_or(false, |x| keyed_subs.contains(&x)))
                    .collect();
                if owners.len() > 1 {
                    let value = view
                        .vertex(attr)
                        .and_then(|v| v.data.value().cloned());
                    diags.push(format!(
                        "key '{}' value {:?} is owned by {} instances of '{}'",
                        label_of(view, key_attr),
                        value,
                        owners.len(),
                        label_of(view, t)
                    ));
                }
            }
        }
    }
}

// (7) Every relation this transaction created or stripped castings from
// still has at least one role player.
fn relations_not_empty(view: &mut GraphView, diags: &mut Vec<String>) {
    let mut affected: BTreeSet<ConceptId> = BTreeSet::new();
    for id in view.staged_vertex_ids() {
        if view.vertex(id).map_or(false, |v| v.data.is_relation()) {
            affected.insert(id);
        }
    }
    for e in view.staged_removed_edges() {
        if matches!(e.label, EdgeLabel::RolePlayer { .. }) {
            affected.insert(e.from);
        }
    }
    for r in affected {
        match view.vertex(r) {
            Some(v) if v.data.is_relation() => {}
            _ => continue,
        }
        if view.castings(r).is_empty() {
            let t = view.type_of(r);
            diags.push(format!(
                "relation {} of type '{}' has no role players",
                r,
                t.map(|t| label_of(view, t)).unwrap_or_default()
            ));
        }
    }
}

fn pattern_vars(stmts: &[Statement], out: &mut BTreeSet<String>) {
    for s in stmts {
        match s {
            Statement::Isa { var, .. }
            | Statement::Cmp { var, .. }
            | Statement::Id { var, .. } => {
                out.insert(var.0.clone());
            }
            Statement::Has { owner, value, .. } => {
                out.insert(owner.0.clone());
                if let trellis_lang::ValueRef::Var(v) = value {
                    out.insert(v.0.clone());
                }
            }
            Statement::Rel { var, players, .. } => {
                out.insert(var.0.clone());
                for (_, p) in players {
                    out.insert(p.0.clone());
                }
            }
        }
    }
}

// Resolve the type labels a statement mentions; roles are checked for
// existence but only types feed the hypothesis/conclusion sets.
fn statement_types(
    view: &mut GraphView,
    rule: &str,
    s: &Statement,
    out: &mut BTreeSet<ConceptId>,
    diags: &mut Vec<String>,
) {
    let mut resolve = |view: &mut GraphView, label: &str, types: Option<&mut BTreeSet<ConceptId>>| {
        match view.concept_by_label(label) {
            Some(id) => {
                if let Some(types) = types {
                    types.insert(id);
                }
            }
            None => diags.push(format!("rule '{}': unknown schema concept '{}'", rule, label)),
        }
    };
    match s {
        Statement::Isa { label, .. } => resolve(view, label, Some(out)),
        Statement::Has { attr, .. } => resolve(view, attr, Some(out)),
        Statement::Rel { label, players, .. } => {
            if let Some(l) = label {
                resolve(view, l, Some(out));
            }
            for (role, _) in players {
                if let Some(role) = role {
                    resolve(view, role, None);
                }
            }
        }
        Statement::Cmp { .. } | Statement::Id { .. } => {}
    }
}

// (8) Rule well-formedness: when and then normalize to exactly one
// conjunction, the head is a single positive statement of a concludable
// form with only body-bound variables, and every mentioned schema concept
// exists. Resolving the labels also populates the rule's hypothesis and
// conclusion sets, which feed the stratifiability check.
fn rules_well_formed(view: &mut GraphView, diags: &mut Vec<String>) {
    for id in view.staged_vertex_ids() {
        let v = match view.vertex(id) {
            Some(v) => v,
            None => continue,
        };
        let mut rule = match &v.data {
            VertexData::Rule(r) => r.clone(),
            _ => continue,
        };
        let when: Vec<Conjunction> = match rule.when.dnf() {
            Ok(w) => w,
            Err(_) => {
                diags.push(format!("rule '{}': malformed when pattern", rule.label));
                continue;
            }
        };
        if when.len() != 1 {
            diags.push(format!(
                "rule '{}': when must normalize to a single conjunction",
                rule.label
            ));
            continue;
        }
        let then: Vec<Conjunction> = match rule.then.dnf() {
            Ok(t) => t,
            Err(_) => {
                diags.push(format!("rule '{}': malformed then pattern", rule.label));
                continue;
            }
        };
        if then.len() != 1 || !then[0].negations.is_empty() || then[0].statements.len() != 1 {
            diags.push(format!(
                "rule '{}': then must be a single positive statement",
                rule.label
            ));
            continue;
        }
        let head = &then[0].statements[0];
        let head_ok = matches!(
            head,
            Statement::Has {
                value: trellis_lang::ValueRef::Const(_),
                ..
            } | Statement::Rel { label: Some(_), .. }
        );
        if !head_ok {
            diags.push(format!(
                "rule '{}': conclusion must be a has with a constant value or a typed relation",
                rule.label
            ));
        }

        let mut body_vars = BTreeSet::new();
        pattern_vars(&when[0].statements, &mut body_vars);
        let mut head_vars = BTreeSet::new();
        match head {
            Statement::Has { owner, .. } => {
                head_vars.insert(owner.0.clone());
            }
            Statement::Rel { players, .. } => {
                for (_, p) in players {
                    head_vars.insert(p.0.clone());
                }
            }
            _ => {}
        }
        for hv in &head_vars {
            if !body_vars.contains(hv) {
                diags.push(format!(
                    "rule '{}': conclusion variable ${} is not bound by when",
                    rule.label, hv
                ));
            }
        }

        rule.positive_hypothesis.clear();
        rule.negative_hypothesis.clear();
        rule.conclusion.clear();
        let mut positive = BTreeSet::new();
        for s in &when[0].statements {
            statement_types(view, &rule.label, s, &mut positive, diags);
        }
        let mut negative = BTreeSet::new();
        for neg in &when[0].negations {
            for s in neg {
                statement_types(view, &rule.label, s, &mut negative, diags);
            }
        }
        let mut conclusion = BTreeSet::new();
        statement_types(view, &rule.label, head, &mut conclusion, diags);
        rule.positive_hypothesis = positive;
        rule.negative_hypothesis = negative;
        rule.conclusion = conclusion;

        let mut updated = v;
        updated.data = VertexData::Rule(rule);
        view.stage_vertex(updated);
    }
}

// (9) Stratifiability over the whole committed-plus-staged rule set.
fn rules_stratifiable(view: &mut GraphView, diags: &mut Vec<String>) {
    let mut graph = RuleGraph::new();
    for id in view.schema_concepts() {
        let rule = match view.vertex(id).map(|v| v.data) {
            Some(VertexData::Rule(r)) => r,
            _ => continue,
        };
        for conclusion in &rule.conclusion {
            for t in rule.positive_hypothesis.iter().chain(rule.conclusion.iter()) {
                graph.add_edge(*t, *conclusion, false);
            }
            for t in &rule.negative_hypothesis {
                graph.add_edge(*t, *conclusion, true);
            }
        }
    }
    for (from, to) in graph.negative_cycle_edges() {
        diags.push(format!(
            "rule set is not stratifiable: '{}' is negated inside a cycle that produces '{}'",
            label_of(view, from),
            label_of(view, to)
        ));
    }
}
