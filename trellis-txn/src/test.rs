use std::sync::Arc;

use trellis_base::ConceptId;
use trellis_graph::MemStore;
use trellis_id::{IdPool, MonotonicAuthority, Namespace, Partition, PoolOptions};
use trellis_lang::{Comparator, Statement, Value, ValueRef, Var};

use crate::{AttributeIndex, Transaction, TxContext, TxMode};

mod validate;

pub(crate) fn context_over(store: Arc<MemStore>, sharding_threshold: u64) -> TxContext {
    let authority = Arc::new(MonotonicAuthority::new(512, u64::MAX));
    let pool = Arc::new(
        IdPool::new(
            authority,
            Partition(0),
            Namespace::VERTEX,
            PoolOptions::default(),
        )
        .unwrap(),
    );
    TxContext {
        store,
        pool,
        attr_index: Arc::new(AttributeIndex::new()),
        sharding_threshold,
    }
}

pub(crate) fn test_context() -> TxContext {
    context_over(Arc::new(MemStore::new()), 10_000)
}

pub(crate) fn write_tx(ctx: &TxContext) -> Transaction {
    Transaction::new(ctx.clone(), TxMode::Write)
}

pub(crate) fn read_tx(ctx: &TxContext) -> Transaction {
    Transaction::new(ctx.clone(), TxMode::Read)
}

// person plays friend, friendship relates friend.
pub(crate) fn define_social(tx: &Transaction) -> (ConceptId, ConceptId, ConceptId) {
    let person = tx.put_entity_type("person").unwrap();
    let friend = tx.put_role("friend").unwrap();
    let friendship = tx.put_relation_type("friendship").unwrap();
    tx.add_relates(friendship, friend).unwrap();
    tx.add_plays(person, friend, false).unwrap();
    (person, friend, friendship)
}

pub(crate) fn isa(var: &str, label: &str) -> Statement {
    Statement::Isa {
        var: Var::new(var),
        label: label.to_string(),
    }
}

pub(crate) fn has_const(owner: &str, attr: &str, v: Value) -> Statement {
    Statement::Has {
        owner: Var::new(owner),
        attr: attr.to_string(),
        value: ValueRef::Const(v),
    }
}

pub(crate) fn has_var(owner: &str, attr: &str, val_var: &str) -> Statement {
    Statement::Has {
        owner: Var::new(owner),
        attr: attr.to_string(),
        value: ValueRef::Var(Var::new(val_var)),
    }
}

pub(crate) fn rel(var: &str, label: Option<&str>, players: &[(&str, &str)]) -> Statement {
    Statement::Rel {
        var: Var::new(var),
        label: label.map(|l| l.to_string()),
        players: players
            .iter()
            .map(|(role, p)| (Some(role.to_string()), Var::new(*p)))
            .collect(),
    }
}

pub(crate) fn cmp(var: &str, op: Comparator, v: Value) -> Statement {
    Statement::Cmp {
        var: Var::new(var),
        op,
        value: v,
    }
}

pub(crate) fn id_stmt(var: &str, id: ConceptId) -> Statement {
    Statement::Id {
        var: Var::new(var),
        id,
    }
}
