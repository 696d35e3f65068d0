// The embedding surface: one flat namespace over the subsystem crates.
// A server owns keyspaces, a keyspace hands out sessions, a session mints
// thread-affine transactions, and a transaction stages mutations that are
// validated and persisted at commit.

pub use trellis_base::{err, ConceptId, Error, ErrorKind, Result};
pub use trellis_graph::{ChangeSet, MemStore, VertexStore};
pub use trellis_id::{
    IdAuthority, IdBlock, IdPool, MonotonicAuthority, Namespace, Partition, PoolOptions,
};
pub use trellis_lang::{
    Aggregate, Comparator, Conjunction, Datatype, DefineItem, Pattern, PlaysDecl, Query,
    QueryParser, RuleDecl, Statement, TypeDecl, TypeKind, Value, ValueRef, Var,
};
pub use trellis_server::{Config, Server, Session, TransactionBuilder};
pub use trellis_txn::{Answer, AttributeIndex, ConceptMap, Transaction, TxContext, TxMode};

#[cfg(test)]
mod test;
