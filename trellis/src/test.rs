// The end-to-end scenarios, driven through the outermost surface: server,
// session, transaction, AST-level queries.

use std::sync::mpsc;

use test_log::test;

use crate::{
    Aggregate, Answer, Comparator, Config, Datatype, DefineItem, ErrorKind, Pattern, Query,
    RuleDecl, Server, Statement, TypeDecl, Value, ValueRef, Var,
};

fn isa(var: &str, label: &str) -> Statement {
    Statement::Isa {
        var: Var::new(var),
        label: label.to_string(),
    }
}

fn has_const(owner: &str, attr: &str, v: Value) -> Statement {
    Statement::Has {
        owner: Var::new(owner),
        attr: attr.to_string(),
        value: ValueRef::Const(v),
    }
}

fn has_var(owner: &str, attr: &str, val_var: &str) -> Statement {
    Statement::Has {
        owner: Var::new(owner),
        attr: attr.to_string(),
        value: ValueRef::Var(Var::new(val_var)),
    }
}

fn friendship(var: &str, x: &str, y: &str) -> Statement {
    Statement::Rel {
        var: Var::new(var),
        label: Some("friendship".to_string()),
        players: vec![
            (Some("friend".to_string()), Var::new(x)),
            (Some("friend".to_string()), Var::new(y)),
        ],
    }
}

fn get(patterns: Vec<Statement>) -> Query {
    Query::Get {
        patterns,
        vars: Vec::new(),
    }
}

fn count(patterns: Vec<Statement>) -> Query {
    Query::Aggregate {
        patterns,
        aggregate: Aggregate::Count,
    }
}

fn social_schema() -> Query {
    Query::Define(vec![
        DefineItem::Type(TypeDecl::entity("person").plays("friend")),
        DefineItem::Type(TypeDecl::relation("friendship").relates("friend")),
    ])
}

// define, insert, delete, then count what is left.
#[test]
fn test_scenario_define_insert_delete() {
    let server = Server::new(Config::default());
    let session = server.session("social").unwrap();

    let tx = session.transaction().write().unwrap();
    tx.execute(&social_schema(), false).unwrap();
    tx.commit().unwrap();

    let tx = session.transaction().write().unwrap();
    let answers = tx
        .execute(
            &Query::Insert(vec![
                isa("x", "person"),
                isa("y", "person"),
                friendship("r", "x", "y"),
            ]),
            false,
        )
        .unwrap();
    let r = match &answers[0] {
        Answer::Map(m) => m.get("r").unwrap(),
        other => panic!("unexpected answer {:?}", other),
    };
    tx.commit().unwrap();

    let tx = session.transaction().write().unwrap();
    tx.execute(
        &Query::Delete {
            patterns: vec![Statement::Id {
                var: Var::new("r"),
                id: r,
            }],
            delete: vec![Var::new("r")],
        },
        false,
    )
    .unwrap();
    tx.commit().unwrap();

    let tx = session.transaction().read().unwrap();
    assert_eq!(
        tx.execute(&count(vec![isa("x", "person")]), false).unwrap(),
        vec![Answer::Count(2)]
    );
    assert!(tx
        .execute(
            &get(vec![Statement::Id {
                var: Var::new("r"),
                id: r,
            }]),
            false,
        )
        .unwrap()
        .is_empty());
    tx.close();
    server.shutdown();
}

// A rule derives data for queries with inference on, and none of it
// survives the transaction.
#[test]
fn test_scenario_inference_is_not_persisted() {
    let server = Server::new(Config::default());
    let session = server.session("scores").unwrap();

    let tx = session.transaction().write().unwrap();
    tx.execute(
        &Query::Define(vec![
            DefineItem::Type(TypeDecl::entity("person")),
            DefineItem::Type(TypeDecl::attribute("score", Datatype::Float)),
            DefineItem::Type(TypeDecl::attribute("name", Datatype::Text)),
            DefineItem::Rule(RuleDecl {
                label: "high-scorers-are-ganesh".to_string(),
                when: Pattern::And(vec![
                    Pattern::Stmt(isa("p", "person")),
                    Pattern::Stmt(has_var("p", "score", "s")),
                    Pattern::Stmt(Statement::Cmp {
                        var: Var::new("s"),
                        op: Comparator::Gt,
                        value: 0.0.into(),
                    }),
                ]),
                then: Pattern::Stmt(has_const("p", "name", "Ganesh".into())),
            }),
        ]),
        false,
    )
    .unwrap();
    tx.commit().unwrap();

    let tx = session.transaction().write().unwrap();
    tx.execute(
        &Query::Insert(vec![isa("p", "person"), has_const("p", "score", 10.0.into())]),
        false,
    )
    .unwrap();
    tx.commit().unwrap();

    let tx = session.transaction().read().unwrap();
    let inferred = tx
        .execute(
            &get(vec![isa("p", "person"), has_const("p", "name", "Ganesh".into())]),
            true,
        )
        .unwrap();
    assert_eq!(inferred.len(), 1);
    tx.close();

    let tx = session.transaction().read().unwrap();
    assert!(tx
        .execute(
            &get(vec![isa("p", "person"), has_const("p", "name", "Ganesh".into())]),
            false,
        )
        .unwrap()
        .is_empty());
    tx.close();
    server.shutdown();
}

// Staged writes are invisible to a transaction on another thread.
#[test]
fn test_scenario_uncommitted_isolation() {
    let server = Server::new(Config::default());
    let session = server.session("iso").unwrap();

    let tx = session.transaction().write().unwrap();
    tx.execute(&social_schema(), false).unwrap();
    tx.commit().unwrap();

    let tx_write = session.transaction().write().unwrap();
    tx_write
        .execute(&Query::Insert(vec![isa("x", "person")]), false)
        .unwrap();

    let counted = std::thread::spawn({
        let session = session.clone();
        move || {
            let tx = session.transaction().read().unwrap();
            let got = tx.execute(&count(vec![isa("x", "person")]), false).unwrap();
            tx.close();
            got
        }
    })
    .join()
    .unwrap();
    assert_eq!(counted, vec![Answer::Count(0)]);
    tx_write.close();
    server.shutdown();
}

// A transaction that was already open observes a commit on rows it has
// not read before.
#[test]
fn test_scenario_read_committed_on_fresh_rows() {
    let server = Server::new(Config::default());
    let session_a = server.session("rc").unwrap();
    let session_b = server.session("rc").unwrap();

    let tx = session_a.transaction().write().unwrap();
    tx.execute(&social_schema(), false).unwrap();
    tx.commit().unwrap();

    let tx_b = session_b.transaction().read().unwrap();

    let tx_a = session_a.transaction().write().unwrap();
    tx_a.execute(&Query::Insert(vec![isa("x", "person")]), false)
        .unwrap();
    tx_a.commit().unwrap();

    assert_eq!(
        tx_b.execute(&count(vec![isa("x", "person")]), false)
            .unwrap(),
        vec![Answer::Count(1)]
    );
    tx_b.close();
    server.shutdown();
}

// A read transaction can stage but never commit mutations.
#[test]
fn test_scenario_read_only_commit() {
    let server = Server::new(Config::default());
    let session = server.session("ro").unwrap();
    let tx = session.transaction().read().unwrap();
    tx.put_entity_type("x").unwrap();
    assert_eq!(tx.commit().unwrap_err().kind(), ErrorKind::ReadOnlyCommit);
    server.shutdown();
}

// One open transaction per thread per session, freed by closing.
#[test]
fn test_scenario_one_transaction_per_thread() {
    let server = Server::new(Config::default());
    let session = server.session("solo").unwrap();

    let tx1 = session.transaction().write().unwrap();
    assert_eq!(
        session.transaction().write().unwrap_err().kind(),
        ErrorKind::ConcurrentTransactionOnThread
    );
    tx1.close();
    let tx3 = session.transaction().write().unwrap();
    tx3.close();
    server.shutdown();
}

// Concept ids are handed out strictly increasing across transactions.
#[test]
fn test_ids_increase_across_transactions() {
    let server = Server::new(Config::default());
    let session = server.session("ids").unwrap();

    let tx = session.transaction().write().unwrap();
    tx.execute(&social_schema(), false).unwrap();
    tx.commit().unwrap();

    let mut last = None;
    for _ in 0..3 {
        let tx = session.transaction().write().unwrap();
        let person = tx.get_entity_type("person").unwrap().unwrap();
        for _ in 0..20 {
            let id = tx.insert_entity(person).unwrap();
            if let Some(prev) = last {
                assert!(id > prev, "{} should exceed {}", id, prev);
            }
            last = Some(id);
        }
        tx.commit().unwrap();
    }
    server.shutdown();
}

// Closing a session mid-flight interrupts nobody else's keyspace.
#[test]
fn test_sessions_close_independently() {
    let server = Server::new(Config::default());
    let a = server.session("shared").unwrap();
    let b = server.session("shared").unwrap();

    let (opened_tx, opened_rx) = mpsc::channel();
    let (close_tx, close_rx) = mpsc::channel();
    let holder = std::thread::spawn({
        let a = a.clone();
        move || {
            let tx = a.transaction().write().unwrap();
            opened_tx.send(()).unwrap();
            close_rx.recv().unwrap();
            tx.put_entity_type("x").unwrap_err().kind()
        }
    });
    opened_rx.recv().unwrap();
    a.close();
    close_tx.send(()).unwrap();
    assert_eq!(holder.join().unwrap(), ErrorKind::TransactionClosed);

    // Session b still works against the same keyspace.
    let tx = b.transaction().write().unwrap();
    tx.put_entity_type("survivor").unwrap();
    tx.commit().unwrap();
    server.shutdown();
}
