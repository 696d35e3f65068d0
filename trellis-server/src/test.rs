use std::sync::mpsc;

use test_log::test;

use crate::{Config, Server};
use trellis_base::ErrorKind;

#[test]
fn test_config_defaults() {
    let config = Config::default();
    assert_eq!(config.sharding_threshold, 10_000);
    assert!(config.id_renew_buffer_percentage > 0.0);
    assert!(config.id_renew_buffer_percentage <= 1.0);
}

#[test]
fn test_keyspaces_are_isolated() {
    let server = Server::new(Config::default());
    let red = server.session("red").unwrap();
    let blue = server.session("blue").unwrap();
    assert_ne!(
        server.partition_of("red").unwrap(),
        server.partition_of("blue").unwrap()
    );

    let tx = red.transaction().write().unwrap();
    tx.put_entity_type("person").unwrap();
    tx.commit().unwrap();

    let tx = blue.transaction().read().unwrap();
    assert_eq!(tx.get_entity_type("person").unwrap(), None);
    tx.close();

    let tx = red.transaction().read().unwrap();
    assert!(tx.get_entity_type("person").unwrap().is_some());
    tx.close();
    server.shutdown();
}

#[test]
fn test_one_transaction_per_thread_per_session() {
    let server = Server::new(Config::default());
    let session = server.session("ks").unwrap();

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

#[test]
fn test_transactions_on_distinct_threads_coexist() {
    let server = Server::new(Config::default());
    let session = server.session("ks").unwrap();

    let tx_main = session.transaction().write().unwrap();
    let other = std::thread::spawn({
        let session = session.clone();
        move || {
            let tx = session.transaction().write().unwrap();
            tx.put_entity_type("from-elsewhere").unwrap();
            tx.commit().unwrap();
        }
    });
    other.join().unwrap();
    tx_main.close();
    server.shutdown();
}

#[test]
fn test_session_close_closes_outstanding_transactions() {
    let server = Server::new(Config::default());
    let session = server.session("ks").unwrap();

    let tx_main = session.transaction().write().unwrap();

    // A transaction held open on another thread.
    let (ready_tx, ready_rx) = mpsc::channel();
    let (closed_tx, closed_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();
    let holder = std::thread::spawn({
        let session = session.clone();
        move || {
            let tx = session.transaction().write().unwrap();
            ready_tx.send(()).unwrap();
            closed_rx.recv().unwrap();
            result_tx
                .send(tx.put_entity_type("late").unwrap_err().kind())
                .unwrap();
        }
    });
    ready_rx.recv().unwrap();

    session.close();
    closed_tx.send(()).unwrap();

    assert_eq!(
        tx_main.put_entity_type("late").unwrap_err().kind(),
        ErrorKind::TransactionClosed
    );
    assert_eq!(result_rx.recv().unwrap(), ErrorKind::TransactionClosed);
    holder.join().unwrap();

    assert_eq!(
        session.transaction().read().unwrap_err().kind(),
        ErrorKind::SessionClosed
    );
    server.shutdown();
}

#[test]
fn test_sessions_share_a_keyspace_store() {
    let server = Server::new(Config::default());
    let a = server.session("ks").unwrap();
    let b = server.session("ks").unwrap();

    let tx = a.transaction().write().unwrap();
    tx.put_entity_type("person").unwrap();
    tx.commit().unwrap();

    let tx = b.transaction().read().unwrap();
    assert!(tx.get_entity_type("person").unwrap().is_some());
    tx.close();
    server.shutdown();
}

#[test]
fn test_shutdown_closes_everything() {
    let server = Server::new(Config::default());
    let session = server.session("ks").unwrap();
    let tx = session.transaction().write().unwrap();

    server.shutdown();
    server.shutdown();

    assert_eq!(
        tx.put_entity_type("x").unwrap_err().kind(),
        ErrorKind::TransactionClosed
    );
    assert_eq!(
        session.transaction().read().unwrap_err().kind(),
        ErrorKind::SessionClosed
    );
    assert_eq!(
        server.session("other").unwrap_err().kind(),
        ErrorKind::SessionClosed
    );
}

#[test]
fn test_delete_keyspace_drops_data() {
    let server = Server::new(Config::default());
    let session = server.session("ks").unwrap();
    let tx = session.transaction().write().unwrap();
    tx.put_entity_type("person").unwrap();
    tx.commit().unwrap();

    server.delete_keyspace("ks").unwrap();
    assert!(session.is_closed());
    assert!(!server.keyspaces().contains(&"ks".to_string()));

    // Recreating the keyspace starts from scratch.
    let session = server.session("ks").unwrap();
    let tx = session.transaction().read().unwrap();
    assert_eq!(tx.get_entity_type("person").unwrap(), None);
    tx.close();
    server.shutdown();
}
