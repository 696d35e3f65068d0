use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rapidhash::RapidHashMap;
use tracing::debug;

use trellis_base::{err_kind, ErrorKind, Result};
use trellis_graph::VertexStore;
use trellis_id::IdPool;
use trellis_txn::{AttributeIndex, Transaction, TxContext, TxHandle, TxMode};

// One client's handle onto a keyspace: mints thread-affine transactions,
// owns the keyspace caches shared across them (the attribute-by-value
// index), and closes whatever it minted when it shuts down. A session
// allows one open transaction per thread but any number across threads.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

pub(crate) struct SessionShared {
    keyspace: String,
    store: Arc<dyn VertexStore>,
    pool: Arc<IdPool>,
    attr_index: Arc<AttributeIndex>,
    sharding_threshold: u64,
    state: Mutex<SessionState>,
}

struct SessionState {
    closed: bool,
    // The open transaction per thread; the handle list is what close()
    // sweeps on shutdown.
    per_thread: RapidHashMap<ThreadId, TxHandle>,
    all: Vec<TxHandle>,
}

impl SessionShared {
    pub(crate) fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        let outstanding = st.all.len();
        for handle in st.all.drain(..) {
            handle.force_close();
        }
        st.per_thread.clear();
        debug!(
            target: "trellis",
            keyspace = self.keyspace.as_str(),
            outstanding,
            "closed session"
        );
    }
}

pub struct TransactionBuilder<'a> {
    session: &'a Session,
}

impl TransactionBuilder<'_> {
    pub fn read(self) -> Result<Transaction> {
        self.session.open(TxMode::Read)
    }
    pub fn write(self) -> Result<Transaction> {
        self.session.open(TxMode::Write)
    }
}

impl Session {
    pub(crate) fn new(
        keyspace: String,
        store: Arc<dyn VertexStore>,
        pool: Arc<IdPool>,
        sharding_threshold: u64,
    ) -> Session {
        Session {
            shared: Arc::new(SessionShared {
                keyspace,
                store,
                pool,
                attr_index: Arc::new(AttributeIndex::new()),
                sharding_threshold,
                state: Mutex::new(SessionState {
                    closed: false,
                    per_thread: RapidHashMap::default(),
                    all: Vec::new(),
                }),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn keyspace(&self) -> &str {
        &self.shared.keyspace
    }

    pub fn transaction(&self) -> TransactionBuilder<'_> {
        TransactionBuilder { session: self }
    }

    fn open(&self, mode: TxMode) -> Result<Transaction> {
        let mut st = self.shared.state.lock();
        if st.closed {
            return Err(err_kind(ErrorKind::SessionClosed, "session is closed"));
        }
        let thread = thread::current().id();
        if let Some(existing) = st.per_thread.get(&thread) {
            if existing.is_open() {
                return Err(err_kind(
                    ErrorKind::ConcurrentTransactionOnThread,
                    "a transaction is already open on this thread for this session",
                ));
            }
        }
        let tx = Transaction::new(
            TxContext {
                store: self.shared.store.clone(),
                pool: self.shared.pool.clone(),
                attr_index: self.shared.attr_index.clone(),
                sharding_threshold: self.shared.sharding_threshold,
            },
            mode,
        );
        st.per_thread.insert(thread, tx.handle());
        st.all.push(tx.handle());
        Ok(tx)
    }

    // Idempotent; closes every outstanding transaction this session
    // minted, on whatever thread it lives.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}
