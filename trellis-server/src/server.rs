use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use trellis_base::{err_kind, ErrorKind, Result};
use trellis_graph::{MemStore, VertexStore};
use trellis_id::{IdAuthority, IdPool, MonotonicAuthority, Namespace, Partition, PoolOptions};

use crate::config::Config;
use crate::session::{Session, SessionShared};

struct Keyspace {
    partition: Partition,
    store: Arc<dyn VertexStore>,
    pool: Arc<IdPool>,
    sessions: Vec<Weak<SessionShared>>,
}

struct ServerState {
    keyspaces: BTreeMap<String, Keyspace>,
    next_partition: u32,
    closed: bool,
}

// The process-wide owner of shared resources: the id authority, one store
// and id pool per keyspace, and the sessions multiplexed over them.
pub struct Server {
    config: Config,
    authority: Arc<dyn IdAuthority>,
    state: Mutex<ServerState>,
}

impl Server {
    pub fn new(config: Config) -> Server {
        let authority = Arc::new(MonotonicAuthority::new(
            config.id_block_size,
            config.id_upper_bound,
        ));
        Server::with_authority(config, authority)
    }

    // Bring your own authority, e.g. one backed by a remote allocator.
    pub fn with_authority(config: Config, authority: Arc<dyn IdAuthority>) -> Server {
        Server {
            config,
            authority,
            state: Mutex::new(ServerState {
                keyspaces: BTreeMap::new(),
                next_partition: 0,
                closed: false,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn pool_options(&self) -> PoolOptions {
        self.config.pool_options()
    }

    // Mint a session for the named keyspace, creating the keyspace on
    // first use. Sessions of one keyspace share its store and id pool.
    pub fn session(&self, keyspace: &str) -> Result<Session> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(err_kind(
                ErrorKind::SessionClosed,
                "server is shut down",
            ));
        }
        if !st.keyspaces.contains_key(keyspace) {
            let partition = Partition(st.next_partition);
            st.next_partition += 1;
            let store: Arc<dyn VertexStore> = Arc::new(MemStore::new());
            let pool = Arc::new(IdPool::new(
                self.authority.clone(),
                partition,
                Namespace::VERTEX,
                self.pool_options(),
            )?);
            st.keyspaces.insert(
                keyspace.to_string(),
                Keyspace {
                    partition,
                    store,
                    pool,
                    sessions: Vec::new(),
                },
            );
            info!(target: "trellis", keyspace, "created keyspace");
        }
        let ks = match st.keyspaces.get_mut(keyspace) {
            Some(ks) => ks,
            None => return Err(err_kind(ErrorKind::Backend, "keyspace vanished")),
        };
        let session = Session::new(
            keyspace.to_string(),
            ks.store.clone(),
            ks.pool.clone(),
            self.config.sharding_threshold,
        );
        ks.sessions.retain(|s| s.upgrade().is_some());
        ks.sessions.push(session.downgrade());
        Ok(session)
    }

    pub fn keyspaces(&self) -> Vec<String> {
        self.state.lock().keyspaces.keys().cloned().collect()
    }

    pub fn partition_of(&self, keyspace: &str) -> Option<Partition> {
        self.state
            .lock()
            .keyspaces
            .get(keyspace)
            .map(|ks| ks.partition)
    }

    // Drops the keyspace wholesale: closes its sessions (and through them
    // their transactions) and its id pool.
    pub fn delete_keyspace(&self, keyspace: &str) -> Result<()> {
        let removed = self.state.lock().keyspaces.remove(keyspace);
        if let Some(ks) = removed {
            for session in &ks.sessions {
                if let Some(shared) = session.upgrade() {
                    shared.close();
                }
            }
            ks.pool.close();
            info!(target: "trellis", keyspace, "deleted keyspace");
        }
        Ok(())
    }

    // Idempotent. Closes every session of every keyspace, then the id
    // pools (blocking on their renewers).
    pub fn shutdown(&self) {
        let keyspaces = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            std::mem::take(&mut st.keyspaces)
        };
        for (name, ks) in keyspaces {
            for session in &ks.sessions {
                if let Some(shared) = session.upgrade() {
                    shared.close();
                }
            }
            ks.pool.close();
            info!(target: "trellis", keyspace = name.as_str(), "closed keyspace");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
