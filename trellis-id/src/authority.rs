use std::time::Duration;

use parking_lot::Mutex;
use rapidhash::RapidHashMap;
use serde::{Deserialize, Serialize};
use trellis_base::{err_kind, ErrorKind, Result};

// Ids below this are reserved for the meta vertices seeded into every fresh
// keyspace (the schema root and the three built-in meta types). Authorities
// must never hand them out.
pub const FIRST_POOLED_ID: u64 = 0x10;

// A partition names the id space of one keyspace; a namespace names one
// category of ids inside it. An authority allocates independently per
// (partition, namespace) pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Partition(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Namespace(pub u32);

impl Namespace {
    pub const VERTEX: Namespace = Namespace(0);
}

// A half-open range [start, start+len) of ids, consumed sequentially by the
// pool. Opaque beyond its length and indexing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct IdBlock {
    start: u64,
    len: u64,
}

impl IdBlock {
    pub fn new(start: u64, len: u64) -> Self {
        IdBlock { start, len }
    }
    pub fn num_ids(&self) -> u64 {
        self.len
    }
    pub fn get_id(&self, index: u64) -> u64 {
        debug_assert!(index < self.len);
        self.start + index
    }
}

// The remote block allocator. Exhaustion is signalled with kind
// PoolExhausted; any other failure is treated as transient by the pool.
// supports_interruption governs what the pool does with a fetch that has
// outlived its renew timeout: interruptible fetches are abandoned outright,
// non-interruptible ones are parked until close().
pub trait IdAuthority: Send + Sync + 'static {
    fn get_id_block(
        &self,
        partition: Partition,
        namespace: Namespace,
        timeout: Duration,
    ) -> Result<IdBlock>;

    fn supports_interruption(&self) -> bool {
        false
    }
}

// In-process authority handing out contiguous blocks per (partition,
// namespace). Backs the server's keyspaces and most tests.
pub struct MonotonicAuthority {
    block_size: u64,
    upper_bound: u64,
    next: Mutex<RapidHashMap<(Partition, Namespace), u64>>,
}

impl MonotonicAuthority {
    pub fn new(block_size: u64, upper_bound: u64) -> Self {
        MonotonicAuthority {
            block_size,
            upper_bound,
            next: Mutex::new(RapidHashMap::default()),
        }
    }
}

impl IdAuthority for MonotonicAuthority {
    fn get_id_block(
        &self,
        partition: Partition,
        namespace: Namespace,
        _timeout: Duration,
    ) -> Result<IdBlock> {
        let mut next = self.next.lock();
        let cursor = next.entry((partition, namespace)).or_insert(FIRST_POOLED_ID);
        if *cursor >= self.upper_bound {
            return Err(err_kind(
                ErrorKind::PoolExhausted,
                format!("authority drained for {:?}/{:?}", partition, namespace),
            ));
        }
        let len = self.block_size.min(self.upper_bound - *cursor);
        let block = IdBlock::new(*cursor, len);
        *cursor += len;
        Ok(block)
    }

    fn supports_interruption(&self) -> bool {
        true
    }
}
