use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_id::PoolOptions;

// Runtime knobs, serde-friendly so deployments ship them as data. Every
// field has a default, so a partial config deserializes cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Per-type instance count at which a new shard is auto-opened.
    pub sharding_threshold: u64,
    // Max wait for a background id block fetch, in milliseconds.
    pub id_renew_timeout_ms: u64,
    // Fraction of a block still unconsumed when prefetch starts (0 < p <= 1).
    pub id_renew_buffer_percentage: f64,
    // Exclusive maximum id per partition-namespace.
    pub id_upper_bound: u64,
    // Block size handed out by the in-process authority.
    pub id_block_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sharding_threshold: 10_000,
            id_renew_timeout_ms: 10_000,
            id_renew_buffer_percentage: 0.3,
            id_upper_bound: u64::MAX,
            id_block_size: 1024,
        }
    }
}

impl Config {
    pub fn renew_timeout(&self) -> Duration {
        Duration::from_millis(self.id_renew_timeout_ms)
    }

    pub(crate) fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            renew_timeout: self.renew_timeout(),
            renew_buffer_percentage: self.id_renew_buffer_percentage,
            upper_bound: self.id_upper_bound,
        }
    }
}
