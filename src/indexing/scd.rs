//! Document-batch (SCD) file naming and shard-key hashing.
//!
//! SCD files are the opaque batch format the index pipeline consumes; the
//! master only needs to recognize their names and decide which shard a
//! document belongs to. A name looks like `B-00-201207282137-29781-I-C.SCD`:
//! fixed `B-00` prefix, a 12-digit timestamp, a 5-digit serial, an operation
//! letter, and the `C.SCD` tail.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::cluster::ShardId;
use crate::{Error, Result};

/// Operation letters a batch file may carry.
const SCD_OPS: [char; 4] = ['I', 'U', 'D', 'R'];

/// Check whether a file name has the SCD batch shape.
pub fn is_scd_filename(name: &str) -> bool {
    let mut parts = name.split('-');
    let (Some(prefix), Some(zeros), Some(stamp), Some(serial), Some(op), Some(tail)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if parts.next().is_some() {
        return false;
    }
    prefix == "B"
        && zeros == "00"
        && stamp.len() == 12
        && stamp.bytes().all(|b| b.is_ascii_digit())
        && serial.len() == 5
        && serial.bytes().all(|b| b.is_ascii_digit())
        && op.len() == 1
        && op.chars().next().is_some_and(|c| SCD_OPS.contains(&c))
        && tail.eq_ignore_ascii_case("C.SCD")
}

/// How documents of one collection are spread over shards.
#[derive(Debug, Clone)]
pub struct ScdShardingConfig {
    /// The collection's shard ids, in routing order.
    pub shard_ids: Vec<ShardId>,
    /// Document properties hashed to pick a shard.
    pub shard_keys: Vec<String>,
}

impl ScdShardingConfig {
    pub fn new(shard_ids: Vec<ShardId>, shard_keys: Vec<String>) -> Result<Self> {
        if shard_keys.is_empty() {
            return Err(Error::Config("no sharding key configured".to_string()));
        }
        if shard_ids.is_empty() {
            return Err(Error::Config("no shard ids configured".to_string()));
        }
        Ok(Self {
            shard_ids,
            shard_keys,
        })
    }

    /// Pick the shard for one document, given its property values.
    ///
    /// Hashes the configured key values in order; a document missing every
    /// shard key contributes an empty hash but still routes deterministically.
    pub fn shard_for<'a>(
        &self,
        mut property: impl FnMut(&str) -> Option<&'a str>,
    ) -> ShardId {
        let mut hasher = DefaultHasher::new();
        for key in &self.shard_keys {
            if let Some(value) = property(key) {
                value.hash(&mut hasher);
            }
        }
        let index = (hasher.finish() % self.shard_ids.len() as u64) as usize;
        self.shard_ids[index]
    }
}
