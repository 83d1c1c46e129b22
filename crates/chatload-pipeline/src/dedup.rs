// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lossy duplicate suppression for report records.
//!
//! A fixed-size table of `2^k` tagged slots. For every key, the low `k` bits
//! of its XXH3-64 hash select a slot and the next 32 bits are the tag stored
//! there. Lookups never allocate and memory stays bounded (1 MiB at the
//! default size); in exchange, distinct keys that collide on both index and
//! tag are misreported as duplicates, which this pipeline tolerates.
//!
//! Inspired by <https://cs.stackexchange.com/a/24122>.

use xxhash_rust::xxh3::xxh3_64;

/// `2^18` slots × 4 bytes = 1 MiB.
pub const DEFAULT_INDEX_BITS: u32 = 18;

#[derive(Debug)]
pub struct DedupCache {
    slots: Vec<u32>,
    index_mask: u64,
    index_bits: u32,
}

impl DedupCache {
    /// A cache with `2^index_bits` slots. `index_bits` must leave room for
    /// the 32-bit tag within the 64-bit hash.
    pub fn new(index_bits: u32) -> Self {
        debug_assert!(index_bits + 32 <= 64);
        DedupCache {
            slots: vec![0; 1usize << index_bits],
            index_mask: (1u64 << index_bits) - 1,
            index_bits,
        }
    }

    /// Returns whether the key was absent, i.e. whether it is new.
    ///
    /// The very first key hashing to a zero tag is misreported as a
    /// duplicate (slots start out zeroed); at `2^-32` per key that is far
    /// below the collision rate already accepted here.
    pub fn add_if_absent(&mut self, key: &[u8]) -> bool {
        let hash = xxh3_64(key);
        let idx = (hash & self.index_mask) as usize;
        let tag = (hash >> self.index_bits) as u32;

        if self.slots[idx] == tag {
            false
        } else {
            self.slots[idx] = tag;
            true
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        DedupCache::new(DEFAULT_INDEX_BITS)
    }
}
