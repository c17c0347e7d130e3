//! Two-pass Bloom-filter garbage collection over the local object cache.
//!
//! Pass 1 walks the relation edges from every live snapshot root and
//! inserts each reachable OID into a Bloom filter sized for a 5% false
//! positive rate. Pass 2 streams the whole object table and queues every
//! OID the filter rejects. The filter has no false negatives, so a
//! rejected OID is provably unreachable; false positives merely retain a
//! sliver of garbage for a later run. Neither pass reads from the
//! repository, and memory stays around 7.5 bits per live object.

use rand::RngCore;
use tracing::{debug, info, warn};

use cairn_types::object_id::ObjectId;

use crate::cache::CacheDb;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::storage::{object_key, StorageBackend};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects inserted into the filter during the mark pass (with
    /// multiplicity for shared subtrees).
    pub marked: u64,
    /// Objects examined during the sweep pass.
    pub examined: u64,
    /// Objects deleted from storage and cache.
    pub deleted: u64,
    /// Objects whose storage delete failed; retained for the next run.
    pub failed: u64,
}

/// Bloom filter keyed by OIDs, which are uniformly random MAC outputs
/// already. Each hash function XORs a fixed random mask into the OID and
/// takes the low bits modulo the filter size.
pub(crate) struct BloomFilter {
    bits: Vec<u8>,
    m: u64,
    masks: Vec<[u8; 8]>,
}

const TARGET_FALSE_POSITIVE_RATE: f64 = 0.05;

impl BloomFilter {
    /// Size the filter for `n` expected members at the target false
    /// positive rate: the standard m = -n*ln(p)/(ln 2)^2, k = m/n * ln 2.
    pub(crate) fn sized_for(n: u64) -> Self {
        let n = n.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = ((n * (-TARGET_FALSE_POSITIVE_RATE.ln())) / (ln2 * ln2)).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 / n) * ln2).round().max(1.0) as usize;

        let mut rng = rand::rngs::OsRng;
        let masks = (0..k)
            .map(|_| {
                let mut mask = [0u8; 8];
                rng.fill_bytes(&mut mask);
                mask
            })
            .collect();

        BloomFilter {
            bits: vec![0u8; m.div_ceil(8) as usize],
            m,
            masks,
        }
    }

    fn bit_index(&self, mask: &[u8; 8], oid: &ObjectId) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&oid.as_bytes()[..8]);
        for (b, m) in low.iter_mut().zip(mask) {
            *b ^= m;
        }
        u64::from_le_bytes(low) % self.m
    }

    pub(crate) fn insert(&mut self, oid: &ObjectId) {
        for i in 0..self.masks.len() {
            let idx = self.bit_index(&self.masks[i], oid);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    pub(crate) fn contains(&self, oid: &ObjectId) -> bool {
        self.masks.iter().all(|mask| {
            let idx = self.bit_index(mask, oid);
            self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0
        })
    }
}

/// Collect unreachable objects: mark from live snapshot roots, sweep the
/// object table, delete from storage first and then from the cache. A
/// failed storage delete keeps the cache row so the next run retries.
pub fn collect_garbage(
    storage: &dyn StorageBackend,
    cache: &CacheDb,
    cancel: &CancelToken,
) -> Result<GcStats> {
    let mut stats = GcStats::default();

    let object_count = cache.obj_count()?;
    if object_count == 0 {
        return Ok(stats);
    }

    // Mark. Shared subtrees are visited once per referencing path, like
    // the recursive walk they replace; the DAG has no cycles so the
    // frontier always drains.
    let mut filter = BloomFilter::sized_for(object_count);
    let mut frontier = cache.snap_roots()?;
    while let Some(oid) = frontier.pop() {
        cancel.check()?;
        filter.insert(&oid);
        stats.marked += 1;
        frontier.extend(cache.obj_children(&oid)?);
    }
    debug!(marked = stats.marked, objects = object_count, "mark pass done");

    // Sweep: stream the table, queue everything the filter rejects.
    let mut garbage: Vec<ObjectId> = Vec::new();
    cache.obj_for_each(|oid| {
        stats.examined += 1;
        if !filter.contains(&oid) {
            garbage.push(oid);
        }
        Ok(())
    })?;

    for oid in garbage {
        cancel.check()?;
        match storage.delete(&object_key(&oid)) {
            Ok(()) => {
                cache.obj_delete(&oid)?;
                stats.deleted += 1;
            }
            Err(e) => {
                warn!(oid = %oid, error = %e, "storage delete failed, retaining cache entry");
                stats.failed += 1;
            }
        }
    }

    info!(
        deleted = stats.deleted,
        failed = stats.failed,
        examined = stats.examined,
        "garbage collection done"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(fill: u8) -> ObjectId {
        ObjectId([fill; 32])
    }

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::sized_for(1000);
        for i in 0..=255u8 {
            filter.insert(&oid(i));
        }
        for i in 0..=255u8 {
            assert!(filter.contains(&oid(i)), "inserted oid {i} must match");
        }
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let members: Vec<ObjectId> = (0..2000u32)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[..4].copy_from_slice(&i.to_le_bytes());
                bytes[4] = 1;
                ObjectId(bytes)
            })
            .collect();
        let mut filter = BloomFilter::sized_for(members.len() as u64);
        for m in &members {
            filter.insert(m);
        }

        let mut false_positives = 0u32;
        let probes = 10_000u32;
        for i in 0..probes {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_le_bytes());
            bytes[4] = 2; // disjoint from members
            if filter.contains(&ObjectId(bytes)) {
                false_positives += 1;
            }
        }
        // Target is 5%; leave generous slack for run-to-run mask variance.
        let rate = false_positives as f64 / probes as f64;
        assert!(rate < 0.15, "false positive rate {rate} out of bounds");
    }

    #[test]
    fn sized_for_handles_tiny_populations() {
        let mut filter = BloomFilter::sized_for(1);
        filter.insert(&oid(1));
        assert!(filter.contains(&oid(1)));
    }
}
