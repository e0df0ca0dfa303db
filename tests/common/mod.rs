#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{thread_rng, Rng};
use sort_merge_join::{
    BincodeCodec, BufferPool, DecodedKeyComparator, InMemSource, JoinConfig, OnDiskSortMergeJoin,
    SpillManager,
};

pub type Codec = BincodeCodec<i64, String>;
pub type Join = OnDiskSortMergeJoin<BufferPool, Codec>;
pub type Match = (i64, Vec<String>, Vec<String>);

/// A join over an in-memory spill backend with a pool of exactly the
/// frames `config` asks for.
pub fn new_join(config: JoinConfig) -> (Join, Arc<BufferPool>, SpillManager) {
    new_join_with(config, SpillManager::in_memory())
}

pub fn new_join_with(
    config: JoinConfig,
    spill: SpillManager,
) -> (Join, Arc<BufferPool>, SpillManager) {
    let pool = Arc::new(BufferPool::new(config.required_pages()));
    let cmp = Arc::new(DecodedKeyComparator::new(Codec::new()));
    let join = OnDiskSortMergeJoin::new(config, &pool, &spill, Codec::new(), cmp);
    (join, pool, spill)
}

/// Budget small enough that a few hundred records spill on both sides.
pub fn spilling_config(records_per_buffer: usize) -> JoinConfig {
    JoinConfig {
        num_sort_buffers: 2,
        sort_buffer_pages: 2,
        max_records_per_buffer: Some(records_per_buffer),
        merge_memory_pages: 8,
        max_open_files: 8,
        spill_segment_pages: 1,
        ..JoinConfig::default()
    }
}

pub fn source(pairs: &[(i64, &str)]) -> InMemSource<i64, String> {
    InMemSource::new(pairs.iter().map(|(k, v)| (*k, v.to_string())).collect())
}

pub fn random_pairs(n: usize, key_range: i64) -> Vec<(i64, String)> {
    let mut rng = thread_rng();
    (0..n)
        .map(|i| (rng.gen_range(-key_range..key_range), format!("v{}", i)))
        .collect()
}

/// Every match, values sorted so results compare as multisets.
pub fn collect_matches(join: &mut Join) -> Vec<Match> {
    let mut out = Vec::new();
    while let Some((key, mut left, mut right)) = join.next_match().unwrap() {
        left.sort();
        right.sort();
        out.push((key, left, right));
    }
    out
}

/// Nested-loop reference join, grouped by key.
pub fn brute_force(left: &[(i64, String)], right: &[(i64, String)]) -> Vec<Match> {
    let mut groups: BTreeMap<i64, (Vec<String>, Vec<String>)> = BTreeMap::new();
    for (lk, lv) in left {
        for (rk, _) in right {
            if lk == rk {
                groups.entry(*lk).or_default().0.push(lv.clone());
                break;
            }
        }
    }
    for (rk, rv) in right {
        if let Some(g) = groups.get_mut(rk) {
            g.1.push(rv.clone());
        }
    }
    groups
        .into_iter()
        .map(|(k, (mut l, mut r))| {
            l.sort();
            r.sort();
            (k, l, r)
        })
        .collect()
}

/// Checks that nothing is left behind once a join is closed.
pub fn assert_released(pool: &BufferPool, spill: &SpillManager) {
    use sort_merge_join::MemPool;
    assert_eq!(pool.available(), pool.capacity(), "pool frames leaked");
    assert_eq!(spill.stats().live_segments(), 0, "spill segments leaked");
}
