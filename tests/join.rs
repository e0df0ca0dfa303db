mod common;

use std::sync::Arc;

use common::*;
use rstest::rstest;
use sort_merge_join::executor::ondisk_pipeline::OnDiskSort;
use sort_merge_join::{
    BufferPool, BytewiseComparator, DecodedKeyComparator, ExecError, InMemBackend, InMemSource,
    IterSource, JoinConfig, KeyComparator, KvCodec, OnDiskSortMergeJoin, RawCodec, SideConfig,
    SortedStream, SpillManager, UndrainedGroupPolicy, PAGE_SIZE,
};

#[test]
fn test_matches_only_shared_keys() {
    let (mut join, pool, spill) = new_join(JoinConfig::default());
    join.open(
        source(&[(1, "a"), (2, "b"), (1, "c")]),
        source(&[(1, "x"), (3, "y")]),
    )
    .unwrap();

    assert!(join.advance().unwrap());
    assert_eq!(join.key().unwrap(), 1);
    let mut left = join.values1().unwrap().collect_all().unwrap();
    left.sort();
    assert_eq!(left, vec!["a", "c"]);
    assert_eq!(join.values2().unwrap().collect_all().unwrap(), vec!["x"]);
    assert!(!join.advance().unwrap());

    join.close();
    assert_released(&pool, &spill);
}

#[rstest]
#[case::left_empty(&[], &[(1, "x"), (2, "y")])]
#[case::right_empty(&[(1, "a")], &[])]
#[case::both_empty(&[], &[])]
#[case::disjoint(&[(1, "a"), (3, "c")], &[(2, "b"), (4, "d")])]
fn test_no_matches(#[case] left: &[(i64, &str)], #[case] right: &[(i64, &str)]) {
    let (mut join, pool, spill) = new_join(JoinConfig::default());
    join.open(source(left), source(right)).unwrap();
    assert!(!join.advance().unwrap());
    assert!(matches!(join.key(), Err(ExecError::Precondition(_))));
    join.close();
    assert_released(&pool, &spill);
}

#[test]
fn test_two_record_buffers_make_many_runs() {
    let side = SideConfig {
        num_sort_buffers: 2,
        sort_buffer_pages: 1,
        max_records_per_buffer: Some(2),
        merge_memory_pages: 4,
        max_open_files: 4,
        spill_segment_pages: 1,
    };
    let pool = Arc::new(BufferPool::new(side.required_pages()));
    let spill = SpillManager::in_memory();
    let codec = Codec::new();
    let cmp: Arc<dyn KeyComparator> = Arc::new(DecodedKeyComparator::new(Codec::new()));

    let keys = [9i64, 3, 7, 1, 8, 2, 6, 0, 5, 4];
    let mut input = InMemSource::new(keys.iter().map(|&k| (k, format!("v{}", k))).collect());
    let mut sort = OnDiskSort::new("left", side, &pool, &spill, &cmp);
    sort.run_generation(&mut input, &codec).unwrap();
    assert!(sort.runs().len() >= 5, "only {} runs", sort.runs().len());

    let mut stream = sort.merge().unwrap();
    let mut merged = Vec::new();
    while let Some((k, _)) = stream.next_record().unwrap() {
        merged.push(codec.decode_key(&k).unwrap());
    }
    assert_eq!(merged, (0..10).collect::<Vec<i64>>());
    drop(stream);
    sort.close().unwrap();
    assert_released(&pool, &spill);
}

#[test]
fn test_two_record_buffers_join() {
    let left: Vec<(i64, String)> = (0..10).map(|i| (i % 4, format!("l{}", i))).collect();
    let right: Vec<(i64, String)> = (0..10).map(|i| (i % 3, format!("r{}", i))).collect();
    let (mut join, pool, spill) = new_join(spilling_config(2));
    join.open(InMemSource::new(left.clone()), InMemSource::new(right.clone()))
        .unwrap();
    assert_eq!(collect_matches(&mut join), brute_force(&left, &right));

    let (left_stats, right_stats) = join.stats();
    assert_eq!(left_stats.run_gen.num_runs, 5);
    assert_eq!(right_stats.run_gen.num_runs, 5);
    join.close();
    assert_released(&pool, &spill);
}

#[test]
fn test_random_inputs_match_nested_loop() {
    for _ in 0..5 {
        let left = random_pairs(400, 50);
        let right = random_pairs(300, 50);
        let (mut join, pool, spill) = new_join(spilling_config(16));
        join.open(InMemSource::new(left.clone()), InMemSource::new(right.clone()))
            .unwrap();
        let matches = collect_matches(&mut join);
        assert!(matches.windows(2).all(|w| w[0].0 < w[1].0), "keys out of order");
        assert_eq!(matches, brute_force(&left, &right));
        join.close();
        assert_released(&pool, &spill);
    }
}

#[rstest]
#[case::in_memory(JoinConfig::default(), 0)]
#[case::one_spill(spilling_config(60), 1)]
#[case::many_spills(spilling_config(5), 19)]
fn test_spilling_does_not_change_result(#[case] config: JoinConfig, #[case] left_spills: usize) {
    let left: Vec<(i64, String)> = (0..100).map(|i| ((i * 7) % 31, format!("l{}", i))).collect();
    let right: Vec<(i64, String)> = (0..80).map(|i| ((i * 5) % 23, format!("r{}", i))).collect();
    let expected = brute_force(&left, &right);

    let (mut join, pool, spill) = new_join(config);
    join.open(InMemSource::new(left), InMemSource::new(right))
        .unwrap();
    assert_eq!(collect_matches(&mut join), expected);
    assert_eq!(join.stats().0.run_gen.runs_spilled, left_spills);
    join.close();
    assert_released(&pool, &spill);
}

#[test]
fn test_many_passes_report_merge_stats() {
    let left = random_pairs(200, 20);
    let right = random_pairs(200, 20);
    // 40 runs per side with a fan-in of 4.
    let (mut join, _pool, _spill) = new_join(spilling_config(5));
    join.open(InMemSource::new(left.clone()), InMemSource::new(right.clone()))
        .unwrap();
    let (left_stats, _) = join.stats();
    assert_eq!(left_stats.run_gen.num_runs, 40);
    assert!(left_stats.merges.len() >= 2);
    assert!(left_stats.merges.iter().all(|m| m.fan_in == 4));
    assert!(left_stats.to_string().contains("Number of runs: 40"));
    assert_eq!(collect_matches(&mut join), brute_force(&left, &right));
}

#[test]
fn test_close_is_idempotent_and_releases_everything() {
    let (mut join, pool, spill) = new_join(spilling_config(4));
    join.open(
        InMemSource::new(random_pairs(100, 10)),
        InMemSource::new(random_pairs(100, 10)),
    )
    .unwrap();
    // Stop in the middle of a match with values unread.
    assert!(join.advance().unwrap());
    join.close();
    assert_released(&pool, &spill);
    join.close();
    assert_released(&pool, &spill);
    assert!(matches!(join.advance(), Err(ExecError::Precondition(_))));
}

#[test]
fn test_drop_without_close_releases_everything() {
    let (mut join, pool, spill) = new_join(spilling_config(4));
    join.open(
        InMemSource::new(random_pairs(100, 10)),
        InMemSource::new(random_pairs(100, 10)),
    )
    .unwrap();
    drop(join);
    assert_released(&pool, &spill);
}

#[test]
fn test_spill_write_failure_fails_open() {
    let backend = Arc::new(InMemBackend::new());
    backend.set_fail_writes(true);
    let spill = SpillManager::new(Box::new(backend.clone()));
    let (mut join, pool, spill) = new_join_with(spilling_config(4), spill);

    let err = join
        .open(
            InMemSource::new(random_pairs(100, 10)),
            InMemSource::new(random_pairs(100, 10)),
        )
        .unwrap_err();
    assert!(matches!(err, ExecError::Open(_)));
    assert!(matches!(err.root_cause(), ExecError::Io(_)));

    // The join is poisoned, and cleanup still works.
    assert!(matches!(join.advance(), Err(ExecError::Precondition(_))));
    join.close();
    assert_released(&pool, &spill);
    assert_eq!(backend.num_files(), 0);
}

#[test]
fn test_source_error_fails_open() {
    let (mut join, pool, spill) = new_join(JoinConfig::default());
    let failing = IterSource::new(
        vec![
            Ok((1i64, "a".to_string())),
            Err(ExecError::Other("source broke".to_string())),
        ]
        .into_iter(),
    );
    let err = join.open(failing, source(&[(1, "x")])).unwrap_err();
    assert!(matches!(err.root_cause(), ExecError::Other(msg) if msg == "source broke"));
    join.close();
    assert_released(&pool, &spill);
}

#[test]
fn test_fan_in_below_two_is_config_error() {
    // One merge page per side cannot merge two runs.
    let config = JoinConfig {
        merge_memory_pages: 2,
        ..spilling_config(2)
    };
    let (mut join, pool, spill) = new_join(config);
    let err = join
        .open(
            InMemSource::new(random_pairs(10, 5)),
            InMemSource::new(random_pairs(10, 5)),
        )
        .unwrap_err();
    assert!(matches!(err, ExecError::Open(_)));
    assert!(matches!(err.root_cause(), ExecError::Config(_)));
    join.close();
    assert_released(&pool, &spill);
}

#[test]
fn test_pool_smaller_than_budget_is_config_error() {
    let config = JoinConfig::default();
    let pool = Arc::new(BufferPool::new(config.required_pages() - 1));
    let spill = SpillManager::in_memory();
    let cmp = Arc::new(BytewiseComparator);
    let mut join = OnDiskSortMergeJoin::new(config, &pool, &spill, RawCodec, cmp);
    let err = join
        .open(
            InMemSource::<Vec<u8>, Vec<u8>>::new(vec![]),
            InMemSource::<Vec<u8>, Vec<u8>>::new(vec![]),
        )
        .unwrap_err();
    assert!(matches!(err.root_cause(), ExecError::Config(_)));
}

#[test]
fn test_oversized_record_fails_open() {
    let config = JoinConfig::default();
    let pool = Arc::new(BufferPool::new(config.required_pages()));
    let spill = SpillManager::in_memory();
    let cmp = Arc::new(BytewiseComparator);
    let mut join = OnDiskSortMergeJoin::new(config, &pool, &spill, RawCodec, cmp);
    let left = vec![(b"k".to_vec(), vec![0u8; PAGE_SIZE])];
    let err = join
        .open(
            InMemSource::new(left),
            InMemSource::<Vec<u8>, Vec<u8>>::new(vec![]),
        )
        .unwrap_err();
    assert!(matches!(err.root_cause(), ExecError::RecordTooLarge { .. }));
    join.close();
    assert_released(&pool, &spill);
}

#[test]
fn test_raw_codec_orders_bytewise() {
    let config = spilling_config(3);
    let pool = Arc::new(BufferPool::new(config.required_pages()));
    let spill = SpillManager::in_memory();
    let cmp = Arc::new(BytewiseComparator);
    let mut join = OnDiskSortMergeJoin::new(config, &pool, &spill, RawCodec, cmp);
    let left: Vec<(Vec<u8>, Vec<u8>)> = ["b", "a", "ab", "c", "a", ""]
        .iter()
        .map(|k| (k.as_bytes().to_vec(), b"l".to_vec()))
        .collect();
    let right: Vec<(Vec<u8>, Vec<u8>)> = ["", "ab", "a", "d"]
        .iter()
        .map(|k| (k.as_bytes().to_vec(), b"r".to_vec()))
        .collect();
    join.open(InMemSource::new(left), InMemSource::new(right))
        .unwrap();

    let mut keys = Vec::new();
    while let Some((key, l, r)) = join.next_match().unwrap() {
        keys.push((String::from_utf8(key).unwrap(), l.len(), r.len()));
    }
    assert_eq!(
        keys,
        vec![
            ("".to_string(), 1, 1),
            ("a".to_string(), 2, 1),
            ("ab".to_string(), 1, 1),
        ]
    );
}

#[test]
fn test_reject_policy_keeps_current_match() {
    let config = JoinConfig {
        undrained_groups: UndrainedGroupPolicy::Reject,
        ..JoinConfig::default()
    };
    let (mut join, pool, spill) = new_join(config);
    join.open(
        source(&[(1, "a"), (1, "b"), (2, "c")]),
        source(&[(1, "x"), (2, "y")]),
    )
    .unwrap();

    assert!(join.advance().unwrap());
    assert_eq!(join.values1().unwrap().next_value().unwrap().as_deref(), Some("a"));
    assert!(matches!(join.advance(), Err(ExecError::Precondition(_))));

    // Still on key 1 and not poisoned.
    assert_eq!(join.key().unwrap(), 1);
    assert_eq!(join.values1().unwrap().collect_all().unwrap(), vec!["b"]);
    assert!(matches!(join.advance(), Err(ExecError::Precondition(_))));
    assert_eq!(join.values2().unwrap().collect_all().unwrap(), vec!["x"]);

    assert!(join.advance().unwrap());
    assert_eq!(join.key().unwrap(), 2);
    join.close();
    assert_released(&pool, &spill);
}

#[test]
fn test_skip_policy_ignores_unread_values() {
    let left = random_pairs(300, 30);
    let right = random_pairs(300, 30);
    let expected: Vec<i64> = brute_force(&left, &right).into_iter().map(|m| m.0).collect();

    let (mut join, _pool, _spill) = new_join(spilling_config(8));
    join.open(InMemSource::new(left), InMemSource::new(right))
        .unwrap();
    let mut keys = Vec::new();
    while join.advance().unwrap() {
        keys.push(join.key().unwrap());
        // Read at most one value on the left and none on the right.
        let _ = join.values1().unwrap().next();
    }
    assert_eq!(keys, expected);
}

#[test]
fn test_sequential_and_parallel_sort_agree() {
    let left = random_pairs(500, 40);
    let right = random_pairs(500, 40);
    let run = |parallel_sort: bool| {
        let config = JoinConfig {
            parallel_sort,
            ..spilling_config(10)
        };
        let (mut join, _pool, _spill) = new_join(config);
        join.open(InMemSource::new(left.clone()), InMemSource::new(right.clone()))
            .unwrap();
        collect_matches(&mut join)
    };
    assert_eq!(run(true), run(false));
}

#[test]
fn test_temp_file_spills_are_removed_on_close() {
    let base = tempfile::tempdir().unwrap();
    let spill = SpillManager::temp_in(base.path()).unwrap();
    let (mut join, pool, spill) = new_join_with(spilling_config(4), spill);

    let spill_files = || -> usize {
        std::fs::read_dir(base.path())
            .unwrap()
            .map(|dir| std::fs::read_dir(dir.unwrap().path()).unwrap().count())
            .sum()
    };

    let left = random_pairs(200, 20);
    let right = random_pairs(200, 20);
    join.open(InMemSource::new(left.clone()), InMemSource::new(right.clone()))
        .unwrap();
    assert_eq!(spill_files(), 2);
    assert_eq!(collect_matches(&mut join), brute_force(&left, &right));

    join.close();
    assert_eq!(spill_files(), 0);
    assert_released(&pool, &spill);
}
