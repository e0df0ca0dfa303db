use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::merge::{MergeIter, RunMerger};
use super::page::record_size;
use super::run::{release_cursors, release_runs, RunCursor, RunSpillFile, SortedRun};
use super::sort_buffer::SortBuffer;
use crate::codec::{KeyComparator, KvCodec};
use crate::config::SideConfig;
use crate::error::{ExecError, Result};
use crate::executor::RecordSource;
use crate::mem_pool::MemPool;
use crate::spill::SpillManager;

/// Globally sorted output of one [`OnDiskSort`].
pub type SortedRunStream<M> = MergeIter<RunCursor<M>>;

/// Releases a sorted stream: buffers first, then spill segments.
pub fn release_stream<M: MemPool>(stream: SortedRunStream<M>) {
    release_cursors(stream.into_inner());
}

#[derive(Clone, Debug, Default)]
pub struct RunGenerationStats {
    pub num_records: u64,
    pub num_bytes: u64,
    pub num_runs: usize,
    pub runs_spilled: usize,
    pub time_ms: u128,
}

#[derive(Clone, Debug, Default)]
pub struct MergeStats {
    pub pass: usize,
    pub input_runs: usize,
    pub output_runs: usize,
    pub fan_in: usize,
    pub time_ms: u128,
}

impl fmt::Display for MergeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merge pass {}: {} runs -> {} runs (fan-in {}) in {} ms",
            self.pass, self.input_runs, self.output_runs, self.fan_in, self.time_ms
        )
    }
}

/// Statistics about one side's sort. The final lazy merge is not a pass.
#[derive(Clone, Debug, Default)]
pub struct SortStats {
    pub run_gen: RunGenerationStats,
    pub merges: Vec<MergeStats>,
}

impl fmt::Display for SortStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SortStats:")?;
        let rg = &self.run_gen;
        writeln!(f, "  Records: {} ({} bytes)", rg.num_records, rg.num_bytes)?;
        writeln!(
            f,
            "  Number of runs: {} ({} spilled)",
            rg.num_runs, rg.runs_spilled
        )?;
        writeln!(f, "  (R) time: {} ms", rg.time_ms)?;
        let total_merge_time_ms: u128 = self.merges.iter().map(|m| m.time_ms).sum();
        writeln!(
            f,
            "  (M) time: {} ms over {} passes",
            total_merge_time_ms,
            self.merges.len()
        )?;
        for m in &self.merges {
            writeln!(f, "    {}", m)?;
        }
        Ok(())
    }
}

/// External sort of one join input.
///
/// Run generation fills sort buffers from the source and seals each full
/// buffer into an in-memory run. At most `num_sort_buffers` buffers are
/// resident (the one being filled included); before a new buffer is started
/// the oldest in-memory run is spilled. [`OnDiskSort::merge`] then hands all
/// runs to a [`RunMerger`].
pub struct OnDiskSort<M: MemPool> {
    name: String,
    config: SideConfig,
    mem_pool: Arc<M>,
    cmp: Arc<dyn KeyComparator>,
    spill_file: RunSpillFile,
    runs: Vec<SortedRun<M>>,
    stats: SortStats,
}

impl<M: MemPool> OnDiskSort<M> {
    pub fn new(
        name: &str,
        config: SideConfig,
        mem_pool: &Arc<M>,
        spill: &SpillManager,
        cmp: &Arc<dyn KeyComparator>,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            mem_pool: mem_pool.clone(),
            cmp: cmp.clone(),
            spill_file: RunSpillFile::new(spill, name),
            runs: Vec::new(),
            stats: SortStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs waiting to be merged, in generation order.
    pub fn runs(&self) -> &[SortedRun<M>] {
        &self.runs
    }

    pub fn stats(&self) -> &SortStats {
        &self.stats
    }

    pub fn run_generation<S, C>(&mut self, source: &mut S, codec: &C) -> Result<()>
    where
        S: RecordSource<Key = C::Key, Value = C::Value> + ?Sized,
        C: KvCodec,
    {
        let start = Instant::now();
        let mut key = Vec::new();
        let mut val = Vec::new();
        let mut buffer: Option<SortBuffer<M>> = None;

        while let Some((k, v)) = source.next_record()? {
            key.clear();
            val.clear();
            codec.encode_key(&k, &mut key)?;
            codec.encode_value(&v, &mut val)?;
            self.stats.run_gen.num_records += 1;
            self.stats.run_gen.num_bytes += record_size(key.len(), val.len()) as u64;

            loop {
                let buf = match buffer.as_mut() {
                    Some(buf) => buf,
                    None => {
                        self.make_room()?;
                        buffer.insert(SortBuffer::new(
                            &self.mem_pool,
                            &self.cmp,
                            self.config.sort_buffer_pages,
                            self.config.max_records_per_buffer,
                        ))
                    }
                };
                if buf.append(&key, &val)? {
                    break;
                }
                if buf.is_empty() {
                    return Err(ExecError::Capacity(
                        "empty sort buffer rejected a record".to_string(),
                    ));
                }
                if let Some(full) = buffer.take() {
                    self.seal(full);
                }
            }
        }
        if let Some(last) = buffer.take() {
            self.seal(last);
        }

        let rg = &mut self.stats.run_gen;
        rg.time_ms = start.elapsed().as_millis();
        log_info!(
            "{}: {} records -> {} runs ({} spilled) in {} ms",
            self.name,
            rg.num_records,
            rg.num_runs,
            rg.runs_spilled,
            rg.time_ms
        );
        Ok(())
    }

    fn seal(&mut self, mut buffer: SortBuffer<M>) {
        if buffer.is_empty() {
            return;
        }
        buffer.sort_and_freeze();
        log_trace!("{}: run {} sealed with {} records", self.name, self.runs.len(), buffer.len());
        self.runs.push(SortedRun::InMemory(buffer));
        self.stats.run_gen.num_runs += 1;
    }

    // Spills in-memory runs, oldest first, until one more buffer fits.
    fn make_room(&mut self) -> Result<()> {
        loop {
            let in_memory = self.runs.iter().filter(|r| !r.is_spilled()).count();
            if in_memory < self.config.num_sort_buffers {
                return Ok(());
            }
            let Some(idx) = self.runs.iter().position(|r| !r.is_spilled()) else {
                return Ok(());
            };
            let file = self.spill_file.id()?;
            let run = match self.runs.remove(idx) {
                SortedRun::InMemory(buffer) => {
                    let records = buffer.len();
                    let spilled = buffer.spill_to(
                        self.spill_file.manager(),
                        file,
                        self.config.spill_segment_pages,
                    )?;
                    log_debug!(
                        "{}: spilled run {} ({} records, {} pages)",
                        self.name,
                        idx,
                        records,
                        spilled.num_pages()
                    );
                    SortedRun::Spilled(spilled)
                }
                spilled => spilled,
            };
            self.runs.insert(idx, run);
            self.stats.run_gen.runs_spilled += 1;
        }
    }

    /// Merges all generated runs into one lazily sorted stream.
    pub fn merge(&mut self) -> Result<SortedRunStream<M>> {
        let runs = std::mem::take(&mut self.runs);
        let mut merger =
            RunMerger::new(&self.mem_pool, &mut self.spill_file, &self.cmp, &self.config);
        merger.merge(runs, &mut self.stats.merges)
    }

    /// Run generation followed by merging.
    pub fn execute<S, C>(&mut self, source: &mut S, codec: &C) -> Result<SortedRunStream<M>>
    where
        S: RecordSource<Key = C::Key, Value = C::Value> + ?Sized,
        C: KvCodec,
    {
        self.run_generation(source, codec)?;
        self.merge()
    }

    /// Releases runs that were never merged and deletes the spill file.
    /// Streams returned by `merge` must be released before this.
    pub fn close(&mut self) -> Result<()> {
        release_runs(std::mem::take(&mut self.runs));
        self.spill_file.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BincodeCodec, BytewiseComparator, DecodedKeyComparator, RawCodec};
    use crate::executor::{InMemSource, SortedStream};
    use crate::mem_pool::{get_test_bp, BufferPool};
    use rand::{thread_rng, Rng};
    use rstest::rstest;

    fn side(
        buffers: usize,
        max_records: Option<usize>,
        merge_pages: usize,
        files: usize,
    ) -> SideConfig {
        SideConfig {
            num_sort_buffers: buffers,
            sort_buffer_pages: 1,
            max_records_per_buffer: max_records,
            merge_memory_pages: merge_pages,
            max_open_files: files,
            spill_segment_pages: 1,
        }
    }

    fn raw_source(keys: &[u32]) -> InMemSource<Vec<u8>, Vec<u8>> {
        InMemSource::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| (k.to_be_bytes().to_vec(), (i as u32).to_be_bytes().to_vec()))
                .collect(),
        )
    }

    fn sorter(
        bp: &Arc<BufferPool>,
        spill: &SpillManager,
        config: SideConfig,
    ) -> OnDiskSort<BufferPool> {
        let cmp: Arc<dyn KeyComparator> = Arc::new(BytewiseComparator);
        OnDiskSort::new("test", config, bp, spill, &cmp)
    }

    fn drain(mut stream: SortedRunStream<BufferPool>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(rec) = stream.next_record().unwrap() {
            out.push(rec);
        }
        out
    }

    mod run_generation {
        use super::*;

        #[test]
        fn test_two_record_buffers_make_five_runs() {
            let bp = get_test_bp(32);
            let spill = SpillManager::in_memory();
            let mut sort = sorter(&bp, &spill, side(8, Some(2), 4, 4));
            let keys = [9, 3, 7, 1, 5, 0, 8, 2, 6, 4];
            sort.run_generation(&mut raw_source(&keys), &RawCodec).unwrap();

            assert_eq!(sort.runs().len(), 5);
            assert!(sort.runs().iter().all(|r| r.num_records() == 2));
            assert_eq!(sort.stats().run_gen.num_runs, 5);
            assert_eq!(sort.stats().run_gen.runs_spilled, 0);
            assert_eq!(sort.stats().run_gen.num_records, 10);
        }

        #[test]
        fn test_oldest_runs_spill_first() {
            let bp = get_test_bp(32);
            let spill = SpillManager::in_memory();
            let mut sort = sorter(&bp, &spill, side(2, Some(2), 4, 4));
            let keys: Vec<u32> = (0..10).rev().collect();
            sort.run_generation(&mut raw_source(&keys), &RawCodec).unwrap();

            // Two buffers: at most two runs stay resident, the newest ones.
            let spilled: Vec<bool> = sort.runs().iter().map(|r| r.is_spilled()).collect();
            assert_eq!(spilled, vec![true, true, true, false, false]);
            assert_eq!(sort.stats().run_gen.runs_spilled, 3);
            assert!(spill.stats().segments_allocated >= 3);
        }

        #[test]
        fn test_empty_input() {
            let bp = get_test_bp(8);
            let spill = SpillManager::in_memory();
            let mut sort = sorter(&bp, &spill, side(2, None, 2, 2));
            let out = drain(sort.execute(&mut raw_source(&[]), &RawCodec).unwrap());
            assert!(out.is_empty());
            assert_eq!(sort.stats().run_gen.num_runs, 0);
        }
    }

    mod sort_and_merge {
        use super::*;

        #[rstest]
        #[case::in_memory(side(64, None, 4, 4), 0)]
        #[case::some_spills(side(2, Some(50), 4, 4), 1)]
        #[case::many_passes(side(1, Some(7), 2, 2), 2)]
        fn test_output_sorted_and_complete(#[case] config: SideConfig, #[case] min_passes: usize) {
            let bp = get_test_bp(128);
            let spill = SpillManager::in_memory();
            let mut rng = thread_rng();
            let keys: Vec<u32> = (0..500).map(|_| rng.gen_range(0..100)).collect();

            let mut sort = sorter(&bp, &spill, config);
            let out = drain(sort.execute(&mut raw_source(&keys), &RawCodec).unwrap());
            assert!(sort.stats().merges.len() >= min_passes);

            assert_eq!(out.len(), keys.len());
            assert!(out.windows(2).all(|w| w[0].0 <= w[1].0));
            // Stable: equal keys keep arrival order (the value is the index).
            for w in out.windows(2) {
                if w[0].0 == w[1].0 {
                    assert!(w[0].1 < w[1].1);
                }
            }
            let mut expected = keys.clone();
            expected.sort();
            let got: Vec<u32> = out
                .iter()
                .map(|(k, _)| u32::from_be_bytes([k[0], k[1], k[2], k[3]]))
                .collect();
            assert_eq!(got, expected);

            sort.close().unwrap();
            assert_eq!(bp.available(), 128);
            assert_eq!(spill.stats().live_segments(), 0);
        }

        #[test]
        fn test_typed_keys_with_decoded_comparator() {
            let bp = get_test_bp(16);
            let spill = SpillManager::in_memory();
            let codec = BincodeCodec::<i64, String>::new();
            let cmp: Arc<dyn KeyComparator> =
                Arc::new(DecodedKeyComparator::new(BincodeCodec::<i64, String>::new()));
            let mut sort = OnDiskSort::new("typed", side(1, Some(3), 2, 2), &bp, &spill, &cmp);

            let input: Vec<(i64, String)> = [5, -3, 300, -300, 0, 42, -1]
                .iter()
                .map(|k| (*k, k.to_string()))
                .collect();
            let out = drain(sort.execute(&mut InMemSource::new(input), &codec).unwrap());
            let keys: Vec<i64> = out.iter().map(|(k, _)| codec.decode_key(k).unwrap()).collect();
            assert_eq!(keys, vec![-300, -3, -1, 0, 5, 42, 300]);
        }

        #[test]
        fn test_close_removes_spill_file() {
            let bp = get_test_bp(16);
            let spill = SpillManager::in_memory();
            let mut sort = sorter(&bp, &spill, side(1, Some(2), 2, 2));
            let keys: Vec<u32> = (0..20).collect();
            sort.run_generation(&mut raw_source(&keys), &RawCodec).unwrap();
            assert!(sort.spill_file.is_created());

            // Close without merging: runs are dropped, file is removed.
            sort.close().unwrap();
            sort.close().unwrap();
            assert!(!sort.spill_file.is_created());
            assert_eq!(bp.available(), 16);
            assert_eq!(spill.stats().live_segments(), 0);
        }

        #[test]
        fn test_stats_display() {
            let bp = get_test_bp(16);
            let spill = SpillManager::in_memory();
            let mut sort = sorter(&bp, &spill, side(1, Some(1), 2, 2));
            let keys: Vec<u32> = (0..5).collect();
            release_stream(sort.execute(&mut raw_source(&keys), &RawCodec).unwrap());
            let text = sort.stats().to_string();
            assert!(text.contains("Number of runs: 5"));
            assert!(text.contains("merge pass 1"));
        }
    }
}
