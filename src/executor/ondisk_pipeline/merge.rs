use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use super::run::{RunCursor, RunSpillFile, SortedRun, SpilledRun, SpilledRunWriter};
use super::sort::MergeStats;
use crate::codec::KeyComparator;
use crate::config::SideConfig;
use crate::error::{ExecError, Result};
use crate::executor::{Record, SortedStream};
use crate::mem_pool::MemPool;

// Heap entry ordered by key, ties broken by run index so that equal keys
// come out in run order.
struct HeapEntry {
    key: Vec<u8>,
    run_idx: usize,
    comparator: Arc<dyn KeyComparator>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator
            .compare(&self.key, &other.key)
            .then(self.run_idx.cmp(&other.run_idx))
    }
}

/// k-way merge of sorted streams.
pub struct MergeIter<S: SortedStream> {
    run_iters: Vec<S>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    values: Vec<Option<Vec<u8>>>,
    cmp: Arc<dyn KeyComparator>,
}

impl<S: SortedStream> MergeIter<S> {
    pub fn try_new(mut run_iters: Vec<S>, cmp: Arc<dyn KeyComparator>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(run_iters.len());
        let mut values = vec![None; run_iters.len()];

        for (i, iter) in run_iters.iter_mut().enumerate() {
            if let Some((k, v)) = iter.next_record()? {
                heap.push(Reverse(HeapEntry {
                    key: k,
                    run_idx: i,
                    comparator: cmp.clone(),
                }));
                values[i] = Some(v);
            }
        }

        Ok(Self {
            run_iters,
            heap,
            values,
            cmp,
        })
    }

    pub fn num_runs(&self) -> usize {
        self.run_iters.len()
    }

    /// Gives the inputs back, e.g. to release them in a particular order.
    pub fn into_inner(self) -> Vec<S> {
        self.run_iters
    }
}

impl<S: SortedStream> SortedStream for MergeIter<S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        let run_idx = entry.run_idx;
        let val = self.values[run_idx].take().ok_or_else(|| {
            ExecError::Other(format!("merge input {} lost its current value", run_idx))
        })?;
        if let Some((next_key, next_val)) = self.run_iters[run_idx].next_record()? {
            self.heap.push(Reverse(HeapEntry {
                key: next_key,
                run_idx,
                comparator: self.cmp.clone(),
            }));
            self.values[run_idx] = Some(next_val);
        }
        Ok(Some((entry.key, val)))
    }
}

/// Merges the runs of one input down to a single sorted stream.
///
/// At most `fan_in` runs are merged at once, where the fan-in is bounded by
/// both the open-file budget and the merge pages (every spilled input needs
/// at least one read-ahead page). While more runs than that exist, passes
/// merge consecutive groups of `fan_in` runs into new spilled runs. The last
/// merge is not materialized: [`RunMerger::merge`] returns it as a lazy
/// [`MergeIter`].
pub struct RunMerger<'a, M: MemPool> {
    mem_pool: &'a Arc<M>,
    spill_file: &'a mut RunSpillFile,
    cmp: &'a Arc<dyn KeyComparator>,
    fan_in: usize,
    merge_pages: usize,
    open_files: usize,
    segment_pages: usize,
}

impl<'a, M: MemPool> RunMerger<'a, M> {
    pub fn new(
        mem_pool: &'a Arc<M>,
        spill_file: &'a mut RunSpillFile,
        cmp: &'a Arc<dyn KeyComparator>,
        config: &SideConfig,
    ) -> Self {
        Self {
            mem_pool,
            spill_file,
            cmp,
            fan_in: config.max_open_files.min(config.merge_memory_pages),
            merge_pages: config.merge_memory_pages,
            open_files: config.max_open_files,
            segment_pages: config.spill_segment_pages,
        }
    }

    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    pub fn merge(
        &mut self,
        mut runs: Vec<SortedRun<M>>,
        stats: &mut Vec<MergeStats>,
    ) -> Result<MergeIter<RunCursor<M>>> {
        if runs.len() > 1 && self.fan_in < 2 {
            return Err(ExecError::Config(format!(
                "cannot merge {} runs: fan-in is {} ({} merge pages, {} open files), \
                 need at least 2",
                runs.len(),
                self.fan_in,
                self.merge_pages,
                self.open_files
            )));
        }

        /* ---------- intermediate passes --------------------------------------- */
        let mut pass = 0;
        while runs.len() > self.fan_in {
            pass += 1;
            let start = Instant::now();
            let input_runs = runs.len();

            let mut next = Vec::with_capacity(input_runs.div_ceil(self.fan_in));
            let mut pending = runs.into_iter();
            loop {
                let mut group: Vec<_> = pending.by_ref().take(self.fan_in).collect();
                match group.len() {
                    0 => break,
                    // A lone trailing run moves to the next pass as is.
                    1 => next.append(&mut group),
                    _ => next.push(SortedRun::Spilled(self.merge_group(group)?)),
                }
            }
            runs = next;

            let pass_stats = MergeStats {
                pass,
                input_runs,
                output_runs: runs.len(),
                fan_in: self.fan_in,
                time_ms: start.elapsed().as_millis(),
            };
            log_info!("{}", pass_stats);
            stats.push(pass_stats);
        }

        /* ---------- final lazy merge ------------------------------------------ */
        let cursors = self.open_cursors(runs)?;
        log_debug!("final merge over {} runs", cursors.len());
        MergeIter::try_new(cursors, self.cmp.clone())
    }

    fn open_cursors(&self, runs: Vec<SortedRun<M>>) -> Result<Vec<RunCursor<M>>> {
        let spilled = runs.iter().filter(|r| r.is_spilled()).count();
        let read_ahead = (self.merge_pages / spilled.max(1)).max(1);
        runs.into_iter()
            .map(|run| run.into_cursor(self.mem_pool, read_ahead))
            .collect()
    }

    fn merge_group(&mut self, group: Vec<SortedRun<M>>) -> Result<SpilledRun> {
        let cursors = self.open_cursors(group)?;
        let file = self.spill_file.id()?;
        let mut writer = SpilledRunWriter::new(
            self.mem_pool,
            self.spill_file.manager(),
            file,
            self.segment_pages,
        )?;
        let mut merged = MergeIter::try_new(cursors, self.cmp.clone())?;
        while let Some((key, val)) = merged.next_record()? {
            writer.append(&key, &val)?;
        }
        drop(merged);
        writer.finish()
    }
}
