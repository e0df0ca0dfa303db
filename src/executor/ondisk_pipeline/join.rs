use std::cmp::Ordering;
use std::sync::Arc;

use super::group::{GroupValues, KeyGroupIterator};
use super::run::release_cursors;
use super::sort::{release_stream, OnDiskSort, SortStats, SortedRunStream};
use crate::codec::{KeyComparator, KvCodec};
use crate::config::JoinConfig;
use crate::error::{ExecError, Result};
use crate::executor::RecordSource;
use crate::mem_pool::MemPool;
use crate::spill::SpillManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinState {
    Created,
    Opened,
    Matched,
    Finished,
    Failed,
    Closed,
}

type Groups<M> = KeyGroupIterator<SortedRunStream<M>>;

/// Inner equi-join of two unsorted inputs by external sort and a zig-zag
/// merge.
///
/// `open()` sorts both inputs (concurrently unless disabled in the config),
/// each within half of the configured budget. `advance()` then moves both
/// sides forward until their keys agree; the matching groups are read with
/// `values1()` and `values2()`. Any failure other than API misuse aborts the
/// join. `close()` is idempotent and also runs on drop.
pub struct OnDiskSortMergeJoin<M: MemPool, C: KvCodec> {
    config: JoinConfig,
    mem_pool: Arc<M>,
    spill: SpillManager,
    codec: C,
    cmp: Arc<dyn KeyComparator>,
    left: Option<OnDiskSort<M>>,
    right: Option<OnDiskSort<M>>,
    left_groups: Option<Groups<M>>,
    right_groups: Option<Groups<M>>,
    state: JoinState,
}

impl<M: MemPool, C: KvCodec> OnDiskSortMergeJoin<M, C> {
    pub fn new(
        config: JoinConfig,
        mem_pool: &Arc<M>,
        spill: &SpillManager,
        codec: C,
        cmp: Arc<dyn KeyComparator>,
    ) -> Self {
        Self {
            config,
            mem_pool: mem_pool.clone(),
            spill: spill.clone(),
            codec,
            cmp,
            left: None,
            right: None,
            left_groups: None,
            right_groups: None,
            state: JoinState::Created,
        }
    }

    /// Sorts both inputs. Every failure comes back as [`ExecError::Open`].
    pub fn open<L, R>(&mut self, mut left: L, mut right: R) -> Result<()>
    where
        L: RecordSource<Key = C::Key, Value = C::Value>,
        R: RecordSource<Key = C::Key, Value = C::Value>,
    {
        if self.state != JoinState::Created {
            return Err(ExecError::Open(Box::new(ExecError::Precondition(
                "open() called twice".to_string(),
            ))));
        }
        match self.open_inner(&mut left, &mut right) {
            Ok(()) => {
                self.state = JoinState::Opened;
                Ok(())
            }
            Err(e) => {
                log_error!("failed to open join: {}", e);
                self.state = JoinState::Failed;
                Err(ExecError::Open(Box::new(e)))
            }
        }
    }

    fn open_inner<L, R>(&mut self, left: &mut L, right: &mut R) -> Result<()>
    where
        L: RecordSource<Key = C::Key, Value = C::Value>,
        R: RecordSource<Key = C::Key, Value = C::Value>,
    {
        self.config.validate()?;
        let required = self.config.required_pages();
        if self.mem_pool.capacity() < required {
            return Err(ExecError::Config(format!(
                "memory pool has {} frames but the join needs {}",
                self.mem_pool.capacity(),
                required
            )));
        }
        let side = self.config.split();
        log_info!("per-side budget: {:?}", side);

        let left_sort = self.left.insert(OnDiskSort::new(
            "left",
            side.clone(),
            &self.mem_pool,
            &self.spill,
            &self.cmp,
        ));
        let right_sort = self.right.insert(OnDiskSort::new(
            "right",
            side,
            &self.mem_pool,
            &self.spill,
            &self.cmp,
        ));

        let codec = &self.codec;
        let (left_out, right_out) = if self.config.parallel_sort {
            rayon::join(
                || left_sort.execute(left, codec),
                || right_sort.execute(right, codec),
            )
        } else {
            (left_sort.execute(left, codec), right_sort.execute(right, codec))
        };

        let left_stream = match left_out {
            Ok(stream) => stream,
            Err(e) => {
                if let Ok(stream) = right_out {
                    release_stream(stream);
                }
                return Err(e);
            }
        };
        let right_stream = match right_out {
            Ok(stream) => stream,
            Err(e) => {
                release_stream(left_stream);
                return Err(e);
            }
        };

        let policy = self.config.undrained_groups;
        self.left_groups = Some(KeyGroupIterator::new(left_stream, self.cmp.clone(), policy));
        self.right_groups = Some(KeyGroupIterator::new(right_stream, self.cmp.clone(), policy));
        Ok(())
    }

    /// Moves to the next key present on both sides. Returns false once
    /// either side is exhausted, and on every call after that.
    pub fn advance(&mut self) -> Result<bool> {
        match self.state {
            JoinState::Created => Err(ExecError::Precondition(
                "advance() before open()".to_string(),
            )),
            JoinState::Failed => Err(ExecError::Precondition(
                "join was aborted by an earlier error".to_string(),
            )),
            JoinState::Closed => Err(ExecError::Precondition(
                "advance() after close()".to_string(),
            )),
            JoinState::Finished => Ok(false),
            JoinState::Opened | JoinState::Matched => match self.zig_zag() {
                Ok(true) => {
                    self.state = JoinState::Matched;
                    Ok(true)
                }
                Ok(false) => {
                    self.state = JoinState::Finished;
                    Ok(false)
                }
                Err(e) => {
                    if !matches!(e, ExecError::Precondition(_)) {
                        log_error!("join aborted: {}", e);
                        self.state = JoinState::Failed;
                    }
                    Err(e)
                }
            },
        }
    }

    fn zig_zag(&mut self) -> Result<bool> {
        let (Some(left), Some(right)) = (self.left_groups.as_mut(), self.right_groups.as_mut())
        else {
            return Err(ExecError::Precondition("join is not open".to_string()));
        };
        // Check both sides before moving either, so a rejected call leaves
        // the current match intact.
        left.ensure_drained()?;
        right.ensure_drained()?;
        if !left.next_key()? || !right.next_key()? {
            return Ok(false);
        }
        loop {
            match self.cmp.compare(left.key()?, right.key()?) {
                Ordering::Equal => return Ok(true),
                Ordering::Less => {
                    if !left.skip_to_next_key()? {
                        return Ok(false);
                    }
                }
                Ordering::Greater => {
                    if !right.skip_to_next_key()? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn matched_groups(&mut self, left: bool) -> Result<&mut Groups<M>> {
        if self.state != JoinState::Matched {
            return Err(ExecError::Precondition(
                "no current match: advance() has not returned true".to_string(),
            ));
        }
        let groups = if left {
            self.left_groups.as_mut()
        } else {
            self.right_groups.as_mut()
        };
        groups.ok_or_else(|| ExecError::Precondition("join is not open".to_string()))
    }

    /// Encoded key of the current match.
    pub fn key_bytes(&mut self) -> Result<&[u8]> {
        self.matched_groups(true)?.key()
    }

    /// Key of the current match.
    pub fn key(&mut self) -> Result<C::Key> {
        let bytes = self.matched_groups(true)?.key()?.to_vec();
        self.codec.decode_key(&bytes)
    }

    /// Left values of the current match.
    pub fn values1(&mut self) -> Result<JoinValues<'_, M, C>> {
        self.values_of(true)
    }

    /// Right values of the current match.
    pub fn values2(&mut self) -> Result<JoinValues<'_, M, C>> {
        self.values_of(false)
    }

    fn values_of(&mut self, left: bool) -> Result<JoinValues<'_, M, C>> {
        if self.state != JoinState::Matched {
            return Err(ExecError::Precondition(
                "no current match: advance() has not returned true".to_string(),
            ));
        }
        let groups = if left {
            self.left_groups.as_mut()
        } else {
            self.right_groups.as_mut()
        };
        let groups = groups.ok_or_else(|| ExecError::Precondition("join is not open".to_string()))?;
        Ok(JoinValues {
            values: groups.values()?,
            codec: &self.codec,
            state: &mut self.state,
        })
    }

    /// Advances and reads both groups of the match in full.
    #[allow(clippy::type_complexity)]
    pub fn next_match(&mut self) -> Result<Option<(C::Key, Vec<C::Value>, Vec<C::Value>)>> {
        if !self.advance()? {
            return Ok(None);
        }
        let key = self.key()?;
        let left = self.values1()?.collect_all()?;
        let right = self.values2()?.collect_all()?;
        Ok(Some((key, left, right)))
    }

    /// Per-side sort statistics, `(left, right)`.
    pub fn stats(&self) -> (SortStats, SortStats) {
        let of = |s: &Option<OnDiskSort<M>>| {
            s.as_ref()
                .map(|s| s.stats().clone())
                .unwrap_or_default()
        };
        (of(&self.left), of(&self.right))
    }

    /// Releases every buffer, then every spill segment, then the spill
    /// files. Cleanup failures are logged, never returned.
    pub fn close(&mut self) {
        if self.state == JoinState::Closed {
            return;
        }
        let mut cursors = Vec::new();
        for groups in [self.left_groups.take(), self.right_groups.take()]
            .into_iter()
            .flatten()
        {
            cursors.extend(groups.into_inner().into_inner());
        }
        release_cursors(cursors);

        for sort in [self.left.as_mut(), self.right.as_mut()].into_iter().flatten() {
            if let Err(e) = sort.close() {
                log_warn!("failed to clean up {} side of join: {}", sort.name(), e);
            }
        }
        self.state = JoinState::Closed;
        log_debug!("join closed, spill stats: {:?}", self.spill.stats());
    }
}

impl<M: MemPool, C: KvCodec> Drop for OnDiskSortMergeJoin<M, C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// One side's values for the current match, decoded with the join's codec.
pub struct JoinValues<'a, M: MemPool, C: KvCodec> {
    values: GroupValues<'a, SortedRunStream<M>>,
    codec: &'a C,
    state: &'a mut JoinState,
}

impl<'a, M: MemPool, C: KvCodec> JoinValues<'a, M, C> {
    pub fn next_value(&mut self) -> Result<Option<C::Value>> {
        match self.values.next_value() {
            Ok(Some(bytes)) => self.codec.decode_value(&bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                log_error!("join aborted while reading values: {}", e);
                *self.state = JoinState::Failed;
                Err(e)
            }
        }
    }

    pub fn collect_all(mut self) -> Result<Vec<C::Value>> {
        let mut out = Vec::new();
        while let Some(v) = self.next_value()? {
            out.push(v);
        }
        Ok(out)
    }
}

impl<'a, M: MemPool, C: KvCodec> Iterator for JoinValues<'a, M, C> {
    type Item = Result<C::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value().transpose()
    }
}
