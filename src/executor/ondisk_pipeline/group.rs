use std::cmp::Ordering;
use std::sync::Arc;

use crate::codec::KeyComparator;
use crate::config::UndrainedGroupPolicy;
use crate::error::{ExecError, Result};
use crate::executor::{Record, SortedStream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GroupState {
    BeforeFirst,
    Positioned,
    Exhausted,
}

/// Walks a sorted stream one distinct key at a time.
///
/// Equal keys are contiguous in the input, so a group is the run of records
/// that compare equal to its first record. The iterator keeps one record of
/// lookahead: while positioned it is either the next unread value of the
/// current group or the first record of the following group.
pub struct KeyGroupIterator<S: SortedStream> {
    input: S,
    cmp: Arc<dyn KeyComparator>,
    policy: UndrainedGroupPolicy,
    state: GroupState,
    current_key: Vec<u8>,
    lookahead: Option<Record>,
    // Whether `lookahead` belongs to the current group.
    lookahead_in_group: bool,
}

impl<S: SortedStream> KeyGroupIterator<S> {
    pub fn new(input: S, cmp: Arc<dyn KeyComparator>, policy: UndrainedGroupPolicy) -> Self {
        Self {
            input,
            cmp,
            policy,
            state: GroupState::BeforeFirst,
            current_key: Vec::new(),
            lookahead: None,
            lookahead_in_group: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == GroupState::Exhausted
    }

    fn fetch(&mut self) -> Result<()> {
        self.lookahead = self.input.next_record()?;
        self.lookahead_in_group = match &self.lookahead {
            Some((key, _)) => self.cmp.compare(key, &self.current_key) == Ordering::Equal,
            None => false,
        };
        Ok(())
    }

    // Makes the lookahead record the first of a new group.
    fn position_on_lookahead(&mut self) -> bool {
        match &self.lookahead {
            Some((key, _)) => {
                self.current_key.clear();
                self.current_key.extend_from_slice(key);
                self.lookahead_in_group = true;
                self.state = GroupState::Positioned;
                true
            }
            None => {
                self.state = GroupState::Exhausted;
                false
            }
        }
    }

    /// Moves to the next distinct key. Returns false once the input is
    /// exhausted.
    ///
    /// Values of the current key that were not read are skipped, or
    /// rejected with a precondition error under
    /// [`UndrainedGroupPolicy::Reject`].
    pub fn next_key(&mut self) -> Result<bool> {
        self.ensure_drained()?;
        self.skip_to_next_key()
    }

    /// Fails under [`UndrainedGroupPolicy::Reject`] if the current group
    /// still has unread values.
    pub fn ensure_drained(&self) -> Result<()> {
        if self.policy == UndrainedGroupPolicy::Reject
            && self.state == GroupState::Positioned
            && self.lookahead_in_group
        {
            return Err(ExecError::Precondition(
                "values of the current key were not fully read".to_string(),
            ));
        }
        Ok(())
    }

    /// Like `next_key()` but always skips unread values. Used for groups
    /// the caller never saw.
    pub fn skip_to_next_key(&mut self) -> Result<bool> {
        match self.state {
            GroupState::Exhausted => Ok(false),
            GroupState::BeforeFirst => {
                self.lookahead = self.input.next_record()?;
                Ok(self.position_on_lookahead())
            }
            GroupState::Positioned => {
                if self.lookahead_in_group {
                    let mut skipped = 0usize;
                    while self.lookahead_in_group {
                        skipped += 1;
                        self.fetch()?;
                    }
                    log_debug!("skipped {} undrained values", skipped);
                }
                Ok(self.position_on_lookahead())
            }
        }
    }

    /// Current key. Valid between a `next_key()` returning true and the
    /// following `next_key()`.
    pub fn key(&self) -> Result<&[u8]> {
        match self.state {
            GroupState::Positioned => Ok(&self.current_key),
            _ => Err(ExecError::Precondition(
                "no current key: next_key() has not returned true".to_string(),
            )),
        }
    }

    /// Values of the current key. The returned sequence borrows the iterator,
    /// so only one can be live at a time; once it ends the iterator already
    /// holds the first record of the next key.
    pub fn values(&mut self) -> Result<GroupValues<'_, S>> {
        if self.state != GroupState::Positioned {
            return Err(ExecError::Precondition(
                "no current group: next_key() has not returned true".to_string(),
            ));
        }
        Ok(GroupValues { groups: self })
    }

    pub fn into_inner(self) -> S {
        self.input
    }
}

/// Forward-only values of one group.
pub struct GroupValues<'a, S: SortedStream> {
    groups: &'a mut KeyGroupIterator<S>,
}

impl<'a, S: SortedStream> GroupValues<'a, S> {
    pub fn next_value(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.groups.lookahead_in_group {
            return Ok(None);
        }
        let value = match self.groups.lookahead.take() {
            Some((_, value)) => value,
            None => return Ok(None),
        };
        self.groups.fetch()?;
        Ok(Some(value))
    }

    /// Reads the rest of the group.
    pub fn collect_all(mut self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        while let Some(v) = self.next_value()? {
            out.push(v);
        }
        Ok(out)
    }
}

impl<'a, S: SortedStream> Iterator for GroupValues<'a, S> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value().transpose()
    }
}
