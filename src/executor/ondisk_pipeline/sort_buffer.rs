use std::sync::Arc;

use super::page::{max_kv_size, record_size, AppendOnlyKVPage, PAGE_HEADER_SIZE};
use super::run::{SpilledRun, SpilledRunWriter};
use crate::codec::KeyComparator;
use crate::error::{ExecError, Result};
use crate::executor::{Record, SortedStream};
use crate::mem_pool::{MemPool, MemPoolStatus, Page, PAGE_SIZE};
use crate::spill::{SpillFileId, SpillManager};

/// Records of one future run, kept in pool pages.
///
/// The buffer is full when either its page budget or its optional record
/// count is used up; `append` then returns `Ok(false)` and the caller seals
/// the buffer with [`SortBuffer::sort_and_freeze`]. Pages go back to the pool
/// when the buffer is dropped.
pub struct SortBuffer<M: MemPool> {
    mem_pool: Arc<M>,
    cmp: Arc<dyn KeyComparator>,
    ptrs: Vec<(usize, u16)>, // Slot pointers. (page index, slot_id)
    data_buffer: Vec<Page>,
    max_pages: usize,
    max_records: Option<usize>,
    bytes_used: usize,
    frozen: bool,
}

impl<M: MemPool> SortBuffer<M> {
    pub fn new(
        mem_pool: &Arc<M>,
        cmp: &Arc<dyn KeyComparator>,
        max_pages: usize,
        max_records: Option<usize>,
    ) -> Self {
        Self {
            mem_pool: mem_pool.clone(),
            cmp: cmp.clone(),
            ptrs: Vec::new(),
            data_buffer: Vec::new(),
            max_pages: max_pages.max(1),
            max_records,
            bytes_used: 0,
            frozen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn num_pages(&self) -> usize {
        self.data_buffer.len()
    }

    /// Records that can still be appended under the count limit.
    pub fn free_records(&self) -> Option<usize> {
        self.max_records.map(|max| max.saturating_sub(self.ptrs.len()))
    }

    /// Serialized bytes (slots included) left under the page budget. Page
    /// fragmentation can make the usable amount smaller.
    pub fn free_bytes(&self) -> usize {
        (self.max_pages * (PAGE_SIZE - PAGE_HEADER_SIZE)).saturating_sub(self.bytes_used)
    }

    pub fn append(&mut self, key: &[u8], val: &[u8]) -> Result<bool> {
        if self.frozen {
            return Err(ExecError::Capacity(
                "append to a frozen sort buffer".to_string(),
            ));
        }
        if key.len() + val.len() > max_kv_size() {
            return Err(ExecError::RecordTooLarge {
                size: key.len() + val.len(),
                max: max_kv_size(),
            });
        }
        if self.free_records() == Some(0) {
            return Ok(false);
        }

        /* ---------- try to append to the current page ------------------------ */
        if let Some(page) = self.data_buffer.last_mut() {
            if page.append(key, val) {
                let slot_id = page.slot_count() - 1;
                self.ptrs.push((self.data_buffer.len() - 1, slot_id));
                self.bytes_used += record_size(key.len(), val.len());
                return Ok(true);
            }
        }

        /* ---------- need a new page ----------------------------------------- */
        if !self.grow()? {
            return Ok(false);
        }
        let page_idx = self.data_buffer.len() - 1;
        let page = &mut self.data_buffer[page_idx];
        if !page.append(key, val) {
            return Err(ExecError::RecordTooLarge {
                size: key.len() + val.len(),
                max: max_kv_size(),
            });
        }
        self.ptrs.push((page_idx, page.slot_count() - 1));
        self.bytes_used += record_size(key.len(), val.len());
        Ok(true)
    }

    // Takes one more page from the pool. `Ok(false)` when the buffer is at its
    // page budget or the pool is drained while this buffer already has data.
    fn grow(&mut self) -> Result<bool> {
        if self.data_buffer.len() >= self.max_pages {
            return Ok(false);
        }
        match self.mem_pool.create_new_page() {
            Ok(mut page) => {
                page.init();
                self.data_buffer.push(page);
                Ok(true)
            }
            Err(MemPoolStatus::CannotEvictPage) if !self.ptrs.is_empty() => Ok(false),
            Err(status) => Err(ExecError::MemPool(status)),
        }
    }

    /// Stable sort by key; records with equal keys keep their arrival order.
    /// After this the buffer is read-only.
    pub fn sort_and_freeze(&mut self) {
        if self.frozen {
            return;
        }
        let pages = &self.data_buffer;
        let cmp = &self.cmp;
        self.ptrs.sort_by(|a, b| {
            let key_a = pages[a.0].get_key(a.1);
            let key_b = pages[b.0].get_key(b.1);
            cmp.compare(key_a, key_b)
        });
        self.frozen = true;
    }

    pub fn iter(&self) -> SortBufferIter<'_, M> {
        SortBufferIter::new(self)
    }

    /// Writes the frozen buffer to a new spilled run and returns its pages to
    /// the pool.
    pub fn spill_to(
        self,
        spill: &SpillManager,
        file: SpillFileId,
        segment_pages: usize,
    ) -> Result<SpilledRun> {
        if !self.frozen {
            return Err(ExecError::Capacity(
                "spill of a sort buffer that was never frozen".to_string(),
            ));
        }
        let mut writer = SpilledRunWriter::new(&self.mem_pool, spill, file, segment_pages)?;
        for (key, val) in self.iter() {
            writer.append(key, val)?;
        }
        writer.finish()
    }

    pub fn into_cursor(mut self) -> SortBufferCursor<M> {
        self.sort_and_freeze();
        SortBufferCursor {
            buffer: self,
            idx: 0,
        }
    }
}

impl<M: MemPool> Drop for SortBuffer<M> {
    fn drop(&mut self) {
        for page in self.data_buffer.drain(..) {
            self.mem_pool.release_page(page);
        }
    }
}

/// Iterator for sort buffer. Output key, value by sorting order once the
/// buffer is frozen, by arrival order before.
pub struct SortBufferIter<'a, M: MemPool> {
    sort_buffer: &'a SortBuffer<M>,
    idx: usize,
}

impl<'a, M: MemPool> SortBufferIter<'a, M> {
    pub fn new(sort_buffer: &'a SortBuffer<M>) -> Self {
        Self {
            sort_buffer,
            idx: 0,
        }
    }
}

impl<'a, M: MemPool> Iterator for SortBufferIter<'a, M> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (page_idx, slot_id) = *self.sort_buffer.ptrs.get(self.idx)?;
        let page = &self.sort_buffer.data_buffer[page_idx];
        self.idx += 1;
        Some((page.get_key(slot_id), page.get_val(slot_id)))
    }
}

/// Owning cursor over a frozen buffer, used as a merge input.
pub struct SortBufferCursor<M: MemPool> {
    buffer: SortBuffer<M>,
    idx: usize,
}

impl<M: MemPool> SortedStream for SortBufferCursor<M> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(&(page_idx, slot_id)) = self.buffer.ptrs.get(self.idx) else {
            return Ok(None);
        };
        let page = &self.buffer.data_buffer[page_idx];
        self.idx += 1;
        Ok(Some((
            page.get_key(slot_id).to_vec(),
            page.get_val(slot_id).to_vec(),
        )))
    }
}
