use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use super::page::{max_kv_size, AppendOnlyKVPage};
use super::sort_buffer::{SortBuffer, SortBufferCursor};
use crate::error::{ExecError, Result};
use crate::executor::{Record, SortedStream};
use crate::mem_pool::{MemPool, Page, PAGE_SIZE};
use crate::spill::{SpillFileId, SpillManager, SpillSegment};

/// A key-ordered sequence of records, either still in its sort buffer or
/// written out to spill segments.
pub enum SortedRun<M: MemPool> {
    InMemory(SortBuffer<M>),
    Spilled(SpilledRun),
}

impl<M: MemPool> SortedRun<M> {
    pub fn num_records(&self) -> usize {
        match self {
            SortedRun::InMemory(buffer) => buffer.len(),
            SortedRun::Spilled(run) => run.num_records(),
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, SortedRun::Spilled(_))
    }

    /// Opens the run for reading. Spilled runs read ahead `read_ahead_pages`
    /// frames at a time.
    pub fn into_cursor(self, mem_pool: &Arc<M>, read_ahead_pages: usize) -> Result<RunCursor<M>> {
        Ok(match self {
            SortedRun::InMemory(buffer) => RunCursor::InMemory(buffer.into_cursor()),
            SortedRun::Spilled(run) => {
                RunCursor::Spilled(SpilledRunCursor::new(run, mem_pool, read_ahead_pages)?)
            }
        })
    }
}

/// Drops in-memory runs before spilled ones, so buffers go back to the pool
/// before any spill segment is recycled.
pub fn release_runs<M: MemPool>(runs: Vec<SortedRun<M>>) {
    let (in_memory, spilled): (Vec<_>, Vec<_>) = runs.into_iter().partition(|r| !r.is_spilled());
    drop(in_memory);
    drop(spilled);
}

/// Same order as [`release_runs`] for runs that are already being read.
pub fn release_cursors<M: MemPool>(cursors: Vec<RunCursor<M>>) {
    let (in_memory, spilled): (Vec<_>, Vec<_>) = cursors
        .into_iter()
        .partition(|c| matches!(c, RunCursor::InMemory(_)));
    drop(in_memory);
    drop(spilled);
}

/// Spill file of one input, created on first use.
pub struct RunSpillFile {
    spill: SpillManager,
    name: String,
    file: Option<SpillFileId>,
}

impl RunSpillFile {
    pub fn new(spill: &SpillManager, name: &str) -> Self {
        Self {
            spill: spill.clone(),
            name: name.to_string(),
            file: None,
        }
    }

    pub fn manager(&self) -> &SpillManager {
        &self.spill
    }

    pub fn is_created(&self) -> bool {
        self.file.is_some()
    }

    pub fn id(&mut self) -> Result<SpillFileId> {
        if let Some(file) = self.file {
            return Ok(file);
        }
        let file = self.spill.create_file(&self.name)?;
        log_debug!("created spill file {:?} for {}", file, self.name);
        self.file = Some(file);
        Ok(file)
    }

    /// Deletes the file if it was ever created. Calling this again is a
    /// no-op.
    pub fn remove(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => self.spill.remove_file(file),
            None => Ok(()),
        }
    }
}

/// Segments of one spilled run, in write order. Each segment holds whole
/// pages.
#[derive(Debug)]
pub struct SpilledRun {
    segments: VecDeque<SpillSegment>,
    num_records: usize,
    num_pages: usize,
}

impl SpilledRun {
    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

/// Packs records into a staging page from the pool and writes each full page
/// to the current segment, opening a new segment when that one is full.
pub struct SpilledRunWriter<M: MemPool> {
    mem_pool: Arc<M>,
    spill: SpillManager,
    file: SpillFileId,
    segment_capacity: u64,
    staging: Option<Page>,
    current: Option<SpillSegment>,
    segments: VecDeque<SpillSegment>,
    num_records: usize,
    num_pages: usize,
}

impl<M: MemPool> SpilledRunWriter<M> {
    pub fn new(
        mem_pool: &Arc<M>,
        spill: &SpillManager,
        file: SpillFileId,
        segment_pages: usize,
    ) -> Result<Self> {
        let mut staging = mem_pool.create_new_page()?;
        staging.init();
        Ok(Self {
            mem_pool: mem_pool.clone(),
            spill: spill.clone(),
            file,
            segment_capacity: (segment_pages.max(1) * PAGE_SIZE) as u64,
            staging: Some(staging),
            current: None,
            segments: VecDeque::new(),
            num_records: 0,
            num_pages: 0,
        })
    }

    pub fn append(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        if self.staging_page()?.append(key, val) {
            self.num_records += 1;
            return Ok(());
        }
        self.flush_page()?;
        if !self.staging_page()?.append(key, val) {
            return Err(ExecError::RecordTooLarge {
                size: key.len() + val.len(),
                max: max_kv_size(),
            });
        }
        self.num_records += 1;
        Ok(())
    }

    fn staging_page(&mut self) -> Result<&mut Page> {
        self.staging
            .as_mut()
            .ok_or_else(|| ExecError::Capacity("spilled run writer already finished".to_string()))
    }

    fn flush_page(&mut self) -> Result<()> {
        let Some(page) = self.staging.as_mut() else {
            return Ok(());
        };
        if page.slot_count() == 0 {
            return Ok(());
        }
        let needs_segment = match &self.current {
            Some(seg) => seg.remaining() < PAGE_SIZE as u64,
            None => true,
        };
        if needs_segment {
            if let Some(mut full) = self.current.take() {
                full.finish_write_phase()?;
                self.segments.push_back(full);
            }
            self.current = Some(self.spill.allocate_segment(self.file, self.segment_capacity)?);
        }
        if let Some(seg) = self.current.as_mut() {
            let mut written = 0;
            while written < PAGE_SIZE {
                let n = seg.write(&page[written..])?;
                if n == 0 {
                    return Err(ExecError::Capacity(
                        "spill segment smaller than a page".to_string(),
                    ));
                }
                written += n;
            }
        }
        page.init();
        self.num_pages += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<SpilledRun> {
        self.flush_page()?;
        if let Some(mut last) = self.current.take() {
            last.finish_write_phase()?;
            self.segments.push_back(last);
        }
        if let Some(page) = self.staging.take() {
            self.mem_pool.release_page(page);
        }
        Ok(SpilledRun {
            segments: std::mem::take(&mut self.segments),
            num_records: self.num_records,
            num_pages: self.num_pages,
        })
    }
}

impl<M: MemPool> Drop for SpilledRunWriter<M> {
    fn drop(&mut self) {
        if let Some(page) = self.staging.take() {
            self.mem_pool.release_page(page);
        }
    }
}

/// Reads a spilled run page by page. Up to `read_ahead_pages` frames are
/// filled per refill; a segment is recycled as soon as its last page is in
/// memory.
pub struct SpilledRunCursor<M: MemPool> {
    mem_pool: Arc<M>,
    segments: VecDeque<SpillSegment>,
    frames: Vec<Page>,
    loaded: usize,
    page_idx: usize,
    slot_id: u16,
}

impl<M: MemPool> SpilledRunCursor<M> {
    pub fn new(run: SpilledRun, mem_pool: &Arc<M>, read_ahead_pages: usize) -> Result<Self> {
        let num_frames = read_ahead_pages.max(1).min(run.num_pages);
        let mut cursor = Self {
            mem_pool: mem_pool.clone(),
            segments: run.segments,
            frames: Vec::with_capacity(num_frames),
            loaded: 0,
            page_idx: 0,
            slot_id: 0,
        };
        for _ in 0..num_frames {
            // On failure the frames taken so far go back through Drop.
            cursor.frames.push(mem_pool.create_new_page()?);
        }
        Ok(cursor)
    }

    fn refill(&mut self) -> Result<()> {
        self.loaded = 0;
        self.page_idx = 0;
        self.slot_id = 0;
        'frames: for frame in self.frames.iter_mut() {
            loop {
                let Some(seg) = self.segments.front_mut() else {
                    break 'frames;
                };
                if seg.remaining() == 0 {
                    if let Some(done) = self.segments.pop_front() {
                        done.recycle();
                    }
                    continue;
                }
                let mut filled = 0;
                while filled < PAGE_SIZE {
                    let n = seg.read(&mut frame[filled..])?;
                    if n == 0 {
                        return Err(ExecError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "spilled run ends inside a page",
                        )));
                    }
                    filled += n;
                }
                if seg.remaining() == 0 {
                    if let Some(done) = self.segments.pop_front() {
                        done.recycle();
                    }
                }
                self.loaded += 1;
                break;
            }
        }
        Ok(())
    }
}

impl<M: MemPool> SortedStream for SpilledRunCursor<M> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if self.page_idx < self.loaded {
                let page = &self.frames[self.page_idx];
                if self.slot_id < page.slot_count() {
                    let rec = (
                        page.get_key(self.slot_id).to_vec(),
                        page.get_val(self.slot_id).to_vec(),
                    );
                    self.slot_id += 1;
                    return Ok(Some(rec));
                }
                self.page_idx += 1;
                self.slot_id = 0;
                continue;
            }
            if self.segments.is_empty() || self.frames.is_empty() {
                return Ok(None);
            }
            self.refill()?;
            if self.loaded == 0 {
                return Ok(None);
            }
        }
    }
}

impl<M: MemPool> Drop for SpilledRunCursor<M> {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            self.mem_pool.release_page(frame);
        }
    }
}

/// Merge input: an open run of either kind.
pub enum RunCursor<M: MemPool> {
    InMemory(SortBufferCursor<M>),
    Spilled(SpilledRunCursor<M>),
}

impl<M: MemPool> SortedStream for RunCursor<M> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        match self {
            RunCursor::InMemory(cursor) => cursor.next_record(),
            RunCursor::Spilled(cursor) => cursor.next_record(),
        }
    }
}
