//! Spill storage: per-stream spill files carved into [`SpillSegment`]s.
//!
//! A [`SpillManager`] is a cheap, cloneable handle. It owns a space allocator
//! per file so that segments that are open for writing never overlap, and it
//! gets notified when a segment ends its write phase (its unused tail is
//! reusable right away) and when a segment is recycled (its whole range is
//! reusable). The byte I/O itself goes through a [`SpillBackend`].

pub mod segment;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::TempDir;

use crate::error::{ExecError, Result};

pub use segment::SpillSegment;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpillFileId(u32);

/// Raw byte storage for spill files.
pub trait SpillBackend: Send + Sync {
    fn create_file(&self, name: &str) -> io::Result<SpillFileId>;
    fn write_at(&self, file: SpillFileId, offset: u64, data: &[u8]) -> io::Result<()>;
    /// Reads up to `buf.len()` bytes. Returns 0 only past the end of data.
    fn read_at(&self, file: SpillFileId, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn delete_file(&self, file: SpillFileId) -> io::Result<()>;

    /// Copies `len` bytes between two files without staging them in user
    /// memory. `Ok(None)` means the backend has no such path.
    fn transfer(
        &self,
        _src: (SpillFileId, u64),
        _dst: (SpillFileId, u64),
        _len: u64,
    ) -> io::Result<Option<u64>> {
        Ok(None)
    }
}

/// Lets a caller keep a handle on a backend it gave to a manager.
impl<T: SpillBackend + ?Sized> SpillBackend for Arc<T> {
    fn create_file(&self, name: &str) -> io::Result<SpillFileId> {
        (**self).create_file(name)
    }

    fn write_at(&self, file: SpillFileId, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(file, offset, data)
    }

    fn read_at(&self, file: SpillFileId, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(file, offset, buf)
    }

    fn delete_file(&self, file: SpillFileId) -> io::Result<()> {
        (**self).delete_file(file)
    }

    fn transfer(
        &self,
        src: (SpillFileId, u64),
        dst: (SpillFileId, u64),
        len: u64,
    ) -> io::Result<Option<u64>> {
        (**self).transfer(src, dst, len)
    }
}

/// Spill files in a private temporary directory, removed with the backend.
pub struct TempFileBackend {
    dir: TempDir,
    files: Mutex<HashMap<SpillFileId, (PathBuf, Arc<File>)>>,
    next_id: AtomicU32,
}

impl TempFileBackend {
    pub fn new() -> io::Result<Self> {
        Self::from_dir(tempfile::Builder::new().prefix("smj_spill_").tempdir()?)
    }

    pub fn new_in(base_dir: impl AsRef<Path>) -> io::Result<Self> {
        std::fs::create_dir_all(base_dir.as_ref())?;
        Self::from_dir(
            tempfile::Builder::new()
                .prefix("smj_spill_")
                .tempdir_in(base_dir)?,
        )
    }

    fn from_dir(dir: TempDir) -> io::Result<Self> {
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<SpillFileId, (PathBuf, Arc<File>)>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    // The lock only covers the lookup; positional I/O runs without it.
    fn file(&self, id: SpillFileId) -> io::Result<Arc<File>> {
        let files = self.files();
        let (_, file) = files.get(&id).ok_or_else(|| unknown_file(id))?;
        Ok(Arc::clone(file))
    }
}

impl SpillBackend for TempFileBackend {
    fn create_file(&self, name: &str) -> io::Result<SpillFileId> {
        let id = SpillFileId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let path = self.dir.path().join(format!("{}_{}.spill", name, id.0));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.files().insert(id, (path, Arc::new(file)));
        Ok(id)
    }

    fn write_at(&self, file: SpillFileId, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file(file)?.write_all_at(data, offset)
    }

    fn read_at(&self, file: SpillFileId, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file(file)?.read_at(buf, offset)
    }

    fn delete_file(&self, file: SpillFileId) -> io::Result<()> {
        let removed = self.files().remove(&file);
        match removed {
            Some((path, handle)) => {
                drop(handle);
                std::fs::remove_file(path)
            }
            None => Err(unknown_file(file)),
        }
    }

    fn transfer(
        &self,
        src: (SpillFileId, u64),
        dst: (SpillFileId, u64),
        len: u64,
    ) -> io::Result<Option<u64>> {
        // Duplicated handles share one file position.
        if src.0 == dst.0 {
            return Ok(None);
        }
        let mut reader = self.file(src.0)?.try_clone()?;
        let mut writer = self.file(dst.0)?.try_clone()?;
        reader.seek(SeekFrom::Start(src.1))?;
        writer.seek(SeekFrom::Start(dst.1))?;
        // File-to-file io::copy uses copy_file_range where the kernel has it.
        let copied = io::copy(&mut io::Read::take(reader, len), &mut writer)?;
        Ok(Some(copied))
    }
}

/// Keeps spill files in memory. Used by tests, which can also make every
/// write fail to exercise the error paths.
#[derive(Default)]
pub struct InMemBackend {
    files: Mutex<HashMap<SpillFileId, Vec<u8>>>,
    next_id: AtomicU32,
    fail_writes: AtomicBool,
}

impl InMemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn num_files(&self) -> usize {
        self.files().len()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<SpillFileId, Vec<u8>>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpillBackend for InMemBackend {
    fn create_file(&self, _name: &str) -> io::Result<SpillFileId> {
        let id = SpillFileId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.files().insert(id, Vec::new());
        Ok(id)
    }

    fn write_at(&self, file: SpillFileId, offset: u64, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let mut files = self.files();
        let bytes = files.get_mut(&file).ok_or_else(|| unknown_file(file))?;
        let start = offset as usize;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, file: SpillFileId, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let files = self.files();
        let bytes = files.get(&file).ok_or_else(|| unknown_file(file))?;
        let start = (offset as usize).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn delete_file(&self, file: SpillFileId) -> io::Result<()> {
        self.files()
            .remove(&file)
            .map(|_| ())
            .ok_or_else(|| unknown_file(file))
    }
}

fn unknown_file(id: SpillFileId) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("unknown spill file {:?}", id))
}

/// Free space of one spill file: a high-water mark plus recycled ranges.
#[derive(Default)]
struct FileSpace {
    high_water: u64,
    free: Vec<(u64, u64)>, // (offset, len), sorted by offset
}

impl FileSpace {
    fn allocate(&mut self, len: u64) -> u64 {
        if let Some(pos) = self.free.iter().position(|&(_, l)| l >= len) {
            let (offset, l) = self.free[pos];
            if l == len {
                self.free.remove(pos);
            } else {
                self.free[pos] = (offset + len, l - len);
            }
            return offset;
        }
        let offset = self.high_water;
        self.high_water += len;
        offset
    }

    fn release(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let pos = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(pos, (offset, len));
        // Coalesce with the neighbours.
        if pos + 1 < self.free.len() {
            let (o, l) = self.free[pos];
            let (next_o, next_l) = self.free[pos + 1];
            if o + l == next_o {
                self.free[pos] = (o, l + next_l);
                self.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_o, prev_l) = self.free[pos - 1];
            let (o, l) = self.free[pos];
            if prev_o + prev_l == o {
                self.free[pos - 1] = (prev_o, prev_l + l);
                self.free.remove(pos);
            }
        }
        // Give the tail back to the high-water mark.
        if let Some(&(o, l)) = self.free.last() {
            if o + l == self.high_water {
                self.high_water = o;
                self.free.pop();
            }
        }
    }
}

#[derive(Default)]
struct SpillCounters {
    segments_allocated: AtomicU64,
    segments_recycled: AtomicU64,
    write_phases_finished: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

/// Snapshot of a manager's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub segments_allocated: u64,
    pub segments_recycled: u64,
    pub write_phases_finished: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl SpillStats {
    pub fn live_segments(&self) -> u64 {
        self.segments_allocated - self.segments_recycled
    }
}

pub(crate) struct SpillManagerInner {
    backend: Box<dyn SpillBackend>,
    files: Mutex<HashMap<SpillFileId, FileSpace>>,
    counters: SpillCounters,
}

impl SpillManagerInner {
    fn files(&self) -> MutexGuard<'_, HashMap<SpillFileId, FileSpace>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn backend(&self) -> &dyn SpillBackend {
        self.backend.as_ref()
    }

    pub(crate) fn count_written(&self, n: u64) {
        self.counters.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_read(&self, n: u64) {
        self.counters.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    /// The segment at `offset` ended its write phase with `written` of its
    /// `capacity` bytes used. The rest is free again.
    pub(crate) fn write_phase_finished(
        &self,
        file: SpillFileId,
        offset: u64,
        capacity: u64,
        written: u64,
    ) {
        self.counters
            .write_phases_finished
            .fetch_add(1, Ordering::Relaxed);
        if let Some(space) = self.files().get_mut(&file) {
            space.release(offset + written, capacity - written);
        }
        log_trace!(
            "segment {:?}@{} finished writing: {} of {} bytes",
            file,
            offset,
            written,
            capacity
        );
    }

    pub(crate) fn recycle(&self, file: SpillFileId, offset: u64, len: u64) {
        self.counters
            .segments_recycled
            .fetch_add(1, Ordering::Relaxed);
        // The file may already be gone when a join is torn down.
        if let Some(space) = self.files().get_mut(&file) {
            space.release(offset, len);
        }
    }
}

/// Handle to the spill storage shared by everything that spills in a join.
#[derive(Clone)]
pub struct SpillManager {
    inner: Arc<SpillManagerInner>,
}

impl SpillManager {
    pub fn new(backend: Box<dyn SpillBackend>) -> Self {
        Self {
            inner: Arc::new(SpillManagerInner {
                backend,
                files: Mutex::new(HashMap::new()),
                counters: SpillCounters::default(),
            }),
        }
    }

    /// Spill files in a fresh temporary directory.
    pub fn temp() -> Result<Self> {
        Ok(Self::new(Box::new(TempFileBackend::new()?)))
    }

    /// Spill files in a fresh temporary directory below `base_dir`.
    pub fn temp_in(base_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Box::new(TempFileBackend::new_in(base_dir)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemBackend::new()))
    }

    pub fn create_file(&self, name: &str) -> Result<SpillFileId> {
        let id = self.inner.backend.create_file(name)?;
        self.inner.files().insert(id, FileSpace::default());
        Ok(id)
    }

    /// Reserves `capacity` bytes in `file` for a new segment in write mode.
    pub fn allocate_segment(&self, file: SpillFileId, capacity: u64) -> Result<SpillSegment> {
        let offset = {
            let mut files = self.inner.files();
            let space = files
                .get_mut(&file)
                .ok_or_else(|| ExecError::Io(unknown_file(file)))?;
            space.allocate(capacity)
        };
        self.inner
            .counters
            .segments_allocated
            .fetch_add(1, Ordering::Relaxed);
        Ok(SpillSegment::new(
            Arc::clone(&self.inner),
            file,
            offset,
            capacity,
        ))
    }

    /// Deletes a spill file. Segments still pointing into it must not be
    /// read afterwards.
    pub fn remove_file(&self, file: SpillFileId) -> Result<()> {
        self.inner.files().remove(&file);
        self.inner.backend.delete_file(file)?;
        Ok(())
    }

    pub fn stats(&self) -> SpillStats {
        let c = &self.inner.counters;
        SpillStats {
            segments_allocated: c.segments_allocated.load(Ordering::Relaxed),
            segments_recycled: c.segments_recycled.load(Ordering::Relaxed),
            write_phases_finished: c.write_phases_finished.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Recycled bytes of `file` below the high-water mark, waiting for reuse.
    pub fn free_bytes(&self, file: SpillFileId) -> Option<u64> {
        self.inner
            .files()
            .get(&file)
            .map(|s| s.free.iter().map(|&(_, l)| l).sum())
    }

    /// End of the allocated part of `file`.
    pub fn high_water(&self, file: SpillFileId) -> Option<u64> {
        self.inner.files().get(&file).map(|s| s.high_water)
    }
}
