use std::io;
use std::sync::Arc;

use super::{SpillFileId, SpillManagerInner};
use crate::error::{ExecError, Result};
use crate::mem_pool::PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SegmentMode {
    Write,
    Read,
}

/// A byte range `[offset, offset + size)` of a spill file.
///
/// A segment starts in write mode with a fixed capacity and only accepts
/// sequential appends. `finish_write_phase` switches it to read mode, fixes
/// `size` to the bytes actually written and hands the unused tail back to the
/// manager. Reads are sequential as well. The range is recycled when the
/// segment is dropped (or passed to [`SpillSegment::recycle`]), which can
/// happen exactly once.
pub struct SpillSegment {
    manager: Arc<SpillManagerInner>,
    file: SpillFileId,
    offset: u64,
    capacity: u64,
    size: u64,
    read_pos: u64,
    mode: SegmentMode,
}

impl SpillSegment {
    pub(crate) fn new(
        manager: Arc<SpillManagerInner>,
        file: SpillFileId,
        offset: u64,
        capacity: u64,
    ) -> Self {
        Self {
            manager,
            file,
            offset,
            capacity,
            size: 0,
            read_pos: 0,
            mode: SegmentMode::Write,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes written so far. Final once the write phase is over.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_write_phase(&self) -> bool {
        self.mode == SegmentMode::Write
    }

    /// In write mode: bytes that can still be written. In read mode: bytes
    /// not read yet.
    pub fn remaining(&self) -> u64 {
        match self.mode {
            SegmentMode::Write => self.capacity - self.size,
            SegmentMode::Read => self.size - self.read_pos,
        }
    }

    /// Appends as much of `bytes` as the capacity allows and returns how
    /// much that was.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.mode != SegmentMode::Write {
            return Err(ExecError::Capacity(
                "write to a spill segment after its write phase".to_string(),
            ));
        }
        let n = (bytes.len() as u64).min(self.capacity - self.size) as usize;
        if n > 0 {
            self.manager
                .backend()
                .write_at(self.file, self.offset + self.size, &bytes[..n])?;
            self.size += n as u64;
            self.manager.count_written(n as u64);
        }
        Ok(n)
    }

    pub fn finish_write_phase(&mut self) -> Result<()> {
        if self.mode != SegmentMode::Write {
            return Err(ExecError::Capacity(
                "write phase of spill segment finished twice".to_string(),
            ));
        }
        self.mode = SegmentMode::Read;
        self.manager
            .write_phase_finished(self.file, self.offset, self.capacity, self.size);
        Ok(())
    }

    /// Sequential read into `buf`. `Ok(0)` means the segment is exhausted
    /// (or `buf` is empty).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode != SegmentMode::Read {
            return Err(ExecError::Capacity(
                "read from a spill segment still in its write phase".to_string(),
            ));
        }
        let n = (buf.len() as u64).min(self.size - self.read_pos) as usize;
        let mut filled = 0;
        while filled < n {
            let got = self.manager.backend().read_at(
                self.file,
                self.offset + self.read_pos + filled as u64,
                &mut buf[filled..n],
            )?;
            if got == 0 {
                return Err(ExecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "spill file shorter than segment",
                )));
            }
            filled += got;
        }
        self.read_pos += n as u64;
        self.manager.count_read(n as u64);
        Ok(n)
    }

    /// Moves the unread bytes of this read-mode segment into `dest`, which
    /// must be in write mode, as far as `dest` has room. Uses the backend's
    /// zero-copy path when both segments live in the same manager and falls
    /// back to a page-sized buffer otherwise.
    pub fn transfer_to(&mut self, dest: &mut SpillSegment) -> Result<u64> {
        if self.mode != SegmentMode::Read || dest.mode != SegmentMode::Write {
            return Err(ExecError::Capacity(
                "transfer needs a read-mode source and a write-mode destination".to_string(),
            ));
        }
        let len = self.remaining().min(dest.remaining());
        let mut moved = 0u64;

        if len > 0 && Arc::ptr_eq(&self.manager, &dest.manager) {
            let zero_copy = self.manager.backend().transfer(
                (self.file, self.offset + self.read_pos),
                (dest.file, dest.offset + dest.size),
                len,
            )?;
            if let Some(n) = zero_copy {
                let n = n.min(len);
                self.read_pos += n;
                dest.size += n;
                self.manager.count_read(n);
                self.manager.count_written(n);
                moved = n;
            }
        }

        if moved < len {
            let mut buf = vec![0u8; PAGE_SIZE];
            while moved < len {
                let want = ((len - moved) as usize).min(buf.len());
                let got = self.read(&mut buf[..want])?;
                if got == 0 {
                    break;
                }
                let written = dest.write(&buf[..got])?;
                debug_assert_eq!(written, got);
                moved += written as u64;
            }
        }
        Ok(moved)
    }

    /// Gives the range back to the manager.
    pub fn recycle(self) {
        drop(self)
    }
}

impl Drop for SpillSegment {
    fn drop(&mut self) {
        let len = match self.mode {
            SegmentMode::Write => self.capacity,
            SegmentMode::Read => self.size,
        };
        self.manager.recycle(self.file, self.offset, len);
    }
}

impl std::fmt::Debug for SpillSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillSegment")
            .field("file", &self.file)
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .field("read_pos", &self.read_pos)
            .field("mode", &self.mode)
            .finish()
    }
}
