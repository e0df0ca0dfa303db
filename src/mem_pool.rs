use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Size of every frame handed out by a [`MemPool`]. Slot offsets inside a
/// page are `u16`, so this must stay below 64 KiB.
pub const PAGE_SIZE: usize = 16 * 1024;

/// A fixed-size frame of memory.
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    pub fn new_empty() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("len", &self.data.len()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPoolStatus {
    /// Every frame is currently handed out.
    CannotEvictPage,
}

/// Grants fixed-size frames out of a budget fixed at construction time.
/// Frames go back through `release_page`; they are never freed piecemeal.
pub trait MemPool: Send + Sync {
    fn create_new_page(&self) -> Result<Page, MemPoolStatus>;
    fn release_page(&self, page: Page);
    fn capacity(&self) -> usize;
    fn available(&self) -> usize;
}

/// Pool whose frames are all allocated up front.
pub struct BufferPool {
    frames: Mutex<Vec<Page>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(num_frames: usize) -> Self {
        let frames = (0..num_frames).map(|_| Page::new_empty()).collect();
        Self {
            frames: Mutex::new(frames),
            capacity: num_frames,
        }
    }

    fn frames(&self) -> std::sync::MutexGuard<'_, Vec<Page>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemPool for BufferPool {
    fn create_new_page(&self) -> Result<Page, MemPoolStatus> {
        self.frames().pop().ok_or(MemPoolStatus::CannotEvictPage)
    }

    fn release_page(&self, mut page: Page) {
        page.fill(0);
        let mut frames = self.frames();
        debug_assert!(frames.len() < self.capacity, "frame released twice");
        frames.push(page);
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn available(&self) -> usize {
        self.frames().len()
    }
}

/// Test pool with a handful of frames.
pub fn get_test_bp(num_frames: usize) -> std::sync::Arc<BufferPool> {
    std::sync::Arc::new(BufferPool::new(num_frames))
}
