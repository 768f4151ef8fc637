use std::sync::atomic::{AtomicU8, Ordering};

use crate::PAGE_SIZE;

/// Host storage backing one guest page.
///
/// Frames are shared between address spaces (copy-on-write forks, `SHARED` mappings) and between
/// TLBs of concurrently running execution contexts, so every byte is an atomic accessed with
/// relaxed ordering. Guest-level ordering between threads is the guest's own business, exactly as
/// on hardware without explicit fences.
pub struct PageFrame {
    bytes: Box<[AtomicU8]>,
}

impl PageFrame {
    pub fn zeroed() -> Self {
        Self {
            bytes: (0..PAGE_SIZE).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Build a frame from `data`, zero-padding it to a full page.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() <= PAGE_SIZE as usize, "frame larger than a page");
        let frame = Self::zeroed();
        frame.write(0, data);
        frame
    }

    /// Private copy of this frame's current contents.
    pub fn duplicate(&self) -> Self {
        Self {
            bytes: self
                .bytes
                .iter()
                .map(|b| AtomicU8::new(b.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    #[inline]
    pub fn load(&self, offset: u32) -> u8 {
        self.bytes[offset as usize].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, offset: u32, value: u8) {
        self.bytes[offset as usize].store(value, Ordering::Relaxed);
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    ///
    /// Panics if the range leaves the page; callers split cross-page accesses first.
    pub fn read(&self, offset: u32, out: &mut [u8]) {
        let start = offset as usize;
        let len = out.len();
        for (dst, src) in out.iter_mut().zip(&self.bytes[start..start + len]) {
            *dst = src.load(Ordering::Relaxed);
        }
    }

    pub fn write(&self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        for (dst, src) in self.bytes[start..start + data.len()].iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
