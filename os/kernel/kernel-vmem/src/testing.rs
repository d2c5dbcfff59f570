//! Host-side stand-ins for physical memory, a frame source and a CPU.
//!
//! Only built for tests or with the `testing` feature, so dependent crates
//! can drive real page-table walks in their own test suites.

use crate::mmu::Mmu;
use crate::{FrameAlloc, PhysMapper};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// Simulated physical RAM covering `[base, base + frames * 4096)`.
///
/// Physical addresses below `base` do not exist here. That lets tests hand
/// out frames above the kernel reservation without backing the low
/// megabytes with host memory.
pub struct TestPhys {
    base: PhysicalAddress,
    frames: Vec<UnsafeCell<Frame>>,
}

impl TestPhys {
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        assert!(base.is_aligned::<Size4K>());
        let frames = (0..frames)
            .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
            .collect();
        Self { base, frames }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// One past the last simulated byte.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.base + (self.frames.len() as u32) * PAGE_SIZE
    }

    fn byte_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(
            pa >= self.base && pa < self.end(),
            "{pa} is outside the simulated RAM"
        );
        let rel = (pa - self.base) as usize;
        let (idx, off) = (rel / PAGE_SIZE as usize, rel % PAGE_SIZE as usize);
        // Safety: `off` stays inside the frame.
        unsafe { self.frames[idx].get().cast::<u8>().add(off) }
    }

    /// Copy `len` bytes starting at `pa`. Must not cross a frame.
    #[must_use]
    pub fn read(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let ptr = self.byte_ptr(pa);
        // Safety: tests are single-threaded over one `TestPhys`.
        unsafe { core::slice::from_raw_parts(ptr, len) }.to_vec()
    }

    /// Write `bytes` at `pa`. Must not cross a frame.
    pub fn write(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let ptr = self.byte_ptr(pa);
        // Safety: see `read`.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u32() as usize % align_of::<T>() == 0);
        // Safety: the caller promises `T` matches the bytes at `pa`.
        unsafe { &mut *self.byte_ptr(pa).cast::<T>() }
    }
}

/// Hands out consecutive frames and never reuses them.
///
/// Freed frames are recorded so tests can check what a teardown released.
pub struct BumpAlloc {
    next: u32,
    end: u32,
    live: usize,
    freed: Vec<PhysicalPage<Size4K>>,
}

impl BumpAlloc {
    /// Frames from `start` on, `count` of them.
    #[must_use]
    pub fn new(start: PhysicalAddress, count: u32) -> Self {
        let next = start.page::<Size4K>().index();
        Self {
            next,
            end: next + count,
            live: 0,
            freed: Vec::new(),
        }
    }

    /// Frames handed out and not yet returned.
    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn freed(&self) -> &[PhysicalPage<Size4K>] {
        &self.freed
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next >= self.end {
            return None;
        }
        let frame = PhysicalPage::from_index(self.next);
        self.next += 1;
        self.live += 1;
        Some(frame)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.live -= 1;
        self.freed.push(frame);
    }
}

/// A CPU that records what it was asked to do.
pub struct RecordingMmu {
    root: PhysicalPage<Size4K>,
    loads: Vec<PhysicalPage<Size4K>>,
    invalidations: Vec<VirtualPage<Size4K>>,
}

impl RecordingMmu {
    #[must_use]
    pub const fn new(root: PhysicalPage<Size4K>) -> Self {
        Self {
            root,
            loads: Vec::new(),
            invalidations: Vec::new(),
        }
    }

    /// Every root loaded, in order.
    #[must_use]
    pub fn loads(&self) -> &[PhysicalPage<Size4K>] {
        &self.loads
    }

    #[must_use]
    pub fn invalidations(&self) -> &[VirtualPage<Size4K>] {
        &self.invalidations
    }

    pub fn clear(&mut self) {
        self.loads.clear();
        self.invalidations.clear();
    }
}

impl Mmu for RecordingMmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>) {
        self.root = root;
        self.loads.push(root);
    }

    fn invalidate_page(&mut self, page: VirtualPage<Size4K>) {
        self.invalidations.push(page);
    }
}
