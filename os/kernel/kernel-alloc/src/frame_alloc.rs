//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame of physical memory, first-fit.
//!
//! The bitmap covers `[0, highest usable byte)` of the boot memory map,
//! clipped to what the direct map can reach (`PHYS_MAP_LIMIT`); frames the
//! kernel cannot address through it are never managed. A set bit means
//! "allocated":
//! - frames that no usable region covers,
//! - reserved / ACPI / bad-RAM frames,
//! - the kernel image window `[0, KERNEL_IMAGE_RESERVED)`,
//! - frames handed out by [`alloc_page`](BitmapFrameAlloc::alloc_page).
//!
//! The allocator keeps a running count of clear bits. Freeing a frame that
//! is not allocated is rejected so that count never drifts.

use alloc::vec;
use alloc::vec::Vec;
use kernel_info::boot::BootMemoryMap;
use kernel_info::memory::{KERNEL_IMAGE_RESERVED, PAGE_SIZE, PHYS_MAP_LIMIT};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;
use log::{info, warn};

const BITS: u32 = u64::BITS;

/// Frames reachable through the direct map.
const MAX_FRAMES: u64 = PHYS_MAP_LIMIT as u64 / PAGE_SIZE as u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("{0} lies outside the managed physical range")]
    OutOfRange(PhysicalAddress),
    #[error("{0} is not page aligned")]
    Unaligned(PhysicalAddress),
    #[error("frame {0} is not allocated")]
    NotAllocated(PhysicalPage<Size4K>),
    #[error("frame {0} is already allocated")]
    AlreadyAllocated(PhysicalPage<Size4K>),
    #[error("requested a run of zero frames")]
    EmptyRun,
}

/// Bitmap over all physical frames.
pub struct BitmapFrameAlloc {
    bitmap: Vec<u64>,
    total: u32,
    free: u32,
}

impl BitmapFrameAlloc {
    /// Build the allocator from the firmware memory map.
    ///
    /// Usable ranges are rounded inward to whole frames. Everything else,
    /// and the kernel image window, starts out allocated.
    #[must_use]
    pub fn from_memory_map(map: BootMemoryMap<'_>) -> Self {
        let total = (map.highest_usable_end() / u64::from(PAGE_SIZE)).min(MAX_FRAMES);
        // `total` fits: the direct map is smaller than 4 GiB.
        let total = u32::try_from(total).unwrap_or(u32::MAX);
        let words = total.div_ceil(BITS) as usize;

        let mut this = Self {
            bitmap: vec![u64::MAX; words],
            total,
            free: 0,
        };

        for region in map.usable() {
            let first = region.base.div_ceil(u64::from(PAGE_SIZE));
            let last = region.end() / u64::from(PAGE_SIZE);
            this.set_range(first, last, false);
        }
        for region in map.iter().filter(|r| !r.is_usable()) {
            let first = region.base / u64::from(PAGE_SIZE);
            let last = region.end().div_ceil(u64::from(PAGE_SIZE));
            this.set_range(first, last, true);
        }
        this.set_range(0, u64::from(KERNEL_IMAGE_RESERVED / PAGE_SIZE), true);

        this.free = this.count_free();
        info!(
            "frame allocator: {} of {} frames free ({} KiB)",
            this.free,
            this.total,
            u64::from(this.free) * u64::from(PAGE_SIZE) / 1024
        );
        this
    }

    /// Number of frames the bitmap covers.
    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> u32 {
        self.free
    }

    /// `true` for allocated frames and for frames outside the managed range.
    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalPage<Size4K>) -> bool {
        frame.index() >= self.total || self.bit(frame.index())
    }

    /// First free frame.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] when every frame is taken.
    pub fn alloc_page(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        if self.free == 0 {
            return Err(FrameAllocError::OutOfMemory);
        }
        let (word, bits) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .ok_or(FrameAllocError::OutOfMemory)?;
        let index = word as u32 * BITS + bits.trailing_ones();
        if index >= self.total {
            return Err(FrameAllocError::OutOfMemory);
        }
        self.set_bit(index, true);
        self.free -= 1;
        Ok(PhysicalPage::from_index(index))
    }

    /// First run of `count` contiguous free frames.
    ///
    /// # Errors
    /// - [`FrameAllocError::EmptyRun`] if `count` is zero.
    /// - [`FrameAllocError::OutOfMemory`] if no run is long enough.
    pub fn alloc_pages(&mut self, count: u32) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::EmptyRun);
        }
        if count > self.free {
            return Err(FrameAllocError::OutOfMemory);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        let mut index = 0;
        while index < self.total {
            // Skip fully allocated words quickly.
            if index.is_multiple_of(BITS) && self.bitmap[(index / BITS) as usize] == u64::MAX {
                run_len = 0;
                index += BITS;
                continue;
            }
            if self.bit(index) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    for i in run_start..run_start + count {
                        self.set_bit(i, true);
                    }
                    self.free -= count;
                    return Ok(PhysicalPage::from_index(run_start));
                }
            }
            index += 1;
        }
        Err(FrameAllocError::OutOfMemory)
    }

    /// Claim a specific frame, e.g. for an MMIO window or an identity mapping.
    ///
    /// # Errors
    /// - [`FrameAllocError::Unaligned`] if `pa` is not frame aligned.
    /// - [`FrameAllocError::OutOfRange`] if the bitmap does not cover `pa`.
    /// - [`FrameAllocError::AlreadyAllocated`] if the frame is taken.
    pub fn alloc_specific(
        &mut self,
        pa: PhysicalAddress,
    ) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(FrameAllocError::Unaligned(pa));
        }
        let frame = pa.page::<Size4K>();
        if frame.index() >= self.total {
            return Err(FrameAllocError::OutOfRange(pa));
        }
        if self.bit(frame.index()) {
            return Err(FrameAllocError::AlreadyAllocated(frame));
        }
        self.set_bit(frame.index(), true);
        self.free -= 1;
        Ok(frame)
    }

    /// Return one frame.
    ///
    /// # Errors
    /// - [`FrameAllocError::OutOfRange`] if the bitmap does not cover it.
    /// - [`FrameAllocError::NotAllocated`] if it is already free.
    pub fn free_page(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), FrameAllocError> {
        if frame.index() >= self.total {
            return Err(FrameAllocError::OutOfRange(frame.base()));
        }
        if !self.bit(frame.index()) {
            return Err(FrameAllocError::NotAllocated(frame));
        }
        self.set_bit(frame.index(), false);
        self.free += 1;
        Ok(())
    }

    /// Return `count` contiguous frames starting at `first`.
    ///
    /// The whole run is checked before anything is released.
    ///
    /// # Errors
    /// As [`free_page`](Self::free_page), for the first offending frame.
    pub fn free_pages(
        &mut self,
        first: PhysicalPage<Size4K>,
        count: u32,
    ) -> Result<(), FrameAllocError> {
        let end = first
            .index()
            .checked_add(count)
            .ok_or(FrameAllocError::OutOfRange(first.base()))?;
        if end > self.total {
            return Err(FrameAllocError::OutOfRange(first.base()));
        }
        if let Some(i) = (first.index()..end).find(|&i| !self.bit(i)) {
            return Err(FrameAllocError::NotAllocated(PhysicalPage::from_index(i)));
        }
        for i in first.index()..end {
            self.set_bit(i, false);
        }
        self.free += count;
        Ok(())
    }

    #[inline]
    fn bit(&self, index: u32) -> bool {
        self.bitmap[(index / BITS) as usize] & (1 << (index % BITS)) != 0
    }

    #[inline]
    fn set_bit(&mut self, index: u32, value: bool) {
        let word = &mut self.bitmap[(index / BITS) as usize];
        if value {
            *word |= 1 << (index % BITS);
        } else {
            *word &= !(1 << (index % BITS));
        }
    }

    /// Set or clear `[first, last)`, clipped to the managed range.
    fn set_range(&mut self, first: u64, last: u64, value: bool) {
        let last = last.min(u64::from(self.total));
        if first >= last {
            return;
        }
        // Both bounds are below `total`, which fits `u32`.
        for index in first as u32..last as u32 {
            self.set_bit(index, value);
        }
    }

    /// Padding bits past `total` stay set, so they never count as free.
    fn count_free(&self) -> u32 {
        self.bitmap.iter().map(|w| w.count_zeros()).sum()
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_page().ok()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        if let Err(e) = self.free_page(frame) {
            warn!("frame allocator: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{BootMemoryRegion, MemoryRegionKind};

    const MIB: u64 = 1024 * 1024;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(u32::try_from(v).unwrap())
    }

    fn allocator(regions: &[BootMemoryRegion]) -> BitmapFrameAlloc {
        BitmapFrameAlloc::from_memory_map(BootMemoryMap::new(regions))
    }

    #[test]
    fn kernel_window_and_reserved_ranges_start_allocated() {
        let a = allocator(&[
            BootMemoryRegion::usable(0, 0x9_F000),
            BootMemoryRegion::usable(MIB, 31 * MIB),
            BootMemoryRegion::new(20 * MIB, MIB, MemoryRegionKind::AcpiNvs),
        ]);
        assert_eq!(a.total_frames(), (32 * MIB / 4096) as u32);
        // 16 MiB..32 MiB usable, minus 1 MiB of ACPI NVS.
        assert_eq!(a.free_count(), (15 * MIB / 4096) as u32);
        assert!(a.is_allocated(PhysicalPage::from_index(0x100)));
        assert!(a.is_allocated(pa(20 * MIB).page()));
        assert!(!a.is_allocated(pa(16 * MIB).page()));
    }

    #[test]
    fn memory_beyond_the_direct_map_is_not_managed() {
        let a = allocator(&[BootMemoryRegion::usable(0, 1024 * MIB)]);
        assert_eq!(a.total_frames(), PHYS_MAP_LIMIT / PAGE_SIZE);
        assert!(a.is_allocated(pa(u64::from(PHYS_MAP_LIMIT)).page()));
        assert!(!a.is_allocated(pa(u64::from(PHYS_MAP_LIMIT) - 4096).page()));
    }

    #[test]
    fn first_fit_returns_lowest_free_frame() {
        let mut a = allocator(&[BootMemoryRegion::usable(0, 32 * MIB)]);
        let first = a.alloc_page().unwrap();
        assert_eq!(first.base(), pa(16 * MIB));
        let second = a.alloc_page().unwrap();
        assert_eq!(second.index(), first.index() + 1);
    }

    #[test]
    fn freed_frame_is_reused_and_never_double_issued() {
        let mut a = allocator(&[BootMemoryRegion::usable(0, 32 * MIB)]);
        let before = a.free_count();
        let f = a.alloc_page().unwrap();
        let g = a.alloc_page().unwrap();
        a.free_page(f).unwrap();
        assert_eq!(a.alloc_page().unwrap(), f);
        assert_ne!(a.alloc_page().unwrap(), g);
        assert_eq!(a.free_count(), before - 3);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut a = allocator(&[BootMemoryRegion::usable(0, 32 * MIB)]);
        let f = a.alloc_page().unwrap();
        a.free_page(f).unwrap();
        let free = a.free_count();
        assert_eq!(a.free_page(f), Err(FrameAllocError::NotAllocated(f)));
        assert_eq!(a.free_count(), free);
    }

    #[test]
    fn contiguous_runs_skip_holes() {
        let mut a = allocator(&[BootMemoryRegion::usable(0, 17 * MIB)]);
        let base = a.alloc_page().unwrap();
        let _hole = a.alloc_page().unwrap();
        a.free_page(base).unwrap();

        // The single free frame at `base` is too short for a run of 4.
        let run = a.alloc_pages(4).unwrap();
        assert_eq!(run.index(), base.index() + 2);
        assert!((0..4).all(|i| a.is_allocated(PhysicalPage::from_index(run.index() + i))));

        a.free_pages(run, 4).unwrap();
        assert_eq!(a.alloc_pages(0), Err(FrameAllocError::EmptyRun));
        assert_eq!(a.alloc_pages(a.free_count() + 1), Err(FrameAllocError::OutOfMemory));
    }

    #[test]
    fn free_pages_checks_the_whole_run_first() {
        let mut a = allocator(&[BootMemoryRegion::usable(0, 17 * MIB)]);
        let run = a.alloc_pages(3).unwrap();
        let tail = PhysicalPage::from_index(run.index() + 2);
        a.free_page(tail).unwrap();
        let free = a.free_count();

        assert_eq!(a.free_pages(run, 3), Err(FrameAllocError::NotAllocated(tail)));
        assert_eq!(a.free_count(), free);
        assert!(a.is_allocated(run));
    }

    #[test]
    fn specific_frames() {
        let mut a = allocator(&[BootMemoryRegion::usable(0, 17 * MIB)]);
        let addr = pa(16 * MIB + 0x3000);
        let frame = a.alloc_specific(addr).unwrap();
        assert_eq!(frame.base(), addr);
        assert_eq!(a.alloc_specific(addr), Err(FrameAllocError::AlreadyAllocated(frame)));
        assert_eq!(
            a.alloc_specific(addr + 1),
            Err(FrameAllocError::Unaligned(addr + 1))
        );
        let far = pa(64 * MIB);
        assert_eq!(a.alloc_specific(far), Err(FrameAllocError::OutOfRange(far)));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut a = allocator(&[BootMemoryRegion::usable(16 * MIB, 2 * 4096)]);
        assert_eq!(a.free_count(), 2);
        a.alloc_page().unwrap();
        a.alloc_page().unwrap();
        assert_eq!(a.alloc_page(), Err(FrameAllocError::OutOfMemory));
        assert_eq!(a.alloc_4k(), None);
    }
}
