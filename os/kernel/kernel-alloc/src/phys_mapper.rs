//! # Direct-map PhysMapper for Kernel Virtual Memory
//!
//! The kernel half maps physical memory linearly: physical address `pa` is
//! visible at `PHYS_MAP_BASE + pa` for every `pa < PHYS_MAP_LIMIT`. Page
//! tables, page directories and page contents are all reached through that
//! window.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::{DirectMapPhysMapper, PhysMapperExt};
//! use kernel_memory_addresses::PhysicalPage;
//!
//! let mapper = DirectMapPhysMapper;
//! mapper.zero_frame(PhysicalPage::from_index(0x1234));
//! ```

use kernel_info::memory::{PAGE_SIZE, PHYS_MAP_BASE, PHYS_MAP_LIMIT};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the kernel's direct map.
///
/// # Safety
/// - The direct map must be present in the active page directory.
/// - Only physical memory below `PHYS_MAP_LIMIT` is reachable.
#[derive(Debug, Copy, Clone, Default)]
pub struct DirectMapPhysMapper;

impl PhysMapper for DirectMapPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u32() < PHYS_MAP_LIMIT);
        let va = (PHYS_MAP_BASE + pa.as_u32()) as usize as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and covered by the direct map.
        unsafe { &mut *va }
    }
}

type FrameBytes = [u8; PAGE_SIZE as usize];

/// Whole-frame helpers for any [`PhysMapper`].
pub trait PhysMapperExt: PhysMapper {
    /// Fill `frame` with zeros.
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        // Safety: every frame is a valid byte array.
        let bytes = unsafe { self.phys_to_mut::<FrameBytes>(frame.base()) };
        bytes.fill(0);
    }

    /// Copy the contents of `src` into `dst`.
    fn copy_frame(&self, src: PhysicalPage<Size4K>, dst: PhysicalPage<Size4K>) {
        if src == dst {
            return;
        }
        // Safety: distinct frames never alias.
        let (from, to) = unsafe {
            (
                self.phys_to_mut::<FrameBytes>(src.base()),
                self.phys_to_mut::<FrameBytes>(dst.base()),
            )
        };
        to.copy_from_slice(from);
    }
}

impl<M: PhysMapper + ?Sized> PhysMapperExt for M {}
