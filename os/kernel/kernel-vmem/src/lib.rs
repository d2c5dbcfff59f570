//! # Virtual Memory Support
//!
//! 32-bit x86 paging (no PAE) for the kernel's virtual memory manager.
//!
//! ## What you get
//! - [`PageEntryBits`]: the raw bit layout shared by directory and table entries.
//! - A 4 KiB-aligned [`PageDirectory`] and [`PageTable`] with index helpers.
//! - [`Pmap`]: one address space's paging structures, with `enter`, `remove`,
//!   `protect`, `extract` and teardown.
//! - [`Mmu`]: the per-CPU translation context (CR3, TLB) every edit goes through.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  PD  →  PT  →  Physical Page
//!   │      │
//!   │      └───► PTE (Page Table Entry)     → maps 4 KiB page
//!   └──────────► PDE (Page Directory Entry) → PS=1 → 4 MiB page
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | One per address space, referenced by `CR3`. Each entry points to a PT, or maps 4 MiB directly if `PS=1`. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical page (always a leaf). |
//!
//! Both levels hold 1024 entries of 4 bytes, so one table covers 4 MiB and a
//! directory covers the full 4 GiB.
//!
//! ## Kernel half
//!
//! Addresses at or above [`KERNEL_SPLIT`](info::KERNEL_SPLIT) belong to the
//! kernel and look the same in every address space: user directories link
//! the kernel's page tables instead of owning copies.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod mmu;
mod page_entry_bits;
pub mod page_table;
mod pmap;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

extern crate alloc;

pub use crate::mmu::{ActivePmap, Mmu};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::PageDirectory;
pub use crate::page_table::pt::PageTable;
pub use crate::pmap::{Pmap, PmapError, PmapKind};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

#[cfg(all(target_arch = "x86", feature = "asm"))]
pub use crate::mmu::X86Mmu;

/// Source of **physical** 4 KiB frames for page tables and page contents.
///
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (e.g. via the kernel's direct map).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be reachable and writable through this mapper.
    /// - The bytes at `pa` must be a valid `T`, and nothing else may access
    ///   them for `'a`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// The page directory stored in `frame`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn directory_mut(&self, frame: PhysicalPage<Size4K>) -> &mut PageDirectory {
        // Safety: directories are only ever reached through their pmap.
        unsafe { self.phys_to_mut::<PageDirectory>(frame.base()) }
    }

    /// The page table stored in `frame`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        // Safety: tables are only ever reached through their directory.
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }
}
