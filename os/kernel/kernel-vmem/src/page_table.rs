//! # Paging Structures
//!
//! 32-bit x86 paging without PAE has two levels:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! - [`pd`]: the page directory, one per address space, referenced by CR3.
//! - [`pt`]: page tables, each mapping 4 MiB in 4 KiB pages.

pub mod pd;
pub mod pt;

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in a directory or table.
pub const ENTRIES: usize = 1024;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (PdIndex, PtIndex) {
    (PdIndex::from(va), PtIndex::from(va))
}
