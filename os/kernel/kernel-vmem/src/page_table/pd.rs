//! # Page Directory (PD)
//!
//! - [`PdIndex`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a PDE, either a pointer to a [`PageTable`](super::pt::PageTable)
//!   or (`PS=1`) a 4 MiB leaf.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs.
//!
//! Directory entries in the kernel half are shared: every user directory
//! links the kernel's page tables and marks those entries
//! [`borrowed`](PageEntryBits::borrowed).

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_info::memory::{KERNEL_SPACE_END, KERNEL_SPLIT};
use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// Decoded view of a present PDE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PdEntryKind {
    /// Points to a page table.
    NextPageTable(PhysicalPage<Size4K>, PageEntryBits),
    /// Maps a 4 MiB page directly (`PS=1`); base is the first 4 KiB frame.
    Leaf4MiB(PhysicalPage<Size4K>, PageEntryBits),
}

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PdIndex {
    /// First directory slot of the kernel half.
    pub const KERNEL_FIRST: Self = Self::from(VirtualAddress::new(KERNEL_SPLIT));
    /// One past the last directory slot the kernel half may use.
    pub const KERNEL_END: Self = Self::from(VirtualAddress::new(KERNEL_SPACE_END));

    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
    }

    /// Debug-asserts `v < 1024`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }

    /// Every slot of a directory.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..1024u16).map(Self::new)
    }

    /// All slots in `[self, end)`.
    pub fn range_to(self, end: Self) -> impl Iterator<Item = Self> {
        (self.0..end.0).map(Self::new)
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn is_borrowed(self) -> bool {
        self.0.borrowed()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// Link a page table. Forces `PS=0`.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_physical_page(table),
        )
    }

    /// Map a 4 MiB page directly (`PS=1`).
    #[inline]
    #[must_use]
    pub const fn make_4m(page: PhysicalPage<Size4M>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(true)
                .with_physical_page(PhysicalPage::from_addr(page.base())),
        )
    }

    /// The same link, marked as owned by another directory.
    #[inline]
    #[must_use]
    pub const fn borrowed(self) -> Self {
        Self(self.0.with_borrowed(true))
    }

    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.is_present() {
            return None;
        }
        let page = self.0.physical_page();
        if self.0.large_page() {
            Some(PdEntryKind::Leaf4MiB(page, self.0))
        } else {
            Some(PdEntryKind::NextPageTable(page, self.0))
        }
    }

    /// The linked page table, if this entry is a present non-leaf.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            Some(PdEntryKind::NextPageTable(page, _)) => Some(page),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    /// Two entries link the same table with the same permissions (ignoring
    /// the borrowed marker and the CPU-managed accessed bit).
    #[inline]
    #[must_use]
    pub const fn links_same_table(self, other: Self) -> bool {
        let mask = !(PageEntryBits::new()
            .with_borrowed(true)
            .with_accessed(true)
            .into_bits());
        self.raw() & mask == other.raw() & mask
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }
}
