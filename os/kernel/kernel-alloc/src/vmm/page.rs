//! Resident pages of VM objects.

use kernel_memory_addresses::{PhysicalPage, Size4K};

/// One physical frame bound to one offset of one object.
///
/// `ref_count` counts the page-table entries that currently map the frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VmPage {
    frame: PhysicalPage<Size4K>,
    offset: u32,
    dirty: bool,
    wired: bool,
    ref_count: u32,
}

impl VmPage {
    #[must_use]
    pub const fn new(frame: PhysicalPage<Size4K>, offset: u32) -> Self {
        Self {
            frame,
            offset,
            dirty: false,
            wired: false,
            ref_count: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        self.frame
    }

    /// Offset of this page within its object.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub const fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[inline]
    #[must_use]
    pub const fn is_wired(&self) -> bool {
        self.wired
    }

    #[inline]
    pub const fn set_wired(&mut self, wired: bool) {
        self.wired = wired;
    }

    /// Number of page-table entries mapping this page.
    #[inline]
    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[inline]
    pub(crate) const fn mapped(&mut self) {
        self.ref_count += 1;
    }

    #[inline]
    pub(crate) const fn unmapped(&mut self) {
        self.ref_count = self.ref_count.saturating_sub(1);
    }
}
