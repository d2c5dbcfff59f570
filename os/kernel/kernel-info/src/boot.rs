//! # Kernel Boot Information
//!
//! The firmware memory map as delivered by the boot loader.

/// Type of a firmware memory-map entry. Values follow the multiboot
/// numbering; anything unknown is treated as reserved.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// RAM available to the kernel.
    Usable = 1,
    /// Reserved by firmware or hardware.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    BadMemory = 5,
}

impl MemoryRegionKind {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Reserved,
        }
    }
}

/// One entry of the boot memory map.
///
/// Base and length are 64-bit because firmware reports memory above 4 GiB;
/// the kernel clips everything to the 32-bit physical space.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootMemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl BootMemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Reserved)
    }

    /// End of the region (exclusive), saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// Borrowed view of the boot memory map.
#[derive(Debug, Copy, Clone)]
pub struct BootMemoryMap<'a> {
    regions: &'a [BootMemoryRegion],
}

impl<'a> BootMemoryMap<'a> {
    #[must_use]
    pub const fn new(regions: &'a [BootMemoryRegion]) -> Self {
        Self { regions }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a BootMemoryRegion> + 'a {
        self.regions.iter()
    }

    pub fn usable(&self) -> impl Iterator<Item = &'a BootMemoryRegion> + 'a {
        self.regions.iter().filter(|r| r.is_usable())
    }

    /// Highest end address of any usable region, or 0 if there is none.
    #[must_use]
    pub fn highest_usable_end(&self) -> u64 {
        self.usable().map(BootMemoryRegion::end).max().unwrap_or(0)
    }

    /// Total bytes reported as usable (overlaps counted twice).
    #[must_use]
    pub fn total_usable(&self) -> u64 {
        self.usable().map(|r| r.length).sum()
    }
}

impl<'a> From<&'a [BootMemoryRegion]> for BootMemoryMap<'a> {
    fn from(regions: &'a [BootMemoryRegion]) -> Self {
        Self::new(regions)
    }
}
