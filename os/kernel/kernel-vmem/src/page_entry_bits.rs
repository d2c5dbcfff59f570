use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// Page-directory entries (PDEs) and page-table entries (PTEs) share this
/// layout; the only level-specific bit is bit 7 (`PS` in a PDE, `PAT` in a
/// PTE).
///
/// ### Bit layout
///
/// | Bits   | Name   | Meaning |
/// |--------|--------|---------|
/// | 0      | `P`    | Present |
/// | 1      | `RW`   | Writable |
/// | 2      | `US`   | User-mode accessible |
/// | 3      | `PWT`  | Write-through caching |
/// | 4      | `PCD`  | Cache disable |
/// | 5      | `A`    | Accessed |
/// | 6      | `D`    | Dirty (leaf only) |
/// | 7      | `PS`   | 4 MiB page (PDE) / PAT (PTE) |
/// | 8      | `G`    | Global (leaf only) |
/// | 9      | avail  | Borrowed: directory entry linked from the kernel directory |
/// | 10–11  | avail  | Free for OS use |
/// | 12–31  | `addr` | Physical frame number |
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// # use kernel_vmem::PageEntryBits;
/// let frame = PhysicalPage::<Size4K>::from_index(0x1234);
/// let e = PageEntryBits::user_rw().with_physical_page(frame);
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.physical_page(), frame);
/// assert_eq!(e.into_bits(), 0x0123_4007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Read-only when clear; with CR0.WP set this binds
    /// the kernel as well.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4). Used for device mappings.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE: the entry maps a 4 MiB page directly.
    pub large_page: bool,

    /// Global (G, bit 8). Survives CR3 reloads when CR4.PGE is set.
    pub global_translation: bool,

    /// OS-available bit 9: this directory entry was copied from the kernel
    /// directory and the table it points to is not owned by this pmap.
    pub borrowed: bool,

    /// OS-available bits 10–11.
    #[bits(2)]
    pub os_available: u8,

    /// Physical frame number (bits 12–31).
    #[bits(20)]
    frame_4k: u32,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.frame_4k())
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_page(self, page: PhysicalPage<Size4K>) -> Self {
        self.with_frame_4k(page.index())
    }

    /// Present, writable, supervisor only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, read-only, supervisor only.
    #[inline]
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// Present, writable, user accessible.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    /// Present, read-only, user accessible.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }

    /// Copy the permission bits (`RW`, `US`, `PWT`, `PCD`, `G`) of `other`
    /// into `self`, keeping frame, accessed and dirty.
    #[inline]
    #[must_use]
    pub const fn with_permissions_of(self, other: Self) -> Self {
        self.with_writable(other.writable())
            .with_user_access(other.user_access())
            .with_write_through(other.write_through())
            .with_cache_disabled(other.cache_disabled())
            .with_global_translation(other.global_translation())
    }
}
