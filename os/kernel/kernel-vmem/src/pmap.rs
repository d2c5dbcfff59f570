//! # Pmap (2-level x86 page tables)
//!
//! A [`Pmap`] owns one page directory and the page tables hanging off its
//! user half. It is the only code that writes paging structures.
//!
//! ## Ownership of tables
//!
//! - The kernel pmap owns every table it links.
//! - A user pmap links the kernel's tables for `[KERNEL_SPLIT, KERNEL_SPACE_END)`
//!   and marks those directory entries [`borrowed`](crate::PageEntryBits::borrowed).
//!   It never edits through them and never frees them.
//! - [`Pmap::destroy`] frees owned tables and the directory, never leaf frames.
//!
//! ## Activation
//!
//! [`enter`](Pmap::enter), [`remove`](Pmap::remove) and
//! [`protect`](Pmap::protect) make a user pmap active on the given CPU for
//! the duration of the edit (see [`ActivePmap`](crate::mmu::ActivePmap)) and
//! invalidate each touched page there. Kernel pmaps are edited in place.

use crate::mmu::{ActivePmap, Mmu};
use crate::page_table::pd::{PdEntry, PdEntryKind, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::split_indices;
use crate::{FrameAlloc, PageEntryBits, PhysMapper};
use kernel_info::memory::KERNEL_SPLIT;
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress, VirtualPage, VirtualPageRange,
};
use log::trace;

/// Whether a pmap is the shared kernel directory or a per-process one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PmapKind {
    Kernel,
    User,
}

/// Handle to one page directory.
#[derive(Debug, Eq, PartialEq)]
pub struct Pmap {
    root: PhysicalPage<Size4K>,
    kind: PmapKind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmapError {
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
    #[error("{0:?} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0:?} lies in the kernel half and cannot be edited through a user pmap")]
    KernelRange(VirtualAddress),
}

impl Pmap {
    /// Allocate an empty kernel directory.
    ///
    /// The directory maps nothing yet. Edits through it never load it, but
    /// it must not be [activated](Self::activate) before it maps the
    /// running kernel.
    ///
    /// # Errors
    /// [`PmapError::OutOfMemory`] if no frame is left for the directory.
    pub fn create_kernel<M: PhysMapper, A: FrameAlloc + ?Sized>(
        mapper: &M,
        alloc: &mut A,
    ) -> Result<Self, PmapError> {
        let root = alloc.alloc_4k().ok_or(PmapError::OutOfMemory)?;
        mapper.directory_mut(root).zero();
        trace!("pmap: kernel directory at {root}");
        Ok(Self {
            root,
            kind: PmapKind::Kernel,
        })
    }

    /// Allocate a user directory linking the kernel half of `kernel`.
    ///
    /// # Errors
    /// [`PmapError::OutOfMemory`] if no frame is left for the directory.
    pub fn create_user<M: PhysMapper, A: FrameAlloc + ?Sized>(
        mapper: &M,
        alloc: &mut A,
        kernel: &Self,
    ) -> Result<Self, PmapError> {
        let root = alloc.alloc_4k().ok_or(PmapError::OutOfMemory)?;
        let dir = mapper.directory_mut(root);
        dir.zero();

        let kdir = mapper.directory_mut(kernel.root);
        for i in PdIndex::KERNEL_FIRST.range_to(PdIndex::KERNEL_END) {
            let e = kdir.get(i);
            if e.is_present() {
                dir.set(i, e.borrowed());
            }
        }

        trace!("pmap: user directory at {root}");
        Ok(Self {
            root,
            kind: PmapKind::User,
        })
    }

    /// Wrap an existing directory, e.g. the one the boot code built.
    ///
    /// # Safety
    /// `root` must be a valid page directory that maps the kernel, and no
    /// other `Pmap` may own it.
    #[must_use]
    pub const unsafe fn from_root(root: PhysicalPage<Size4K>, kind: PmapKind) -> Self {
        Self { root, kind }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> PmapKind {
        self.kind
    }

    /// Install `page -> frame` with the given leaf flags.
    ///
    /// Allocates the covering page table on demand.
    ///
    /// # Errors
    /// - [`PmapError::AlreadyMapped`] if a leaf for `page` is already present.
    /// - [`PmapError::OutOfMemory`] if a page table was needed and none could
    ///   be allocated.
    /// - [`PmapError::KernelRange`] for kernel addresses in a user pmap.
    pub fn enter<M, A, C>(
        &self,
        mapper: &M,
        alloc: &mut A,
        mmu: &mut C,
        page: VirtualPage<Size4K>,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), PmapError>
    where
        M: PhysMapper,
        A: FrameAlloc + ?Sized,
        C: Mmu + ?Sized,
    {
        self.check_editable(page.base())?;
        let mut active = ActivePmap::new(mmu, self);

        let table = self.ensure_table(mapper, alloc, page.base())?;
        let (_, pti) = split_indices(page.base());
        if table.get(pti).is_present() {
            return Err(PmapError::AlreadyMapped(page.base()));
        }

        table.set(pti, PtEntry::make_4k(frame, flags));
        active.invalidate(page);
        trace!("pmap {}: enter {page} -> {frame}", self.root);
        Ok(())
    }

    /// Clear every present leaf in `[start, end)`. Page tables stay.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    /// [`PmapError::KernelRange`] for kernel addresses in a user pmap.
    pub fn remove<M, C>(
        &self,
        mapper: &M,
        mmu: &mut C,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<usize, PmapError>
    where
        M: PhysMapper,
        C: Mmu + ?Sized,
    {
        self.check_editable_range(start, end)?;
        let mut active = ActivePmap::new(mmu, self);
        let dir = mapper.directory_mut(self.root);

        let mut removed = 0;
        for page in VirtualPageRange::<Size4K>::new(start.page(), end) {
            let (pdi, pti) = split_indices(page.base());
            let Some(table) = dir.get(pdi).next_table() else {
                continue;
            };
            let pt = mapper.table_mut(table);
            if pt.get(pti).is_present() {
                pt.set(pti, PtEntry::zero());
                active.invalidate(page);
                removed += 1;
            }
        }

        trace!("pmap {}: removed {removed} entries in {start}..{end}", self.root);
        Ok(removed)
    }

    /// Rewrite the permission bits of every present leaf in `[start, end)`.
    ///
    /// Returns the number of entries changed.
    ///
    /// # Errors
    /// [`PmapError::KernelRange`] for kernel addresses in a user pmap.
    pub fn protect<M, C>(
        &self,
        mapper: &M,
        mmu: &mut C,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: PageEntryBits,
    ) -> Result<usize, PmapError>
    where
        M: PhysMapper,
        C: Mmu + ?Sized,
    {
        self.check_editable_range(start, end)?;
        let mut active = ActivePmap::new(mmu, self);
        let dir = mapper.directory_mut(self.root);

        let mut changed = 0;
        for page in VirtualPageRange::<Size4K>::new(start.page(), end) {
            let (pdi, pti) = split_indices(page.base());
            let Some(table) = dir.get(pdi).next_table() else {
                continue;
            };
            let pt = mapper.table_mut(table);
            let e = pt.get(pti);
            if e.is_present() {
                pt.set(pti, e.with_permissions(flags));
                active.invalidate(page);
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Translate `va`, honoring 4 MiB directory leaves.
    #[must_use]
    pub fn extract<M: PhysMapper>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let (pdi, pti) = split_indices(va);
        match mapper.directory_mut(self.root).get(pdi).kind()? {
            PdEntryKind::Leaf4MiB(base, _) => Some(base.base() + va.offset::<Size4M>().as_u32()),
            PdEntryKind::NextPageTable(table, _) => {
                let (frame, _) = mapper.table_mut(table).get(pti).page_4k()?;
                Some(frame.join(va.offset::<Size4K>()))
            }
        }
    }

    /// The 4 KiB leaf mapping `va`, if any.
    #[must_use]
    pub fn entry<M: PhysMapper>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        let (pdi, pti) = split_indices(va);
        let table = mapper.directory_mut(self.root).get(pdi).next_table()?;
        mapper.table_mut(table).get(pti).page_4k()
    }

    /// Load this pmap's root on `mmu`.
    ///
    /// # Safety
    /// The directory must map the running kernel (see [`Mmu::load_root`]).
    /// A user pmap does so once its kernel pmap does.
    pub unsafe fn activate<C: Mmu + ?Sized>(&self, mmu: &mut C) {
        if mmu.active_root() != self.root {
            unsafe { mmu.load_root(self.root) };
        }
    }

    /// Link a kernel directory entry that `kernel` gained after this pmap
    /// was created. Returns `true` if the entry changed.
    pub fn sync_kernel_entry<M: PhysMapper>(
        &self,
        mapper: &M,
        kernel: &Self,
        va: VirtualAddress,
    ) -> bool {
        if self.kind == PmapKind::Kernel || va.as_u32() < KERNEL_SPLIT {
            return false;
        }
        let pdi = PdIndex::from(va);
        let theirs = mapper.directory_mut(kernel.root).get(pdi);
        if !theirs.is_present() {
            return false;
        }
        let dir = mapper.directory_mut(self.root);
        if dir.get(pdi).links_same_table(theirs) {
            return false;
        }
        dir.set(pdi, theirs.borrowed());
        true
    }

    /// Number of page tables owned (not borrowed) by this pmap.
    #[must_use]
    pub fn owned_tables<M: PhysMapper>(&self, mapper: &M) -> usize {
        let dir = mapper.directory_mut(self.root);
        PdIndex::all()
            .filter(|&i| !dir.get(i).is_borrowed() && dir.get(i).next_table().is_some())
            .count()
    }

    /// Free every owned page table, then the directory itself.
    ///
    /// Leaf frames are left alone; they belong to VM objects. Returns the
    /// number of frames released.
    pub fn destroy<M: PhysMapper, A: FrameAlloc + ?Sized>(
        self,
        mapper: &M,
        alloc: &mut A,
    ) -> usize {
        let dir = mapper.directory_mut(self.root);
        let mut freed = 0;
        for i in PdIndex::all() {
            let e = dir.get(i);
            if e.is_borrowed() {
                continue;
            }
            if let Some(table) = e.next_table() {
                alloc.free_4k(table);
                freed += 1;
            }
            dir.set(i, PdEntry::zero());
        }
        alloc.free_4k(self.root);
        trace!("pmap {}: destroyed, {} frames released", self.root, freed + 1);
        freed + 1
    }

    fn ensure_table<'a, M, A>(
        &self,
        mapper: &'a M,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<&'a mut PageTable, PmapError>
    where
        M: PhysMapper,
        A: FrameAlloc + ?Sized,
    {
        let dir = mapper.directory_mut(self.root);
        let pdi = PdIndex::from(va);
        match dir.get(pdi).kind() {
            Some(PdEntryKind::NextPageTable(table, _)) => Ok(mapper.table_mut(table)),
            Some(PdEntryKind::Leaf4MiB(..)) => Err(PmapError::AlreadyMapped(va)),
            None => {
                let frame = alloc.alloc_4k().ok_or(PmapError::OutOfMemory)?;
                let table = mapper.table_mut(frame);
                table.zero();

                // Directory entries stay permissive; leaves carry the real rights.
                let flags = if va.as_u32() < KERNEL_SPLIT {
                    PageEntryBits::user_rw()
                } else {
                    PageEntryBits::kernel_rw()
                };
                dir.set(pdi, PdEntry::make_table(frame, flags));
                trace!("pmap {}: new page table {frame} for slot {}", self.root, pdi.as_usize());
                Ok(table)
            }
        }
    }

    const fn check_editable(&self, va: VirtualAddress) -> Result<(), PmapError> {
        if matches!(self.kind, PmapKind::User) && va.as_u32() >= KERNEL_SPLIT {
            Err(PmapError::KernelRange(va))
        } else {
            Ok(())
        }
    }

    const fn check_editable_range(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), PmapError> {
        if matches!(self.kind, PmapKind::User) && end.as_u32() > KERNEL_SPLIT {
            Err(PmapError::KernelRange(start))
        } else {
            Ok(())
        }
    }
}
