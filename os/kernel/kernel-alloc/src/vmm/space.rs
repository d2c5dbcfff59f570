//! # Address Spaces
//!
//! A [`VmSpace`] pairs a [`RegionList`] with the [`Pmap`] that caches its
//! translations. The kernel space lives inside [`Vm`]; user spaces are owned
//! by their callers and handed back to [`Vm::destroy_space`].

use crate::phys_mapper::PhysMapperExt;
use crate::vmm::object::ObjectKind;
use crate::vmm::region::{ForkKind, RegionList, VmProt, VmRegion};
use crate::vmm::{SpaceRef, Vm, VmCore, VmError};
use alloc::vec::Vec;
use core::ops::Range;
use kernel_info::memory::{KERNEL_SPACE_END, KERNEL_SPLIT, USERSPACE_START};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, Size4K, VirtualAddress, VirtualPageRange,
};
use kernel_vmem::{Mmu, PhysMapper, Pmap, PmapKind};
use log::{debug, warn};

/// One virtual address space.
#[derive(Debug)]
pub struct VmSpace {
    regions: RegionList,
    pmap: Pmap,
}

impl VmSpace {
    pub(crate) const fn new(pmap: Pmap) -> Self {
        Self {
            regions: RegionList::new(),
            pmap,
        }
    }

    #[must_use]
    pub const fn regions(&self) -> &RegionList {
        &self.regions
    }

    #[must_use]
    pub const fn pmap(&self) -> &Pmap {
        &self.pmap
    }

    #[must_use]
    pub const fn kind(&self) -> PmapKind {
        self.pmap.kind()
    }

    /// The addresses regions of this space may occupy.
    #[must_use]
    pub const fn window(&self) -> Range<VirtualAddress> {
        match self.pmap.kind() {
            PmapKind::Kernel => {
                VirtualAddress::new(KERNEL_SPLIT)..VirtualAddress::new(KERNEL_SPACE_END)
            }
            PmapKind::User => {
                VirtualAddress::new(USERSPACE_START)..VirtualAddress::new(KERNEL_SPLIT)
            }
        }
    }

    /// The region containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&VmRegion> {
        self.regions.find(va)
    }

    pub(crate) const fn regions_mut(&mut self) -> &mut RegionList {
        &mut self.regions
    }

    fn into_parts(self) -> (RegionList, Pmap) {
        (self.regions, self.pmap)
    }
}

impl<M: PhysMapper> VmCore<'_, M> {
    /// Drop the page reference held by every present entry in `[start, end)`.
    ///
    /// The entries themselves stay; see [`unmap_pages`](Self::unmap_pages).
    pub(crate) fn unref_pages(
        &mut self,
        space: &VmSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        for region in space.regions.iter() {
            let from = region.base().max(start);
            let to = region.end().min(end);
            if from >= to {
                continue;
            }
            for page in VirtualPageRange::<Size4K>::new(from.page(), to) {
                let va = page.base();
                if let Some((frame, _)) = space.pmap.entry(self.mapper, va) {
                    let offset = region.object_offset(va);
                    self.unref_frame(region.object(), offset, frame);
                }
            }
        }
    }

    /// Remove every translation in `[start, end)` and drop the page
    /// references they held. Returns the number of entries removed.
    pub(crate) fn unmap_pages<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: &VmSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<usize, VmError> {
        self.unref_pages(space, start, end);
        let spans: Vec<_> = space
            .regions
            .iter()
            .map(|r| (r.base().max(start), r.end().min(end)))
            .filter(|(from, to)| from < to)
            .collect();
        let mut removed = 0;
        for (from, to) in spans {
            removed += space.pmap.remove(self.mapper, mmu, from, to)?;
        }
        Ok(removed)
    }

    pub(crate) fn fork_space<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        parent: &mut VmSpace,
        kernel: &Pmap,
    ) -> Result<VmSpace, VmError> {
        let pmap = Pmap::create_user(self.mapper, &mut *self.frames.lock(), kernel)?;
        let mut child = VmSpace::new(pmap);

        if let Err(e) = self.fork_regions(mmu, parent, &mut child) {
            warn!("vm: fork failed: {e}");
            self.destroy_space(mmu, child, kernel);
            return Err(e);
        }
        debug!(
            "vm: forked {} regions into pmap {}",
            child.regions.len(),
            child.pmap.root()
        );
        Ok(child)
    }

    fn fork_regions<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        parent: &mut VmSpace,
        child: &mut VmSpace,
    ) -> Result<(), VmError> {
        for base in parent.regions.bases() {
            if parent
                .regions
                .find(base)
                .is_some_and(|r| r.copies_on_fork(&self.objects))
            {
                self.fork_wired(mmu, parent, base, child)?;
                continue;
            }
            let Some(region) = parent.regions.get_mut(base) else {
                continue;
            };
            let (copy, kind) = region.fork(&mut self.objects, &mut *self.frames.lock())?;
            if kind == ForkKind::CopyOnWrite {
                let read_only = region.entry_bits(false);
                let (from, to) = (region.base(), region.end());
                parent.pmap.protect(self.mapper, mmu, from, to, read_only)?;
            }
            child
                .regions
                .insert(copy, &mut self.objects, &mut *self.frames.lock())?;
        }
        Ok(())
    }

    /// Give `child` its own wired copy of the parent region at `base`.
    fn fork_wired<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        parent: &VmSpace,
        base: VirtualAddress,
        child: &mut VmSpace,
    ) -> Result<(), VmError> {
        let Some(region) = parent.regions.find(base) else {
            return Ok(());
        };
        let (end, source, offset) = (region.end(), region.object(), region.offset());
        let object = self.objects.create(ObjectKind::Anonymous, end - base)?;
        let copy = VmRegion::new(base, end, object, 0, region.prot(), region.flags());
        child
            .regions
            .insert(copy, &mut self.objects, &mut *self.frames.lock())?;

        let mut va = base;
        while va < end {
            let frame = self.fault_in(mmu, child, va, VmProt::WRITE)?;
            if let Some(hit) = self.objects.lookup_chain(source, offset + (va - base)) {
                self.mapper.copy_frame(hit.frame, frame);
            }
            va += Size4K::SIZE;
        }
        debug!("vm: copied wired region {base}..{end} into the child");
        Ok(())
    }

    /// Tear down a user space. Never fails; inconsistencies are logged.
    pub(crate) fn destroy_space<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: VmSpace,
        kernel: &Pmap,
    ) -> usize {
        if mmu.active_root() == space.pmap.root() {
            // Safety: the manager's kernel pmap maps the running kernel.
            unsafe { kernel.activate(mmu) };
        }

        self.unref_pages(&space, VirtualAddress::zero(), VirtualAddress::new(KERNEL_SPLIT));
        let (mut regions, pmap) = space.into_parts();
        let mut released = 0;
        for region in regions.drain() {
            let base = region.base();
            if let Err(e) = region.release(&mut self.objects, &mut *self.frames.lock()) {
                warn!("vm: releasing region at {base}: {e}");
            }
            released += 1;
        }

        let root = pmap.root();
        let tables = pmap.destroy(self.mapper, &mut *self.frames.lock());
        debug!("vm: destroyed space {root}: {released} regions, {tables} paging frames");
        released
    }
}

impl<M: PhysMapper> Vm<'_, M> {
    /// Create an empty user space sharing the kernel half.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no frame is left for the page directory.
    pub fn create_space(&mut self) -> Result<VmSpace, VmError> {
        let core = &self.core;
        let pmap = Pmap::create_user(core.mapper, &mut *core.frames.lock(), self.kernel.pmap())?;
        debug!("vm: created space {}", pmap.root());
        Ok(VmSpace::new(pmap))
    }

    /// Duplicate `parent` for a new process.
    ///
    /// Shared and read-only regions are shared; private writable regions
    /// become copy-on-write on both sides, and the parent's existing
    /// translations for them are write-protected. Nothing is copied yet.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] for exhausted frames or object slots.
    /// - [`VmError::InvalidArgument`] if `parent` is not a user space.
    ///
    /// A failed fork leaves no child behind.
    pub fn fork_space<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        parent: &mut VmSpace,
    ) -> Result<VmSpace, VmError> {
        if parent.kind() != PmapKind::User {
            return Err(VmError::InvalidArgument);
        }
        self.core.fork_space(mmu, parent, self.kernel.pmap())
    }

    /// Release every region of `space`, then its page tables and directory.
    ///
    /// If `space` is active on `mmu`, the kernel space is activated first.
    /// Returns the number of regions released.
    pub fn destroy_space<C: Mmu + ?Sized>(&mut self, mmu: &mut C, space: VmSpace) -> usize {
        self.core.destroy_space(mmu, space, self.kernel.pmap())
    }

    /// Make `space` the active translation on `mmu`.
    pub fn activate<C: Mmu + ?Sized>(&mut self, mmu: &mut C, space: SpaceRef<'_>) {
        let (_, space) = self.parts(space);
        // Safety: the kernel pmap maps the running kernel (through the direct
        // map, or by the contract of `with_kernel_pmap`), and user pmaps link
        // its kernel half.
        unsafe { space.pmap().activate(mmu) };
    }

    /// Physical address `va` translates to in `space`.
    ///
    /// Kernel addresses in a user space are answered by the kernel pmap,
    /// whether or not the user directory has linked the table yet.
    #[must_use]
    pub fn resolve(&self, space: &VmSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mapper = self.core.mapper;
        match space.kind() {
            PmapKind::User if va.as_u32() >= KERNEL_SPLIT => self.kernel.pmap().extract(mapper, va),
            _ => space.pmap().extract(mapper, va),
        }
    }
}
