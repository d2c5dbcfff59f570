//! # Virtual Memory Manager
//!
//! [`Vm`] ties the layers together: VM objects own pages, regions map
//! objects into address spaces, and each space's [`Pmap`] caches the
//! translations the fault handler installs.
//!
//! ```text
//!  VmSpace ──► RegionList ──► VmRegion ──► VmObject ──► VmPage ──► frame
//!     │                                       │
//!     └──► Pmap (page directory)              └──► shadow parent ...
//! ```
//!
//! Every operation that may touch page tables takes the CPU's [`Mmu`]
//! explicitly. The frame allocator sits behind a [`SpinLock`] that is taken
//! for each allocation or free and never held across another lock.
//!
//! # Example
//! ```rust
//! use kernel_alloc::frame_alloc::BitmapFrameAlloc;
//! use kernel_alloc::vmm::{MapAt, RegionFlags, SpaceRef, Vm, VmConfig, VmProt};
//! use kernel_info::boot::{BootMemoryMap, BootMemoryRegion};
//! use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
//! use kernel_sync::SpinLock;
//! use kernel_vmem::testing::{RecordingMmu, TestPhys};
//!
//! let phys = TestPhys::new(PhysicalAddress::new(0x0100_0000), 64);
//! let regions = [BootMemoryRegion::usable(0x0100_0000, 64 * 4096)];
//! let frames = SpinLock::new(BitmapFrameAlloc::from_memory_map(BootMemoryMap::new(&regions)));
//! let mut mmu = RecordingMmu::new(PhysicalPage::from_index(0));
//!
//! // Host-only: the recording MMU never loads anything into a real CPU.
//! let config = unsafe { VmConfig::without_direct_map() };
//! let mut vm = Vm::new(&phys, &frames, &mut mmu, config).unwrap();
//! let mut space = vm.create_space().unwrap();
//! let rw = VmProt::READ | VmProt::WRITE | VmProt::USER;
//! let user = SpaceRef::User(&mut space);
//! let va = vm
//!     .map_anonymous(&mut mmu, user, MapAt::Auto, 4096, rw, RegionFlags::PRIVATE)
//!     .unwrap();
//! vm.fault(&mut mmu, SpaceRef::User(&mut space), va, VmProt::WRITE | VmProt::USER).unwrap();
//! assert!(vm.resolve(&space, va).is_some());
//! vm.destroy_space(&mut mmu, space);
//! ```

mod error;
mod fault;
pub mod object;
mod page;
pub mod region;
mod space;

pub use crate::vmm::error::VmError;
pub use crate::vmm::fault::PageFaultError;
pub use crate::vmm::object::{ObjectKind, VmObjectId, VmObjects};
pub use crate::vmm::page::VmPage;
pub use crate::vmm::region::{RegionFlags, RegionList, VmProt, VmRegion};
pub use crate::vmm::space::VmSpace;

use crate::frame_alloc::BitmapFrameAlloc;
use alloc::vec::Vec;
use kernel_info::memory::{DEFAULT_MAX_VM_OBJECTS, PAGE_SIZE, PHYS_MAP_BASE, PHYS_MAP_LIMIT};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, is_aligned};
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, PageEntryBits, PhysMapper, Pmap, PmapKind};
use log::{debug, info, warn};

/// Runtime knobs of the memory manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmConfig {
    /// Maximum number of live VM objects.
    pub max_objects: usize,
    direct_map: bool,
}

impl VmConfig {
    /// Configuration whose kernel space has no direct-map region.
    ///
    /// # Safety
    /// The manager's directories then map nothing of the running kernel, so
    /// the [`Mmu`] handed to it must not drive a real CPU.
    #[must_use]
    pub const unsafe fn without_direct_map() -> Self {
        Self {
            max_objects: DEFAULT_MAX_VM_OBJECTS,
            direct_map: false,
        }
    }

    #[must_use]
    pub const fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// `true` if the kernel space reserves the direct map of managed RAM.
    #[must_use]
    pub const fn direct_map(&self) -> bool {
        self.direct_map
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_objects: DEFAULT_MAX_VM_OBJECTS,
            direct_map: true,
        }
    }
}

/// Which address space an operation applies to.
#[derive(Debug)]
pub enum SpaceRef<'s> {
    /// The kernel space owned by [`Vm`].
    Kernel,
    User(&'s mut VmSpace),
}

impl<'s> From<&'s mut VmSpace> for SpaceRef<'s> {
    fn from(space: &'s mut VmSpace) -> Self {
        Self::User(space)
    }
}

/// Where [`Vm::map_region`] places a region.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapAt {
    /// First free range of the space's window.
    Auto,
    /// Exactly this address.
    Fixed(VirtualAddress),
}

/// Arguments of [`Vm::map_region`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MapRequest {
    pub at: MapAt,
    /// Length in bytes, page aligned.
    pub size: u32,
    pub object: VmObjectId,
    /// Offset into `object` of the region's first byte, page aligned.
    pub offset: u32,
    pub prot: VmProt,
    pub flags: RegionFlags,
}

impl MapRequest {
    /// Map `object` from offset 0 wherever it fits.
    #[must_use]
    pub const fn anywhere(object: VmObjectId, size: u32, prot: VmProt, flags: RegionFlags) -> Self {
        Self {
            at: MapAt::Auto,
            size,
            object,
            offset: 0,
            prot,
            flags,
        }
    }

    /// Map `object` from offset 0 at `va`.
    #[must_use]
    pub const fn fixed(
        va: VirtualAddress,
        object: VmObjectId,
        size: u32,
        prot: VmProt,
        flags: RegionFlags,
    ) -> Self {
        Self {
            at: MapAt::Fixed(va),
            size,
            object,
            offset: 0,
            prot,
            flags,
        }
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// Everything but the kernel space, so that the kernel space and the core
/// can be borrowed independently.
pub(crate) struct VmCore<'m, M: PhysMapper> {
    pub(crate) mapper: &'m M,
    pub(crate) frames: &'m SpinLock<BitmapFrameAlloc>,
    pub(crate) objects: VmObjects,
}

/// The virtual memory manager.
pub struct Vm<'m, M: PhysMapper> {
    core: VmCore<'m, M>,
    kernel: VmSpace,
}

impl<'m, M: PhysMapper> Vm<'m, M> {
    /// Create the memory manager with a fresh kernel page directory.
    ///
    /// The direct map of all managed RAM (which includes the kernel image)
    /// is mapped wired at `PHYS_MAP_BASE`, so every directory the manager
    /// hands out maps the running kernel. Building it never loads the new
    /// directory.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the directory or its page tables could
    /// not be allocated.
    pub fn new<C: Mmu + ?Sized>(
        mapper: &'m M,
        frames: &'m SpinLock<BitmapFrameAlloc>,
        mmu: &mut C,
        config: VmConfig,
    ) -> Result<Self, VmError> {
        let pmap = Pmap::create_kernel(mapper, &mut *frames.lock())?;
        let mut vm = Self::assemble(mapper, frames, pmap, config);
        if config.direct_map {
            vm.reserve_direct_map(mmu, RegionFlags::WIRED)?;
        }
        info!(
            "vm: kernel directory at {}, {} object slots",
            vm.kernel.pmap().root(),
            config.max_objects
        );
        Ok(vm)
    }

    /// Create the memory manager around an existing kernel directory, e.g.
    /// the one the boot code is running on.
    ///
    /// The direct map is reserved as a kernel region but not re-entered;
    /// the boot code's translations stay in place.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the direct-map region could not be set up.
    ///
    /// # Safety
    /// `pmap` must be a kernel pmap that maps the running kernel and the
    /// direct map, and whose directory stays valid for the lifetime of the
    /// manager.
    pub unsafe fn with_kernel_pmap<C: Mmu + ?Sized>(
        mapper: &'m M,
        frames: &'m SpinLock<BitmapFrameAlloc>,
        mmu: &mut C,
        pmap: Pmap,
        config: VmConfig,
    ) -> Result<Self, VmError> {
        debug_assert_eq!(pmap.kind(), PmapKind::Kernel);
        let mut vm = Self::assemble(mapper, frames, pmap, config);
        if config.direct_map {
            vm.reserve_direct_map(mmu, RegionFlags::empty())?;
        }
        Ok(vm)
    }

    fn assemble(
        mapper: &'m M,
        frames: &'m SpinLock<BitmapFrameAlloc>,
        pmap: Pmap,
        config: VmConfig,
    ) -> Self {
        Self {
            core: VmCore {
                mapper,
                frames,
                objects: VmObjects::with_capacity(config.max_objects),
            },
            kernel: VmSpace::new(pmap),
        }
    }

    /// Claim `[PHYS_MAP_BASE, PHYS_MAP_BASE + managed RAM)` so kernel regions
    /// placed anywhere never alias the direct map.
    fn reserve_direct_map<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        flags: RegionFlags,
    ) -> Result<(), VmError> {
        let size = self
            .core
            .frames
            .lock()
            .total_frames()
            .saturating_mul(PAGE_SIZE)
            .min(PHYS_MAP_LIMIT);
        if size == 0 {
            return Ok(());
        }
        let object =
            self.create_physical_object(ObjectKind::Physical, PhysicalAddress::zero(), size)?;
        let request = MapRequest::fixed(
            VirtualAddress::new(PHYS_MAP_BASE),
            object,
            size,
            VmProt::READ | VmProt::WRITE | VmProt::EXECUTE,
            RegionFlags::SHARED | flags,
        );
        let mapped = self.map_region(mmu, SpaceRef::Kernel, request);
        self.release_object(object)?;
        mapped?;
        debug!("vm: direct map reserved for {size:#x} bytes");
        Ok(())
    }

    /// The kernel address space.
    #[must_use]
    pub const fn kernel_space(&self) -> &VmSpace {
        &self.kernel
    }

    #[must_use]
    pub const fn objects(&self) -> &VmObjects {
        &self.core.objects
    }

    #[must_use]
    pub const fn frames(&self) -> &'m SpinLock<BitmapFrameAlloc> {
        self.core.frames
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.core.mapper
    }

    fn parts<'s>(&'s mut self, space: SpaceRef<'s>) -> (&'s mut VmCore<'m, M>, &'s mut VmSpace) {
        match space {
            SpaceRef::Kernel => (&mut self.core, &mut self.kernel),
            SpaceRef::User(user) => (&mut self.core, user),
        }
    }

    /// Create a pageable object with one reference held by the caller.
    ///
    /// # Errors
    /// See [`VmObjects::create`].
    pub fn create_object(&mut self, kind: ObjectKind, size: u32) -> Result<VmObjectId, VmError> {
        self.core.objects.create(kind, size)
    }

    /// Create an object over fixed physical memory, e.g. device registers.
    ///
    /// # Errors
    /// See [`VmObjects::create_physical`].
    pub fn create_physical_object(
        &mut self,
        kind: ObjectKind,
        base: PhysicalAddress,
        size: u32,
    ) -> Result<VmObjectId, VmError> {
        self.core.objects.create_physical(kind, base, size)
    }

    /// Drop a reference obtained from one of the `create_*` calls.
    ///
    /// # Errors
    /// [`VmError::NotFound`] if the object is already gone.
    pub fn release_object(&mut self, object: VmObjectId) -> Result<(), VmError> {
        let core = &mut self.core;
        core.objects.dec_ref(object, &mut *core.frames.lock())
    }

    /// Map `request.object` into `space`. Returns the region's base.
    ///
    /// The region takes its own reference on the object; the caller's
    /// reference is untouched. Wired regions are populated before returning.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a zero or unaligned size or offset,
    ///   `PRIVATE` together with `SHARED`, a fixed range outside the space's
    ///   window, or a range past the end of the object.
    /// - [`VmError::AlreadyExists`] if a fixed range overlaps a region.
    /// - [`VmError::OutOfMemory`] if no range is free or populating a wired
    ///   region ran out of frames.
    /// - [`VmError::NotFound`] if the object is gone.
    pub fn map_region<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: SpaceRef<'_>,
        request: MapRequest,
    ) -> Result<VirtualAddress, VmError> {
        let (core, space) = self.parts(space);
        core.map(mmu, space, request)
    }

    /// Map a fresh zero-filled object of `size` bytes.
    ///
    /// # Errors
    /// See [`map_region`](Self::map_region).
    pub fn map_anonymous<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: SpaceRef<'_>,
        at: MapAt,
        size: u32,
        prot: VmProt,
        flags: RegionFlags,
    ) -> Result<VirtualAddress, VmError> {
        let object = self.create_object(ObjectKind::Anonymous, size)?;
        let request = MapRequest {
            at,
            ..MapRequest::anywhere(object, size, prot, flags)
        };
        let mapped = self.map_region(mmu, space, request);
        self.release_object(object)?;
        mapped
    }

    /// Unmap `[addr, addr + size)`. Regions straddling either end are split.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a zero or unaligned range.
    /// - [`VmError::NotFound`] if no region intersects the range.
    pub fn unmap_region<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: SpaceRef<'_>,
        addr: VirtualAddress,
        size: u32,
    ) -> Result<(), VmError> {
        let (core, space) = self.parts(space);
        let end = checked_range(addr, size)?;
        core.unmap(mmu, space, addr, end)
    }

    /// Change the protection of `[addr, addr + size)`.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a zero or unaligned range.
    /// - [`VmError::NotFound`] unless regions cover the whole range.
    pub fn protect_region<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: SpaceRef<'_>,
        addr: VirtualAddress,
        size: u32,
        prot: VmProt,
    ) -> Result<(), VmError> {
        let (core, space) = self.parts(space);
        let end = checked_range(addr, size)?;
        core.protect(mmu, space, addr, end, prot)
    }

    /// Grow or shrink the region starting at `addr` to `new_size` bytes.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if no region starts at `addr`.
    /// - [`VmError::InvalidArgument`] for a zero or unaligned size, or growing
    ///   a region over fixed physical memory.
    /// - [`VmError::OutOfMemory`] if the addresses after the region are taken.
    pub fn resize_region<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: SpaceRef<'_>,
        addr: VirtualAddress,
        new_size: u32,
    ) -> Result<(), VmError> {
        let (core, space) = self.parts(space);
        core.resize(mmu, space, addr, new_size)
    }
}

impl<M: PhysMapper> VmCore<'_, M> {
    fn map<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: &mut VmSpace,
        request: MapRequest,
    ) -> Result<VirtualAddress, VmError> {
        let MapRequest {
            at,
            size,
            object,
            offset,
            prot,
            mut flags,
        } = request;
        if size == 0 || !is_aligned::<Size4K>(size) || !is_aligned::<Size4K>(offset) {
            return Err(VmError::InvalidArgument);
        }
        if flags.contains(RegionFlags::PRIVATE | RegionFlags::SHARED) {
            return Err(VmError::InvalidArgument);
        }
        let object_size = self.objects.get(object).ok_or(VmError::NotFound)?.size();
        if offset.checked_add(size).is_none_or(|end| end > object_size) {
            return Err(VmError::InvalidArgument);
        }

        let window = space.window();
        let base = match at {
            MapAt::Auto => space.regions().find_free(size, window)?,
            MapAt::Fixed(va) => {
                let end = checked_range(va, size)?;
                if va < window.start || end > window.end {
                    return Err(VmError::InvalidArgument);
                }
                if space.regions().intersects(va, end) {
                    return Err(VmError::AlreadyExists);
                }
                flags |= RegionFlags::FIXED;
                va
            }
        };
        let end = base + size;

        self.objects.inc_ref(object)?;
        let region = VmRegion::new(base, end, object, offset, prot, flags);
        space
            .regions_mut()
            .insert(region, &mut self.objects, &mut *self.frames.lock())?;

        if flags.contains(RegionFlags::WIRED)
            && let Err(e) = self.wire(mmu, space, base, end, prot)
        {
            warn!("vm: wiring {base}..{end} failed: {e}");
            if let Err(e) = self.unmap(mmu, space, base, end) {
                warn!("vm: unwinding {base}..{end}: {e}");
            }
            return Err(e);
        }

        debug!("vm: mapped {object} at {base}..{end} ({prot:?}, {flags:?})");
        Ok(base)
    }

    fn wire<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: &VmSpace,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: VmProt,
    ) -> Result<(), VmError> {
        let access = prot.intersection(VmProt::READ | VmProt::WRITE);
        let mut va = start;
        while va < end {
            self.fault_in(mmu, space, va, access)?;
            va += Size4K::SIZE;
        }
        Ok(())
    }

    fn unmap<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: &mut VmSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmError> {
        if !space.regions().intersects(start, end) {
            return Err(VmError::NotFound);
        }
        let removed = self.unmap_pages(mmu, space, start, end)?;
        let regions = space.regions_mut().remove_range(
            start,
            end,
            &mut self.objects,
            &mut *self.frames.lock(),
        )?;
        debug!("vm: unmapped {start}..{end}: {regions} regions, {removed} pages");
        Ok(())
    }

    fn protect<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: &mut VmSpace,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: VmProt,
    ) -> Result<(), VmError> {
        if !space.regions().covers(start, end) {
            return Err(VmError::NotFound);
        }
        space.regions_mut().protect_range(
            start,
            end,
            prot,
            &mut self.objects,
            &mut *self.frames.lock(),
        )?;

        // Gaining write access must go through the fault path so that
        // copy-on-write pages are copied first.
        if prot.contains(VmProt::WRITE) || !prot.contains(VmProt::READ) {
            self.unmap_pages(mmu, space, start, end)?;
        } else {
            let bits = PageEntryBits::new()
                .with_present(true)
                .with_user_access(prot.contains(VmProt::USER));
            for (from, to, bits) in spans_with_bits(space, start, end, bits) {
                space.pmap().protect(self.mapper, mmu, from, to, bits)?;
            }
        }
        debug!("vm: protected {start}..{end} as {prot:?}");
        Ok(())
    }

    fn resize<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: &mut VmSpace,
        addr: VirtualAddress,
        new_size: u32,
    ) -> Result<(), VmError> {
        let region = space
            .find(addr)
            .filter(|r| r.base() == addr)
            .ok_or(VmError::NotFound)?;
        if new_size == 0 || !is_aligned::<Size4K>(new_size) {
            return Err(VmError::InvalidArgument);
        }
        let (old_size, object, offset) = (region.size(), region.object(), region.offset());
        let old_end = region.end();

        if new_size < old_size {
            return self.unmap(mmu, space, addr + new_size, old_end);
        }
        if new_size == old_size {
            return Ok(());
        }

        let new_end = addr.checked_add(new_size).ok_or(VmError::OutOfMemory)?;
        if new_end > space.window().end || space.regions().intersects(old_end, new_end) {
            return Err(VmError::OutOfMemory);
        }
        let needed = offset.checked_add(new_size).ok_or(VmError::InvalidArgument)?;
        let object_size = self.objects.get(object).ok_or(VmError::NotFound)?.size();
        if needed > object_size {
            self.objects
                .set_size(object, needed, &mut *self.frames.lock())?;
        }

        let regions = space.regions_mut();
        if let Some(region) = regions.get_mut(addr) {
            region.set_end(new_end);
        }
        regions.coalesce(addr, new_end, &mut self.objects, &mut *self.frames.lock());
        debug!("vm: resized {addr} to {new_size:#x} bytes");
        Ok(())
    }
}

/// Per-region pieces of `[start, end)` with the leaf bits for each: `base`
/// plus the region's cache attributes.
fn spans_with_bits(
    space: &VmSpace,
    start: VirtualAddress,
    end: VirtualAddress,
    base: PageEntryBits,
) -> Vec<(VirtualAddress, VirtualAddress, PageEntryBits)> {
    space
        .regions()
        .iter()
        .map(|r| {
            let bits = base.with_cache_disabled(r.flags().contains(RegionFlags::DEVICE));
            (r.base().max(start), r.end().min(end), bits)
        })
        .filter(|(from, to, _)| from < to)
        .collect()
}

/// `addr + size` for a non-empty page-aligned range.
fn checked_range(addr: VirtualAddress, size: u32) -> Result<VirtualAddress, VmError> {
    if size == 0 || !is_aligned::<Size4K>(size) || !addr.is_aligned::<Size4K>() {
        return Err(VmError::InvalidArgument);
    }
    addr.checked_add(size).ok_or(VmError::InvalidArgument)
}
