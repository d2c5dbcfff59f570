//! # Page Faults
//!
//! [`Vm::fault`] turns a missing or write-protected translation into a
//! mapped page:
//!
//! 1. Kernel addresses faulting in a user space are resolved in the kernel
//!    space, then the directory entry is linked into the user pmap.
//! 2. The covering region must allow the access.
//! 3. The page visible at the faulting offset is looked up along the
//!    region object's shadow chain:
//!    - found in the region's own object: mapped as is;
//!    - found in an ancestor, write: copied into a fresh page of the
//!      region's object;
//!    - found in an ancestor, read or execute: the ancestor's frame is mapped
//!      without write access, so a later write faults again;
//!    - found nowhere: fixed physical memory is mapped directly, anything
//!      else gets a fresh page in the region's object, filled by the pager.
//! 4. A stale translation is replaced.

use crate::phys_mapper::PhysMapperExt;
use crate::vmm::object::VmObjectId;
use crate::vmm::region::{RegionFlags, VmProt};
use crate::vmm::space::VmSpace;
use crate::vmm::{SpaceRef, Vm, VmCore, VmError};
use bitfield_struct::bitfield;
use kernel_info::memory::KERNEL_SPLIT;
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PhysMapper};
use log::{debug, trace};

/// The error code the CPU pushes for a page fault (#PF, vector 14).
///
/// ```rust
/// # use kernel_alloc::vmm::{PageFaultError, VmProt};
/// // User-mode write to a present, read-only page.
/// let e = PageFaultError::from_bits(0b111);
/// assert!(e.present() && e.write() && e.user());
/// assert_eq!(e.access(), VmProt::WRITE | VmProt::USER);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// The page was present; the fault is a protection violation.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
    /// A reserved bit was set in a paging entry.
    pub reserved_write: bool,
    /// The access was an instruction fetch (NX enabled only).
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(25)]
    __reserved: u32,
}

impl PageFaultError {
    /// The access this fault asks a region to allow.
    #[must_use]
    pub const fn access(self) -> VmProt {
        let mut access = if self.write() {
            VmProt::WRITE
        } else if self.instruction_fetch() {
            VmProt::EXECUTE
        } else {
            VmProt::READ
        };
        if self.user() {
            access = access.union(VmProt::USER);
        }
        access
    }
}

/// How the faulting page was found.
struct Resolved {
    frame: PhysicalPage<Size4K>,
    /// Object and offset holding the page.
    owner: VmObjectId,
    offset: u32,
    writable: bool,
}

impl<M: PhysMapper> VmCore<'_, M> {
    pub(crate) fn fault_in<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: &VmSpace,
        addr: VirtualAddress,
        access: VmProt,
    ) -> Result<PhysicalPage<Size4K>, VmError> {
        let page = addr.page::<Size4K>();
        let va = page.base();
        let region = space.find(addr).ok_or(VmError::NotFound)?;
        if !region.prot().contains(access) {
            debug!("vm: {access:?} at {addr} denied by {:?}", region.prot());
            return Err(VmError::PermissionDenied);
        }

        let object = region.object();
        let offset = region.object_offset(va);
        let wired = region.flags().contains(RegionFlags::WIRED);
        let write = access.contains(VmProt::WRITE);
        let (rw_bits, ro_bits) = (region.entry_bits(true), region.entry_bits(false));

        if let Some((frame, bits)) = space.pmap().entry(self.mapper, va) {
            if !write || bits.writable() {
                trace!("vm: spurious fault at {addr}");
                return Ok(frame);
            }
            self.unref_frame(object, offset, frame);
            space
                .pmap()
                .remove(self.mapper, mmu, va, va + Size4K::SIZE)?;
        }

        let resolved = self.resolve_page(object, offset, write)?;
        let bits = if resolved.writable { rw_bits } else { ro_bits };
        space
            .pmap()
            .enter(self.mapper, &mut *self.frames.lock(), mmu, page, resolved.frame, bits)?;

        if let Some(p) = self.objects.lookup_mut(resolved.owner, resolved.offset) {
            if write {
                p.mark_dirty();
            }
            if wired {
                p.set_wired(true);
            }
            p.mapped();
        }
        trace!("vm: {access:?} fault at {addr} -> {}", resolved.frame);
        Ok(resolved.frame)
    }

    fn resolve_page(
        &mut self,
        object: VmObjectId,
        offset: u32,
        write: bool,
    ) -> Result<Resolved, VmError> {
        let found = match self.objects.lookup_chain(object, offset) {
            Some(hit) => Some((hit.frame, hit.object, hit.offset, hit.depth)),
            None => self.fixed_page(object, offset)?,
        };

        match found {
            Some((frame, owner, offset, 0)) => Ok(Resolved {
                frame,
                owner,
                offset,
                writable: true,
            }),
            Some((source, _, _, _)) if write => {
                let frame = self.objects.allocate(object, offset, &mut *self.frames.lock())?;
                self.mapper.copy_frame(source, frame);
                trace!("vm: copied {source} into {object} at {offset:#x}");
                Ok(Resolved {
                    frame,
                    owner: object,
                    offset,
                    writable: true,
                })
            }
            Some((frame, owner, offset, _)) => Ok(Resolved {
                frame,
                owner,
                offset,
                writable: false,
            }),
            None => {
                let (bottom, bottom_offset, _) = self
                    .objects
                    .backing(object, offset)
                    .ok_or(VmError::NotFound)?;
                let pager = self.objects.get(bottom).ok_or(VmError::NotFound)?.pager();
                let frame = self.objects.allocate(object, offset, &mut *self.frames.lock())?;
                pager.page_in(self.mapper, frame, bottom_offset);
                Ok(Resolved {
                    frame,
                    owner: object,
                    offset,
                    writable: true,
                })
            }
        }
    }

    /// Make the fixed frame of a physical object at the bottom of the chain
    /// resident, if that is what backs `offset`.
    fn fixed_page(
        &mut self,
        object: VmObjectId,
        offset: u32,
    ) -> Result<Option<(PhysicalPage<Size4K>, VmObjectId, u32, usize)>, VmError> {
        let (bottom, bottom_offset, depth) = self
            .objects
            .backing(object, offset)
            .ok_or(VmError::NotFound)?;
        let pager = self.objects.get(bottom).ok_or(VmError::NotFound)?.pager();
        if pager.fixed_frame(bottom_offset).is_none() {
            return Ok(None);
        }
        let frame = self.objects.resident_fixed(bottom, bottom_offset)?;
        Ok(Some((frame, bottom, bottom_offset, depth)))
    }

    /// Drop one mapping reference from the page `frame` visible at `offset`
    /// of `object`.
    pub(crate) fn unref_frame(
        &mut self,
        object: VmObjectId,
        offset: u32,
        frame: PhysicalPage<Size4K>,
    ) {
        let Some(hit) = self.objects.lookup_chain(object, offset) else {
            return;
        };
        if hit.frame != frame {
            return;
        }
        if let Some(page) = self.objects.lookup_mut(hit.object, hit.offset) {
            page.unmapped();
        }
    }
}

impl<M: PhysMapper> Vm<'_, M> {
    /// Resolve a page fault at `addr` in `space`.
    ///
    /// `access` is the access that faulted; include [`VmProt::USER`] for
    /// user-mode accesses.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if no region covers `addr`.
    /// - [`VmError::PermissionDenied`] if the region does not allow `access`.
    /// - [`VmError::OutOfMemory`] if no frame is left.
    pub fn fault<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: SpaceRef<'_>,
        addr: VirtualAddress,
        access: VmProt,
    ) -> Result<(), VmError> {
        match space {
            SpaceRef::User(user) if addr.as_u32() >= KERNEL_SPLIT => {
                self.core.fault_in(mmu, &self.kernel, addr, access)?;
                if user
                    .pmap()
                    .sync_kernel_entry(self.core.mapper, self.kernel.pmap(), addr)
                {
                    debug!("vm: linked kernel table for {addr} into {}", user.pmap().root());
                }
                Ok(())
            }
            SpaceRef::User(user) => self.core.fault_in(mmu, user, addr, access).map(|_| ()),
            SpaceRef::Kernel => self.core.fault_in(mmu, &self.kernel, addr, access).map(|_| ()),
        }
    }

    /// [`fault`](Self::fault) with the access decoded from the CPU's error code.
    ///
    /// # Errors
    /// See [`fault`](Self::fault).
    pub fn handle_page_fault<C: Mmu + ?Sized>(
        &mut self,
        mmu: &mut C,
        space: SpaceRef<'_>,
        addr: VirtualAddress,
        error: PageFaultError,
    ) -> Result<(), VmError> {
        self.fault(mmu, space, addr, error.access())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_decodes_access() {
        let read = PageFaultError::new();
        assert_eq!(read.access(), VmProt::READ);

        let fetch = PageFaultError::new().with_instruction_fetch(true).with_user(true);
        assert_eq!(fetch.access(), VmProt::EXECUTE | VmProt::USER);

        let cow = PageFaultError::from_bits(0b011);
        assert!(cow.present());
        assert_eq!(cow.access(), VmProt::WRITE);
    }
}
