//! # VM Regions
//!
//! A [`VmRegion`] is a page-aligned half-open interval `[base, end)` of one
//! address space with uniform protection, backed by one object at one
//! offset. Each region holds one reference on its object.
//!
//! A [`RegionList`] keeps the regions of a space ordered by base address.
//! After every operation:
//! - no two regions overlap,
//! - no two adjacent regions could be merged (same protection, flags and
//!   object, contiguous offsets).

use crate::vmm::VmError;
use crate::vmm::object::{VmObjectId, VmObjects};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::Range;
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, PageEntryBits};
use log::{debug, warn};

bitflags! {
    /// Access rights of a region, and the access a fault asks for.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VmProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 3;
    }
}

bitflags! {
    /// How a region behaves on fork and on fault.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Copy-on-write across fork.
        const PRIVATE = 1 << 0;
        /// Shared verbatim across fork.
        const SHARED = 1 << 1;
        /// Populated at map time; pages stay resident.
        const WIRED = 1 << 2;
        /// Device memory; mapped uncached.
        const DEVICE = 1 << 3;
        const STACK = 1 << 4;
        /// Placed at a caller-chosen address.
        const FIXED = 1 << 5;
    }
}

/// How [`VmRegion::fork`] handed the region to the child.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ForkKind {
    /// Both sides reference the same object.
    Shared,
    /// Both sides got their own shadow of the original object.
    CopyOnWrite,
}

#[derive(Debug, Eq, PartialEq)]
pub struct VmRegion {
    base: VirtualAddress,
    end: VirtualAddress,
    prot: VmProt,
    flags: RegionFlags,
    object: VmObjectId,
    offset: u32,
}

impl VmRegion {
    /// A region over `[base, end)` that takes over one reference on `object`.
    #[must_use]
    pub fn new(
        base: VirtualAddress,
        end: VirtualAddress,
        object: VmObjectId,
        offset: u32,
        prot: VmProt,
        flags: RegionFlags,
    ) -> Self {
        debug_assert!(base < end);
        debug_assert!(base.is_aligned::<Size4K>() && end.is_aligned::<Size4K>());
        Self {
            base,
            end,
            prot,
            flags,
            object,
            offset,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// End address (exclusive).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.end - self.base
    }

    #[inline]
    #[must_use]
    pub const fn prot(&self) -> VmProt {
        self.prot
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn object(&self) -> VmObjectId {
        self.object
    }

    /// Offset of `base` within the object.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.base <= va && va < self.end
    }

    /// Object offset backing `va`. `va` must lie inside the region.
    #[inline]
    #[must_use]
    pub fn object_offset(&self, va: VirtualAddress) -> u32 {
        debug_assert!(self.contains(va));
        self.offset + (va - self.base)
    }

    /// Whether a fork shares this region instead of shadowing it.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.flags.contains(RegionFlags::SHARED) || !self.prot.contains(VmProt::WRITE)
    }

    /// Leaf entry bits for a page of this region. `allow_write = false`
    /// maps read-only regardless of protection (copy-on-write).
    #[must_use]
    pub const fn entry_bits(&self, allow_write: bool) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(allow_write && self.prot.contains(VmProt::WRITE))
            .with_user_access(self.prot.contains(VmProt::USER))
            .with_cache_disabled(self.flags.contains(RegionFlags::DEVICE))
    }

    /// `next` starts where `self` ends and continues it seamlessly.
    #[must_use]
    pub fn can_merge(&self, next: &Self) -> bool {
        self.end == next.base
            && self.prot == next.prot
            && self.flags == next.flags
            && self.object == next.object
            && self.offset.checked_add(self.size()) == Some(next.offset)
    }

    /// Cut the region at `at` and return the upper half `[at, end)`.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] unless `at` is page aligned and strictly inside.
    /// - [`VmError::NotFound`] if the object is gone.
    pub fn split(&mut self, at: VirtualAddress, objects: &VmObjects) -> Result<Self, VmError> {
        if at <= self.base || at >= self.end || !at.is_aligned::<Size4K>() {
            return Err(VmError::InvalidArgument);
        }
        objects.inc_ref(self.object)?;
        let upper = Self {
            base: at,
            end: self.end,
            prot: self.prot,
            flags: self.flags,
            object: self.object,
            offset: self.offset + (at - self.base),
        };
        self.end = at;
        Ok(upper)
    }

    /// Absorb the region directly after this one, releasing its reference.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] if the two are not adjacent or differ in
    /// protection, flags, object or offset; `donor` is handed back with it.
    pub fn merge<A: FrameAlloc + ?Sized>(
        &mut self,
        donor: Self,
        objects: &mut VmObjects,
        frames: &mut A,
    ) -> Result<(), (VmError, Self)> {
        if !self.can_merge(&donor) {
            return Err((VmError::InvalidArgument, donor));
        }
        self.end = donor.end;
        if let Err(e) = objects.dec_ref(donor.object, frames) {
            warn!("vm: merging into {}: {e}", self.base);
        }
        Ok(())
    }

    /// `true` for private writable wired regions over a copy-on-write
    /// object. A fork copies these page by page instead of shadowing them,
    /// so neither side ever faults on wired memory.
    #[must_use]
    pub fn copies_on_fork(&self, objects: &VmObjects) -> bool {
        self.flags.contains(RegionFlags::WIRED)
            && !self.is_shared()
            && objects
                .get(self.object)
                .is_some_and(|o| o.kind().is_copy_on_write())
    }

    /// Produce the child's copy of this region for a fork.
    ///
    /// Shared regions and non-copy-on-write objects are re-referenced.
    /// Anything else gets two sibling shadows of the original object; this
    /// region moves onto one of them and the child gets the other. The
    /// caller write-protects the parent's existing mappings.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no shadow could be created; the region
    /// is left unchanged.
    pub fn fork<A: FrameAlloc + ?Sized>(
        &mut self,
        objects: &mut VmObjects,
        frames: &mut A,
    ) -> Result<(Self, ForkKind), VmError> {
        let kind = objects.get(self.object).ok_or(VmError::NotFound)?.kind();
        if self.is_shared() || !kind.is_copy_on_write() {
            objects.inc_ref(self.object)?;
            return Ok((self.duplicate(self.object, self.offset), ForkKind::Shared));
        }

        let original = self.object;
        let ours = objects.create_shadow(original, self.offset)?;
        let theirs = match objects.create_shadow(original, self.offset) {
            Ok(id) => id,
            Err(e) => {
                objects.dec_ref(ours, frames)?;
                return Err(e);
            }
        };

        self.object = ours;
        self.offset = 0;
        // The shadows keep the original alive.
        objects.dec_ref(original, frames)?;
        debug!("vm: fork of {}..{} shadows {original}", self.base, self.end);
        Ok((self.duplicate(theirs, 0), ForkKind::CopyOnWrite))
    }

    /// Drop this region's object reference.
    ///
    /// # Errors
    /// [`VmError::NotFound`] if the object is already gone.
    pub fn release<A: FrameAlloc + ?Sized>(
        self,
        objects: &mut VmObjects,
        frames: &mut A,
    ) -> Result<(), VmError> {
        objects.dec_ref(self.object, frames)
    }

    const fn duplicate(&self, object: VmObjectId, offset: u32) -> Self {
        Self {
            base: self.base,
            end: self.end,
            prot: self.prot,
            flags: self.flags,
            object,
            offset,
        }
    }

    pub(crate) const fn set_prot(&mut self, prot: VmProt) {
        self.prot = prot;
    }

    pub(crate) const fn set_end(&mut self, end: VirtualAddress) {
        self.end = end;
    }
}

/// The regions of one space, ordered by base address.
#[derive(Debug, Default)]
pub struct RegionList {
    regions: BTreeMap<u32, VmRegion>,
}

impl RegionList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &VmRegion> {
        self.regions.values()
    }

    /// The region containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&VmRegion> {
        self.regions
            .range(..=va.as_u32())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(va))
    }

    pub(crate) fn get_mut(&mut self, base: VirtualAddress) -> Option<&mut VmRegion> {
        self.regions.get_mut(&base.as_u32())
    }

    /// Bases of all regions, for walks that mutate the list.
    pub(crate) fn bases(&self) -> Vec<VirtualAddress> {
        self.regions.values().map(VmRegion::base).collect()
    }

    /// Whether any region intersects `[start, end)`.
    #[must_use]
    pub fn intersects(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.regions
            .range(..end.as_u32())
            .next_back()
            .is_some_and(|(_, r)| r.end > start)
    }

    /// Whether regions cover every address of `[start, end)`.
    #[must_use]
    pub fn covers(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        let first = self
            .regions
            .range(..=start.as_u32())
            .next_back()
            .map_or(start.as_u32(), |(&k, _)| k);
        let mut cursor = start;
        for r in self.regions.range(first..end.as_u32()).map(|(_, r)| r) {
            if r.end <= cursor {
                continue;
            }
            if r.base > cursor {
                return false;
            }
            cursor = r.end;
        }
        cursor >= end
    }

    /// Insert a region, merging it with compatible neighbors.
    ///
    /// # Errors
    /// [`VmError::AlreadyExists`] if it overlaps an existing region. The
    /// rejected region's object reference is released.
    pub fn insert<A: FrameAlloc + ?Sized>(
        &mut self,
        region: VmRegion,
        objects: &mut VmObjects,
        frames: &mut A,
    ) -> Result<(), VmError> {
        if self.intersects(region.base, region.end) {
            region.release(objects, frames)?;
            return Err(VmError::AlreadyExists);
        }
        let base = region.base;
        self.regions.insert(base.as_u32(), region);
        self.coalesce(base, base, objects, frames);
        Ok(())
    }

    /// First gap of at least `size` bytes inside `window`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if there is none.
    pub fn find_free(
        &self,
        size: u32,
        window: Range<VirtualAddress>,
    ) -> Result<VirtualAddress, VmError> {
        let mut cursor = window.start;
        for r in self.regions.range(..window.end.as_u32()).map(|(_, r)| r) {
            if r.end <= cursor {
                continue;
            }
            if r.base >= cursor && r.base - cursor >= size {
                return Ok(cursor);
            }
            cursor = r.end;
        }
        if window.end >= cursor && window.end - cursor >= size {
            Ok(cursor)
        } else {
            Err(VmError::OutOfMemory)
        }
    }

    /// Detach every region inside `[start, end)`, splitting regions that
    /// straddle either boundary. The returned regions still hold their
    /// object references.
    ///
    /// # Errors
    /// [`VmError::NotFound`] if a straddling region's object is gone.
    pub fn take_range(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        objects: &VmObjects,
    ) -> Result<Vec<VmRegion>, VmError> {
        self.split_at(start, objects)?;
        self.split_at(end, objects)?;
        let keys: Vec<u32> = self
            .regions
            .range(start.as_u32()..end.as_u32())
            .map(|(&k, _)| k)
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|k| self.regions.remove(&k))
            .collect())
    }

    /// Remove `[start, end)` and release the removed regions' references.
    ///
    /// Returns the number of regions (or region pieces) removed.
    ///
    /// # Errors
    /// See [`take_range`](Self::take_range).
    pub fn remove_range<A: FrameAlloc + ?Sized>(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        objects: &mut VmObjects,
        frames: &mut A,
    ) -> Result<usize, VmError> {
        let taken = self.take_range(start, end, objects)?;
        let count = taken.len();
        for region in taken {
            region.release(objects, frames)?;
        }
        Ok(count)
    }

    /// Set the protection of `[start, end)`, splitting at the boundaries and
    /// merging again where the result allows it.
    ///
    /// # Errors
    /// [`VmError::NotFound`] if a straddling region's object is gone.
    pub fn protect_range<A: FrameAlloc + ?Sized>(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: VmProt,
        objects: &mut VmObjects,
        frames: &mut A,
    ) -> Result<(), VmError> {
        self.split_at(start, objects)?;
        self.split_at(end, objects)?;
        for region in self
            .regions
            .range_mut(start.as_u32()..end.as_u32())
            .map(|(_, r)| r)
        {
            region.set_prot(prot);
        }
        self.coalesce(start, end, objects, frames);
        Ok(())
    }

    /// Merge every mergeable pair from the region before `from` up to the
    /// first region starting after `to`.
    pub(crate) fn coalesce<A: FrameAlloc + ?Sized>(
        &mut self,
        from: VirtualAddress,
        to: VirtualAddress,
        objects: &mut VmObjects,
        frames: &mut A,
    ) {
        let mut cursor = self
            .regions
            .range(..from.as_u32())
            .next_back()
            .map_or(from.as_u32(), |(&k, _)| k);

        loop {
            let mut pair = self.regions.range(cursor..);
            let Some((&current, left)) = pair.next() else {
                break;
            };
            if current > to.as_u32() {
                break;
            }
            let Some((&next, right)) = pair.next() else {
                break;
            };
            if !left.can_merge(right) {
                cursor = next;
                continue;
            }

            let Some(donor) = self.regions.remove(&next) else {
                break;
            };
            let Some(target) = self.regions.get_mut(&current) else {
                break;
            };
            if let Err((_, donor)) = target.merge(donor, objects, frames) {
                self.regions.insert(next, donor);
                cursor = next;
            }
        }
    }

    /// Split the region straddling `at`, if any.
    fn split_at(&mut self, at: VirtualAddress, objects: &VmObjects) -> Result<(), VmError> {
        let Some((_, region)) = self.regions.range_mut(..at.as_u32()).next_back() else {
            return Ok(());
        };
        if region.end <= at {
            return Ok(());
        }
        let upper = region.split(at, objects)?;
        self.regions.insert(at.as_u32(), upper);
        Ok(())
    }

    /// Take every region out, in address order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = VmRegion> {
        core::mem::take(&mut self.regions).into_values()
    }

    /// Sorted, non-overlapping and fully coalesced.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let keyed = self
            .regions
            .iter()
            .all(|(&k, r)| k == r.base.as_u32() && r.base < r.end);
        let ordered = self
            .regions
            .values()
            .zip(self.regions.values().skip(1))
            .all(|(a, b)| a.end <= b.base && !a.can_merge(b));
        keyed && ordered
    }
}
