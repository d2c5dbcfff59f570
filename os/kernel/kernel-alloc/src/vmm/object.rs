//! # VM Objects
//!
//! Reference-counted owners of resident pages, kept in an arena and named by
//! generational [`VmObjectId`] handles.
//!
//! A shadow object overlays a parent: pages it holds hide the parent's pages
//! at the same (shifted) offset, everything else shows through. Forking a
//! private writable region splices two sibling shadows over the original
//! object; writes then land in the shadow of the side that wrote.
//!
//! ```text
//!   parent region ─► shadow A ─┐
//!                              ├─► original (anonymous)
//!   child region  ─► shadow B ─┘
//! ```
//!
//! Dropping the last reference frees the resident pages and releases the
//! parent, walking the chain iteratively.

use crate::phys_mapper::PhysMapperExt;
use crate::vmm::VmError;
use crate::vmm::page::VmPage;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, is_aligned};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, warn};

/// What backs an object.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObjectKind {
    /// Zero-filled memory.
    Anonymous,
    /// File contents.
    Vnode,
    /// A fixed range of physical memory.
    Physical,
    /// Swap-backed memory.
    Swap,
    /// Device memory (MMIO).
    Device,
    /// Copy-on-write overlay of another object.
    Shadow,
}

impl ObjectKind {
    /// Whether a private writable mapping of this kind is shadowed on fork.
    #[must_use]
    pub const fn is_copy_on_write(self) -> bool {
        !matches!(self, Self::Physical | Self::Device)
    }
}

/// Where a page's first contents come from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Pager {
    /// Freshly zeroed frames.
    ZeroFill,
    /// A backing store that is not wired to any I/O path; pages read as zero.
    Unwired,
    /// Fixed physical memory: offset `o` lives at `base + o`. Frames are not owned.
    Physical { base: PhysicalAddress },
}

impl Pager {
    /// Whether pages of this pager return their frames to the allocator.
    #[must_use]
    pub const fn owns_frames(self) -> bool {
        !matches!(self, Self::Physical { .. })
    }

    /// The fixed frame for `offset`, for physical pagers.
    #[must_use]
    pub fn fixed_frame(self, offset: u32) -> Option<PhysicalPage<Size4K>> {
        match self {
            Self::Physical { base } => base.checked_add(offset).map(|pa| pa.page()),
            Self::ZeroFill | Self::Unwired => None,
        }
    }

    /// Fill a freshly allocated frame for `offset`.
    pub fn page_in<M: PhysMapper + ?Sized>(
        self,
        mapper: &M,
        frame: PhysicalPage<Size4K>,
        offset: u32,
    ) {
        match self {
            Self::ZeroFill => mapper.zero_frame(frame),
            Self::Unwired => {
                warn!("vm: no backing store for offset {offset:#x}, zero-filling");
                mapper.zero_frame(frame);
            }
            Self::Physical { .. } => {}
        }
    }
}

/// Handle to an object in [`VmObjects`].
///
/// Handles of freed objects stay invalid even when the slot is reused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VmObjectId {
    index: u32,
    generation: u32,
}

impl fmt::Display for VmObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}.{}", self.index, self.generation)
    }
}

/// Link from a shadow to the object it overlays.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Shadow {
    pub parent: VmObjectId,
    /// Offset `o` in the shadow corresponds to `o + offset` in the parent.
    pub offset: u32,
}

#[derive(Debug)]
pub struct VmObject {
    kind: ObjectKind,
    ref_count: AtomicU32,
    pages: BTreeMap<u32, VmPage>,
    shadow: Option<Shadow>,
    pager: Pager,
    size: u32,
}

impl VmObject {
    const fn new(kind: ObjectKind, pager: Pager, size: u32, shadow: Option<Shadow>) -> Self {
        Self {
            kind,
            ref_count: AtomicU32::new(1),
            pages: BTreeMap::new(),
            shadow,
            pager,
            size,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn shadow(&self) -> Option<Shadow> {
        self.shadow
    }

    #[must_use]
    pub const fn pager(&self) -> Pager {
        self.pager
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn page(&self, offset: u32) -> Option<&VmPage> {
        self.pages.get(&offset)
    }

    /// Resident pages in offset order.
    pub fn pages(&self) -> impl Iterator<Item = &VmPage> {
        self.pages.values()
    }
}

/// A page found by [`VmObjects::lookup_chain`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChainHit {
    /// The object holding the page.
    pub object: VmObjectId,
    /// The page's offset in that object.
    pub offset: u32,
    /// Number of shadow links followed (0 = the object asked for).
    pub depth: usize,
    pub frame: PhysicalPage<Size4K>,
}

struct Slot {
    generation: u32,
    object: Option<VmObject>,
}

/// Arena of all VM objects.
pub struct VmObjects {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl VmObjects {
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Number of live objects.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn get(&self, id: VmObjectId) -> Option<&VmObject> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.object.as_ref())
    }

    fn get_mut(&mut self, id: VmObjectId) -> Option<&mut VmObject> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.object.as_mut())
    }

    fn insert(&mut self, object: VmObject) -> Result<VmObjectId, VmError> {
        if self.live >= self.capacity {
            return Err(VmError::OutOfMemory);
        }
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            let index = u32::try_from(self.slots.len()).map_err(|_| VmError::OutOfMemory)?;
            self.slots.push(Slot {
                generation: 0,
                object: None,
            });
            index
        };
        let slot = &mut self.slots[index as usize];
        slot.object = Some(object);
        self.live += 1;
        Ok(VmObjectId {
            index,
            generation: slot.generation,
        })
    }

    fn remove(&mut self, id: VmObjectId) -> Option<VmObject> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(object)
    }

    /// Create a pageable object with one reference.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a zero or unaligned size, or for
    ///   physical/device kinds (see [`create_physical`](Self::create_physical)).
    /// - [`VmError::OutOfMemory`] when the arena is full.
    pub fn create(&mut self, kind: ObjectKind, size: u32) -> Result<VmObjectId, VmError> {
        check_size(size)?;
        let pager = match kind {
            ObjectKind::Anonymous | ObjectKind::Shadow => Pager::ZeroFill,
            ObjectKind::Vnode | ObjectKind::Swap => Pager::Unwired,
            ObjectKind::Physical | ObjectKind::Device => return Err(VmError::InvalidArgument),
        };
        let id = self.insert(VmObject::new(kind, pager, size, None))?;
        debug!("vm: created {kind:?} object {id}, {size:#x} bytes");
        Ok(id)
    }

    /// Create an object over the fixed physical range `[base, base + size)`.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a kind other than physical/device,
    ///   an unaligned base or size, or a range past 4 GiB.
    /// - [`VmError::OutOfMemory`] when the arena is full.
    pub fn create_physical(
        &mut self,
        kind: ObjectKind,
        base: PhysicalAddress,
        size: u32,
    ) -> Result<VmObjectId, VmError> {
        check_size(size)?;
        if !matches!(kind, ObjectKind::Physical | ObjectKind::Device)
            || !base.is_aligned::<Size4K>()
            || u64::from(base.as_u32()) + u64::from(size) > 1 << 32
        {
            return Err(VmError::InvalidArgument);
        }
        let id = self.insert(VmObject::new(kind, Pager::Physical { base }, size, None))?;
        debug!("vm: created {kind:?} object {id} over {base}, {size:#x} bytes");
        Ok(id)
    }

    /// Create a shadow of `parent` starting at `offset` into it.
    ///
    /// Takes one reference on `parent`.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if `parent` is gone.
    /// - [`VmError::InvalidArgument`] if `offset` is unaligned or not inside `parent`.
    /// - [`VmError::OutOfMemory`] when the arena is full.
    pub fn create_shadow(
        &mut self,
        parent: VmObjectId,
        offset: u32,
    ) -> Result<VmObjectId, VmError> {
        let size = {
            let p = self.get(parent).ok_or(VmError::NotFound)?;
            if !is_aligned::<Size4K>(offset) || offset >= p.size {
                return Err(VmError::InvalidArgument);
            }
            p.size - offset
        };

        let shadow = Shadow { parent, offset };
        let id = self.insert(VmObject::new(
            ObjectKind::Shadow,
            Pager::ZeroFill,
            size,
            Some(shadow),
        ))?;
        self.inc_ref(parent)?;
        debug!("vm: created shadow {id} of {parent} at {offset:#x}");
        Ok(id)
    }

    /// Take another reference.
    ///
    /// # Errors
    /// [`VmError::NotFound`] if the object is gone.
    pub fn inc_ref(&self, id: VmObjectId) -> Result<(), VmError> {
        let object = self.get(id).ok_or(VmError::NotFound)?;
        object.ref_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop a reference. The last one frees the object's pages and releases
    /// its shadow parent, and so on down the chain.
    ///
    /// # Errors
    /// [`VmError::NotFound`] if the object is gone.
    pub fn dec_ref<A: FrameAlloc + ?Sized>(
        &mut self,
        id: VmObjectId,
        frames: &mut A,
    ) -> Result<(), VmError> {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let Some(object) = self.get(id) else {
                return Err(VmError::NotFound);
            };
            if object.ref_count.fetch_sub(1, Ordering::AcqRel) > 1 {
                break;
            }

            let object = self.remove(id).ok_or(VmError::NotFound)?;
            if object.pager.owns_frames() {
                for page in object.pages.values() {
                    frames.free_4k(page.frame());
                }
            }
            debug!(
                "vm: destroyed {:?} object {id}, {} pages",
                object.kind,
                object.pages.len()
            );
            next = object.shadow.map(|s| s.parent);
        }
        Ok(())
    }

    /// The page at `offset` of `id` itself; shadow parents are not consulted.
    #[must_use]
    pub fn lookup(&self, id: VmObjectId, offset: u32) -> Option<&VmPage> {
        self.get(id)?.pages.get(&offset)
    }

    pub fn lookup_mut(&mut self, id: VmObjectId, offset: u32) -> Option<&mut VmPage> {
        self.get_mut(id)?.pages.get_mut(&offset)
    }

    /// Find the page visible at `offset` of `id`, following shadow links.
    #[must_use]
    pub fn lookup_chain(&self, id: VmObjectId, offset: u32) -> Option<ChainHit> {
        let mut object = id;
        let mut offset = offset;
        let mut depth = 0;
        loop {
            let o = self.get(object)?;
            if let Some(page) = o.pages.get(&offset) {
                return Some(ChainHit {
                    object,
                    offset,
                    depth,
                    frame: page.frame(),
                });
            }
            let shadow = o.shadow?;
            object = shadow.parent;
            offset = offset.checked_add(shadow.offset)?;
            depth += 1;
        }
    }

    /// The last object of the chain starting at `id`, with `offset`
    /// translated into it and the number of links followed.
    #[must_use]
    pub fn backing(&self, id: VmObjectId, offset: u32) -> Option<(VmObjectId, u32, usize)> {
        let mut object = id;
        let mut offset = offset;
        let mut depth = 0;
        while let Some(shadow) = self.get(object)?.shadow {
            object = shadow.parent;
            offset = offset.checked_add(shadow.offset)?;
            depth += 1;
        }
        Some((object, offset, depth))
    }

    /// Give `id` a fresh frame at `offset`. The frame's contents are
    /// whatever the allocator left there.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if the object is gone.
    /// - [`VmError::InvalidArgument`] for an unaligned or out-of-object
    ///   offset, or an object that does not own frames.
    /// - [`VmError::AlreadyExists`] if the offset is resident.
    /// - [`VmError::OutOfMemory`] if no frame is left.
    pub fn allocate<A: FrameAlloc + ?Sized>(
        &mut self,
        id: VmObjectId,
        offset: u32,
        frames: &mut A,
    ) -> Result<PhysicalPage<Size4K>, VmError> {
        let object = self.get_mut(id).ok_or(VmError::NotFound)?;
        if !is_aligned::<Size4K>(offset) || offset >= object.size || !object.pager.owns_frames() {
            return Err(VmError::InvalidArgument);
        }
        if object.pages.contains_key(&offset) {
            return Err(VmError::AlreadyExists);
        }
        let frame = frames.alloc_4k().ok_or(VmError::OutOfMemory)?;
        object.pages.insert(offset, VmPage::new(frame, offset));
        Ok(frame)
    }

    /// Make the fixed frame at `offset` of a physical object resident.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if the object is gone.
    /// - [`VmError::InvalidArgument`] if the object is not physical or the
    ///   offset is outside it.
    pub fn resident_fixed(
        &mut self,
        id: VmObjectId,
        offset: u32,
    ) -> Result<PhysicalPage<Size4K>, VmError> {
        let object = self.get_mut(id).ok_or(VmError::NotFound)?;
        if offset >= object.size {
            return Err(VmError::InvalidArgument);
        }
        let frame = object
            .pager
            .fixed_frame(offset)
            .ok_or(VmError::InvalidArgument)?;
        object
            .pages
            .entry(offset)
            .or_insert_with(|| VmPage::new(frame, offset));
        Ok(frame)
    }

    /// Grow or shrink an object. Pages past the new end are freed.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if the object is gone.
    /// - [`VmError::InvalidArgument`] for a zero or unaligned size, or when
    ///   growing a physical object.
    pub fn set_size<A: FrameAlloc + ?Sized>(
        &mut self,
        id: VmObjectId,
        size: u32,
        frames: &mut A,
    ) -> Result<(), VmError> {
        check_size(size)?;
        let object = self.get_mut(id).ok_or(VmError::NotFound)?;
        if !object.pager.owns_frames() && size > object.size {
            return Err(VmError::InvalidArgument);
        }
        let cut = object.pages.split_off(&size);
        if object.pager.owns_frames() {
            for page in cut.values() {
                frames.free_4k(page.frame());
            }
        }
        object.size = size;
        Ok(())
    }
}

const fn check_size(size: u32) -> Result<(), VmError> {
    if size == 0 || !is_aligned::<Size4K>(size) {
        Err(VmError::InvalidArgument)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::testing::{BumpAlloc, TestPhys};

    const BASE: u32 = 0x0100_0000;

    fn frames(count: u32) -> BumpAlloc {
        BumpAlloc::new(PhysicalAddress::new(BASE), count)
    }

    #[test]
    fn last_reference_frees_pages_and_invalidates_handle() {
        let mut objects = VmObjects::with_capacity(8);
        let mut alloc = frames(8);
        let id = objects.create(ObjectKind::Anonymous, 4 * 4096).unwrap();
        let a = objects.allocate(id, 0, &mut alloc).unwrap();
        let b = objects.allocate(id, 0x3000, &mut alloc).unwrap();

        objects.inc_ref(id).unwrap();
        objects.dec_ref(id, &mut alloc).unwrap();
        assert_eq!(objects.get(id).unwrap().ref_count(), 1);
        assert!(alloc.freed().is_empty());

        objects.dec_ref(id, &mut alloc).unwrap();
        assert_eq!(alloc.freed(), [a, b]);
        assert!(objects.get(id).is_none());
        assert_eq!(objects.dec_ref(id, &mut alloc), Err(VmError::NotFound));

        // The slot is reused, the stale handle stays dead.
        let again = objects.create(ObjectKind::Anonymous, 4096).unwrap();
        assert_ne!(again, id);
        assert!(objects.get(id).is_none());
    }

    #[test]
    fn allocate_validates_offsets() {
        let mut objects = VmObjects::with_capacity(8);
        let mut alloc = frames(8);
        let id = objects.create(ObjectKind::Anonymous, 2 * 4096).unwrap();

        objects.allocate(id, 0x1000, &mut alloc).unwrap();
        assert_eq!(
            objects.allocate(id, 0x1000, &mut alloc),
            Err(VmError::AlreadyExists)
        );
        assert_eq!(
            objects.allocate(id, 0x2000, &mut alloc),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            objects.allocate(id, 0x10, &mut alloc),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(objects.lookup(id, 0x1000).unwrap().offset(), 0x1000);
        assert!(objects.lookup(id, 0).is_none());
    }

    #[test]
    fn allocate_reports_exhaustion() {
        let mut objects = VmObjects::with_capacity(8);
        let mut alloc = frames(1);
        let id = objects.create(ObjectKind::Anonymous, 2 * 4096).unwrap();
        objects.allocate(id, 0, &mut alloc).unwrap();
        assert_eq!(
            objects.allocate(id, 0x1000, &mut alloc),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(objects.get(id).unwrap().resident_count(), 1);
    }

    #[test]
    fn arena_capacity_is_enforced() {
        let mut objects = VmObjects::with_capacity(2);
        objects.create(ObjectKind::Anonymous, 4096).unwrap();
        let b = objects.create(ObjectKind::Vnode, 4096).unwrap();
        assert_eq!(
            objects.create(ObjectKind::Anonymous, 4096),
            Err(VmError::OutOfMemory)
        );
        objects.dec_ref(b, &mut frames(0)).unwrap();
        assert!(objects.create(ObjectKind::Anonymous, 4096).is_ok());
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn shadow_chain_lookup_applies_offsets() {
        let mut objects = VmObjects::with_capacity(8);
        let mut alloc = frames(8);
        let base = objects.create(ObjectKind::Anonymous, 4 * 4096).unwrap();
        let frame = objects.allocate(base, 0x2000, &mut alloc).unwrap();

        let shadow = objects.create_shadow(base, 0x1000).unwrap();
        assert_eq!(objects.get(shadow).unwrap().size(), 3 * 4096);
        assert_eq!(objects.get(base).unwrap().ref_count(), 2);

        assert!(objects.lookup(shadow, 0x1000).is_none());
        let hit = objects.lookup_chain(shadow, 0x1000).unwrap();
        assert_eq!(
            hit,
            ChainHit {
                object: base,
                offset: 0x2000,
                depth: 1,
                frame
            }
        );
        assert_eq!(objects.backing(shadow, 0), Some((base, 0x1000, 1)));
        assert!(objects.lookup_chain(shadow, 0).is_none());

        // A page in the shadow hides the parent's.
        let own = objects.allocate(shadow, 0x1000, &mut alloc).unwrap();
        let hit = objects.lookup_chain(shadow, 0x1000).unwrap();
        assert_eq!((hit.object, hit.depth, hit.frame), (shadow, 0, own));
    }

    #[test]
    fn shadow_offsets_are_validated() {
        let mut objects = VmObjects::with_capacity(8);
        let base = objects.create(ObjectKind::Anonymous, 2 * 4096).unwrap();
        assert_eq!(
            objects.create_shadow(base, 0x2000),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            objects.create_shadow(base, 0x800),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(objects.get(base).unwrap().ref_count(), 1);
    }

    #[test]
    fn releasing_a_long_chain_frees_everything() {
        let mut objects = VmObjects::with_capacity(2048);
        let mut alloc = frames(2048);
        let mut top = objects.create(ObjectKind::Anonymous, 4096).unwrap();
        objects.allocate(top, 0, &mut alloc).unwrap();
        for _ in 0..1000 {
            let shadow = objects.create_shadow(top, 0).unwrap();
            objects.allocate(shadow, 0, &mut alloc).unwrap();
            // The shadow now holds the only reference to its parent.
            objects.dec_ref(top, &mut alloc).unwrap();
            top = shadow;
        }
        assert_eq!(objects.len(), 1001);
        assert_eq!(alloc.allocated(), 1001);

        objects.dec_ref(top, &mut alloc).unwrap();
        assert!(objects.is_empty());
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn physical_objects_never_own_frames() {
        let mut objects = VmObjects::with_capacity(8);
        let mut alloc = frames(8);
        let id = objects
            .create_physical(ObjectKind::Device, PhysicalAddress::new(0xFEE0_0000), 0x2000)
            .unwrap();
        assert!(!objects.get(id).unwrap().kind().is_copy_on_write());
        assert_eq!(
            objects.allocate(id, 0, &mut alloc),
            Err(VmError::InvalidArgument)
        );
        let frame = objects.resident_fixed(id, 0x1000).unwrap();
        assert_eq!(frame.base(), PhysicalAddress::new(0xFEE0_1000));
        assert_eq!(
            objects.resident_fixed(id, 0x2000),
            Err(VmError::InvalidArgument)
        );

        objects.dec_ref(id, &mut alloc).unwrap();
        assert!(alloc.freed().is_empty());

        assert_eq!(
            objects.create(ObjectKind::Physical, 4096),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            objects.create_physical(ObjectKind::Anonymous, PhysicalAddress::zero(), 4096),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn pagers_fill_frames() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 1);
        let frame = PhysicalPage::from_index(BASE / 4096);
        phys.write(frame.base(), &[0xAA; 16]);
        Pager::Unwired.page_in(&phys, frame, 0);
        assert_eq!(phys.read(frame.base(), 16), [0; 16]);
        assert!(Pager::ZeroFill.owns_frames());
        assert_eq!(Pager::ZeroFill.fixed_frame(0), None);
    }

    #[test]
    fn shrinking_frees_pages_past_the_end() {
        let mut objects = VmObjects::with_capacity(8);
        let mut alloc = frames(8);
        let id = objects.create(ObjectKind::Anonymous, 3 * 4096).unwrap();
        objects.allocate(id, 0, &mut alloc).unwrap();
        let tail = objects.allocate(id, 0x2000, &mut alloc).unwrap();

        objects.set_size(id, 0x1000, &mut alloc).unwrap();
        assert_eq!(alloc.freed(), [tail]);
        assert_eq!(objects.get(id).unwrap().resident_count(), 1);
        objects.set_size(id, 0x4000, &mut alloc).unwrap();
        assert_eq!(objects.get(id).unwrap().size(), 0x4000);
    }
}
