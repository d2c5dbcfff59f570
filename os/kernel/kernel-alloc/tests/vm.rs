use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::vmm::{
    MapAt, MapRequest, ObjectKind, PageFaultError, RegionFlags, SpaceRef, Vm, VmConfig, VmError,
    VmProt,
};
use kernel_info::boot::{BootMemoryMap, BootMemoryRegion};
use kernel_info::memory::{KERNEL_SPLIT, PHYS_MAP_BASE, USERSPACE_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::Mmu;
use kernel_vmem::testing::{RecordingMmu, TestPhys};

const BASE: u32 = 0x0100_0000;
const PAGE: u32 = 4096;

const RW_USER: VmProt = VmProt::READ.union(VmProt::WRITE).union(VmProt::USER);
const RO_USER: VmProt = VmProt::READ.union(VmProt::USER);
const USER_WRITE: VmProt = VmProt::WRITE.union(VmProt::USER);
const USER_READ: VmProt = VmProt::READ.union(VmProt::USER);

/// Simulated RAM at 16 MiB, all of it handed to the frame allocator.
struct Machine {
    phys: TestPhys,
    frames: SpinLock<BitmapFrameAlloc>,
}

impl Machine {
    fn new(frames: u32) -> Self {
        let regions = [BootMemoryRegion::usable(
            u64::from(BASE),
            u64::from(frames) * u64::from(PAGE),
        )];
        Self {
            phys: TestPhys::new(PhysicalAddress::new(BASE), frames as usize),
            frames: SpinLock::new(BitmapFrameAlloc::from_memory_map(BootMemoryMap::new(
                &regions,
            ))),
        }
    }

    fn free(&self) -> u32 {
        self.frames.lock().free_count()
    }

    fn boot(&self, mmu: &mut RecordingMmu) -> Vm<'_, TestPhys> {
        // Safety: the recording MMU never drives a real CPU.
        self.boot_with(mmu, unsafe { VmConfig::without_direct_map() })
    }

    fn boot_with(&self, mmu: &mut RecordingMmu, config: VmConfig) -> Vm<'_, TestPhys> {
        Vm::new(&self.phys, &self.frames, mmu, config).unwrap()
    }
}

fn mmu() -> RecordingMmu {
    RecordingMmu::new(PhysicalPage::from_index(0))
}

fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

#[test]
fn map_fault_resolve_unmap() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();

    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            PAGE,
            RW_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    assert_eq!(base, va(USERSPACE_START));
    assert_eq!(vm.resolve(&space, base), None);

    vm.fault(&mut mmu, SpaceRef::User(&mut space), base + 0x10, USER_WRITE)
        .unwrap();
    let pa = vm.resolve(&space, base + 0x10).unwrap();
    assert_eq!(pa.as_u32() & 0xFFF, 0x10);
    assert_eq!(m.phys.read(pa, 16), [0; 16]);

    let region = space.find(base).unwrap();
    let page = vm.objects().lookup(region.object(), 0).unwrap();
    assert_eq!(page.ref_count(), 1);
    assert!(page.is_dirty());

    mmu.clear();
    vm.unmap_region(&mut mmu, SpaceRef::User(&mut space), base, PAGE)
        .unwrap();
    assert_eq!(vm.resolve(&space, base), None);
    assert!(space.regions().is_empty());
    assert!(mmu.invalidations().contains(&base.page()));
    assert!(vm.objects().is_empty());

    vm.destroy_space(&mut mmu, space);
}

#[test]
fn faults_outside_regions_or_permissions_fail() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();

    assert_eq!(
        vm.fault(&mut mmu, SpaceRef::User(&mut space), va(0x1000), USER_READ),
        Err(VmError::NotFound)
    );

    let ro = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            PAGE,
            RO_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    assert_eq!(
        vm.fault(&mut mmu, SpaceRef::User(&mut space), ro, USER_WRITE),
        Err(VmError::PermissionDenied)
    );

    let kernel_only = VmProt::READ | VmProt::WRITE;
    let supervisor = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            PAGE,
            kernel_only,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    assert_eq!(
        vm.fault(&mut mmu, SpaceRef::User(&mut space), supervisor, USER_READ),
        Err(VmError::PermissionDenied)
    );
    vm.fault(&mut mmu, SpaceRef::User(&mut space), supervisor, VmProt::READ)
        .unwrap();

    // Read faults on a read-only region map the page without write access.
    vm.fault(&mut mmu, SpaceRef::User(&mut space), ro, USER_READ).unwrap();
    let (_, bits) = space.pmap().entry(&m.phys, ro).unwrap();
    assert!(bits.user_access() && !bits.writable());

    vm.destroy_space(&mut mmu, space);
}

#[test]
fn cpu_error_codes_drive_the_fault_path() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();
    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            PAGE,
            RW_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();

    // Not present, write, user mode.
    let error = PageFaultError::from_bits(0b110);
    vm.handle_page_fault(&mut mmu, SpaceRef::User(&mut space), base, error)
        .unwrap();
    let (_, bits) = space.pmap().entry(&m.phys, base).unwrap();
    assert!(bits.writable());

    vm.destroy_space(&mut mmu, space);
}

#[test]
fn fork_shares_until_written() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut parent = vm.create_space().unwrap();

    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut parent),
            MapAt::Auto,
            2 * PAGE,
            RW_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    vm.fault(&mut mmu, SpaceRef::User(&mut parent), base, USER_WRITE)
        .unwrap();
    let original = vm.resolve(&parent, base).unwrap();
    m.phys.write(original, b"parent");

    let mut child = vm.fork_space(&mut mmu, &mut parent).unwrap();
    assert_eq!(child.regions().len(), 1);
    let (theirs, ours) = (child.find(base).unwrap(), parent.find(base).unwrap());
    assert_eq!((theirs.base(), theirs.end()), (ours.base(), ours.end()));
    assert_ne!(theirs.object(), ours.object());

    // The parent keeps its translation, now read-only.
    let (_, bits) = parent.pmap().entry(&m.phys, base).unwrap();
    assert!(!bits.writable());
    assert_eq!(vm.resolve(&parent, base), Some(original));

    // Reads in the child see the same frame, read-only.
    vm.fault(&mut mmu, SpaceRef::User(&mut child), base, USER_READ)
        .unwrap();
    assert_eq!(vm.resolve(&child, base), Some(original));
    let (_, bits) = child.pmap().entry(&m.phys, base).unwrap();
    assert!(!bits.writable());

    // Writes give each side its own copy.
    vm.fault(&mut mmu, SpaceRef::User(&mut child), base, USER_WRITE)
        .unwrap();
    let child_copy = vm.resolve(&child, base).unwrap();
    assert_ne!(child_copy, original);
    assert_eq!(m.phys.read(child_copy, 6), b"parent");
    m.phys.write(child_copy, b"child!");

    vm.fault(&mut mmu, SpaceRef::User(&mut parent), base, USER_WRITE)
        .unwrap();
    let parent_copy = vm.resolve(&parent, base).unwrap();
    assert_ne!(parent_copy, original);
    assert_ne!(parent_copy, child_copy);
    assert_eq!(m.phys.read(parent_copy, 6), b"parent");
    assert_eq!(m.phys.read(child_copy, 6), b"child!");

    // The untouched page reads as zero on both sides.
    let second = base + PAGE;
    vm.fault(&mut mmu, SpaceRef::User(&mut child), second, USER_READ)
        .unwrap();
    let zero = vm.resolve(&child, second).unwrap();
    assert_eq!(m.phys.read(zero, 8), [0; 8]);

    vm.destroy_space(&mut mmu, child);
    vm.destroy_space(&mut mmu, parent);
}

#[test]
fn failed_fork_leaves_the_parent_intact() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    // Two objects for the regions, two for the shadows of the first one.
    // Safety: the recording MMU never drives a real CPU.
    let config = unsafe { VmConfig::without_direct_map() }.with_max_objects(4);
    let mut vm = m.boot_with(&mut mmu, config);
    let before = m.free();
    let mut parent = vm.create_space().unwrap();

    let mut bases = [va(0); 2];
    for (i, base) in bases.iter_mut().enumerate() {
        let at = MapAt::Fixed(va(0x1000_0000 * (i as u32 + 1)));
        *base = vm
            .map_anonymous(
                &mut mmu,
                SpaceRef::User(&mut parent),
                at,
                PAGE,
                RW_USER,
                RegionFlags::PRIVATE,
            )
            .unwrap();
        vm.fault(&mut mmu, SpaceRef::User(&mut parent), *base, USER_WRITE)
            .unwrap();
    }
    let [first, second] = bases;
    m.phys.write(vm.resolve(&parent, first).unwrap(), b"first");
    m.phys.write(vm.resolve(&parent, second).unwrap(), b"second");

    assert_eq!(
        vm.fork_space(&mut mmu, &mut parent).err(),
        Some(VmError::OutOfMemory)
    );
    assert_eq!(parent.regions().len(), 2);
    assert!(parent.regions().is_well_formed());
    assert_eq!(mmu.active_root(), PhysicalPage::from_index(0));

    // The first region was shadowed before the failure; writing copies it.
    vm.fault(&mut mmu, SpaceRef::User(&mut parent), first, USER_WRITE)
        .unwrap();
    vm.fault(&mut mmu, SpaceRef::User(&mut parent), second, USER_WRITE)
        .unwrap();
    assert_eq!(m.phys.read(vm.resolve(&parent, first).unwrap(), 5), b"first");
    assert_eq!(m.phys.read(vm.resolve(&parent, second).unwrap(), 6), b"second");

    vm.destroy_space(&mut mmu, parent);
    assert!(vm.objects().is_empty());
    assert_eq!(m.free(), before);
}

#[test]
fn forked_wired_regions_are_copied_up_front() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let before = m.free();
    let mut parent = vm.create_space().unwrap();

    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut parent),
            MapAt::Auto,
            2 * PAGE,
            RW_USER,
            RegionFlags::PRIVATE | RegionFlags::WIRED,
        )
        .unwrap();
    let original = vm.resolve(&parent, base).unwrap();
    m.phys.write(original, b"wired");

    let child = vm.fork_space(&mut mmu, &mut parent).unwrap();

    // The parent keeps its writable translation.
    let (_, bits) = parent.pmap().entry(&m.phys, base).unwrap();
    assert!(bits.writable());
    assert_eq!(vm.resolve(&parent, base), Some(original));

    // The child owns resident, writable copies of every page.
    let object = child.find(base).unwrap().object();
    assert_ne!(object, parent.find(base).unwrap().object());
    for i in 0..2 {
        let (_, bits) = child.pmap().entry(&m.phys, base + i * PAGE).unwrap();
        assert!(bits.writable());
        assert!(vm.objects().lookup(object, i * PAGE).unwrap().is_wired());
    }
    let copy = vm.resolve(&child, base).unwrap();
    assert_ne!(copy, original);
    assert_eq!(m.phys.read(copy, 5), b"wired");
    assert_eq!(m.phys.read(vm.resolve(&child, base + PAGE).unwrap(), 4), [0; 4]);

    vm.destroy_space(&mut mmu, child);
    vm.destroy_space(&mut mmu, parent);
    assert!(vm.objects().is_empty());
    assert_eq!(m.free(), before);
}

#[test]
fn fork_shares_shared_regions_verbatim() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut parent = vm.create_space().unwrap();

    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut parent),
            MapAt::Auto,
            PAGE,
            RW_USER,
            RegionFlags::SHARED,
        )
        .unwrap();
    vm.fault(&mut mmu, SpaceRef::User(&mut parent), base, USER_WRITE)
        .unwrap();

    let mut child = vm.fork_space(&mut mmu, &mut parent).unwrap();
    assert_eq!(
        child.find(base).unwrap().object(),
        parent.find(base).unwrap().object()
    );
    let (_, bits) = parent.pmap().entry(&m.phys, base).unwrap();
    assert!(bits.writable());

    vm.fault(&mut mmu, SpaceRef::User(&mut child), base, USER_WRITE)
        .unwrap();
    assert_eq!(vm.resolve(&child, base), vm.resolve(&parent, base));

    vm.destroy_space(&mut mmu, child);
    vm.destroy_space(&mut mmu, parent);
}

#[test]
fn destroying_spaces_returns_every_frame() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let before = m.free();

    let mut parent = vm.create_space().unwrap();
    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut parent),
            MapAt::Auto,
            4 * PAGE,
            RW_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    for i in 0..4 {
        vm.fault(&mut mmu, SpaceRef::User(&mut parent), base + i * PAGE, USER_WRITE)
            .unwrap();
    }
    let far = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut parent),
            MapAt::Fixed(va(0x4000_0000)),
            PAGE,
            RW_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    vm.fault(&mut mmu, SpaceRef::User(&mut parent), far, USER_WRITE)
        .unwrap();

    let mut child = vm.fork_space(&mut mmu, &mut parent).unwrap();
    vm.fault(&mut mmu, SpaceRef::User(&mut child), base, USER_WRITE)
        .unwrap();
    vm.fault(&mut mmu, SpaceRef::User(&mut child), base + PAGE, USER_READ)
        .unwrap();
    assert!(m.free() < before);

    vm.activate(&mut mmu, SpaceRef::User(&mut child));
    assert_eq!(mmu.active_root(), child.pmap().root());
    vm.destroy_space(&mut mmu, child);
    assert_eq!(mmu.active_root(), vm.kernel_space().pmap().root());

    assert_eq!(vm.destroy_space(&mut mmu, parent), 2);
    assert_eq!(m.free(), before);
    assert!(vm.objects().is_empty());
}

#[test]
fn protect_splits_and_rejoins_regions() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();
    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            3 * PAGE,
            RW_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    for i in 0..3 {
        vm.fault(&mut mmu, SpaceRef::User(&mut space), base + i * PAGE, USER_WRITE)
            .unwrap();
    }
    let middle = base + PAGE;
    let frame = vm.resolve(&space, middle).unwrap();

    vm.protect_region(&mut mmu, SpaceRef::User(&mut space), middle, PAGE, RO_USER)
        .unwrap();
    assert_eq!(space.regions().len(), 3);
    assert!(!space.pmap().entry(&m.phys, middle).unwrap().1.writable());
    assert!(space.pmap().entry(&m.phys, base).unwrap().1.writable());
    assert_eq!(
        vm.fault(&mut mmu, SpaceRef::User(&mut space), middle, USER_WRITE),
        Err(VmError::PermissionDenied)
    );

    vm.protect_region(&mut mmu, SpaceRef::User(&mut space), middle, PAGE, RW_USER)
        .unwrap();
    assert_eq!(space.regions().len(), 1);
    assert_eq!(vm.resolve(&space, middle), None);
    vm.fault(&mut mmu, SpaceRef::User(&mut space), middle, USER_WRITE)
        .unwrap();
    assert_eq!(vm.resolve(&space, middle), Some(frame));

    assert_eq!(
        vm.protect_region(&mut mmu, SpaceRef::User(&mut space), base, 4 * PAGE, RO_USER),
        Err(VmError::NotFound)
    );
    vm.destroy_space(&mut mmu, space);
}

#[test]
fn unmapping_part_of_a_region_splits_it() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();
    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            3 * PAGE,
            RW_USER,
            RegionFlags::PRIVATE,
        )
        .unwrap();
    vm.fault(&mut mmu, SpaceRef::User(&mut space), base + 2 * PAGE, USER_WRITE)
        .unwrap();
    let tail = vm.resolve(&space, base + 2 * PAGE).unwrap();

    vm.unmap_region(&mut mmu, SpaceRef::User(&mut space), base + PAGE, PAGE)
        .unwrap();
    assert_eq!(space.regions().len(), 2);
    assert_eq!(space.find(base + 2 * PAGE).unwrap().offset(), 2 * PAGE);
    assert_eq!(vm.resolve(&space, base + 2 * PAGE), Some(tail));

    assert_eq!(
        vm.unmap_region(&mut mmu, SpaceRef::User(&mut space), base + PAGE, PAGE),
        Err(VmError::NotFound)
    );
    assert_eq!(
        vm.unmap_region(&mut mmu, SpaceRef::User(&mut space), base + 0x10, PAGE),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        vm.unmap_region(&mut mmu, SpaceRef::User(&mut space), base, 0),
        Err(VmError::InvalidArgument)
    );
    vm.destroy_space(&mut mmu, space);
}

#[test]
fn fixed_mappings_are_validated() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();
    let object = vm.create_object(ObjectKind::Anonymous, 4 * PAGE).unwrap();
    let at = va(0x0040_0000);

    let request = MapRequest::fixed(at, object, 2 * PAGE, RW_USER, RegionFlags::PRIVATE);
    assert_eq!(vm.map_region(&mut mmu, SpaceRef::User(&mut space), request), Ok(at));
    assert!(space.find(at).unwrap().flags().contains(RegionFlags::FIXED));
    assert_eq!(vm.objects().get(object).unwrap().ref_count(), 2);

    let overlapping = MapRequest::fixed(at + PAGE, object, 2 * PAGE, RW_USER, RegionFlags::PRIVATE);
    let kernel_half = MapRequest::fixed(
        va(KERNEL_SPLIT),
        object,
        PAGE,
        RW_USER,
        RegionFlags::PRIVATE,
    );
    let both = MapRequest::anywhere(
        object,
        PAGE,
        RW_USER,
        RegionFlags::PRIVATE | RegionFlags::SHARED,
    );
    let too_long = MapRequest::anywhere(
        object,
        4 * PAGE,
        RW_USER,
        RegionFlags::PRIVATE,
    )
    .with_offset(PAGE);
    let unaligned = MapRequest::anywhere(object, 0x800, RW_USER, RegionFlags::PRIVATE);

    for (request, error) in [
        (overlapping, VmError::AlreadyExists),
        (kernel_half, VmError::InvalidArgument),
        (both, VmError::InvalidArgument),
        (too_long, VmError::InvalidArgument),
        (unaligned, VmError::InvalidArgument),
    ] {
        assert_eq!(
            vm.map_region(&mut mmu, SpaceRef::User(&mut space), request),
            Err(error)
        );
    }
    assert_eq!(vm.objects().get(object).unwrap().ref_count(), 2);
    assert_eq!(space.regions().len(), 1);

    // The next range of the same object at the next address joins the region.
    let next = MapRequest::fixed(at + 2 * PAGE, object, PAGE, RW_USER, RegionFlags::PRIVATE)
        .with_offset(2 * PAGE);
    vm.map_region(&mut mmu, SpaceRef::User(&mut space), next)
        .unwrap();
    assert_eq!(space.regions().len(), 1);
    assert_eq!(space.find(at).unwrap().size(), 3 * PAGE);

    vm.release_object(object).unwrap();
    vm.destroy_space(&mut mmu, space);
    assert!(vm.objects().is_empty());
}

#[test]
fn resize_grows_and_shrinks_in_place() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();
    let at = va(0x0040_0000);
    vm.map_anonymous(
        &mut mmu,
        SpaceRef::User(&mut space),
        MapAt::Fixed(at),
        2 * PAGE,
        RW_USER,
        RegionFlags::PRIVATE,
    )
    .unwrap();

    vm.resize_region(&mut mmu, SpaceRef::User(&mut space), at, 4 * PAGE)
        .unwrap();
    let region = space.find(at).unwrap();
    assert_eq!(region.size(), 4 * PAGE);
    assert_eq!(vm.objects().get(region.object()).unwrap().size(), 4 * PAGE);
    vm.fault(&mut mmu, SpaceRef::User(&mut space), at + 3 * PAGE, USER_WRITE)
        .unwrap();

    vm.resize_region(&mut mmu, SpaceRef::User(&mut space), at, PAGE)
        .unwrap();
    assert_eq!(space.find(at).unwrap().size(), PAGE);
    assert_eq!(vm.resolve(&space, at + 3 * PAGE), None);

    vm.map_anonymous(
        &mut mmu,
        SpaceRef::User(&mut space),
        MapAt::Fixed(at + 2 * PAGE),
        PAGE,
        RO_USER,
        RegionFlags::PRIVATE,
    )
    .unwrap();
    assert_eq!(
        vm.resize_region(&mut mmu, SpaceRef::User(&mut space), at, 3 * PAGE),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(
        vm.resize_region(&mut mmu, SpaceRef::User(&mut space), at + PAGE, PAGE),
        Err(VmError::NotFound)
    );
    vm.destroy_space(&mut mmu, space);
}

#[test]
fn wired_regions_are_populated_up_front() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();

    let base = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            2 * PAGE,
            RW_USER,
            RegionFlags::PRIVATE | RegionFlags::WIRED,
        )
        .unwrap();
    let object = space.find(base).unwrap().object();
    for i in 0..2 {
        assert!(vm.resolve(&space, base + i * PAGE).is_some());
        assert!(vm.objects().lookup(object, i * PAGE).unwrap().is_wired());
    }
    vm.destroy_space(&mut mmu, space);
}

#[test]
fn failed_wiring_leaves_nothing_behind() {
    // Kernel directory, user directory and one page table leave five frames.
    let m = Machine::new(8);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();

    assert_eq!(
        vm.map_anonymous(
            &mut mmu,
            SpaceRef::User(&mut space),
            MapAt::Auto,
            8 * PAGE,
            RW_USER,
            RegionFlags::PRIVATE | RegionFlags::WIRED,
        ),
        Err(VmError::OutOfMemory)
    );
    assert!(space.regions().is_empty());
    assert!(vm.objects().is_empty());
    assert_eq!(m.free(), 5);
    vm.destroy_space(&mut mmu, space);
    assert_eq!(m.free(), 7);
}

#[test]
fn kernel_faults_in_user_space_link_the_kernel_table() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let mut space = vm.create_space().unwrap();

    let kva = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::Kernel,
            MapAt::Auto,
            PAGE,
            VmProt::READ | VmProt::WRITE,
            RegionFlags::SHARED,
        )
        .unwrap();
    assert_eq!(kva, va(KERNEL_SPLIT));
    assert_eq!(space.pmap().extract(&m.phys, kva), None);

    vm.fault(&mut mmu, SpaceRef::User(&mut space), kva, VmProt::WRITE)
        .unwrap();
    let pa = vm.resolve(vm.kernel_space(), kva).unwrap();
    assert_eq!(space.pmap().extract(&m.phys, kva), Some(pa));
    assert_eq!(vm.resolve(&space, kva), Some(pa));

    // The user directory borrowed the table; destroying it leaves it alone.
    vm.destroy_space(&mut mmu, space);
    assert_eq!(vm.resolve(vm.kernel_space(), kva), Some(pa));
}

#[test]
fn device_memory_is_mapped_uncached_and_never_freed() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot(&mut mmu);
    let device = PhysicalAddress::new(BASE + 63 * PAGE);

    let object = vm
        .create_physical_object(ObjectKind::Device, device, PAGE)
        .unwrap();
    let request = MapRequest::anywhere(
        object,
        PAGE,
        VmProt::READ | VmProt::WRITE,
        RegionFlags::SHARED | RegionFlags::DEVICE,
    );
    let kva = vm.map_region(&mut mmu, SpaceRef::Kernel, request).unwrap();
    vm.release_object(object).unwrap();

    vm.fault(&mut mmu, SpaceRef::Kernel, kva + 4, VmProt::WRITE)
        .unwrap();
    assert_eq!(vm.resolve(vm.kernel_space(), kva + 4), Some(device + 4));
    let (_, bits) = vm.kernel_space().pmap().entry(&m.phys, kva).unwrap();
    assert!(bits.cache_disabled() && bits.writable());

    let free = m.free();
    vm.unmap_region(&mut mmu, SpaceRef::Kernel, kva, PAGE).unwrap();
    assert_eq!(m.free(), free);
    assert!(vm.objects().is_empty());
}

#[test]
fn kernel_regions_never_alias_the_direct_map() {
    let m = Machine::new(64);
    let mut mmu = mmu();
    let mut vm = m.boot_with(&mut mmu, VmConfig::default());
    let managed = m.frames.lock().total_frames() * PAGE;
    let kdir = vm.kernel_space().pmap().root().base();

    // Building the kernel directory never loaded it.
    assert!(mmu.loads().is_empty());
    let alias = va(PHYS_MAP_BASE + kdir.as_u32());
    assert_eq!(vm.resolve(vm.kernel_space(), alias), Some(kdir));

    let kva = vm
        .map_anonymous(
            &mut mmu,
            SpaceRef::Kernel,
            MapAt::Auto,
            PAGE,
            VmProt::READ | VmProt::WRITE,
            RegionFlags::SHARED,
        )
        .unwrap();
    assert_eq!(kva, va(PHYS_MAP_BASE + managed));

    vm.fault(&mut mmu, SpaceRef::Kernel, kva, VmProt::WRITE)
        .unwrap();
    let backing = vm.resolve(vm.kernel_space(), kva).unwrap();
    assert_ne!(kva, va(PHYS_MAP_BASE + backing.as_u32()));
    assert_eq!(vm.resolve(vm.kernel_space(), alias), Some(kdir));
    assert!(mmu.loads().is_empty());
}
