//! # Memory Layout

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// First virtual address handed out to user regions.
pub const USERSPACE_START: u32 = 0x0000_0000;

/// Kernel/user split. Addresses at or above this value are kernel-only.
pub const KERNEL_SPLIT: u32 = 0xC000_0000;

/// End (exclusive) of the user VA range.
pub const USERSPACE_END: u32 = KERNEL_SPLIT;

/// End (exclusive) of the kernel VA range. The last page-directory slot
/// (`0xFFC0_0000..`) is kept free for temporary mappings.
pub const KERNEL_SPACE_END: u32 = 0xFFC0_0000;

/// Base of the direct map: physical address `pa` is visible at
/// `PHYS_MAP_BASE + pa` for every `pa < PHYS_MAP_LIMIT`.
pub const PHYS_MAP_BASE: u32 = KERNEL_SPLIT;

/// Amount of physical memory reachable through the direct map. The kernel
/// address range above `PHYS_MAP_BASE + PHYS_MAP_LIMIT` is left for kernel
/// regions placed by the memory manager.
pub const PHYS_MAP_LIMIT: u32 = 0x3000_0000; // 768 MiB

/// Where the kernel image is loaded in *physical* memory.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u32 = PHYS_MAP_BASE + PHYS_LOAD;

/// Physical memory below this address holds the kernel image and early boot
/// structures and is never handed out by the frame allocator.
pub const KERNEL_IMAGE_RESERVED: u32 = 16 * 1024 * 1024;

/// Default capacity of the VM object table.
pub const DEFAULT_MAX_VM_OBJECTS: usize = 4096;

const _: () = {
    assert!(KERNEL_SPLIT.is_multiple_of(4 * 1024 * 1024));
    assert!(KERNEL_SPACE_END.is_multiple_of(4 * 1024 * 1024));
    assert!(KERNEL_SPACE_END > KERNEL_SPLIT);
    assert!(USERSPACE_START < USERSPACE_END);
    assert!(KERNEL_IMAGE_RESERVED.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_BASE > PHYS_MAP_BASE);
    assert!(PHYS_MAP_LIMIT.is_multiple_of(4 * 1024 * 1024));
    assert!(PHYS_MAP_BASE + PHYS_MAP_LIMIT < KERNEL_SPACE_END);
    assert!(PHYS_LOAD < KERNEL_IMAGE_RESERVED);
};
