//! # Per-CPU Translation Context
//!
//! The page-table code never reaches for "the current address space" through
//! global state. Every operation that loads CR3 or invalidates a TLB entry
//! takes the CPU's [`Mmu`] explicitly.

use crate::{Pmap, PmapKind};
#[cfg(all(target_arch = "x86", feature = "asm"))]
use kernel_memory_addresses::VirtualAddress;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};

/// The translation state of one CPU.
pub trait Mmu {
    /// Root (page directory frame) currently loaded on this CPU.
    fn active_root(&self) -> PhysicalPage<Size4K>;

    /// Load a new root.
    ///
    /// # Safety
    /// `root` must be a page directory that maps the currently executing
    /// kernel code, stack and data at their current addresses.
    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>);

    /// Drop the TLB entry for `page` on this CPU.
    fn invalidate_page(&mut self, page: VirtualPage<Size4K>);
}

/// A pmap temporarily made active on one CPU.
///
/// Created by the pmap editing operations; dropping it reloads whatever root
/// was active before, so every early return restores the caller's space.
///
/// Kernel pmaps are never switched in. Their page tables are shared by
/// every directory, so their edits are invalidated on whatever root is
/// active, and a kernel directory that is still being built is never
/// loaded.
pub struct ActivePmap<'c, C: Mmu + ?Sized> {
    mmu: &'c mut C,
    previous: Option<PhysicalPage<Size4K>>,
}

impl<'c, C: Mmu + ?Sized> ActivePmap<'c, C> {
    pub(crate) fn new(mmu: &'c mut C, pmap: &Pmap) -> Self {
        let current = mmu.active_root();
        let previous = if pmap.kind() == PmapKind::Kernel || current == pmap.root() {
            None
        } else {
            // Safety: a user directory links the kernel half of the kernel
            // pmap it was created from, which maps the running kernel.
            unsafe { mmu.load_root(pmap.root()) };
            Some(current)
        };
        Self { mmu, previous }
    }

    #[inline]
    pub fn invalidate(&mut self, page: VirtualPage<Size4K>) {
        self.mmu.invalidate_page(page);
    }
}

impl<C: Mmu + ?Sized> Drop for ActivePmap<'_, C> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Safety: `previous` was active when the guard was created.
            unsafe { self.mmu.load_root(previous) };
        }
    }
}

/// The real MMU of the executing CPU (CR3 and `invlpg`).
#[cfg(all(target_arch = "x86", feature = "asm"))]
pub struct X86Mmu {
    _private: (),
}

#[cfg(all(target_arch = "x86", feature = "asm"))]
impl X86Mmu {
    /// # Safety
    /// At most one `X86Mmu` may exist per CPU, and it must only be used on
    /// the CPU it was created on.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    /// Sets CR0.WP so supervisor writes honor read-only entries, which
    /// copy-on-write relies on.
    ///
    /// # Safety
    /// Paging must already be enabled on this CPU.
    pub unsafe fn enable_write_protect(&mut self) {
        use kernel_registers::cr0::Cr0;
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

        unsafe {
            let cr0 = Cr0::load_unsafe();
            if !cr0.wp_write_protect() {
                cr0.with_wp_write_protect(true).store_unsafe();
            }
        }
    }

    /// Linear address of the most recent page fault.
    ///
    /// # Safety
    /// Call from the #PF handler before anything else can fault.
    #[must_use]
    pub unsafe fn fault_address(&self) -> VirtualAddress {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr2::Cr2;

        unsafe { Cr2::load_unsafe() }.fault_address()
    }
}

#[cfg(all(target_arch = "x86", feature = "asm"))]
impl Mmu for X86Mmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        // Safety: reading CR3 is side-effect free at CPL0.
        let cr3 = unsafe { Cr3::load_unsafe() };
        cr3.directory_phys().page()
    }

    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        unsafe { Cr3::from_directory_phys(root.base(), false, false).store_unsafe() };
    }

    fn invalidate_page(&mut self, page: VirtualPage<Size4K>) {
        let va = page.base().as_u32();
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }
}
