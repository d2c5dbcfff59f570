//! # Typed 32-bit x86 Control Registers
//!
//! Only the registers the memory manager touches are modelled: CR0 (paging and
//! write-protect enables), CR2 (faulting linear address) and CR3 (page
//! directory base). Actual register access is behind the `asm` feature and
//! only compiled for `target_arch = "x86"`; the bit layouts are usable (and
//! tested) everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
