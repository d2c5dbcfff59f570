//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and the boot memory-map
//! contract shared by the boot code, the physical frame allocator and the
//! virtual-memory manager. It is the single source of truth for where user
//! space ends, where the kernel lives and which physical memory is off limits.
//!
//! ## Virtual Memory Architecture
//!
//! The kernel is a classic 32-bit higher-half design with a 3 GiB / 1 GiB
//! split:
//!
//! ```text
//! Virtual Address Space Layout (32-bit, no PAE):
//!
//! 0x0000_0000       ┌─────────────────────────────────┐ USERSPACE_START
//!                   │                                 │
//!                   │          User Space             │
//!                   │   (per-process, private)        │
//!                   │                                 │
//! 0xC000_0000       ├─────────────────────────────────┤ KERNEL_SPLIT
//!                   │   Direct map of managed RAM     │ PHYS_MAP_BASE
//!                   │   (shared by every process)     │
//! 0xF000_0000       ├─────────────────────────────────┤ + PHYS_MAP_LIMIT
//!                   │   Kernel regions, heap          │
//! 0xFFC0_0000       ├─────────────────────────────────┤ KERNEL_SPACE_END
//!                   │   Reserved (last directory slot)│
//! 0xFFFF_FFFF       └─────────────────────────────────┘
//! ```
//!
//! Addresses at or above [`KERNEL_SPLIT`](memory::KERNEL_SPLIT) are
//! kernel-only. Every process page directory links the same kernel page
//! tables for that range.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Low memory, BIOS, VGA          │
//! 0x0010_0000 ├─────────────────────────────────┤ PHYS_LOAD
//!             │  Kernel image, boot structures  │
//! 0x0100_0000 ├─────────────────────────────────┤ KERNEL_IMAGE_RESERVED
//!             │  Available RAM                  │
//!             │  (managed by the frame bitmap)  │
//!             └─────────────────────────────────┘
//! ```
//!
//! The first 16 MiB are never handed out by the frame allocator.
//!
//! ## Boot Protocol
//!
//! The boot loader hands over a firmware memory map as an array of
//! [`BootMemoryRegion`](boot::BootMemoryRegion) entries (multiboot layout,
//! `#[repr(C)]`). See [`boot`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
