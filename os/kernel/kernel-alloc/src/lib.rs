//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frame allocation and the virtual memory manager of a 32-bit x86
//! kernel, built on the page-table layer in `kernel-vmem`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Virtual Memory Manager (vmm)         │
//! │    • address spaces, regions, VM objects            │
//! │    • demand paging and copy-on-write faults         │
//! │    • fork, protect, resize                          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper (phys_mapper)          │
//! │    • direct map at PHYS_MAP_BASE                    │
//! │    • whole-frame zero and copy                      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator (frame_alloc)    │
//! │    • one bit per 4 KiB frame, first fit             │
//! │    • seeded from the boot memory map                │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │   User space (one per process)  │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_SPLIT
//!             │   Kernel space, shared by all   │
//!             │   directories: direct map of    │
//!             │   managed RAM, then AUTO kernel │
//!             │   regions above PHYS_MAP_LIMIT  │
//! 0xFFC0_0000 ├─────────────────────────────────┤ KERNEL_SPACE_END
//!             │   Reserved directory slot       │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Physical memory below `KERNEL_IMAGE_RESERVED` (16 MiB) holds the kernel
//! image and is never handed out by the frame allocator.
//!
//! ## Concurrency
//!
//! The frame allocator is shared behind a [`kernel_sync::SpinLock`]. Address
//! spaces and objects are mutated through `&mut` access to [`vmm::Vm`] and
//! [`vmm::VmSpace`] only.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;
pub mod vmm;
