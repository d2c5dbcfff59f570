//! # Kernel synchronization primitives
//!
//! The memory manager needs exactly one lock: the spinlock guarding the
//! physical frame bitmap. Address-space structures are serialized through
//! exclusive borrows instead.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
