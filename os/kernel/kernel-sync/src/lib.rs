//! # Kernel synchronization primitives
//!
//! Every allocator tier in the kernel protects its state with one of these
//! spinlocks. Allocator entry points acquire them through
//! [`SpinLock::lock_irq`], which masks interrupts for the duration of the
//! critical section so an interrupt handler running on the same core cannot
//! re-enter an allocator whose lock is already held.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
