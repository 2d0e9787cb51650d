//! # Kernel Physical Memory and Heap Allocation
//!
//! This crate hands out physical page frames and kernel heap objects. It is
//! the only source of dynamic memory in the kernel: page-table code asks it
//! for frames, every other subsystem asks it for objects.
//!
//! ## Architecture Overview
//!
//! Three tiers, each behind its own interrupt-safe spin lock:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Allocation Front-End (Heap)            │
//! │    • allocate / free / reallocate / zeroed          │
//! │    • routes by size, dispatches frees by metadata   │
//! └───────────┬─────────────────────────────┬───────────┘
//!             │ ≤ 2048 bytes                │ > 2048 bytes
//! ┌───────────▼─────────────┐               │
//! │      Slab Caches        │               │
//! │  • 16 B .. 2048 B       │               │
//! │  • free/partial/full    │               │
//! └───────────┬─────────────┘               │
//!             │ one page per slab           │
//! ┌───────────▼─────────────────────────────▼───────────┐
//! │                 Buddy Allocator                     │
//! │    • orders 0..=10 (4 KiB .. 4 MiB)                 │
//! │    • split on allocate, coalesce on free            │
//! │    • 16-bit metadata record per page                │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ adopts free frames at bootstrap
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Bitmap Page-Frame Allocator               │
//! │    • one bit per 4 KiB frame                        │
//! │    • single pages, runs, 2 MiB huge pages           │
//! │    • backs page tables and buddy metadata           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Bitmap Page-Frame Allocator ([`frame_alloc`])
//!
//! Tracks every frame up to the highest usable address. Scans from a rotating
//! cursor, skips fully used bitmap bytes, and wraps around once.
//!
//! ### Buddy Allocator ([`buddy`])
//!
//! Serves power-of-two page blocks from one intrusive free list per order.
//! Per-page metadata ([`page_meta`]) records order, free flag, slab flag, and
//! the owning cache; it is the only way the front-end can tell tiers apart on
//! free.
//!
//! ### Slab Caches ([`slab`])
//!
//! Carve single buddy pages into equally sized objects. Empty slabs are kept
//! up to a small limit, then handed back to the buddy tier.
//!
//! ### Front-End ([`heap`]) and `GlobalAlloc` ([`global_alloc`])
//!
//! [`Heap`](heap::Heap) is the allocator context object; it is constructed
//! once at boot and shared by reference. [`KernelAllocator`](global_alloc::KernelAllocator)
//! exposes it to `alloc` collections.
//!
//! ## Ownership of Physical Frames
//!
//! After [`Heap::init`](heap::Heap::init) a frame is owned by exactly one
//! tier. The buddy bootstrap claims the frames it adopts in the bitmap, and
//! leaves a configurable reserve of free frames to the bitmap tier for page
//! tables and huge pages.
//!
//! ## Usage
//!
//! ```no_run
//! use kernel_alloc::heap::{AllocatorConfig, Heap};
//! use kernel_info::boot::MemoryRegion;
//!
//! let mut regions = [MemoryRegion::usable(0x10_0000, 0x3FF0_0000)];
//! let heap = unsafe { Heap::init(&mut regions, &AllocatorConfig::default()) }.unwrap();
//!
//! let object = heap.allocate(48).unwrap();
//! let frame = heap.frames().allocate_page().unwrap();
//!
//! unsafe { heap.free(object) };
//! heap.frames().free_page(frame).unwrap();
//! ```
//!
//! ## Locking
//!
//! Every entry point disables interrupts, takes its tier's lock, and restores
//! the previous interrupt state on release. No code path holds two tier locks
//! at once; slab caches release their own lock before asking the buddy tier
//! for a page.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod addr;
pub mod buddy;
pub mod frame_alloc;
mod free_list;
pub mod global_alloc;
pub mod heap;
pub mod page_meta;
pub mod phys_mapper;
pub mod size_class;
pub mod slab;

#[cfg(test)]
mod testing;

pub use addr::PhysicalAddress;
pub use global_alloc::KernelAllocator;
pub use heap::{AllocError, AllocatorConfig, Heap, HeapStats, InitError};
