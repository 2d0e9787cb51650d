//! # Kernel Memory Configuration and Boot Memory Map
//!
//! This crate is the single source of truth for the constants and boot-time
//! data that the kernel's memory allocators are built on. Keeping them in one
//! place prevents the page-frame allocator, the buddy allocator and the slab
//! caches from disagreeing about something as basic as the page size.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! * **Page Geometry**: base page size, huge-page size, alignment helpers
//! * **Direct Map**: the virtual base at which all physical memory is mapped
//!
//! ### Boot Memory Map ([`boot`])
//! * **Regions**: the bootloader's view of physical memory as a list of
//!   `[base, base + length)` ranges tagged usable or reserved
//! * **Summaries**: total reported memory and the highest usable address,
//!   which together size the allocators' bookkeeping structures
//!
//! ```text
//! Physical Address Space (as reported at boot):
//!
//! 0x0000_0000 ┌──────────────────────┐
//!             │ Reserved (firmware)  │
//!             ├──────────────────────┤
//!             │ Usable               │ ← bitmap storage carved from here
//!             ├──────────────────────┤
//!             │ Reserved (MMIO, ...) │
//!             ├──────────────────────┤
//!             │ Usable               │
//! top         └──────────────────────┘ ← highest usable address
//! ```
//!
//! The map is mutable on purpose: the page-frame allocator carves its own
//! bitmap out of the first sufficiently large usable region and shrinks that
//! region accordingly, so later consumers never see the bitmap as free memory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
