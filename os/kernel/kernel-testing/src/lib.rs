//! # Host test support
//!
//! Simulated physical memory for exercising the allocators on the build host.
//! A [`TestMemory`] is a zeroed host buffer that stands in for physical
//! addresses `[0, size)`; its base address doubles as the direct-map offset.

use std::alloc::{Layout, alloc_zeroed, dealloc};

pub const MIB: u64 = 1024 * 1024;

/// Alignment of the simulated RAM; matches the largest buddy block.
const RAM_ALIGN: usize = 4 * 1024 * 1024;

/// A zeroed host buffer standing in for physical memory `[0, size)`.
pub struct TestMemory {
    base: *mut u8,
    layout: Layout,
}

// SAFETY: The buffer is plain memory; allocators built on it do their own locking.
unsafe impl Send for TestMemory {}
unsafe impl Sync for TestMemory {}

impl TestMemory {
    /// # Panics
    /// If `size` is not a valid layout size or the host is out of memory.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(size: u64) -> Self {
        let layout = Layout::from_size_align(size as usize, RAM_ALIGN).expect("layout");
        // SAFETY: `layout` has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "host allocation failed");
        Self { base, layout }
    }

    /// Virtual address of physical address zero.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.base.expose_provenance() as u64
    }

    /// Size of the simulated RAM in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    /// Physical address of `ptr`.
    #[must_use]
    pub fn phys(&self, ptr: *const u8) -> u64 {
        ptr.addr() as u64 - self.offset()
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with the same layout.
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Tiny deterministic generator for randomized sequences.
pub struct Lcg(u64);

impl Lcg {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub const fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    pub const fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
