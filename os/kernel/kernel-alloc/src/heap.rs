//! # Allocation Front-End
//!
//! [`Heap`] is the allocator context: it owns the bitmap tier, the buddy tier
//! and one slab cache per size bucket, and is passed by shared reference to
//! every caller. Requests of up to half a page go to the matching slab cache,
//! everything larger to the buddy tier. On free, the owning tier is recovered
//! from the page metadata of the pointer's page.

use crate::buddy::{BuddyAllocator, BuddyError};
use crate::frame_alloc::{FrameAllocator, FrameError};
use crate::phys_mapper::DirectMap;
use crate::size_class::{
    CACHE_COUNT, CACHE_SIZES, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE, cache_index, is_slab_size,
    order_size,
};
use crate::slab::{CacheStats, ObjectCache, SlabError};
use core::ptr::NonNull;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::HHDM_BASE;
use log::info;

/// Empty slabs each cache keeps before returning pages to the buddy tier.
pub const MAX_FREE_SLABS: usize = 3;

/// Free pages left to the bitmap tier after buddy bootstrap (4 MiB).
pub const DEFAULT_FRAME_RESERVE_PAGES: usize = 1024;

/// Alignment guaranteed for every slab object.
pub const SLAB_ALIGN: usize = 16;

/// Errors while bringing up the allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("the memory map reports no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold the {0}-byte frame bitmap")]
    BitmapDoesNotFit(u64),
    #[error("cannot allocate page metadata: {0}")]
    Metadata(#[from] FrameError),
}

/// Errors from the allocation front-end.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error(transparent)]
    Slab(#[from] SlabError),
    #[error(transparent)]
    Buddy(#[from] BuddyError),
    #[error("requested size overflows")]
    SizeOverflow,
}

/// Runtime allocator settings.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocatorConfig {
    /// Virtual offset at which all physical memory is mapped.
    pub direct_map_offset: u64,
    /// Free pages the buddy bootstrap leaves to the bitmap tier.
    pub frame_reserve_pages: usize,
    /// Empty-slab retention cap per cache.
    pub max_free_slabs: usize,
}

impl AllocatorConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            direct_map_offset: HHDM_BASE,
            frame_reserve_pages: DEFAULT_FRAME_RESERVE_PAGES,
            max_free_slabs: MAX_FREE_SLABS,
        }
    }

    #[must_use]
    pub const fn with_direct_map_offset(mut self, offset: u64) -> Self {
        self.direct_map_offset = offset;
        self
    }

    #[must_use]
    pub const fn with_frame_reserve_pages(mut self, pages: usize) -> Self {
        self.frame_reserve_pages = pages;
        self
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator-wide usage snapshot.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes currently free in the buddy tier.
    pub free_bytes: usize,
    /// Free page frames left in the bitmap tier.
    pub frame_free_pages: usize,
    /// Page frames the bitmap tracks.
    pub frame_total_pages: usize,
}

/// The kernel allocator context.
pub struct Heap {
    frames: FrameAllocator,
    buddy: BuddyAllocator,
    caches: [ObjectCache; CACHE_COUNT],
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap").finish_non_exhaustive()
    }
}

impl Heap {
    /// Bring up all three tiers from the boot memory map.
    ///
    /// Usable regions in `regions` are shrunk where the frame bitmap is carved
    /// out.
    ///
    /// # Errors
    /// Any [`InitError`] from the bitmap or buddy bootstrap.
    ///
    /// # Safety
    /// The memory map must be accurate, the direct map must cover all usable
    /// memory and be aligned to 4 MiB, and usable memory must be otherwise
    /// unused.
    pub unsafe fn init(regions: &mut [MemoryRegion], config: &AllocatorConfig) -> Result<Self, InitError> {
        let direct_map = DirectMap::with_offset(config.direct_map_offset);
        // SAFETY: Forwarded from the caller.
        let frames = unsafe { FrameAllocator::init(regions, direct_map)? };
        // SAFETY: `frames` was initialized from the same map.
        let buddy = unsafe { BuddyAllocator::bootstrap(regions, &frames, config.frame_reserve_pages)? };
        let caches = core::array::from_fn(|id| ObjectCache::new(id, CACHE_SIZES[id], config.max_free_slabs));

        info!(
            "heap: {CACHE_COUNT} slab caches ({MIN_OBJECT_SIZE}..={MAX_OBJECT_SIZE} bytes), {} KiB free",
            buddy.free_bytes() / 1024
        );

        Ok(Self {
            frames,
            buddy,
            caches,
        })
    }

    /// The bitmap tier, for page-table code.
    #[must_use]
    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[must_use]
    pub const fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    #[must_use]
    pub const fn caches(&self) -> &[ObjectCache] {
        &self.caches
    }

    /// The cache serving requests of `size` bytes, if any.
    #[must_use]
    pub fn cache_for(&self, size: usize) -> Option<&ObjectCache> {
        is_slab_size(size).then(|| &self.caches[cache_index(size)])
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    /// [`AllocError::Slab`] or [`AllocError::Buddy`] when the serving tier is exhausted.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.cache_for(size) {
            Some(cache) => Ok(cache.allocate(&self.buddy)?),
            None => Ok(self.buddy.allocate(size)?),
        }
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Slab objects are 16-byte aligned; stricter alignments are served by a
    /// buddy block of at least `align` bytes, which is aligned to its size.
    ///
    /// # Errors
    /// As for [`allocate`](Self::allocate).
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if align <= SLAB_ALIGN {
            return self.allocate(size);
        }
        Ok(self.buddy.allocate(size.max(align))?)
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Errors
    /// [`AllocError::SizeOverflow`] if the product overflows, otherwise as for
    /// [`allocate`](Self::allocate).
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let bytes = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
        let ptr = self.allocate(bytes)?;
        // SAFETY: The allocation holds at least `bytes` bytes.
        unsafe { ptr.write_bytes(0, bytes) };
        Ok(ptr)
    }

    /// Return an allocation to its owning tier.
    ///
    /// Pointers outside the tracked physical range are ignored.
    ///
    /// # Safety
    /// `ptr` must come from this heap and not have been freed since.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let Some(meta) = self.buddy.page_info(ptr) else {
            return;
        };

        if meta.slab() {
            if let Some(cache) = self.caches.get(usize::from(meta.cache())) {
                // SAFETY: The page belongs to this cache.
                unsafe { cache.free(&self.buddy, ptr) };
            }
        } else {
            // SAFETY: Forwarded from the caller.
            unsafe { self.buddy.free(ptr) };
        }
    }

    /// Bytes usable at `ptr`: the cache's object size or the buddy block size.
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let meta = self.buddy.page_info(ptr)?;
        if meta.slab() {
            self.caches
                .get(usize::from(meta.cache()))
                .map(ObjectCache::object_size)
        } else {
            Some(order_size(usize::from(meta.order())))
        }
    }

    /// Move an allocation into a new one of `size` bytes.
    ///
    /// On failure the original allocation is left untouched.
    ///
    /// # Errors
    /// As for [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// As for [`free`](Self::free).
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError> {
        let old_size = self.usable_size(ptr).unwrap_or(0);
        let new = self.allocate(size)?;
        // SAFETY: Both allocations are live and distinct; the copy fits both.
        unsafe {
            new.copy_from_nonoverlapping(ptr, old_size.min(size));
            self.free(ptr);
        }
        Ok(new)
    }

    /// Bytes currently free in the buddy tier.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.buddy.free_bytes()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            free_bytes: self.buddy.free_bytes(),
            frame_free_pages: self.frames.free_pages(),
            frame_total_pages: self.frames.total_pages(),
        }
    }

    #[must_use]
    pub fn cache_stats(&self) -> [CacheStats; CACHE_COUNT] {
        core::array::from_fn(|id| self.caches[id].stats())
    }
}
