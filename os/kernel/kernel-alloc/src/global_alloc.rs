//! # `GlobalAlloc` Adapter
//!
//! Lets `alloc::boxed::Box`, `Vec` and friends use the kernel [`Heap`]. The
//! heap is constructed during boot and bound once with
//! [`KernelAllocator::install`]; before that every request fails with a null
//! pointer.
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator::new();
//!
//! static HEAP: SyncOnceCell<Heap> = SyncOnceCell::new();
//!
//! let heap = HEAP.get_or_init(|| unsafe { Heap::init(regions, &config) }.expect("heap"));
//! GLOBAL_ALLOCATOR.install(heap).ok();
//! ```
//!
//! Unlike a header-based free list, the owning tier is found from page
//! metadata, so `dealloc` ignores the `Layout`.

use crate::heap::Heap;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::SyncOnceCell;

/// Global allocator backed by a [`Heap`].
pub struct KernelAllocator {
    heap: SyncOnceCell<&'static Heap>,
}

impl Default for KernelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: SyncOnceCell::new(),
        }
    }

    /// Bind the heap that serves all requests.
    ///
    /// # Errors
    /// Returns `heap` back if a heap is already installed.
    pub fn install(&self, heap: &'static Heap) -> Result<(), &'static Heap> {
        self.heap.set(heap)
    }

    #[must_use]
    pub fn heap(&self) -> Option<&'static Heap> {
        self.heap.get().copied()
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.heap()
            .and_then(|heap| heap.allocate_aligned(layout.size(), layout.align()).ok())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(heap), Some(ptr)) = (self.heap(), NonNull::new(ptr)) {
            // SAFETY: `GlobalAlloc` guarantees `ptr` came from `alloc`.
            unsafe { heap.free(ptr) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Same contract as `alloc`.
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            // SAFETY: The allocation holds `layout.size()` bytes.
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };

        // SAFETY: Same contract as `alloc`.
        let new = unsafe { self.alloc(new_layout) };
        if !new.is_null() {
            // SAFETY: Both blocks are live, distinct and hold the copied bytes.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new
    }
}
