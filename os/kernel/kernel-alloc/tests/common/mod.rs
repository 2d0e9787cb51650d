#![allow(dead_code)]

use kernel_alloc::heap::{AllocatorConfig, Heap};
use kernel_info::boot::MemoryRegion;

pub use kernel_testing::{Lcg, MIB, TestMemory};

/// A heap over `size` bytes of simulated RAM whose first 64 KiB are reserved.
pub fn heap(size: u64, reserve_pages: usize) -> (TestMemory, Heap) {
    let mem = TestMemory::new(size);
    let mut regions = [
        MemoryRegion::reserved(0, 0x1_0000),
        MemoryRegion::usable(0x1_0000, size - 0x1_0000),
    ];
    let config = AllocatorConfig::new()
        .with_direct_map_offset(mem.offset())
        .with_frame_reserve_pages(reserve_pages);
    let heap = unsafe { Heap::init(&mut regions, &config) }.expect("heap init");
    (mem, heap)
}
