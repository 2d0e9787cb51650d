mod common;

use common::{Lcg, MIB};
use kernel_alloc::buddy::BuddyError;
use kernel_alloc::heap::AllocError;
use kernel_alloc::size_class::{CACHE_COUNT, PAGE, TOP_ORDER, order_size};
use kernel_alloc::slab::{SlabError, SlabState};
use std::ptr::NonNull;

fn page_of(ptr: NonNull<u8>) -> usize {
    ptr.addr().get() & !(PAGE - 1)
}

#[test]
fn small_objects_share_a_slab_that_is_kept_when_empty() {
    let (_mem, heap) = common::heap(16 * MIB, 64);
    let cache = heap.cache_for(16).unwrap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    assert_eq!(page_of(a), page_of(b));
    let free_before = heap.free_bytes();

    unsafe {
        heap.free(a);
        heap.free(b);
    }
    assert_eq!(cache.slab_state(a), Some(SlabState::Free));
    assert_eq!(cache.stats().free_slabs, 1);
    assert_eq!(heap.free_bytes(), free_before, "slab page must stay cached");
}

#[test]
fn three_pages_round_up_to_order_two() {
    let (_mem, heap) = common::heap(16 * MIB, 64);
    let block = heap.allocate(3 * PAGE).unwrap();
    assert_eq!(heap.buddy().order_of(block), Some(2));
    assert_eq!(heap.usable_size(block), Some(4 * PAGE));
    unsafe { heap.free(block) };
}

#[test]
fn full_slabs_force_a_new_slab() {
    let (_mem, heap) = common::heap(16 * MIB, 64);

    let big = heap.cache_for(2048).unwrap();
    assert_eq!(big.objects_per_slab(), 1);
    let first = heap.allocate(2048).unwrap();
    assert_eq!(big.slab_state(first), Some(SlabState::Full));
    let second = heap.allocate(2000).unwrap();
    assert_ne!(page_of(first), page_of(second));
    assert_eq!(big.stats().full_slabs, 2);

    let medium = heap.cache_for(1024).unwrap();
    assert_eq!(medium.objects_per_slab(), 3);
    let objects: Vec<_> = (0..3).map(|_| heap.allocate(1000).unwrap()).collect();
    assert_eq!(medium.slab_state(objects[1]), Some(SlabState::Full));
    assert!(objects.iter().all(|o| page_of(*o) == page_of(objects[0])));
    let fourth = heap.allocate(1024).unwrap();
    assert_ne!(page_of(fourth), page_of(objects[0]));
    assert_eq!(medium.slab_state(fourth), Some(SlabState::Partial));

    unsafe { heap.free(objects[0]) };
    assert_eq!(medium.slab_state(objects[1]), Some(SlabState::Partial));
    assert!(medium.is_consistent());
    assert!(big.is_consistent());
}

#[test]
fn slab_reaches_full_at_exactly_capacity() {
    let (_mem, heap) = common::heap(16 * MIB, 64);
    let cache = heap.cache_for(1024).unwrap();

    let first = heap.allocate(1024).unwrap();
    assert_eq!(cache.slab_state(first), Some(SlabState::Partial));
    let _second = heap.allocate(1024).unwrap();
    assert_eq!(cache.slab_state(first), Some(SlabState::Partial));
    let _third = heap.allocate(1024).unwrap();
    assert_eq!(cache.slab_state(first), Some(SlabState::Full));
}

#[test]
fn free_then_allocate_returns_the_same_address() {
    let (_mem, heap) = common::heap(16 * MIB, 64);

    for size in [16, 100, 2048, 3000, 5 * PAGE, 64 * 1024, 4 * 1024 * 1024] {
        let first = heap.allocate(size).unwrap();
        unsafe { heap.free(first) };
        let again = heap.allocate(size).unwrap();
        assert_eq!(first, again, "size {size}");
        unsafe { heap.free(again) };
    }
}

#[test]
fn allocations_never_overlap() {
    let (_mem, heap) = common::heap(16 * MIB, 64);
    let initial = heap.free_bytes();
    let mut rng = Lcg::new(0x5EED);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for step in 0..2000u32 {
        if live.is_empty() || rng.below(100) < 60 {
            let size = (match rng.below(100) {
                0..70 => 1 + rng.below(2048),
                70..95 => 2049 + rng.below(62 * 1024),
                95..99 => 64 * 1024 + rng.below(960 * 1024),
                _ => 1 + rng.below(4 * MIB),
            }) as usize;
            let Ok(ptr) = heap.allocate(size) else {
                continue;
            };

            let (start, end) = (ptr.addr().get(), ptr.addr().get() + size);
            for (other, other_size, _) in &live {
                let (o_start, o_end) = (other.addr().get(), other.addr().get() + other_size);
                assert!(end <= o_start || o_end <= start, "overlap at step {step}");
            }

            let tag = (step % 251) as u8;
            unsafe { ptr.write_bytes(tag, size) };
            live.push((ptr, size, tag));
        } else {
            let index = rng.below(live.len() as u64) as usize;
            let (ptr, size, tag) = live.swap_remove(index);
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == tag), "corruption at step {step}");
            unsafe { heap.free(ptr) };
        }
    }

    for (ptr, size, tag) in live.drain(..) {
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == tag));
        unsafe { heap.free(ptr) };
    }

    assert_eq!(heap.buddy().uncoalesced_pairs(), 0);
    assert!(heap.caches().iter().all(|c| c.is_consistent()));

    let cached: usize = heap.cache_stats().iter().map(|s| s.free_slabs).sum();
    assert_eq!(heap.free_bytes() + cached * PAGE, initial);
}

#[test]
fn stats_are_stable_without_activity() {
    let (_mem, heap) = common::heap(16 * MIB, 64);

    let first = heap.stats();
    assert_eq!(first, heap.stats());
    assert_eq!(first.frame_free_pages, 64);
    assert_eq!(first.frame_total_pages, 4096);

    let block = heap.allocate(2 * PAGE).unwrap();
    let during = heap.stats();
    assert_eq!(during.free_bytes, first.free_bytes - order_size(1));

    unsafe { heap.free(block) };
    assert_eq!(heap.stats(), first);
}

#[test]
fn zero_sized_requests_use_the_smallest_bucket() {
    let (_mem, heap) = common::heap(16 * MIB, 64);
    let ptr = heap.allocate(0).unwrap();
    assert_eq!(heap.usable_size(ptr), Some(16));
    assert_eq!(heap.cache_stats()[0].live_objects, 1);
    assert_eq!(heap.cache_stats().len(), CACHE_COUNT);
}

#[test]
fn zeroed_allocations_are_cleared() {
    let (_mem, heap) = common::heap(16 * MIB, 64);

    let dirty = heap.allocate(100).unwrap();
    unsafe {
        dirty.write_bytes(0xFF, 100);
        heap.free(dirty);
    }
    let clean = heap.allocate_zeroed(10, 10).unwrap();
    assert_eq!(clean, dirty);
    let bytes = unsafe { std::slice::from_raw_parts(clean.as_ptr(), 100) };
    assert!(bytes.iter().all(|&b| b == 0));

    assert_eq!(
        heap.allocate_zeroed(usize::MAX, 2),
        Err(AllocError::SizeOverflow)
    );
}

#[test]
fn reallocate_moves_contents_between_tiers() {
    let (_mem, heap) = common::heap(16 * MIB, 64);

    let small = heap.allocate(64).unwrap();
    let data: Vec<u8> = (0..64).collect();
    unsafe { small.copy_from_nonoverlapping(NonNull::from(&data[..]).cast(), 64) };

    let large = unsafe { heap.reallocate(small, 10_000) }.unwrap();
    assert_eq!(heap.usable_size(large), Some(4 * PAGE));
    let moved = unsafe { std::slice::from_raw_parts(large.as_ptr(), 64) };
    assert_eq!(moved, &data[..]);

    let shrunk = unsafe { heap.reallocate(large, 8) }.unwrap();
    let kept = unsafe { std::slice::from_raw_parts(shrunk.as_ptr(), 8) };
    assert_eq!(kept, &data[..8]);
    unsafe { heap.free(shrunk) };
}

#[test]
fn failed_reallocate_keeps_the_original() {
    let (_mem, heap) = common::heap(16 * MIB, 64);

    let ptr = heap.allocate(32).unwrap();
    unsafe { ptr.write_bytes(0x5A, 32) };

    let result = unsafe { heap.reallocate(ptr, 8 * 1024 * 1024) };
    assert_eq!(
        result,
        Err(AllocError::Buddy(BuddyError::OrderTooLarge(11)))
    );
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
    assert!(bytes.iter().all(|&b| b == 0x5A));
    assert_eq!(heap.cache_stats()[1].live_objects, 1);
    unsafe { heap.free(ptr) };
}

#[test]
fn exhausted_buddy_tier_fails_small_and_large_requests() {
    let (_mem, heap) = common::heap(16 * MIB, 64);

    let mut blocks = Vec::new();
    for order in (0..=TOP_ORDER).rev() {
        while let Ok(block) = heap.buddy().allocate_order(order) {
            blocks.push(block);
        }
    }
    assert_eq!(heap.free_bytes(), 0);

    assert_eq!(
        heap.allocate(16),
        Err(AllocError::Slab(SlabError::Grow(BuddyError::OutOfMemory(0))))
    );
    assert_eq!(
        heap.allocate(2 * PAGE),
        Err(AllocError::Buddy(BuddyError::OutOfMemory(1)))
    );

    // Memory returned to the buddy tier is usable again.
    unsafe { heap.free(blocks.pop().unwrap()) };
    let object = heap.allocate(16).unwrap();
    assert_eq!(heap.cache_stats()[0].live_objects, 1);
    unsafe { heap.free(object) };
}

#[test]
fn untracked_pointers_are_ignored_on_free() {
    let (_mem, heap) = common::heap(16 * MIB, 64);
    let before = heap.stats();
    unsafe { heap.free(NonNull::dangling()) };
    assert_eq!(heap.stats(), before);
}

#[test]
fn reserved_frames_are_never_buddy_memory() {
    let (mem, heap) = common::heap(16 * MIB, 64);
    let frames = heap.frames();

    let taken: Vec<_> = (0..64).map(|_| frames.allocate_page().unwrap()).collect();
    assert!(frames.allocate_page().is_err());

    for pa in &taken {
        let virt = NonNull::new((mem.offset() + pa.as_u64()) as *mut u8).unwrap();
        let meta = heap.buddy().page_info(virt).unwrap();
        assert!(!meta.free());
        assert!(!meta.slab());
    }

    // Exhausting the bitmap tier leaves the heap usable.
    let object = heap.allocate(256).unwrap();
    let object_page = mem.phys(object.as_ptr()) & !(PAGE as u64 - 1);
    assert!(taken.iter().all(|pa| pa.as_u64() != object_page));
    unsafe { heap.free(object) };

    for pa in taken {
        frames.free_page(pa).unwrap();
    }
    assert_eq!(frames.free_pages(), 64);
}

#[test]
fn concurrent_allocations_stay_disjoint() {
    let (_mem, heap) = common::heap(16 * MIB, 64);
    let heap = &heap;

    std::thread::scope(|scope| {
        for thread in 0..4u8 {
            scope.spawn(move || {
                let mut rng = Lcg::new(u64::from(thread) + 1);
                let mut live = Vec::new();
                for _ in 0..500 {
                    let size = 1 + rng.below(6000) as usize;
                    let ptr = heap.allocate(size).unwrap();
                    unsafe { ptr.write_bytes(thread, size) };
                    live.push((ptr, size));

                    if live.len() > 8 {
                        let (ptr, size) = live.swap_remove(rng.below(8) as usize);
                        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == thread));
                        unsafe { heap.free(ptr) };
                    }
                }
                for (ptr, size) in live {
                    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                    assert!(bytes.iter().all(|&b| b == thread));
                    unsafe { heap.free(ptr) };
                }
            });
        }
    });

    assert!(heap.caches().iter().all(|c| c.is_consistent()));
    assert_eq!(heap.buddy().uncoalesced_pairs(), 0);
    assert!(heap.cache_stats().iter().all(|s| s.live_objects == 0));
}
