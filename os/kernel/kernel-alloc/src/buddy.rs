//! # Buddy Allocator
//!
//! Power-of-two blocks of 4 KiB to 4 MiB (orders `0..=10`), one intrusive
//! free list per order. A block of order `k` at physical address `p` has its
//! buddy at `p ^ (4096 << k)`.
//!
//! - **Allocate:** take the smallest non-empty list at or above the wanted
//!   order and split downwards, pushing each upper half onto the list one
//!   order below.
//! - **Free:** while the buddy is tracked, free, and of the same order, unlink
//!   it and merge; the merged block is based at the lower address.
//!
//! Metadata lives in a [`PageMetaTable`] sized to the bitmap's page count and
//! allocated from the frame allocator at bootstrap. Only the base page of a
//! block carries an authoritative record.
//!
//! At bootstrap the tier adopts only pages that are free in the bitmap and
//! claims them there, so no frame is ever owned by both tiers.

use crate::addr::PhysicalAddress;
use crate::frame_alloc::FrameAllocator;
use crate::free_list::FreeList;
use crate::heap::InitError;
use crate::page_meta::{PageMeta, PageMetaTable};
use crate::phys_mapper::DirectMap;
use crate::size_class::{MAX_ORDER, PAGE, TOP_ORDER, order_for_size, order_size};
use core::ptr::NonNull;
use kernel_info::boot::{MemoryMap, MemoryRegion};
use kernel_info::memory::{PAGE_SIZE, align_down, align_up};
use kernel_sync::SpinLock;
use log::info;

/// Errors reported by the buddy tier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BuddyError {
    #[error("order {0} exceeds the largest block")]
    OrderTooLarge(usize),
    #[error("no free block of order {0} or above")]
    OutOfMemory(usize),
}

struct BuddyState {
    free_lists: [FreeList; MAX_ORDER],
    meta: PageMetaTable,
    free_bytes: usize,
    direct_map: DirectMap,
}

// SAFETY: The free lists and metadata are only reached through the
// allocator's spin lock.
unsafe impl Send for BuddyState {}

/// Binary buddy allocator over the frames the bitmap tier handed over.
pub struct BuddyAllocator {
    state: SpinLock<BuddyState>,
}

/// Largest order a block at `page` spanning at most `pages` pages can have.
#[allow(clippy::cast_possible_truncation)]
fn max_fit_order(page: usize, pages: usize) -> usize {
    let by_alignment = page.trailing_zeros() as usize;
    let by_length = pages.ilog2() as usize;
    by_alignment.min(by_length).min(TOP_ORDER)
}

#[allow(clippy::cast_possible_truncation)]
const fn order_u8(order: usize) -> u8 {
    order as u8
}

impl BuddyState {
    fn block(&self, pa: PhysicalAddress) -> NonNull<u8> {
        // SAFETY: Tracked pages have non-zero direct-map addresses.
        unsafe { NonNull::new_unchecked(self.direct_map.to_virt(pa)) }
    }

    /// # Safety
    /// `block` must be an unused block of `order` owned by this tier.
    unsafe fn insert_free(&mut self, block: NonNull<u8>, order: usize) {
        let page = self.direct_map.page_index(block.as_ptr());
        self.meta.set(page, PageMeta::free_block(order_u8(order)));
        // SAFETY: Guaranteed by the caller.
        unsafe { self.free_lists[order].push(block) };
    }

    fn allocate(&mut self, order: usize) -> Result<NonNull<u8>, BuddyError> {
        if order >= MAX_ORDER {
            return Err(BuddyError::OrderTooLarge(order));
        }

        let mut current = (order..MAX_ORDER)
            .find(|&k| !self.free_lists[k].is_empty())
            .ok_or(BuddyError::OutOfMemory(order))?;
        let block = self.free_lists[current]
            .pop()
            .ok_or(BuddyError::OutOfMemory(order))?;
        let pa = self.direct_map.to_phys(block.as_ptr());

        while current > order {
            current -= 1;
            let upper = PhysicalAddress::new(pa.as_u64() ^ (PAGE_SIZE << current));
            let upper = self.block(upper);
            // SAFETY: The upper half of a block we own is unused.
            unsafe { self.insert_free(upper, current) };
        }

        self.meta
            .set(pa.page_index(), PageMeta::allocated(order_u8(order)));
        self.free_bytes -= order_size(order);
        Ok(block)
    }

    /// # Safety
    /// `block` must have been returned by [`allocate`](Self::allocate) and not
    /// freed since.
    unsafe fn free(&mut self, block: NonNull<u8>) {
        let mut pa = self.direct_map.to_phys(block.as_ptr());
        let Some(meta) = self.meta.get(pa.page_index()) else {
            return;
        };
        debug_assert!(!meta.free(), "double free of buddy block at {pa}");

        let original = usize::from(meta.order());
        let mut order = original;

        while order < TOP_ORDER {
            let buddy = PhysicalAddress::new(pa.as_u64() ^ (PAGE_SIZE << order));
            match self.meta.get(buddy.page_index()) {
                Some(m) if m.free() && usize::from(m.order()) == order => {}
                _ => break,
            }
            let buddy_block = self.block(buddy);
            if !self.free_lists[order].remove(buddy_block) {
                break;
            }

            let upper = pa.max(buddy);
            self.meta.set(upper.page_index(), PageMeta::new());
            pa = PhysicalAddress::new(pa.as_u64() & !(PAGE_SIZE << order));
            order += 1;
        }

        let merged = self.block(pa);
        // SAFETY: The merged block consists only of pages this tier owns.
        unsafe { self.insert_free(merged, order) };
        self.free_bytes += order_size(original);
    }
}

impl BuddyAllocator {
    /// Adopt every frame the bitmap still reports free, except `reserve_pages`.
    ///
    /// Allocates the metadata array from `frames` first, then walks the usable
    /// regions claiming maximal aligned blocks.
    ///
    /// # Errors
    /// [`InitError::Metadata`] if the metadata array cannot be allocated.
    ///
    /// # Safety
    /// `frames` must have been initialized from `regions`, and its direct map
    /// must be aligned to at least 4 MiB.
    pub unsafe fn bootstrap(
        regions: &[MemoryRegion],
        frames: &FrameAllocator,
        reserve_pages: usize,
    ) -> Result<Self, InitError> {
        let direct_map = frames.direct_map();
        let max_pages = frames.total_pages();
        let meta_pages = (max_pages * size_of::<PageMeta>()).div_ceil(PAGE);
        let meta_pa = frames.allocate_pages(meta_pages)?;
        let entries = direct_map
            .to_virt_nonnull(meta_pa)
            .ok_or(InitError::NoUsableMemory)?
            .cast::<PageMeta>();

        let mut state = BuddyState {
            free_lists: [const { FreeList::new() }; MAX_ORDER],
            // SAFETY: The frames were just allocated for this table.
            meta: unsafe { PageMetaTable::new_zeroed(entries, max_pages) },
            free_bytes: 0,
            direct_map,
        };

        let mut budget = frames.free_pages().saturating_sub(reserve_pages);
        let mut blocks = 0usize;

        for region in regions.usable() {
            let mut pa = align_up(region.base, PAGE_SIZE);
            let end = align_down(region.end(), PAGE_SIZE);

            while pa < end && budget > 0 {
                let page = PhysicalAddress::new(pa).page_index();
                #[allow(clippy::cast_possible_truncation)]
                let remaining = ((end - pa) / PAGE_SIZE) as usize;

                let mut order = max_fit_order(page, remaining);
                while (1 << order) > budget {
                    order -= 1;
                }
                let claimed = loop {
                    if frames.claim(page, 1 << order) {
                        break Some(order);
                    }
                    if order == 0 {
                        break None;
                    }
                    order -= 1;
                };

                match claimed {
                    Some(order) => {
                        let block = state.block(PhysicalAddress::new(pa));
                        // SAFETY: The frames were just claimed from the bitmap.
                        unsafe { state.insert_free(block, order) };
                        state.free_bytes += order_size(order);
                        budget -= 1 << order;
                        blocks += 1;
                        pa += order_size(order) as u64;
                    }
                    None => pa += PAGE_SIZE,
                }
            }
        }

        info!(
            "buddy allocator: adopted {} KiB in {blocks} blocks, metadata {meta_pages} pages at {meta_pa}",
            state.free_bytes / 1024
        );

        Ok(Self {
            state: SpinLock::new(state),
        })
    }

    /// Allocate a block of `order`.
    ///
    /// # Errors
    /// - [`BuddyError::OrderTooLarge`] if `order` is above 10.
    /// - [`BuddyError::OutOfMemory`] if no block of that order can be produced.
    pub fn allocate_order(&self, order: usize) -> Result<NonNull<u8>, BuddyError> {
        self.state.with_lock_irq(|s| s.allocate(order))
    }

    /// Allocate the smallest block holding `size` bytes.
    ///
    /// # Errors
    /// See [`allocate_order`](Self::allocate_order).
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, BuddyError> {
        self.allocate_order(order_for_size(size))
    }

    /// Like [`allocate`](Self::allocate), with the first `size` bytes zeroed.
    ///
    /// # Errors
    /// See [`allocate_order`](Self::allocate_order).
    pub fn allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>, BuddyError> {
        let block = self.allocate(size)?;
        // SAFETY: The block holds at least `size` bytes.
        unsafe { block.write_bytes(0, size) };
        Ok(block)
    }

    /// Allocate one page marked as backing a slab of `cache`.
    ///
    /// # Errors
    /// [`BuddyError::OutOfMemory`] if no page is available.
    pub fn allocate_slab_page(&self, cache: usize) -> Result<NonNull<u8>, BuddyError> {
        self.state.with_lock_irq(|s| {
            let page = s.allocate(0)?;
            let index = s.direct_map.page_index(page.as_ptr());
            #[allow(clippy::cast_possible_truncation)]
            let meta = PageMeta::allocated(0).with_slab(true).with_cache(cache as u8);
            s.meta.set(index, meta);
            Ok(page)
        })
    }

    /// Return a block, coalescing with free buddies.
    ///
    /// # Safety
    /// `block` must come from this allocator and not have been freed since.
    pub unsafe fn free(&self, block: NonNull<u8>) {
        // SAFETY: Guaranteed by the caller.
        self.state.with_lock_irq(|s| unsafe { s.free(block) });
    }

    /// Move a block's contents into a block holding `size` bytes.
    ///
    /// The old block is kept if the new one cannot be allocated.
    ///
    /// # Errors
    /// See [`allocate_order`](Self::allocate_order).
    ///
    /// # Safety
    /// As for [`free`](Self::free).
    pub unsafe fn reallocate(&self, block: NonNull<u8>, size: usize) -> Result<NonNull<u8>, BuddyError> {
        let old_size = self.order_of(block).map_or(0, order_size);
        let new = self.allocate(size)?;
        // SAFETY: Both blocks are live and distinct; the copy fits either.
        unsafe {
            new.copy_from_nonoverlapping(block, old_size.min(size));
            self.free(block);
        }
        Ok(new)
    }

    /// Metadata of the page containing `ptr`, if it is tracked.
    #[must_use]
    pub fn page_info(&self, ptr: NonNull<u8>) -> Option<PageMeta> {
        self.state.with_lock_irq(|s| {
            let page = s.direct_map.page_index(ptr.as_ptr());
            s.meta.get(page)
        })
    }

    /// Order of the block based at `ptr`.
    #[must_use]
    pub fn order_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.page_info(ptr).map(|m| usize::from(m.order()))
    }

    /// Bytes currently on the free lists.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.state.with_lock_irq(|s| s.free_bytes)
    }

    /// Number of free blocks of `order`.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        self.state
            .with_lock_irq(|s| s.free_lists.get(order).map_or(0, FreeList::len))
    }

    /// Whether `ptr` is the base of a block on the free list of `order`.
    #[must_use]
    pub fn is_free_block(&self, ptr: NonNull<u8>, order: usize) -> bool {
        self.state.with_lock_irq(|s| {
            s.free_lists
                .get(order)
                .is_some_and(|list| list.iter().any(|b| b == ptr))
        })
    }

    /// Number of free blocks whose buddy is also free at the same order.
    ///
    /// Always zero when every free has coalesced as far as possible.
    #[must_use]
    pub fn uncoalesced_pairs(&self) -> usize {
        self.state.with_lock_irq(|s| {
            let mut pairs = 0;
            for order in 0..TOP_ORDER {
                for block in s.free_lists[order].iter() {
                    let pa = s.direct_map.to_phys(block.as_ptr());
                    let buddy = PhysicalAddress::new(pa.as_u64() ^ (PAGE_SIZE << order));
                    if s.meta
                        .get(buddy.page_index())
                        .is_some_and(|m| m.free() && usize::from(m.order()) == order)
                    {
                        pairs += 1;
                    }
                }
            }
            pairs
        })
    }
}
