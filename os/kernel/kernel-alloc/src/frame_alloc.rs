//! # Bitmap Page-Frame Allocator
//!
//! The lowest tier. One bit per 4 KiB physical frame up to the highest usable
//! address: `1` = used (or not RAM), `0` = free. The bitmap lives in physical
//! memory carved from the front of the first usable region large enough to
//! hold it, and is accessed through the direct map.
//!
//! Allocation scans from a rotating cursor (the index after the last
//! allocation) and wraps around once. Bytes equal to `0xFF` are skipped
//! whole.
//!
//! This tier serves page tables, the buddy metadata array, and huge pages.
//! Page frames handed out here are never also owned by the buddy tier; see
//! [`FrameAllocator::claim`].

use crate::addr::PhysicalAddress;
use crate::heap::InitError;
use crate::phys_mapper::DirectMap;
use core::ptr::NonNull;
use kernel_info::boot::{MemoryMap, MemoryRegion};
use kernel_info::memory::{HUGE_PAGE_PAGES, HUGE_PAGE_SIZE, PAGE_SIZE, align_down, align_up};
use kernel_sync::SpinLock;
use log::{debug, info};

#[allow(clippy::cast_possible_truncation)]
const HUGE_RUN: usize = HUGE_PAGE_PAGES as usize;

/// Errors reported by the page-frame allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("out of physical page frames")]
    OutOfMemory,
    #[error("cannot allocate zero pages")]
    ZeroPages,
    #[error("address {0} is not suitably aligned")]
    Misaligned(PhysicalAddress),
    #[error("address {0} is outside the tracked physical range")]
    OutOfRange(PhysicalAddress),
}

/// Minimal frame-allocation interface for page-table code.
pub trait FrameAlloc {
    /// Allocate one zero-or-garbage 4 KiB frame.
    fn alloc_4k(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, pa: PhysicalAddress);
}

/// Bitmap state; only touched under the allocator's lock.
struct FrameBitmap {
    bits: NonNull<u8>,
    bytes: usize,
    max_pages: usize,
    cursor: usize,
    allocated: usize,
}

// SAFETY: The bitmap memory is exclusively owned by the allocator and only
// accessed under its spin lock.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: `bits` points to `bytes` bytes owned by this bitmap.
        unsafe { core::slice::from_raw_parts(self.bits.as_ptr(), self.bytes) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: As above, with exclusive access through `&mut self`.
        unsafe { core::slice::from_raw_parts_mut(self.bits.as_ptr(), self.bytes) }
    }

    #[inline]
    fn test(&self, page: usize) -> bool {
        self.as_slice()[page / 8] & (1 << (page % 8)) != 0
    }

    #[inline]
    fn set(&mut self, page: usize) {
        self.as_mut_slice()[page / 8] |= 1 << (page % 8);
    }

    #[inline]
    fn clear(&mut self, page: usize) {
        self.as_mut_slice()[page / 8] &= !(1 << (page % 8));
    }

    #[inline]
    fn byte_full(&self, page: usize) -> bool {
        page % 8 == 0 && self.as_slice()[page / 8] == 0xFF
    }

    /// Clear bits `[start, end)`, a byte at a time where possible.
    fn clear_range(&mut self, start: usize, end: usize) {
        let mut page = start;
        while page < end && page % 8 != 0 {
            self.clear(page);
            page += 1;
        }
        let whole = (end - page) / 8;
        self.as_mut_slice()[page / 8..page / 8 + whole].fill(0);
        page += whole * 8;
        while page < end {
            self.clear(page);
            page += 1;
        }
    }

    fn set_range(&mut self, start: usize, count: usize) {
        for page in start..start + count {
            self.set(page);
        }
    }

    fn free_pages(&self) -> usize {
        self.max_pages - self.allocated
    }

    /// First free page in `[from, to)`.
    fn scan_single(&self, from: usize, to: usize) -> Option<usize> {
        let mut page = from;
        while page < to {
            if self.byte_full(page) {
                page += 8;
                continue;
            }
            if !self.test(page) {
                return Some(page);
            }
            page += 1;
        }
        None
    }

    /// First start `i` in `[from, until)` such that `[i, i + count)` is free.
    fn scan_run(&self, count: usize, from: usize, until: usize) -> Option<usize> {
        let mut page = from;
        while page < until && page <= self.max_pages.saturating_sub(count) {
            if self.byte_full(page) {
                page += 8;
                continue;
            }
            if self.test(page) {
                page += 1;
                continue;
            }
            match (1..count).find(|&j| self.test(page + j)) {
                None => return Some(page),
                Some(j) => page += j + 1,
            }
        }
        None
    }

    /// First huge-page-aligned start in `[from, until)` with 512 free pages.
    fn scan_huge(&self, from: usize, until: usize) -> Option<usize> {
        let bytes_per_huge = HUGE_RUN / 8;
        let mut page = from.next_multiple_of(HUGE_RUN);
        while page < until && page + HUGE_RUN <= self.max_pages {
            let first = page / 8;
            if self.as_slice()[first..first + bytes_per_huge]
                .iter()
                .all(|&b| b == 0)
            {
                return Some(page);
            }
            page += HUGE_RUN;
        }
        None
    }

    fn take(&mut self, start: usize, count: usize) -> PhysicalAddress {
        self.set_range(start, count);
        self.allocated += count;
        self.cursor = start + count;
        PhysicalAddress::from_page_index(start)
    }
}

/// Bitmap allocator for 4 KiB and 2 MiB physical page frames.
pub struct FrameAllocator {
    state: SpinLock<FrameBitmap>,
    direct_map: DirectMap,
}

impl FrameAllocator {
    /// Build the bitmap from the firmware memory map.
    ///
    /// The bitmap is carved from the front of the first usable region large
    /// enough to hold it; that region is shrunk in `regions` accordingly.
    ///
    /// # Errors
    /// - [`InitError::NoUsableMemory`] if the map has no usable region.
    /// - [`InitError::BitmapDoesNotFit`] if no usable region can hold the bitmap.
    ///
    /// # Safety
    /// The memory map must be accurate, and `direct_map` must cover every
    /// usable region. The usable regions must not be in use by anything else.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn init(regions: &mut [MemoryRegion], direct_map: DirectMap) -> Result<Self, InitError> {
        let top = regions.highest_usable_address();
        if top < PAGE_SIZE {
            return Err(InitError::NoUsableMemory);
        }

        let max_pages = (top / PAGE_SIZE) as usize;
        let bitmap_bytes = align_up((max_pages as u64).div_ceil(8), PAGE_SIZE);

        let host = regions
            .iter_mut()
            .filter(|r| r.is_usable())
            .find(|r| align_up(r.base, PAGE_SIZE) + bitmap_bytes <= r.end())
            .ok_or(InitError::BitmapDoesNotFit(bitmap_bytes))?;

        let bitmap_pa = PhysicalAddress::new(align_up(host.base, PAGE_SIZE));
        host.consume_front(bitmap_pa.as_u64() + bitmap_bytes - host.base);

        let bits = direct_map
            .to_virt_nonnull(bitmap_pa)
            .ok_or(InitError::BitmapDoesNotFit(bitmap_bytes))?;

        let mut bitmap = FrameBitmap {
            bits,
            bytes: bitmap_bytes as usize,
            max_pages,
            cursor: 0,
            allocated: 0,
        };

        bitmap.as_mut_slice().fill(0xFF);
        for region in regions.usable() {
            let start = (align_up(region.base, PAGE_SIZE) / PAGE_SIZE) as usize;
            let end = (align_down(region.end(), PAGE_SIZE) / PAGE_SIZE) as usize;
            if start < end {
                bitmap.clear_range(start, end);
            }
        }

        let free: usize = bitmap
            .as_slice()
            .iter()
            .map(|b| b.count_zeros() as usize)
            .sum();
        bitmap.allocated = max_pages - free;

        info!(
            "frame allocator: {max_pages} pages tracked, {free} free, bitmap of {bitmap_bytes} bytes at {bitmap_pa}"
        );

        Ok(Self {
            state: SpinLock::new(bitmap),
            direct_map,
        })
    }

    /// The direct map used to reach the bitmap.
    #[must_use]
    pub const fn direct_map(&self) -> DirectMap {
        self.direct_map
    }

    /// Allocate a single 4 KiB frame.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if every tracked frame is in use.
    pub fn allocate_page(&self) -> Result<PhysicalAddress, FrameError> {
        self.allocate_pages(1)
    }

    /// Allocate `count` physically contiguous 4 KiB frames.
    ///
    /// # Errors
    /// - [`FrameError::ZeroPages`] if `count` is zero.
    /// - [`FrameError::OutOfMemory`] if no run of `count` free frames exists.
    pub fn allocate_pages(&self, count: usize) -> Result<PhysicalAddress, FrameError> {
        if count == 0 {
            return Err(FrameError::ZeroPages);
        }

        self.state.with_lock_irq(|bm| {
            if count > bm.free_pages() {
                return Err(FrameError::OutOfMemory);
            }
            let cursor = bm.cursor;
            let start = if count == 1 {
                bm.scan_single(cursor, bm.max_pages)
                    .or_else(|| bm.scan_single(0, cursor))
            } else {
                bm.scan_run(count, cursor, bm.max_pages)
                    .or_else(|| bm.scan_run(count, 0, cursor))
            };
            let start = start.ok_or(FrameError::OutOfMemory)?;
            Ok(bm.take(start, count))
        })
    }

    /// Allocate a 2 MiB-aligned run of 512 frames.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if no aligned run of 512 free frames exists.
    pub fn allocate_huge_page(&self) -> Result<PhysicalAddress, FrameError> {
        self.state.with_lock_irq(|bm| {
            let cursor = bm.cursor;
            let start = bm
                .scan_huge(cursor, bm.max_pages)
                .or_else(|| bm.scan_huge(0, cursor))
                .ok_or(FrameError::OutOfMemory)?;
            Ok(bm.take(start, HUGE_RUN))
        })
    }

    /// Return a 4 KiB frame. Freeing an already-free frame has no effect.
    ///
    /// # Errors
    /// - [`FrameError::Misaligned`] if `pa` is not page aligned.
    /// - [`FrameError::OutOfRange`] if `pa` lies beyond the tracked range.
    pub fn free_page(&self, pa: PhysicalAddress) -> Result<(), FrameError> {
        if !pa.is_page_aligned() {
            return Err(FrameError::Misaligned(pa));
        }

        self.state.with_lock_irq(|bm| {
            let page = pa.page_index();
            if page >= bm.max_pages {
                return Err(FrameError::OutOfRange(pa));
            }
            if bm.test(page) {
                bm.clear(page);
                bm.allocated -= 1;
            }
            Ok(())
        })
    }

    /// Return a 2 MiB page obtained from [`allocate_huge_page`](Self::allocate_huge_page).
    ///
    /// # Errors
    /// - [`FrameError::Misaligned`] if `pa` is not 2 MiB aligned.
    /// - [`FrameError::OutOfRange`] if the huge page extends past the tracked range.
    pub fn free_huge_page(&self, pa: PhysicalAddress) -> Result<(), FrameError> {
        if !pa.is_aligned(HUGE_PAGE_SIZE) {
            return Err(FrameError::Misaligned(pa));
        }

        self.state.with_lock_irq(|bm| {
            let start = pa.page_index();
            if start + HUGE_RUN > bm.max_pages {
                return Err(FrameError::OutOfRange(pa));
            }
            let mut released = 0;
            for page in start..start + HUGE_RUN {
                if bm.test(page) {
                    bm.clear(page);
                    released += 1;
                }
            }
            bm.allocated -= released;
            Ok(())
        })
    }

    /// Mark `[start, start + count)` used if every page in it is currently free.
    ///
    /// Used by the buddy tier to take ownership of frames without ever sharing
    /// them with this allocator.
    pub(crate) fn claim(&self, start: usize, count: usize) -> bool {
        self.state.with_lock_irq(|bm| {
            if count == 0 || start.checked_add(count).is_none_or(|end| end > bm.max_pages) {
                return false;
            }
            if (start..start + count).any(|page| bm.test(page)) {
                return false;
            }
            bm.set_range(start, count);
            bm.allocated += count;
            debug!("frame allocator: {count} pages from page {start} handed to buddy tier");
            true
        })
    }

    /// Whether page `index` is in use. Pages beyond the tracked range count as used.
    #[must_use]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.state
            .with_lock_irq(|bm| index >= bm.max_pages || bm.test(index))
    }

    /// Number of page frames the bitmap tracks.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.state.with_lock_irq(|bm| bm.max_pages)
    }

    /// Number of page frames currently free.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.state.with_lock_irq(|bm| bm.free_pages())
    }

    /// Number of page frames currently marked used.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.state.with_lock_irq(|bm| bm.allocated)
    }
}

impl FrameAlloc for FrameAllocator {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.allocate_page().ok()
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        if let Err(err) = self.free_page(pa) {
            debug!("frame allocator: ignoring page-table frame free: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestMemory, TestMemoryExt};
    use kernel_info::boot::MemoryRegion;

    const MIB: u64 = 1024 * 1024;

    fn allocator(mem: &TestMemory, regions: &mut [MemoryRegion]) -> FrameAllocator {
        unsafe { FrameAllocator::init(regions, mem.direct_map()) }.expect("init")
    }

    #[test]
    fn bitmap_is_carved_from_first_fitting_region() {
        let mem = TestMemory::new(8 * MIB);
        let mut regions = [
            MemoryRegion::reserved(0, 0x1_0000),
            MemoryRegion::usable(0x1_0000, 8 * MIB - 0x1_0000),
        ];
        let frames = allocator(&mem, &mut regions);

        assert_eq!(frames.total_pages(), 2048);
        // 16 reserved pages + 1 bitmap page.
        assert_eq!(frames.allocated_pages(), 17);
        assert_eq!(regions[1].base, 0x1_1000);
        assert!(frames.is_allocated(16));
        assert!(!frames.is_allocated(17));
    }

    #[test]
    fn empty_map_is_rejected() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::reserved(0, MIB)];
        let err = unsafe { FrameAllocator::init(&mut regions, mem.direct_map()) }.err();
        assert_eq!(err, Some(InitError::NoUsableMemory));
    }

    #[test]
    fn single_pages_rotate_through_memory() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        let a = frames.allocate_page().unwrap();
        let b = frames.allocate_page().unwrap();
        assert_eq!(a.as_u64(), 0x1000);
        assert_eq!(b.as_u64(), 0x2000);

        // The cursor does not move back to a freed page until it wraps.
        frames.free_page(a).unwrap();
        let c = frames.allocate_page().unwrap();
        assert_eq!(c.as_u64(), 0x3000);
    }

    #[test]
    fn cursor_wraps_to_reuse_freed_pages() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        let free = frames.free_pages();
        let pages: Vec<_> = (0..free).map(|_| frames.allocate_page().unwrap()).collect();
        assert_eq!(frames.allocate_page(), Err(FrameError::OutOfMemory));

        frames.free_page(pages[5]).unwrap();
        assert_eq!(frames.allocate_page(), Ok(pages[5]));
    }

    #[test]
    fn contiguous_runs_need_adjacent_free_pages() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        let a = frames.allocate_page().unwrap();
        let b = frames.allocate_page().unwrap();
        let c = frames.allocate_page().unwrap();
        let rest = frames.free_pages();
        let _tail = frames.allocate_pages(rest).unwrap();

        // Two isolated free pages do not form a run.
        frames.free_page(a).unwrap();
        frames.free_page(c).unwrap();
        assert_eq!(frames.allocate_pages(2), Err(FrameError::OutOfMemory));

        frames.free_page(b).unwrap();
        assert_eq!(frames.allocate_pages(3), Ok(a));
    }

    #[test]
    fn oversized_runs_fail_without_overflow() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        // Move the cursor off zero so a naive `cursor + count` would wrap.
        let page = frames.allocate_page().unwrap();
        let before = frames.free_pages();
        assert_eq!(frames.allocate_pages(usize::MAX), Err(FrameError::OutOfMemory));
        assert_eq!(
            frames.allocate_pages(frames.total_pages() + 1),
            Err(FrameError::OutOfMemory)
        );
        assert!(!frames.claim(page.page_index() + 1, usize::MAX));
        assert_eq!(frames.free_pages(), before);
    }

    #[test]
    fn zero_pages_is_an_error() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);
        assert_eq!(frames.allocate_pages(0), Err(FrameError::ZeroPages));
    }

    #[test]
    fn huge_pages_are_aligned() {
        let mem = TestMemory::new(8 * MIB);
        let mut regions = [MemoryRegion::usable(0, 8 * MIB)];
        let frames = allocator(&mem, &mut regions);

        let huge = frames.allocate_huge_page().unwrap();
        assert!(huge.is_aligned(HUGE_PAGE_SIZE));
        // The bitmap occupies page 0, so the first huge page cannot start at 0.
        assert_eq!(huge.as_u64(), HUGE_PAGE_SIZE);

        let before = frames.free_pages();
        frames.free_huge_page(huge).unwrap();
        assert_eq!(frames.free_pages(), before + HUGE_RUN);
    }

    #[test]
    fn free_validates_address() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        let odd = PhysicalAddress::new(0x1001);
        assert_eq!(frames.free_page(odd), Err(FrameError::Misaligned(odd)));
        let far = PhysicalAddress::new(16 * MIB);
        assert_eq!(frames.free_page(far), Err(FrameError::OutOfRange(far)));
        assert_eq!(
            frames.free_huge_page(PhysicalAddress::new(0x1000)),
            Err(FrameError::Misaligned(PhysicalAddress::new(0x1000)))
        );
    }

    #[test]
    fn double_free_does_not_inflate_counts() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        let before = frames.free_pages();
        let page = frames.allocate_page().unwrap();
        frames.free_page(page).unwrap();
        frames.free_page(page).unwrap();
        assert_eq!(frames.free_pages(), before);
    }

    #[test]
    fn claim_requires_all_pages_free() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        assert!(!frames.claim(0, 2), "page 0 holds the bitmap");
        assert!(frames.claim(4, 4));
        assert!(!frames.claim(6, 1));
        assert!(frames.is_allocated(7));
    }

    #[test]
    fn frame_alloc_trait_hands_out_pages() {
        let mem = TestMemory::new(MIB);
        let mut regions = [MemoryRegion::usable(0, MIB)];
        let frames = allocator(&mem, &mut regions);

        let before = frames.free_pages();
        let pa = frames.alloc_4k().expect("frame");
        frames.free_4k(pa);
        assert_eq!(frames.free_pages(), before);

        // Invalid frees are logged and dropped.
        frames.free_4k(PhysicalAddress::new(16 * MIB));
        frames.free_4k(PhysicalAddress::new(0x1234));
        assert_eq!(frames.free_pages(), before);
    }
}
