//! Per-page metadata for the buddy tier.
//!
//! One 16-bit record per physical page frame. Only the record at a block's
//! base page is authoritative; records of interior pages are reset whenever
//! a block absorbs its buddy.

use bitfield_struct::bitfield;
use core::ptr::NonNull;

/// Metadata for one physical page.
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct PageMeta {
    /// Buddy order of the block based at this page.
    #[bits(4)]
    pub order: u8,
    /// The block is on a free list.
    pub free: bool,
    /// The page backs a slab.
    pub slab: bool,
    /// Owning slab cache, meaningful when `slab` is set.
    #[bits(4)]
    pub cache: u8,
    #[bits(6)]
    __: u8,
}

impl PageMeta {
    /// Record for a free block of `order`.
    #[must_use]
    pub const fn free_block(order: u8) -> Self {
        Self::new().with_order(order).with_free(true)
    }

    /// Record for an allocated block of `order`.
    #[must_use]
    pub const fn allocated(order: u8) -> Self {
        Self::new().with_order(order)
    }
}

/// The metadata array, indexed by physical page number.
pub(crate) struct PageMetaTable {
    entries: NonNull<PageMeta>,
    len: usize,
}

impl PageMetaTable {
    /// Take over `len` records at `entries` and zero them.
    ///
    /// # Safety
    /// `entries` must point to writable memory for `len` records that stays
    /// valid and unshared for the table's lifetime.
    pub(crate) unsafe fn new_zeroed(entries: NonNull<PageMeta>, len: usize) -> Self {
        // SAFETY: Guaranteed by the caller.
        unsafe { entries.write_bytes(0, len) };
        Self { entries, len }
    }

    fn as_slice(&self) -> &[PageMeta] {
        // SAFETY: `entries` holds `len` initialized records.
        unsafe { core::slice::from_raw_parts(self.entries.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [PageMeta] {
        // SAFETY: As above, with exclusive access through `&mut self`.
        unsafe { core::slice::from_raw_parts_mut(self.entries.as_ptr(), self.len) }
    }

    pub(crate) fn get(&self, page: usize) -> Option<PageMeta> {
        self.as_slice().get(page).copied()
    }

    pub(crate) fn set(&mut self, page: usize, meta: PageMeta) {
        if let Some(slot) = self.as_mut_slice().get_mut(page) {
            *slot = meta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_pack_into_sixteen_bits() {
        let meta = PageMeta::free_block(10).with_slab(true).with_cache(7);
        assert_eq!(meta.order(), 10);
        assert!(meta.free());
        assert!(meta.slab());
        assert_eq!(meta.cache(), 7);
        assert_eq!(meta.into_bits(), 0b0111_11_1010);
        assert_eq!(size_of::<PageMeta>(), 2);
    }

    #[test]
    fn table_ignores_out_of_range_pages() {
        let mut storage = [PageMeta::free_block(3); 4];
        let mut table =
            unsafe { PageMetaTable::new_zeroed(NonNull::from(&mut storage).cast(), 4) };

        assert_eq!(table.get(0), Some(PageMeta::new()));
        table.set(2, PageMeta::allocated(1));
        table.set(9, PageMeta::allocated(1));
        assert_eq!(table.get(2).map(|m| m.order()), Some(1));
        assert_eq!(table.get(4), None);
    }
}
