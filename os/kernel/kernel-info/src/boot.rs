//! # Boot Memory Map
//!
//! The bootloader hands the kernel a list of physical memory ranges. Only
//! [`MemoryRegionKind::Usable`] ranges may ever be handed out by an allocator;
//! everything else (firmware data, ACPI tables, MMIO holes, the kernel image)
//! is reported so that the allocators can size their bookkeeping to cover the
//! whole address space up to the highest usable byte.

use crate::memory::PAGE_SIZE;

/// Classification of a physical memory range.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM that allocators may use.
    Usable = 0,
    /// Anything else; never allocated.
    Reserved = 1,
    /// Firmware data that may be reclaimed once it has been consumed.
    BootloaderReclaimable = 2,
    /// The kernel image and modules.
    KernelAndModules = 3,
}

/// One entry of the boot memory map.
///
/// Keep this `#[repr(C)]`; the bootloader writes these at the ABI boundary.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address of the range.
    pub base: u64,
    /// Length of the range in **bytes**.
    pub length: u64,
    /// What the range may be used for.
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Reserved)
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    #[inline]
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.kind == MemoryRegionKind::Usable
    }

    /// Removes `bytes` from the front of the region.
    ///
    /// A region left with less than one page is downgraded to
    /// [`MemoryRegionKind::Reserved`] so that nobody tries to carve a page
    /// out of the remainder.
    pub fn consume_front(&mut self, bytes: u64) {
        let bytes = bytes.min(self.length);
        self.base += bytes;
        self.length -= bytes;
        if self.length < PAGE_SIZE {
            self.kind = MemoryRegionKind::Reserved;
        }
    }
}

/// Summaries over a boot memory map.
pub trait MemoryMap {
    /// Sum of the lengths of all reported regions, usable or not.
    fn total_memory(&self) -> u64;

    /// Exclusive end of the highest usable region, or `0` if there is none.
    fn highest_usable_address(&self) -> u64;

    /// Iterate over the usable regions only.
    fn usable(&self) -> impl Iterator<Item = &MemoryRegion>;
}

impl MemoryMap for [MemoryRegion] {
    fn total_memory(&self) -> u64 {
        self.iter().map(|r| r.length).sum()
    }

    fn highest_usable_address(&self) -> u64 {
        self.usable().map(MemoryRegion::end).max().unwrap_or(0)
    }

    fn usable(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.iter().filter(|r| r.is_usable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_cover_reserved_and_usable() {
        let map = [
            MemoryRegion::reserved(0, 0x1000),
            MemoryRegion::usable(0x1000, 0x9000),
            MemoryRegion::reserved(0xA000, 0x6000),
            MemoryRegion::usable(0x10_0000, 0x10_0000),
        ];
        assert_eq!(map.total_memory(), 0x1000 + 0x9000 + 0x6000 + 0x10_0000);
        assert_eq!(map.highest_usable_address(), 0x20_0000);
        assert_eq!(map.usable().count(), 2);
    }

    #[test]
    fn empty_map_has_no_usable_top() {
        let map: [MemoryRegion; 0] = [];
        assert_eq!(map.highest_usable_address(), 0);
    }

    #[test]
    fn consume_front_downgrades_tiny_remainder() {
        let mut r = MemoryRegion::usable(0x10_0000, 0x2800);
        r.consume_front(0x2000);
        assert_eq!(r.base, 0x10_2000);
        assert_eq!(r.length, 0x800);
        assert_eq!(r.kind, MemoryRegionKind::Reserved);

        let mut r = MemoryRegion::usable(0, 0x3000);
        r.consume_front(0x1000);
        assert!(r.is_usable());
    }
}
