//! # Direct-Map Address Translation
//!
//! The allocators hand out *virtual* pointers but reason about *physical*
//! page frames: buddy addresses are computed on physical addresses, page
//! metadata is indexed by physical page number, and the bitmap tier returns
//! physical frames for page tables. With a higher-half direct map (HHDM) every
//! physical address `pa` is visible at `offset + pa`, so translation in both
//! directions is a single addition or subtraction.
//!
//! The offset is a runtime value rather than the [`HHDM_BASE`] constant so the
//! same allocator code can run on the host, where "physical memory" is a heap
//! buffer and the offset is that buffer's address.

use crate::addr::PhysicalAddress;
use core::ptr::NonNull;
use kernel_info::memory::HHDM_BASE;

/// Translation between physical addresses and direct-mapped pointers.
///
/// # Safety
/// - The mapping must cover every physical range the allocators touch.
/// - The offset must be aligned to at least the largest buddy block (4 MiB)
///   so that buddy arithmetic on physical and virtual addresses agrees.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirectMap {
    offset: u64,
}

impl Default for DirectMap {
    fn default() -> Self {
        Self::hhdm()
    }
}

impl DirectMap {
    /// The kernel's higher-half direct map.
    #[must_use]
    pub const fn hhdm() -> Self {
        Self { offset: HHDM_BASE }
    }

    /// A direct map at an arbitrary virtual offset.
    #[must_use]
    pub const fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Convert a physical address to a pointer in the current address space.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_virt(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut((self.offset + pa.as_u64()) as usize)
    }

    /// Non-null variant of [`to_virt`](Self::to_virt).
    ///
    /// Returns `None` only for the degenerate "offset 0, address 0" case.
    #[inline]
    #[must_use]
    pub fn to_virt_nonnull(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        NonNull::new(self.to_virt(pa))
    }

    /// Convert a direct-mapped pointer back to its physical address.
    #[inline]
    #[must_use]
    pub fn to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        PhysicalAddress::new((ptr.addr() as u64).wrapping_sub(self.offset))
    }

    /// Index of the physical page frame containing `ptr`.
    #[inline]
    #[must_use]
    pub fn page_index<T>(&self, ptr: *const T) -> usize {
        self.to_phys(ptr).page_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_is_symmetric() {
        let dm = DirectMap::with_offset(0x4000_0000);
        let pa = PhysicalAddress::new(0x2000);
        let va = dm.to_virt(pa);
        assert_eq!(va as u64, 0x4000_2000);
        assert_eq!(dm.to_phys(va), pa);
        assert_eq!(dm.page_index(va.wrapping_add(0x123)), 2);
    }

    #[test]
    fn default_is_hhdm() {
        assert_eq!(DirectMap::default().offset(), HHDM_BASE);
    }
}
