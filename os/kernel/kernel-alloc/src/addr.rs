//! Physical address and page-index conversions.

use core::fmt;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

/// A physical memory address.
///
/// Never dereferenced directly; translate through a
/// [`DirectMap`](crate::phys_mapper::DirectMap) first.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The base address of page frame `index`.
    #[inline]
    #[must_use]
    pub const fn from_page_index(index: usize) -> Self {
        Self((index as u64) << PAGE_SHIFT)
    }

    /// Index of the page frame containing this address.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_index(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}
