//! # Memory Layout

/// Size of a base page frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Number of base pages in a huge page.
pub const HUGE_PAGE_PAGES: u64 = 512;

/// Size of a huge page in bytes (2 MiB).
pub const HUGE_PAGE_SIZE: u64 = HUGE_PAGE_PAGES * PAGE_SIZE;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Align `x` down to a multiple of `a` (power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to a multiple of `a` (power of two).
///
/// `x + a - 1` must not overflow.
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(HUGE_PAGE_SIZE == 2 * 1024 * 1024);
    assert!(HHDM_BASE.is_multiple_of(HUGE_PAGE_SIZE));
};
