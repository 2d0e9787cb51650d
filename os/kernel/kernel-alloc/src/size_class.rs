//! Size-to-bucket and size-to-order arithmetic shared by the allocator tiers.

use kernel_info::memory::PAGE_SIZE;

/// Page size as a `usize`.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE: usize = PAGE_SIZE as usize;

/// Smallest slab object.
pub const MIN_OBJECT_SIZE: usize = 16;

/// Largest request served by a slab cache.
pub const MAX_OBJECT_SIZE: usize = PAGE / 2;

/// Number of slab caches.
pub const CACHE_COUNT: usize = 8;

/// Object size of each slab cache.
pub const CACHE_SIZES: [usize; CACHE_COUNT] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Number of buddy orders; blocks range from 4 KiB (order 0) to 4 MiB (order 10).
pub const MAX_ORDER: usize = 11;

/// Largest buddy order.
pub const TOP_ORDER: usize = MAX_ORDER - 1;

/// Index of the slab cache serving `size` bytes.
///
/// Zero-byte requests share the 16-byte bucket.
#[must_use]
pub const fn cache_index(size: usize) -> usize {
    if size <= MIN_OBJECT_SIZE {
        return 0;
    }
    (usize::BITS - (size - 1).leading_zeros()) as usize - 4
}

/// Whether `size` bytes are served by the slab tier.
#[must_use]
pub const fn is_slab_size(size: usize) -> bool {
    size <= MAX_OBJECT_SIZE
}

/// Smallest buddy order whose block holds `size` bytes.
///
/// May exceed [`TOP_ORDER`]; callers reject such requests.
#[must_use]
pub const fn order_for_size(size: usize) -> usize {
    let pages = size.div_ceil(PAGE);
    if pages <= 1 {
        return 0;
    }
    pages.next_power_of_two().trailing_zeros() as usize
}

/// Size in bytes of a block of `order`.
#[must_use]
pub const fn order_size(order: usize) -> usize {
    PAGE << order
}
