use core::ptr::NonNull;
use kernel_alloc::Heap;
use log::trace;

/// Returned in `rax` for an unknown system call number.
pub const ENOSYS: u64 = u64::MAX;

/// Returned in `rax` when a pointer argument is null.
pub const EFAULT: u64 = u64::MAX - 1;

/// System call numbers understood by [`dispatch`].
#[repr(u64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sysno {
    /// `malloc(size) -> ptr | 0`
    Malloc = 10,
    /// `realloc(ptr, size) -> ptr | 0`
    Realloc = 11,
    /// `free(ptr)`
    Free = 12,
    /// `allocator_stats(out: *mut u64)`, writes the free byte count.
    AllocatorStats = 13,
}

impl TryFrom<u64> for Sysno {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Self::Malloc),
            11 => Ok(Self::Realloc),
            12 => Ok(Self::Free),
            13 => Ok(Self::AllocatorStats),
            other => Err(other),
        }
    }
}

/// The registers a system call reads and writes.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct SyscallFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
}

impl SyscallFrame {
    #[must_use]
    pub const fn new(sysno: u64, arg0: u64, arg1: u64) -> Self {
        Self {
            rax: sysno,
            rdi: arg0,
            rsi: arg1,
            rdx: 0,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_ptr(addr: u64) -> Option<NonNull<u8>> {
    NonNull::new(core::ptr::with_exposed_provenance_mut(addr as usize))
}

fn to_addr(ptr: NonNull<u8>) -> u64 {
    ptr.as_ptr().expose_provenance() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn sys_malloc(heap: &Heap, size: u64) -> u64 {
    heap.allocate(size as usize).map_or(0, to_addr)
}

/// # Safety
/// `addr` must be zero or a live allocation of `heap`.
#[allow(clippy::cast_possible_truncation)]
unsafe fn sys_realloc(heap: &Heap, addr: u64, size: u64) -> u64 {
    let Some(ptr) = to_ptr(addr) else {
        return sys_malloc(heap, size);
    };
    if size == 0 {
        // SAFETY: Guaranteed by the caller.
        unsafe { heap.free(ptr) };
        return 0;
    }
    // SAFETY: Guaranteed by the caller.
    unsafe { heap.reallocate(ptr, size as usize) }.map_or(0, to_addr)
}

/// # Safety
/// `addr` must be zero or a live allocation of `heap`.
unsafe fn sys_free(heap: &Heap, addr: u64) -> u64 {
    if let Some(ptr) = to_ptr(addr) {
        // SAFETY: Guaranteed by the caller.
        unsafe { heap.free(ptr) };
    }
    0
}

/// # Safety
/// `out` must be zero or point to a writable `u64`.
unsafe fn sys_allocator_stats(heap: &Heap, out: u64) -> u64 {
    let Some(out) = to_ptr(out) else {
        return EFAULT;
    };
    // SAFETY: Guaranteed by the caller.
    unsafe { out.cast::<u64>().write_unaligned(heap.free_bytes() as u64) };
    0
}

/// Service the system call described by `frame` and store the result in
/// `frame.rax`.
///
/// Allocation failures are reported as a null return, unknown numbers as
/// [`ENOSYS`].
///
/// # Safety
/// Pointer arguments are trusted: they must be null, allocations of `heap`
/// (for `realloc`/`free`), or writable (for `allocator_stats`).
pub unsafe fn dispatch(heap: &Heap, frame: &mut SyscallFrame) {
    let (arg0, arg1) = (frame.rdi, frame.rsi);

    // SAFETY: Forwarded from the caller.
    frame.rax = unsafe {
        match Sysno::try_from(frame.rax) {
            Ok(Sysno::Malloc) => sys_malloc(heap, arg0),
            Ok(Sysno::Realloc) => sys_realloc(heap, arg0, arg1),
            Ok(Sysno::Free) => sys_free(heap, arg0),
            Ok(Sysno::AllocatorStats) => sys_allocator_stats(heap, arg0),
            Err(sysno) => {
                trace!("unknown system call {sysno}");
                ENOSYS
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_match_the_user_library() {
        assert_eq!(Sysno::Malloc as u64, 10);
        assert_eq!(Sysno::try_from(11), Ok(Sysno::Realloc));
        assert_eq!(Sysno::try_from(12), Ok(Sysno::Free));
        assert_eq!(Sysno::try_from(13), Ok(Sysno::AllocatorStats));
        assert_eq!(Sysno::try_from(1), Err(1));
    }

    #[test]
    fn null_addresses_are_not_pointers() {
        assert!(to_ptr(0).is_none());
        assert!(to_ptr(0x1000).is_some());
    }
}
