use core::ptr::NonNull;

/// Link stored in the first bytes of every **free** buddy block.
///
/// ```text
/// +----------------+--------------------------------+
/// | FreeBlock      |   unused remainder of block    |
/// +----------------+--------------------------------+
/// ^ block base
/// ```
#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// Intrusive singly-linked list of free blocks of one buddy order.
///
/// Pushing and popping happen at the head. Removing an arbitrary block is a
/// linear scan, which only happens while coalescing.
///
/// # Invariants
/// - Every entry is a block of the list's order that nobody else references.
/// - `len` equals the number of reachable entries.
pub(crate) struct FreeList {
    head: Option<NonNull<FreeBlock>>,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Link `block` in at the head.
    ///
    /// # Safety
    /// `block` must be writable for at least one pointer, suitably aligned,
    /// and not already on any list.
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        let node = block.cast::<FreeBlock>();
        // SAFETY: The caller hands us exclusive ownership of the block.
        unsafe { node.write(FreeBlock { next: self.head }) };
        self.head = Some(node);
        self.len += 1;
    }

    /// Unlink and return the head block.
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        // SAFETY: Entries are valid `FreeBlock`s by the list invariant.
        self.head = unsafe { node.as_ref().next };
        self.len -= 1;
        Some(node.cast())
    }

    /// Unlink `block` if it is on this list.
    pub(crate) fn remove(&mut self, block: NonNull<u8>) -> bool {
        let target = block.cast::<FreeBlock>();
        let mut link: *mut Option<NonNull<FreeBlock>> = &raw mut self.head;

        // SAFETY: `link` always points either at `self.head` or at the `next`
        // field of a live entry.
        unsafe {
            while let Some(node) = *link {
                if node == target {
                    *link = node.as_ref().next;
                    self.len -= 1;
                    return true;
                }
                link = &raw mut (*node.as_ptr()).next;
            }
        }
        false
    }

    /// Iterate over the blocks on this list.
    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let node = cursor?;
            // SAFETY: Entries are valid `FreeBlock`s by the list invariant.
            cursor = unsafe { node.as_ref().next };
            Some(node.cast())
        })
    }
}
