//! # Slab Caches
//!
//! Each [`ObjectCache`] serves fixed-size objects carved from single buddy
//! pages. A slab is one page: a [`SlabHeader`] at the base, followed by
//! `(4096 - header) / object_size` objects. Free objects are chained through
//! their first word.
//!
//! ```text
//! +-------------+--------+--------+-----+--------+--------+
//! | SlabHeader  | obj 0  | obj 1  | ... | obj n-1| unused |
//! +-------------+--------+--------+-----+--------+--------+
//! ^ page base   ^ page base + 48
//! ```
//!
//! Slabs sit on one of three lists by occupancy: *free* (no live objects),
//! *partial*, or *full*. Allocation prefers partial slabs, then free ones,
//! then grows by one page. A slab that becomes empty goes to the free list;
//! when more than the retention limit are free, the newly emptied one is
//! returned to the buddy tier.
//!
//! The cache lock is never held across a call into the buddy tier.

use crate::buddy::{BuddyAllocator, BuddyError};
use crate::size_class::PAGE;
use core::ptr::NonNull;
use kernel_sync::SpinLock;
use log::trace;

/// Errors reported by a slab cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SlabError {
    #[error("cannot grow slab cache: {0}")]
    Grow(#[from] BuddyError),
    #[error("slab on an allocation list has no free object")]
    EmptySlab,
}

#[repr(C)]
struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

/// Bookkeeping at the base of every slab page.
#[repr(C)]
struct SlabHeader {
    free_list: Option<NonNull<FreeObject>>,
    live: usize,
    next: Option<NonNull<SlabHeader>>,
    prev: Option<NonNull<SlabHeader>>,
    cache_id: usize,
    page: NonNull<u8>,
}

/// Bytes reserved for the header at the start of each slab.
pub const SLAB_HEADER_SIZE: usize = size_of::<SlabHeader>();

/// Header of the slab page containing `object`.
fn slab_of(object: NonNull<u8>) -> Option<NonNull<SlabHeader>> {
    let offset = object.addr().get() % PAGE;
    NonNull::new(object.as_ptr().wrapping_sub(offset).cast())
}

/// Occupancy class of a slab.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlabState {
    Free,
    Partial,
    Full,
}

/// Doubly-linked list of slab headers.
struct SlabList {
    head: Option<NonNull<SlabHeader>>,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// # Safety
    /// `slab` must be a valid header that is on no list.
    unsafe fn push_front(&mut self, slab: NonNull<SlabHeader>) {
        // SAFETY: Guaranteed by the caller; the old head is valid by the list invariant.
        unsafe {
            (*slab.as_ptr()).prev = None;
            (*slab.as_ptr()).next = self.head;
            if let Some(head) = self.head {
                (*head.as_ptr()).prev = Some(slab);
            }
        }
        self.head = Some(slab);
        self.len += 1;
    }

    /// # Safety
    /// `slab` must be on this list.
    unsafe fn remove(&mut self, slab: NonNull<SlabHeader>) {
        // SAFETY: Guaranteed by the caller; neighbours are valid headers.
        unsafe {
            let SlabHeader { prev, next, .. } = *slab.as_ptr();
            match prev {
                Some(prev) => (*prev.as_ptr()).next = next,
                None => self.head = next,
            }
            if let Some(next) = next {
                (*next.as_ptr()).prev = prev;
            }
            (*slab.as_ptr()).prev = None;
            (*slab.as_ptr()).next = None;
        }
        self.len -= 1;
    }

    fn iter(&self) -> impl Iterator<Item = NonNull<SlabHeader>> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let slab = cursor?;
            // SAFETY: Every entry is a valid header.
            cursor = unsafe { (*slab.as_ptr()).next };
            Some(slab)
        })
    }

    fn contains(&self, slab: NonNull<SlabHeader>) -> bool {
        self.iter().any(|s| s == slab)
    }
}

struct CacheLists {
    free: SlabList,
    partial: SlabList,
    full: SlabList,
}

// SAFETY: Slab headers are only reached through the owning cache's lock.
unsafe impl Send for CacheLists {}

impl CacheLists {
    /// Pop an object from `slab` and move the slab to its new list.
    ///
    /// # Safety
    /// `slab` must be on the free or partial list.
    unsafe fn take_from(&mut self, slab: NonNull<SlabHeader>, per_slab: usize) -> Option<NonNull<u8>> {
        // SAFETY: Guaranteed by the caller.
        unsafe {
            let header = slab.as_ptr();
            let object = (*header).free_list?;
            (*header).free_list = (*object.as_ptr()).next;
            (*header).live += 1;

            let live = (*header).live;
            if live == 1 {
                self.free.remove(slab);
                if live == per_slab {
                    self.full.push_front(slab);
                } else {
                    self.partial.push_front(slab);
                }
            } else if live == per_slab {
                self.partial.remove(slab);
                self.full.push_front(slab);
            }
            Some(object.cast())
        }
    }

    fn take_object(&mut self, per_slab: usize) -> Option<NonNull<u8>> {
        let slab = self.partial.head.or(self.free.head)?;
        // SAFETY: `slab` was taken from the partial or free list.
        unsafe { self.take_from(slab, per_slab) }
    }

    /// Push `object` back onto `slab`. Returns the slab's page if it should be
    /// released to the buddy tier.
    ///
    /// # Safety
    /// `object` must be a live object of `slab`.
    unsafe fn put_object(
        &mut self,
        slab: NonNull<SlabHeader>,
        object: NonNull<u8>,
        per_slab: usize,
        max_free: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Guaranteed by the caller.
        unsafe {
            let header = slab.as_ptr();
            let object = object.cast::<FreeObject>();
            object.write(FreeObject {
                next: (*header).free_list,
            });
            (*header).free_list = Some(object);
            (*header).live -= 1;

            let live = (*header).live;
            if live + 1 == per_slab {
                self.full.remove(slab);
                if live == 0 {
                    self.free.push_front(slab);
                } else {
                    self.partial.push_front(slab);
                }
            } else if live == 0 {
                self.partial.remove(slab);
                self.free.push_front(slab);
            }

            if live == 0 && self.free.len > max_free {
                self.free.remove(slab);
                return Some((*header).page);
            }
        }
        None
    }
}

/// Usage snapshot of one cache.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub free_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub live_objects: usize,
}

/// A cache of equally sized objects backed by one-page slabs.
pub struct ObjectCache {
    id: usize,
    object_size: usize,
    objects_per_slab: usize,
    max_free_slabs: usize,
    lists: SpinLock<CacheLists>,
}

impl ObjectCache {
    /// Create an empty cache. No memory is taken until the first allocation.
    ///
    /// `object_size` is rounded up to a multiple of 8 (at least one link
    /// word) and must leave room for one object after the header.
    #[must_use]
    pub const fn new(id: usize, object_size: usize, max_free_slabs: usize) -> Self {
        let object_size = if object_size < 8 {
            8
        } else {
            object_size.next_multiple_of(8)
        };
        Self {
            id,
            object_size,
            objects_per_slab: (PAGE - SLAB_HEADER_SIZE) / object_size,
            max_free_slabs,
            lists: SpinLock::new(CacheLists {
                free: SlabList::new(),
                partial: SlabList::new(),
                full: SlabList::new(),
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    #[must_use]
    pub const fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    /// Allocate one object, growing by a page from `buddy` if needed.
    ///
    /// # Errors
    /// [`SlabError::Grow`] if the buddy tier has no page to spare.
    pub fn allocate(&self, buddy: &BuddyAllocator) -> Result<NonNull<u8>, SlabError> {
        let per_slab = self.objects_per_slab;
        if let Some(object) = self.lists.with_lock_irq(|l| l.take_object(per_slab)) {
            return Ok(object);
        }

        let page = buddy.allocate_slab_page(self.id)?;
        // SAFETY: The page was just allocated for this cache.
        let slab = unsafe { self.format_slab(page) };
        trace!("slab cache {}: new slab at {page:p}", self.object_size);

        self.lists
            .with_lock_irq(|l| {
                // SAFETY: The freshly formatted slab is on no list.
                unsafe { l.free.push_front(slab) };
                l.take_object(per_slab)
            })
            .ok_or(SlabError::EmptySlab)
    }

    /// Return an object to its slab, releasing the page to `buddy` when the
    /// cache holds too many empty slabs.
    ///
    /// # Safety
    /// `object` must have been allocated from this cache and not freed since.
    pub unsafe fn free(&self, buddy: &BuddyAllocator, object: NonNull<u8>) {
        let Some(slab) = slab_of(object) else {
            return;
        };
        debug_assert_eq!(unsafe { (*slab.as_ptr()).cache_id }, self.id);

        let (per_slab, max_free) = (self.objects_per_slab, self.max_free_slabs);
        // SAFETY: Guaranteed by the caller.
        let release = self
            .lists
            .with_lock_irq(|l| unsafe { l.put_object(slab, object, per_slab, max_free) });

        if let Some(page) = release {
            trace!("slab cache {}: releasing slab at {page:p}", self.object_size);
            // SAFETY: The slab is unlinked and has no live objects.
            unsafe { buddy.free(page) };
        }
    }

    /// Which list holds the slab containing `object`.
    #[must_use]
    pub fn slab_state(&self, object: NonNull<u8>) -> Option<SlabState> {
        let slab = slab_of(object)?;
        self.lists.with_lock_irq(|l| {
            if l.free.contains(slab) {
                Some(SlabState::Free)
            } else if l.partial.contains(slab) {
                Some(SlabState::Partial)
            } else if l.full.contains(slab) {
                Some(SlabState::Full)
            } else {
                None
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.lists.with_lock_irq(|l| {
            let live = |list: &SlabList| -> usize {
                // SAFETY: Every entry is a valid header.
                list.iter().map(|s| unsafe { (*s.as_ptr()).live }).sum()
            };
            CacheStats {
                object_size: self.object_size,
                objects_per_slab: self.objects_per_slab,
                free_slabs: l.free.len,
                partial_slabs: l.partial.len,
                full_slabs: l.full.len,
                live_objects: live(&l.partial) + live(&l.full),
            }
        })
    }

    /// Whether every slab sits on the list matching its live count and the
    /// free list respects the retention limit.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let per_slab = self.objects_per_slab;
        self.lists.with_lock_irq(|l| {
            // SAFETY: Every entry is a valid header.
            let all = |list: &SlabList, ok: &dyn Fn(usize) -> bool| {
                list.iter().all(|s| unsafe { ok((*s.as_ptr()).live) })
                    && list.iter().count() == list.len
            };
            all(&l.free, &|live| live == 0)
                && all(&l.partial, &|live| live > 0 && live < per_slab)
                && all(&l.full, &|live| live == per_slab)
                && l.free.len <= self.max_free_slabs
        })
    }

    /// Write the header and thread every object onto the slab's free chain.
    ///
    /// # Safety
    /// `page` must be an unused, page-aligned 4 KiB block.
    unsafe fn format_slab(&self, page: NonNull<u8>) -> NonNull<SlabHeader> {
        // SAFETY: Offsets stay within the page by construction of `objects_per_slab`.
        unsafe {
            let data = page.add(SLAB_HEADER_SIZE);
            for i in 0..self.objects_per_slab {
                let next = (i + 1 < self.objects_per_slab)
                    .then(|| data.add((i + 1) * self.object_size).cast::<FreeObject>());
                data.add(i * self.object_size)
                    .cast::<FreeObject>()
                    .write(FreeObject { next });
            }

            let header = page.cast::<SlabHeader>();
            header.write(SlabHeader {
                free_list: (self.objects_per_slab > 0).then(|| data.cast()),
                live: 0,
                next: None,
                prev: None,
                cache_id: self.id,
                page,
            });
            header
        }
    }
}
