//! A `Heap` behind a single lock.
//!
//! Split and coalesce move block boundaries around non-locally, so the whole
//! heap is guarded by one lock rather than anything finer grained. Wrapping it
//! this way also lets a heap serve as an `Allocator` for collections:
//!
//! ```
//! use allocator_api2::vec::Vec;
//! use region_heap::{Heap, LockedHeap, SingleThreadedLock};
//!
//! let heap = LockedHeap::new(Heap::new(4096)?, SingleThreadedLock::new());
//!
//! let mut v = Vec::new_in(&heap);
//! v.extend([1u32, 2, 3]);
//! assert_eq!(v.iter().sum::<u32>(), 6);
//! # Ok::<(), region_heap::HeapError>(())
//! ```

use core::ptr;

use super::*;
use crate::header::{BLOCK_ALIGN, WORD_BYTES};

mod mutex;
use mutex::Mutex;
pub use mutex::{Lock, SingleThreadedLock, SpinLock};

/// A [`Heap`] guarded by a lock of type `L`.
///
/// With a `Sync` lock such as [`SpinLock`], a `LockedHeap` can be shared
/// between threads. With [`SingleThreadedLock`] it cannot, but re-entrant use
/// is still caught.
pub struct LockedHeap<L>
where
    L: Lock,
{
    heap: Mutex<Heap, L>,
}

impl<L> LockedHeap<L>
where
    L: Lock,
{
    /// Put `heap` behind `lock`.
    #[inline]
    pub const fn new(heap: Heap, lock: L) -> Self {
        LockedHeap {
            heap: Mutex::new(heap, lock),
        }
    }

    /// Take the heap back out of its lock.
    #[inline]
    pub fn into_inner(self) -> Heap {
        self.heap.into_inner()
    }

    /// Lock the heap and run `f` on it.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        let mut heap = self.heap.lock();
        f(&mut heap)
    }

    /// See [`Heap::allocate`].
    #[inline]
    pub fn allocate_block(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.with(|heap| heap.allocate(size))
    }

    /// See [`Heap::release`].
    #[inline]
    pub fn release(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.with(|heap| heap.release(ptr))
    }

    /// See [`Heap::stats`].
    #[inline]
    pub fn stats(&self) -> HeapStats {
        self.with(|heap| heap.stats())
    }

    /// See [`Heap::dump`].
    #[inline]
    pub fn dump(&self) {
        self.with(|heap| heap.dump())
    }
}

/// A well-aligned, non-null pointer for zero-sized allocations. It never
/// points into the heap.
#[inline]
fn dangling(layout: Layout) -> NonNull<[u8]> {
    let ptr = ptr::without_provenance_mut::<u8>(layout.align());
    // Safety: alignments are never zero.
    let ptr = unsafe { NonNull::new_unchecked(ptr) };
    NonNull::slice_from_raw_parts(ptr, 0)
}

unsafe impl<L> Allocator for LockedHeap<L>
where
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > BLOCK_ALIGN {
            log::debug!("refusing over-aligned layout {layout:?}");
            return Err(AllocError);
        }
        if layout.size() == 0 {
            return Ok(dangling(layout));
        }

        let (ptr, len) = self
            .with(|heap| heap.allocate_with_len(layout.size()))
            .map_err(|e| {
                log::debug!("allocate({layout:?}) failed: {e}");
                AllocError
            })?;

        debug_assert!(len >= layout.size());
        debug_assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
        debug_assert_eq!(len % BLOCK_ALIGN, BLOCK_ALIGN - WORD_BYTES);

        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        if let Err(e) = self.release(ptr.as_ptr()) {
            log::error!("deallocate({ptr:p}, {layout:?}) failed: {e}");
            if cfg!(debug_assertions) {
                panic!("deallocating {ptr:p} with {layout:?} failed: {e}");
            }
        }
    }
}
