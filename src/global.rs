//! The process-wide heap.
//!
//! One heap per process, set up once by [`initialize`] and never torn down.
//! Every other function here fails with [`HeapError::NotInitialized`] until
//! that has happened.
//!
//! ```no_run
//! use region_heap::global;
//!
//! global::initialize(1000)?;
//! let a = global::allocate(100)?;
//! let b = global::allocate(200)?;
//! global::release(a.as_ptr())?;
//! let c = global::allocate(50)?;
//! assert_eq!(a, c);
//! global::dump()?;
//! # let _ = b;
//! # Ok::<(), region_heap::HeapError>(())
//! ```

use std::sync::OnceLock;

use super::*;

static HEAP: OnceLock<LockedHeap<SpinLock>> = OnceLock::new();

fn heap() -> Result<&'static LockedHeap<SpinLock>, HeapError> {
    HEAP.get().ok_or(HeapError::NotInitialized)
}

/// Map the process-wide heap with room for at least `size` bytes.
///
/// Fails with [`HeapError::AlreadyInitialized`] on every call after the first
/// successful one. A failed call leaves the heap uninitialized, so it may be
/// retried.
pub fn initialize(size: usize) -> Result<(), HeapError> {
    if HEAP.get().is_some() {
        log::error!("the process-wide heap has already been initialized");
        return Err(HeapError::AlreadyInitialized);
    }

    let heap = Heap::new(size)?;
    HEAP.set(LockedHeap::new(heap, SpinLock::new()))
        .map_err(|_| {
            log::error!("the process-wide heap was initialized concurrently");
            HeapError::AlreadyInitialized
        })
}

/// See [`Heap::allocate`].
pub fn allocate(size: usize) -> Result<NonNull<u8>, HeapError> {
    heap()?.allocate_block(size)
}

/// See [`Heap::release`].
pub fn release(ptr: *mut u8) -> Result<(), HeapError> {
    heap()?.release(ptr)
}

/// See [`Heap::stats`].
pub fn stats() -> Result<HeapStats, HeapError> {
    Ok(heap()?.stats())
}

/// See [`Heap::dump`].
pub fn dump() -> Result<(), HeapError> {
    heap()?.dump();
    Ok(())
}
