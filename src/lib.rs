#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

use cfg_if::cfg_if;

mod align;
mod error;
mod header;
mod heap;
mod os;

pub use error::HeapError;
pub use heap::{BlockInfo, Blocks, Heap, HeapStats, Report};

cfg_if! {
    if #[cfg(feature = "locked_heap")] {
        use core::{alloc::Layout, ptr::NonNull};

        mod locked_heap;
        pub use locked_heap::{Lock, LockedHeap, SingleThreadedLock, SpinLock};

        pub mod global;
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
