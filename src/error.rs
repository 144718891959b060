use std::io;
use thiserror::Error;

/// Errors returned by heap operations.
///
/// Every check that can produce one of these runs before the heap is
/// modified, so an `Err` always means the block list is untouched.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The process-wide heap has not been initialized.
    #[error("heap is not initialized")]
    NotInitialized,

    /// The process-wide heap was already initialized by an earlier call.
    #[error("heap has already been initialized")]
    AlreadyInitialized,

    /// A size or pointer argument was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A pointer lies outside of the heap's payload range.
    #[error("pointer {addr:#x} is outside of the heap")]
    OutOfRange {
        /// The offending address.
        addr: usize,
    },

    /// A pointer names a block that is already free.
    #[error("double free of block at {addr:#x}")]
    DoubleFree {
        /// The offending address.
        addr: usize,
    },

    /// No free block is large enough.
    #[error("out of memory (requested: {size} bytes)")]
    OutOfMemory {
        /// The requested payload size.
        size: usize,
    },

    /// The operating system refused to map the region.
    #[error("cannot allocate heap region: {0}")]
    Map(#[source] io::Error),
}

pub(crate) type Result<T> = core::result::Result<T, HeapError>;
