//! The operating-system side of the heap: page size and the one mapping.

use core::ptr::{self, NonNull};
use std::io;

/// The system page size.
pub(crate) fn page_size() -> usize {
    // Safety: `sysconf` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Map `len` bytes of private, zero-filled, read/write memory.
pub(crate) fn map(len: usize) -> io::Result<NonNull<u8>> {
    debug_assert_ne!(len, 0);

    // Safety: an anonymous mapping with a null hint does not alias anything.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

/// Unmap a region previously returned by [`map`].
///
/// ### Safety
///
/// `ptr` and `len` must describe exactly one live mapping from [`map`], and
/// nothing may reference that memory afterwards.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    let rc = libc::munmap(ptr.as_ptr().cast(), len);
    if rc != 0 {
        log::warn!(
            "munmap({ptr:p}, {len}) failed: {}",
            io::Error::last_os_error()
        );
    }
}
