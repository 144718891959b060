//! Rounding helpers for block sizes and page sizes.

/// Round `value` up to the next multiple of `align`.
///
/// `align` must be a power of two. Returns `None` on overflow.
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` up to a multiple of `page`, which need not be a power of
/// two.
#[inline]
pub(crate) const fn round_to_page(value: usize, page: usize) -> Option<usize> {
    let pad = (page - value % page) % page;
    value.checked_add(pad)
}

/// Is `value` a multiple of `align`?
#[inline]
pub(crate) const fn is_aligned(value: usize, align: usize) -> bool {
    value % align == 0
}
