/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Page size assumed until `sysconf` has been consulted.
pub const FALLBACK_PAGE_SIZE: usize = 4096;
