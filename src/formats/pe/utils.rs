//! Utility functions for PE editing

/// Align a value up to the specified alignment. Already aligned values are
/// returned unchanged.
#[inline(always)]
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        value
    } else {
        let rem = value % alignment;
        if rem == 0 {
            value
        } else {
            value.saturating_add(alignment - rem)
        }
    }
}

#[inline(always)]
pub fn align_up_usize(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Round a size up to a whole number of pages
#[inline(always)]
pub fn align_page(value: u32) -> u32 {
    align_up(value, crate::formats::pe::types::PAGE_SIZE)
}

/// Case-insensitive ASCII name comparison used for module names
pub fn names_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
