use crate::types::Size;

const TAB32: [u32; 32] = [
    0, 9, 1, 10, 13, 21, 2, 29, 11, 14, 16, 18, 22, 25, 3, 30, 8, 12, 20, 28, 15, 17, 24, 7, 19,
    27, 23, 6, 26, 5, 4, 31,
];

/// `floor(log2(value))`, `value` should be non-zero
pub fn fast_log2(mut value: Size) -> u32 {
    debug_assert_ne!(value, 0);

    value |= value >> 1;
    value |= value >> 2;
    value |= value >> 4;
    value |= value >> 8;
    value |= value >> 16;

    TAB32[(value.wrapping_mul(0x07C4ACDD) >> 27) as usize]
}

#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
