use crate::types::{
    Size, ALIGNMENT, MIN_BLOCK_SIZE, SEG_CLASS_COUNT, SMALL_SEG_CLASS_COUNT, WIDEN_STEP,
};
use crate::utils::math::fast_log2;
use std::cmp::min;

pub type SegClassId = usize;

/// Classes below this one keep blocks of one exact size each
pub const FIRST_RANGE_SEG_CLASS: SegClassId = SMALL_SEG_CLASS_COUNT;

const MAX_SMALL_SIZE: Size = MIN_BLOCK_SIZE + (SMALL_SEG_CLASS_COUNT as Size - 1) * ALIGNMENT;

/// Maps a (physical, already aligned) block size to its segregation class. Used both to look
/// for a block and to decide where a freed block goes.
pub fn get_seg_class_id(size: Size) -> SegClassId {
    debug_assert!(size >= MIN_BLOCK_SIZE, "Block size {} is too small", size);

    if size <= MAX_SMALL_SIZE {
        return ((size - MIN_BLOCK_SIZE) / ALIGNMENT) as SegClassId;
    }

    min(fast_log2(size) as SegClassId, SEG_CLASS_COUNT - 1)
}

#[inline]
pub fn is_small(seg_class_id: SegClassId) -> bool {
    seg_class_id < FIRST_RANGE_SEG_CLASS
}

/// Where the search goes on when the exact small class has nothing to offer
#[inline]
pub fn widen(seg_class_id: SegClassId) -> SegClassId {
    min(seg_class_id + WIDEN_STEP, FIRST_RANGE_SEG_CLASS)
}
