use candid::CandidType;
use serde::{Deserialize, Serialize};

pub const PAGE_SIZE_BYTES: usize = 64 * 1024;

/// Offset of a payload inside the memory context. `EMPTY_PTR` means "null".
pub type StablePtr = u64;
pub type Size = u32;

pub const EMPTY_PTR: StablePtr = 0;
pub const MAGIC: [u8; 4] = [b'S', b'E', b'G', b'L'];

pub const WORD_SIZE: Size = 4;
pub const ALIGNMENT: Size = 8;
pub const MIN_BLOCK_SIZE: Size = 2 * ALIGNMENT;

/// The heap is extended by at least this many bytes at once.
pub const CHUNK_SIZE: Size = 1 << 6;

/**
This allocator uses segregated explicit free lists to track free blocks. There are total 12
segregation classes, each head taking a single Word of space.
Classes 0..6 hold blocks of a single exact size: 16, 24, 32, 40, 48 and 56 bytes.
Classes 6..12 hold ranges: class `i` keeps blocks of `2 ** i` to `2 ** (i + 1) - 1` bytes,
and the last one keeps everything from 2048 bytes up.
 */
pub const SEG_CLASS_COUNT: usize = 12;
pub const SMALL_SEG_CLASS_COUNT: usize = 6;

/// When the exact small class is empty, the search continues this many classes higher.
pub const WIDEN_STEP: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OutOfMemory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    OutOfMemory,
    ZeroSize,
    MisalignedOffset,
    InvalidMagicSequence,
    HeapCorrupted(HeapCorruption),
}

impl From<OutOfMemory> for AllocatorError {
    fn from(_: OutOfMemory) -> Self {
        AllocatorError::OutOfMemory
    }
}

/// The first broken invariant met by the heap checker.
#[derive(CandidType, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum HeapCorruption {
    BadPrologue,
    BadEpilogue { ptr: StablePtr },
    Misaligned { ptr: StablePtr },
    BadBlockSize { ptr: StablePtr, size: Size },
    FooterMismatch { ptr: StablePtr, header: Size, footer: Size },
    PrevAllocMismatch { ptr: StablePtr },
    AdjacentFreeBlocks { ptr: StablePtr },
    WrongSegClass { ptr: StablePtr, expected: u32, actual: u32 },
    BrokenFreeList { seg_class: u32, ptr: StablePtr },
    FreeListCountMismatch { listed: u64, walked: u64 },
    CounterMismatch {
        stored_allocated: u64,
        stored_free: u64,
        walked_allocated: u64,
        walked_free: u64,
    },
}

#[derive(CandidType, Deserialize, Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct HeapReport {
    pub heap_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub allocated_blocks: u64,
    pub free_bytes: u64,
    pub allocated_bytes: u64,
}
