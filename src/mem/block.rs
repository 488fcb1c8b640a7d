use crate::types::{Size, StablePtr, ALIGNMENT, WORD_SIZE};
use crate::utils::mem_context::MemContext;

pub(crate) const ALLOCATED: Size = 0b01;
pub(crate) const PREV_ALLOCATED: Size = 0b10;
pub(crate) const SIZE_MASK: Size = !(ALIGNMENT - 1);

#[inline]
pub(crate) fn pack(size: Size, prev_allocated: bool, allocated: bool) -> Size {
    debug_assert_eq!(size & !SIZE_MASK, 0, "Unaligned block size {}", size);

    let mut word = size;
    if prev_allocated {
        word |= PREV_ALLOCATED;
    }
    if allocated {
        word |= ALLOCATED;
    }

    word
}

/// A block, addressed by its payload pointer.
///
/// ```text
/// allocated: | header | payload ...                           |
/// free:      | header | next link | prev link | ... | footer |
/// ```
///
/// The header word keeps the physical size of the block (header included), its own allocation
/// bit and the allocation bit of its physical predecessor. Allocated blocks have no footer:
/// their status is mirrored into the successor's header, so the successor's `PREV_ALLOCATED`
/// bit must always be equal to this block's `ALLOCATED` bit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Block(pub(crate) StablePtr);

impl Block {
    #[inline]
    pub fn ptr(&self) -> StablePtr {
        self.0
    }

    #[inline]
    fn header_ptr(&self) -> StablePtr {
        self.0 - WORD_SIZE as StablePtr
    }

    #[inline]
    pub fn read_header<M: MemContext>(&self, context: &M) -> Size {
        context.read_word(self.header_ptr())
    }

    #[inline]
    pub fn write_header<M: MemContext>(
        &self,
        context: &mut M,
        size: Size,
        prev_allocated: bool,
        allocated: bool,
    ) {
        context.write_word(self.header_ptr(), pack(size, prev_allocated, allocated));
    }

    #[inline]
    pub fn size<M: MemContext>(&self, context: &M) -> Size {
        self.read_header(context) & SIZE_MASK
    }

    #[inline]
    pub fn is_free<M: MemContext>(&self, context: &M) -> bool {
        self.read_header(context) & ALLOCATED == 0
    }

    #[inline]
    pub fn is_prev_allocated<M: MemContext>(&self, context: &M) -> bool {
        self.read_header(context) & PREV_ALLOCATED == PREV_ALLOCATED
    }

    pub fn set_prev_allocated<M: MemContext>(&self, context: &mut M, prev_allocated: bool) {
        let header = self.read_header(context);
        let header = if prev_allocated {
            header | PREV_ALLOCATED
        } else {
            header & !PREV_ALLOCATED
        };

        context.write_word(self.header_ptr(), header);
    }

    /// Only free blocks have a footer
    #[inline]
    pub fn footer_ptr(&self, size: Size) -> StablePtr {
        self.0 + size as StablePtr - (WORD_SIZE * 2) as StablePtr
    }

    #[inline]
    pub fn read_footer<M: MemContext>(&self, context: &M, size: Size) -> Size {
        context.read_word(self.footer_ptr(size))
    }

    #[inline]
    pub fn write_footer<M: MemContext>(&self, context: &mut M, size: Size) {
        context.write_word(self.footer_ptr(size), pack(size, false, false));
    }

    /// Writes the header and the footer of a free block of `size` bytes, keeping the
    /// predecessor bit as it is.
    pub fn format_free<M: MemContext>(&self, context: &mut M, size: Size) {
        let prev_allocated = self.is_prev_allocated(context);

        self.write_header(context, size, prev_allocated, false);
        self.write_footer(context, size);
    }

    #[inline]
    pub fn next<M: MemContext>(&self, context: &M) -> Block {
        Block(self.0 + self.size(context) as StablePtr)
    }

    /// # Panics
    /// In debug builds, if the predecessor is allocated (it has no footer then).
    pub fn prev<M: MemContext>(&self, context: &M) -> Block {
        debug_assert!(
            !self.is_prev_allocated(context),
            "Block {} has an allocated predecessor",
            self.0
        );

        let prev_footer = context.read_word(self.0 - (WORD_SIZE * 2) as StablePtr);

        Block(self.0 - (prev_footer & SIZE_MASK) as StablePtr)
    }

    /// Marks this block allocated in both places its status is kept: its own header and the
    /// successor's header.
    pub fn mark_allocated<M: MemContext>(&self, context: &mut M) {
        let header = self.read_header(context);
        context.write_word(self.header_ptr(), header | ALLOCATED);

        self.next(context).set_prev_allocated(context, true);
    }

    /// Writes the free header and footer and clears the mirrored bit in the successor.
    pub fn mark_free<M: MemContext>(&self, context: &mut M) {
        let size = self.size(context);
        self.format_free(context, size);

        self.next(context).set_prev_allocated(context, false);
    }
}
