use crate::mem::block::Block;
use crate::types::{Size, StablePtr, WORD_SIZE};
use crate::utils::mem_context::MemContext;

/// Free list links are stored as offsets from the heap base, one word each. A zero link is
/// "none": nothing but the allocator's own table lives at the base.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct HeapBase(pub(crate) StablePtr);

impl HeapBase {
    #[inline]
    pub fn encode(&self, block: Option<Block>) -> Size {
        match block {
            None => 0,
            Some(b) => {
                debug_assert!(b.ptr() > self.0, "Block {} is below the heap base", b.ptr());
                debug_assert!(b.ptr() - self.0 <= Size::MAX as StablePtr);

                (b.ptr() - self.0) as Size
            }
        }
    }

    #[inline]
    pub fn decode(&self, link: Size) -> Option<Block> {
        if link == 0 {
            None
        } else {
            Some(Block(self.0 + link as StablePtr))
        }
    }

    #[inline]
    pub fn ptr(&self, relative: u64) -> StablePtr {
        self.0 + relative
    }
}

impl Block {
    #[inline]
    fn next_free_link_ptr(&self) -> StablePtr {
        self.ptr()
    }

    #[inline]
    fn prev_free_link_ptr(&self) -> StablePtr {
        self.ptr() + WORD_SIZE as StablePtr
    }

    pub fn get_next_free<M: MemContext>(&self, context: &M, base: HeapBase) -> Option<Block> {
        base.decode(context.read_word(self.next_free_link_ptr()))
    }

    pub fn set_next_free<M: MemContext>(
        &self,
        context: &mut M,
        base: HeapBase,
        next: Option<Block>,
    ) {
        context.write_word(self.next_free_link_ptr(), base.encode(next));
    }

    pub fn get_prev_free<M: MemContext>(&self, context: &M, base: HeapBase) -> Option<Block> {
        base.decode(context.read_word(self.prev_free_link_ptr()))
    }

    pub fn set_prev_free<M: MemContext>(
        &self,
        context: &mut M,
        base: HeapBase,
        prev: Option<Block>,
    ) {
        context.write_word(self.prev_free_link_ptr(), base.encode(prev));
    }
}
