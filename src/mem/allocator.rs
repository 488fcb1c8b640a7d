use crate::mem::block::{Block, ALLOCATED, PREV_ALLOCATED, SIZE_MASK};
use crate::mem::free_block::HeapBase;
use crate::mem::seg_class::{get_seg_class_id, is_small, widen, SegClassId};
use crate::types::{
    AllocatorError, OutOfMemory, Size, StablePtr, ALIGNMENT, CHUNK_SIZE, EMPTY_PTR, MAGIC,
    MIN_BLOCK_SIZE, PAGE_SIZE_BYTES, SEG_CLASS_COUNT, WORD_SIZE,
};
use crate::utils::math::align_up;
use crate::utils::mem_context::MemContext;
use crate::utils::{fatal, isoprint};
use std::cmp::{max, min};
use std::fmt::{Debug, Formatter};
use std::mem::size_of;

// The table sits at the heap base:
// | magic | pad | brk | allocated size | free size | seg class heads ... |
pub(crate) const BRK_OFFSET: u64 = 8;
pub(crate) const ALLOCATED_SIZE_OFFSET: u64 = BRK_OFFSET + size_of::<u64>() as u64;
pub(crate) const FREE_SIZE_OFFSET: u64 = ALLOCATED_SIZE_OFFSET + size_of::<u64>() as u64;
pub(crate) const SEG_CLASS_HEADS_OFFSET: u64 = FREE_SIZE_OFFSET + size_of::<u64>() as u64;
pub(crate) const TABLE_SIZE: u64 =
    SEG_CLASS_HEADS_OFFSET + (SEG_CLASS_COUNT * size_of::<Size>()) as u64;

// Right after the table: a padding word, the prologue (header + footer) and the epilogue header,
// so that every payload stays 8-byte aligned.
pub(crate) const PROLOGUE_OFFSET: u64 = TABLE_SIZE + 2 * WORD_SIZE as u64;
pub(crate) const PROLOGUE_SIZE: Size = ALIGNMENT;
pub(crate) const FIRST_BLOCK_OFFSET: u64 = PROLOGUE_OFFSET + PROLOGUE_SIZE as u64;

/// Segregated free list allocator living inside a [MemContext].
///
/// Everything it knows about the heap (the bucket heads, the break, usage counters) is kept in
/// the managed memory itself, right at `offset`, which makes it possible to [reinit](Self::reinit)
/// the allocator over a heap created earlier.
pub struct SegregatedAllocator<M: MemContext> {
    pub(crate) context: M,
    pub(crate) base: HeapBase,
}

impl<M: MemContext> SegregatedAllocator<M> {
    /// Creates an empty heap at `offset`: the table, the prologue and the epilogue. No free
    /// blocks yet, the first allocation extends the heap.
    pub fn init(offset: u64, context: M) -> Result<Self, AllocatorError> {
        if offset % ALIGNMENT as u64 != 0 {
            return Err(AllocatorError::MisalignedOffset);
        }

        let mut this = Self {
            context,
            base: HeapBase(offset),
        };

        this.reserve(this.base.ptr(FIRST_BLOCK_OFFSET))?;

        let mut table = vec![0u8; FIRST_BLOCK_OFFSET as usize];
        table[0..MAGIC.len()].copy_from_slice(&MAGIC);
        this.context.write(offset, &table);

        this.set_brk(this.base.ptr(FIRST_BLOCK_OFFSET));

        let prologue = Block(this.base.ptr(PROLOGUE_OFFSET));
        prologue.write_header(&mut this.context, PROLOGUE_SIZE, true, true);
        this.context
            .write_word(prologue.ptr(), prologue.read_header(&this.context));

        let epilogue = prologue.next(&this.context);
        epilogue.write_header(&mut this.context, 0, true, true);

        Ok(this)
    }

    /// Attaches to a heap previously created with [init](Self::init) at the same offset.
    pub fn reinit(offset: u64, context: M) -> Result<Self, AllocatorError> {
        if offset % ALIGNMENT as u64 != 0 {
            return Err(AllocatorError::MisalignedOffset);
        }

        if context.size_bytes() < offset + FIRST_BLOCK_OFFSET {
            return Err(AllocatorError::InvalidMagicSequence);
        }

        let mut magic = [0u8; MAGIC.len()];
        context.read(offset, &mut magic);
        if magic != MAGIC {
            return Err(AllocatorError::InvalidMagicSequence);
        }

        let this = Self {
            context,
            base: HeapBase(offset),
        };

        this.check(false).map_err(AllocatorError::HeapCorrupted)?;

        Ok(this)
    }

    /// Tears the allocator down, giving the memory back. The heap inside stays intact.
    pub fn into_context(self) -> M {
        self.context
    }

    pub fn context(&self) -> &M {
        &self.context
    }

    /// Same as [allocate](Self::allocate), but tells why nothing was allocated.
    pub fn try_allocate(&mut self, size: usize) -> Result<StablePtr, AllocatorError> {
        self.debug_check();

        if size == 0 {
            return Err(AllocatorError::ZeroSize);
        }

        let size = Self::adjust_size(size).ok_or(AllocatorError::OutOfMemory)?;

        let block = match self.seek_free_block(size) {
            Some(block) => block,
            None => self.extend(max(size, CHUNK_SIZE))?,
        };

        self.place(block, size);

        Ok(block.ptr())
    }

    /// Returns a payload of at least `size` bytes, aligned to 8 bytes. `None` for zero-sized
    /// requests and when the memory can't grow anymore.
    pub fn allocate(&mut self, size: usize) -> Option<StablePtr> {
        self.try_allocate(size).ok()
    }

    /// Null, out-of-heap, misaligned and not allocated pointers are ignored.
    pub fn deallocate(&mut self, ptr: StablePtr) {
        self.debug_check();

        let block = match self.allocated_block_at(ptr) {
            Some(block) => block,
            None => return,
        };

        let size = block.size(&self.context);
        block.mark_free(&mut self.context);

        self.set_allocated_size(self.get_allocated_size() - size as u64);
        self.set_free_size(self.get_free_size() + size as u64);

        let block = self.coalesce(block);
        let size = block.size(&self.context);

        self.push_free_block(block, size);
    }

    /// Moves the content into a new block of `new_size` bytes. The old block stays untouched if
    /// the new one can't be allocated.
    pub fn reallocate(&mut self, ptr: StablePtr, new_size: usize) -> Option<StablePtr> {
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        if ptr == EMPTY_PTR {
            return self.allocate(new_size);
        }

        let old_block = self.allocated_block_at(ptr)?;
        let old_size = (old_block.size(&self.context) - WORD_SIZE) as usize;

        let new_ptr = self.allocate(new_size)?;

        let mut data = vec![0u8; min(old_size, new_size)];
        self.context.read(ptr, &mut data);
        self.context.write(new_ptr, &data);

        self.deallocate(ptr);

        Some(new_ptr)
    }

    /// Allocates `count * size` zeroed bytes
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<StablePtr> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;

        self.context.write(ptr, &vec![0u8; bytes]);

        Some(ptr)
    }

    /// How many bytes the caller may use at `ptr`
    pub fn usable_size(&self, ptr: StablePtr) -> Option<usize> {
        self.allocated_block_at(ptr)
            .map(|block| (block.size(&self.context) - WORD_SIZE) as usize)
    }

    pub fn read(&self, ptr: StablePtr, offset: usize, buf: &mut [u8]) {
        let size = self
            .usable_size(ptr)
            .unwrap_or_else(|| fatal(&format!("No allocated block at {}", ptr)));

        assert!(
            offset + buf.len() <= size,
            "Block overflow (max {}, provided {})",
            size,
            offset + buf.len()
        );

        self.context.read(ptr + offset as u64, buf);
    }

    pub fn write(&mut self, ptr: StablePtr, offset: usize, data: &[u8]) {
        let size = self
            .usable_size(ptr)
            .unwrap_or_else(|| fatal(&format!("No allocated block at {}", ptr)));

        assert!(
            offset + data.len() <= size,
            "Block overflow (max {}, provided {})",
            size,
            offset + data.len()
        );

        self.context.write(ptr + offset as u64, data);
    }

    /// Bytes taken by allocated blocks, headers included
    pub fn get_allocated_size(&self) -> u64 {
        self.context.read_u64(self.base.ptr(ALLOCATED_SIZE_OFFSET))
    }

    /// Bytes taken by free blocks
    pub fn get_free_size(&self) -> u64 {
        self.context.read_u64(self.base.ptr(FREE_SIZE_OFFSET))
    }

    /// Bytes between the heap base and the break
    pub fn get_heap_size(&self) -> u64 {
        self.brk() - self.base.0
    }

    pub(crate) fn debug_check(&self) {
        if cfg!(any(debug_assertions, feature = "heap_check")) {
            if let Err(e) = self.check(false) {
                fatal(&format!("Heap check failed: {:?}", e));
            }
        }
    }

    fn adjust_size(size: usize) -> Option<Size> {
        if size <= ALIGNMENT as usize {
            return Some(MIN_BLOCK_SIZE);
        }

        if size > Size::MAX as usize {
            return None;
        }

        let adjusted = align_up(size as u64 + WORD_SIZE as u64, ALIGNMENT as u64);

        Size::try_from(adjusted).ok()
    }

    pub(crate) fn allocated_block_at(&self, ptr: StablePtr) -> Option<Block> {
        if ptr == EMPTY_PTR || ptr % ALIGNMENT as u64 != 0 {
            return None;
        }

        if ptr < self.base.ptr(FIRST_BLOCK_OFFSET) || ptr >= self.brk() {
            return None;
        }

        let block = Block(ptr);
        let header = block.read_header(&self.context);
        let size = header & SIZE_MASK;

        if header & !(SIZE_MASK | ALLOCATED | PREV_ALLOCATED) != 0
            || header & ALLOCATED == 0
            || size < MIN_BLOCK_SIZE
            || ptr + size as u64 > self.brk()
        {
            return None;
        }

        // the word before `ptr` may as well be someone's payload, so both neighbors have to agree
        if !block.next(&self.context).is_prev_allocated(&self.context) {
            return None;
        }

        if header & PREV_ALLOCATED == 0 && !self.is_free_block_before(block) {
            return None;
        }

        Some(block)
    }

    fn is_free_block_before(&self, block: Block) -> bool {
        let footer = self
            .context
            .read_word(block.ptr() - (WORD_SIZE * 2) as StablePtr);

        if footer & !SIZE_MASK != 0 || footer < MIN_BLOCK_SIZE {
            return false;
        }

        if block.ptr() - self.base.ptr(FIRST_BLOCK_OFFSET) < footer as u64 {
            return false;
        }

        let prev = Block(block.ptr() - footer as StablePtr);

        prev.read_header(&self.context) & (SIZE_MASK | ALLOCATED) == footer
    }

    /// Takes a free block out of the lists, or `None` if none of them fits.
    fn seek_free_block(&mut self, size: Size) -> Option<Block> {
        let seg_class_id = get_seg_class_id(size);

        let found = if is_small(seg_class_id) {
            if let Some(head) = self.get_seg_class_head(seg_class_id) {
                self.eject_from_free_list(head);

                return Some(head);
            }

            // the skipped classes are only checked when everything above is empty
            let widened = widen(seg_class_id);
            self.first_fit(widened, SEG_CLASS_COUNT, size)
                .or_else(|| self.first_fit(seg_class_id + 1, widened, size))
        } else {
            self.first_fit(seg_class_id, SEG_CLASS_COUNT, size)
        };

        let block = found?;

        self.eject_from_free_list(block);

        Some(block)
    }

    /// First fit in small classes. In range classes the first and the second fitting blocks
    /// are compared and the smaller one wins.
    fn first_fit(&self, from: SegClassId, to: SegClassId, size: Size) -> Option<Block> {
        let mut candidate: Option<(Block, Size)> = None;

        for seg_class_id in from..to {
            let mut cur = self.get_seg_class_head(seg_class_id);

            while let Some(block) = cur {
                let block_size = block.size(&self.context);

                if block_size >= size {
                    if is_small(seg_class_id) {
                        return Some(block);
                    }

                    match candidate {
                        None => candidate = Some((block, block_size)),
                        Some((first, first_size)) => {
                            return if block_size <= first_size {
                                Some(block)
                            } else {
                                Some(first)
                            };
                        }
                    }
                }

                cur = block.get_next_free(&self.context, self.base);
            }
        }

        candidate.map(|(block, _)| block)
    }

    /// Marks the free (and already ejected) `block` allocated, splitting off the tail if it is
    /// big enough to be a block on its own.
    fn place(&mut self, block: Block, size: Size) {
        let block_size = block.size(&self.context);
        let prev_allocated = block.is_prev_allocated(&self.context);

        let allocated = if block_size - size >= MIN_BLOCK_SIZE {
            block.write_header(&mut self.context, size, prev_allocated, true);

            let rest = block.next(&self.context);
            let rest_size = block_size - size;

            rest.write_header(&mut self.context, rest_size, true, false);
            rest.write_footer(&mut self.context, rest_size);
            rest.next(&self.context)
                .set_prev_allocated(&mut self.context, false);

            self.push_free_block(rest, rest_size);

            size
        } else {
            block.mark_allocated(&mut self.context);

            block_size
        };

        self.set_allocated_size(self.get_allocated_size() + allocated as u64);
        self.set_free_size(self.get_free_size() - allocated as u64);
    }

    /// Merges the free `block` (which is in no list) with its free neighbors, taking them out of
    /// their lists. The result is in no list either.
    fn coalesce(&mut self, block: Block) -> Block {
        let size = block.size(&self.context);
        let prev_allocated = block.is_prev_allocated(&self.context);
        let next = block.next(&self.context);
        let next_allocated = !next.is_free(&self.context);

        match (prev_allocated, next_allocated) {
            (true, true) => block,
            (false, false) => {
                let prev = block.prev(&self.context);
                let total = prev.size(&self.context) + size + next.size(&self.context);

                self.eject_from_free_list(prev);
                self.eject_from_free_list(next);
                prev.format_free(&mut self.context, total);

                prev
            }
            (true, false) => {
                let total = size + next.size(&self.context);

                self.eject_from_free_list(next);
                block.format_free(&mut self.context, total);

                block
            }
            (false, true) => {
                let prev = block.prev(&self.context);
                let total = prev.size(&self.context) + size;

                self.eject_from_free_list(prev);
                prev.format_free(&mut self.context, total);

                prev
            }
        }
    }

    /// Grows the heap by `size` bytes, turning them into a free block in place of the old
    /// epilogue. The new block is merged with the old tail block if that one was free.
    fn extend(&mut self, size: Size) -> Result<Block, OutOfMemory> {
        debug_assert_eq!(size % ALIGNMENT, 0);

        let block = Block(self.sbrk(size)?);

        // the old epilogue header knows whether the old tail block is allocated
        let prev_allocated = block.is_prev_allocated(&self.context);
        block.write_header(&mut self.context, size, prev_allocated, false);
        block.write_footer(&mut self.context, size);

        let epilogue = block.next(&self.context);
        epilogue.write_header(&mut self.context, 0, false, true);

        self.set_free_size(self.get_free_size() + size as u64);

        Ok(self.coalesce(block))
    }

    /// Moves the break `increment` bytes forward, returning the old one. The memory context grows
    /// page by page when the break crosses its end.
    fn sbrk(&mut self, increment: Size) -> Result<StablePtr, OutOfMemory> {
        let old_brk = self.brk();
        let new_brk = old_brk + increment as u64;

        // relative links have to reach every block
        if new_brk - self.base.0 > Size::MAX as u64 {
            return Err(OutOfMemory);
        }

        self.reserve(new_brk)?;
        self.set_brk(new_brk);

        Ok(old_brk)
    }

    fn reserve(&mut self, end: u64) -> Result<(), OutOfMemory> {
        let size_bytes = self.context.size_bytes();

        if end > size_bytes {
            let missing = align_up(end - size_bytes, PAGE_SIZE_BYTES as u64);
            let pages = missing / PAGE_SIZE_BYTES as u64;

            self.context.grow(pages)?;
        }

        Ok(())
    }

    fn push_free_block(&mut self, block: Block, size: Size) {
        let seg_class_id = get_seg_class_id(size);
        let head = self.get_seg_class_head(seg_class_id);

        block.set_next_free(&mut self.context, self.base, head);
        block.set_prev_free(&mut self.context, self.base, None);

        if let Some(head) = head {
            head.set_prev_free(&mut self.context, self.base, Some(block));
        }

        self.set_seg_class_head(seg_class_id, Some(block));
    }

    fn eject_from_free_list(&mut self, block: Block) {
        let prev = block.get_prev_free(&self.context, self.base);
        let next = block.get_next_free(&self.context, self.base);

        match prev {
            None => {
                let seg_class_id = get_seg_class_id(block.size(&self.context));
                self.set_seg_class_head(seg_class_id, next);
            }
            Some(prev) => prev.set_next_free(&mut self.context, self.base, next),
        }

        if let Some(next) = next {
            next.set_prev_free(&mut self.context, self.base, prev);
        }
    }

    pub(crate) fn get_seg_class_head(&self, seg_class_id: SegClassId) -> Option<Block> {
        let link = self
            .context
            .read_word(Self::get_seg_class_head_ptr(self.base, seg_class_id));

        self.base.decode(link)
    }

    fn set_seg_class_head(&mut self, seg_class_id: SegClassId, head: Option<Block>) {
        let link = self.base.encode(head);

        self.context
            .write_word(Self::get_seg_class_head_ptr(self.base, seg_class_id), link);
    }

    fn get_seg_class_head_ptr(base: HeapBase, seg_class_id: SegClassId) -> StablePtr {
        assert!(seg_class_id < SEG_CLASS_COUNT);

        base.ptr(SEG_CLASS_HEADS_OFFSET + (seg_class_id * size_of::<Size>()) as u64)
    }

    pub(crate) fn brk(&self) -> u64 {
        self.context.read_u64(self.base.ptr(BRK_OFFSET))
    }

    fn set_brk(&mut self, brk: u64) {
        self.context.write_u64(self.base.ptr(BRK_OFFSET), brk);
    }

    fn set_allocated_size(&mut self, size: u64) {
        self.context
            .write_u64(self.base.ptr(ALLOCATED_SIZE_OFFSET), size);
    }

    fn set_free_size(&mut self, size: u64) {
        self.context.write_u64(self.base.ptr(FREE_SIZE_OFFSET), size);
    }

    pub fn debug_print(&self) {
        isoprint(&format!("{:?}", self))
    }
}

impl<M: MemContext> Debug for SegregatedAllocator<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("SegregatedAllocator");

        d.field("base", &self.base.0)
            .field("brk", &self.brk())
            .field("total_allocated", &self.get_allocated_size())
            .field("total_free", &self.get_free_size());

        for id in 0..SEG_CLASS_COUNT {
            let mut seg_class = vec![];
            let mut cur = self.get_seg_class_head(id);

            while let Some(block) = cur {
                seg_class.push(format!("{}:{}", block.ptr(), block.size(&self.context)));
                cur = block.get_next_free(&self.context, self.base);
            }

            if seg_class.is_empty() {
                seg_class.push(String::from("EMPTY"));
            }

            d.field(format!("seg class {}", id).as_str(), &seg_class);
        }

        d.finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::mem::allocator::{SegregatedAllocator, FIRST_BLOCK_OFFSET};
    use crate::mem::block::Block;
    use crate::mem::seg_class::get_seg_class_id;
    use crate::types::{AllocatorError, CHUNK_SIZE, EMPTY_PTR, PAGE_SIZE_BYTES, SEG_CLASS_COUNT};
    use crate::utils::mem_context::{MemContext, VecMemContext};
    use crate::utils::test::{generate_random_bytes, generate_random_size, seeded_rng};
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn allocator() -> SegregatedAllocator<VecMemContext> {
        SegregatedAllocator::init(0, VecMemContext::default()).expect("Unable to init")
    }

    fn free_blocks(sma: &SegregatedAllocator<VecMemContext>) -> Vec<(u64, u32)> {
        (0..SEG_CLASS_COUNT)
            .flat_map(|id| {
                let mut res = vec![];
                let mut cur = sma.get_seg_class_head(id);

                while let Some(block) = cur {
                    res.push((block.ptr(), block.size(&sma.context)));
                    cur = block.get_next_free(&sma.context, sma.base);
                }

                res
            })
            .collect()
    }

    #[test]
    fn initialization_works_fine() {
        let sma = allocator();

        assert_eq!(sma.get_heap_size(), FIRST_BLOCK_OFFSET);
        assert_eq!(sma.get_allocated_size(), 0);
        assert_eq!(sma.get_free_size(), 0);
        assert!(free_blocks(&sma).is_empty());

        let report = sma.check(false).expect("Fresh heap is broken");
        assert_eq!(report.total_blocks, 0);

        let ctx = sma.into_context();
        let sma = SegregatedAllocator::reinit(0, ctx).expect("Unable to reinit");
        assert_eq!(sma.get_heap_size(), FIRST_BLOCK_OFFSET);
    }

    #[test]
    fn misaligned_or_foreign_offsets_are_rejected() {
        assert_eq!(
            SegregatedAllocator::init(12, VecMemContext::default()).err(),
            Some(AllocatorError::MisalignedOffset)
        );

        let mut ctx = VecMemContext::default();
        ctx.grow(1).unwrap();
        assert_eq!(
            SegregatedAllocator::reinit(0, ctx).err(),
            Some(AllocatorError::InvalidMagicSequence)
        );
    }

    #[test]
    fn zero_size_does_nothing() {
        let mut sma = allocator();

        assert_eq!(sma.allocate(0), None);
        assert_eq!(sma.try_allocate(0), Err(AllocatorError::ZeroSize));
        assert_eq!(sma.get_heap_size(), FIRST_BLOCK_OFFSET);
        assert_eq!(sma.get_allocated_size(), 0);
    }

    #[test]
    fn pointers_are_aligned_and_big_enough() {
        let mut sma = allocator();

        for size in 1..600 {
            let ptr = sma.allocate(size).expect("Unable to allocate");

            assert_eq!(ptr % 8, 0, "Misaligned ptr for size {}", size);
            assert!(sma.usable_size(ptr).unwrap() >= size);
        }

        sma.check(false).unwrap();
    }

    #[test]
    fn smallest_blocks_are_reused_exactly() {
        let mut sma = allocator();

        let a = sma.allocate(16).unwrap();
        let b = sma.allocate(16).unwrap();

        // 16 bytes of payload take a 24-byte block
        assert_eq!(b, a + 24);

        sma.deallocate(a);
        let c = sma.allocate(16).unwrap();

        assert_eq!(c, a);
        sma.check(false).unwrap();
    }

    #[test]
    fn adjacent_blocks_are_merged() {
        let mut sma = allocator();

        let x = sma.allocate(100).unwrap();
        let y = sma.allocate(100).unwrap();
        let _guard = sma.allocate(8).unwrap();

        assert_eq!(y, x + 104);

        sma.deallocate(x);
        sma.deallocate(y);

        let report = sma.check(false).unwrap();
        assert!(free_blocks(&sma).iter().any(|(ptr, size)| *ptr == x && *size == 208));

        let heap_size = sma.get_heap_size();
        let z = sma.allocate(200).unwrap();

        assert_eq!(z, x);
        assert_eq!(sma.get_heap_size(), heap_size);
        assert_eq!(report.free_blocks, free_blocks(&sma).len() as u64 + 1);
    }

    #[test]
    fn extension_merges_with_the_free_tail() {
        let mut sma = allocator();

        let a = sma.allocate(40).unwrap();
        let tail = free_blocks(&sma);
        assert_eq!(tail.len(), 1, "Chunk remainder expected");

        let heap_size = sma.get_heap_size();
        let big = sma.allocate(10_000).unwrap();

        assert!(sma.get_heap_size() - heap_size >= 10_000 - tail[0].1 as u64);
        assert_eq!(big, tail[0].0, "The old tail should start the new block");
        assert_ne!(big, a);

        let report = sma.check(false).unwrap();
        assert!(report.free_blocks <= 1);
    }

    #[test]
    fn extension_of_a_full_heap_works_fine() {
        let mut sma = allocator();

        let mut ptrs = vec![];
        for _ in 0..8 {
            ptrs.push(sma.allocate(60).unwrap());
        }
        assert!(free_blocks(&sma).is_empty());

        let heap_size = sma.get_heap_size();
        let big = sma.allocate(5000).unwrap();

        assert!(sma.get_heap_size() - heap_size >= 5000);
        assert!(sma.usable_size(big).unwrap() >= 5000);
        sma.check(false).unwrap();
    }

    #[test]
    fn chunk_remainder_is_split_off() {
        let mut sma = allocator();
        let ptr = sma.allocate(1).unwrap();

        assert_eq!(sma.usable_size(ptr), Some(12));
        assert_eq!(sma.get_heap_size(), FIRST_BLOCK_OFFSET + CHUNK_SIZE as u64);
        assert_eq!(free_blocks(&sma), vec![(ptr + 16, CHUNK_SIZE - 16)]);
    }

    #[test]
    fn small_classes_widen_before_extending() {
        let mut sma = allocator();

        // a 48-byte free block surrounded by allocated ones
        let _a = sma.allocate(8).unwrap();
        let b = sma.allocate(40).unwrap();
        let _c = sma.allocate(8).unwrap();
        sma.deallocate(b);
        assert!(free_blocks(&sma).contains(&(b, 48)));

        let heap_size = sma.get_heap_size();
        let d = sma.allocate(8).unwrap();

        assert_eq!(d, b);
        assert_eq!(sma.get_heap_size(), heap_size);
        assert!(free_blocks(&sma).contains(&(b + 16, 32)));
    }

    #[test]
    fn skipped_small_classes_are_still_used() {
        let mut sma = allocator();

        // 24-byte free block: class 1 is skipped by widening from class 0
        let _a = sma.allocate(8).unwrap();
        let b = sma.allocate(16).unwrap();
        let _c = sma.allocate(8).unwrap();

        assert!(free_blocks(&sma).is_empty());

        sma.deallocate(b);
        assert_eq!(free_blocks(&sma), vec![(b, 24)]);

        let heap_size = sma.get_heap_size();
        assert_eq!(sma.allocate(4), Some(b));
        assert_eq!(sma.get_heap_size(), heap_size);
    }

    #[test]
    fn range_classes_prefer_the_smaller_of_two_fits() {
        let mut sma = allocator();

        let mut guards = vec![];
        let big = sma.allocate(1000).unwrap();
        guards.push(sma.allocate(8).unwrap());
        let small = sma.allocate(700).unwrap();
        guards.push(sma.allocate(8).unwrap());

        // both land in class 9 (512..1023), `small` is the head
        sma.deallocate(big);
        sma.deallocate(small);

        let sizes: Vec<_> = free_blocks(&sma)
            .into_iter()
            .filter(|(ptr, _)| *ptr == big || *ptr == small)
            .collect();
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|(_, size)| get_seg_class_id(*size) == 9));

        assert_eq!(sma.allocate(600), Some(small));
    }

    #[test]
    fn out_of_memory_leaves_the_heap_intact() {
        let mut sma = SegregatedAllocator::init(0, VecMemContext::with_max_pages(1)).unwrap();

        let a = sma.allocate(1000).unwrap();
        sma.write(a, 0, &[7u8; 1000]);

        let heap_size = sma.get_heap_size();
        let free_size = sma.get_free_size();

        assert_eq!(sma.allocate(PAGE_SIZE_BYTES), None);
        assert_eq!(
            sma.try_allocate(PAGE_SIZE_BYTES),
            Err(AllocatorError::OutOfMemory)
        );
        assert_eq!(sma.zero_allocate(PAGE_SIZE_BYTES, 2), None);
        assert_eq!(sma.reallocate(a, PAGE_SIZE_BYTES), None);

        assert_eq!(sma.get_heap_size(), heap_size);
        assert_eq!(sma.get_free_size(), free_size);

        let mut buf = [0u8; 1000];
        sma.read(a, 0, &mut buf);
        assert_eq!(buf, [7u8; 1000]);

        assert_eq!(sma.allocate(usize::MAX), None);
        assert_eq!(sma.zero_allocate(usize::MAX, 2), None);
        sma.check(false).unwrap();
    }

    #[test]
    fn invalid_pointers_are_ignored() {
        let mut sma = allocator();
        let a = sma.allocate(100).unwrap();
        let before = format!("{:?}", sma);

        sma.deallocate(EMPTY_PTR);
        sma.deallocate(a + 3);
        sma.deallocate(1);
        sma.deallocate(u64::MAX - 7);
        sma.deallocate(sma.brk() + 8);

        assert_eq!(format!("{:?}", sma), before);

        sma.deallocate(a);
        let after = format!("{:?}", sma);

        // double free
        sma.deallocate(a);
        assert_eq!(format!("{:?}", sma), after);
        sma.check(false).unwrap();
    }

    #[test]
    fn stale_and_interior_pointers_are_ignored() {
        let mut sma = allocator();
        let a = sma.allocate(8).unwrap();
        let b = sma.allocate(8).unwrap();
        assert_eq!(b, a + 16);

        sma.deallocate(a);
        sma.deallocate(b);

        // `b` now points into the middle of `c`
        let c = sma.allocate(24).unwrap();
        assert_eq!(c, a);
        sma.write(c, 0, &[0xFF; 28]);

        let before = format!("{:?}", sma);
        sma.deallocate(b);
        assert_eq!(format!("{:?}", sma), before);

        // a header-looking word with a free predecessor that isn't there
        sma.write(c, 12, &0x11u32.to_le_bytes());
        sma.deallocate(c + 16);
        assert_eq!(format!("{:?}", sma), before);

        // and one claiming an allocated predecessor, but its successor disagrees
        sma.write(c, 0, &[0u8; 28]);
        sma.write(c, 4, &0x13u32.to_le_bytes());
        sma.deallocate(c + 8);
        assert_eq!(sma.usable_size(c + 8), None);
        assert_eq!(sma.usable_size(c), Some(28));

        sma.check(false).unwrap();
        sma.deallocate(c);
        assert_eq!(sma.get_allocated_size(), 0);
    }

    #[test]
    fn reallocation_keeps_the_content() {
        let mut sma = allocator();
        let mut rng = seeded_rng(42);

        let data = generate_random_bytes(&mut rng, 300);
        let a = sma.allocate(300).unwrap();
        sma.write(a, 0, &data);

        let b = sma.reallocate(a, 5000).unwrap();
        let mut buf = vec![0u8; 300];
        sma.read(b, 0, &mut buf);
        assert_eq!(buf, data);
        assert_eq!(sma.usable_size(a), None);

        let c = sma.reallocate(b, 100).unwrap();
        let mut buf = vec![0u8; 100];
        sma.read(c, 0, &mut buf);
        assert_eq!(buf, data[..100]);

        assert_eq!(sma.reallocate(c, 0), None);
        assert_eq!(sma.usable_size(c), None);

        let d = sma.reallocate(EMPTY_PTR, 10).unwrap();
        assert!(sma.usable_size(d).unwrap() >= 10);

        assert_eq!(sma.reallocate(d + 4, 10), None);
        assert!(sma.usable_size(d).is_some());
        sma.check(false).unwrap();
    }

    #[test]
    fn zero_allocation_clears_reused_memory() {
        let mut sma = allocator();

        let a = sma.allocate(256).unwrap();
        sma.write(a, 0, &[0xAB; 256]);
        sma.deallocate(a);

        let b = sma.zero_allocate(32, 8).unwrap();
        assert_eq!(b, a);

        let mut buf = [0xFFu8; 256];
        sma.read(b, 0, &mut buf);
        assert!(buf.iter().all(|it| *it == 0));

        assert_eq!(sma.zero_allocate(0, 8), None);
    }

    #[test]
    fn freeing_everything_leaves_a_single_block() {
        let mut sma = allocator();
        let mut rng = seeded_rng(7);

        let mut ptrs: Vec<_> = (0..500)
            .map(|_| sma.allocate(generate_random_size(&mut rng)).unwrap())
            .collect();

        ptrs.shuffle(&mut rng);
        for ptr in ptrs {
            sma.deallocate(ptr);
        }

        let report = sma.check(false).unwrap();
        assert_eq!(report.total_blocks, 1);
        assert_eq!(report.free_blocks, 1);
        assert_eq!(sma.get_allocated_size(), 0);
        assert_eq!(
            sma.get_free_size(),
            sma.get_heap_size() - FIRST_BLOCK_OFFSET
        );
        assert_eq!(
            free_blocks(&sma),
            vec![(
                FIRST_BLOCK_OFFSET,
                (sma.get_heap_size() - FIRST_BLOCK_OFFSET) as u32
            )]
        );
    }

    #[test]
    fn random_workload_keeps_invariants() {
        let mut sma = SegregatedAllocator::init(4096, VecMemContext::default()).unwrap();
        let mut rng = seeded_rng(1337);
        let mut live: Vec<(u64, Vec<u8>)> = vec![];

        for i in 0..3000 {
            match rng.gen_range(0..10u32) {
                0..=4 => {
                    let len = generate_random_size(&mut rng);
                    let data = generate_random_bytes(&mut rng, len);
                    let ptr = sma
                        .allocate(data.len())
                        .unwrap_or_else(|| panic!("Unable to allocate on step {}", i));

                    sma.write(ptr, 0, &data);
                    live.push((ptr, data));
                }
                5..=7 if !live.is_empty() => {
                    let idx = rng.gen_range(0..live.len());
                    let (ptr, data) = live.swap_remove(idx);

                    let mut buf = vec![0u8; data.len()];
                    sma.read(ptr, 0, &mut buf);
                    assert_eq!(buf, data, "Corrupted content on step {}", i);

                    sma.deallocate(ptr);
                }
                _ if !live.is_empty() => {
                    let idx = rng.gen_range(0..live.len());
                    let new_size = generate_random_size(&mut rng);
                    let (ptr, data) = &mut live[idx];

                    *ptr = sma.reallocate(*ptr, new_size).unwrap();
                    data.truncate(new_size);

                    let mut buf = vec![0u8; data.len()];
                    sma.read(*ptr, 0, &mut buf);
                    assert_eq!(&buf, data, "Corrupted content after realloc on step {}", i);
                }
                _ => {}
            }

            if i % 100 == 0 {
                sma.check(false)
                    .unwrap_or_else(|e| panic!("Broken heap on step {}: {:?}", i, e));
            }
        }

        for (ptr, _) in live {
            sma.deallocate(ptr);
        }

        let report = sma.check(false).unwrap();
        assert_eq!(report.free_blocks, 1);
        assert_eq!(report.allocated_blocks, 0);
    }

    #[test]
    fn reinit_keeps_the_heap() {
        let mut sma = allocator();
        let a = sma.allocate(64).unwrap();
        let b = sma.allocate(3000).unwrap();
        sma.write(b, 0, b"persisted");
        sma.deallocate(a);

        let before = format!("{:?}", sma);
        let ctx = sma.into_context();

        let mut sma = SegregatedAllocator::reinit(0, ctx).expect("Unable to reinit");
        assert_eq!(format!("{:?}", sma), before);

        let mut buf = [0u8; 9];
        sma.read(b, 0, &mut buf);
        assert_eq!(&buf, b"persisted");

        assert_eq!(sma.allocate(64), Some(a));
    }

    #[test]
    fn header_of_the_first_block_follows_the_prologue() {
        let mut sma = allocator();
        let a = sma.allocate(8).unwrap();

        assert_eq!(a, FIRST_BLOCK_OFFSET);
        assert!(Block(a).is_prev_allocated(&sma.context));
    }
}
