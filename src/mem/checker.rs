use crate::mem::allocator::{
    SegregatedAllocator, FIRST_BLOCK_OFFSET, PROLOGUE_OFFSET, PROLOGUE_SIZE,
};
use crate::mem::block::{Block, ALLOCATED, SIZE_MASK};
use crate::mem::seg_class::get_seg_class_id;
use crate::types::{HeapCorruption, HeapReport, ALIGNMENT, MIN_BLOCK_SIZE, SEG_CLASS_COUNT};
use crate::utils::isoprint;
use crate::utils::mem_context::MemContext;

impl<M: MemContext> SegregatedAllocator<M> {
    /// Walks the whole heap, block by block and list by list, without changing anything.
    /// Returns the first broken invariant, if any. With `verbose` every block is printed.
    pub fn check(&self, verbose: bool) -> Result<HeapReport, HeapCorruption> {
        let first_ptr = self.base.ptr(FIRST_BLOCK_OFFSET);
        let brk = self.brk();

        if brk < first_ptr || brk > self.context.size_bytes() {
            return Err(HeapCorruption::BadEpilogue { ptr: brk });
        }

        let prologue = Block(self.base.ptr(PROLOGUE_OFFSET));
        let prologue_header = prologue.read_header(&self.context);
        if prologue_header & SIZE_MASK != PROLOGUE_SIZE
            || prologue_header & ALLOCATED == 0
            || self.context.read_word(prologue.ptr()) != prologue_header
        {
            return Err(HeapCorruption::BadPrologue);
        }

        if verbose {
            isoprint(&format!("Heap ({}):", self.base.0));
        }

        let mut report = HeapReport {
            heap_size: brk - self.base.0,
            ..Default::default()
        };

        let mut prev_allocated = true;
        let mut block = prologue.next(&self.context);

        let epilogue_header = loop {
            if block.ptr() % ALIGNMENT as u64 != 0 {
                return Err(HeapCorruption::Misaligned { ptr: block.ptr() });
            }

            if block.ptr() > brk {
                return Err(HeapCorruption::BadEpilogue { ptr: block.ptr() });
            }

            let header = block.read_header(&self.context);
            let size = header & SIZE_MASK;

            if size == 0 {
                break header;
            }

            if size < MIN_BLOCK_SIZE || block.ptr() + size as u64 > brk {
                return Err(HeapCorruption::BadBlockSize {
                    ptr: block.ptr(),
                    size,
                });
            }

            if block.is_prev_allocated(&self.context) != prev_allocated {
                return Err(HeapCorruption::PrevAllocMismatch { ptr: block.ptr() });
            }

            let free = header & ALLOCATED == 0;

            if free {
                let footer = block.read_footer(&self.context, size);
                if footer != size {
                    return Err(HeapCorruption::FooterMismatch {
                        ptr: block.ptr(),
                        header: size,
                        footer,
                    });
                }

                if !prev_allocated {
                    return Err(HeapCorruption::AdjacentFreeBlocks { ptr: block.ptr() });
                }

                report.free_blocks += 1;
                report.free_bytes += size as u64;
            } else {
                report.allocated_blocks += 1;
                report.allocated_bytes += size as u64;
            }

            if verbose {
                if free {
                    isoprint(&format!(
                        "{}: header: [{}:f] footer: [{}:f]",
                        block.ptr(),
                        size,
                        size
                    ));
                } else {
                    isoprint(&format!("{}: header: [{}:a], allocated", block.ptr(), size));
                }
            }

            report.total_blocks += 1;
            prev_allocated = !free;
            block = Block(block.ptr() + size as u64);
        };

        if block.ptr() != brk || epilogue_header & ALLOCATED == 0 {
            return Err(HeapCorruption::BadEpilogue { ptr: block.ptr() });
        }

        if block.is_prev_allocated(&self.context) != prev_allocated {
            return Err(HeapCorruption::PrevAllocMismatch { ptr: block.ptr() });
        }

        if verbose {
            isoprint(&format!("{}: EOL", block.ptr()));
        }

        self.check_free_lists(&report)?;

        let stored_allocated = self.get_allocated_size();
        let stored_free = self.get_free_size();

        if stored_allocated != report.allocated_bytes || stored_free != report.free_bytes {
            return Err(HeapCorruption::CounterMismatch {
                stored_allocated,
                stored_free,
                walked_allocated: report.allocated_bytes,
                walked_free: report.free_bytes,
            });
        }

        Ok(report)
    }

    /// Every listed block is a free block of the right class, links are symmetric and every free
    /// block met by the heap walk is listed exactly once.
    fn check_free_lists(&self, report: &HeapReport) -> Result<(), HeapCorruption> {
        let first_ptr = self.base.ptr(FIRST_BLOCK_OFFSET);
        let brk = self.brk();
        let mut listed = 0u64;

        for seg_class_id in 0..SEG_CLASS_COUNT {
            let mut prev: Option<Block> = None;
            let mut cur = self.get_seg_class_head(seg_class_id);

            while let Some(block) = cur {
                let broken = HeapCorruption::BrokenFreeList {
                    seg_class: seg_class_id as u32,
                    ptr: block.ptr(),
                };

                // a cycle would never end otherwise
                if listed >= report.free_blocks {
                    return Err(HeapCorruption::FreeListCountMismatch {
                        listed: listed + 1,
                        walked: report.free_blocks,
                    });
                }

                if block.ptr() < first_ptr
                    || block.ptr() >= brk
                    || block.ptr() % ALIGNMENT as u64 != 0
                    || !block.is_free(&self.context)
                    || block.get_prev_free(&self.context, self.base) != prev
                {
                    return Err(broken);
                }

                let size = block.size(&self.context);
                if size < MIN_BLOCK_SIZE {
                    return Err(broken);
                }

                let expected = get_seg_class_id(size);
                if expected != seg_class_id {
                    return Err(HeapCorruption::WrongSegClass {
                        ptr: block.ptr(),
                        expected: expected as u32,
                        actual: seg_class_id as u32,
                    });
                }

                listed += 1;
                prev = Some(block);
                cur = block.get_next_free(&self.context, self.base);
            }
        }

        if listed != report.free_blocks {
            return Err(HeapCorruption::FreeListCountMismatch {
                listed,
                walked: report.free_blocks,
            });
        }

        Ok(())
    }
}
