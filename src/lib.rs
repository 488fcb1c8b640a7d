use crate::mem::allocator::SegregatedAllocator;
use crate::utils::mem_context::DefaultMemContext;
use std::cell::RefCell;

pub mod mem;
pub mod types;
pub mod utils;

pub use crate::types::{
    AllocatorError, HeapCorruption, HeapReport, OutOfMemory, StablePtr, EMPTY_PTR,
    PAGE_SIZE_BYTES,
};
pub use crate::utils::isoprint;
#[cfg(target_family = "wasm")]
pub use crate::utils::mem_context::StableMemContext;
pub use crate::utils::mem_context::{MemContext, VecMemContext};

thread_local! {
    static ALLOCATOR: RefCell<Option<SegregatedAllocator<DefaultMemContext>>> = RefCell::new(None);
}

pub fn init_allocator(offset: u64) {
    ALLOCATOR.with(|it| {
        let mut it = it.borrow_mut();

        if it.is_some() {
            utils::fatal("SegregatedAllocator can only be initialized once");
        }

        let allocator = SegregatedAllocator::init(offset, DefaultMemContext::default())
            .unwrap_or_else(|e| {
                utils::fatal(&format!("Unable to init SegregatedAllocator: {:?}", e))
            });

        *it = Some(allocator);
    })
}

pub fn reinit_allocator(offset: u64) {
    reinit_allocator_with(offset, DefaultMemContext::default())
}

/// Attaches to a heap living in the given memory, e.g. one handed out by [deinit_allocator]
pub fn reinit_allocator_with(offset: u64, context: DefaultMemContext) {
    ALLOCATOR.with(|it| {
        let mut it = it.borrow_mut();

        if it.is_some() {
            utils::fatal("SegregatedAllocator can only be initialized once");
        }

        let allocator = SegregatedAllocator::reinit(offset, context).unwrap_or_else(|e| {
            utils::fatal(&format!("Unable to reinit SegregatedAllocator: {:?}", e))
        });

        *it = Some(allocator);
    })
}

/// Detaches the allocator, handing out the memory it was working with
pub fn deinit_allocator() -> Option<DefaultMemContext> {
    ALLOCATOR.with(|it| it.borrow_mut().take().map(|a| a.into_context()))
}

fn with_allocator<R, F: FnOnce(&mut SegregatedAllocator<DefaultMemContext>) -> R>(f: F) -> R {
    ALLOCATOR.with(|it| match it.borrow_mut().as_mut() {
        Some(allocator) => f(allocator),
        None => utils::fatal("SegregatedAllocator is not initialized"),
    })
}

pub fn allocate(size: usize) -> Option<StablePtr> {
    with_allocator(|a| a.allocate(size))
}

pub fn try_allocate(size: usize) -> Result<StablePtr, AllocatorError> {
    with_allocator(|a| a.try_allocate(size))
}

pub fn deallocate(ptr: StablePtr) {
    with_allocator(|a| a.deallocate(ptr))
}

pub fn reallocate(ptr: StablePtr, new_size: usize) -> Option<StablePtr> {
    with_allocator(|a| a.reallocate(ptr, new_size))
}

pub fn zero_allocate(count: usize, size: usize) -> Option<StablePtr> {
    with_allocator(|a| a.zero_allocate(count, size))
}

pub fn read(ptr: StablePtr, offset: usize, buf: &mut [u8]) {
    with_allocator(|a| a.read(ptr, offset, buf))
}

pub fn write(ptr: StablePtr, offset: usize, data: &[u8]) {
    with_allocator(|a| a.write(ptr, offset, data))
}

pub fn check_heap(verbose: bool) -> Result<HeapReport, HeapCorruption> {
    with_allocator(|a| a.check(verbose))
}

pub fn get_allocated_size() -> u64 {
    with_allocator(|a| a.get_allocated_size())
}

pub fn get_free_size() -> u64 {
    with_allocator(|a| a.get_free_size())
}

pub fn _debug_print_allocator() {
    with_allocator(|a| a.debug_print())
}
