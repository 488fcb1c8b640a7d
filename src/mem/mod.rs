pub mod allocator;
pub(crate) mod block;
pub mod checker;
pub(crate) mod free_block;
pub mod seg_class;
