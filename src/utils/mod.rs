pub mod math;
pub mod mem_context;

#[cfg(target_family = "wasm")]
use ic_cdk::{print, trap};

#[cfg(target_family = "wasm")]
#[inline]
pub fn isoprint(str: &str) {
    print(str)
}

#[cfg(not(target_family = "wasm"))]
#[inline]
pub fn isoprint(str: &str) {
    println!("{}", str)
}

/// Aborts the whole call. Used when the heap is found in a state no operation can safely
/// continue from.
#[cfg(target_family = "wasm")]
pub fn fatal(str: &str) -> ! {
    trap(str)
}

#[cfg(not(target_family = "wasm"))]
pub fn fatal(str: &str) -> ! {
    panic!("{}", str)
}
