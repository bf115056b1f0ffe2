// Run-time:
//   status: success

extern crate compactgc;

use compactgc::{alloc, collect, init, Debug};

// An integer whose value coincides with a block address acts as a root.
// This is the conservative tradeoff: the block is retained even though no
// pointer to it remains.
fn main() {
    init();

    let mut a = alloc(8).unwrap().as_ptr() as usize;
    let keeper: usize = a;
    unsafe { std::ptr::write_volatile(&mut a, 0) };

    collect();

    assert!(Debug::is_tracked(keeper as *const u8));
    assert_eq!(Debug::total_allocated(), 1);
}
