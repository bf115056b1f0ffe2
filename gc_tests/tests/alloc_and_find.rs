// Run-time:
//   status: success

extern crate compactgc;

use compactgc::{alloc, collect, init, Debug};

fn main() {
    init();

    let a = alloc(16).unwrap().as_ptr();
    let b = alloc(32).unwrap().as_ptr();

    collect();

    // Both blocks are referenced from this frame, so they survive with
    // their mark bits cleared.
    assert!(Debug::is_tracked(a));
    assert!(Debug::is_tracked(b));
    assert!(!Debug::is_marked(a));
    assert!(!Debug::is_marked(b));
    assert_eq!(Debug::block_size(a), Some(16));
    assert_eq!(Debug::block_size(b), Some(32));
    assert_eq!(Debug::total_allocated(), 2);
}
