// Run-time:
//   status: success

extern crate compactgc;

use compactgc::{alloc, collect, init, Debug};

// Builds a two-node cycle and forgets it. The mark bit cuts the cycle
// during tracing, so mutual references alone keep nothing alive.
#[inline(never)]
fn forgotten_cycle() {
    let p = alloc(16).unwrap().as_ptr() as usize;
    let q = alloc(16).unwrap().as_ptr() as usize;
    unsafe {
        *(p as *mut usize) = q;
        *(q as *mut usize) = p;
    }
}

#[inline(never)]
fn scrub_stack() {
    let mut scratch = [0usize; 1024];
    for slot in scratch.iter_mut() {
        unsafe { std::ptr::write_volatile(slot, 0) };
    }
}

fn main() {
    init();

    forgotten_cycle();
    scrub_stack();

    collect();

    assert_eq!(Debug::total_allocated(), 0);
}
