// Run-time:
//   status: success

extern crate compactgc;

use compactgc::{alloc, collect, init, Debug};

// Three nodes chained through their first words; only the head stays
// referenced from the stack.
fn main() {
    init();

    let n1 = alloc(24).unwrap().as_ptr() as usize;
    let mut n2 = alloc(24).unwrap().as_ptr() as usize;
    let mut n3 = alloc(24).unwrap().as_ptr() as usize;

    unsafe {
        *(n1 as *mut usize) = n2;
        *(n2 as *mut usize) = n3;
        std::ptr::write_volatile(&mut n2, 0);
        std::ptr::write_volatile(&mut n3, 0);
    }

    collect();

    assert!(Debug::is_tracked(n1 as *const u8));
    assert_eq!(Debug::total_allocated(), 3);

    let via_n1 = unsafe { *(n1 as *const usize) };
    let via_n2 = unsafe { *(via_n1 as *const usize) };
    assert!(Debug::is_tracked(via_n1 as *const u8));
    assert!(Debug::is_tracked(via_n2 as *const u8));
}
