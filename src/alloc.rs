// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocation tracking.
//!
//! Every block handed to the mutator is registered in three agreeing views:
//! an address set (the hot "is this word a tracked pointer?" oracle), a map
//! from block address to its metadata record, and an insertion-ordered list
//! threaded through the records. The list doubles as the slot order the
//! compactor packs survivors into.

use std::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout},
    collections::{HashMap, HashSet},
    io::{self, Write},
    mem,
};

use static_assertions::const_assert;

pub(crate) type Address = usize;

pub(crate) type Word = usize;

pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>(); // Bytes

// The pointer-identification discipline relies on a machine word holding a
// pointer exactly.
const_assert!(mem::size_of::<*const u8>() == WORD_SIZE);
const_assert!(WORD_SIZE.is_power_of_two());

/// Per-block bookkeeping, held out of line so the payload stays exactly what
/// the mutator asked for.
pub(crate) struct BlockMeta {
    /// Byte size as requested by the caller. Relocation re-stamps this on the
    /// destination record.
    pub(crate) size: usize,
    /// Bytes actually obtained from the system allocator: `size` rounded up
    /// to a word multiple, so word-granular scans stay inside the block.
    pub(crate) capacity: usize,
    pub(crate) marked: bool,
    /// Where the block will live after compaction. Assigned to marked blocks
    /// only, and never survives past the end of a collection.
    pub(crate) forward: Option<Address>,
    /// Successor in the insertion-ordered list.
    pub(crate) next: Option<Address>,
}

pub(crate) struct Heap {
    addrs: HashSet<Address>,
    meta: HashMap<Address, BlockMeta>,
    list_head: Option<Address>,
    list_tail: Option<Address>,
    total_allocated: usize,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            addrs: HashSet::new(),
            meta: HashMap::new(),
            list_head: None,
            list_tail: None,
            total_allocated: 0,
        }
    }

    /// Requests a zero-initialised block of `size` bytes and registers it.
    /// Zero-filling matters: unused payload bytes (including the rounding
    /// pad) must never equal a previously-seen block address.
    pub(crate) fn alloc(&mut self, size: usize) -> Option<Address> {
        if size == 0 {
            return None;
        }

        let layout = match word_layout(size) {
            Some(l) => l,
            None => crate::fatal("allocation size overflows the address space"),
        };
        let block = unsafe { alloc_zeroed(layout) };
        if block.is_null() {
            handle_alloc_error(layout);
        }
        let addr = block as Address;

        self.addrs.insert(addr);
        self.meta.insert(
            addr,
            BlockMeta {
                size,
                capacity: layout.size(),
                marked: false,
                forward: None,
                next: None,
            },
        );

        match self.list_tail {
            Some(tail) => {
                if let Some(meta) = self.meta.get_mut(&tail) {
                    meta.next = Some(addr);
                }
            }
            None => self.list_head = Some(addr),
        }
        self.list_tail = Some(addr);
        self.total_allocated += 1;

        Some(addr)
    }

    /// Unregisters and releases a block. Null and untracked addresses are
    /// ignored so callers may pass stale pointers defensively.
    pub(crate) fn free(&mut self, addr: Address) {
        if addr == 0 || !self.addrs.remove(&addr) {
            return;
        }

        self.unlink(addr);
        if let Some(meta) = self.meta.remove(&addr) {
            let layout = unsafe { Layout::from_size_align_unchecked(meta.capacity, WORD_SIZE) };
            unsafe { dealloc(addr as *mut u8, layout) };
        }
        self.total_allocated -= 1;
    }

    pub(crate) fn is_tracked(&self, addr: Address) -> bool {
        self.addrs.contains(&addr)
    }

    pub(crate) fn meta(&self, addr: Address) -> Option<&BlockMeta> {
        self.meta.get(&addr)
    }

    pub(crate) fn meta_mut(&mut self, addr: Address) -> Option<&mut BlockMeta> {
        self.meta.get_mut(&addr)
    }

    pub(crate) fn forward_of(&self, addr: Address) -> Option<Address> {
        self.meta.get(&addr).and_then(|meta| meta.forward)
    }

    pub(crate) fn list_head(&self) -> Option<Address> {
        self.list_head
    }

    pub(crate) fn next_of(&self, addr: Address) -> Option<Address> {
        self.meta.get(&addr).and_then(|meta| meta.next)
    }

    pub(crate) fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    /// Snapshot of the tracked set, for sweeps that delete while iterating.
    pub(crate) fn tracked_snapshot(&self) -> Vec<Address> {
        self.addrs.iter().copied().collect()
    }

    /// Writes the address, mark bit, and size of every tracked block.
    pub(crate) fn dump_to<W: Write>(&self, out: &mut W, message: &str) -> io::Result<()> {
        writeln!(out, "{}\n", message)?;
        writeln!(out, "{{")?;

        let mut count = 0;
        for &addr in &self.addrs {
            if let Some(meta) = self.meta.get(&addr) {
                count += 1;
                writeln!(
                    out,
                    "\t{:#x} : {{marked: {}, size: {}}},",
                    addr, meta.marked as u8, meta.size
                )?;
            }
        }

        writeln!(out, "\nTotal Allocated: {}", count)?;
        writeln!(out, "}}")
    }

    fn unlink(&mut self, addr: Address) {
        let mut prev: Option<Address> = None;
        let mut cursor = self.list_head;
        while let Some(cur) = cursor {
            let next = self.next_of(cur);
            if cur == addr {
                match prev {
                    Some(p) => {
                        if let Some(meta) = self.meta.get_mut(&p) {
                            meta.next = next;
                        }
                    }
                    None => self.list_head = next,
                }
                if self.list_tail == Some(cur) {
                    self.list_tail = prev;
                }
                return;
            }
            prev = Some(cur);
            cursor = next;
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for addr in self.tracked_snapshot() {
            self.free(addr);
        }
    }
}

fn word_layout(size: usize) -> Option<Layout> {
    let capacity = size.checked_add(WORD_SIZE - 1)? & !(WORD_SIZE - 1);
    Layout::from_size_align(capacity, WORD_SIZE).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_order(heap: &Heap) -> Vec<Address> {
        let mut order = Vec::new();
        let mut cursor = heap.list_head();
        while let Some(addr) = cursor {
            order.push(addr);
            cursor = heap.next_of(addr);
        }
        order
    }

    fn assert_views_agree(heap: &Heap) {
        let order = list_order(heap);
        assert_eq!(order.len(), heap.total_allocated());
        assert_eq!(heap.addrs.len(), heap.total_allocated());
        assert_eq!(heap.meta.len(), heap.total_allocated());
        for addr in order {
            assert!(heap.is_tracked(addr));
            assert!(heap.meta(addr).is_some());
        }
    }

    #[test]
    fn zero_sized_requests_are_absent() {
        let mut heap = Heap::new();
        assert_eq!(heap.alloc(0), None);
        assert_eq!(heap.total_allocated(), 0);
        assert_views_agree(&heap);
    }

    #[test]
    fn views_agree_after_alloc_and_free() {
        let mut heap = Heap::new();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(32).unwrap();
        let c = heap.alloc(24).unwrap();
        assert_views_agree(&heap);
        assert_eq!(list_order(&heap), vec![a, b, c]);

        heap.free(b);
        assert_views_agree(&heap);
        assert_eq!(list_order(&heap), vec![a, c]);
        assert!(!heap.is_tracked(b));
    }

    #[test]
    fn blocks_are_zeroed() {
        let mut heap = Heap::new();
        let addr = heap.alloc(64).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn requested_size_is_preserved_and_capacity_rounded() {
        let mut heap = Heap::new();
        let addr = heap.alloc(10).unwrap();
        let meta = heap.meta(addr).unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.capacity, 2 * WORD_SIZE);
        assert_eq!(meta.capacity % WORD_SIZE, 0);
    }

    #[test]
    fn freeing_untracked_is_a_noop() {
        let mut heap = Heap::new();
        let a = heap.alloc(8).unwrap();
        heap.free(0);
        heap.free(a + WORD_SIZE);
        assert_eq!(heap.total_allocated(), 1);
        assert_views_agree(&heap);
    }

    #[test]
    fn unlink_repairs_head_and_tail() {
        let mut heap = Heap::new();
        let a = heap.alloc(8).unwrap();
        let b = heap.alloc(8).unwrap();
        let c = heap.alloc(8).unwrap();

        heap.free(a);
        assert_eq!(heap.list_head(), Some(b));
        heap.free(c);
        assert_eq!(heap.list_tail, Some(b));
        assert_eq!(list_order(&heap), vec![b]);

        let d = heap.alloc(8).unwrap();
        assert_eq!(list_order(&heap), vec![b, d]);
        assert_views_agree(&heap);
    }

    #[test]
    fn dump_lists_every_block() {
        let mut heap = Heap::new();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(32).unwrap();

        let mut out = Vec::new();
        heap.dump_to(&mut out, "after setup").unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("after setup\n"));
        assert!(text.contains(&format!("{:#x} : {{marked: 0, size: 16}}", a)));
        assert!(text.contains(&format!("{:#x} : {{marked: 0, size: 32}}", b)));
        assert!(text.contains("Total Allocated: 2"));
    }
}
