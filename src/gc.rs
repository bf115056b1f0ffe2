// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The collector: conservative root discovery, reachability tracing, sweep
//! reclamation, and the optional compaction of survivors.
//!
//! A word is treated as a pointer iff it is word-aligned and equals a tracked
//! block address. All raw loads and stores go through [`read_word`] and
//! [`write_word`]; the rest of the collector deals in plain integers and the
//! tracked-address oracle.

use std::collections::HashMap;

use crate::alloc::{Address, Heap, Word, WORD_SIZE};

type StackScanCallback = extern "sysv64" fn(&mut Collector, Address);
#[link(name = "SpillRegisters", kind = "static")]
extern "sysv64" {
    // Pass a type-punned pointer to the collector and move it to the asm spill
    // code. This is so it can be passed straight back as the implicit `self`
    // address in the callback.
    #[allow(improper_ctypes)]
    fn spill_registers(collector: *mut u8, callback: StackScanCallback);
}

/// Which reclamation discipline [`crate::collect`] runs.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CollectKind {
    /// Free unmarked blocks in place.
    MarkSweep,
    /// Additionally pack survivors into the low slots of the allocation
    /// order and rewrite references to them.
    MarkCompact,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum CollectorState {
    Ready,
    RootScanning,
    Marking,
    Compacting,
    Sweeping,
}

/// Phase toggles for tests and diagnostics.
pub struct DebugFlags {
    pub mark_phase: bool,
    pub compact_phase: bool,
    pub sweep_phase: bool,
}

impl DebugFlags {
    pub fn new() -> Self {
        Self {
            mark_phase: true,
            compact_phase: true,
            sweep_phase: true,
        }
    }

    pub fn mark_phase(mut self, val: bool) -> Self {
        self.mark_phase = val;
        self
    }

    pub fn compact_phase(mut self, val: bool) -> Self {
        self.compact_phase = val;
        self
    }

    pub fn sweep_phase(mut self, val: bool) -> Self {
        self.sweep_phase = val;
        self
    }
}

pub(crate) struct Collector {
    pub(crate) heap: Heap,
    kind: CollectKind,
    debug_flags: DebugFlags,
    state: CollectorState,
    /// Stack slot address -> tracked address found in that slot. Rebuilt by
    /// each root scan. The slot keys exist so the compactor can rewrite the
    /// stack in place; mark-and-sweep only consumes the values.
    roots: HashMap<Address, Address>,
    worklist: Vec<Address>,
    /// Address of a local captured in `init`. Every frame that may hold
    /// roots lies between this and the stack top.
    stack_bottom: Address,
    /// Re-read at the start of every collection.
    stack_top: Address,
}

impl Collector {
    pub(crate) fn new(stack_bottom: Address) -> Self {
        Self {
            heap: Heap::new(),
            kind: CollectKind::MarkSweep,
            debug_flags: DebugFlags::new(),
            state: CollectorState::Ready,
            roots: HashMap::new(),
            worklist: Vec::new(),
            stack_bottom,
            stack_top: 0,
        }
    }

    pub(crate) fn set_kind(&mut self, kind: CollectKind) {
        self.kind = kind;
    }

    pub(crate) fn set_debug_flags(&mut self, flags: DebugFlags) {
        self.debug_flags = flags;
    }

    /// Runs one synchronous, stop-the-world collection: root scan, mark,
    /// optionally compact, sweep. The mutator is the caller, so it is paused
    /// for the duration by construction.
    pub(crate) fn collect(&mut self) {
        debug_assert_eq!(self.state, CollectorState::Ready);
        self.state = CollectorState::RootScanning;
        self.roots.clear();

        self.stack_top = match unsafe { get_stack_start() } {
            Some(top) => top,
            None => crate::fatal("unable to locate the stack top"),
        };

        // Register spilling is platform specific. This is implemented in an
        // assembly stub which pushes the callee-saved register file and then
        // runs the stack scan as a callback, so the spilled words stay on the
        // stack for the whole scan.
        unsafe { spill_registers(self as *mut Collector as *mut u8, Collector::scan_stack) }

        if self.debug_flags.mark_phase {
            self.enter_mark_phase();
        }
        if self.kind == CollectKind::MarkCompact && self.debug_flags.compact_phase {
            self.enter_compact_phase();
        }
        if self.debug_flags.sweep_phase {
            self.enter_sweep_phase();
        }

        self.state = CollectorState::Ready;
    }

    /// Walks the stack between the recorded bottom and the current top,
    /// recording every aligned word that names a tracked block, together
    /// with the slot it was found in.
    extern "sysv64" fn scan_stack(&mut self, _spill_base: Address) {
        // One word above the bottom anchor, so the anchor itself is skipped.
        let low = self.stack_bottom + WORD_SIZE;
        let high = self.stack_top;
        debug_assert!(low < high, "stack grew the wrong way");

        for slot in (low..high).step_by(WORD_SIZE) {
            let word = unsafe { read_word(slot) };
            if word % WORD_SIZE == 0 && self.heap.is_tracked(word) {
                self.roots.insert(slot, word);
            }
        }
    }

    /// Traces reachability from the roots. Recursion is reshaped into an
    /// explicit worklist; the mark bit bounds the work and breaks cycles.
    fn enter_mark_phase(&mut self) {
        self.state = CollectorState::Marking;

        self.worklist.clear();
        self.worklist.extend(self.roots.values().copied());

        while let Some(addr) = self.worklist.pop() {
            self.mark_one(addr);
        }
    }

    fn mark_one(&mut self, addr: Address) {
        if addr == 0 || !self.heap.is_tracked(addr) {
            return;
        }
        let size = match self.heap.meta_mut(addr) {
            Some(meta) if !meta.marked => {
                meta.marked = true;
                meta.size
            }
            _ => return,
        };

        // Check each aligned word in the block for pointers. Interior bytes
        // may hold arbitrary data, so the alignment gate is mandatory here.
        for slot in (addr..addr + size).step_by(WORD_SIZE) {
            let word = unsafe { read_word(slot) };
            if word % WORD_SIZE == 0 && self.heap.is_tracked(word) {
                self.worklist.push(word);
            }
        }
    }

    /// Frees every unmarked block and clears the mark bit (and any leftover
    /// forwarding address) on the survivors, ready for the next cycle.
    fn enter_sweep_phase(&mut self) {
        self.state = CollectorState::Sweeping;

        // Deleting while iterating, so walk a snapshot of the tracked set.
        for addr in self.heap.tracked_snapshot() {
            let marked = self.heap.meta(addr).map_or(false, |meta| meta.marked);
            if marked {
                if let Some(meta) = self.heap.meta_mut(addr) {
                    meta.marked = false;
                    meta.forward = None;
                }
            } else {
                self.heap.free(addr);
            }
        }
    }

    fn enter_compact_phase(&mut self) {
        self.state = CollectorState::Compacting;

        self.compute_locations();
        self.update_references();
        self.relocate();
    }

    /// Assigns each marked block its post-compaction address: the address of
    /// the block occupying the next unclaimed slot of the insertion-ordered
    /// list. After this pass the N survivors own the first N list slots.
    fn compute_locations(&mut self) {
        let mut live = self.heap.list_head();
        let mut free = self.heap.list_head();

        while let Some(addr) = live {
            let marked = self.heap.meta(addr).map_or(false, |meta| meta.marked);
            if marked {
                // `free` trails `live`, so a marked block always has a slot.
                if let Some(slot) = free {
                    if let Some(meta) = self.heap.meta_mut(addr) {
                        meta.forward = Some(slot);
                    }
                    free = self.heap.next_of(slot);
                }
            }
            live = self.heap.next_of(addr);
        }
    }

    /// Redirects every reference to a forwarded block, first in the recorded
    /// stack slots, then in the interiors of the marked blocks themselves.
    /// References to unmarked blocks carry no forwarding address and are
    /// left alone; sweep removes their targets.
    fn update_references(&mut self) {
        for (&slot, &target) in &self.roots {
            if let Some(fwd) = self.heap.forward_of(target) {
                unsafe { write_word(slot, fwd) };
            }
        }

        let mut cursor = self.heap.list_head();
        while let Some(addr) = cursor {
            cursor = self.heap.next_of(addr);
            let (marked, size) = match self.heap.meta(addr) {
                Some(meta) => (meta.marked, meta.size),
                None => continue,
            };
            if !marked {
                continue;
            }
            for slot in (addr..addr + size).step_by(WORD_SIZE) {
                let word = unsafe { read_word(slot) };
                if word % WORD_SIZE != 0 {
                    continue;
                }
                if let Some(fwd) = self.heap.forward_of(word) {
                    unsafe { write_word(slot, fwd) };
                }
            }
        }
    }

    /// Copies each survivor's payload to its forwarding address and stamps
    /// the destination record, then clears the mark bit on the trailing
    /// garbage slots so the sweep reclaims their storage.
    fn relocate(&mut self) {
        let mut garbage = 0;
        let mut cursor = self.heap.list_head();
        while let Some(addr) = cursor {
            cursor = self.heap.next_of(addr);
            let (marked, size, forward) = match self.heap.meta(addr) {
                Some(meta) => (meta.marked, meta.size, meta.forward),
                None => continue,
            };
            if !marked {
                garbage += 1;
                continue;
            }
            let dest = match forward {
                Some(dest) => dest,
                None => continue,
            };
            if self.heap.meta(dest).map_or(true, |meta| size > meta.capacity) {
                crate::fatal("relocation target cannot hold the surviving block");
            }
            // Destinations sit at or before their sources in slot order, so
            // the copy never clobbers bytes a later survivor still needs.
            unsafe { std::ptr::copy(addr as *const u8, dest as *mut u8, size) };
            if let Some(meta) = self.heap.meta_mut(dest) {
                meta.size = size;
                meta.marked = true;
            }
        }

        // Survivors now occupy the list prefix. Unmark everything behind
        // them so the sweep recognises the vacated slots as unreachable.
        let live = self.heap.total_allocated() - garbage;
        let mut cursor = self.heap.list_head();
        for _ in 0..live {
            cursor = cursor.and_then(|addr| self.heap.next_of(addr));
        }
        while let Some(addr) = cursor {
            cursor = self.heap.next_of(addr);
            if let Some(meta) = self.heap.meta_mut(addr) {
                meta.marked = false;
            }
        }
    }
}

/// One aligned load. Only ever called with word-aligned addresses inside a
/// tracked block or the scanned stack range.
unsafe fn read_word(addr: Address) -> Word {
    *(addr as *const Word)
}

/// One aligned store; same constraints as [`read_word`].
unsafe fn write_word(addr: Address, value: Word) {
    *(addr as *mut Word) = value
}

/// Attempt to get the starting address of the stack via the pthread API. This
/// is highly platform specific. It is used as the upper bound for the range
/// of on-stack values which are scanned for potential roots in GC.
#[cfg(target_os = "linux")]
unsafe fn get_stack_start() -> Option<Address> {
    let mut attr: libc::pthread_attr_t = std::mem::zeroed();
    assert_eq!(libc::pthread_attr_init(&mut attr), 0);
    let ptid = libc::pthread_self();
    let e = libc::pthread_getattr_np(ptid, &mut attr);
    if e != 0 {
        assert_eq!(libc::pthread_attr_destroy(&mut attr), 0);
        return None;
    }
    let mut stackaddr = std::ptr::null_mut();
    let mut stacksize = 0;
    assert_eq!(
        libc::pthread_attr_getstack(&attr, &mut stackaddr, &mut stacksize),
        0
    );
    assert_eq!(libc::pthread_attr_destroy(&mut attr), 0);
    Some(stackaddr as usize + stacksize)
}
