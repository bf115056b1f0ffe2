// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A conservative, stop-the-world, tracing garbage collector for programs
//! that request their allocations through [`alloc`] instead of the raw
//! system allocator.
//!
//! Two reclamation disciplines are available behind [`set_kind`]: plain
//! mark-and-sweep, which frees unreachable blocks in place, and mark-compact,
//! which additionally slides survivors into the low slots of the allocation
//! order and rewrites references to them.
//!
//! Roots are discovered by scanning the machine stack (and the spilled
//! register file) for words that equal a tracked block address. That test is
//! conservative: an integer that happens to coincide with a block address
//! keeps the block alive. It never frees a block that is still reachable
//! through word-aligned pointers.
//!
//! Preconditions, which are documented rather than checked:
//!
//! * [`init`] is called exactly once, from a frame that encloses every frame
//!   that will later hold roots (typically the top of `main`).
//! * The collector is single-threaded; all calls come from the thread that
//!   ran [`init`].
//! * The stack grows toward lower addresses and pointers are stored at
//!   word-aligned addresses, which holds for the code compilers generate on
//!   the supported platform (x86-64 Linux).
//!
//! ```no_run
//! compactgc::init();
//! let block = compactgc::alloc(64).unwrap();
//! // ... use the block, drop references to it ...
//! compactgc::collect();
//! ```

mod alloc;
pub mod gc;

use std::{io, process, ptr::NonNull};

use parking_lot::Mutex;

use crate::{
    alloc::{Address, Word},
    gc::Collector,
};
pub use crate::gc::{CollectKind, DebugFlags};

static COLLECTOR: Mutex<Option<Collector>> = Mutex::new(None);

/// Initialises the process-wide collector and records the stack position
/// below which no roots will ever be looked for. Must be called before any
/// other operation; calling it twice is a debug assertion failure.
#[inline(never)]
pub fn init() {
    // The address of this local is the lower bound of every later root scan,
    // so every frame that may hold roots must sit above this frame.
    let anchor: Word = 0;
    let bottom = &anchor as *const Word as Address;

    let mut collector = COLLECTOR.lock();
    debug_assert!(collector.is_none(), "collector initialised twice");
    *collector = Some(Collector::new(bottom));
}

/// Returns a zero-initialised block of `size` bytes, registered with the
/// collector. `None` for zero-sized requests. Exhaustion of the underlying
/// allocator is fatal.
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    let mut collector = COLLECTOR.lock();
    let addr = collector.as_mut()?.heap.alloc(size)?;
    NonNull::new(addr as *mut u8)
}

/// Releases a block without waiting for a collection. Null and untracked
/// addresses are ignored. This is an escape hatch; normal reclamation goes
/// through [`collect`].
pub fn free(block: *mut u8) {
    let mut collector = COLLECTOR.lock();
    if let Some(c) = collector.as_mut() {
        c.heap.free(block as Address);
    }
}

/// Runs one synchronous collection with the configured discipline. The
/// caller is the mutator, so the program is paused until this returns.
pub fn collect() {
    let mut collector = COLLECTOR.lock();
    if let Some(c) = collector.as_mut() {
        c.collect();
    }
}

/// Writes `message` followed by the address, mark bit, and size of every
/// tracked block to stdout.
pub fn dump(message: &str) {
    let collector = COLLECTOR.lock();
    if let Some(c) = collector.as_ref() {
        let stdout = io::stdout();
        let _ = c.heap.dump_to(&mut stdout.lock(), message);
    }
}

/// Selects the reclamation discipline for subsequent collections.
pub fn set_kind(kind: CollectKind) {
    let mut collector = COLLECTOR.lock();
    if let Some(c) = collector.as_mut() {
        c.set_kind(kind);
    }
}

/// Replaces the collector's phase toggles.
pub fn debug_flags(flags: DebugFlags) {
    let mut collector = COLLECTOR.lock();
    if let Some(c) = collector.as_mut() {
        c.set_debug_flags(flags);
    }
}

/// Read-only views over the collector's bookkeeping, for tests and host
/// program diagnostics.
pub struct Debug;

impl Debug {
    /// Whether `block` is the base address of a live tracked block.
    pub fn is_tracked(block: *const u8) -> bool {
        let collector = COLLECTOR.lock();
        collector
            .as_ref()
            .map_or(false, |c| c.heap.is_tracked(block as Address))
    }

    /// Whether `block` is tracked and currently carries the mark bit. After
    /// a full collection this is false for every survivor.
    pub fn is_marked(block: *const u8) -> bool {
        let collector = COLLECTOR.lock();
        collector.as_ref().map_or(false, |c| {
            c.heap
                .meta(block as Address)
                .map_or(false, |meta| meta.marked)
        })
    }

    /// The requested byte size of a tracked block.
    pub fn block_size(block: *const u8) -> Option<usize> {
        let collector = COLLECTOR.lock();
        collector
            .as_ref()
            .and_then(|c| c.heap.meta(block as Address).map(|meta| meta.size))
    }

    /// How many blocks the collector is tracking.
    pub fn total_allocated() -> usize {
        let collector = COLLECTOR.lock();
        collector.as_ref().map_or(0, |c| c.heap.total_allocated())
    }
}

/// Unrecoverable collector failure: diagnostic, then exit. User code cannot
/// meaningfully continue past a broken runtime.
pub(crate) fn fatal(message: &str) -> ! {
    eprintln!("gc: {}", message);
    process::exit(1);
}
