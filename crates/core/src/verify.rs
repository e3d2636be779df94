//! Debug Heap Verifier
//!
//! Walks the whole heap and the reachability graph, asserting the
//! structural invariants after a collection:
//!
//! 1. every chunk parses into recognized blocks exactly up to its bitmap;
//! 2. every free-list entry is a free block whose size belongs to its
//!    size class;
//! 3. free bytes reconcile: list totals equal the free blocks found by
//!    the chunk walk;
//! 4. every reachable reference points at a recognized block header
//!    inside a chunk or the nursery — never into a block's interior, a
//!    free block or a forwarding header.
//!
//! Compiled always (tests use it directly); wired into the collectors
//! behind the `verify-heap` feature.

use crate::block::*;
use crate::floats::FLOAT_BUCKET_SIZE;
use crate::freelist::{FreeNode, NUM_FREE_LISTS, free_list_index};
use crate::gc::{RootSet, for_each_root};
use crate::heap::Heap;
use crate::nursery::big_node_span;
use crate::runtime::{Registry, Runtime};
use crate::value::Value;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

/// Verify the heap. The world must be stopped and the heap lock held.
pub fn verify_heap(rt: &Runtime, heap: &mut Heap, threads: &Registry) {
    let free_in_chunks = unsafe { parse_chunks(rt, heap) };
    let free_on_lists = unsafe { check_free_lists(heap) };
    assert_eq!(
        free_on_lists + heap.cur_free_size,
        free_in_chunks,
        "free-list totals do not reconcile with the chunk walk"
    );
    unsafe { check_reachability(rt, threads) };
}

/// Walk every chunk block by block. Returns the free bytes encountered
/// (including the bias cursor's span, which has no header).
unsafe fn parse_chunks(rt: &Runtime, heap: &Heap) -> usize {
    let mut free = 0usize;
    let mut chunk = rt.shared().chunks.load(Ordering::Acquire);
    while !chunk.is_null() {
        let c = unsafe { &*chunk };
        let data_end = c.data_end();
        let mut p = c.data_start();
        while p < data_end {
            if p == heap.cur_free as usize && heap.cur_free_size > 0 {
                // The bias cursor's remaining space is headerless.
                free += heap.cur_free_size;
                p += heap.cur_free_size;
                continue;
            }
            let header = unsafe { *(p as *const usize) };
            let kind = header_kind(header);
            assert_ne!(kind, KIND_INDIRECT, "forwarding header in the old generation");
            let size = match kind {
                KIND_BIGNODE => unsafe { big_node_span(p) },
                KIND_FLOATS => FLOAT_BUCKET_SIZE,
                KIND_FREE => {
                    let s = header_size(header);
                    free += s;
                    s
                }
                _ => unsafe { block_total_size(p as *const usize) },
            };
            assert!(size >= MIN_BLOCK_SIZE && size % ALLOC_UNIT == 0);
            assert!(p + size <= data_end, "block overruns its chunk");
            p += size;
        }
        assert_eq!(p, data_end, "chunk does not parse exactly");
        chunk = c.next;
    }
    free
}

/// Check every free list: entries are free blocks of the right size
/// class; child chains hold exact duplicates. Returns the total bytes on
/// the lists.
unsafe fn check_free_lists(heap: &Heap) -> usize {
    let mut total = 0usize;
    for idx in 0..NUM_FREE_LISTS {
        let mut node = heap.lists.head_next(idx);
        while !heap.lists.is_terminator(node) {
            let size = unsafe { (*node).size() };
            unsafe {
                assert_eq!(header_kind((*node).header), KIND_FREE);
            }
            assert_eq!(
                free_list_index(size),
                idx,
                "free block of {} bytes on list {}",
                size,
                idx
            );
            total += size;
            if size >= std::mem::size_of::<FreeNode>() {
                let mut child = unsafe { (*node).child };
                while !child.is_null() {
                    unsafe {
                        assert_eq!((*child).size(), size, "child chain size mismatch");
                        assert_eq!(header_kind((*child).header), KIND_FREE);
                        total += size;
                        child = (*child).child;
                    }
                }
            }
            node = unsafe { (*node).next };
        }
    }
    total
}

/// Walk the object graph from the roots; every reference must land on a
/// recognized block header inside a heap region.
unsafe fn check_reachability(rt: &Runtime, threads: &Registry) {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut work: Vec<Value> = Vec::new();
    unsafe {
        let mut collect = |slot: *mut Value| {
            let v = *slot;
            if !v.is_gc_inert() {
                work.push(v);
            }
        };
        for_each_root(rt, threads, RootSet::Young, &mut collect);
    }

    while let Some(v) = work.pop() {
        let addr = v.referent_addr();
        if !seen.insert(addr) {
            continue;
        }
        let in_heap =
            rt.shared().in_nursery(addr) || !rt.shared().find_chunk(addr).is_null();
        assert!(in_heap, "reference outside every heap region: {:#x}", addr);

        if v.is_float() {
            continue;
        }
        unsafe {
            let ptr = addr as *mut usize;
            let header = *ptr;
            let kind = header_kind(header);
            assert!(
                matches!(kind, KIND_VALUE | KIND_NONPTR | KIND_INSTANCE | KIND_MIXED),
                "reference to a non-object header (kind {}) at {:#x}",
                kind,
                addr
            );
            let (slots, count) = match kind {
                KIND_VALUE => (value_slots(ptr), header_data_len(header) / WORD),
                KIND_INSTANCE => (value_slots(ptr), (*header_type_desc(header)).slots),
                KIND_MIXED => (value_slots(ptr), mixed_prefix_len(ptr)),
                _ => continue,
            };
            for i in 0..count {
                let child = *slots.add(i);
                if !child.is_gc_inert() {
                    work.push(child);
                }
            }
        }
    }
}
