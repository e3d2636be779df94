//! Garbage Collection
//!
//! Two cooperating collectors:
//!
//! - **Young generation**: a stop-the-world copying collector. Live nursery
//!   blocks are copied into the old generation through the free-list
//!   allocator, leaving an indirect (forwarding) header behind; big blocks
//!   are retired in place by re-heading. The remembered sets, finalizer
//!   list, identity hashes and float cells migrate with the objects, then
//!   the nursery restarts empty.
//!
//! - **Old generation**: an incremental mark-sweep collector with states
//!   `None → Mark → MarkExe → Sweep`. Marking starts with a stop-the-world
//!   root scan, then proceeds in `INCREMENTALITY`-byte quanta driven from
//!   the allocator, consuming the global gray stack and the allocating
//!   thread's untraced list (fed by the write barrier). Mutator stacks are
//!   not barriered, so the mark→sweep transition stops the world once more
//!   and re-scans roots before sweeping. The sweep walks chunks block by
//!   block, coalescing garbage into free blocks.
//!
//! Forced collection (`collect_garbage_forced`) drives the state machine
//! all the way back to `None` and is the allocator's last resort; it is
//! suppressed while mark work is already executing.

use crate::bitmap;
use crate::block::*;
use crate::config::{
    self, INCREMENTALITY, MAX_BIG_BLOCK_RELATIVE_SIZE, MAX_OLD_GEN_GROW_BEFORE_GC,
    MIN_LIVE_DATA_SIZE, MIN_NURSERY_RELATIVE_SIZE,
};
use crate::floats::{FLOAT_BUCKET_SIZE, bucket_cells_range};
use crate::heap::Heap;
use crate::nursery::{
    BIG_NODE_SIZE, big_node_next, big_node_payload, big_node_payload_size, big_node_span,
};
use crate::runtime::{Registry, Runtime};
use crate::thread::ThreadCtx;
use crate::value::Value;

// =============================================================================
// State machine
// =============================================================================

/// States of the incremental old-generation collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcState {
    /// Incremental collection not active.
    None = 0,
    /// Mark active; the barrier shades stores.
    Mark = 1,
    /// Mark work currently executing; forced collection is suppressed.
    MarkExe = 2,
    /// Sweep active.
    Sweep = 3,
}

impl GcState {
    #[inline(always)]
    pub fn from_u8(v: u8) -> GcState {
        match v {
            0 => GcState::None,
            1 => GcState::Mark,
            2 => GcState::MarkExe,
            _ => GcState::Sweep,
        }
    }
}

// =============================================================================
// Triggers
// =============================================================================

/// Has enough been allocated since the last young collection?
#[inline]
pub(crate) fn time_for_young(heap: &Heap) -> bool {
    heap.alloc_amount.saturating_sub(2 * heap.nursery.largest_big)
        > config::scale(heap.nursery.size, MAX_BIG_BLOCK_RELATIVE_SIZE)
}

/// Has the old generation outgrown the last live size enough to start an
/// incremental full collection?
#[inline]
pub(crate) fn time_for_full(heap: &Heap) -> bool {
    heap.old_gen_size > config::scale(heap.live_size.max(MIN_LIVE_DATA_SIZE), MAX_OLD_GEN_GROW_BEFORE_GC)
}

/// Should the nursery grow after this young collection?
#[inline]
fn time_to_grow_nursery(heap: &Heap, max_nursery: usize) -> bool {
    config::scale(heap.old_gen_size, MIN_NURSERY_RELATIVE_SIZE) >= heap.nursery.size
        && heap.nursery.size < max_nursery
}

// =============================================================================
// Root enumeration
// =============================================================================

/// Which collection is asking for roots. The young collector treats the
/// remembered sets and the finalizer lists as strong roots; the old
/// collector must not (finalizable garbage is resurrected separately).
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootSet {
    Young,
    Old,
}

/// Apply `f` to every root slot. The world must be stopped; `threads` is
/// the frozen registry.
pub(crate) unsafe fn for_each_root(
    rt: &Runtime,
    threads: &Registry,
    which: RootSet,
    f: &mut dyn FnMut(*mut Value),
) {
    for &ctx in threads.iter() {
        let t = unsafe { &mut *ctx };

        let (lo, hi) = t.stack.scan_span();
        let mut p = lo;
        while p < hi {
            f(p);
            p = unsafe { p.add(1) };
        }

        for i in 0..t.temp_sp {
            f(&mut t.temps[i] as *mut Value);
        }
        for slot in t.regex_cache.iter_mut() {
            f(slot as *mut Value);
        }

        // Untraced entries are values; if their referents move they must
        // be repaired, so they are roots for the young collector too.
        for v in t.untraced.iter_mut() {
            f(v as *mut Value);
        }

        if which == RootSet::Young {
            // Remembered old→young slots.
            for &(slot, _) in t.new_refs.iter() {
                f(slot as *mut Value);
            }
        }
    }

    {
        let mut globals = rt.globals_lock();
        for v in globals.iter_mut() {
            f(v as *mut Value);
        }
    }
    {
        let mut args = rt.thread_args_lock();
        for slot in args.scan_slots() {
            f(slot);
        }
    }
    {
        let mut fin = rt.finalize_lock();
        // Pending finalizers stay alive until their finalizer has run.
        for v in fin.pending.iter_mut() {
            f(v as *mut Value);
        }
        if which == RootSet::Young {
            f(&mut fin.young_head as *mut Value);
            f(&mut fin.old_head as *mut Value);
        }
    }
}

// =============================================================================
// Young collection (copying)
// =============================================================================

/// Work state of one young collection: the gray queue of blocks whose
/// contents still need scanning, the full history of queued blocks (the
/// repair pass after an out-of-memory abort re-scans them), and the
/// abort flag itself.
struct CopyQueue {
    gray: Vec<usize>,
    queued: Vec<usize>,
    retired: usize,
    oom: bool,
}

impl CopyQueue {
    fn new() -> CopyQueue {
        CopyQueue {
            gray: Vec::with_capacity(256),
            queued: Vec::with_capacity(256),
            retired: 0,
            oom: false,
        }
    }

    fn push(&mut self, addr: usize) {
        self.gray.push(addr);
        self.queued.push(addr);
    }
}

/// Copy/retire every reachable young object, then reset the nursery.
/// Requires the heap lock; stops the world itself.
///
/// When the old generation cannot absorb the survivors even after heap
/// growth, the collection aborts cleanly: references already forwarded
/// are repaired to their copies, everything else keeps pointing at the
/// intact originals, the nursery is left as it was, and the caller gets
/// a memory error with the heap still valid.
pub(crate) unsafe fn collect_new_gen_locked(
    rt: &Runtime,
    heap: &mut Heap,
    _force_retire: bool,
) -> Result<(), crate::error::RtError> {
    if heap.young_gc_active {
        return Ok(());
    }
    let threads = rt.freeze_world();
    heap.young_gc_active = true;
    heap.stats.new_gen_collections += 1;

    // The nursery bitmap becomes the float-forwarding table; an aborted
    // incremental mark may have left stale bits in it.
    heap.nursery.bitmap.fill(0);

    let mut q = CopyQueue::new();

    unsafe {
        {
            let mut forward = |slot: *mut Value| {
                forward_slot(rt, heap, &mut q, slot);
            };
            for_each_root(rt, &threads, RootSet::Young, &mut forward);
        }

        // Drain: scan the contents of every copied or retired block.
        while let Some(addr) = q.gray.pop() {
            if q.oom {
                break;
            }
            scan_young_block(rt, heap, &mut q, addr);
        }

        if q.oom {
            repair_failed_copy(rt, heap, &threads, &q.queued);
            // Copied objects keep their identity hashes at the new
            // address; the forwarding headers are still readable here.
            rt.migrate_id_hashes();
            heap.stats.retire_count += q.retired as u64;
            heap.young_gc_active = false;
            rt.resume_world(threads);
            return Err(crate::error::RtError::Memory);
        }

        // Big blocks: survivors were re-headed during the scan; everything
        // still young on the list is garbage.
        let mut node = heap.nursery.big_head;
        heap.nursery.big_head = 0;
        heap.nursery.big_total = 0;
        while node != 0 {
            let next = big_node_next(node);
            let payload = big_node_payload(node);
            let payload_size = big_node_payload_size(node);
            if is_young_header(*payload) {
                let span = big_node_span(node);
                heap.add_free_or_garbage(rt.shared(), node as *mut u8, span);
            } else {
                // Retired: release the wrapper, keep the payload in place.
                heap.add_free_or_garbage(rt.shared(), node as *mut u8, BIG_NODE_SIZE);
                heap.old_gen_size += payload_size;
                q.retired += payload_size;
            }
            node = next;
        }

        // Remembered sets: entries whose slot no longer holds a young
        // reference are redundant now.
        for &ctx in threads.iter() {
            let t = &mut *ctx;
            let shared = rt.shared();
            t.new_refs.retain(|&(slot, _)| {
                let v = *(slot as *const Value);
                if v.is_gc_inert() {
                    return false;
                }
                let addr = v.referent_addr();
                if v.is_float() {
                    shared.in_nursery(addr)
                } else {
                    is_young_header(*(addr as *const usize))
                }
            });
            // Refresh the recorded values.
            for entry in t.new_refs.iter_mut() {
                entry.1 = *(entry.0 as *const Value);
            }
            // Slabs were consumed by the collection; force a refill.
            t.heap_ptr = 0;
            t.heap_end = 0;
        }

        migrate_finalize_lists(rt, heap);
        rt.migrate_id_hashes();
    }

    // Float cells in nursery buckets are gone.
    heap.float_young_free = std::ptr::null_mut();

    heap.nursery.reset();
    heap.stats.retire_count += q.retired as u64;
    heap.alloc_amount = 0;

    let max_nursery = rt.config().max_nursery_size;
    if time_to_grow_nursery(heap, max_nursery) {
        let new_size = (heap.nursery.size * 2).min(max_nursery);
        let Heap {
            ref mut nursery,
            ref mut backend,
            ..
        } = *heap;
        nursery.grow(&mut **backend, rt.shared(), new_size);
    }
    heap.stats.nursery_size = heap.nursery.size as u64;

    heap.young_gc_active = false;

    #[cfg(feature = "verify-heap")]
    crate::verify::verify_heap(rt, heap, &threads);

    rt.resume_world(threads);
    Ok(())
}

/// Value-slot span of a block, for scanning. Kinds without value slots
/// scan nothing.
unsafe fn value_slot_range(addr: usize) -> (*mut Value, usize) {
    unsafe {
        let ptr = addr as *mut usize;
        let header = *ptr;
        match header_kind(header) {
            KIND_VALUE => (value_slots(ptr), header_data_len(header) / WORD),
            KIND_INSTANCE => (value_slots(ptr), (*header_type_desc(header)).slots),
            KIND_MIXED => (value_slots(ptr), mixed_prefix_len(ptr)),
            _ => (std::ptr::null_mut(), 0),
        }
    }
}

/// Forward one root or object slot. Copies the referent on first visit,
/// follows forwarding afterwards, retires big blocks in place. Once the
/// old generation is exhausted, no further copies are attempted; the
/// repair pass cleans up afterwards.
unsafe fn forward_slot(rt: &Runtime, heap: &mut Heap, q: &mut CopyQueue, slot: *mut Value) {
    if q.oom {
        return;
    }
    let v = unsafe { *slot };
    if v.is_gc_inert() {
        return;
    }
    let addr = v.referent_addr();
    let shared = rt.shared();

    if v.is_float() {
        if !shared.in_nursery(addr) {
            return;
        }
        unsafe {
            let bitmap = heap.nursery.bitmap_ptr();
            let base = heap.nursery.base;
            if bitmap::test_bit(bitmap, base, addr) {
                // Already copied: the cell holds the forwarding address.
                *slot = v.with_referent(*(addr as *const usize));
                return;
            }
            let Some(new_cell) = retire_float_cell(rt, heap, *(addr as *const f64)) else {
                q.oom = true;
                return;
            };
            bitmap::set_bit(heap.nursery.bitmap_ptr(), base, addr);
            *(addr as *mut usize) = new_cell as usize;
            *slot = v.with_referent(new_cell as usize);
        }
        return;
    }

    unsafe {
        let header = *(addr as *const usize);
        if header_kind(header) == KIND_INDIRECT {
            *slot = v.with_referent(indirect_target(header));
            return;
        }
        if !is_young_header(header) {
            return;
        }

        if !shared.in_nursery(addr) {
            // A young big block: retire by re-heading, no copy.
            clear_young(addr as *mut usize);
            shade_retired(rt, heap, addr);
            q.push(addr);
            return;
        }

        // Copy into the old generation.
        let size = block_total_size(addr as *const usize);
        let Some(new_ptr) = old_alloc_for_copy(rt, heap, size) else {
            q.oom = true;
            return;
        };
        std::ptr::copy_nonoverlapping(addr as *const u8, new_ptr, size);
        clear_young(new_ptr as *mut usize);
        shade_retired(rt, heap, new_ptr as usize);
        *(addr as *mut usize) = indirect_header(new_ptr as usize);
        *slot = v.with_referent(new_ptr as usize);
        q.retired += size;
        heap.old_gen_size += size;
        q.push(new_ptr as usize);
    }
}

/// Scan the value slots of a freshly copied or retired block.
unsafe fn scan_young_block(rt: &Runtime, heap: &mut Heap, q: &mut CopyQueue, addr: usize) {
    unsafe {
        let (slots, count) = value_slot_range(addr);
        for i in 0..count {
            forward_slot(rt, heap, q, slots.add(i));
        }
    }
}

/// Old-generation allocation on behalf of the copying collector. Growth
/// is attempted; forced collection is not (it cannot run while the young
/// collection is in flight). None means the heap limit is reached and the
/// collection must abort.
unsafe fn old_alloc_for_copy(rt: &Runtime, heap: &mut Heap, size: usize) -> Option<*mut u8> {
    unsafe {
        if let Some(p) = heap.try_alloc_from_lists(rt.shared(), size) {
            return Some(p);
        }
        if heap.grow(rt.shared(), size) {
            if let Some(p) = heap.try_alloc_from_lists(rt.shared(), size) {
                return Some(p);
            }
        }
    }
    None
}

/// Give the young collector an old-generation float cell.
unsafe fn retire_float_cell(rt: &Runtime, heap: &mut Heap, value: f64) -> Option<*mut f64> {
    unsafe {
        let cell = crate::floats::pop_cell(&mut heap.float_old_free, value);
        if !cell.is_null() {
            return Some(cell);
        }
        let bucket = old_alloc_for_copy(rt, heap, FLOAT_BUCKET_SIZE)? as *mut usize;
        heap.float_old_free =
            crate::floats::init_float_bucket(bucket, false, heap.float_old_free);
        shade_retired(rt, heap, bucket as usize);
        let cell = crate::floats::pop_cell(&mut heap.float_old_free, value);
        debug_assert!(!cell.is_null());
        Some(cell)
    }
}

/// After an out-of-memory abort the heap is a hybrid: some objects were
/// copied (their originals carry forwarding headers), the rest still live
/// in the nursery. No mutator may ever reach a forwarding header, so this
/// pass walks everything reachable — the roots, every block that entered
/// the copy queue, and the still-young graph — and repoints any reference
/// to a forwarded original at its copy. Originals that were never copied
/// stay where they are; the nursery is not reset.
unsafe fn repair_failed_copy(
    rt: &Runtime,
    heap: &mut Heap,
    threads: &crate::runtime::Registry,
    queued: &[usize],
) {
    let mut visited: std::collections::HashSet<usize> = std::collections::HashSet::new();
    let mut work: Vec<usize> = Vec::new();

    for &addr in queued {
        if visited.insert(addr) {
            work.push(addr);
        }
    }

    unsafe {
        {
            let mut repair = |slot: *mut Value| {
                repair_slot(rt, heap, &mut visited, &mut work, slot);
            };
            for_each_root(rt, threads, RootSet::Young, &mut repair);
        }
        while let Some(addr) = work.pop() {
            let (slots, count) = value_slot_range(addr);
            for i in 0..count {
                repair_slot(rt, heap, &mut visited, &mut work, slots.add(i));
            }
        }
    }
}

/// Repair one slot after an aborted copy: follow float and block
/// forwarding, and queue still-young or freshly copied referents so their
/// own slots get repaired too.
unsafe fn repair_slot(
    rt: &Runtime,
    heap: &mut Heap,
    visited: &mut std::collections::HashSet<usize>,
    work: &mut Vec<usize>,
    slot: *mut Value,
) {
    let v = unsafe { *slot };
    if v.is_gc_inert() {
        return;
    }
    let addr = v.referent_addr();
    let shared = rt.shared();

    if v.is_float() {
        unsafe {
            if shared.in_nursery(addr)
                && bitmap::test_bit(heap.nursery.bitmap_ptr(), heap.nursery.base, addr)
            {
                *slot = v.with_referent(*(addr as *const usize));
            }
        }
        return;
    }

    unsafe {
        let header = *(addr as *const usize);
        if header_kind(header) == KIND_INDIRECT {
            let target = indirect_target(header);
            *slot = v.with_referent(target);
            if visited.insert(target) {
                work.push(target);
            }
            return;
        }
        if is_young_header(header) && visited.insert(addr) {
            work.push(addr);
        }
    }
}

/// Keep a block just moved into the old generation alive across the
/// incremental collection in progress, if any: queue it for marking during
/// `Mark`, mark it directly when the sweep has not reached it yet.
unsafe fn shade_retired(rt: &Runtime, heap: &mut Heap, addr: usize) {
    match rt.shared().gc_state() {
        GcState::None => {}
        GcState::Mark | GcState::MarkExe => {
            heap.mark_stack
                .push(Value::from_ptr(addr as *mut usize));
        }
        GcState::Sweep => {
            if !heap.is_swept(rt.shared(), addr) {
                unsafe { mark_addr(rt, heap, addr) };
            }
        }
    }
}

/// Same protection for blocks handed out by the allocator while a
/// collection is active.
pub(crate) unsafe fn shade_new_block(rt: &Runtime, heap: &mut Heap, addr: usize) {
    match rt.shared().gc_state() {
        GcState::None => {}
        GcState::Mark | GcState::MarkExe => unsafe { mark_addr(rt, heap, addr); },
        GcState::Sweep => {
            if !heap.is_swept(rt.shared(), addr) {
                unsafe { mark_addr(rt, heap, addr) };
            }
        }
    }
}

/// Migrate the young finalizer list into the old one. The list entries are
/// roots, so every one of them has been copied by the time this runs and
/// the links between them were forwarded by the block scan.
unsafe fn migrate_finalize_lists(rt: &Runtime, heap: &mut Heap) {
    let mut fin = rt.finalize_lock();
    if fin.young_head.is_nil() {
        return;
    }
    unsafe {
        let mut v = fin.young_head;
        loop {
            let desc = header_type_desc(*v.as_ptr());
            let link = value_slots(v.as_ptr()).add((*desc).finalize_slot);
            if (*link).is_nil() {
                // Tail: splice the old list on.
                if rt.shared().gc_state() == GcState::Mark && !fin.old_head.is_nil() {
                    heap.mark_stack.push(fin.old_head);
                }
                *link = fin.old_head;
                break;
            }
            v = *link;
        }
    }
    fin.old_head = fin.young_head;
    fin.young_head = Value::NIL;
}

// =============================================================================
// Old-generation collection (incremental mark-sweep)
// =============================================================================

/// Set the mark bit for `addr`, in the nursery bitmap or the owning
/// chunk's. Returns whether it was already set.
unsafe fn mark_addr(rt: &Runtime, heap: &mut Heap, addr: usize) -> bool {
    let shared = rt.shared();
    unsafe {
        if shared.in_nursery(addr) {
            let base = heap.nursery.base;
            return bitmap::test_and_set_bit(heap.nursery.bitmap_ptr(), base, addr);
        }
        let chunk = shared.find_chunk(addr);
        debug_assert!(!chunk.is_null(), "marking an address outside the heap");
        if chunk.is_null() {
            return true;
        }
        let c = &*chunk;
        bitmap::test_and_set_bit(c.bitmap(), c.base(), addr)
    }
}

/// Queue a root value for marking.
#[inline]
fn push_gray(heap: &mut Heap, v: Value) {
    if !v.is_gc_inert() {
        heap.mark_stack.push(v);
    }
}

/// Start an incremental full collection: stop the world, clear every mark
/// bit, queue the roots, enter `Mark`. Requires the heap lock.
pub(crate) unsafe fn start_full_locked(rt: &Runtime, heap: &mut Heap) {
    if rt.shared().gc_state() != GcState::None {
        return;
    }
    let threads = rt.freeze_world();
    heap.stats.full_collections += 1;

    unsafe {
        let mut chunk = rt.shared().chunks.load(std::sync::atomic::Ordering::Acquire);
        while !chunk.is_null() {
            let c = &*chunk;
            bitmap::clear_words(
                c.bitmap(),
                crate::bitmap::bit_field_size(c.size) / WORD,
            );
            chunk = c.next;
        }
    }
    heap.nursery.bitmap.fill(0);
    heap.mark_stack.clear();

    unsafe {
        let mut mark = |slot: *mut Value| push_gray(heap, *slot);
        for_each_root(rt, &threads, RootSet::Old, &mut mark);
    }

    rt.shared().set_gc_state(GcState::Mark);
    rt.resume_world(threads);
}

/// Pop one gray value, mark it, scan its children. Returns the bytes of
/// mark work done (0 when the value was already processed).
unsafe fn process_gray(rt: &Runtime, heap: &mut Heap, v: Value) -> usize {
    let addr = v.referent_addr();
    unsafe {
        if v.is_float() {
            mark_addr(rt, heap, addr);
            return std::mem::size_of::<f64>();
        }
        if mark_addr(rt, heap, addr) {
            return 0;
        }
        let ptr = addr as *mut usize;
        let header = *ptr;
        let (slots, count) = match header_kind(header) {
            KIND_VALUE => (value_slots(ptr), header_data_len(header) / WORD),
            KIND_INSTANCE => (value_slots(ptr), (*header_type_desc(header)).slots),
            KIND_MIXED => (value_slots(ptr), mixed_prefix_len(ptr)),
            KIND_INDIRECT => return 0,
            _ => return block_total_size(ptr),
        };
        for i in 0..count {
            let child = *slots.add(i);
            push_gray(heap, child);
        }
        block_total_size(ptr)
    }
}

/// One collection increment: `INCREMENTALITY` bytes of mark work from the
/// global gray stack and the calling thread's untraced list, or the same
/// amount of sweeping. Requires the heap lock.
pub(crate) unsafe fn collect_increment_locked(
    rt: &Runtime,
    heap: &mut Heap,
    t: Option<&mut ThreadCtx>,
) {
    heap.stats.increments += 1;
    match rt.shared().gc_state() {
        GcState::None | GcState::MarkExe => {}
        GcState::Mark => unsafe { mark_increment(rt, heap, t) },
        GcState::Sweep => unsafe { sweep_increment(rt, heap) },
    }
}

unsafe fn mark_increment(rt: &Runtime, heap: &mut Heap, mut t: Option<&mut ThreadCtx>) {
    rt.shared().set_gc_state(GcState::MarkExe);
    let mut budget = INCREMENTALITY as isize;
    while budget > 0 {
        let v = heap.mark_stack.pop().or_else(|| {
            t.as_deref_mut().and_then(|t| t.untraced.pop())
        });
        let Some(v) = v else { break };
        budget -= unsafe { process_gray(rt, heap, v) } as isize;
    }

    let local_done = t.map(|t| t.untraced.is_empty()).unwrap_or(true);
    if heap.mark_stack.is_empty() && local_done {
        unsafe { finish_mark(rt, heap) };
    } else {
        rt.shared().set_gc_state(GcState::Mark);
    }
}

/// Mark → sweep transition: stop the world, re-scan the (unbarriered)
/// roots, drain every gray set to completion, resurrect unreachable
/// finalizable instances, purge dead identity hashes, purge the small free
/// lists, invalidate the bias cursor, position the sweep cursor.
unsafe fn finish_mark(rt: &Runtime, heap: &mut Heap) {
    let threads = rt.freeze_world();

    unsafe {
        {
            let mut mark = |slot: *mut Value| push_gray(heap, *slot);
            for_each_root(rt, &threads, RootSet::Old, &mut mark);
        }
        for &ctx in threads.iter() {
            let t = &mut *ctx;
            while let Some(v) = t.untraced.pop() {
                push_gray(heap, v);
            }
        }
        while let Some(v) = heap.mark_stack.pop() {
            process_gray(rt, heap, v);
        }

        resurrect_finalizable(rt, heap);
        rt.purge_id_hashes(heap);

        heap.remove_small_blocks();
        heap.inactivate_cur_free(rt.shared());

        // Free cells may live in buckets about to be reclaimed.
        heap.float_old_free = std::ptr::null_mut();

        // The sweep coalesces freely; the tracked chunk-tail block may not
        // survive as a block of its recorded extent.
        heap.last_block = 0;
        heap.last_block_end = 0;
    }

    heap.sweep_chunk = rt
        .shared()
        .chunks
        .load(std::sync::atomic::Ordering::Acquire);
    heap.sweep_ptr = if heap.sweep_chunk.is_null() {
        0
    } else {
        unsafe { (*heap.sweep_chunk).data_start() }
    };
    heap.sweep_live = 0;

    rt.shared().set_gc_state(GcState::Sweep);
    rt.resume_world(threads);
}

/// Move unmarked finalizable instances from the finalizer list to the
/// pending queue and mark them (and everything they reach) live: the
/// finalizer must see an intact object. They are reclaimed on the cycle
/// after their finalizer has run.
unsafe fn resurrect_finalizable(rt: &Runtime, heap: &mut Heap) {
    let mut fin = rt.finalize_lock();
    unsafe {
        let mut survivors = Value::NIL;
        let mut v = fin.old_head;
        while !v.is_nil() {
            let ptr = v.as_ptr();
            let desc = header_type_desc(*ptr);
            let link = value_slots(ptr).add((*desc).finalize_slot);
            let next = *link;
            if rt.shared().is_marked(v.referent_addr()) {
                *link = survivors;
                survivors = v;
            } else {
                fin.pending.push(v);
                *link = Value::NIL;
                push_gray(heap, v);
                while let Some(g) = heap.mark_stack.pop() {
                    process_gray(rt, heap, g);
                }
            }
            v = next;
        }
        fin.old_head = survivors;
    }
}

unsafe fn sweep_increment(rt: &Runtime, heap: &mut Heap) {
    // An active bias cursor is headerless space; flush it so the walk
    // below only ever sees well-formed blocks.
    heap.inactivate_cur_free(rt.shared());

    let mut budget = INCREMENTALITY as isize;
    while budget > 0 {
        if heap.sweep_chunk.is_null() {
            unsafe { finish_sweep(rt, heap) };
            return;
        }
        let chunk = unsafe { &*heap.sweep_chunk };
        let data_end = chunk.data_end();
        if heap.sweep_ptr >= data_end {
            heap.sweep_chunk = chunk.next;
            heap.sweep_ptr = if heap.sweep_chunk.is_null() {
                0
            } else {
                unsafe { (*heap.sweep_chunk).data_start() }
            };
            continue;
        }

        let bitmap = chunk.bitmap();
        let base = chunk.base();
        let mut p = heap.sweep_ptr;
        let mut run_start = 0usize;

        while p < data_end && budget > 0 {
            let header = unsafe { *(p as *const usize) };
            let kind = header_kind(header);
            let size;
            let live;
            match kind {
                KIND_BIGNODE => {
                    // Young big blocks are reclaimed by the young
                    // collector only.
                    size = unsafe { big_node_span(p) };
                    live = true;
                }
                KIND_FLOATS => {
                    size = FLOAT_BUCKET_SIZE;
                    let (lo, hi) = bucket_cells_range(p);
                    live = unsafe {
                        bitmap::test_bit(bitmap, base, p)
                            || bitmap::any_bit_in_range(bitmap, base, lo, hi)
                    };
                }
                KIND_FREE => {
                    size = header_size(header);
                    if size >= std::mem::size_of::<crate::freelist::FreeNode>() {
                        unsafe { heap.remove_free_block(p as *mut u8) };
                        live = false;
                    } else {
                        // Small free blocks were purged at the transition
                        // and are never created in unswept space.
                        debug_assert!(false, "singly-linked free block in unswept space");
                        live = true;
                    }
                }
                _ => {
                    size = unsafe { block_total_size(p as *const usize) };
                    live = unsafe { bitmap::test_bit(bitmap, base, p) };
                }
            }

            if live {
                if run_start != 0 {
                    unsafe { heap.add_free_block(run_start as *mut u8, p - run_start, true) };
                    run_start = 0;
                }
                if kind != KIND_FREE {
                    heap.sweep_live += size;
                }
            } else if run_start == 0 {
                run_start = p;
            }

            p += size;
            budget -= size as isize;
        }

        if run_start != 0 {
            unsafe { heap.add_free_block(run_start as *mut u8, p - run_start, true) };
        }
        heap.sweep_ptr = p;
    }
}

unsafe fn finish_sweep(rt: &Runtime, heap: &mut Heap) {
    heap.old_gen_size = heap.sweep_live;
    heap.live_size = heap.sweep_live.max(MIN_LIVE_DATA_SIZE);
    heap.stats.old_gen_size = heap.old_gen_size as u64;
    heap.stats.last_live_size = heap.sweep_live as u64;
    rt.shared().set_gc_state(GcState::None);
}

/// Drive the state machine all the way to `None` regardless of quanta.
/// Returns false when suppressed (mark work already executing) — the
/// collector never runs inside itself.
pub(crate) unsafe fn collect_forced_locked(rt: &Runtime, heap: &mut Heap) -> bool {
    if rt.shared().gc_state() == GcState::MarkExe || heap.young_gc_active {
        return false;
    }
    heap.stats.forced_collections += 1;
    unsafe {
        if rt.shared().gc_state() == GcState::None {
            start_full_locked(rt, heap);
        }
        while rt.shared().gc_state() != GcState::None {
            collect_increment_locked(rt, heap, None);
        }
    }
    true
}
