//! Heap State and Growth
//!
//! The Mica heap is separate from the process heap: old-generation chunks
//! come from a `RegionBackend` and are managed with segregated free lists
//! (`freelist`), the nursery is a single bump-allocated region (`nursery`).
//! Everything in `Heap` is guarded by the runtime's heap mutex.
//!
//! A small amount of state is shared outside the mutex in `HeapShared`:
//! the chunk list head, the nursery bounds and the GC state, which the
//! write barrier must read lock-free on every mutation.

use crate::bitmap::{bit_field_index, bit_field_size};
use crate::block::{SUB_BYTES, WORD, nonptr_header, round_block_size};
use crate::config::{self, RuntimeConfig};
use crate::freelist::{FreeLists, NUM_FREE_LISTS};
use crate::gc::GcState;
use crate::nursery::Nursery;
use crate::regions::{CHUNK_HEADER_SIZE, ChunkHeader, RegionBackend};
use crate::report::GcStats;
use crate::value::Value;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

// =============================================================================
// Shared (lock-free) heap state
// =============================================================================

/// Heap state readable without the heap mutex. The write barrier consults
/// this on every store into an object.
pub struct HeapShared {
    /// Head of the chunk list. Chunks are only prepended (publish with
    /// release so a barrier walking the list sees initialized headers);
    /// `ChunkHeader::next` is immutable after insertion.
    pub(crate) chunks: AtomicPtr<ChunkHeader>,
    /// Nursery bounds; only change while the world is stopped.
    pub(crate) nursery_base: AtomicUsize,
    pub(crate) nursery_end: AtomicUsize,
    /// Current incremental GC state (`GcState` as u8).
    pub(crate) gc_state: AtomicU8,
}

impl HeapShared {
    pub(crate) fn new() -> HeapShared {
        HeapShared {
            chunks: AtomicPtr::new(std::ptr::null_mut()),
            nursery_base: AtomicUsize::new(0),
            nursery_end: AtomicUsize::new(0),
            gc_state: AtomicU8::new(GcState::None as u8),
        }
    }

    /// Current GC state.
    #[inline(always)]
    pub fn gc_state(&self) -> GcState {
        GcState::from_u8(self.gc_state.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub(crate) fn set_gc_state(&self, state: GcState) {
        self.gc_state.store(state as u8, Ordering::Relaxed);
    }

    /// Is `addr` inside the nursery region?
    #[inline(always)]
    pub fn in_nursery(&self, addr: usize) -> bool {
        addr >= self.nursery_base.load(Ordering::Relaxed)
            && addr < self.nursery_end.load(Ordering::Relaxed)
    }

    /// Find the old-generation chunk containing `addr`, if any.
    #[inline]
    pub(crate) fn find_chunk(&self, addr: usize) -> *mut ChunkHeader {
        let mut chunk = self.chunks.load(Ordering::Acquire);
        while !chunk.is_null() {
            let c = unsafe { &*chunk };
            if c.contains(addr) {
                return chunk;
            }
            chunk = c.next;
        }
        std::ptr::null_mut()
    }

    /// Is the old-generation block (or float cell) at `addr` marked?
    /// Returns false for addresses outside every chunk.
    #[inline]
    pub(crate) fn is_marked(&self, addr: usize) -> bool {
        let chunk = self.find_chunk(addr);
        if chunk.is_null() {
            return false;
        }
        let c = unsafe { &*chunk };
        unsafe { crate::bitmap::test_bit(c.bitmap(), c.base(), addr) }
    }
}

// =============================================================================
// Heap
// =============================================================================

/// All heap state guarded by the heap mutex: free lists, the bias cursor,
/// nursery, float free lists, GC work state and statistics.
pub struct Heap {
    pub(crate) lists: Box<FreeLists>,

    /// Bias cursor ("current free block"): a bump pointer remembered
    /// between calls so small allocations avoid the free lists.
    pub(crate) cur_free: *mut u8,
    pub(crate) cur_free_size: usize,

    /// Last free block of the most recently grown chunk, tracked so heap
    /// extension can concatenate adjacent free space.
    pub(crate) last_block: usize,
    pub(crate) last_block_end: usize,

    /// Total chunk bytes including bitmaps and headers.
    pub(crate) heap_size: usize,
    pub(crate) max_heap_size: usize,

    pub(crate) backend: Box<dyn RegionBackend>,
    pub(crate) nursery: Nursery,

    /// Bytes handed out to thread slabs and big blocks since the last young
    /// collection.
    pub(crate) alloc_amount: usize,
    /// Data bytes in the old generation.
    pub(crate) old_gen_size: usize,
    /// Live data size measured by the last full collection.
    pub(crate) live_size: usize,

    /// Set while a young collection runs; suppresses forced full GC from
    /// the allocator.
    pub(crate) young_gc_active: bool,
    /// Set across the allocator's post-GC retry to avoid GC recursion.
    pub(crate) forced_retry: bool,

    /// Gray stack for the incremental old-generation mark.
    pub(crate) mark_stack: Vec<Value>,
    /// Sweep cursor: current chunk and address within it.
    pub(crate) sweep_chunk: *mut ChunkHeader,
    pub(crate) sweep_ptr: usize,
    /// Live bytes counted by the sweep in progress.
    pub(crate) sweep_live: usize,

    /// Free float cells in nursery buckets (invalidated by young GC).
    pub(crate) float_young_free: *mut f64,
    /// Free float cells in old-generation buckets (used during retirement).
    pub(crate) float_old_free: *mut f64,

    pub(crate) stats: GcStats,
}

// Safety: Heap is only accessed under the runtime's heap mutex; the raw
// pointers it holds refer to chunk memory owned by the same runtime.
unsafe impl Send for Heap {}

impl Heap {
    /// Create the heap: initial nursery plus an initial old-generation
    /// chunk. Returns None if the backend cannot provide the regions.
    pub(crate) fn new(
        config: &RuntimeConfig,
        shared: &HeapShared,
        mut backend: Box<dyn RegionBackend>,
    ) -> Option<Heap> {
        let nursery = Nursery::new(&mut *backend, shared)?;
        let mut heap = Heap {
            lists: FreeLists::new(),
            cur_free: std::ptr::null_mut(),
            cur_free_size: 0,
            last_block: 0,
            last_block_end: 0,
            heap_size: 0,
            max_heap_size: config.max_heap_size,
            backend,
            nursery,
            alloc_amount: 0,
            old_gen_size: 0,
            live_size: config::MIN_LIVE_DATA_SIZE,
            young_gc_active: false,
            forced_retry: false,
            mark_stack: Vec::with_capacity(256),
            sweep_chunk: std::ptr::null_mut(),
            sweep_ptr: 0,
            sweep_live: 0,
            float_young_free: std::ptr::null_mut(),
            float_old_free: std::ptr::null_mut(),
            stats: GcStats::default(),
        };
        if !heap.grow(shared, config.initial_heap_size) {
            return None;
        }
        heap.stats.nursery_size = heap.nursery.size as u64;
        Some(heap)
    }

    /// Is `ptr` inside the tracked last block of the newest chunk?
    /// Equality at both ends is fine: the block may be zero-sized.
    #[inline(always)]
    pub(crate) fn is_inside_last_block(&self, ptr: usize) -> bool {
        ptr >= self.last_block && ptr <= self.last_block_end
    }

    /// Flush the bias cursor back to the free lists.
    pub(crate) fn inactivate_cur_free(&mut self, shared: &HeapShared) {
        if self.is_inside_last_block(self.cur_free as usize) {
            self.last_block = self.cur_free as usize;
        }
        if self.cur_free_size > 0 {
            let (ptr, size) = (self.cur_free, self.cur_free_size);
            self.cur_free_size = 0;
            unsafe { self.add_free_or_garbage(shared, ptr, size) };
        }
        self.cur_free = std::ptr::null_mut();
    }

    /// Release a no-longer-used block. Normally it goes back on a free
    /// list; small blocks in the unswept part of an in-progress sweep are
    /// turned into raw garbage instead, because singly-linked free blocks
    /// cannot be unlinked when the sweep coalesces over them.
    pub(crate) unsafe fn add_free_or_garbage(
        &mut self,
        shared: &HeapShared,
        ptr: *mut u8,
        size: usize,
    ) {
        let small = size < std::mem::size_of::<crate::freelist::FreeNode>();
        if small
            && shared.gc_state() == GcState::Sweep
            && !self.is_swept(shared, ptr as usize)
        {
            unsafe { *(ptr as *mut usize) = nonptr_header(size - WORD, SUB_BYTES, false) };
        } else {
            unsafe { self.add_free_block(ptr, size, false) };
        }
    }

    /// Has the in-progress sweep already passed `addr`? Meaningful only in
    /// the `Sweep` state. Chunks prepended after the sweep started sit in
    /// front of the cursor chunk and count as swept, which is correct: the
    /// sweep will never visit them.
    pub(crate) fn is_swept(&self, shared: &HeapShared, addr: usize) -> bool {
        let mut chunk = shared.chunks.load(Ordering::Acquire);
        while !chunk.is_null() {
            let c = unsafe { &*chunk };
            if c.contains(addr) {
                return if chunk == self.sweep_chunk {
                    addr < self.sweep_ptr
                } else {
                    // Visited chunks are those before the cursor chunk in
                    // list order.
                    self.chunk_precedes(shared, chunk, self.sweep_chunk)
                };
            }
            chunk = c.next;
        }
        // Not in any chunk (nursery): never swept.
        false
    }

    /// Does `a` come before `b` in the chunk list (i.e. was prepended
    /// later)?
    fn chunk_precedes(
        &self,
        shared: &HeapShared,
        a: *mut ChunkHeader,
        b: *mut ChunkHeader,
    ) -> bool {
        let mut chunk = shared.chunks.load(Ordering::Acquire);
        while !chunk.is_null() {
            if chunk == a {
                return true;
            }
            if chunk == b {
                return false;
            }
            chunk = unsafe { (*chunk).next };
        }
        false
    }

    // =========================================================================
    // Growth
    // =========================================================================

    /// Grow the old generation by at least `req_size` usable bytes. The
    /// request is inflated to leave room for the mark bitmap and chunk
    /// header, rounded up by the growth policy and capped by the maximum
    /// heap size.
    pub(crate) fn grow(&mut self, shared: &HeapShared, req_size: usize) -> bool {
        let mut req = req_size + 2 * bit_field_size(req_size) + CHUNK_HEADER_SIZE;

        if self.heap_size + req > self.max_heap_size {
            return false;
        }

        if self.backend.prefers_large_grow() {
            req = req.max(config::scale(self.heap_size, config::MIN_HEAP_GROW_FACTOR));
        }
        req = req.max(config::MIN_HEAP_GROW);
        req = req.min(self.max_heap_size - self.heap_size);

        let head = shared.chunks.load(Ordering::Acquire);
        let Some((new, size)) = self.backend.grow_heap(head, req) else {
            return false;
        };

        self.heap_size += size;
        self.stats.heap_size = self.heap_size as u64;

        if !head.is_null() && new as usize == unsafe { (*head).end() } {
            // The new space is adjacent: extend the newest chunk in place.
            unsafe { self.extend_chunk(shared, head, size) };
        } else {
            unsafe { self.add_chunk(shared, new, size) };
        }
        true
    }

    /// Extend chunk `head` by `size` bytes: relocate its bitmap to the new
    /// tail and concatenate the fresh space onto the last free block when
    /// possible.
    unsafe fn extend_chunk(&mut self, shared: &HeapShared, head: *mut ChunkHeader, size: usize) {
        let base = head as usize;
        let old_size = unsafe { (*head).size };
        let old_bit_ind = bit_field_index(old_size);
        let old_bit_size = bit_field_size(old_size);

        unsafe { (*head).size = old_size + size };
        let new_size = old_size + size;
        let new_bit_ind = bit_field_index(new_size);
        let new_bit_size = bit_field_size(new_size);

        unsafe {
            std::ptr::copy(
                (base + old_bit_ind) as *const u8,
                (base + new_bit_ind) as *mut u8,
                old_bit_size,
            );
            std::ptr::write_bytes(
                (base + new_bit_ind + old_bit_size) as *mut u8,
                0,
                new_bit_size - old_bit_size,
            );
            // Zero what the old bitmap occupied below the new bitmap, so a
            // concurrent barrier reading a stale bitmap location sees
            // "unmarked" (a redundant gray push, never a missed one).
            if old_bit_ind < new_bit_ind {
                let stale_end = (old_bit_ind + old_bit_size).min(new_bit_ind);
                std::ptr::write_bytes(
                    (base + old_bit_ind) as *mut u8,
                    0,
                    stale_end - old_bit_ind,
                );
            }
        }

        self.inactivate_cur_free(shared);

        if self.last_block_end == base + old_bit_ind
            && self.last_block_end - self.last_block >= std::mem::size_of::<crate::freelist::FreeNode>()
            && crate::block::header_kind(unsafe { *(self.last_block as *const usize) })
                == crate::block::KIND_FREE
        {
            // The previous last block is free and removable: merge it with
            // the newly added space.
            unsafe { self.remove_free_block(self.last_block as *mut u8) };
            self.last_block_end = base + new_bit_ind;
        } else {
            self.last_block = base + old_bit_ind;
            self.last_block_end = base + new_bit_ind;
        }
        unsafe {
            self.add_free_block(
                self.last_block as *mut u8,
                self.last_block_end - self.last_block,
                false,
            )
        };
    }

    /// Register a brand-new chunk and put its data area on the free lists.
    unsafe fn add_chunk(&mut self, shared: &HeapShared, new: *mut u8, size: usize) {
        let chunk = new as *mut ChunkHeader;
        unsafe {
            (*chunk).size = size;
            (*chunk).next = shared.chunks.load(Ordering::Acquire);
        }

        let bit_ind = bit_field_index(size);
        unsafe {
            std::ptr::write_bytes(new.add(bit_ind), 0, bit_field_size(size));
        }

        shared.chunks.store(chunk, Ordering::Release);

        self.last_block = new as usize + CHUNK_HEADER_SIZE;
        self.last_block_end = new as usize + bit_ind;
        unsafe {
            self.add_free_block(
                self.last_block as *mut u8,
                bit_ind - CHUNK_HEADER_SIZE,
                false,
            )
        };
    }

    /// Release every chunk back to the backend. Called on runtime teardown.
    pub(crate) fn release_regions(&mut self, shared: &HeapShared) {
        let mut chunk = shared.chunks.swap(std::ptr::null_mut(), Ordering::AcqRel);
        while !chunk.is_null() {
            let next = unsafe { (*chunk).next };
            let size = unsafe { (*chunk).size };
            self.backend.free_chunk(chunk as *mut u8, size);
            chunk = next;
        }
        self.lists = FreeLists::new();
        self.cur_free = std::ptr::null_mut();
        self.cur_free_size = 0;
        self.nursery.release(&mut *self.backend, shared);
    }

    /// Truncate an allocated block in place, releasing the tail. Both sizes
    /// are unrounded byte counts; the caller has already rewritten the
    /// header for the shorter contents.
    pub(crate) unsafe fn truncate_block(
        &mut self,
        shared: &HeapShared,
        block: *mut usize,
        old_size: usize,
        new_size: usize,
    ) {
        let old = round_block_size(old_size);
        let new = round_block_size(new_size);
        debug_assert!(new <= old);
        let tail = old - new;
        if tail == 0 {
            return;
        }
        let tail_ptr = (block as usize + new) as *mut u8;
        if shared.in_nursery(block as usize) {
            // Young blocks are never parsed linearly; a filler header keeps
            // the space well-formed for the debug verifier.
            unsafe { *(tail_ptr as *mut usize) = nonptr_header(tail - WORD, SUB_BYTES, true) };
        } else if tail >= crate::block::MIN_BLOCK_SIZE {
            unsafe { self.add_free_or_garbage(shared, tail_ptr, tail) };
        } else {
            unsafe { *(tail_ptr as *mut usize) = nonptr_header(tail - WORD, SUB_BYTES, false) };
        }
    }

    /// Total bytes sitting on the free lists plus the bias cursor. Used by
    /// tests and the heap verifier to reconcile against the chunk sizes.
    pub fn free_bytes(&self) -> usize {
        let mut total = self.cur_free_size;
        for i in 0..NUM_FREE_LISTS {
            let mut node = self.lists.head_next(i);
            while !self.lists.is_terminator(node) {
                let size = unsafe { (*node).size() };
                total += size;
                // Child chain holds same-size duplicates.
                let mut child = unsafe { (*node).child };
                while !child.is_null() {
                    total += size;
                    child = unsafe { (*child).child };
                }
                node = unsafe { (*node).next };
            }
        }
        total
    }
}

// =============================================================================
// Static allocations (outside the GC heap)
// =============================================================================

/// Header stored in front of a static allocation so `grow_static` and
/// `free_static` can recover the layout.
const STATIC_HEADER: usize = 16;

fn static_layout(size: usize) -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(size + STATIC_HEADER, 16).expect("static layout overflow")
}

/// Allocate memory invisible to the garbage collector. Values stored in it
/// are not scanned; it is intended for interpreter-side tables.
pub fn alloc_static(size: usize) -> Option<*mut u8> {
    let ptr = unsafe { std::alloc::alloc(static_layout(size)) };
    if ptr.is_null() {
        return None;
    }
    unsafe {
        *(ptr as *mut usize) = size;
        Some(ptr.add(STATIC_HEADER))
    }
}

/// Grow a static allocation, preserving contents.
///
/// # Safety
/// `ptr` must come from `alloc_static` and not have been freed.
pub unsafe fn grow_static(ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
    unsafe {
        let base = ptr.sub(STATIC_HEADER);
        let old_size = *(base as *const usize);
        let new = std::alloc::realloc(base, static_layout(old_size), new_size + STATIC_HEADER);
        if new.is_null() {
            return None;
        }
        *(new as *mut usize) = new_size;
        Some(new.add(STATIC_HEADER))
    }
}

/// Free a static allocation.
///
/// # Safety
/// `ptr` must come from `alloc_static`/`grow_static` and not have been
/// freed.
pub unsafe fn free_static(ptr: *mut u8) {
    unsafe {
        let base = ptr.sub(STATIC_HEADER);
        let size = *(base as *const usize);
        std::alloc::dealloc(base, static_layout(size));
    }
}
