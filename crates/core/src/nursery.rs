//! Nursery
//!
//! The young generation: one contiguous region carved into per-thread slabs
//! for lock-free bump allocation, plus a mark bitmap sized for the whole
//! region. During young collection the bitmap doubles as the forwarding
//! table for float cells (a set bit means "this cell now holds the address
//! of its copy").
//!
//! Blocks of `MIN_BIG_BLOCK_SIZE` bytes or more never come from the
//! nursery. They are allocated in old-generation space immediately, wrapped
//! in a `BigNode` and linked onto a per-nursery list; the young collector
//! retires a surviving big block by unlinking it and freeing the wrapper,
//! without copying the payload.
//!
//! ```text
//! BigNode:  ┌────────────┬──────────────┬────────┬─────────────────┐
//!           │ header     │ payload size │ next   │ payload block...│
//!           └────────────┴──────────────┴────────┴─────────────────┘
//!           span in header covers wrapper + payload
//! ```

use crate::bitmap::words_for;
use crate::block::{WORD, bignode_header, header_size, round_block_size};
use crate::config::INITIAL_NURSERY_SIZE;
use crate::heap::HeapShared;
use crate::regions::RegionBackend;
use std::sync::atomic::Ordering;

/// Size of the big-block wrapper node.
pub const BIG_NODE_SIZE: usize = 3 * WORD;

pub struct Nursery {
    pub(crate) base: usize,
    pub(crate) size: usize,
    /// Carve cursor for handing out thread slabs.
    pub(crate) next: usize,
    /// One bit per allocation unit over the whole region.
    pub(crate) bitmap: Vec<usize>,
    /// Address of the first big-block wrapper, or 0.
    pub(crate) big_head: usize,
    /// Total bytes of live big-block payloads.
    pub(crate) big_total: usize,
    /// Largest single big-block payload since the last young collection.
    pub(crate) largest_big: usize,
}

impl Nursery {
    /// Map the initial nursery region and publish its bounds.
    pub(crate) fn new(backend: &mut dyn RegionBackend, shared: &HeapShared) -> Option<Nursery> {
        let size = INITIAL_NURSERY_SIZE;
        let ptr = backend.grow_nursery(std::ptr::null_mut(), 0, size)?;
        shared.nursery_base.store(ptr as usize, Ordering::Relaxed);
        shared.nursery_end.store(ptr as usize + size, Ordering::Relaxed);
        Some(Nursery {
            base: ptr as usize,
            size,
            next: ptr as usize,
            bitmap: vec![0; words_for(size)],
            big_head: 0,
            big_total: 0,
            largest_big: 0,
        })
    }

    #[inline(always)]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Unused bytes left in the region.
    #[inline(always)]
    pub(crate) fn remaining(&self) -> usize {
        self.base + self.size - self.next
    }

    /// Carve a slab of `bytes` from the region.
    pub(crate) fn carve(&mut self, bytes: usize) -> Option<*mut u8> {
        if self.remaining() < bytes {
            return None;
        }
        let ptr = self.next as *mut u8;
        self.next += bytes;
        Some(ptr)
    }

    /// Reset after a young collection: everything live has been copied or
    /// retired, so the region restarts empty.
    pub(crate) fn reset(&mut self) {
        self.next = self.base;
        self.bitmap.fill(0);
        self.largest_big = 0;
    }

    /// Grow the region. Only valid while the nursery is empty (right after
    /// `reset`), because the backend may move it.
    pub(crate) fn grow(
        &mut self,
        backend: &mut dyn RegionBackend,
        shared: &HeapShared,
        new_size: usize,
    ) -> bool {
        debug_assert_eq!(self.next, self.base, "nursery grown while occupied");
        let Some(ptr) = backend.grow_nursery(self.base as *mut u8, self.size, new_size) else {
            return false;
        };
        self.base = ptr as usize;
        self.size = new_size;
        self.next = self.base;
        self.bitmap = vec![0; words_for(new_size)];
        shared.nursery_base.store(self.base, Ordering::Relaxed);
        shared.nursery_end.store(self.base + new_size, Ordering::Relaxed);
        true
    }

    #[inline(always)]
    pub(crate) fn bitmap_ptr(&mut self) -> *mut usize {
        self.bitmap.as_mut_ptr()
    }

    /// Link a freshly allocated big-block wrapper onto the list.
    ///
    /// # Safety
    /// `node` must point at `BIG_NODE_SIZE + payload_size` bytes of
    /// old-generation space owned by the caller.
    pub(crate) unsafe fn link_big_block(&mut self, node: *mut u8, payload_size: usize) {
        debug_assert_eq!(round_block_size(payload_size), payload_size);
        unsafe {
            let words = node as *mut usize;
            *words = bignode_header(BIG_NODE_SIZE + payload_size);
            *words.add(1) = payload_size;
            *words.add(2) = self.big_head;
        }
        self.big_head = node as usize;
        self.big_total += payload_size;
        self.largest_big = self.largest_big.max(payload_size);
    }

    /// Release the region on teardown.
    pub(crate) fn release(&mut self, backend: &mut dyn RegionBackend, shared: &HeapShared) {
        if self.base != 0 {
            backend.free_nursery(self.base as *mut u8, self.size);
            self.base = 0;
            self.size = 0;
            self.next = 0;
            shared.nursery_base.store(0, Ordering::Relaxed);
            shared.nursery_end.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Big-node accessors
// =============================================================================

/// Payload block header address of a big-block wrapper.
#[inline(always)]
pub(crate) fn big_node_payload(node: usize) -> *mut usize {
    (node + BIG_NODE_SIZE) as *mut usize
}

/// Wrapper address for a payload known to be a big block.
#[inline(always)]
pub(crate) fn big_node_of_payload(payload: usize) -> usize {
    payload - BIG_NODE_SIZE
}

/// Payload size stored in the wrapper.
///
/// # Safety
/// `node` must point at a valid big-block wrapper.
#[inline(always)]
pub(crate) unsafe fn big_node_payload_size(node: usize) -> usize {
    unsafe { *(node as *const usize).add(1) }
}

/// Next wrapper on the list (0 at the end).
///
/// # Safety
/// `node` must point at a valid big-block wrapper.
#[inline(always)]
pub(crate) unsafe fn big_node_next(node: usize) -> usize {
    unsafe { *(node as *const usize).add(2) }
}

/// Total span of a wrapper plus its payload, from the wrapper header.
///
/// # Safety
/// `node` must point at a valid big-block wrapper.
#[inline(always)]
pub(crate) unsafe fn big_node_span(node: usize) -> usize {
    unsafe { header_size(*(node as *const usize)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{KIND_BIGNODE, header_kind, is_young_header};
    use crate::regions::SystemBackend;

    #[test]
    fn test_nursery_carve_and_reset() {
        let shared = HeapShared::new();
        let mut backend = SystemBackend::new();
        let mut n = Nursery::new(&mut backend, &shared).unwrap();

        assert_eq!(n.remaining(), INITIAL_NURSERY_SIZE);
        let a = n.carve(2048).unwrap();
        let b = n.carve(2048).unwrap();
        assert_eq!(a as usize + 2048, b as usize);
        assert!(n.contains(a as usize));
        assert!(shared.in_nursery(b as usize));
        assert_eq!(n.remaining(), INITIAL_NURSERY_SIZE - 4096);

        // Exhaustion.
        assert!(n.carve(INITIAL_NURSERY_SIZE).is_none());

        n.reset();
        assert_eq!(n.remaining(), INITIAL_NURSERY_SIZE);
        let c = n.carve(16).unwrap();
        assert_eq!(c as usize, n.base);

        n.release(&mut backend, &shared);
    }

    #[test]
    fn test_nursery_grow() {
        let shared = HeapShared::new();
        let mut backend = SystemBackend::new();
        let mut n = Nursery::new(&mut backend, &shared).unwrap();
        assert!(n.grow(&mut backend, &shared, 128 * 1024));
        assert_eq!(n.size, 128 * 1024);
        assert_eq!(n.remaining(), 128 * 1024);
        assert!(shared.in_nursery(n.base));
        assert!(!shared.in_nursery(n.base + 128 * 1024));
        n.release(&mut backend, &shared);
    }

    #[test]
    fn test_big_block_list() {
        let shared = HeapShared::new();
        let mut backend = SystemBackend::new();
        let mut n = Nursery::new(&mut backend, &shared).unwrap();

        let mut space_a = vec![0usize; (BIG_NODE_SIZE + 2048) / WORD];
        let mut space_b = vec![0usize; (BIG_NODE_SIZE + 4096) / WORD];
        unsafe {
            n.link_big_block(space_a.as_mut_ptr() as *mut u8, 2048);
            n.link_big_block(space_b.as_mut_ptr() as *mut u8, 4096);

            assert_eq!(n.big_head, space_b.as_ptr() as usize);
            assert_eq!(n.big_total, 2048 + 4096);
            assert_eq!(n.largest_big, 4096);

            let node = n.big_head;
            assert_eq!(header_kind(*(node as *const usize)), KIND_BIGNODE);
            assert!(is_young_header(*(node as *const usize)));
            assert_eq!(big_node_payload_size(node), 4096);
            assert_eq!(big_node_span(node), BIG_NODE_SIZE + 4096);
            assert_eq!(big_node_next(node), space_a.as_ptr() as usize);
            assert_eq!(big_node_next(big_node_next(node)), 0);
            assert_eq!(
                big_node_payload(node) as usize,
                node + BIG_NODE_SIZE
            );
            assert_eq!(big_node_of_payload(node + BIG_NODE_SIZE), node);
        }
        n.release(&mut backend, &shared);
    }
}
