//! Segregated Free Lists
//!
//! Old-generation allocation uses 64 free lists segmented by block size.
//! Sizes below 64 bytes get one list per allocation-unit class; above that
//! the segmentation coarsens in steps up to a final catch-all list:
//!
//! ```text
//! size <  64      size/8            uniform, one size per list
//! size <  512     size/32    + 6
//! size <  2048    size/128   + 18
//! size <  8192    size/1024  + 32
//! size <  32768   size/4096  + 38
//! size <  311296  size/16384 + 44
//! otherwise       63                catch-all
//! ```
//!
//! Within a nonuniform list, blocks are kept sorted by size and entries of
//! the same exact size hang off the first one's `child` chain, keeping
//! lookups O(1) amortized. Every list ends in a shared terminator node with
//! a maximal header so searches always stop; the last list ends in a
//! distinct heap terminator whose discovery means "no free block of any
//! suitable size anywhere".
//!
//! Blocks smaller than a `FreeNode` (16 and 24 bytes) cannot hold back
//! pointers and live in singly-linked lists; they are only ever taken from
//! the front and are purged wholesale before a sweep.

use crate::block::{
    KIND_FREE, MIN_BLOCK_SIZE, SIZE_SHIFT, SUB_BYTES, TERMINATOR_HEADER, WORD, free_header,
    header_kind, is_large_enough_free_block, nonptr_header, round_block_size,
};
use crate::heap::{Heap, HeapShared};

/// Number of free lists.
pub const NUM_FREE_LISTS: usize = 64;

/// Smallest block size stored in a list that may contain multiple sizes.
pub const SMALLEST_NONUNIFORM: usize = 64;

/// Free-list index for a rounded block size.
#[inline]
pub fn free_list_index(size: usize) -> usize {
    if size < 64 {
        size / 8
    } else if size < 512 {
        size / 32 + 6
    } else if size < 2048 {
        size / 128 + 18
    } else if size < 8192 {
        size / 1024 + 32
    } else if size < 32768 {
        size / 4096 + 38
    } else if size < 311296 {
        size / 16384 + 44
    } else {
        63
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// A free block on a free list. Blocks of at least this size carry all four
/// fields; 16- and 24-byte blocks only use `header` and `next`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FreeNode {
    pub header: usize,
    pub next: *mut FreeNode,
    pub child: *mut FreeNode,
    pub prev: *mut FreeNode,
}

impl FreeNode {
    const EMPTY: FreeNode = FreeNode {
        header: 0,
        next: std::ptr::null_mut(),
        child: std::ptr::null_mut(),
        prev: std::ptr::null_mut(),
    };

    const TERMINATOR: FreeNode = FreeNode {
        header: TERMINATOR_HEADER,
        next: std::ptr::null_mut(),
        child: std::ptr::null_mut(),
        prev: std::ptr::null_mut(),
    };

    /// Block size encoded in the header. The terminators report an
    /// effectively infinite size, which is what makes them stop searches.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.header >> SIZE_SHIFT
    }
}

/// The 64 list heads plus the two terminator sentinels. Heads are real
/// nodes, so unlinking the first element of a list needs no special case.
/// Boxed so the sentinel addresses stay stable.
pub struct FreeLists {
    heads: [FreeNode; NUM_FREE_LISTS],
    list_term: FreeNode,
    heap_term: FreeNode,
}

// Safety: only touched under the heap mutex.
unsafe impl Send for FreeLists {}

impl FreeLists {
    pub fn new() -> Box<FreeLists> {
        let mut lists = Box::new(FreeLists {
            heads: [FreeNode::EMPTY; NUM_FREE_LISTS],
            list_term: FreeNode::TERMINATOR,
            heap_term: FreeNode::TERMINATOR,
        });
        let list_term = &mut lists.list_term as *mut FreeNode;
        let heap_term = &mut lists.heap_term as *mut FreeNode;
        for i in 0..NUM_FREE_LISTS - 1 {
            lists.heads[i].next = list_term;
        }
        lists.heads[NUM_FREE_LISTS - 1].next = heap_term;
        lists
    }

    #[inline(always)]
    pub(crate) fn head(&mut self, idx: usize) -> *mut FreeNode {
        &mut self.heads[idx] as *mut FreeNode
    }

    #[inline(always)]
    pub(crate) fn head_next(&self, idx: usize) -> *mut FreeNode {
        self.heads[idx].next
    }

    #[inline(always)]
    pub(crate) fn set_head_next(&mut self, idx: usize, node: *mut FreeNode) {
        self.heads[idx].next = node;
    }

    #[inline(always)]
    pub(crate) fn list_term_ptr(&self) -> *mut FreeNode {
        &self.list_term as *const FreeNode as *mut FreeNode
    }

    #[inline(always)]
    pub(crate) fn heap_term_ptr(&self) -> *mut FreeNode {
        &self.heap_term as *const FreeNode as *mut FreeNode
    }

    #[inline(always)]
    pub(crate) fn is_terminator(&self, node: *const FreeNode) -> bool {
        node == self.list_term_ptr() || node == self.heap_term_ptr()
    }
}

// =============================================================================
// Heap free-list operations
// =============================================================================

impl Heap {
    /// Add a free block to the appropriate list. `size` covers the whole
    /// block including its header and must be a valid rounded block size.
    /// Nonuniform lists are kept sorted by header, with same-size blocks
    /// chained on the first one's `child` pointer.
    pub(crate) unsafe fn add_free_block(&mut self, block: *mut u8, size: usize, fill: bool) {
        debug_assert_eq!(round_block_size(size), size, "free block of invalid size");

        if cfg!(debug_assertions) && fill {
            // Poison freed space so use-after-free reads are conspicuous.
            unsafe { std::ptr::write_bytes(block, 0xdd, size) };
        }

        let node = block as *mut FreeNode;
        let header = free_header(size);
        unsafe { (*node).header = header };

        if size < SMALLEST_NONUNIFORM {
            let idx = size / crate::block::ALLOC_UNIT;
            if size < std::mem::size_of::<FreeNode>() {
                // Too small for back pointers: singly linked, front insert.
                unsafe {
                    (*node).next = self.lists.head_next(idx);
                }
                self.lists.set_head_next(idx, node);
            } else {
                let head = self.lists.head(idx);
                unsafe {
                    (*node).prev = head;
                    (*node).next = (*head).next;
                    (*(*node).next).prev = node;
                    (*head).next = node;
                }
            }
            return;
        }

        let idx = free_list_index(size);
        let mut cur = self.lists.head(idx);
        unsafe {
            while (*(*cur).next).header < header {
                cur = (*cur).next;
            }
            if (*(*cur).next).header == header {
                // Same exact size: chain on the child pointer.
                let parent = (*cur).next;
                (*node).next = std::ptr::null_mut();
                (*node).prev = parent;
                (*node).child = (*parent).child;
                if !(*node).child.is_null() {
                    (*(*node).child).prev = node;
                }
                (*parent).child = node;
            } else {
                (*node).child = std::ptr::null_mut();
                (*node).next = (*cur).next;
                (*node).prev = cur;
                (*(*node).next).prev = node;
                (*cur).next = node;
            }
        }
    }

    /// Unlink a free block found by address (sweep coalescing, heap
    /// extension). Must not be called for blocks below `FreeNode` size;
    /// those live in singly-linked lists and are purged via
    /// `remove_small_blocks` instead.
    pub(crate) unsafe fn remove_free_block(&mut self, ptr: *mut u8) {
        let node = ptr as *mut FreeNode;
        unsafe {
            debug_assert_eq!(header_kind((*node).header), KIND_FREE);
            debug_assert!((*node).size() >= std::mem::size_of::<FreeNode>());

            if !(*node).next.is_null() {
                if (*node).size() >= SMALLEST_NONUNIFORM && !(*node).child.is_null() {
                    // Promote the first same-size child into our place.
                    let c = (*node).child;
                    (*(*node).prev).next = c;
                    (*(*node).next).prev = c;
                    (*c).prev = (*node).prev;
                    (*c).next = (*node).next;
                } else {
                    (*(*node).prev).next = (*node).next;
                    (*(*node).next).prev = (*node).prev;
                }
            } else {
                // A child-chain entry.
                if !(*node).child.is_null() {
                    (*(*node).child).prev = (*node).prev;
                }
                (*(*node).prev).child = (*node).child;
            }
        }
    }

    /// Empty every singly-linked small free list, rewriting the blocks as
    /// raw non-pointer garbage. Run before a sweep: the sweep coalesces
    /// over free space and cannot unlink blocks that have no back pointers,
    /// but it happily reclaims unmarked garbage.
    pub(crate) unsafe fn remove_small_blocks(&mut self) {
        let first_backlinked = free_list_index(std::mem::size_of::<FreeNode>());
        for idx in 0..first_backlinked {
            loop {
                let node = self.lists.head_next(idx);
                if self.lists.is_terminator(node) {
                    break;
                }
                unsafe {
                    let size = (*node).size();
                    self.lists.set_head_next(idx, (*node).next);
                    *(node as *mut usize) = nonptr_header(size - WORD, SUB_BYTES, false);
                }
            }
        }
    }

    /// Allocate `size` (a rounded block size) from the bias cursor or the
    /// free lists. Returns None when no suitable free block exists; the
    /// caller then grows the heap or collects.
    pub(crate) unsafe fn try_alloc_from_lists(
        &mut self,
        shared: &HeapShared,
        size: usize,
    ) -> Option<*mut u8> {
        debug_assert_eq!(round_block_size(size), size);

        // Carve from the bias cursor while it is small; large cursors are
        // flushed so big free blocks are not nibbled into fragments.
        if is_large_enough_free_block(self.cur_free_size, size) && self.cur_free_size <= 512 {
            let result = self.cur_free;
            self.cur_free_size -= size;
            self.cur_free = unsafe { result.add(size) };
            return Some(result);
        }

        self.inactivate_cur_free(shared);

        let mut idx = free_list_index(size);
        let mut node = self.lists.head_next(idx);

        if node != self.lists.list_term_ptr() {
            // Walk this list for a block with enough room; the terminator's
            // maximal header ends the walk.
            unsafe {
                while !is_large_enough_free_block((*node).size(), size) {
                    node = (*node).next;
                }
            }
            if node == self.lists.list_term_ptr() {
                node = self.advance_lists(&mut idx, size);
            }
        } else {
            node = self.advance_lists(&mut idx, size);
        }

        if node == self.lists.heap_term_ptr() {
            return None;
        }

        unsafe {
            let block_size = (*node).size();
            self.cur_free_size = block_size - size;
            debug_assert!(
                self.cur_free_size == 0 || self.cur_free_size >= MIN_BLOCK_SIZE,
                "free-block split left an unparseable remainder"
            );

            let result: *mut FreeNode;
            if block_size >= SMALLEST_NONUNIFORM && !(*node).child.is_null() {
                // Take a same-size duplicate, leaving the sorted chain
                // untouched.
                let taken = (*node).child;
                (*node).child = (*taken).child;
                if !(*taken).child.is_null() {
                    (*(*taken).child).prev = node;
                }
                result = taken;
            } else {
                if block_size >= std::mem::size_of::<FreeNode>() {
                    (*(*node).prev).next = (*node).next;
                    (*(*node).next).prev = (*node).prev;
                } else {
                    // Singly-linked list: searches only ever match its
                    // first entry (the whole list is one size class).
                    self.lists.set_head_next(idx, (*node).next);
                }
                result = node;
            }

            self.cur_free = (result as *mut u8).add(size);
            Some(result as *mut u8)
        }
    }

    /// Find the next list with a usable first block. Only the first block
    /// of each list is consulted, so the smallest suitable block is not
    /// always found. Returns the heap terminator when nothing fits.
    fn advance_lists(&mut self, idx: &mut usize, size: usize) -> *mut FreeNode {
        loop {
            *idx += 1;
            if *idx >= NUM_FREE_LISTS {
                return self.lists.heap_term_ptr();
            }
            let node = self.lists.head_next(*idx);
            if node == self.lists.list_term_ptr() {
                continue;
            }
            if node == self.lists.heap_term_ptr() {
                return node;
            }
            if is_large_enough_free_block(unsafe { (*node).size() }, size) {
                return node;
            }
            if *idx == NUM_FREE_LISTS - 1 {
                // The catch-all's first block is too small; give up and let
                // the caller grow the heap.
                return self.lists.heap_term_ptr();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
