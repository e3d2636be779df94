//! Heap Region Acquisition
//!
//! The old generation is a linked list of chunks obtained from a pluggable
//! backend; the nursery is a single region grown in place when possible.
//! Backends must return memory inside the configured address sub-range
//! (`config::MEM_START .. MEM_END`) so the value tagging scheme stays valid;
//! out-of-range memory is released and the request fails.
//!
//! Three backends are provided:
//! - `MmapBackend` — anonymous mappings with in-place `mremap` (Linux).
//! - `ReserveBackend` — reserve-then-commit: a large `PROT_NONE` reservation
//!   committed with `mprotect` (other Unix).
//! - `SystemBackend` — portable, using the process allocator.
//!
//! Chunk layout:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬─────────────┐
//! │ ChunkHeader  │ block data ...               │ mark bitmap │
//! └──────────────┴──────────────────────────────┴─────────────┘
//! base           base+16                        base+bit_field_index(size)
//! ```

use crate::bitmap::bit_field_index;
use crate::block::{ALLOC_UNIT, round_block_size};
use crate::config::{MEM_END, MEM_START};

/// Hardware page size assumed by the mapping backends.
pub const PAGE_SIZE: usize = 4096;

/// Header at the base of every old-generation chunk.
#[repr(C)]
pub struct ChunkHeader {
    pub next: *mut ChunkHeader,
    /// Total chunk size in bytes, including this header and the bitmap.
    pub size: usize,
}

/// Rounded size of the chunk header.
pub const CHUNK_HEADER_SIZE: usize = round_block_size(std::mem::size_of::<ChunkHeader>());

impl ChunkHeader {
    /// First usable data address.
    #[inline(always)]
    pub fn data_start(&self) -> usize {
        self as *const ChunkHeader as usize + CHUNK_HEADER_SIZE
    }

    /// One past the last usable data address (the bitmap starts here).
    #[inline(always)]
    pub fn data_end(&self) -> usize {
        self as *const ChunkHeader as usize + bit_field_index(self.size)
    }

    /// One past the end of the whole chunk.
    #[inline(always)]
    pub fn end(&self) -> usize {
        self as *const ChunkHeader as usize + self.size
    }

    /// Pointer to the chunk's mark bitmap.
    #[inline(always)]
    pub fn bitmap(&self) -> *mut usize {
        self.data_end() as *mut usize
    }

    /// Base address used for bitmap indexing.
    #[inline(always)]
    pub fn base(&self) -> usize {
        self as *const ChunkHeader as usize
    }

    /// Does `addr` fall inside this chunk's data area?
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.data_end()
    }
}

#[inline]
fn is_valid_range(ptr: usize, size: usize) -> bool {
    ptr >= MEM_START && ptr.checked_add(size).is_some_and(|end| end <= MEM_END)
}

#[inline]
const fn page_round(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// =============================================================================
// Backend trait
// =============================================================================

/// OS interface for heap-region growth. All methods may fail by returning
/// `None`; the caller treats that as heap exhaustion.
pub trait RegionBackend: Send {
    /// Allocate at least `grow_size` bytes of new chunk space. When `prev`
    /// is non-null, try to place the chunk immediately after it so the
    /// caller can extend `prev` in place by concatenation. Returns the chunk
    /// base and the actual size obtained.
    fn grow_heap(&mut self, prev: *mut ChunkHeader, grow_size: usize) -> Option<(*mut u8, usize)>;

    /// Release a chunk.
    fn free_chunk(&mut self, chunk: *mut u8, size: usize);

    /// Grow (preferably in place) or initially map the nursery. `old` is
    /// null on the first call.
    fn grow_nursery(&mut self, old: *mut u8, old_size: usize, new_size: usize) -> Option<*mut u8>;

    /// Release the nursery.
    fn free_nursery(&mut self, nursery: *mut u8, size: usize);

    /// Whether growing is costly enough that the heap should grow in large
    /// fractions rather than small absolute increments.
    fn prefers_large_grow(&self) -> bool {
        false
    }
}

/// Pick the best backend for the current platform.
pub fn default_backend(
    preferred_old: Option<usize>,
    preferred_nursery: Option<usize>,
    max_nursery: usize,
) -> Box<dyn RegionBackend> {
    #[cfg(target_os = "linux")]
    {
        let _ = max_nursery;
        Box::new(MmapBackend::new(preferred_old, preferred_nursery))
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Box::new(ReserveBackend::new(preferred_old, preferred_nursery, max_nursery))
    }
    #[cfg(not(unix))]
    {
        let _ = (preferred_old, preferred_nursery, max_nursery);
        Box::new(SystemBackend::new())
    }
}

// =============================================================================
// mmap / mremap backend (Linux)
// =============================================================================

#[cfg(target_os = "linux")]
pub struct MmapBackend {
    preferred_old: Option<usize>,
    preferred_nursery: Option<usize>,
}

#[cfg(target_os = "linux")]
impl MmapBackend {
    pub fn new(preferred_old: Option<usize>, preferred_nursery: Option<usize>) -> Self {
        MmapBackend {
            preferred_old,
            preferred_nursery,
        }
    }

    unsafe fn map_at(&self, hint: usize, size: usize) -> Option<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        if !is_valid_range(ptr as usize, size) {
            unsafe { libc::munmap(ptr, size) };
            return None;
        }
        Some(ptr as *mut u8)
    }
}

#[cfg(target_os = "linux")]
impl RegionBackend for MmapBackend {
    fn grow_heap(&mut self, prev: *mut ChunkHeader, grow_size: usize) -> Option<(*mut u8, usize)> {
        let size = page_round(grow_size);
        let hint = if prev.is_null() {
            self.preferred_old.unwrap_or(0)
        } else {
            unsafe { (*prev).end() }
        };
        let ptr = unsafe { self.map_at(hint, size) }?;
        Some((ptr, size))
    }

    fn free_chunk(&mut self, chunk: *mut u8, size: usize) {
        unsafe { libc::munmap(chunk as *mut libc::c_void, size) };
    }

    fn grow_nursery(&mut self, old: *mut u8, old_size: usize, new_size: usize) -> Option<*mut u8> {
        if old.is_null() {
            return unsafe { self.map_at(self.preferred_nursery.unwrap_or(0), new_size) };
        }
        let ptr = unsafe {
            libc::mremap(
                old as *mut libc::c_void,
                old_size,
                new_size,
                libc::MREMAP_MAYMOVE,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        if !is_valid_range(ptr as usize, new_size) {
            unsafe { libc::munmap(ptr, new_size) };
            return None;
        }
        Some(ptr as *mut u8)
    }

    fn free_nursery(&mut self, nursery: *mut u8, size: usize) {
        unsafe { libc::munmap(nursery as *mut libc::c_void, size) };
    }
}

// =============================================================================
// Reserve-then-commit backend (other Unix)
// =============================================================================

#[cfg(unix)]
pub struct ReserveBackend {
    preferred_old: Option<usize>,
    reserve_start: usize,
    reserve_next: usize,
    reserve_end: usize,
    preferred_nursery: Option<usize>,
    nursery_reserve: usize,
    max_nursery: usize,
}

#[cfg(unix)]
impl ReserveBackend {
    /// Reserve address space in chunks of at least this size.
    const MINIMUM_RESERVE: usize = 128 * 1024 * 1024;

    pub fn new(
        preferred_old: Option<usize>,
        preferred_nursery: Option<usize>,
        max_nursery: usize,
    ) -> Self {
        ReserveBackend {
            preferred_old,
            reserve_start: 0,
            reserve_next: 0,
            reserve_end: 0,
            preferred_nursery,
            nursery_reserve: 0,
            max_nursery: page_round(max_nursery),
        }
    }

    unsafe fn reserve(&mut self, hint: usize, size: usize) -> Option<usize> {
        let size = size.max(Self::MINIMUM_RESERVE);
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        if !is_valid_range(ptr as usize, size) {
            unsafe { libc::munmap(ptr, size) };
            return None;
        }
        self.reserve_start = ptr as usize;
        self.reserve_next = ptr as usize;
        self.reserve_end = ptr as usize + size;
        Some(ptr as usize)
    }

    unsafe fn commit(start: usize, size: usize) -> bool {
        unsafe {
            libc::mprotect(
                start as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        }
    }
}

#[cfg(unix)]
impl RegionBackend for ReserveBackend {
    fn grow_heap(&mut self, prev: *mut ChunkHeader, grow_size: usize) -> Option<(*mut u8, usize)> {
        let size = page_round(grow_size);

        // Preferred placement right after the previous chunk only works when
        // the reservation cursor is still there.
        let want = if prev.is_null() {
            self.preferred_old.unwrap_or(0)
        } else {
            unsafe { (*prev).end() }
        };

        if self.reserve_next + size > self.reserve_end {
            let hint = if self.reserve_start == 0 { want } else { 0 };
            unsafe { self.reserve(hint, size) }?;
        }
        let start = self.reserve_next;
        if !unsafe { Self::commit(start, size) } {
            return None;
        }
        self.reserve_next += size;
        Some((start as *mut u8, size))
    }

    fn free_chunk(&mut self, chunk: *mut u8, size: usize) {
        // Decommit; the reservation itself stays.
        unsafe {
            libc::mprotect(chunk as *mut libc::c_void, size, libc::PROT_NONE);
        }
    }

    fn grow_nursery(&mut self, old: *mut u8, old_size: usize, new_size: usize) -> Option<*mut u8> {
        let new_size = page_round(new_size);
        if old.is_null() {
            // Reserve the whole nursery cap up front; commit the first part.
            let ptr = unsafe {
                libc::mmap(
                    self.preferred_nursery.unwrap_or(0) as *mut libc::c_void,
                    self.max_nursery,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return None;
            }
            if !is_valid_range(ptr as usize, self.max_nursery) {
                unsafe { libc::munmap(ptr, self.max_nursery) };
                return None;
            }
            self.nursery_reserve = ptr as usize;
            if !unsafe { Self::commit(ptr as usize, new_size) } {
                return None;
            }
            return Some(ptr as *mut u8);
        }
        if new_size > self.max_nursery {
            return None;
        }
        if !unsafe { Self::commit(old as usize + old_size, new_size - old_size) } {
            return None;
        }
        Some(old)
    }

    fn free_nursery(&mut self, nursery: *mut u8, _size: usize) {
        unsafe { libc::munmap(nursery as *mut libc::c_void, self.max_nursery) };
    }
}

// =============================================================================
// Portable backend
// =============================================================================

pub struct SystemBackend;

impl SystemBackend {
    /// Extra space is requested in multiples of this.
    const MIN_HEAP_INCREMENT: usize = 4096;

    pub fn new() -> Self {
        SystemBackend
    }

    fn layout(size: usize) -> std::alloc::Layout {
        // Block addresses only need allocation-unit alignment.
        std::alloc::Layout::from_size_align(size, ALLOC_UNIT).expect("chunk layout overflow")
    }
}

impl Default for SystemBackend {
    fn default() -> Self {
        SystemBackend::new()
    }
}

impl RegionBackend for SystemBackend {
    fn grow_heap(&mut self, _prev: *mut ChunkHeader, grow_size: usize) -> Option<(*mut u8, usize)> {
        let size = (grow_size + Self::MIN_HEAP_INCREMENT - 1) & !(Self::MIN_HEAP_INCREMENT - 1);
        let ptr = unsafe { std::alloc::alloc(Self::layout(size)) };
        if ptr.is_null() {
            return None;
        }
        if !is_valid_range(ptr as usize, size) {
            unsafe { std::alloc::dealloc(ptr, Self::layout(size)) };
            return None;
        }
        Some((ptr, size))
    }

    fn free_chunk(&mut self, chunk: *mut u8, size: usize) {
        unsafe { std::alloc::dealloc(chunk, Self::layout(size)) };
    }

    fn grow_nursery(&mut self, old: *mut u8, old_size: usize, new_size: usize) -> Option<*mut u8> {
        if old.is_null() {
            let ptr = unsafe { std::alloc::alloc(Self::layout(new_size)) };
            if ptr.is_null() {
                return None;
            }
            if !is_valid_range(ptr as usize, new_size) {
                unsafe { std::alloc::dealloc(ptr, Self::layout(new_size)) };
                return None;
            }
            return Some(ptr);
        }
        let ptr = unsafe { std::alloc::realloc(old, Self::layout(old_size), new_size) };
        if ptr.is_null() {
            return None;
        }
        if !is_valid_range(ptr as usize, new_size) {
            // The old region was already freed by realloc; give the caller
            // nothing rather than an unusable address.
            unsafe { std::alloc::dealloc(ptr, Self::layout(new_size)) };
            return None;
        }
        Some(ptr)
    }

    fn free_nursery(&mut self, nursery: *mut u8, size: usize) {
        unsafe { std::alloc::dealloc(nursery, Self::layout(size)) };
    }

    fn prefers_large_grow(&self) -> bool {
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
