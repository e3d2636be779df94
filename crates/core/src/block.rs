//! Block Headers and Kinds
//!
//! Every heap block begins with a header word whose low bits encode the block
//! kind. Live references always point at the header word, never into the
//! interior of a block.
//!
//! ## Header Layout
//!
//! ```text
//! bits 0..=2   block kind
//! bit  3       young-generation flag (set while the block belongs to the
//!              new generation; cleared on retirement)
//! bits 4..     kind-specific payload:
//!   Value / NonPtr    bits 4..=5 sub-kind, bits 6.. data length in bytes
//!   Instance          type descriptor address (16-byte aligned)
//!   Mixed / Free /
//!   FloatBucket /
//!   BigNode           total block size in bytes, shifted left 4
//!   Indirect          forwarded address, shifted right 3 then left 4
//! ```
//!
//! Free-block headers are ordered by size under plain integer comparison,
//! which the free-list insertion sort relies on; the list terminator
//! sentinels use an all-ones header that compares greater than any real
//! block.

use crate::error::RtError;
use crate::value::Value;

/// Machine word size in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Allocation unit: all block sizes are multiples of this.
pub const ALLOC_UNIT: usize = 8;

/// Minimum total block size. A block must be able to hold a free-list
/// header word plus one link word.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Smallest block size that is never allocated from a thread's nursery slab;
/// such blocks are wrapped in a big-block node instead.
pub const MIN_BIG_BLOCK_SIZE: usize = 1024;

// =============================================================================
// Kinds
// =============================================================================

pub const KIND_MASK: usize = 0b111;
pub const YOUNG_FLAG: usize = 0b1000;

pub const KIND_VALUE: usize = 0;
pub const KIND_NONPTR: usize = 1;
pub const KIND_INSTANCE: usize = 2;
pub const KIND_MIXED: usize = 3;
pub const KIND_FREE: usize = 4;
pub const KIND_INDIRECT: usize = 5;
pub const KIND_FLOATS: usize = 6;
pub const KIND_BIGNODE: usize = 7;

/// Sub-kind shift/mask for value and non-pointer blocks.
pub const SUB_SHIFT: u32 = 4;
pub const SUB_MASK: usize = 0b11 << SUB_SHIFT;

/// Data length shift for value and non-pointer blocks.
pub const LEN_SHIFT: u32 = 6;

/// Size shift for mixed, free, float-bucket and big-node blocks.
pub const SIZE_SHIFT: u32 = 4;

// Non-pointer sub-kinds.
pub const SUB_BYTES: usize = 0;
pub const SUB_NARROW_STR: usize = 1;
pub const SUB_WIDE_STR: usize = 2;
pub const SUB_LONG_INT: usize = 3;

// Value-block sub-kinds.
pub const SUB_ARRAY: usize = 0;
pub const SUB_SUBSTR: usize = 1;

/// Header of a free-list terminator sentinel: compares greater than any
/// real free-block header.
pub const TERMINATOR_HEADER: usize = usize::MAX;

// =============================================================================
// Size rounding
// =============================================================================

/// Round a byte request up to a valid block size.
#[inline(always)]
pub const fn round_block_size(size: usize) -> usize {
    let rounded = (size + ALLOC_UNIT - 1) & !(ALLOC_UNIT - 1);
    if rounded < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        rounded
    }
}

/// Determine if a free block can hold an allocation of `request` bytes.
/// A free block only slightly larger than the request cannot be used: the
/// remainder would be below the minimum block size and unparseable.
#[inline(always)]
pub fn is_large_enough_free_block(free_size: usize, request: usize) -> bool {
    free_size == request || free_size >= request + MIN_BLOCK_SIZE
}

// =============================================================================
// Header construction
// =============================================================================

#[inline(always)]
pub fn value_header(data_len: usize, sub: usize, young: bool) -> usize {
    debug_assert!(sub <= 0b11 && data_len % WORD == 0);
    data_len << LEN_SHIFT | sub << SUB_SHIFT | young_bit(young) | KIND_VALUE
}

#[inline(always)]
pub fn nonptr_header(data_len: usize, sub: usize, young: bool) -> usize {
    debug_assert!(sub <= 0b11);
    data_len << LEN_SHIFT | sub << SUB_SHIFT | young_bit(young) | KIND_NONPTR
}

#[inline(always)]
pub fn instance_header(desc: *const TypeDesc, young: bool) -> usize {
    debug_assert_eq!(desc as usize & 0b1111, 0, "TypeDesc must be 16-aligned");
    desc as usize | young_bit(young) | KIND_INSTANCE
}

#[inline(always)]
pub fn mixed_header(total_size: usize, young: bool) -> usize {
    total_size << SIZE_SHIFT | young_bit(young) | KIND_MIXED
}

#[inline(always)]
pub fn free_header(total_size: usize) -> usize {
    total_size << SIZE_SHIFT | KIND_FREE
}

#[inline(always)]
pub fn indirect_header(new_addr: usize) -> usize {
    debug_assert_eq!(new_addr & (ALLOC_UNIT - 1), 0);
    (new_addr >> 3) << SIZE_SHIFT | KIND_INDIRECT
}

#[inline(always)]
pub fn floats_header(total_size: usize, young: bool) -> usize {
    total_size << SIZE_SHIFT | young_bit(young) | KIND_FLOATS
}

#[inline(always)]
pub fn bignode_header(span: usize) -> usize {
    span << SIZE_SHIFT | YOUNG_FLAG | KIND_BIGNODE
}

#[inline(always)]
fn young_bit(young: bool) -> usize {
    if young { YOUNG_FLAG } else { 0 }
}

// =============================================================================
// Header inspection
// =============================================================================

#[inline(always)]
pub fn header_kind(header: usize) -> usize {
    header & KIND_MASK
}

#[inline(always)]
pub fn is_young_header(header: usize) -> bool {
    header & YOUNG_FLAG != 0
}

#[inline(always)]
pub fn header_sub(header: usize) -> usize {
    (header & SUB_MASK) >> SUB_SHIFT
}

/// Data byte length of a value or non-pointer block.
#[inline(always)]
pub fn header_data_len(header: usize) -> usize {
    debug_assert!(matches!(header_kind(header), KIND_VALUE | KIND_NONPTR));
    header >> LEN_SHIFT
}

/// Total size of a mixed, free, float-bucket or big-node block.
#[inline(always)]
pub fn header_size(header: usize) -> usize {
    header >> SIZE_SHIFT
}

/// Forwarded address stored in an indirect header.
#[inline(always)]
pub fn indirect_target(header: usize) -> usize {
    debug_assert_eq!(header_kind(header), KIND_INDIRECT);
    (header >> SIZE_SHIFT) << 3
}

/// Type descriptor of an instance header.
#[inline(always)]
pub fn header_type_desc(header: usize) -> *const TypeDesc {
    debug_assert_eq!(header_kind(header), KIND_INSTANCE);
    (header & !(KIND_MASK | YOUNG_FLAG)) as *const TypeDesc
}

/// Total byte size of the block whose header word is at `ptr`, including the
/// header itself. Not meaningful for indirect headers: a forwarded nursery
/// block has no size any more.
///
/// # Safety
/// `ptr` must point at a valid block header; for instance blocks the type
/// descriptor must still be live.
#[inline]
pub unsafe fn block_total_size(ptr: *const usize) -> usize {
    let header = unsafe { *ptr };
    match header_kind(header) {
        KIND_VALUE | KIND_NONPTR => round_block_size(WORD + header_data_len(header)),
        KIND_INSTANCE => {
            let desc = header_type_desc(header);
            round_block_size(WORD + unsafe { (*desc).slots } * WORD)
        }
        KIND_MIXED | KIND_FREE | KIND_FLOATS | KIND_BIGNODE => header_size(header),
        _ => unreachable!("block_total_size on indirect header"),
    }
}

/// Clear the young flag of the header at `ptr` (retirement).
///
/// # Safety
/// `ptr` must point at a valid block header.
#[inline(always)]
pub unsafe fn clear_young(ptr: *mut usize) {
    unsafe { *ptr &= !YOUNG_FLAG }
}

// =============================================================================
// Value-level kind predicates
// =============================================================================

/// Is this value a reference to a class instance?
#[inline]
pub fn is_instance(v: Value) -> bool {
    v.is_ref() && header_kind(unsafe { *v.as_ptr() }) == KIND_INSTANCE
}

/// Is this value a reference to a mixed (value prefix + raw bytes) block?
#[inline]
pub fn is_mixed_value(v: Value) -> bool {
    v.is_ref() && header_kind(unsafe { *v.as_ptr() }) == KIND_MIXED
}

// =============================================================================
// Block data access
// =============================================================================

/// Pointer to the first value slot of a value, sub-string or instance block.
///
/// # Safety
/// `ptr` must point at the header of such a block.
#[inline(always)]
pub unsafe fn value_slots(ptr: *mut usize) -> *mut Value {
    unsafe { ptr.add(1) as *mut Value }
}

/// Pointer to the raw data of a non-pointer block.
///
/// # Safety
/// `ptr` must point at a non-pointer block header.
#[inline(always)]
pub unsafe fn nonptr_data(ptr: *mut usize) -> *mut u8 {
    unsafe { ptr.add(1) as *mut u8 }
}

/// Number of value slots in the prefix of a mixed block (the second header
/// word stores the prefix byte count).
///
/// # Safety
/// `ptr` must point at a mixed block header.
#[inline(always)]
pub unsafe fn mixed_prefix_len(ptr: *const usize) -> usize {
    unsafe { *ptr.add(1) / WORD }
}

// =============================================================================
// Type descriptors
// =============================================================================

/// Finalizer hook invoked by the runtime's pending-finalizer drain.
pub type FinalizerFn = fn(&mut crate::thread::Thread, Value);

/// Conversion hook (`_str` contract) invoked by the generic string
/// conversion.
pub type StrHookFn = fn(&mut crate::thread::Thread, Value) -> Result<Value, RtError>;

/// Format hook (`_format` contract): receives the object and the spec
/// string between `:` and `}`.
pub type FormatHookFn = fn(&mut crate::thread::Thread, Value, Value) -> Result<Value, RtError>;

/// A class descriptor. Instances carry a pointer to their descriptor in the
/// header word; the 16-byte alignment leaves the low four header bits free
/// for the kind and young flag.
///
/// Descriptors are not garbage collected. They are created by the embedder
/// (normally the compiler's module loader) with `'static` lifetime.
#[repr(C, align(16))]
pub struct TypeDesc {
    /// Fully qualified class name.
    pub name: &'static str,
    /// Number of value slots in an instance.
    pub slots: usize,
    /// Slot index used to link finalizable instances onto the per-generation
    /// finalizer lists. Only meaningful when `finalizer` is set.
    pub finalize_slot: usize,
    /// Finalizer, if the class declares one.
    pub finalizer: Option<FinalizerFn>,
    /// `_str` hook for the generic to-string contract.
    pub str_hook: Option<StrHookFn>,
    /// `_format` hook for the format mini-language.
    pub format_hook: Option<FormatHookFn>,
}

impl TypeDesc {
    /// A plain class with `slots` value slots and no hooks.
    pub const fn plain(name: &'static str, slots: usize) -> TypeDesc {
        TypeDesc {
            name,
            slots,
            finalize_slot: 0,
            finalizer: None,
            str_hook: None,
            format_hook: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_block_size() {
        assert_eq!(round_block_size(0), MIN_BLOCK_SIZE);
        assert_eq!(round_block_size(1), MIN_BLOCK_SIZE);
        assert_eq!(round_block_size(16), 16);
        assert_eq!(round_block_size(17), 24);
        assert_eq!(round_block_size(24), 24);
        assert_eq!(round_block_size(1000), 1000);
        assert_eq!(round_block_size(1001), 1008);
    }

    #[test]
    fn test_large_enough_fenceposts() {
        // Exactly equal is usable.
        assert!(is_large_enough_free_block(64, 64));
        // Larger by less than a minimum block is not.
        assert!(!is_large_enough_free_block(64 + MIN_BLOCK_SIZE - 8, 64));
        assert!(!is_large_enough_free_block(64 + 8, 64));
        // Larger by at least a minimum block is.
        assert!(is_large_enough_free_block(64 + MIN_BLOCK_SIZE, 64));
        assert!(is_large_enough_free_block(1 << 20, 64));
        // Smaller never is.
        assert!(!is_large_enough_free_block(56, 64));
    }

    #[test]
    fn test_value_header_roundtrip() {
        let h = value_header(24, SUB_SUBSTR, true);
        assert_eq!(header_kind(h), KIND_VALUE);
        assert_eq!(header_sub(h), SUB_SUBSTR);
        assert_eq!(header_data_len(h), 24);
        assert!(is_young_header(h));

        let h = value_header(24, SUB_SUBSTR, false);
        assert!(!is_young_header(h));
    }

    #[test]
    fn test_nonptr_header_roundtrip() {
        let h = nonptr_header(13, SUB_NARROW_STR, false);
        assert_eq!(header_kind(h), KIND_NONPTR);
        assert_eq!(header_sub(h), SUB_NARROW_STR);
        assert_eq!(header_data_len(h), 13);
    }

    #[test]
    fn test_free_header_ordering() {
        // The insertion sort compares raw headers; they must be monotone in
        // block size and below the terminator sentinel.
        let small = free_header(16);
        let big = free_header(4096);
        assert!(small < big);
        assert!(big < TERMINATOR_HEADER);
        assert_eq!(header_size(small), 16);
        assert_eq!(header_kind(small), KIND_FREE);
    }

    #[test]
    fn test_indirect_header() {
        let addr = 0x7f12_3456_7890usize & !0b111;
        let h = indirect_header(addr);
        assert_eq!(header_kind(h), KIND_INDIRECT);
        assert_eq!(indirect_target(h), addr);
    }

    #[test]
    fn test_instance_header() {
        static DESC: TypeDesc = TypeDesc::plain("std::Object", 2);
        let h = instance_header(&DESC, true);
        assert_eq!(header_kind(h), KIND_INSTANCE);
        assert!(is_young_header(h));
        assert_eq!(header_type_desc(h), &DESC as *const TypeDesc);
    }

    #[test]
    fn test_block_total_size() {
        let mut block = [0usize; 8];
        block[0] = value_header(3 * WORD, SUB_ARRAY, false);
        assert_eq!(unsafe { block_total_size(block.as_ptr()) }, 32);

        block[0] = nonptr_header(5, SUB_NARROW_STR, false);
        assert_eq!(unsafe { block_total_size(block.as_ptr()) }, 16);

        block[0] = mixed_header(64, false);
        assert_eq!(unsafe { block_total_size(block.as_ptr()) }, 64);

        block[0] = free_header(48);
        assert_eq!(unsafe { block_total_size(block.as_ptr()) }, 48);
    }

    #[test]
    fn test_clear_young() {
        let mut block = [0usize; 2];
        block[0] = nonptr_header(4, SUB_BYTES, true);
        assert!(is_young_header(block[0]));
        unsafe { clear_young(block.as_mut_ptr()) };
        assert!(!is_young_header(block[0]));
        assert_eq!(header_data_len(block[0]), 4);
    }

    #[test]
    fn test_value_kind_predicates() {
        static DESC: TypeDesc = TypeDesc::plain("std::Point", 2);
        let mut inst = [0usize; 3];
        inst[0] = instance_header(&DESC, false);
        let v = Value::from_ptr(inst.as_mut_ptr());
        assert!(is_instance(v));
        assert!(!is_mixed_value(v));

        let mut mixed = [0usize; 4];
        mixed[0] = mixed_header(32, false);
        mixed[1] = 8;
        let m = Value::from_ptr(mixed.as_mut_ptr());
        assert!(is_mixed_value(m));
        assert!(!is_instance(m));

        assert!(!is_instance(Value::from_int(1)));
        assert!(!is_mixed_value(Value::NIL));
    }

    #[test]
    fn test_type_desc_alignment() {
        static DESC: TypeDesc = TypeDesc::plain("std::Str", 0);
        assert_eq!(&DESC as *const TypeDesc as usize & 0b1111, 0);
        assert_eq!(std::mem::align_of::<TypeDesc>(), 16);
    }
}
