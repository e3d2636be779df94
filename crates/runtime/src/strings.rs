//! String Representations
//!
//! Three co-equal representations behind one abstract interface
//! (`str_len` / `char_at`):
//!
//! | Representation | Storage                                            |
//! |----------------|----------------------------------------------------|
//! | Narrow         | non-pointer block of bytes (codes 0–255)           |
//! | Wide           | non-pointer block of 16-bit units                  |
//! | Substring      | value block {underlying, start, length}            |
//!
//! Widening is lazy: a narrow string is only converted when an operation
//! actually needs 16-bit units, and the original is never mutated. A slice
//! becomes a substring view when it is long enough to amortize the extra
//! block (`MIN_SUBSTR_LEN` units for narrow, half that for wide); shorter
//! slices copy.
//!
//! Strings are immutable once returned to user code. The `alloc_*_uninit`
//! constructors hand out writable storage and are crate-internal; callers
//! must fully initialize a string before publishing it.
//!
//! ## GC discipline
//!
//! Any function that allocates may move its string arguments. The pattern
//! throughout: park argument values in temporary root slots, allocate,
//! re-read the (possibly moved) arguments, then fill.

use mica_core::block::{
    KIND_NONPTR, KIND_VALUE, SUB_NARROW_STR, SUB_SUBSTR, SUB_WIDE_STR, header_data_len,
    header_kind, header_sub, nonptr_data, value_slots,
};
use mica_core::error::RtError;
use mica_core::thread::Thread;
use mica_core::value::Value;

/// Shortest slice (in code units) stored as a substring view rather than a
/// copy: a substring block is a header plus three words, so views shorter
/// than about two machine words of narrow payload would be larger than the
/// copy.
pub const MIN_SUBSTR_LEN: usize = 9;

/// Wide threshold: same block economics, two-byte units.
pub const MIN_SUBSTR_LEN_WIDE: usize = (MIN_SUBSTR_LEN + 1) / 2;

// =============================================================================
// Predicates
// =============================================================================

#[inline]
pub fn is_narrow_str(v: Value) -> bool {
    v.is_ref() && {
        let h = unsafe { *v.as_ptr() };
        header_kind(h) == KIND_NONPTR && header_sub(h) == SUB_NARROW_STR
    }
}

#[inline]
pub fn is_wide_str(v: Value) -> bool {
    v.is_ref() && {
        let h = unsafe { *v.as_ptr() };
        header_kind(h) == KIND_NONPTR && header_sub(h) == SUB_WIDE_STR
    }
}

#[inline]
pub fn is_sub_str(v: Value) -> bool {
    v.is_ref() && {
        let h = unsafe { *v.as_ptr() };
        header_kind(h) == KIND_VALUE && header_sub(h) == SUB_SUBSTR
    }
}

/// Any of the three string representations.
#[inline]
pub fn is_str(v: Value) -> bool {
    is_narrow_str(v) || is_wide_str(v) || is_sub_str(v)
}

pub(crate) fn expect_str(v: Value) -> Result<(), RtError> {
    if is_str(v) {
        Ok(())
    } else {
        Err(RtError::type_error("Str expected"))
    }
}

// =============================================================================
// Views
// =============================================================================

/// A resolved, borrowed look at string contents. Substrings resolve to a
/// window over their underlying block.
#[derive(Clone, Copy)]
pub enum StrView<'a> {
    Narrow(&'a [u8]),
    Wide(&'a [u16]),
}

impl<'a> StrView<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            StrView::Narrow(b) => b.len(),
            StrView::Wide(w) => w.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn at(&self, i: usize) -> u16 {
        match self {
            StrView::Narrow(b) => b[i] as u16,
            StrView::Wide(w) => w[i],
        }
    }

    #[inline]
    pub fn is_narrow(&self) -> bool {
        matches!(self, StrView::Narrow(_))
    }
}

/// Resolve a string value to its contents.
///
/// # Safety
/// `v` must be a string; the view borrows heap storage and is invalidated
/// by any allocation or safe point. Callers must not allocate while
/// holding it.
pub unsafe fn view<'a>(v: Value) -> StrView<'a> {
    unsafe {
        let ptr = v.as_ptr();
        let h = *ptr;
        if header_kind(h) == KIND_NONPTR {
            let data = nonptr_data(ptr);
            let len = header_data_len(h);
            if header_sub(h) == SUB_NARROW_STR {
                StrView::Narrow(std::slice::from_raw_parts(data, len))
            } else {
                StrView::Wide(std::slice::from_raw_parts(data as *const u16, len / 2))
            }
        } else {
            let slots = value_slots(ptr);
            let underlying = *slots;
            let ind = (*slots.add(1)).as_int() as usize;
            let len = (*slots.add(2)).as_int() as usize;
            match view(underlying) {
                StrView::Narrow(b) => StrView::Narrow(&b[ind..ind + len]),
                StrView::Wide(w) => StrView::Wide(&w[ind..ind + len]),
            }
        }
    }
}

/// Length in code units.
pub fn str_len(v: Value) -> usize {
    unsafe { view(v).len() }
}

/// Code unit at `i`. Bounds are the caller's contract.
pub fn char_at(v: Value, i: usize) -> u16 {
    unsafe { view(v).at(i) }
}

/// Does a string (in any representation) consist only of codes 0–255?
pub fn is_narrow_contents(v: Value) -> bool {
    match unsafe { view(v) } {
        StrView::Narrow(_) => true,
        StrView::Wide(w) => w.iter().all(|&c| c <= 0xff),
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Allocate an uninitialized narrow string of `len` bytes. Internal: the
/// caller fills every byte before the value escapes.
pub(crate) fn alloc_narrow_uninit(t: &mut Thread, len: usize) -> Result<Value, RtError> {
    t.alloc_nonptr_block(len, SUB_NARROW_STR)
}

/// Allocate an uninitialized wide string of `units` 16-bit units.
pub(crate) fn alloc_wide_uninit(t: &mut Thread, units: usize) -> Result<Value, RtError> {
    t.alloc_nonptr_block(units * 2, SUB_WIDE_STR)
}

pub(crate) unsafe fn narrow_data(v: Value) -> *mut u8 {
    unsafe { nonptr_data(v.as_ptr()) }
}

pub(crate) unsafe fn wide_data(v: Value) -> *mut u16 {
    unsafe { nonptr_data(v.as_ptr()) as *mut u16 }
}

/// Create a narrow string from 8-bit codes.
pub fn create_string(t: &mut Thread, buf: &[u8]) -> Result<Value, RtError> {
    let v = alloc_narrow_uninit(t, buf.len())?;
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), narrow_data(v), buf.len());
    }
    Ok(v)
}

/// Create a wide string from 16-bit units.
pub fn create_wide_string(t: &mut Thread, buf: &[u16]) -> Result<Value, RtError> {
    let v = alloc_wide_uninit(t, buf.len())?;
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), wide_data(v), buf.len());
    }
    Ok(v)
}

/// Create a string from UTF-8 text: narrow when every code point fits a
/// byte, wide otherwise. Code points above U+FFFF are not representable in
/// 16-bit units and are rejected.
pub fn create_string_from_utf8(t: &mut Thread, s: &str) -> Result<Value, RtError> {
    if s.is_ascii() {
        return create_string(t, s.as_bytes());
    }
    let mut units: Vec<u16> = Vec::with_capacity(s.len());
    let mut narrow = true;
    for ch in s.chars() {
        let code = ch as u32;
        if code > 0xffff {
            return Err(RtError::value("character outside the 16-bit range"));
        }
        if code > 0xff {
            narrow = false;
        }
        units.push(code as u16);
    }
    if narrow {
        let bytes: Vec<u8> = units.iter().map(|&u| u as u8).collect();
        create_string(t, &bytes)
    } else {
        create_wide_string(t, &units)
    }
}

/// Single-character string.
pub fn make_ch(t: &mut Thread, ch: u16) -> Result<Value, RtError> {
    if ch <= 0xff {
        create_string(t, &[ch as u8])
    } else {
        create_wide_string(t, &[ch])
    }
}

/// Build a string from 16-bit units, choosing the representation by
/// contents.
pub fn create_from_units(t: &mut Thread, units: &[u16]) -> Result<Value, RtError> {
    if units.iter().all(|&c| c <= 0xff) {
        let bytes: Vec<u8> = units.iter().map(|&u| u as u8).collect();
        create_string(t, &bytes)
    } else {
        create_wide_string(t, units)
    }
}

// =============================================================================
// Widening / narrowing
// =============================================================================

/// Widened copy of a narrow (or narrow-substring) string. Wide inputs are
/// returned as-is.
pub fn narrow_to_wide(t: &mut Thread, s: Value) -> Result<Value, RtError> {
    expect_str(s)?;
    let units = {
        match unsafe { view(s) } {
            StrView::Wide(_) => return Ok(s),
            StrView::Narrow(b) => b.iter().map(|&c| c as u16).collect::<Vec<u16>>(),
        }
    };
    create_wide_string(t, &units)
}

/// Narrow copy of a wide string whose contents fit in bytes.
pub fn wide_to_narrow(t: &mut Thread, s: Value) -> Result<Value, RtError> {
    expect_str(s)?;
    let bytes = {
        match unsafe { view(s) } {
            StrView::Narrow(_) => return Ok(s),
            StrView::Wide(w) => {
                if !w.iter().all(|&c| c <= 0xff) {
                    return Err(RtError::value("wide characters in narrow conversion"));
                }
                w.iter().map(|&c| c as u8).collect::<Vec<u8>>()
            }
        }
    };
    create_string(t, &bytes)
}

/// Canonicalize a wide string that only holds narrow contents.
pub fn normalize_narrow(t: &mut Thread, s: Value) -> Result<Value, RtError> {
    if is_wide_str(s) && is_narrow_contents(s) {
        wide_to_narrow(t, s)
    } else {
        Ok(s)
    }
}

// =============================================================================
// Substrings and slicing
// =============================================================================

/// Window `[beg, end)` over `s`. Short windows copy; longer ones share the
/// underlying storage through a substring block. Indices must be valid.
pub fn create_sub_str(
    t: &mut Thread,
    s: Value,
    beg: usize,
    end: usize,
) -> Result<Value, RtError> {
    expect_str(s)?;
    let total = str_len(s);
    debug_assert!(beg <= end && end <= total);
    let len = end - beg;
    if beg == 0 && end == total {
        return Ok(s);
    }

    let narrow = unsafe { view(s).is_narrow() };
    let copy_threshold = if narrow {
        MIN_SUBSTR_LEN
    } else {
        MIN_SUBSTR_LEN_WIDE
    };
    if len < copy_threshold {
        // Copy out through a stack buffer: the source may move during the
        // result's allocation.
        let mut narrow_buf = [0u8; MIN_SUBSTR_LEN];
        let mut wide_buf = [0u16; MIN_SUBSTR_LEN_WIDE];
        match unsafe { view(s) } {
            StrView::Narrow(b) => {
                narrow_buf[..len].copy_from_slice(&b[beg..end]);
                return create_string(t, &narrow_buf[..len]);
            }
            StrView::Wide(w) => {
                wide_buf[..len].copy_from_slice(&w[beg..end]);
                return create_wide_string(t, &wide_buf[..len]);
            }
        }
    }

    // Share storage. A substring of a substring points at the plain
    // string underneath.
    let slot = t.alloc_temp();
    unsafe { *slot = s };
    let block = t.alloc_value_block(3, SUB_SUBSTR)?;
    let s = unsafe { *slot };
    t.free_temp();

    let (underlying, offset) = if is_sub_str(s) {
        unsafe {
            let slots = value_slots(s.as_ptr());
            (*slots, (*slots.add(1)).as_int() as usize)
        }
    } else {
        (s, 0)
    };
    t.set_element(block, 0, underlying)?;
    t.set_element(block, 1, Value::from_int((offset + beg) as isize))?;
    t.set_element(block, 2, Value::from_int(len as isize))?;
    Ok(block)
}

/// `slice(s, i, j)`: negative indices count from the end; swapped or
/// out-of-range indices yield an empty string.
pub fn slice(t: &mut Thread, s: Value, i: isize, j: isize) -> Result<Value, RtError> {
    expect_str(s)?;
    let len = str_len(s) as isize;
    let mut beg = if i < 0 { len + i } else { i };
    let mut end = if j < 0 { len + j } else { j };
    beg = beg.clamp(0, len);
    end = end.clamp(0, len);
    if beg >= end {
        return create_string(t, b"");
    }
    create_sub_str(t, s, beg as usize, end as usize)
}

// =============================================================================
// Concatenation
// =============================================================================

/// `concat(a, b)`: narrow when both operands are narrow (or narrow
/// substrings), wide otherwise. Concatenating with an empty string returns
/// the other operand unchanged.
pub fn concat_strings(t: &mut Thread, a: Value, b: Value) -> Result<Value, RtError> {
    expect_str(a)?;
    expect_str(b)?;
    let la = str_len(a);
    let lb = str_len(b);
    if la == 0 {
        return Ok(b);
    }
    if lb == 0 {
        return Ok(a);
    }
    let total = la
        .checked_add(lb)
        .filter(|&n| n <= mica_core::SHORT_INT_MAX as usize / 2)
        .ok_or_else(|| RtError::runtime("Str concatenation result too long"))?;

    let both_narrow = unsafe { view(a).is_narrow() && view(b).is_narrow() };

    let slots = t.alloc_temps(2);
    unsafe {
        *slots = a;
        *slots.add(1) = b;
    }
    let result = if both_narrow {
        alloc_narrow_uninit(t, total)
    } else {
        alloc_wide_uninit(t, total)
    };
    let (a, b) = unsafe { (*slots, *slots.add(1)) };
    t.free_temps(2);
    let result = result?;

    unsafe {
        if both_narrow {
            let dst = narrow_data(result);
            let (StrView::Narrow(xa), StrView::Narrow(xb)) = (view(a), view(b)) else {
                unreachable!()
            };
            std::ptr::copy_nonoverlapping(xa.as_ptr(), dst, la);
            std::ptr::copy_nonoverlapping(xb.as_ptr(), dst.add(la), lb);
        } else {
            let dst = wide_data(result);
            for i in 0..la {
                *dst.add(i) = view(a).at(i);
            }
            for i in 0..lb {
                *dst.add(la + i) = view(b).at(i);
            }
        }
    }
    Ok(result)
}

// =============================================================================
// Repetition
// =============================================================================

/// `repeat(s, n)`: preserves the representation. Single-character narrow
/// repeats use a byte fill.
pub fn repeat_string(t: &mut Thread, s: Value, n: usize) -> Result<Value, RtError> {
    expect_str(s)?;
    let len = str_len(s);
    let total = len
        .checked_mul(n)
        .filter(|&x| x <= mica_core::SHORT_INT_MAX as usize / 2)
        .ok_or_else(|| RtError::runtime("Str repetition result too long"))?;
    if total == 0 {
        return create_string(t, b"");
    }

    let narrow = unsafe { view(s).is_narrow() };
    let slot = t.alloc_temp();
    unsafe { *slot = s };
    let result = if narrow {
        alloc_narrow_uninit(t, total)
    } else {
        alloc_wide_uninit(t, total)
    };
    let s = unsafe { *slot };
    t.free_temp();
    let result = result?;

    unsafe {
        if narrow {
            let dst = narrow_data(result);
            let StrView::Narrow(src) = view(s) else { unreachable!() };
            if len == 1 {
                std::ptr::write_bytes(dst, src[0], n);
            } else {
                for rep in 0..n {
                    std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(rep * len), len);
                }
            }
        } else {
            let dst = wide_data(result);
            let src = view(s);
            for rep in 0..n {
                for i in 0..len {
                    *dst.add(rep * len + i) = src.at(i);
                }
            }
        }
    }
    Ok(result)
}

// =============================================================================
// Comparison and hashing
// =============================================================================

/// Lexicographic comparison on 16-bit code units. All four representation
/// pairings run without widening temporaries.
pub fn compare_strings(a: Value, b: Value) -> Result<std::cmp::Ordering, RtError> {
    expect_str(a)?;
    expect_str(b)?;
    unsafe {
        let cmp = match (view(a), view(b)) {
            (StrView::Narrow(x), StrView::Narrow(y)) => x.cmp(y),
            (StrView::Wide(x), StrView::Wide(y)) => x.cmp(y),
            (StrView::Narrow(x), StrView::Wide(y)) => {
                cmp_mixed(x, y).reverse()
            }
            (StrView::Wide(x), StrView::Narrow(y)) => cmp_mixed(y, x),
        };
        Ok(cmp)
    }
}

/// Compare a narrow string against a wide one; returns the ordering of
/// the *wide* side.
fn cmp_mixed(narrow: &[u8], wide: &[u16]) -> std::cmp::Ordering {
    let n = narrow.len().min(wide.len());
    for i in 0..n {
        let c = wide[i].cmp(&(narrow[i] as u16));
        if c != std::cmp::Ordering::Equal {
            return c;
        }
    }
    wide.len().cmp(&narrow.len())
}

/// Are two strings equal, representation-independently?
pub fn equal_strings(a: Value, b: Value) -> Result<bool, RtError> {
    Ok(compare_strings(a, b)? == std::cmp::Ordering::Equal)
}

/// String hash: `h = h*32 + c` folded over code units, seeded with 0.
/// Equal strings hash equally in every representation.
pub fn string_hash_value(v: Value) -> Result<Value, RtError> {
    expect_str(v)?;
    let mut h: usize = 0;
    unsafe {
        match view(v) {
            StrView::Narrow(b) => {
                for &c in b {
                    h = h.wrapping_mul(32).wrapping_add(c as usize);
                }
            }
            StrView::Wide(w) => {
                for &c in w {
                    h = h.wrapping_mul(32).wrapping_add(c as usize);
                }
            }
        }
    }
    Ok(Value::from_int((h & mica_core::SHORT_INT_MAX as usize) as isize))
}

// =============================================================================
// Extraction
// =============================================================================

/// Copy narrow bytes into `buf`, up to its length. Fails on wide contents.
/// Returns the number of bytes written.
pub fn get_c_str(v: Value, buf: &mut [u8]) -> Result<usize, RtError> {
    expect_str(v)?;
    unsafe {
        match view(v) {
            StrView::Narrow(b) => {
                let n = b.len().min(buf.len());
                buf[..n].copy_from_slice(&b[..n]);
                Ok(n)
            }
            StrView::Wide(w) => {
                let n = w.len().min(buf.len());
                for (i, &c) in w[..n].iter().enumerate() {
                    if c > 0xff {
                        return Err(RtError::value("wide characters in 8-bit extraction"));
                    }
                    buf[i] = c as u8;
                }
                Ok(n)
            }
        }
    }
}

/// Encode the 16-bit units as UTF-8 bytes (1–3 bytes per unit; surrogate
/// units are encoded independently, matching the runtime's UCS-2 model).
pub fn get_utf8(v: Value) -> Result<Vec<u8>, RtError> {
    expect_str(v)?;
    let len = str_len(v);
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let c = char_at(v, i);
        if c <= 0x7f {
            out.push(c as u8);
        } else if c <= 0x7ff {
            out.push(0xc0 | (c >> 6) as u8);
            out.push(0x80 | (c & 0x3f) as u8);
        } else {
            out.push(0xe0 | (c >> 12) as u8);
            out.push(0x80 | ((c >> 6) & 0x3f) as u8);
            out.push(0x80 | (c & 0x3f) as u8);
        }
    }
    Ok(out)
}

/// Collect a string into native 16-bit units (helper for operations that
/// rebuild strings).
pub(crate) fn to_units(v: Value) -> Vec<u16> {
    unsafe {
        match view(v) {
            StrView::Narrow(b) => b.iter().map(|&c| c as u16).collect(),
            StrView::Wide(w) => w.to_vec(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::runtime_and_thread;

    #[test]
    fn test_create_and_predicates() {
        let (_rt, mut th) = runtime_and_thread();
        let n = create_string(&mut th, b"abc").unwrap();
        assert!(is_narrow_str(n));
        assert!(is_str(n));
        assert!(!is_wide_str(n));
        assert_eq!(str_len(n), 3);
        assert_eq!(char_at(n, 1), b'b' as u16);

        let w = create_wide_string(&mut th, &[0x4e16, 0x754c]).unwrap();
        assert!(is_wide_str(w));
        assert_eq!(str_len(w), 2);
        assert_eq!(char_at(w, 0), 0x4e16);

        assert!(!is_str(Value::from_int(3)));
        assert!(!is_str(Value::NIL));
    }

    #[test]
    fn test_create_from_utf8_picks_representation() {
        let (_rt, mut th) = runtime_and_thread();
        let ascii = create_string_from_utf8(&mut th, "plain").unwrap();
        assert!(is_narrow_str(ascii));

        let latin = create_string_from_utf8(&mut th, "café").unwrap();
        assert!(is_narrow_str(latin));
        assert_eq!(char_at(latin, 3), 0xe9);

        let cjk = create_string_from_utf8(&mut th, "世界").unwrap();
        assert!(is_wide_str(cjk));
        assert_eq!(str_len(cjk), 2);

        assert!(create_string_from_utf8(&mut th, "🦀").is_err());
    }

    #[test]
    fn test_concat_narrow_and_wide() {
        let (_rt, mut th) = runtime_and_thread();
        let a = create_string(&mut th, b"hi ").unwrap();
        let b = create_string_from_utf8(&mut th, "世界").unwrap();
        let c = concat_strings(&mut th, a, b).unwrap();
        assert!(is_wide_str(c));
        assert_eq!(str_len(c), 5);
        let expect = [0x68, 0x69, 0x20, 0x4e16, 0x754c];
        for (i, &e) in expect.iter().enumerate() {
            assert_eq!(char_at(c, i), e);
        }

        let d = create_string(&mut th, b"xy").unwrap();
        let e = concat_strings(&mut th, a, d).unwrap();
        assert!(is_narrow_str(e));
        assert_eq!(to_units(e), [104, 105, 32, 120, 121]);
    }

    #[test]
    fn test_concat_empty_returns_operand() {
        let (_rt, mut th) = runtime_and_thread();
        let a = create_string(&mut th, b"abc").unwrap();
        let empty = create_string(&mut th, b"").unwrap();
        assert_eq!(concat_strings(&mut th, a, empty).unwrap(), a);
        assert_eq!(concat_strings(&mut th, empty, a).unwrap(), a);
    }

    #[test]
    fn test_concat_lengths_law() {
        let (_rt, mut th) = runtime_and_thread();
        let a = create_string(&mut th, b"hello, ").unwrap();
        let b = create_string(&mut th, b"world").unwrap();
        let c = concat_strings(&mut th, a, b).unwrap();
        assert_eq!(str_len(c), str_len(a) + str_len(b));
        for i in 0..str_len(a) {
            assert_eq!(char_at(c, i), char_at(a, i));
        }
        for i in 0..str_len(b) {
            assert_eq!(char_at(c, str_len(a) + i), char_at(b, i));
        }
    }

    #[test]
    fn test_substring_shares_and_copies() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string(&mut th, b"the quick brown fox").unwrap();

        // Long view: shared.
        let long = create_sub_str(&mut th, s, 4, 15).unwrap();
        assert!(is_sub_str(long));
        assert_eq!(str_len(long), 11);
        assert_eq!(char_at(long, 0), b'q' as u16);

        // Short view: copied.
        let short = create_sub_str(&mut th, s, 4, 9).unwrap();
        assert!(is_narrow_str(short));
        assert_eq!(to_units(short), b"quick".map(|b| b as u16));

        // Whole-string view: identity.
        assert_eq!(create_sub_str(&mut th, s, 0, 19).unwrap(), s);

        // Substring of a substring references the plain string.
        let nested = create_sub_str(&mut th, long, 6, 11).unwrap();
        if is_sub_str(nested) {
            unsafe {
                let slots = value_slots(nested.as_ptr());
                assert_eq!(*slots, s);
            }
        }
        assert_eq!(to_units(nested), b"brown".map(|b| b as u16));
    }

    #[test]
    fn test_slice_negative_and_degenerate() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string(&mut th, b"abcdef").unwrap();
        let tail = slice(&mut th, s, -3, 6).unwrap();
        assert_eq!(to_units(tail), b"def".map(|b| b as u16));
        let empty = slice(&mut th, s, 4, 2).unwrap();
        assert_eq!(str_len(empty), 0);
        let clamped = slice(&mut th, s, -100, 100).unwrap();
        assert_eq!(str_len(clamped), 6);
    }

    #[test]
    fn test_slice_concat_roundtrip_law() {
        let (_rt, mut th) = runtime_and_thread();
        let a = create_string(&mut th, b"first part ").unwrap();
        let b = create_string(&mut th, b"second").unwrap();
        let c = concat_strings(&mut th, a, b).unwrap();
        let la = str_len(a) as isize;
        let lb = str_len(b) as isize;
        let a2 = slice(&mut th, c, 0, la).unwrap();
        let b2 = slice(&mut th, c, la, la + lb).unwrap();
        assert!(equal_strings(a, a2).unwrap());
        assert!(equal_strings(b, b2).unwrap());
    }

    #[test]
    fn test_repeat() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string(&mut th, b"ab").unwrap();
        let r = repeat_string(&mut th, s, 3).unwrap();
        assert_eq!(to_units(r), b"ababab".map(|b| b as u16));

        // Single-character fill path.
        let dash = create_string(&mut th, b"-").unwrap();
        let line = repeat_string(&mut th, dash, 10).unwrap();
        assert_eq!(str_len(line), 10);
        assert!((0..10).all(|i| char_at(line, i) == b'-' as u16));

        let w = create_wide_string(&mut th, &[0x100]).unwrap();
        let rw = repeat_string(&mut th, w, 4).unwrap();
        assert!(is_wide_str(rw));
        assert_eq!(str_len(rw), 4);
    }

    #[test]
    fn test_compare_all_representations() {
        let (_rt, mut th) = runtime_and_thread();
        let narrow = create_string(&mut th, b"abc").unwrap();
        let wide_equal = create_wide_string(&mut th, &[97, 98, 99]).unwrap();
        let wide_more = create_wide_string(&mut th, &[97, 98, 0x4e16]).unwrap();
        let sub = {
            let s = create_string(&mut th, b"zzabczz--filler--").unwrap();
            create_sub_str(&mut th, s, 2, 12).unwrap()
        };
        let sub_abc = slice(&mut th, sub, 0, 3).unwrap();

        use std::cmp::Ordering::*;
        assert_eq!(compare_strings(narrow, wide_equal).unwrap(), Equal);
        assert_eq!(compare_strings(narrow, wide_more).unwrap(), Less);
        assert_eq!(compare_strings(wide_more, narrow).unwrap(), Greater);
        assert_eq!(compare_strings(narrow, sub_abc).unwrap(), Equal);

        // Prefix ordering.
        let ab = create_string(&mut th, b"ab").unwrap();
        assert_eq!(compare_strings(ab, narrow).unwrap(), Less);

        // Type errors surface as errors, not orderings.
        assert!(compare_strings(narrow, Value::from_int(1)).is_err());
    }

    #[test]
    fn test_hash_representation_independent() {
        let (_rt, mut th) = runtime_and_thread();
        let narrow = create_string(&mut th, b"hash me").unwrap();
        let wide = create_wide_string(
            &mut th,
            &b"hash me".map(|b| b as u16),
        )
        .unwrap();
        let padded = create_string(&mut th, b"xxhash mexx").unwrap();
        let sub = create_sub_str(&mut th, padded, 2, 9).unwrap();

        let h1 = string_hash_value(narrow).unwrap();
        let h2 = string_hash_value(wide).unwrap();
        let h3 = string_hash_value(sub).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1, h3);

        let other = create_string(&mut th, b"hash mf").unwrap();
        assert_ne!(string_hash_value(other).unwrap(), h1);
    }

    #[test]
    fn test_widen_narrow_roundtrip() {
        let (_rt, mut th) = runtime_and_thread();
        let n = create_string(&mut th, b"caf\xe9").unwrap();
        let w = narrow_to_wide(&mut th, n).unwrap();
        assert!(is_wide_str(w));
        assert_eq!(char_at(w, 3), 0xe9);
        let n2 = wide_to_narrow(&mut th, w).unwrap();
        assert!(is_narrow_str(n2));
        assert!(equal_strings(n, n2).unwrap());

        let cjk = create_wide_string(&mut th, &[0x4e16]).unwrap();
        assert!(wide_to_narrow(&mut th, cjk).is_err());
        assert!(is_narrow_contents(w));
        assert!(!is_narrow_contents(cjk));

        let normalized = normalize_narrow(&mut th, w).unwrap();
        assert!(is_narrow_str(normalized));
    }

    #[test]
    fn test_get_c_str_and_utf8() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string(&mut th, b"hello").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(get_c_str(s, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        // Length limit.
        let mut small = [0u8; 3];
        assert_eq!(get_c_str(s, &mut small).unwrap(), 3);
        assert_eq!(&small, b"hel");

        let cjk = create_wide_string(&mut th, &[0x4e16, 0x754c]).unwrap();
        assert!(get_c_str(cjk, &mut buf).is_err());
        assert_eq!(get_utf8(cjk).unwrap(), "世界".as_bytes());

        let latin = create_string(&mut th, b"caf\xe9").unwrap();
        assert_eq!(get_utf8(latin).unwrap(), "café".as_bytes());
    }

    #[test]
    fn test_strings_survive_collection() {
        let (rt, mut th) = runtime_and_thread();
        let root = th.alloc_temp();
        let s = create_string(&mut th, b"persistent").unwrap();
        let sub = create_sub_str(&mut th, s, 0, 9).unwrap();
        unsafe { *root = sub };
        rt.collect_all_garbage().unwrap();
        let moved = unsafe { *root };
        assert_eq!(
            to_units(moved),
            b"persisten".map(|b| b as u16)
        );
        th.free_temp();
    }

    #[test]
    fn test_make_ch() {
        let (_rt, mut th) = runtime_and_thread();
        let a = make_ch(&mut th, b'A' as u16).unwrap();
        assert!(is_narrow_str(a));
        assert_eq!(str_len(a), 1);
        let w = make_ch(&mut th, 0x203d).unwrap();
        assert!(is_wide_str(w));
        assert_eq!(char_at(w, 0), 0x203d);
    }
}
