//! Arbitrary-Precision Integers
//!
//! Short-int arithmetic that overflows promotes to a heap object: a
//! non-pointer block holding a sign word followed by base-2^32 limbs,
//! least significant first. The class is opaque to the rest of the core;
//! only creation on overflow, comparison and base-10 conversion are
//! provided here.

use crate::strings::create_string;
use mica_core::block::{
    SUB_LONG_INT, WORD, header_data_len, header_kind, header_sub, nonptr_data, KIND_NONPTR,
};
use mica_core::error::RtError;
use mica_core::thread::Thread;
use mica_core::value::Value;

#[inline]
pub fn is_long_int(v: Value) -> bool {
    v.is_ref() && {
        let h = unsafe { *v.as_ptr() };
        header_kind(h) == KIND_NONPTR && header_sub(h) == SUB_LONG_INT
    }
}

/// Build a long int from sign and little-endian limbs. Leading zero limbs
/// are trimmed; a zero magnitude is stored with a positive sign.
pub fn make_long_int(t: &mut Thread, negative: bool, limbs: &[u32]) -> Result<Value, RtError> {
    let mut n = limbs.len();
    while n > 0 && limbs[n - 1] == 0 {
        n -= 1;
    }
    let negative = negative && n > 0;
    let v = t.alloc_nonptr_block(WORD + n * 4, SUB_LONG_INT)?;
    unsafe {
        let data = nonptr_data(v.as_ptr());
        *(data as *mut usize) = negative as usize;
        std::ptr::copy_nonoverlapping(limbs.as_ptr(), data.add(WORD) as *mut u32, n);
    }
    Ok(v)
}

/// Build a long int from a 128-bit value (the widest product short-int
/// arithmetic can overflow into).
pub fn long_int_from_i128(t: &mut Thread, value: i128) -> Result<Value, RtError> {
    let negative = value < 0;
    let mut mag = value.unsigned_abs();
    let mut limbs = Vec::with_capacity(4);
    while mag > 0 {
        limbs.push((mag & 0xffff_ffff) as u32);
        mag >>= 32;
    }
    make_long_int(t, negative, &limbs)
}

pub(crate) fn long_int_sign(v: Value) -> bool {
    unsafe { *(nonptr_data(v.as_ptr()) as *const usize) != 0 }
}

pub(crate) fn long_int_limbs(v: Value) -> Vec<u32> {
    unsafe {
        let h = *v.as_ptr();
        let count = (header_data_len(h) - WORD) / 4;
        let data = nonptr_data(v.as_ptr()).add(WORD) as *const u32;
        std::slice::from_raw_parts(data, count).to_vec()
    }
}

/// Add two short ints, promoting the result on overflow.
pub fn promoting_add(t: &mut Thread, a: Value, b: Value) -> Result<Value, RtError> {
    if let Some(v) = a.checked_add(b) {
        return Ok(v);
    }
    long_int_from_i128(t, a.as_int() as i128 + b.as_int() as i128)
}

/// Multiply two short ints, promoting the result on overflow.
pub fn promoting_mul(t: &mut Thread, a: Value, b: Value) -> Result<Value, RtError> {
    if let Some(v) = a.checked_mul(b) {
        return Ok(v);
    }
    long_int_from_i128(t, a.as_int() as i128 * b.as_int() as i128)
}

/// Base-10 conversion by repeated division of the magnitude.
pub fn long_int_to_string(t: &mut Thread, v: Value) -> Result<Value, RtError> {
    debug_assert!(is_long_int(v));
    let mut limbs = long_int_limbs(v);
    let negative = long_int_sign(v);

    if limbs.is_empty() {
        return create_string(t, b"0");
    }

    // Divide by 10^9 per round, collecting digit groups.
    const CHUNK: u64 = 1_000_000_000;
    let mut groups: Vec<u32> = Vec::new();
    while !limbs.is_empty() {
        let mut rem: u64 = 0;
        for limb in limbs.iter_mut().rev() {
            let cur = (rem << 32) | *limb as u64;
            *limb = (cur / CHUNK) as u32;
            rem = cur % CHUNK;
        }
        while limbs.last() == Some(&0) {
            limbs.pop();
        }
        groups.push(rem as u32);
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&groups.pop().unwrap_or(0).to_string());
    while let Some(g) = groups.pop() {
        out.push_str(&format!("{:09}", g));
    }
    create_string(t, out.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::to_units;
    use crate::testutil::runtime_and_thread;
    use mica_core::value::{SHORT_INT_MAX, SHORT_INT_MIN};

    fn text(v: Value) -> String {
        to_units(v)
            .into_iter()
            .map(|u| char::from_u32(u as u32).unwrap())
            .collect()
    }

    #[test]
    fn test_promotion_on_overflow() {
        let (_rt, mut th) = runtime_and_thread();
        let max = Value::from_int(SHORT_INT_MAX);
        let one = Value::from_int(1);

        // In range: stays short.
        let ok = promoting_add(&mut th, Value::from_int(40), Value::from_int(2)).unwrap();
        assert!(ok.is_short_int());
        assert_eq!(ok.as_int(), 42);

        // Overflow: becomes an object reference.
        let over = promoting_add(&mut th, max, one).unwrap();
        assert!(over.is_ref());
        assert!(is_long_int(over));
        let s = long_int_to_string(&mut th, over).unwrap();
        assert_eq!(text(s), (SHORT_INT_MAX as i128 + 1).to_string());
    }

    #[test]
    fn test_negative_promotion() {
        let (_rt, mut th) = runtime_and_thread();
        let min = Value::from_int(SHORT_INT_MIN);
        let v = promoting_add(&mut th, min, Value::from_int(-1)).unwrap();
        assert!(is_long_int(v));
        let s = long_int_to_string(&mut th, v).unwrap();
        assert_eq!(text(s), (SHORT_INT_MIN as i128 - 1).to_string());
    }

    #[test]
    fn test_mul_promotion() {
        let (_rt, mut th) = runtime_and_thread();
        let big = Value::from_int(1 << 40);
        let v = promoting_mul(&mut th, big, big).unwrap();
        assert!(is_long_int(v));
        let s = long_int_to_string(&mut th, v).unwrap();
        assert_eq!(text(s), (1i128 << 80).to_string());
    }

    #[test]
    fn test_zero_and_trim() {
        let (_rt, mut th) = runtime_and_thread();
        let z = make_long_int(&mut th, true, &[0, 0]).unwrap();
        assert!(!long_int_sign(z));
        assert_eq!(text(long_int_to_string(&mut th, z).unwrap()), "0");
    }

    #[test]
    fn test_multi_limb_decimal() {
        let (_rt, mut th) = runtime_and_thread();
        let v = long_int_from_i128(&mut th, 123_456_789_012_345_678_901_234_567i128).unwrap();
        let s = long_int_to_string(&mut th, v).unwrap();
        assert_eq!(text(s), "123456789012345678901234567");
    }
}
