//! String Operations
//!
//! The operation suite over the three string representations: case
//! conversion, trimming, searching, counting, replacement, splitting and
//! joining, and the prefix/suffix predicates. Searching operations scan
//! views directly and never allocate; rebuilding operations compute the
//! result length first and fill a single fresh block.
//!
//! Lists exchanged with `split` and `join` are value-block arrays, the
//! core's aggregate.

use crate::strings::{
    StrView, alloc_narrow_uninit, alloc_wide_uninit, create_from_units, create_string,
    create_sub_str, expect_str, narrow_data, str_len, to_units, view, wide_data,
};
use crate::unicode::{is_ascii_space, to_lower, to_upper};
use mica_core::block::{SUB_ARRAY, header_data_len, value_slots};
use mica_core::error::RtError;
use mica_core::thread::Thread;
use mica_core::value::Value;

// =============================================================================
// Arrays
// =============================================================================

/// Number of elements in a value-block array.
pub fn array_len(v: Value) -> usize {
    unsafe { header_data_len(*v.as_ptr()) / mica_core::block::WORD }
}

/// Element of a value-block array.
pub fn array_get(v: Value, i: usize) -> Value {
    debug_assert!(i < array_len(v));
    unsafe { *value_slots(v.as_ptr()).add(i) }
}

/// Build a value-block array from native values, rooting them across the
/// allocation.
pub fn make_array(t: &mut Thread, values: &[Value]) -> Result<Value, RtError> {
    let n = values.len();
    let base = t.alloc_temps(n);
    for (i, &v) in values.iter().enumerate() {
        unsafe { *base.add(i) = v };
    }
    let result = (|| {
        let arr = t.alloc_value_block(n, SUB_ARRAY)?;
        for i in 0..n {
            let v = unsafe { *base.add(i) };
            t.set_element(arr, i, v)?;
        }
        Ok(arr)
    })();
    t.free_temps(n);
    result
}

// =============================================================================
// Case conversion
// =============================================================================

/// Uppercase copy. A narrow string whose conversion leaves the 8-bit range
/// stays narrow; ÿ and friends widen the result.
pub fn str_upper(t: &mut Thread, s: Value) -> Result<Value, RtError> {
    map_case(t, s, to_upper)
}

/// Lowercase copy.
pub fn str_lower(t: &mut Thread, s: Value) -> Result<Value, RtError> {
    map_case(t, s, to_lower)
}

fn map_case(t: &mut Thread, s: Value, f: fn(u16) -> u16) -> Result<Value, RtError> {
    expect_str(s)?;
    let units: Vec<u16> = to_units(s).into_iter().map(f).collect();
    create_from_units(t, &units)
}

// =============================================================================
// Trimming
// =============================================================================

/// Trim ASCII whitespace from both ends; the result is a view into the
/// original.
pub fn str_strip(t: &mut Thread, s: Value) -> Result<Value, RtError> {
    expect_str(s)?;
    let len = str_len(s);
    let (mut beg, mut end) = (0usize, len);
    unsafe {
        let v = view(s);
        while beg < end && is_ascii_space(v.at(beg)) {
            beg += 1;
        }
        while end > beg && is_ascii_space(v.at(end - 1)) {
            end -= 1;
        }
    }
    create_sub_str(t, s, beg, end)
}

// =============================================================================
// Searching
// =============================================================================

/// Naive scan for `sub` in `s` starting at `start`; −1 on a miss. An empty
/// needle matches at the (clamped) start position.
pub fn str_find(s: Value, sub: Value, start: usize) -> Result<isize, RtError> {
    expect_str(s)?;
    expect_str(sub)?;
    let ls = str_len(s);
    let ln = str_len(sub);
    let start = start.min(ls);
    if ln == 0 {
        return Ok(start as isize);
    }
    if ln > ls - start {
        return Ok(-1);
    }
    unsafe {
        let hay = view(s);
        let needle = view(sub);
        'outer: for i in start..=ls - ln {
            for j in 0..ln {
                if hay.at(i + j) != needle.at(j) {
                    continue 'outer;
                }
            }
            return Ok(i as isize);
        }
    }
    Ok(-1)
}

/// Like `find`, but a miss is an error.
pub fn str_index(s: Value, sub: Value) -> Result<usize, RtError> {
    match str_find(s, sub, 0)? {
        -1 => Err(RtError::value("substring not found")),
        i => Ok(i as usize),
    }
}

/// Does `s` contain `sub`?
pub fn str_contains(s: Value, sub: Value) -> Result<bool, RtError> {
    Ok(str_find(s, sub, 0)? >= 0)
}

/// Count non-overlapping occurrences.
pub fn str_count(s: Value, sub: Value) -> Result<usize, RtError> {
    expect_str(s)?;
    expect_str(sub)?;
    if str_len(sub) == 0 {
        return Err(RtError::value("empty substring"));
    }
    let ln = str_len(sub) as isize;
    let mut count = 0;
    let mut at = 0usize;
    loop {
        match str_find(s, sub, at)? {
            -1 => return Ok(count),
            i => {
                count += 1;
                at = (i + ln) as usize;
            }
        }
    }
}

/// Prefix test; no allocation.
pub fn str_starts_with(s: Value, prefix: Value) -> Result<bool, RtError> {
    expect_str(s)?;
    expect_str(prefix)?;
    let lp = str_len(prefix);
    if lp > str_len(s) {
        return Ok(false);
    }
    unsafe {
        let a = view(s);
        let b = view(prefix);
        Ok((0..lp).all(|i| a.at(i) == b.at(i)))
    }
}

/// Suffix test; no allocation.
pub fn str_ends_with(s: Value, suffix: Value) -> Result<bool, RtError> {
    expect_str(s)?;
    expect_str(suffix)?;
    let ls = str_len(s);
    let lf = str_len(suffix);
    if lf > ls {
        return Ok(false);
    }
    unsafe {
        let a = view(s);
        let b = view(suffix);
        Ok((0..lf).all(|i| a.at(ls - lf + i) == b.at(i)))
    }
}

// =============================================================================
// Replacement
// =============================================================================

/// Replace up to `max` occurrences of `old` with `new`, rebuilding the
/// string once with the projected length.
pub fn str_replace(
    t: &mut Thread,
    s: Value,
    old: Value,
    new: Value,
    max: Option<usize>,
) -> Result<Value, RtError> {
    expect_str(s)?;
    expect_str(old)?;
    expect_str(new)?;
    if str_len(old) == 0 {
        return Err(RtError::value("empty substring"));
    }

    let total = str_count(s, old)?;
    let n = max.map_or(total, |m| m.min(total));
    if n == 0 {
        return Ok(s);
    }

    let ls = str_len(s);
    let lo = str_len(old);
    let ln = str_len(new);
    let projected = (ls - n * lo)
        .checked_add(n.checked_mul(ln).ok_or_else(projected_overflow)?)
        .filter(|&x| x <= mica_core::SHORT_INT_MAX as usize / 2)
        .ok_or_else(projected_overflow)?;

    let mut out: Vec<u16> = Vec::with_capacity(projected);
    let new_units = to_units(new);
    let mut at = 0usize;
    let mut done = 0usize;
    while done < n {
        let hit = str_find(s, old, at)? as usize;
        unsafe {
            let v = view(s);
            for i in at..hit {
                out.push(v.at(i));
            }
        }
        out.extend_from_slice(&new_units);
        at = hit + lo;
        done += 1;
    }
    unsafe {
        let v = view(s);
        for i in at..ls {
            out.push(v.at(i));
        }
    }
    debug_assert_eq!(out.len(), projected);
    create_from_units(t, &out)
}

fn projected_overflow() -> RtError {
    RtError::runtime("Str replacement result too long")
}

// =============================================================================
// Splitting and joining
// =============================================================================

/// `split(s)`: fields separated by runs of ASCII whitespace, ends trimmed.
/// `split(s, sep)`: fields between occurrences of a non-empty separator.
/// `max` bounds the number of splits; the remainder stays in one piece.
pub fn str_split(
    t: &mut Thread,
    s: Value,
    sep: Option<Value>,
    max: Option<usize>,
) -> Result<Value, RtError> {
    expect_str(s)?;
    let ranges = match sep {
        None => split_whitespace_ranges(s, max),
        Some(sep) => {
            expect_str(sep)?;
            if str_len(sep) == 0 {
                return Err(RtError::value("empty separator"));
            }
            split_separator_ranges(s, sep, max)?
        }
    };

    // Build parts after the scan: the ranges are plain indices and stay
    // valid across the allocations below.
    let s_slot = t.alloc_temp();
    let arr_slot = t.alloc_temp();
    unsafe { *s_slot = s };
    let result = (|| {
        let arr = t.alloc_value_block(ranges.len(), SUB_ARRAY)?;
        unsafe { *arr_slot = arr };
        for (i, &(beg, end)) in ranges.iter().enumerate() {
            let s = unsafe { *s_slot };
            let part = create_sub_str(t, s, beg, end)?;
            let arr = unsafe { *arr_slot };
            t.set_element(arr, i, part)?;
        }
        Ok(unsafe { *arr_slot })
    })();
    t.free_temps(2);
    result
}

fn split_whitespace_ranges(s: Value, max: Option<usize>) -> Vec<(usize, usize)> {
    let len = str_len(s);
    let mut ranges = Vec::new();
    unsafe {
        let v = view(s);
        let mut i = 0usize;
        while i < len {
            while i < len && is_ascii_space(v.at(i)) {
                i += 1;
            }
            if i >= len {
                break;
            }
            if max.is_some_and(|m| ranges.len() == m) {
                // Splits exhausted: the rest is one field.
                ranges.push((i, len));
                return ranges;
            }
            let beg = i;
            while i < len && !is_ascii_space(v.at(i)) {
                i += 1;
            }
            ranges.push((beg, i));
        }
    }
    ranges
}

fn split_separator_ranges(
    s: Value,
    sep: Value,
    max: Option<usize>,
) -> Result<Vec<(usize, usize)>, RtError> {
    let len = str_len(s);
    let lsep = str_len(sep);
    let mut ranges = Vec::new();
    let mut at = 0usize;
    loop {
        if max.is_some_and(|m| ranges.len() == m) {
            ranges.push((at, len));
            return Ok(ranges);
        }
        match str_find(s, sep, at)? {
            -1 => {
                ranges.push((at, len));
                return Ok(ranges);
            }
            i => {
                ranges.push((at, i as usize));
                at = i as usize + lsep;
            }
        }
    }
}

/// `join(sep, parts)`: delegates to `concat_many` once there is anything
/// to join.
pub fn str_join(t: &mut Thread, sep: Value, parts: Value) -> Result<Value, RtError> {
    expect_str(sep)?;
    if array_len(parts) == 0 {
        return create_string(t, b"");
    }
    concat_many(t, sep, parts)
}

/// N-way concatenation of `parts` interleaved with `sep`: the total
/// length is precomputed from the parts, the representation follows the
/// participants, and the result is filled in place.
pub fn concat_many(t: &mut Thread, sep: Value, parts: Value) -> Result<Value, RtError> {
    expect_str(sep)?;
    let count = array_len(parts);
    if count == 0 {
        return create_string(t, b"");
    }

    let mut total = 0usize;
    let mut narrow = unsafe { view(sep).is_narrow() };
    for i in 0..count {
        let part = array_get(parts, i);
        expect_str(part)?;
        total = total
            .checked_add(str_len(part))
            .filter(|&x| x <= mica_core::SHORT_INT_MAX as usize / 2)
            .ok_or_else(|| RtError::runtime("Str join result too long"))?;
        narrow &= unsafe { view(part).is_narrow() };
    }
    total += str_len(sep) * (count - 1);

    let slots = t.alloc_temps(2);
    unsafe {
        *slots = sep;
        *slots.add(1) = parts;
    }
    let result = if narrow {
        alloc_narrow_uninit(t, total)
    } else {
        alloc_wide_uninit(t, total)
    };
    let (sep, parts) = unsafe { (*slots, *slots.add(1)) };
    t.free_temps(2);
    let result = result?;

    unsafe {
        let mut at = 0usize;
        for i in 0..count {
            if i > 0 {
                at += fill(result, at, view(sep), narrow);
            }
            at += fill(result, at, view(array_get(parts, i)), narrow);
        }
        debug_assert_eq!(at, total);
    }
    Ok(result)
}

/// Copy `src` into `dst` at unit offset `at`; returns the units written.
unsafe fn fill(dst: Value, at: usize, src: StrView<'_>, narrow: bool) -> usize {
    unsafe {
        if narrow {
            let d = narrow_data(dst).add(at);
            let StrView::Narrow(bytes) = src else {
                unreachable!("narrow join with wide part")
            };
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), d, bytes.len());
            bytes.len()
        } else {
            let d = wide_data(dst).add(at);
            for i in 0..src.len() {
                *d.add(i) = src.at(i);
            }
            src.len()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
