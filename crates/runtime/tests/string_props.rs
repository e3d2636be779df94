//! String subsystem properties: the concrete conversion scenarios and the
//! representation-independence, round-trip and ordering laws.

use mica_core::value::Value;
use mica_core::{Runtime, RuntimeConfig, Thread};
use mica_runtime::encodings::Strictness;
use mica_runtime::*;
use quickcheck_macros::quickcheck;
use std::sync::Arc;

fn fixture() -> (Arc<Runtime>, Thread) {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let th = rt.attach_thread();
    (rt, th)
}

fn text(v: Value) -> String {
    (0..str_len(v))
        .map(|i| char::from_u32(char_at(v, i) as u32).unwrap())
        .collect()
}

fn fmt1(t: &mut Thread, pattern: &str, arg: Value) -> String {
    let f = create_string_from_utf8(t, pattern).unwrap();
    let a = make_array(t, &[arg]).unwrap();
    text(format(t, f, a).unwrap())
}

// =============================================================================
// Concrete scenarios
// =============================================================================

#[test]
fn concat_hi_world_is_wide() {
    let (_rt, mut th) = fixture();
    let a = create_string_from_utf8(&mut th, "hi ").unwrap();
    let b = create_string_from_utf8(&mut th, "世界").unwrap();
    let c = concat_strings(&mut th, a, b).unwrap();
    assert!(is_wide_str(c));
    assert_eq!(str_len(c), 5);
    let expected = [0x68u16, 0x69, 0x20, 0x4e16, 0x754c];
    for (i, &e) in expected.iter().enumerate() {
        assert_eq!(char_at(c, i), e);
    }
}

#[test]
fn format_field_alignment() {
    let (_rt, mut th) = fixture();
    assert_eq!(fmt1(&mut th, "{-5:}", Value::from_int(42)), "42   ");
    assert_eq!(fmt1(&mut th, "{5:}", Value::from_int(42)), "   42");
}

#[test]
fn split_scenarios() {
    let (_rt, mut th) = fixture();

    let ws = create_string_from_utf8(&mut th, "  a   b c  ").unwrap();
    let parts = str_split(&mut th, ws, None, None).unwrap();
    assert_eq!(array_len(parts), 3);
    assert_eq!(text(array_get(parts, 0)), "a");
    assert_eq!(text(array_get(parts, 1)), "b");
    assert_eq!(text(array_get(parts, 2)), "c");

    let comma = create_string_from_utf8(&mut th, ",").unwrap();
    let s = create_string_from_utf8(&mut th, "a,,b").unwrap();
    let parts = str_split(&mut th, s, Some(comma), None).unwrap();
    assert_eq!(array_len(parts), 3);
    assert_eq!(text(array_get(parts, 0)), "a");
    assert_eq!(text(array_get(parts, 1)), "");
    assert_eq!(text(array_get(parts, 2)), "b");

    let empty = create_string_from_utf8(&mut th, "").unwrap();
    let parts = str_split(&mut th, empty, Some(comma), None).unwrap();
    assert_eq!(array_len(parts), 1);
    assert_eq!(text(array_get(parts, 0)), "");

    let empty_sep = create_string_from_utf8(&mut th, "").unwrap();
    assert!(str_split(&mut th, s, Some(empty_sep), None).is_err());
}

#[test]
fn replace_scenario() {
    let (_rt, mut th) = fixture();
    let s = create_string_from_utf8(&mut th, "aaa").unwrap();
    let a = create_string_from_utf8(&mut th, "a").unwrap();
    let bb = create_string_from_utf8(&mut th, "bb").unwrap();
    let r = str_replace(&mut th, s, a, bb, Some(2)).unwrap();
    assert_eq!(text(r), "bbbba");
}

#[test]
fn strings_cooperate_with_the_collector() {
    // Heavier than the unit tests: enough string traffic to force young
    // collections and retirement while a rooted structure stays correct.
    let (rt, mut th) = fixture();
    let root = th.alloc_temp();
    let mut acc = create_string_from_utf8(&mut th, "seed").unwrap();
    unsafe { *root = acc };
    for i in 0..200 {
        let piece = create_string_from_utf8(&mut th, &format!("-{i}")).unwrap();
        acc = unsafe { *root };
        let joined = concat_strings(&mut th, acc, piece).unwrap();
        unsafe { *root = joined };
    }
    rt.collect_all_garbage().unwrap();
    let survivor = unsafe { *root };
    let s = text(survivor);
    assert!(s.starts_with("seed-0-1-2"));
    assert!(s.ends_with("-198-199"));
    assert_eq!(str_len(survivor), 4 + (0..200).map(|i| format!("-{i}").len()).sum::<usize>());
    th.free_temp();
}

// =============================================================================
// Round-trip and algebraic laws
// =============================================================================

#[quickcheck]
fn prop_encode_decode_roundtrip_ascii(data: String) -> bool {
    let ascii: String = data.chars().filter(|c| c.is_ascii_graphic() || *c == ' ').collect();
    let (_rt, mut th) = fixture();
    let s = create_string_from_utf8(&mut th, &ascii).unwrap();
    ["utf8", "latin1", "ascii", "base64", "hex"].iter().all(|&enc| {
        let e = str_encode(&mut th, s, enc, Strictness::Strict).unwrap();
        let d = str_decode(&mut th, e, enc, Strictness::Strict).unwrap();
        equal_strings(s, d).unwrap()
    })
}

#[quickcheck]
fn prop_concat_slice_roundtrip(a: String, b: String) -> bool {
    let a: String = a.chars().filter(char::is_ascii).collect();
    let b: String = b.chars().filter(char::is_ascii).collect();
    let (_rt, mut th) = fixture();
    let va = create_string_from_utf8(&mut th, &a).unwrap();
    let vb = create_string_from_utf8(&mut th, &b).unwrap();
    let c = concat_strings(&mut th, va, vb).unwrap();
    if str_len(c) != a.len() + b.len() {
        return false;
    }
    let la = a.len() as isize;
    let lb = b.len() as isize;
    let sa = slice(&mut th, c, 0, la).unwrap();
    let sb = slice(&mut th, c, la, la + lb).unwrap();
    equal_strings(va, sa).unwrap() && equal_strings(vb, sb).unwrap()
}

#[quickcheck]
fn prop_split_join_roundtrip(parts: Vec<String>) -> bool {
    // Constrain to the law's premises: a non-empty separator that occurs
    // in no element, and non-degenerate parts.
    let parts: Vec<String> = parts
        .into_iter()
        .map(|p| p.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
        .collect();
    if parts.is_empty() {
        return true;
    }
    let (_rt, mut th) = fixture();
    let sep = create_string_from_utf8(&mut th, "|").unwrap();

    let values: Vec<Value> = parts
        .iter()
        .map(|p| create_string_from_utf8(&mut th, p).unwrap())
        .collect();
    let arr = make_array(&mut th, &values).unwrap();
    let joined = str_join(&mut th, sep, arr).unwrap();
    let back = str_split(&mut th, joined, Some(sep), None).unwrap();

    if array_len(back) != parts.len() {
        return false;
    }
    (0..parts.len()).all(|i| text(array_get(back, i)) == parts[i])
}

#[quickcheck]
fn prop_str_parse_roundtrip(n: i64) -> bool {
    let (_rt, mut th) = fixture();
    let v = Value::from_int((n % (1 << 40)) as isize);
    let s = to_str(&mut th, v).unwrap();
    parse_int(&mut th, s).unwrap() == v
}

#[quickcheck]
fn prop_compare_total_order(a: String, b: String, c: String) -> bool {
    use std::cmp::Ordering;
    let clean = |s: String| -> String { s.chars().filter(char::is_ascii).collect() };
    let (a, b, c) = (clean(a), clean(b), clean(c));
    let (_rt, mut th) = fixture();
    let va = create_string_from_utf8(&mut th, &a).unwrap();
    let vb = create_string_from_utf8(&mut th, &b).unwrap();
    let vc = create_string_from_utf8(&mut th, &c).unwrap();

    let ab = compare_strings(va, vb).unwrap();
    let ba = compare_strings(vb, va).unwrap();
    let bc = compare_strings(vb, vc).unwrap();
    let ac = compare_strings(va, vc).unwrap();

    // Antisymmetry, consistency with equality, transitivity.
    if ab != ba.reverse() {
        return false;
    }
    if (ab == Ordering::Equal) != equal_strings(va, vb).unwrap() {
        return false;
    }
    if ab == Ordering::Less && bc == Ordering::Less && ac != Ordering::Less {
        return false;
    }
    ab == a.encode_utf16().cmp(b.encode_utf16())
}

#[quickcheck]
fn prop_equal_strings_hash_equal(s: String) -> bool {
    let s: String = s.chars().filter(char::is_ascii).collect();
    let (_rt, mut th) = fixture();
    let narrow = create_string_from_utf8(&mut th, &s).unwrap();
    let units: Vec<u16> = s.encode_utf16().collect();
    let wide = create_wide_string(&mut th, &units).unwrap();
    string_hash_value(narrow).unwrap() == string_hash_value(wide).unwrap()
}

#[quickcheck]
fn prop_upper_lower_ascii_agree_with_std(s: String) -> bool {
    let s: String = s.chars().filter(char::is_ascii).collect();
    let (_rt, mut th) = fixture();
    let v = create_string_from_utf8(&mut th, &s).unwrap();
    let up = str_upper(&mut th, v).unwrap();
    let low = str_lower(&mut th, v).unwrap();
    text(up) == s.to_ascii_uppercase() && text(low) == s.to_ascii_lowercase()
}
