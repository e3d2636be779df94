//! Generic String Conversion
//!
//! `to_str(x)` renders any value:
//! - short integer: base-10, minus sign for negatives, no leading zeros;
//! - string: identity;
//! - instance: the class's `_str` hook, which must return a string, or
//!   `<TYPENAME instance>` when the class declares none;
//! - float: 10 significant digits, non-finite spellings normalized to
//!   `inf`/`-inf`/`nan`;
//! - arbitrary-precision integer: base-10 by division;
//! - constant: its registered symbol name;
//! - everything else defers to `repr`.
//!
//! `parse_int` recovers integers from their `to_str` rendering (the
//! round-trip contract for short ints).

use crate::longint::{is_long_int, long_int_from_i128, long_int_to_string};
use crate::strings::{create_string, create_string_from_utf8, expect_str, is_str, to_units};
use mica_core::block::{KIND_INSTANCE, header_kind, header_type_desc};
use mica_core::error::RtError;
use mica_core::thread::Thread;
use mica_core::value::Value;

/// The generic to-string contract.
pub fn to_str(t: &mut Thread, v: Value) -> Result<Value, RtError> {
    if v.is_short_int() {
        return create_string(t, v.as_int().to_string().as_bytes());
    }
    if v.is_float() {
        let f = unsafe { v.float_value() };
        return create_string(t, float_repr(f).as_bytes());
    }
    if v.is_constant() {
        let name = t.runtime().clone().constant_name(v);
        return match name {
            Some(name) => create_string_from_utf8(t, name),
            None => create_string(t, b"<constant>"),
        };
    }
    // References.
    if is_str(v) {
        return Ok(v);
    }
    if is_long_int(v) {
        return long_int_to_string(t, v);
    }
    let header = unsafe { *v.as_ptr() };
    if header_kind(header) == KIND_INSTANCE {
        let desc = unsafe { &*header_type_desc(header) };
        return match desc.str_hook {
            Some(hook) => {
                let s = hook(t, v)?;
                expect_str(s).map_err(|_| RtError::type_error("_str must return a Str"))?;
                Ok(s)
            }
            None => {
                let text = format!("<{} instance>", desc.name);
                create_string_from_utf8(t, &text)
            }
        };
    }
    repr(t, v)
}

/// Minimal repr: strings are quoted with escapes, everything else falls
/// back to the generic conversion.
pub fn repr(t: &mut Thread, v: Value) -> Result<Value, RtError> {
    if is_str(v) {
        let mut units: Vec<u16> = vec![b'"' as u16];
        for u in to_units(v) {
            match u {
                0x22 | 0x5c => {
                    units.push(b'\\' as u16);
                    units.push(u);
                }
                0x0a => {
                    units.push(b'\\' as u16);
                    units.push(b'n' as u16);
                }
                0x09 => {
                    units.push(b'\\' as u16);
                    units.push(b't' as u16);
                }
                _ => units.push(u),
            }
        }
        units.push(b'"' as u16);
        return crate::strings::create_from_units(t, &units);
    }
    if v.is_ref() {
        return create_string(t, b"<object>");
    }
    to_str(t, v)
}

/// Render a float with 10 significant digits, `%g`-style: fixed notation
/// for moderate exponents, scientific otherwise, trailing zeros stripped.
pub fn float_repr(f: f64) -> String {
    const SIG: i32 = 10;

    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let exp = f.abs().log10().floor() as i32;
    if (-4..SIG).contains(&exp) {
        let decimals = (SIG - 1 - exp).max(0) as usize;
        let mut s = format!("{:.*}", decimals, f);
        if s.contains('.') {
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        s
    } else {
        let mut mantissa = format!("{:.*e}", (SIG - 1) as usize, f);
        // Rust renders "1.234000000e20"; normalize to "1.234e+20".
        let epos = mantissa.find('e').expect("exponent in scientific form");
        let exp_part: i32 = mantissa[epos + 1..].parse().expect("numeric exponent");
        mantissa.truncate(epos);
        while mantissa.ends_with('0') {
            mantissa.pop();
        }
        if mantissa.ends_with('.') {
            mantissa.pop();
        }
        if exp_part >= 0 {
            format!("{}e+{:02}", mantissa, exp_part)
        } else {
            format!("{}e-{:02}", mantissa, -exp_part)
        }
    }
}

/// Parse a decimal integer (optional sign). Values outside the short-int
/// range come back as long ints.
pub fn parse_int(t: &mut Thread, s: Value) -> Result<Value, RtError> {
    expect_str(s)?;
    let units = to_units(s);
    let mut i = 0usize;
    let mut negative = false;
    if i < units.len() && (units[i] == b'-' as u16 || units[i] == b'+' as u16) {
        negative = units[i] == b'-' as u16;
        i += 1;
    }
    if i >= units.len() {
        return Err(RtError::value("invalid integer literal"));
    }
    let mut acc: i128 = 0;
    let mut overflow = false;
    for &u in &units[i..] {
        if !(b'0' as u16..=b'9' as u16).contains(&u) {
            return Err(RtError::value("invalid integer literal"));
        }
        acc = match acc
            .checked_mul(10)
            .and_then(|a| a.checked_add((u - b'0' as u16) as i128))
        {
            Some(a) => a,
            None => {
                overflow = true;
                break;
            }
        };
    }
    if overflow {
        return Err(RtError::value("integer literal too long"));
    }
    let signed = if negative { -acc } else { acc };
    if let Ok(small) = isize::try_from(signed) {
        if let Some(v) = Value::try_from_int(small) {
            return Ok(v);
        }
    }
    long_int_from_i128(t, signed)
}
