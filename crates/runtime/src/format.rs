//! Format String Language
//!
//! `format(fmt, args)` interprets literal text, `{{`/`}}` escapes and
//! format sequences of the form `{[-]width:spec}`:
//!
//! - a leading digit run followed by `:` is the field width; `-` makes the
//!   field left-aligned (digits not followed by `:` are re-parsed as part
//!   of the number spec);
//! - in the spec, `0` runs give minimum integer digits, `.` starts the
//!   fraction (`0` required digits, `#` optional trailing digits that are
//!   stripped when zero), `e`/`E` switches to scientific notation with
//!   `0`s sizing the exponent and `+` forcing its sign;
//! - a non-empty spec applied to an instance with a `_format` hook hands
//!   the raw spec text to the hook instead;
//! - an empty spec falls back to the generic to-string conversion.
//!
//! Non-finite floats always render as `inf`, `-inf`, `nan`; no
//! platform-specific spellings escape.

use crate::conv::to_str;
use crate::longint::is_long_int;
use crate::str_ops::{array_get, array_len};
use crate::strings::{char_at, create_from_units, create_sub_str, expect_str, str_len, to_units};
use mica_core::block::{KIND_INSTANCE, header_kind, header_type_desc};
use mica_core::error::RtError;
use mica_core::thread::Thread;
use mica_core::value::Value;

/// Accumulated output. Native storage, so intervening allocations cannot
/// disturb it; the representation of the final string is chosen at the
/// end.
struct Output {
    units: Vec<u16>,
}

impl Output {
    fn push(&mut self, c: u16) {
        self.units.push(c);
    }

    fn push_ascii(&mut self, s: &str) {
        for b in s.bytes() {
            self.units.push(b as u16);
        }
    }

    fn append_str_value(&mut self, v: Value) {
        for u in to_units(v) {
            self.units.push(u);
        }
    }

    fn len(&self) -> usize {
        self.units.len()
    }
}

/// Format `fmt` with the value-block array `args`.
pub fn format(t: &mut Thread, fmt: Value, args: Value) -> Result<Value, RtError> {
    expect_str(fmt)?;
    let nargs = array_len(args);

    // Root the format string and argument array across every allocation
    // the conversions below may perform.
    let slots = t.alloc_temps(2);
    unsafe {
        *slots = fmt;
        *slots.add(1) = args;
    }
    let result = format_inner(t, slots, nargs);
    t.free_temps(2);
    let units = result?;
    create_from_units(t, &units)
}

fn format_inner(
    t: &mut Thread,
    slots: *mut Value,
    nargs: usize,
) -> Result<Vec<u16>, RtError> {
    let fmt = move || unsafe { *slots };

    let mut out = Output { units: Vec::new() };
    let fmt_len = str_len(fmt());
    let mut fi = 0usize;
    let mut ai = 0usize;

    while fi < fmt_len {
        let ch = char_at(fmt(), fi);
        if ch == b'{' as u16 {
            if fi == fmt_len - 1 || char_at(fmt(), fi + 1) == b'{' as u16 {
                // Literal '{'.
                fi += 1;
                out.push(ch);
            } else {
                fi += 1;
                fi = format_sequence(t, slots, &mut out, fi, fmt_len, nargs, &mut ai)?;
                continue;
            }
        } else if ch == b'}' as u16 {
            // Literal '}' may be doubled but does not need to be.
            if fi < fmt_len - 1 && char_at(fmt(), fi + 1) == b'}' as u16 {
                fi += 1;
            }
            out.push(ch);
        } else {
            out.push(ch);
        }
        fi += 1;
    }

    if ai < nargs {
        return Err(RtError::value("Too many arguments"));
    }
    Ok(out.units)
}

/// Handle one `{...}` sequence starting right after the `{`. Returns the
/// index just past the closing `}`.
fn format_sequence(
    t: &mut Thread,
    slots: *mut Value,
    out: &mut Output,
    mut fi: usize,
    fmt_len: usize,
    nargs: usize,
    ai: &mut usize,
) -> Result<usize, RtError> {
    let fmt = move || unsafe { *slots };
    let args = move || unsafe { *slots.add(1) };

    let old_ind = fi;
    let mut neg_align = false;
    let mut align = 0usize;

    // Field width: digits followed by ':'. Anything else backtracks and
    // the digits are re-parsed as number spec.
    if fi + 1 < fmt_len
        && char_at(fmt(), fi) == b'-' as u16
        && is_digit(char_at(fmt(), fi + 1))
    {
        neg_align = true;
        fi += 1;
    }
    if fi < fmt_len && is_digit(char_at(fmt(), fi)) {
        while fi < fmt_len && is_digit(char_at(fmt(), fi)) {
            align = align * 10 + (char_at(fmt(), fi) - b'0' as u16) as usize;
            fi += 1;
        }
        if fi < fmt_len && char_at(fmt(), fi) != b':' as u16 {
            fi = old_ind;
            align = 0;
        } else if fi < fmt_len {
            fi += 1;
        }
    }

    let old_out = out.len();

    if *ai >= nargs {
        return Err(RtError::value("Too few arguments"));
    }
    let arg = array_get(args(), *ai);

    let format_hook = instance_format_hook(arg);
    if format_hook.is_some() && fi < fmt_len && char_at(fmt(), fi) != b'}' as u16 {
        // Hand the raw spec text to the instance's _format hook.
        let spec_start = fi;
        while fi < fmt_len && char_at(fmt(), fi) != b'}' as u16 {
            fi += 1;
        }
        if fi >= fmt_len {
            return Err(RtError::value("Unterminated format"));
        }
        let spec = create_sub_str(t, fmt(), spec_start, fi)?;
        let hook = format_hook.unwrap();
        let converted = hook(t, arg, spec)?;
        expect_str(converted)
            .map_err(|_| RtError::type_error("_format must return a Str"))?;
        out.append_str_value(converted);
    } else {
        // Number spec (or nothing).
        let mut min_num = 0usize;
        let mut frac_len = 0usize;
        let mut opt_frac = 0usize;
        let mut exp_len = 0usize;
        let mut fraction = false;
        let mut scientific = false;
        let mut plus_exp = false;
        let mut exp_char = b'e' as u16;

        while fi < fmt_len {
            let ch = char_at(fmt(), fi);
            if ch == b'}' as u16 {
                break;
            }
            match ch {
                c if c == b'0' as u16 => {
                    if scientific {
                        exp_len += 1;
                    } else if fraction {
                        frac_len += 1;
                    } else {
                        min_num += 1;
                    }
                }
                c if c == b'.' as u16 => fraction = true,
                c if c == b'e' as u16 || c == b'E' as u16 => {
                    scientific = true;
                    exp_char = c;
                }
                c if c == b'+' as u16 && scientific => plus_exp = true,
                c if c == b'#' as u16 && fraction && !scientific => {
                    frac_len += 1;
                    opt_frac += 1;
                }
                _ => return Err(RtError::value("Invalid character in format string")),
            }
            fi += 1;
        }

        if scientific {
            number_to_scientific(t, out, arg, frac_len, exp_len, exp_char, plus_exp, opt_frac)?;
        } else if min_num > 0 || fraction {
            number_to_str(t, out, arg, min_num as isize, frac_len, opt_frac)?;
        } else {
            // Not a number spec: generic conversion.
            let s = to_str(t, arg)?;
            out.append_str_value(s);
        }
    }

    if fi >= fmt_len {
        return Err(RtError::value("Unterminated format"));
    }

    // Field alignment.
    let written = out.len() - old_out;
    if align > written {
        let pad = align - written;
        if neg_align {
            for _ in 0..pad {
                out.push(b' ' as u16);
            }
        } else {
            out.units
                .splice(old_out..old_out, std::iter::repeat_n(b' ' as u16, pad));
        }
    }

    *ai += 1;
    Ok(fi + 1)
}

#[inline]
fn is_digit(c: u16) -> bool {
    (b'0' as u16..=b'9' as u16).contains(&c)
}

fn instance_format_hook(
    v: Value,
) -> Option<fn(&mut Thread, Value, Value) -> Result<Value, RtError>> {
    if !v.is_ref() {
        return None;
    }
    unsafe {
        let header = *v.as_ptr();
        if header_kind(header) != KIND_INSTANCE {
            return None;
        }
        (*header_type_desc(header)).format_hook
    }
}

// =============================================================================
// Number formatting
// =============================================================================

/// Non-scientific number rendering: `int_len` minimum integer digits,
/// `frac_len` fraction digits of which the trailing `opt_frac` are
/// stripped when zero.
fn number_to_str(
    t: &mut Thread,
    out: &mut Output,
    num: Value,
    int_len: isize,
    frac_len: usize,
    opt_frac: usize,
) -> Result<(), RtError> {
    if num.is_short_int() || is_long_int(num) {
        let digits = to_units(to_str(t, num)?);
        let sign = (digits[0] == b'-' as u16) as usize;
        if sign == 1 {
            out.push(b'-' as u16);
        }
        let mut pad = int_len - (digits.len() - sign) as isize;
        while pad > 0 {
            out.push(b'0' as u16);
            pad -= 1;
        }
        for &d in &digits[sign..] {
            out.push(d);
        }
        if opt_frac < frac_len {
            out.push(b'.' as u16);
            for _ in 0..frac_len - opt_frac {
                out.push(b'0' as u16);
            }
        }
        return Ok(());
    }

    if !num.is_float() {
        return Err(RtError::type_error("number expected in format"));
    }
    let f = unsafe { num.float_value() };

    // Very large magnitudes switch to scientific form to bound the output.
    if f > 1e50 || f < -1e50 {
        return number_to_scientific(t, out, num, frac_len, 1, b'e' as u16, true, opt_frac);
    }
    if f.is_nan() {
        out.push_ascii("nan");
        return Ok(());
    }
    if f.is_infinite() {
        out.push_ascii(if f > 0.0 { "inf" } else { "-inf" });
        return Ok(());
    }

    let mut s: Vec<u8> = format!("{:.*}", frac_len, f).into_bytes();
    let sign = s[0] == b'-';
    if sign {
        out.push(b'-' as u16);
        s.remove(0);
    }

    if int_len > 1 {
        let is_fract = s.contains(&b'.') as isize;
        let mut int_len = int_len;
        while int_len + is_fract + frac_len as isize > s.len() as isize {
            out.push(b'0' as u16);
            int_len -= 1;
        }
    }

    let mut opt = opt_frac;
    while opt > 0 && s.last() == Some(&b'0') {
        s.pop();
        opt -= 1;
    }

    for &b in &s {
        out.push(b as u16);
    }
    Ok(())
}

/// Scientific rendering (`0.00e+00` shapes): `num_frac` fraction digits
/// (the trailing `opt_frac` stripped when zero), `exp_len` exponent
/// digits, `plus_exp` forcing a sign on non-negative exponents.
#[allow(clippy::too_many_arguments)]
fn number_to_scientific(
    t: &mut Thread,
    out: &mut Output,
    num: Value,
    num_frac: usize,
    exp_len: usize,
    exp_char: u16,
    plus_exp: bool,
    opt_frac: usize,
) -> Result<(), RtError> {
    let mut f = if num.is_short_int() {
        num.as_int() as f64
    } else if num.is_float() {
        unsafe { num.float_value() }
    } else {
        return Err(RtError::type_error("number expected in format"));
    };

    if f.is_nan() {
        out.push_ascii("nan");
        return Ok(());
    }
    if f.is_infinite() {
        out.push_ascii(if f > 0.0 { "inf" } else { "-inf" });
        return Ok(());
    }

    let sign = f < 0.0;
    if sign {
        f = -f;
    }

    // Renormalize the mantissa into [1, 10), accounting for the rounding
    // that the digit extraction below will apply.
    let mut exp = 0i64;
    if f != 0.0 {
        let max = 10.0 - 0.5 * 10f64.powi(-(num_frac as i32));
        let min = 1.0 - 0.5 * 10f64.powi(-(num_frac as i32));
        while f >= max {
            f /= 10.0;
            exp += 1;
        }
        while f < min {
            f *= 10.0;
            exp -= 1;
        }
    }

    f = (f * 10f64.powi(num_frac as i32) + 0.5).floor();

    // Extract digits least-significant first.
    let mut digits: Vec<u8> = Vec::with_capacity(num_frac + 1);
    for _ in 0..=num_frac {
        digits.push(b'0' + (f % 10.0) as u8);
        f /= 10.0;
    }

    let mut s0 = 0usize;
    let mut num_frac = num_frac;
    let mut opt = opt_frac;
    while opt > 0 && s0 < digits.len() && digits[s0] == b'0' {
        s0 += 1;
        opt -= 1;
        num_frac -= 1;
    }

    if sign {
        out.push(b'-' as u16);
    }
    out.push(digits[digits.len() - 1] as u16);
    if num_frac > 0 {
        out.push(b'.' as u16);
    }
    for i in (s0..digits.len() - 1).rev() {
        out.push(digits[i] as u16);
    }
    out.push(exp_char);
    if plus_exp && exp >= 0 {
        out.push(b'+' as u16);
    }
    number_to_str(
        t,
        out,
        Value::from_int(exp as isize),
        exp_len as isize,
        0,
        0,
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::str_ops::make_array;
    use crate::strings::create_string_from_utf8;
    use crate::testutil::runtime_and_thread;

    fn fmt(t: &mut Thread, pattern: &str, args: &[Value]) -> Result<String, RtError> {
        let f = create_string_from_utf8(t, pattern)?;
        let a = make_array(t, args)?;
        let out = format(t, f, a)?;
        Ok(to_units(out)
            .into_iter()
            .map(|u| char::from_u32(u as u32).unwrap())
            .collect())
    }

    #[test]
    fn test_literal_and_escapes() {
        let (_rt, mut th) = runtime_and_thread();
        assert_eq!(fmt(&mut th, "plain text", &[]).unwrap(), "plain text");
        assert_eq!(fmt(&mut th, "a {{b}} c", &[]).unwrap(), "a {b} c");
        assert_eq!(fmt(&mut th, "100}}", &[]).unwrap(), "100}");
        // A lone '}' passes through.
        assert_eq!(fmt(&mut th, "x}y", &[]).unwrap(), "x}y");
    }

    #[test]
    fn test_generic_conversion() {
        let (_rt, mut th) = runtime_and_thread();
        assert_eq!(
            fmt(&mut th, "v={}", &[Value::from_int(42)]).unwrap(),
            "v=42"
        );
        assert_eq!(
            fmt(&mut th, "{} and {}", &[Value::TRUE, Value::from_int(-7)]).unwrap(),
            "True and -7"
        );
    }

    #[test]
    fn test_alignment() {
        let (_rt, mut th) = runtime_and_thread();
        assert_eq!(
            fmt(&mut th, "{-5:}", &[Value::from_int(42)]).unwrap(),
            "42   "
        );
        assert_eq!(
            fmt(&mut th, "{5:}", &[Value::from_int(42)]).unwrap(),
            "   42"
        );
        // Width smaller than the content: no padding.
        assert_eq!(
            fmt(&mut th, "{1:}", &[Value::from_int(420)]).unwrap(),
            "420"
        );
    }

    #[test]
    fn test_integer_zero_padding() {
        let (_rt, mut th) = runtime_and_thread();
        assert_eq!(
            fmt(&mut th, "{000}", &[Value::from_int(7)]).unwrap(),
            "007"
        );
        assert_eq!(
            fmt(&mut th, "{000}", &[Value::from_int(-7)]).unwrap(),
            "-007"
        );
        assert_eq!(
            fmt(&mut th, "{00}", &[Value::from_int(1234)]).unwrap(),
            "1234"
        );
        // Integer with a required fraction.
        assert_eq!(
            fmt(&mut th, "{0.00}", &[Value::from_int(5)]).unwrap(),
            "5.00"
        );
    }

    #[test]
    fn test_float_fixed() {
        let (rt, mut th) = runtime_and_thread();
        let f = |t: &mut Thread, x: f64| t.make_float(x).unwrap();
        let x = f(&mut th, 3.14159);
        assert_eq!(fmt(&mut th, "{0.00}", &[x]).unwrap(), "3.14");
        let neg = f(&mut th, -2.5);
        assert_eq!(fmt(&mut th, "{0.0}", &[neg]).unwrap(), "-2.5");
        // Optional trailing digits are stripped when zero.
        let v = f(&mut th, 3.5);
        assert_eq!(fmt(&mut th, "{0.0##}", &[v]).unwrap(), "3.5");
        let w = f(&mut th, 3.125);
        assert_eq!(fmt(&mut th, "{0.0##}", &[w]).unwrap(), "3.125");
        let _ = rt;
    }

    #[test]
    fn test_non_finite_normalized() {
        let (_rt, mut th) = runtime_and_thread();
        let inf = th.make_float(f64::INFINITY).unwrap();
        let ninf = th.make_float(f64::NEG_INFINITY).unwrap();
        let nan = th.make_float(f64::NAN).unwrap();
        assert_eq!(fmt(&mut th, "{0.00}", &[inf]).unwrap(), "inf");
        assert_eq!(fmt(&mut th, "{0.00}", &[ninf]).unwrap(), "-inf");
        assert_eq!(fmt(&mut th, "{0.00}", &[nan]).unwrap(), "nan");
        assert_eq!(fmt(&mut th, "{0.0e00}", &[nan]).unwrap(), "nan");
    }

    #[test]
    fn test_scientific() {
        let (_rt, mut th) = runtime_and_thread();
        let x = th.make_float(1234.5).unwrap();
        assert_eq!(fmt(&mut th, "{0.00e00}", &[x]).unwrap(), "1.23e03");
        assert_eq!(fmt(&mut th, "{0.00e+00}", &[x]).unwrap(), "1.23e+03");
        assert_eq!(fmt(&mut th, "{0.00E00}", &[x]).unwrap(), "1.23E03");
        let small = th.make_float(0.00425).unwrap();
        assert_eq!(fmt(&mut th, "{0.0e+00}", &[small]).unwrap(), "4.3e-03");
        // Giant magnitudes fall into scientific automatically.
        let huge = th.make_float(2.0e60).unwrap();
        let rendered = fmt(&mut th, "{0.0}", &[huge]).unwrap();
        assert!(rendered.contains('e'), "expected scientific: {rendered}");
    }

    #[test]
    fn test_argument_count_checks() {
        let (_rt, mut th) = runtime_and_thread();
        assert!(matches!(
            fmt(&mut th, "{} {}", &[Value::from_int(1)]),
            Err(RtError::Value(_))
        ));
        assert!(matches!(
            fmt(&mut th, "{}", &[Value::from_int(1), Value::from_int(2)]),
            Err(RtError::Value(_))
        ));
        assert!(matches!(
            fmt(&mut th, "{0", &[Value::from_int(1)]),
            Err(RtError::Value(_))
        ));
        assert!(matches!(
            fmt(&mut th, "{q}", &[Value::from_int(1)]),
            Err(RtError::Value(_))
        ));
    }

    #[test]
    fn test_format_hook_dispatch() {
        use mica_core::TypeDesc;

        fn hook(t: &mut Thread, _obj: Value, spec: Value) -> Result<Value, RtError> {
            // Echo the spec bracketed, proving it arrived verbatim.
            let mut units = vec![b'<' as u16];
            units.extend(to_units(spec));
            units.push(b'>' as u16);
            create_from_units(t, &units)
        }

        static FMT_DESC: TypeDesc = TypeDesc {
            name: "test::Money",
            slots: 1,
            finalize_slot: 0,
            finalizer: None,
            str_hook: None,
            format_hook: Some(hook),
        };
        let (_rt, mut th) = runtime_and_thread();
        let inst = th.alloc_instance(&FMT_DESC).unwrap();

        // A non-empty spec reaches the hook verbatim.
        let out = fmt(&mut th, "{usd.2}", &[inst]).unwrap();
        assert_eq!(out, "<usd.2>");

        // An empty spec falls back to the generic conversion.
        let out = fmt(&mut th, "{}", &[inst]).unwrap();
        assert_eq!(out, "<test::Money instance>");

        // Alignment applies to hook output too.
        let out = fmt(&mut th, "{-9:x}", &[inst]).unwrap();
        assert_eq!(out, "<x>      ");
    }
}
