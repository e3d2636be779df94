//! Codecs
//!
//! `encode`/`decode` delegate to codec objects behind the `StrCodec`
//! contract. Decoding must stop on a complete character and surface any
//! partial input through the `unprocessed` count; the string-level
//! operation then either fails (strict) or appends U+FFFD (lax).
//!
//! Character codecs: `utf8`, `latin1`, `ascii`. Binary codecs riding the
//! same contract: `base64` and `hex`.

use crate::strings::{StrView, create_from_units, create_string, expect_str, to_units, view};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mica_core::error::RtError;
use mica_core::thread::Thread;
use mica_core::value::Value;

/// Error handling mode for codec operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Invalid or partial input is an error.
    Strict,
    /// Invalid input becomes U+FFFD (decoding) or `?` (encoding).
    Lax,
}

/// The replacement character appended for undecodable input in lax mode.
pub const REPLACEMENT: u16 = 0xfffd;

/// Result of a codec decode: the produced units and how many trailing
/// input bytes were left unprocessed (an incomplete final character).
pub struct DecodeOutcome {
    pub units: Vec<u16>,
    pub unprocessed: usize,
}

/// A character (or binary) codec.
pub trait StrCodec: Sync {
    fn name(&self) -> &'static str;

    /// Encode 16-bit units into bytes.
    fn encode(&self, units: &[u16], strictness: Strictness) -> Result<Vec<u8>, RtError>;

    /// Decode bytes into 16-bit units. Must consume only complete
    /// characters, reporting an incomplete tail via `unprocessed`.
    fn decode(&self, bytes: &[u8], strictness: Strictness) -> Result<DecodeOutcome, RtError>;
}

/// Find a codec by name.
pub fn lookup_codec(name: &str) -> Option<&'static dyn StrCodec> {
    match name.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Some(&Utf8),
        "latin1" | "latin-1" | "iso-8859-1" => Some(&Latin1),
        "ascii" => Some(&Ascii),
        "base64" => Some(&Base64Codec),
        "hex" => Some(&HexCodec),
        _ => None,
    }
}

/// `encode(s, encoding[, strictness])`: a narrow byte string.
pub fn str_encode(
    t: &mut Thread,
    s: Value,
    encoding: &str,
    strictness: Strictness,
) -> Result<Value, RtError> {
    expect_str(s)?;
    let codec =
        lookup_codec(encoding).ok_or_else(|| RtError::value(format!("unknown encoding {encoding:?}")))?;
    let units = to_units(s);
    let bytes = codec.encode(&units, strictness)?;
    create_string(t, &bytes)
}

/// `decode(s, encoding[, strictness])`: strict mode turns a partial final
/// character into a decode failure, lax mode appends U+FFFD.
pub fn str_decode(
    t: &mut Thread,
    s: Value,
    encoding: &str,
    strictness: Strictness,
) -> Result<Value, RtError> {
    expect_str(s)?;
    let codec =
        lookup_codec(encoding).ok_or_else(|| RtError::value(format!("unknown encoding {encoding:?}")))?;
    let bytes = byte_contents(s)?;
    let mut outcome = codec.decode(&bytes, strictness)?;
    if outcome.unprocessed > 0 {
        match strictness {
            Strictness::Strict => {
                return Err(RtError::decode("truncated character at end of input"));
            }
            Strictness::Lax => outcome.units.push(REPLACEMENT),
        }
    }
    create_from_units(t, &outcome.units)
}

/// The raw bytes of a narrow (or narrow-substring) string.
fn byte_contents(s: Value) -> Result<Vec<u8>, RtError> {
    unsafe {
        match view(s) {
            StrView::Narrow(b) => Ok(b.to_vec()),
            StrView::Wide(_) => Err(RtError::value("byte string expected")),
        }
    }
}

// =============================================================================
// UTF-8
// =============================================================================

struct Utf8;

impl StrCodec for Utf8 {
    fn name(&self) -> &'static str {
        "utf8"
    }

    fn encode(&self, units: &[u16], _strictness: Strictness) -> Result<Vec<u8>, RtError> {
        let mut out = Vec::with_capacity(units.len());
        for &c in units {
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

    fn decode(&self, bytes: &[u8], strictness: Strictness) -> Result<DecodeOutcome, RtError> {
        let mut units = Vec::with_capacity(bytes.len());
        let mut i = 0usize;
        while i < bytes.len() {
            let b = bytes[i];
            let need = if b < 0x80 {
                0
            } else if b & 0xe0 == 0xc0 {
                1
            } else if b & 0xf0 == 0xe0 {
                2
            } else {
                // Continuation byte out of place, or a sequence for a code
                // point beyond the 16-bit range.
                match strictness {
                    Strictness::Strict => {
                        return Err(RtError::decode(format!(
                            "invalid byte 0x{b:02x} at offset {i}"
                        )));
                    }
                    Strictness::Lax => {
                        units.push(REPLACEMENT);
                        i += 1;
                        continue;
                    }
                }
            };
            if i + need >= bytes.len() {
                // Incomplete final character: leave it unprocessed.
                return Ok(DecodeOutcome {
                    units,
                    unprocessed: bytes.len() - i,
                });
            }
            let mut code: u32 = match need {
                0 => b as u32,
                1 => (b & 0x1f) as u32,
                _ => (b & 0x0f) as u32,
            };
            let mut valid = true;
            for k in 1..=need {
                let c = bytes[i + k];
                if c & 0xc0 != 0x80 {
                    valid = false;
                    break;
                }
                code = (code << 6) | (c & 0x3f) as u32;
            }
            // Overlong forms decode below the minimum for their length.
            if valid && need == 1 && code < 0x80 {
                valid = false;
            }
            if valid && need == 2 && code < 0x800 {
                valid = false;
            }
            if !valid {
                match strictness {
                    Strictness::Strict => {
                        return Err(RtError::decode(format!(
                            "invalid sequence at offset {i}"
                        )));
                    }
                    Strictness::Lax => {
                        units.push(REPLACEMENT);
                        i += 1;
                        continue;
                    }
                }
            }
            units.push(code as u16);
            i += need + 1;
        }
        Ok(DecodeOutcome {
            units,
            unprocessed: 0,
        })
    }
}

// =============================================================================
// Latin-1 and ASCII
// =============================================================================

struct Latin1;

impl StrCodec for Latin1 {
    fn name(&self) -> &'static str {
        "latin1"
    }

    fn encode(&self, units: &[u16], strictness: Strictness) -> Result<Vec<u8>, RtError> {
        let mut out = Vec::with_capacity(units.len());
        for (i, &c) in units.iter().enumerate() {
            if c <= 0xff {
                out.push(c as u8);
            } else {
                match strictness {
                    Strictness::Strict => {
                        return Err(RtError::encode(format!(
                            "character U+{c:04X} at index {i} not in latin-1"
                        )));
                    }
                    Strictness::Lax => out.push(b'?'),
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], _strictness: Strictness) -> Result<DecodeOutcome, RtError> {
        Ok(DecodeOutcome {
            units: bytes.iter().map(|&b| b as u16).collect(),
            unprocessed: 0,
        })
    }
}

struct Ascii;

impl StrCodec for Ascii {
    fn name(&self) -> &'static str {
        "ascii"
    }

    fn encode(&self, units: &[u16], strictness: Strictness) -> Result<Vec<u8>, RtError> {
        let mut out = Vec::with_capacity(units.len());
        for (i, &c) in units.iter().enumerate() {
            if c <= 0x7f {
                out.push(c as u8);
            } else {
                match strictness {
                    Strictness::Strict => {
                        return Err(RtError::encode(format!(
                            "character U+{c:04X} at index {i} not in ascii"
                        )));
                    }
                    Strictness::Lax => out.push(b'?'),
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], strictness: Strictness) -> Result<DecodeOutcome, RtError> {
        let mut units = Vec::with_capacity(bytes.len());
        for (i, &b) in bytes.iter().enumerate() {
            if b <= 0x7f {
                units.push(b as u16);
            } else {
                match strictness {
                    Strictness::Strict => {
                        return Err(RtError::decode(format!(
                            "invalid byte 0x{b:02x} at offset {i}"
                        )));
                    }
                    Strictness::Lax => units.push(REPLACEMENT),
                }
            }
        }
        Ok(DecodeOutcome {
            units,
            unprocessed: 0,
        })
    }
}

// =============================================================================
// Binary codecs
// =============================================================================

struct Base64Codec;

impl StrCodec for Base64Codec {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn encode(&self, units: &[u16], strictness: Strictness) -> Result<Vec<u8>, RtError> {
        let bytes = narrow_bytes(units, strictness)?;
        Ok(BASE64.encode(bytes).into_bytes())
    }

    fn decode(&self, bytes: &[u8], _strictness: Strictness) -> Result<DecodeOutcome, RtError> {
        let decoded = BASE64
            .decode(bytes)
            .map_err(|e| RtError::decode(format!("base64: {e}")))?;
        Ok(DecodeOutcome {
            units: decoded.iter().map(|&b| b as u16).collect(),
            unprocessed: 0,
        })
    }
}

struct HexCodec;

impl StrCodec for HexCodec {
    fn name(&self) -> &'static str {
        "hex"
    }

    fn encode(&self, units: &[u16], strictness: Strictness) -> Result<Vec<u8>, RtError> {
        let bytes = narrow_bytes(units, strictness)?;
        Ok(hex::encode(bytes).into_bytes())
    }

    fn decode(&self, bytes: &[u8], _strictness: Strictness) -> Result<DecodeOutcome, RtError> {
        let text =
            std::str::from_utf8(bytes).map_err(|_| RtError::decode("hex: non-ascii input"))?;
        let decoded = hex::decode(text).map_err(|e| RtError::decode(format!("hex: {e}")))?;
        Ok(DecodeOutcome {
            units: decoded.iter().map(|&b| b as u16).collect(),
            unprocessed: 0,
        })
    }
}

/// Binary codecs operate on byte strings; wide units have no byte value.
fn narrow_bytes(units: &[u16], strictness: Strictness) -> Result<Vec<u8>, RtError> {
    let mut out = Vec::with_capacity(units.len());
    for (i, &c) in units.iter().enumerate() {
        if c <= 0xff {
            out.push(c as u8);
        } else {
            match strictness {
                Strictness::Strict => {
                    return Err(RtError::encode(format!(
                        "character U+{c:04X} at index {i} is not a byte"
                    )));
                }
                Strictness::Lax => out.push(b'?'),
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::{create_string_from_utf8, equal_strings, is_narrow_str, str_len};
    use crate::testutil::runtime_and_thread;

    fn text(v: Value) -> String {
        to_units(v)
            .into_iter()
            .map(|u| char::from_u32(u as u32).unwrap())
            .collect()
    }

    #[test]
    fn test_utf8_roundtrip() {
        let (_rt, mut th) = runtime_and_thread();
        for sample in ["plain ascii", "café", "Ψυχή", "mixed 東京 text"] {
            let s = create_string_from_utf8(&mut th, sample).unwrap();
            let enc = str_encode(&mut th, s, "utf8", Strictness::Strict).unwrap();
            assert!(is_narrow_str(enc));
            let dec = str_decode(&mut th, enc, "utf8", Strictness::Strict).unwrap();
            assert!(equal_strings(s, dec).unwrap(), "roundtrip failed: {sample}");
        }
    }

    #[test]
    fn test_utf8_invalid_strict_vs_lax() {
        let (_rt, mut th) = runtime_and_thread();
        let bad = create_string(&mut th, &[b'a', 0xff, b'b']).unwrap();
        assert!(matches!(
            str_decode(&mut th, bad, "utf8", Strictness::Strict),
            Err(RtError::Decode(_))
        ));
        let lax = str_decode(&mut th, bad, "utf8", Strictness::Lax).unwrap();
        assert_eq!(to_units(lax), vec![b'a' as u16, REPLACEMENT, b'b' as u16]);
    }

    #[test]
    fn test_utf8_partial_tail() {
        let (_rt, mut th) = runtime_and_thread();
        // 0xc3 starts a two-byte sequence that never finishes.
        let partial = create_string(&mut th, &[b'o', b'k', 0xc3]).unwrap();
        assert!(matches!(
            str_decode(&mut th, partial, "utf8", Strictness::Strict),
            Err(RtError::Decode(_))
        ));
        let lax = str_decode(&mut th, partial, "utf8", Strictness::Lax).unwrap();
        assert_eq!(
            to_units(lax),
            vec![b'o' as u16, b'k' as u16, REPLACEMENT]
        );
    }

    #[test]
    fn test_latin1() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string_from_utf8(&mut th, "café").unwrap();
        let enc = str_encode(&mut th, s, "latin1", Strictness::Strict).unwrap();
        assert_eq!(str_len(enc), 4);
        let dec = str_decode(&mut th, enc, "latin-1", Strictness::Strict).unwrap();
        assert!(equal_strings(s, dec).unwrap());

        let cjk = create_string_from_utf8(&mut th, "東").unwrap();
        assert!(matches!(
            str_encode(&mut th, cjk, "latin1", Strictness::Strict),
            Err(RtError::Encode(_))
        ));
        let lax = str_encode(&mut th, cjk, "latin1", Strictness::Lax).unwrap();
        assert_eq!(text(lax), "?");
    }

    #[test]
    fn test_ascii() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string_from_utf8(&mut th, "abc").unwrap();
        let enc = str_encode(&mut th, s, "ascii", Strictness::Strict).unwrap();
        assert_eq!(text(enc), "abc");

        let high = create_string(&mut th, &[0x80]).unwrap();
        assert!(str_decode(&mut th, high, "ascii", Strictness::Strict).is_err());
        let lax = str_decode(&mut th, high, "ascii", Strictness::Lax).unwrap();
        assert_eq!(to_units(lax), vec![REPLACEMENT]);
    }

    #[test]
    fn test_base64_and_hex() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string(&mut th, b"binary\x00data\xff").unwrap();

        let b64 = str_encode(&mut th, s, "base64", Strictness::Strict).unwrap();
        let back = str_decode(&mut th, b64, "base64", Strictness::Strict).unwrap();
        assert!(equal_strings(s, back).unwrap());

        let hexed = str_encode(&mut th, s, "hex", Strictness::Strict).unwrap();
        assert_eq!(text(hexed), "62696e6172790064617461ff");
        let back = str_decode(&mut th, hexed, "hex", Strictness::Strict).unwrap();
        assert!(equal_strings(s, back).unwrap());

        let junk = create_string(&mut th, b"zz!").unwrap();
        assert!(str_decode(&mut th, junk, "hex", Strictness::Strict).is_err());
        assert!(str_decode(&mut th, junk, "base64", Strictness::Strict).is_err());
    }

    #[test]
    fn test_unknown_encoding() {
        let (_rt, mut th) = runtime_and_thread();
        let s = create_string(&mut th, b"x").unwrap();
        assert!(matches!(
            str_encode(&mut th, s, "ebcdic", Strictness::Strict),
            Err(RtError::Value(_))
        ));
    }

    #[test]
    fn test_decode_rejects_wide_input() {
        let (_rt, mut th) = runtime_and_thread();
        let w = crate::strings::create_wide_string(&mut th, &[0x4e16]).unwrap();
        assert!(str_decode(&mut th, w, "utf8", Strictness::Strict).is_err());
    }
}
