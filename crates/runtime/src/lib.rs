//! Mica string subsystem.
//!
//! The highest-traffic client of the core: a three-representation string
//! type (narrow 8-bit, wide 16-bit, substring view) with lazy widening,
//! substring sharing, the operation suite, the `{...}` format language,
//! the generic to-string contract, arbitrary-precision integer
//! stringification, and the codec registry for `encode`/`decode`.
//!
//! Every string is a garbage-collected block owned by a `mica_core`
//! runtime; functions here take the allocating `Thread` and follow the
//! core's rooting discipline (see `strings` module docs).

pub mod conv;
pub mod encodings;
pub mod format;
pub mod longint;
pub mod str_ops;
pub mod strings;
pub mod unicode;

// The operation surface, re-exported flat.
pub use conv::{float_repr, parse_int, repr, to_str};
pub use encodings::{DecodeOutcome, StrCodec, Strictness, lookup_codec, str_decode, str_encode};
pub use format::format;
pub use longint::{is_long_int, long_int_to_string, promoting_add, promoting_mul};
pub use str_ops::{
    array_get, array_len, concat_many, make_array, str_contains, str_count, str_ends_with,
    str_find, str_index, str_join, str_lower, str_replace, str_split, str_starts_with,
    str_strip, str_upper,
};
pub use strings::{
    StrView, char_at, compare_strings, concat_strings, create_string, create_string_from_utf8,
    create_sub_str, create_wide_string, equal_strings, get_c_str, get_utf8, is_narrow_str,
    is_str, is_sub_str, is_wide_str, make_ch, repeat_string, slice, str_len, string_hash_value,
};

#[cfg(test)]
pub(crate) mod testutil {
    use mica_core::{Runtime, RuntimeConfig, Thread};
    use std::sync::Arc;

    /// A fresh runtime plus an attached mutator, the fixture every string
    /// test starts from.
    pub(crate) fn runtime_and_thread() -> (Arc<Runtime>, Thread) {
        let rt = Runtime::new(RuntimeConfig::default()).expect("runtime");
        let th = rt.attach_thread();
        (rt, th)
    }
}
