//! Mica core runtime: the memory system of a dynamically-typed,
//! class-based scripting language.
//!
//! Key pieces:
//! - `value`: one-word tagged values (short ints, object references, boxed
//!   floats, constants)
//! - `heap` / `freelist` / `regions`: a segregated-free-list old generation
//!   over OS-backed chunks
//! - `nursery`: per-thread bump allocation for young objects
//! - `gc`: copying young collection plus incremental mark-sweep for the
//!   old generation, with write barriers in `barrier`
//! - `thread` / `runtime`: per-thread mutator state, stop-the-world
//!   coordination, and the `Runtime` value that owns everything
//!
//! The interpreter, compiler and standard library sit on top of this crate
//! and talk to it exclusively through `Runtime`, `Thread` and `Value`.

pub mod barrier;
pub mod bitmap;
pub mod block;
pub mod config;
pub mod error;
pub mod finalize;
pub mod floats;
pub mod freelist;
pub mod gc;
pub mod heap;
pub mod idhash;
pub mod nursery;
pub mod regions;
pub mod report;
pub mod runtime;
pub mod thread;
pub mod value;
pub mod verify;

// Re-export the surface non-core components program against.
pub use barrier::{modify_object, modify_old_gen};
pub use block::{
    SUB_ARRAY, SUB_BYTES, SUB_LONG_INT, SUB_NARROW_STR, SUB_SUBSTR, SUB_WIDE_STR, TypeDesc,
    is_instance, is_mixed_value,
};
pub use config::RuntimeConfig;
pub use error::RtError;
pub use gc::GcState;
pub use heap::{alloc_static, free_static, grow_static};
pub use report::GcStats;
pub use runtime::Runtime;
pub use thread::{Thread, ThreadCtx};
pub use value::{SHORT_INT_MAX, SHORT_INT_MIN, Value};
