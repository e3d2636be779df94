//! Write Barriers
//!
//! Every store of a value into a heap object goes through `modify_object`
//! (or `modify_old_gen` when the destination is known to be old). The
//! barrier maintains two structures:
//!
//! - the **remembered set**: per-thread `(slot, value)` pairs recording
//!   young references written into old objects, used as extra roots by the
//!   young collector;
//! - the **untraced list**: per-thread gray values shaded when a store
//!   would hide an unmarked object from an in-progress incremental mark.
//!
//! The barrier re-reads the destination header through the supplied
//! pointer after deciding the value is a reference: a young destination
//! may have been promoted by a collection between the caller's last look
//! and this store, and the stale answer would lose the remembered-set
//! entry.
//!
//! In every path the store is performed last, so a barrier log entry is
//! published before the new value is observable through the object graph.

use crate::block::is_young_header;
use crate::error::RtError;
use crate::gc::GcState;
use crate::runtime::Runtime;
use crate::thread::ThreadCtx;
use crate::value::Value;

/// Store `new_val` into `*slot`, where `slot` is a value slot of the object
/// whose header word is at `dest_header`.
///
/// # Safety
/// `dest_header` must point at the header of a live object containing
/// `slot`; `slot` must be a valid value slot; `new_val`, if a reference,
/// must be reachable from a root (so an interleaved collection cannot
/// reclaim it).
#[inline]
pub unsafe fn modify_object(
    rt: &Runtime,
    t: &mut ThreadCtx,
    dest_header: *const usize,
    slot: *mut Value,
    new_val: Value,
) -> Result<(), RtError> {
    if new_val.is_gc_inert() {
        unsafe { *slot = new_val };
        return Ok(());
    }
    // Re-check: the destination may have been promoted since the caller
    // looked at it.
    if is_young_header(unsafe { *dest_header }) {
        unsafe { *slot = new_val };
        return Ok(());
    }
    unsafe { record_and_store(rt, t, slot, new_val) }
}

/// Store into a slot of an object known to be in the old generation.
///
/// # Safety
/// As for `modify_object`.
#[inline]
pub unsafe fn modify_old_gen(
    rt: &Runtime,
    t: &mut ThreadCtx,
    slot: *mut Value,
    new_val: Value,
) -> Result<(), RtError> {
    if new_val.is_gc_inert() {
        unsafe { *slot = new_val };
        return Ok(());
    }
    unsafe { record_and_store(rt, t, slot, new_val) }
}

/// Old destination, non-inert value: log what the collectors need, then
/// store.
unsafe fn record_and_store(
    rt: &Runtime,
    t: &mut ThreadCtx,
    slot: *mut Value,
    new_val: Value,
) -> Result<(), RtError> {
    let shared = rt.shared();
    let addr = new_val.referent_addr();

    let referent_young = if new_val.is_float() {
        // Float cells have no header; nursery membership decides.
        shared.in_nursery(addr)
    } else {
        is_young_header(unsafe { *(addr as *const usize) })
    };

    if referent_young {
        // Old → young: remember the slot for the next young collection.
        reserve_one(&mut t.new_refs)?;
        t.new_refs.push((slot as usize, new_val));
        unsafe { *slot = new_val };
        return Ok(());
    }

    if matches!(shared.gc_state(), GcState::Mark | GcState::MarkExe) && !shared.is_marked(addr) {
        // Shade white → gray so the incremental mark cannot lose the
        // referent behind this store.
        reserve_one(&mut t.untraced)?;
        t.untraced.push(new_val);
        unsafe { *slot = new_val };
        return Ok(());
    }

    unsafe { *slot = new_val };
    Ok(())
}

/// Grow a barrier log by at least one entry, surfacing allocation failure
/// as a memory error instead of aborting.
#[inline]
fn reserve_one<T>(list: &mut Vec<T>) -> Result<(), RtError> {
    if list.len() == list.capacity() {
        list.try_reserve(list.capacity().max(64))
            .map_err(|_| RtError::Memory)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{SUB_ARRAY, value_slots};
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    #[test]
    fn test_barrier_paths() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let mut th = rt.attach_thread();

        // A young array and an old (unmovable) array.
        let young = rt.alloc_value_block(&mut th, 4, SUB_ARRAY).unwrap();
        let old = rt.alloc_value_block_unmovable(4, SUB_ARRAY).unwrap();

        unsafe {
            let young_hdr = young.as_ptr();
            let old_hdr = old.as_ptr();

            // Inert store into an old object: no log entries.
            modify_object(
                &rt,
                &mut th,
                old_hdr,
                value_slots(old_hdr),
                Value::from_int(5),
            )
            .unwrap();
            assert_eq!(th.new_refs.len(), 0);
            assert_eq!(*value_slots(old_hdr), Value::from_int(5));

            // Young store into an old object: remembered.
            modify_object(&rt, &mut th, old_hdr, value_slots(old_hdr).add(1), young).unwrap();
            assert_eq!(th.new_refs.len(), 1);
            assert_eq!(th.new_refs[0].0, value_slots(old_hdr).add(1) as usize);
            assert_eq!(*value_slots(old_hdr).add(1), young);

            // Store into a young object: plain.
            modify_object(&rt, &mut th, young_hdr, value_slots(young_hdr), old).unwrap();
            assert_eq!(th.new_refs.len(), 1);

            // Old store into an old object outside a mark: plain.
            modify_old_gen(&rt, &mut th, value_slots(old_hdr).add(2), old).unwrap();
            assert_eq!(th.new_refs.len(), 1);
            assert_eq!(th.untraced.len(), 0);
        }
    }
}
