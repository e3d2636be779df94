//! End-to-end collector behavior: survival counts, boundary allocations,
//! sweep behavior, and allocator fence-post properties.

use mica_core::block::{
    MIN_BLOCK_SIZE, SUB_ARRAY, SUB_BYTES, is_large_enough_free_block, round_block_size,
};
use mica_core::config::RuntimeConfig;
use mica_core::freelist::free_list_index;
use mica_core::value::Value;
use mica_core::{RtError, Runtime, TypeDesc};
use quickcheck_macros::quickcheck;

static PAIR: TypeDesc = TypeDesc::plain("test::Pair", 2);

#[test]
fn half_of_ten_thousand_instances_survive() {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut th = rt.attach_thread();

    // Chain every other instance off a single root; the rest are garbage.
    let root = th.alloc_temp();
    for i in 0..10_000 {
        let inst = th.alloc_instance(&PAIR).unwrap();
        th.set_instance_slot(inst, 1, Value::from_int(i)).unwrap();
        if i % 2 == 0 {
            let head = unsafe { *root };
            th.set_instance_slot(inst, 0, head).unwrap();
            unsafe { *root = inst };
        }
    }

    rt.collect_all_garbage().unwrap();

    // Exactly the chained half is reachable.
    let mut count = 0usize;
    let mut v = unsafe { *root };
    while !v.is_nil() {
        count += 1;
        unsafe {
            v = *mica_core::block::value_slots(v.as_ptr());
        }
    }
    assert_eq!(count, 5_000);

    // Free-list totals must reconcile with the heap layout.
    rt.verify_heap();
    th.free_temp();
}

#[test]
fn minimum_block_allocation() {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut th = rt.attach_thread();
    // A one-slot value block is exactly the minimum block size.
    assert_eq!(round_block_size(8 + 8), MIN_BLOCK_SIZE);
    let v = th.alloc_value_block(1, SUB_ARRAY).unwrap();
    th.set_element(v, 0, Value::from_int(1)).unwrap();
}

#[test]
fn impossible_allocation_fails_cleanly() {
    let config = RuntimeConfig {
        initial_heap_size: 128 * 1024,
        max_heap_size: 512 * 1024,
        ..RuntimeConfig::default()
    };
    let rt = Runtime::new(config).unwrap();
    let mut th = rt.attach_thread();

    // Far past the heap limit: even a forced collection cannot help.
    let err = rt.alloc_unmovable(8 * 1024 * 1024).unwrap_err();
    assert_eq!(err, RtError::Memory);

    // The collector state is still valid and small allocations work.
    let v = th.alloc_value_block(2, SUB_ARRAY).unwrap();
    th.set_element(v, 0, Value::TRUE).unwrap();
    rt.collect_all_garbage().unwrap();
}

#[test]
fn retirement_failure_surfaces_memory_error() {
    // A heap too small to absorb the nursery survivors: the young
    // collection must abort with a memory error, leaving every rooted
    // object readable and the runtime usable.
    let config = RuntimeConfig {
        initial_heap_size: 128 * 1024,
        max_heap_size: 160 * 1024,
        ..RuntimeConfig::default()
    };
    let rt = Runtime::new(config).unwrap();
    let mut th = rt.attach_thread();

    // Occupy most of the old generation so retirement cannot fit.
    let _ballast = rt.alloc_unmovable(120 * 1024).unwrap();

    // Root more young data than the remaining old-gen space can take.
    let root = th.alloc_temp();
    for i in 0..1500 {
        let node = th.alloc_value_block(3, SUB_ARRAY).unwrap();
        th.set_element(node, 1, Value::from_int(i)).unwrap();
        let head = unsafe { *root };
        th.set_element(node, 0, head).unwrap();
        unsafe { *root = node };
    }

    let err = rt.collect_new_gen(false).unwrap_err();
    assert_eq!(err, RtError::Memory);

    // The rooted chain is fully intact: partially copied, partially still
    // in the nursery, but never pointing at a forwarding header.
    let mut count = 0usize;
    let mut v = unsafe { *root };
    while !v.is_nil() {
        count += 1;
        unsafe {
            assert_eq!(
                mica_core::block::header_kind(*v.as_ptr()),
                mica_core::block::KIND_VALUE
            );
            v = *mica_core::block::value_slots(v.as_ptr());
        }
    }
    assert_eq!(count, 1500);

    // Dropping the chain makes a young collection possible again, and
    // ordinary allocation keeps working.
    unsafe { *root = Value::NIL };
    th.free_temp();
    rt.collect_new_gen(false).unwrap();
    let v = th.alloc_value_block(2, SUB_ARRAY).unwrap();
    th.set_element(v, 0, Value::from_int(9)).unwrap();
}

#[test]
fn young_collection_with_only_big_blocks() {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut th = rt.attach_thread();

    let root = th.alloc_temp();
    // Fill the young generation's big-block quota, rooting only one.
    for i in 0..40 {
        let big = th.alloc_nonptr_block(2048, SUB_BYTES).unwrap();
        if i == 17 {
            unsafe {
                *mica_core::block::nonptr_data(big.as_ptr()) = 0x77;
                *root = big;
            }
        }
    }

    rt.collect_new_gen(true).unwrap();

    let kept = unsafe { *root };
    unsafe {
        assert!(!mica_core::block::is_young_header(*kept.as_ptr()));
        assert_eq!(*mica_core::block::nonptr_data(kept.as_ptr()), 0x77);
    }

    // The dead big blocks went back to the heap: another round of big
    // allocations must not grow the heap further than the first did.
    let before = rt.gc_stats().heap_size;
    for _ in 0..40 {
        th.alloc_nonptr_block(2048, SUB_BYTES).unwrap();
    }
    rt.collect_new_gen(true).unwrap();
    assert_eq!(rt.gc_stats().heap_size, before);
    th.free_temp();
}

#[test]
fn sweep_over_fully_garbage_heap() {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut th = rt.attach_thread();

    // Retire two generations' worth of garbage into the old gen, then
    // collect it all.
    for round in 0..2 {
        let root = th.alloc_temp();
        for i in 0..500 {
            let inst = th.alloc_instance(&PAIR).unwrap();
            th.set_instance_slot(inst, 1, Value::from_int(i + round)).unwrap();
            let head = unsafe { *root };
            th.set_instance_slot(inst, 0, head).unwrap();
            unsafe { *root = inst };
        }
        rt.collect_new_gen(true).unwrap();
        th.free_temp(); // the whole chain becomes garbage
    }

    rt.collect_garbage_forced();
    let stats = rt.gc_stats();
    assert_eq!(stats.old_gen_size, stats.last_live_size);
    rt.verify_heap();
}

#[test]
fn incremental_collection_with_mutation() {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut th = rt.attach_thread();

    // A rooted chain retired to the old generation.
    let root = th.alloc_temp();
    for i in 0..200 {
        let inst = th.alloc_instance(&PAIR).unwrap();
        th.set_instance_slot(inst, 1, Value::from_int(i)).unwrap();
        let head = unsafe { *root };
        th.set_instance_slot(inst, 0, head).unwrap();
        unsafe { *root = inst };
    }
    rt.collect_new_gen(true).unwrap();

    // Drive an incremental full collection while rewriting links (the
    // barrier must keep rewritten-in objects alive).
    rt.collect_garbage(&mut th);
    for _ in 0..50 {
        let head = unsafe { *root };
        unsafe {
            let second = *mica_core::block::value_slots(head.as_ptr());
            if second.is_nil() {
                break;
            }
            // Unlink and relink one node through the barrier.
            let third = *mica_core::block::value_slots(second.as_ptr());
            th.set_instance_slot(head, 0, third).unwrap();
            th.set_instance_slot(second, 0, *root).unwrap();
        }
        rt.collect_garbage(&mut th);
    }
    while rt.gc_state() != mica_core::GcState::None {
        rt.collect_garbage(&mut th);
    }

    // The chain from the root is still fully intact.
    let mut count = 0;
    let mut v = unsafe { *root };
    while !v.is_nil() && count <= 200 {
        count += 1;
        unsafe {
            assert_eq!(
                mica_core::block::header_kind(*v.as_ptr()),
                mica_core::block::KIND_INSTANCE
            );
            v = *mica_core::block::value_slots(v.as_ptr());
        }
    }
    assert!(count >= 150, "chain lost nodes during incremental collection");
    th.free_temp();
}

// =============================================================================
// Fence-post properties (quickcheck)
// =============================================================================

#[quickcheck]
fn prop_round_block_size(req: usize) -> bool {
    let req = req % (1 << 20);
    let r = round_block_size(req);
    r >= req && r >= MIN_BLOCK_SIZE && r % 8 == 0 && r - req.max(MIN_BLOCK_SIZE) < 8 + MIN_BLOCK_SIZE
}

#[quickcheck]
fn prop_large_enough_leaves_parseable_remainder(free: usize, req: usize) -> bool {
    let free = round_block_size(free % (1 << 20));
    let req = round_block_size(req % (1 << 20));
    if !is_large_enough_free_block(free, req) {
        return true;
    }
    let rem = free - req;
    rem == 0 || rem >= MIN_BLOCK_SIZE
}

#[quickcheck]
fn prop_exact_fit_always_usable(req: usize) -> bool {
    let req = round_block_size(req % (1 << 20));
    is_large_enough_free_block(req, req)
}

#[quickcheck]
fn prop_free_list_index_in_range_and_monotone(a: usize, b: usize) -> bool {
    let a = round_block_size(a % (1 << 20));
    let b = round_block_size(b % (1 << 20));
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let (il, ih) = (free_list_index(lo), free_list_index(hi));
    il <= ih && ih < 64
}
