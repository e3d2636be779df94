//! The Runtime
//!
//! One `Runtime` value owns everything that the original design kept in
//! globals: the heap and free lists, the thread registry, the incremental
//! GC state, identity-hash tables, finalizer lists, global roots and the
//! interrupt flag. Mutators interact with it through `Thread` handles.
//!
//! ## Locks, in acquisition order
//!
//! heap → thread list → finalizer → hash. The write barrier takes no lock
//! at all; the freeze protocol only ever runs while the heap mutex is
//! held, which is what makes "waiting for the heap mutex" a safe state.

use crate::barrier;
use crate::block::*;
use crate::config::{MIN_THREAD_HEAP_INCREMENT, RuntimeConfig};
use crate::error::RtError;
use crate::finalize::FinalizeState;
use crate::floats::FLOAT_BUCKET_SIZE;
use crate::gc::{self, GcState};
use crate::heap::{Heap, HeapShared};
use crate::idhash::IdHashTables;
use crate::nursery::{BIG_NODE_SIZE, big_node_payload};
use crate::regions::default_backend;
use crate::report::GcStats;
use crate::thread::{ArgRing, PARK_ACTIVE, PARK_BLOCKING, Thread, ThreadCtx};
use crate::value::{FIRST_USER_CONST, Value};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

thread_local! {
    /// The `ThreadCtx` attached on this OS thread, if any. Lets the freeze
    /// protocol exclude the collection initiator and the heap lock mark
    /// the waiter as blocking.
    static CURRENT_CTX: Cell<*mut ThreadCtx> = const { Cell::new(std::ptr::null_mut()) };
}

// =============================================================================
// Registry and freeze control
// =============================================================================

/// The mutator thread registry.
pub struct Registry(Vec<*mut ThreadCtx>);

// Safety: the pointers are owned Boxes; they are only dereferenced by their
// owning thread or by the collector during a stop-the-world pause.
unsafe impl Send for Registry {}

impl Registry {
    pub(crate) fn iter(&self) -> std::slice::Iter<'_, *mut ThreadCtx> {
        self.0.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

struct FreezeControl {
    frozen: Mutex<bool>,
    cv: Condvar,
    requested: AtomicBool,
}

/// Global value roots; a thin wrapper so the raw-ish contents are Send.
pub(crate) struct GlobalRoots(Vec<Value>);

impl std::ops::Deref for GlobalRoots {
    type Target = Vec<Value>;
    fn deref(&self) -> &Vec<Value> {
        &self.0
    }
}

impl std::ops::DerefMut for GlobalRoots {
    fn deref_mut(&mut self) -> &mut Vec<Value> {
        &mut self.0
    }
}

// =============================================================================
// Runtime
// =============================================================================

pub struct Runtime {
    config: RuntimeConfig,
    shared: HeapShared,
    heap: Mutex<Heap>,
    threads: Mutex<Registry>,
    freeze: FreezeControl,
    hash: Mutex<IdHashTables>,
    finalize: Mutex<FinalizeState>,
    globals: Mutex<GlobalRoots>,
    thread_args: Mutex<ArgRing>,
    consts: Mutex<Vec<&'static str>>,
    interrupt: Arc<AtomicBool>,
}

impl Runtime {
    /// Create a runtime: maps the nursery and the initial old-generation
    /// chunk through the platform's best region backend.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Runtime>, RtError> {
        let shared = HeapShared::new();
        let backend = default_backend(
            config.preferred_old_base,
            config.preferred_nursery_base,
            config.max_nursery_size,
        );
        let heap = Heap::new(&config, &shared, backend).ok_or(RtError::Memory)?;
        Ok(Arc::new(Runtime {
            config,
            shared,
            heap: Mutex::new(heap),
            threads: Mutex::new(Registry(Vec::new())),
            freeze: FreezeControl {
                frozen: Mutex::new(false),
                cv: Condvar::new(),
                requested: AtomicBool::new(false),
            },
            hash: Mutex::new(IdHashTables::new()),
            finalize: Mutex::new(FinalizeState::new()),
            globals: Mutex::new(GlobalRoots(Vec::new())),
            thread_args: Mutex::new(ArgRing::new()),
            consts: Mutex::new(Vec::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn shared(&self) -> &HeapShared {
        &self.shared
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Attach the calling OS thread as a mutator.
    pub fn attach_thread(self: &Arc<Self>) -> Thread {
        let ctx = Box::into_raw(Box::new(ThreadCtx::new(self.config.stack_slots)));
        self.threads.lock().unwrap().0.push(ctx);
        CURRENT_CTX.with(|c| c.set(ctx));
        Thread {
            ctx,
            rt: Arc::clone(self),
        }
    }

    pub(crate) fn detach_thread(&self, ctx: *mut ThreadCtx) {
        // Count as frozen while waiting for the registry: a collection may
        // be in progress, and it may scan this context one last time.
        unsafe { (*ctx).park.store(PARK_BLOCKING, Ordering::Release) };
        {
            let mut reg = self.threads.lock().unwrap();
            reg.0.retain(|&t| t != ctx);
        }
        CURRENT_CTX.with(|c| {
            if c.get() == ctx {
                c.set(std::ptr::null_mut());
            }
        });
        unsafe { drop(Box::from_raw(ctx)) };
    }

    /// Number of attached mutator threads.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    // =========================================================================
    // Freeze protocol
    // =========================================================================

    #[inline(always)]
    pub(crate) fn freeze_requested(&self) -> bool {
        self.freeze.requested.load(Ordering::Acquire)
    }

    /// Stop every mutator except the caller at a safe point. Must be
    /// called with the heap mutex held; returns the locked registry, which
    /// stays locked until `resume_world`.
    pub(crate) fn freeze_world(&self) -> MutexGuard<'_, Registry> {
        let threads = self.threads.lock().unwrap();
        let me = CURRENT_CTX.with(|c| c.get());
        let mut frozen = self.freeze.frozen.lock().unwrap();
        *frozen = true;
        self.freeze.requested.store(true, Ordering::Release);
        loop {
            let all = threads.iter().all(|&t| {
                t == me || unsafe { (*t).park.load(Ordering::Acquire) } != PARK_ACTIVE
            });
            if all {
                break;
            }
            frozen = self.freeze.cv.wait(frozen).unwrap();
        }
        drop(frozen);
        threads
    }

    /// Wake every frozen mutator.
    pub(crate) fn resume_world(&self, threads: MutexGuard<'_, Registry>) {
        {
            let mut frozen = self.freeze.frozen.lock().unwrap();
            *frozen = false;
            self.freeze.requested.store(false, Ordering::Release);
            self.freeze.cv.notify_all();
        }
        drop(threads);
    }

    /// Park the calling mutator until the collection in progress resumes
    /// the world.
    pub(crate) fn park_current(&self, ctx: &ThreadCtx) {
        ctx.park.store(crate::thread::PARK_PARKED, Ordering::Release);
        let mut frozen = self.freeze.frozen.lock().unwrap();
        self.freeze.cv.notify_all();
        while *frozen {
            frozen = self.freeze.cv.wait(frozen).unwrap();
        }
        drop(frozen);
        ctx.park.store(PARK_ACTIVE, Ordering::Release);
    }

    /// Lock the heap, counting the calling mutator as safely blocked while
    /// it waits (the lock holder may be freezing the world).
    pub(crate) fn lock_heap(&self) -> MutexGuard<'_, Heap> {
        let ctx = CURRENT_CTX.with(|c| c.get());
        if !ctx.is_null() {
            unsafe { (*ctx).park.store(PARK_BLOCKING, Ordering::Release) };
        }
        let guard = self.heap.lock().unwrap();
        if !ctx.is_null() {
            unsafe { (*ctx).park.store(PARK_ACTIVE, Ordering::Release) };
        }
        guard
    }

    pub(crate) fn globals_lock(&self) -> MutexGuard<'_, GlobalRoots> {
        self.globals.lock().unwrap()
    }

    pub(crate) fn thread_args_lock(&self) -> MutexGuard<'_, ArgRing> {
        self.thread_args.lock().unwrap()
    }

    pub(crate) fn finalize_lock(&self) -> MutexGuard<'_, FinalizeState> {
        self.finalize.lock().unwrap()
    }

    // =========================================================================
    // Interrupts
    // =========================================================================

    /// Raise the global keyboard-interrupt flag; the next thread through a
    /// safe point receives it.
    pub fn set_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }

    /// Latch an interrupt for one specific thread.
    pub fn interrupt_thread(&self, thread_id: u64) {
        let reg = self.threads.lock().unwrap();
        for &t in reg.iter() {
            let t = unsafe { &*t };
            if t.id == thread_id {
                t.interrupt_pending.store(true, Ordering::Release);
            }
        }
    }

    /// Install a SIGINT handler that sets the interrupt flag.
    #[cfg(all(unix, feature = "interrupt"))]
    pub fn install_interrupt_handler(&self) -> std::io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.interrupt))
            .map(|_| ())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes of block space (rounded up), young. The fast
    /// path bumps the thread's private slab without a lock; the caller
    /// must install a header before the next allocation or safe point.
    #[inline]
    pub fn alloc(&self, t: &mut ThreadCtx, size: usize) -> Result<*mut u8, RtError> {
        let size = round_block_size(size);
        if t.heap_ptr + size <= t.heap_end {
            let p = t.heap_ptr;
            t.heap_ptr += size;
            Ok(p as *mut u8)
        } else {
            self.alloc_slow(t, size)
        }
    }

    /// Slow path: refill the slab, allocate a big block, or collect.
    fn alloc_slow(&self, t: &mut ThreadCtx, size: usize) -> Result<*mut u8, RtError> {
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        unsafe {
            // GC pacing rides on the allocation slow path.
            if self.shared.gc_state() != GcState::None {
                gc::collect_increment_locked(self, heap, Some(t));
            } else if gc::time_for_full(heap) {
                gc::start_full_locked(self, heap);
            }

            if size >= MIN_BIG_BLOCK_SIZE {
                return self.alloc_big_locked(heap, size);
            }

            if gc::time_for_young(heap) {
                gc::collect_new_gen_locked(self, heap, false)?;
            }

            let carve = size.max(MIN_THREAD_HEAP_INCREMENT).min(heap.nursery.size);
            for _ in 0..2 {
                if let Some(slab) = heap.nursery.carve(carve) {
                    heap.alloc_amount += carve;
                    heap.stats.alloc_count += carve as u64;
                    t.heap_ptr = slab as usize + size;
                    t.heap_end = slab as usize + carve;
                    return Ok(slab);
                }
                gc::collect_new_gen_locked(self, heap, false)?;
            }
            Err(RtError::Memory)
        }
    }

    /// Big blocks go straight to old-generation space, wrapped so the
    /// young collector can treat them as nursery extensions.
    unsafe fn alloc_big_locked(&self, heap: &mut Heap, size: usize) -> Result<*mut u8, RtError> {
        let total = round_block_size(BIG_NODE_SIZE + size);
        let node = self
            .global_alloc_locked(heap, total)
            .ok_or(RtError::Memory)?;
        unsafe {
            heap.nursery.link_big_block(node, total - BIG_NODE_SIZE);
            let payload = big_node_payload(node as usize);
            // Provisional header keeps the chunk parseable until the
            // caller installs the real one.
            *payload = nonptr_header(total - BIG_NODE_SIZE - WORD, SUB_BYTES, true);
            heap.alloc_amount += size;
            heap.stats.alloc_count += size as u64;
            Ok(payload as *mut u8)
        }
    }

    /// The free-list allocator with its growth and forced-collection
    /// fallbacks. Heap lock required; `size` must be rounded.
    pub(crate) fn global_alloc_locked(&self, heap: &mut Heap, size: usize) -> Option<*mut u8> {
        unsafe {
            loop {
                if let Some(p) = heap.try_alloc_from_lists(&self.shared, size) {
                    gc::shade_new_block(self, heap, p as usize);
                    return Some(p);
                }
                if heap.grow(&self.shared, size) {
                    continue;
                }
                if !heap.forced_retry
                    && self.shared.gc_state() != GcState::MarkExe
                    && !heap.young_gc_active
                {
                    heap.forced_retry = true;
                    let collected = gc::collect_forced_locked(self, heap);
                    heap.forced_retry = false;
                    if collected {
                        if let Some(p) = heap.try_alloc_from_lists(&self.shared, size) {
                            gc::shade_new_block(self, heap, p as usize);
                            return Some(p);
                        }
                    }
                }
                return None;
            }
        }
    }

    /// Allocate a block directly in the old generation. It will never
    /// move. Comes back headed as a raw non-pointer block; typed
    /// constructors rewrite the header.
    pub fn alloc_unmovable(&self, size: usize) -> Result<*mut u8, RtError> {
        let size = round_block_size(size);
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        let p = self
            .global_alloc_locked(heap, size)
            .ok_or(RtError::Memory)?;
        unsafe { *(p as *mut usize) = nonptr_header(size - WORD, SUB_BYTES, false) };
        heap.old_gen_size += size;
        Ok(p)
    }

    /// Allocate with one value rescued across a possible collection.
    pub fn alloc_keep(
        &self,
        t: &mut ThreadCtx,
        size: usize,
        keep: &mut Value,
    ) -> Result<*mut u8, RtError> {
        let size = round_block_size(size);
        if t.heap_ptr + size <= t.heap_end {
            let p = t.heap_ptr;
            t.heap_ptr += size;
            return Ok(p as *mut u8);
        }
        let slot = t.alloc_temp();
        unsafe { *slot = *keep };
        let result = self.alloc_slow(t, size);
        unsafe { *keep = *slot };
        t.free_temp();
        result
    }

    /// Shrink a block in place, releasing the tail.
    ///
    /// # Safety
    /// `block` must be a live block of `old_size` (unrounded) bytes whose
    /// header has already been rewritten for `new_size`.
    pub unsafe fn truncate_block(&self, block: *mut usize, old_size: usize, new_size: usize) {
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        unsafe { heap.truncate_block(&self.shared, block, old_size, new_size) };
    }

    // =========================================================================
    // Typed constructors
    // =========================================================================

    /// A young value block with `slots` nil-initialized slots.
    pub fn alloc_value_block(
        &self,
        t: &mut ThreadCtx,
        slots: usize,
        sub: usize,
    ) -> Result<Value, RtError> {
        let data = slots * WORD;
        let p = self.alloc(t, WORD + data)? as *mut usize;
        unsafe {
            *p = value_header(data, sub, true);
            let s = value_slots(p);
            for i in 0..slots {
                *s.add(i) = Value::NIL;
            }
        }
        Ok(Value::from_ptr(p))
    }

    /// An unmovable value block (old generation from birth).
    pub fn alloc_value_block_unmovable(
        &self,
        slots: usize,
        sub: usize,
    ) -> Result<Value, RtError> {
        let data = slots * WORD;
        let p = self.alloc_unmovable(WORD + data)? as *mut usize;
        unsafe {
            *p = value_header(data, sub, false);
            let s = value_slots(p);
            for i in 0..slots {
                *s.add(i) = Value::NIL;
            }
        }
        Ok(Value::from_ptr(p))
    }

    /// A young non-pointer block of `len` raw bytes (uninitialized).
    pub fn alloc_nonptr_block(
        &self,
        t: &mut ThreadCtx,
        len: usize,
        sub: usize,
    ) -> Result<Value, RtError> {
        let p = self.alloc(t, WORD + len)? as *mut usize;
        unsafe { *p = nonptr_header(len, sub, true) };
        Ok(Value::from_ptr(p))
    }

    /// A young instance of `desc`, slots nil. Finalizable classes are
    /// linked onto the finalizer list here.
    pub fn alloc_instance(
        &self,
        t: &mut ThreadCtx,
        desc: &'static TypeDesc,
    ) -> Result<Value, RtError> {
        let p = self.alloc(t, WORD + desc.slots * WORD)? as *mut usize;
        unsafe {
            *p = instance_header(desc, true);
            let s = value_slots(p);
            for i in 0..desc.slots {
                *s.add(i) = Value::NIL;
            }
        }
        let v = Value::from_ptr(p);
        if desc.finalizer.is_some() {
            self.register_finalizer(t, v)?;
        }
        Ok(v)
    }

    /// Box a float in a bucket cell.
    pub fn make_float(&self, t: &mut ThreadCtx, f: f64) -> Result<Value, RtError> {
        loop {
            {
                let mut guard = self.lock_heap();
                let cell = unsafe { crate::floats::pop_cell(&mut guard.float_young_free, f) };
                if !cell.is_null() {
                    return Ok(Value::from_float_ptr(cell));
                }
            }
            // Out of cells: allocate a fresh nursery bucket and chain it.
            let bucket = self.alloc(t, FLOAT_BUCKET_SIZE)? as *mut usize;
            let mut guard = self.lock_heap();
            let heap = &mut *guard;
            heap.float_young_free =
                unsafe { crate::floats::init_float_bucket(bucket, true, heap.float_young_free) };
        }
    }

    // =========================================================================
    // Object mutation
    // =========================================================================

    /// Store into an instance slot through the write barrier.
    pub fn set_instance_slot(
        &self,
        t: &mut ThreadCtx,
        inst: Value,
        slot: usize,
        v: Value,
    ) -> Result<(), RtError> {
        unsafe {
            let ptr = inst.as_ptr();
            debug_assert_eq!(header_kind(*ptr), KIND_INSTANCE);
            debug_assert!(slot < (*header_type_desc(*ptr)).slots);
            barrier::modify_object(self, t, ptr, value_slots(ptr).add(slot), v)
        }
    }

    /// Store into a value-block element through the write barrier.
    pub fn set_element(
        &self,
        t: &mut ThreadCtx,
        block: Value,
        index: usize,
        v: Value,
    ) -> Result<(), RtError> {
        unsafe {
            let ptr = block.as_ptr();
            debug_assert_eq!(header_kind(*ptr), KIND_VALUE);
            debug_assert!(index < header_data_len(*ptr) / WORD);
            barrier::modify_object(self, t, ptr, value_slots(ptr).add(index), v)
        }
    }

    // =========================================================================
    // GC control
    // =========================================================================

    /// One collection increment; starts an incremental full collection
    /// when none is active.
    pub fn collect_garbage(&self, t: &mut ThreadCtx) {
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        unsafe {
            if self.shared.gc_state() == GcState::None {
                gc::start_full_locked(self, heap);
            }
            gc::collect_increment_locked(self, heap, Some(t));
        }
    }

    /// Run a full collection to completion. Returns false when suppressed.
    pub fn collect_garbage_forced(&self) -> bool {
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        unsafe { gc::collect_forced_locked(self, heap) }
    }

    /// Young collection followed by a forced full collection.
    pub fn collect_all_garbage(&self) -> Result<(), RtError> {
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        unsafe {
            gc::collect_new_gen_locked(self, heap, true)?;
            gc::collect_forced_locked(self, heap);
        }
        Ok(())
    }

    /// Young collection only.
    pub fn collect_new_gen(&self, force_retire: bool) -> Result<(), RtError> {
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        unsafe { gc::collect_new_gen_locked(self, heap, force_retire) }
    }

    /// Snapshot of the collection statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.lock_heap().stats.clone()
    }

    /// Current incremental-collection state.
    pub fn gc_state(&self) -> GcState {
        self.shared.gc_state()
    }

    /// Stop the world and run the debug heap verifier.
    pub fn verify_heap(&self) {
        let mut guard = self.lock_heap();
        let heap = &mut *guard;
        let threads = self.freeze_world();
        crate::verify::verify_heap(self, heap, &threads);
        self.resume_world(threads);
    }

    // =========================================================================
    // Identity hashes
    // =========================================================================

    /// Stable identity hash, independent of the object's address.
    pub fn identity_hash(&self, v: Value) -> Value {
        if v.is_short_int() {
            return v;
        }
        if v.is_constant() {
            return Value::from_int(v.constant_id() as isize);
        }
        if v.is_float() {
            let bits = unsafe { v.float_value() }.to_bits();
            return Value::from_int(((bits ^ (bits >> 32)) & 0x3fff_ffff) as isize);
        }
        let addr = v.referent_addr();
        let young = unsafe { is_young_header(*(addr as *const usize)) };
        let h = self.hash.lock().unwrap().hash_for(addr, young);
        Value::from_int((h & 0x3fff_ffff_ffff) as isize)
    }

    /// Rehome nursery hash entries after a young collection.
    pub(crate) fn migrate_id_hashes(&self) {
        let shared = &self.shared;
        self.hash.lock().unwrap().migrate_young(|addr| unsafe {
            if shared.in_nursery(addr) {
                let header = *(addr as *const usize);
                if header_kind(header) == KIND_INDIRECT {
                    Some(indirect_target(header))
                } else {
                    None
                }
            } else if is_young_header(*(addr as *const usize)) {
                // A big block that stayed young: it is garbage.
                None
            } else {
                // A retired big block keeps its address.
                Some(addr)
            }
        });
    }

    /// Drop hash entries for unmarked blocks at the mark→sweep boundary.
    pub(crate) fn purge_id_hashes(&self, heap: &mut Heap) {
        let shared = &self.shared;
        let base = heap.nursery.base;
        let bitmap = heap.nursery.bitmap_ptr();
        self.hash.lock().unwrap().purge(
            |addr| unsafe {
                if shared.in_nursery(addr) {
                    crate::bitmap::test_bit(bitmap, base, addr)
                } else {
                    shared.is_marked(addr)
                }
            },
            |addr| shared.is_marked(addr),
        );
    }

    // =========================================================================
    // Finalizers
    // =========================================================================

    /// Link a finalizable instance onto its generation's finalizer list.
    pub fn register_finalizer(&self, t: &mut ThreadCtx, inst: Value) -> Result<(), RtError> {
        let ptr = inst.as_ptr();
        let desc = unsafe { header_type_desc(*ptr) };
        if unsafe { (*desc).finalizer.is_none() } {
            return Err(RtError::value("class declares no finalizer"));
        }
        let mut fin = self.finalize.lock().unwrap();
        let young = unsafe { is_young_header(*ptr) };
        let head = if young {
            fin.young_head
        } else {
            fin.old_head
        };
        unsafe {
            let slot = value_slots(ptr).add((*desc).finalize_slot);
            barrier::modify_object(self, t, ptr, slot, head)?;
        }
        if young {
            fin.young_head = inst;
        } else {
            fin.old_head = inst;
        }
        Ok(())
    }

    /// Call the finalizer of every pending instance. Runs outside the
    /// collector; the instances are reclaimed by the next full cycle.
    /// Returns how many finalizers ran.
    pub fn drain_finalizers(&self, t: &mut Thread) -> usize {
        let mut count = 0;
        loop {
            let Some(inst) = self.finalize.lock().unwrap().pending.pop() else {
                return count;
            };
            let desc = unsafe { header_type_desc(*inst.as_ptr()) };
            if let Some(finalizer) = unsafe { (*desc).finalizer } {
                finalizer(t, inst);
            }
            count += 1;
        }
    }

    // =========================================================================
    // Globals, constants, thread arguments
    // =========================================================================

    /// Register a global root slot; returns its index.
    pub fn register_global(&self, v: Value) -> usize {
        let mut globals = self.globals.lock().unwrap();
        globals.push(v);
        globals.len() - 1
    }

    /// Global slots are roots: plain stores, no barrier.
    pub fn set_global(&self, index: usize, v: Value) {
        self.globals.lock().unwrap()[index] = v;
    }

    pub fn get_global(&self, index: usize) -> Value {
        self.globals.lock().unwrap()[index]
    }

    /// Register a named user constant; returns its value.
    pub fn register_constant(&self, name: &'static str) -> Value {
        let mut consts = self.consts.lock().unwrap();
        consts.push(name);
        Value::constant(FIRST_USER_CONST + consts.len() - 1)
    }

    /// Name of a constant, for the generic string conversion.
    pub fn constant_name(&self, v: Value) -> Option<&'static str> {
        if !v.is_constant() {
            return None;
        }
        match v {
            Value::NIL => Some("nil"),
            Value::TRUE => Some("True"),
            Value::FALSE => Some("False"),
            _ => {
                let id = v.constant_id();
                if id >= FIRST_USER_CONST {
                    self.consts.lock().unwrap().get(id - FIRST_USER_CONST).copied()
                } else {
                    None
                }
            }
        }
    }

    /// Park argument values for a thread being spawned.
    pub fn push_thread_args(&self, args: [Value; 3]) -> Result<(), RtError> {
        self.thread_args.lock().unwrap().push(args)
    }

    /// Claim the oldest parked argument triple.
    pub fn pop_thread_args(&self) -> Option<[Value; 3]> {
        self.thread_args.lock().unwrap().pop()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        crate::report::emit(&self.heap.lock().unwrap().stats);
        let heap = self.heap.get_mut().unwrap();
        heap.release_regions(&self.shared);
    }
}

// =============================================================================
// Thread conveniences
// =============================================================================

impl Thread {
    fn rt(&self) -> Arc<Runtime> {
        Arc::clone(&self.rt)
    }

    pub fn alloc(&mut self, size: usize) -> Result<*mut u8, RtError> {
        self.rt().alloc(self, size)
    }

    pub fn alloc_value_block(&mut self, slots: usize, sub: usize) -> Result<Value, RtError> {
        self.rt().alloc_value_block(self, slots, sub)
    }

    pub fn alloc_nonptr_block(&mut self, len: usize, sub: usize) -> Result<Value, RtError> {
        self.rt().alloc_nonptr_block(self, len, sub)
    }

    pub fn alloc_instance(&mut self, desc: &'static TypeDesc) -> Result<Value, RtError> {
        self.rt().alloc_instance(self, desc)
    }

    pub fn make_float(&mut self, f: f64) -> Result<Value, RtError> {
        self.rt().make_float(self, f)
    }

    pub fn set_instance_slot(
        &mut self,
        inst: Value,
        slot: usize,
        v: Value,
    ) -> Result<(), RtError> {
        self.rt().set_instance_slot(self, inst, slot, v)
    }

    pub fn set_element(&mut self, block: Value, index: usize, v: Value) -> Result<(), RtError> {
        self.rt().set_element(self, block, index, v)
    }
}

// =============================================================================
// Tests
// =============================================================================
