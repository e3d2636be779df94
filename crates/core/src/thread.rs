//! Per-Thread Runtime Structures
//!
//! Each mutator thread owns a `ThreadCtx`: its value stack, temporary
//! roots, private nursery slab, write-barrier logs and exception state.
//! The runtime keeps a registry of raw `ThreadCtx` pointers so the
//! collector can enumerate every thread during a stop-the-world pause.
//!
//! ## Ownership protocol
//!
//! Only the owning thread writes its `ThreadCtx`; other threads (the
//! collector) read and update it exclusively while the world is stopped.
//! The `park` field is the one cross-thread-visible piece of state and is
//! atomic.
//!
//! ## Safe points
//!
//! `Thread::safepoint` must be called on back-edges, calls and
//! allocations. It parks the thread while a collection is in progress and
//! delivers pending keyboard interrupts. Blocking syscalls are bracketed
//! with `enter_blocking`/`exit_blocking`; a blocking thread counts as
//! frozen without being asked.

use crate::config::TEMP_SLOTS;
use crate::error::RtError;
use crate::runtime::Runtime;
use crate::value::Value;
use std::alloc::{Layout, alloc, dealloc};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Thread is running mutator code.
pub(crate) const PARK_ACTIVE: u8 = 0;
/// Thread is parked at a safe point for a collection.
pub(crate) const PARK_PARKED: u8 = 1;
/// Thread is outside the heap in a blocking syscall.
pub(crate) const PARK_BLOCKING: u8 = 2;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Value stack
// =============================================================================

/// A fixed-capacity stack of values with the frame format the interpreter
/// and the collector agree on: each frame starts with a word encoding the
/// frame byte size (as a short int, so the collector can scan the stack
/// wholesale) followed by the function reference and the frame's value
/// slots. A zero word marks the stack bottom.
pub struct ValueStack {
    base: *mut Value,
    sp: usize,
    capacity: usize,
    /// Base indices of the active frames (interpreter bookkeeping, not
    /// scanned).
    frames: Vec<usize>,
}

impl ValueStack {
    pub fn new(capacity: usize) -> ValueStack {
        let layout = Layout::array::<Value>(capacity).expect("stack layout overflow");
        let base = unsafe { alloc(layout) as *mut Value };
        assert!(!base.is_null(), "failed to allocate value stack");
        // Zero sentinel at the bottom.
        unsafe { *base = Value::from_bits(0) };
        ValueStack {
            base,
            sp: 1,
            capacity,
            frames: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.sp
    }

    /// Push a frame with `slots` nil-initialized value slots.
    pub fn push_frame(&mut self, func: Value, slots: usize) -> Result<usize, RtError> {
        let total = 2 + slots;
        if self.sp + total > self.capacity {
            return Err(RtError::runtime("value stack overflow"));
        }
        let base = self.sp;
        unsafe {
            *self.base.add(base) = Value::from_int((total * crate::block::WORD) as isize);
            *self.base.add(base + 1) = func;
            for i in 0..slots {
                *self.base.add(base + 2 + i) = Value::NIL;
            }
        }
        self.sp += total;
        self.frames.push(base);
        Ok(base)
    }

    /// Pop the current frame.
    pub fn pop_frame(&mut self) {
        let base = self.frames.pop().expect("pop_frame: no active frame");
        self.sp = base;
    }

    /// Base index of the innermost frame.
    #[inline(always)]
    pub fn current_frame(&self) -> Option<usize> {
        self.frames.last().copied()
    }

    /// Access a slot of the innermost frame. Slot 0 is the first value
    /// slot after the function reference.
    #[inline(always)]
    pub fn frame_slot(&mut self, frame: usize, slot: usize) -> *mut Value {
        debug_assert!(frame + 2 + slot < self.sp);
        unsafe { self.base.add(frame + 2 + slot) }
    }

    /// Read a frame slot.
    #[inline(always)]
    pub fn get(&self, frame: usize, slot: usize) -> Value {
        unsafe { *self.base.add(frame + 2 + slot) }
    }

    /// Write a frame slot. Stack slots are roots and need no write
    /// barrier.
    #[inline(always)]
    pub fn set(&mut self, frame: usize, slot: usize, v: Value) {
        unsafe { *self.base.add(frame + 2 + slot) = v };
    }

    /// The live span scanned by the collector.
    #[inline(always)]
    pub(crate) fn scan_span(&self) -> (*mut Value, *mut Value) {
        (self.base, unsafe { self.base.add(self.sp) })
    }
}

impl Drop for ValueStack {
    fn drop(&mut self) {
        let layout = Layout::array::<Value>(self.capacity).expect("stack layout overflow");
        unsafe { dealloc(self.base as *mut u8, layout) };
    }
}

// Safety: the collector reads the stack only while its owner is frozen.
unsafe impl Send for ValueStack {}

// =============================================================================
// Exception contexts
// =============================================================================

/// State snapshot for try/finally unwinding: restores the stack, frame and
/// temp-slot depths recorded when the protected region was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcContext {
    pub stack_sp: usize,
    pub frame_count: usize,
    pub temp_sp: usize,
}

// =============================================================================
// ThreadCtx
// =============================================================================

/// Per-thread mutator state. See the module docs for the ownership
/// protocol.
pub struct ThreadCtx {
    pub(crate) id: u64,

    /// The interpreter value stack; scanned wholesale as roots.
    pub stack: ValueStack,

    /// Temporary slots keeping values alive across operations that may
    /// allocate.
    pub(crate) temps: [Value; TEMP_SLOTS],
    pub(crate) temp_sp: usize,

    /// Private nursery slab for bump allocation: `[heap_ptr, heap_end)`.
    pub(crate) heap_ptr: usize,
    pub(crate) heap_end: usize,

    /// Remembered set: (slot address, stored value) pairs for young
    /// references written into old objects.
    pub(crate) new_refs: Vec<(usize, Value)>,

    /// Gray values shaded by the mark-phase write barrier.
    pub(crate) untraced: Vec<Value>,

    /// try/finally context stack.
    pub(crate) exc_stack: Vec<ExcContext>,

    /// Pending exception for the sentinel-return error path.
    pub(crate) pending_exception: Option<RtError>,

    /// Cached compiled-regex slots (library-managed, scanned as roots).
    pub regex_cache: [Value; 2],

    /// PARK_ACTIVE / PARK_PARKED / PARK_BLOCKING.
    pub(crate) park: AtomicU8,

    /// Interrupt latch for targeted delivery.
    pub(crate) interrupt_pending: AtomicBool,
}

impl ThreadCtx {
    pub(crate) fn new(stack_slots: usize) -> ThreadCtx {
        ThreadCtx {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            stack: ValueStack::new(stack_slots),
            temps: [Value::NIL; TEMP_SLOTS],
            temp_sp: 0,
            heap_ptr: 0,
            heap_end: 0,
            new_refs: Vec::with_capacity(64),
            untraced: Vec::with_capacity(64),
            exc_stack: Vec::new(),
            pending_exception: None,
            regex_cache: [Value::NIL; 2],
            park: AtomicU8::new(PARK_ACTIVE),
            interrupt_pending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // =========================================================================
    // Temporary roots
    // =========================================================================

    /// Claim one temporary slot, initialized to nil. The slot stays a GC
    /// root until freed.
    pub fn alloc_temp(&mut self) -> *mut Value {
        assert!(self.temp_sp < TEMP_SLOTS, "out of temporary slots");
        let slot = &mut self.temps[self.temp_sp] as *mut Value;
        unsafe { *slot = Value::NIL };
        self.temp_sp += 1;
        slot
    }

    /// Claim `n` consecutive temporary slots.
    pub fn alloc_temps(&mut self, n: usize) -> *mut Value {
        assert!(self.temp_sp + n <= TEMP_SLOTS, "out of temporary slots");
        let slot = unsafe { self.temps.as_mut_ptr().add(self.temp_sp) };
        for i in 0..n {
            self.temps[self.temp_sp + i] = Value::NIL;
        }
        self.temp_sp += n;
        slot
    }

    /// Release the most recently claimed temporary slot.
    pub fn free_temp(&mut self) {
        debug_assert!(self.temp_sp > 0);
        self.temp_sp -= 1;
    }

    /// Release the `n` most recently claimed temporary slots.
    pub fn free_temps(&mut self, n: usize) {
        debug_assert!(self.temp_sp >= n);
        self.temp_sp -= n;
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Park an error in the pending-exception slot and return the error
    /// sentinel (the non-direct error path).
    pub fn raise(&mut self, err: RtError) -> Value {
        self.pending_exception = Some(err);
        Value::ERROR
    }

    /// Take the pending exception, if any.
    pub fn take_pending(&mut self) -> Option<RtError> {
        self.pending_exception.take()
    }

    /// Is an exception in flight?
    pub fn has_pending(&self) -> bool {
        self.pending_exception.is_some()
    }

    /// Enter a protected (try/finally) region.
    pub fn push_exc_context(&mut self) {
        self.exc_stack.push(ExcContext {
            stack_sp: self.stack.depth(),
            frame_count: self.stack.frames.len(),
            temp_sp: self.temp_sp,
        });
    }

    /// Leave a protected region, unwinding to its entry state when `unwind`
    /// is set.
    pub fn pop_exc_context(&mut self, unwind: bool) {
        let ctx = self.exc_stack.pop().expect("pop_exc_context: empty");
        if unwind {
            self.stack.sp = ctx.stack_sp;
            self.stack.frames.truncate(ctx.frame_count);
            self.temp_sp = ctx.temp_sp;
        }
    }
}

// Safety: see the module-level ownership protocol.
unsafe impl Send for ThreadCtx {}

// =============================================================================
// Thread handle
// =============================================================================

/// Owning handle for an attached mutator thread. Dereferences to the
/// thread's `ThreadCtx`; detaches from the runtime on drop.
///
/// Deliberately not `Send`: a `ThreadCtx` is affine to the OS thread that
/// attached it.
pub struct Thread {
    pub(crate) ctx: *mut ThreadCtx,
    pub(crate) rt: Arc<Runtime>,
}

impl Thread {
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Cooperative safe point: parks for an in-progress collection and
    /// delivers pending interrupts.
    pub fn safepoint(&mut self) -> Result<(), RtError> {
        let rt = self.rt.clone();
        let ctx = unsafe { &mut *self.ctx };
        if rt.freeze_requested() {
            rt.park_current(ctx);
        }
        if ctx.interrupt_pending.swap(false, Ordering::AcqRel) || rt.take_interrupt() {
            return Err(RtError::Interrupt);
        }
        Ok(())
    }

    /// Mark the thread as outside the heap for the duration of a blocking
    /// syscall. The collector will not wait for it.
    pub fn enter_blocking(&mut self) {
        unsafe { &*self.ctx }
            .park
            .store(PARK_BLOCKING, Ordering::Release);
    }

    /// Return from a blocking syscall. Re-checks for an in-progress
    /// collection before touching the heap again, and reports whether an
    /// interrupt arrived (the `EINTR` path re-checks it after wakeups).
    pub fn exit_blocking(&mut self) -> Result<(), RtError> {
        unsafe { &*self.ctx }
            .park
            .store(PARK_ACTIVE, Ordering::Release);
        self.safepoint()
    }
}

impl Deref for Thread {
    type Target = ThreadCtx;
    fn deref(&self) -> &ThreadCtx {
        unsafe { &*self.ctx }
    }
}

impl DerefMut for Thread {
    fn deref_mut(&mut self) -> &mut ThreadCtx {
        unsafe { &mut *self.ctx }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.rt.detach_thread(self.ctx);
    }
}

// =============================================================================
// Thread-argument transport ring
// =============================================================================

/// Fixed-capacity circular buffer carrying argument triples from spawning
/// threads to newly created ones. Scanned as a GC root: values parked here
/// have no other owner yet.
pub struct ArgRing {
    slots: [Value; crate::config::THREAD_ARG_BUFFER_TRIPLES * 3],
    head: usize,
    len: usize,
}

impl ArgRing {
    pub(crate) fn new() -> ArgRing {
        ArgRing {
            slots: [Value::NIL; crate::config::THREAD_ARG_BUFFER_TRIPLES * 3],
            head: 0,
            len: 0,
        }
    }

    /// Park a triple; fails when the ring is full.
    pub fn push(&mut self, args: [Value; 3]) -> Result<(), RtError> {
        if self.len + 3 > self.slots.len() {
            return Err(RtError::runtime("thread argument buffer full"));
        }
        for (i, v) in args.into_iter().enumerate() {
            self.slots[(self.head + self.len + i) % self.slots.len()] = v;
        }
        self.len += 3;
        Ok(())
    }

    /// Take the oldest triple.
    pub fn pop(&mut self) -> Option<[Value; 3]> {
        if self.len == 0 {
            return None;
        }
        let mut out = [Value::NIL; 3];
        for (i, o) in out.iter_mut().enumerate() {
            let idx = (self.head + i) % self.slots.len();
            *o = self.slots[idx];
            self.slots[idx] = Value::NIL;
        }
        self.head = (self.head + 3) % self.slots.len();
        self.len -= 3;
        Some(out)
    }

    /// Every occupied slot, for root scanning.
    pub(crate) fn scan_slots(&mut self) -> impl Iterator<Item = *mut Value> {
        let head = self.head;
        let len = self.len;
        let cap = self.slots.len();
        let base = self.slots.as_mut_ptr();
        (0..len).map(move |i| unsafe { base.add((head + i) % cap) })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_sentinel_and_frames() {
        let mut s = ValueStack::new(64);
        // Zero word at the bottom.
        assert_eq!(unsafe { (*s.base).to_bits() }, 0);
        assert_eq!(s.depth(), 1);

        let f = s.push_frame(Value::NIL, 3).unwrap();
        assert_eq!(f, 1);
        assert_eq!(s.depth(), 1 + 2 + 3);
        // Frame size word is a short int of the byte size.
        assert_eq!(s.get(f, 0), Value::NIL);
        s.set(f, 1, Value::from_int(7));
        assert_eq!(s.get(f, 1).as_int(), 7);

        let g = s.push_frame(Value::from_int(0), 1).unwrap();
        assert!(g > f);
        assert_eq!(s.current_frame(), Some(g));
        s.pop_frame();
        assert_eq!(s.current_frame(), Some(f));
        s.pop_frame();
        assert_eq!(s.depth(), 1);
    }

    #[test]
    fn test_stack_overflow() {
        let mut s = ValueStack::new(8);
        assert!(s.push_frame(Value::NIL, 2).is_ok());
        let err = s.push_frame(Value::NIL, 10).unwrap_err();
        assert!(matches!(err, RtError::Runtime(_)));
    }

    #[test]
    fn test_temp_slots() {
        let mut t = ThreadCtx::new(64);
        let a = t.alloc_temp();
        unsafe { *a = Value::from_int(1) };
        let b = t.alloc_temps(3);
        assert_eq!(t.temp_sp, 4);
        unsafe {
            assert_eq!(*b, Value::NIL);
            assert_eq!(*b.add(2), Value::NIL);
        }
        t.free_temps(3);
        t.free_temp();
        assert_eq!(t.temp_sp, 0);
    }

    #[test]
    fn test_pending_exception() {
        let mut t = ThreadCtx::new(64);
        assert!(!t.has_pending());
        let v = t.raise(RtError::value("bad"));
        assert!(v.is_error());
        assert!(t.has_pending());
        assert_eq!(t.take_pending(), Some(RtError::value("bad")));
        assert!(!t.has_pending());
    }

    #[test]
    fn test_exc_context_unwind() {
        let mut t = ThreadCtx::new(64);
        let f = t.stack.push_frame(Value::NIL, 2).unwrap();
        t.alloc_temp();
        t.push_exc_context();

        // Work inside the protected region.
        t.stack.push_frame(Value::NIL, 4).unwrap();
        t.alloc_temps(2);
        assert_ne!(t.stack.current_frame(), Some(f));

        t.pop_exc_context(true);
        assert_eq!(t.stack.current_frame(), Some(f));
        assert_eq!(t.temp_sp, 1);
    }

    #[test]
    fn test_arg_ring() {
        let mut ring = ArgRing::new();
        assert!(ring.pop().is_none());

        let a = [Value::from_int(1), Value::from_int(2), Value::from_int(3)];
        let b = [Value::NIL, Value::TRUE, Value::from_int(9)];
        ring.push(a).unwrap();
        ring.push(b).unwrap();
        assert_eq!(ring.scan_slots().count(), 6);
        assert_eq!(ring.pop(), Some(a));
        assert_eq!(ring.pop(), Some(b));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_arg_ring_capacity() {
        let mut ring = ArgRing::new();
        for i in 0..crate::config::THREAD_ARG_BUFFER_TRIPLES {
            ring.push([Value::from_int(i as isize); 3]).unwrap();
        }
        assert!(ring.push([Value::NIL; 3]).is_err());
        assert!(ring.pop().is_some());
        assert!(ring.push([Value::NIL; 3]).is_ok());
    }

    #[test]
    fn test_thread_ids_unique() {
        let a = ThreadCtx::new(16);
        let b = ThreadCtx::new(16);
        assert_ne!(a.id(), b.id());
    }
}
