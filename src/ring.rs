//! Per-thread cyclic buffer of call/return events.
//!
//! Each instrumented thread owns exactly one ring. The owner writes 16-byte
//! events on every function boundary with no locks and no branches beyond
//! the pause check; other threads read the ring only while the owner is
//! paused. The buffer is aligned to twice its (power-of-two) size so the
//! write cursor wraps by clearing a single bit of the advanced pointer
//! instead of taking a modulo or a conditional.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::clock;
use crate::extract;

/// Size of one event record in bytes.
pub const EVENT_SIZE: usize = 16;

/// log2 of the default per-thread buffer size in bytes (1 MiB).
pub const DEFAULT_LOG_BUF_SIZE: u32 = 20;

/// Smallest usable buffer holds two events; anything below opts the thread
/// out of tracing.
pub const MIN_LOG_BUF_SIZE: u32 = 5;

/// Largest supported buffer; keeps the doubled allocation alignment well
/// inside the address space.
pub const MAX_LOG_BUF_SIZE: u32 = 40;

/// A return event logs the address of the returning function.
pub const RETURN_BIT: u32 = 63;
/// Instrumentation variants that only know the return site log the caller's
/// address instead and set this bit.
pub const RETURN_WITH_CALLER_BIT: u32 = 62;
/// A tail call replaces the caller's frame; flagged so the decoder can pop
/// the replaced frame.
pub const TAILCALL_BIT: u32 = 61;

pub const FLAG_CALL: u64 = 0;
pub const FLAG_RETURN: u64 = 1 << RETURN_BIT;
pub const FLAG_RETURN_WITH_CALLER: u64 = 1 << RETURN_WITH_CALLER_BIT;
pub const FLAG_TAILCALL: u64 = 1 << TAILCALL_BIT;
/// An event cannot be both return flavors at once, so their combination is
/// reserved for catch markers logged on exception entry.
pub const FLAG_CATCH: u64 = FLAG_RETURN | FLAG_RETURN_WITH_CALLER;

/// Strips every flag bit off the first event word.
pub const ADDRESS_MASK: u64 = !(FLAG_RETURN | FLAG_RETURN_WITH_CALLER | FLAG_TAILCALL);

/// One recorded function boundary: the code address with flag bits in the
/// high word, and the cycle counter at issue time.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceEvent {
    pub addr_and_flags: u64,
    pub cycle: u64,
}

impl TraceEvent {
    pub fn address(&self) -> u64 {
        self.addr_and_flags & ADDRESS_MASK
    }

    pub fn is_return(&self) -> bool {
        self.addr_and_flags & FLAG_CATCH == FLAG_RETURN
    }

    pub fn is_catch(&self) -> bool {
        self.addr_and_flags & FLAG_CATCH == FLAG_CATCH
    }
}

/// The ring itself. Owned by one thread; `enabled`, `pos`, `buf` and `size`
/// are atomics so snapshot threads can read them while the owner is paused
/// and so straggler writes that race a pause stay well-defined.
pub struct ThreadRing {
    buf: AtomicPtr<u8>,
    size: AtomicUsize,
    pos: AtomicPtr<u8>,
    enabled: AtomicBool,
    pid: u32,
    tid: u32,
    name: Mutex<[u8; 16]>,
}

// SAFETY: the registry moves ring pointers across threads; all shared fields
// are atomics or mutex-guarded, and buffer cells are only read while the
// owner is paused.
unsafe impl Send for ThreadRing {}
unsafe impl Sync for ThreadRing {}

fn buf_layout(size: usize) -> Layout {
    // Alignment to twice the size is what makes single-bit wrapping work.
    Layout::from_size_align(size, size * 2).expect("ring size must be a power of two")
}

fn read_thread_name(tid: u32) -> [u8; 16] {
    let mut name = [0u8; 16];
    if let Ok(comm) = fs::read(format!("/proc/self/task/{tid}/comm")) {
        for (dst, src) in name.iter_mut().zip(comm.iter().filter(|&&b| b != b'\n')) {
            *dst = *src;
        }
    }
    name
}

impl ThreadRing {
    /// Allocate a ring of `2^log` bytes for the calling thread. Returns None
    /// when the allocation fails or `log` is below the two-event minimum.
    pub fn new(log: u32) -> Option<Box<ThreadRing>> {
        if !(MIN_LOG_BUF_SIZE..=MAX_LOG_BUF_SIZE).contains(&log) {
            return None;
        }
        let size = 1usize << log;
        // SAFETY: buf_layout is non-zero and power-of-two aligned. Zeroed
        // memory makes never-written slots decode as null events.
        let buf = unsafe { alloc_zeroed(buf_layout(size)) };
        if buf.is_null() {
            return None;
        }
        let tid = nix::unistd::gettid().as_raw() as u32;
        Some(Box::new(ThreadRing {
            buf: AtomicPtr::new(buf),
            size: AtomicUsize::new(size),
            pos: AtomicPtr::new(buf),
            enabled: AtomicBool::new(true),
            pid: std::process::id(),
            tid,
            name: Mutex::new(read_thread_name(tid)),
        }))
    }

    /// The hot path. One enabled check, two relaxed stores, one masked
    /// pointer bump. The timestamp is read before the store, so a reader can
    /// observe a stored event slightly after its recorded cycle, never
    /// before.
    #[inline(always)]
    pub fn trace(&self, addr: u64, flags: u64) {
        let enabled = self.enabled.load(Ordering::Relaxed);
        let pos = self.pos.load(Ordering::Relaxed);
        let cycle = clock::now();
        let word = addr | flags;
        if !enabled {
            return;
        }
        // SAFETY: pos always lies inside [buf, buf + size) on an event
        // boundary; relaxed atomic stores keep racing snapshot reads defined.
        unsafe {
            let cell = pos as *const AtomicU64;
            (*cell).store(word, Ordering::Relaxed);
            (*cell.add(1)).store(cycle, Ordering::Relaxed);
        }
        let size = self.size.load(Ordering::Relaxed);
        // buf is aligned to 2*size, so the advanced pointer overflows into
        // exactly bit log2(size); clearing it wraps to the base.
        let next = ((pos as usize + EVENT_SIZE) & !size) as *mut u8;
        self.pos.store(next, Ordering::Relaxed);
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn name(&self) -> [u8; 16] {
        *self.name.lock().unwrap()
    }

    /// Re-read the thread's name from the kernel; called under the registry
    /// lock during snapshots since threads rename themselves at will.
    pub fn refresh_name(&self) {
        *self.name.lock().unwrap() = read_thread_name(self.tid);
    }

    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn capacity_events(&self) -> usize {
        self.size_bytes() / EVENT_SIZE
    }

    /// Base pointer and length of the raw event bytes, for write-through
    /// serialization. Only meaningful while the owner is paused.
    pub fn raw_parts(&self) -> (*const u8, usize) {
        (self.buf.load(Ordering::Relaxed), self.size_bytes())
    }

    /// Detached copy of the whole buffer.
    pub fn copy_raw(&self) -> Vec<u8> {
        let (buf, size) = self.raw_parts();
        if buf.is_null() {
            return Vec::new();
        }
        // SAFETY: buf covers size bytes; the owner is paused, and the worst
        // a straggler in-flight write can do is tear one event, which the
        // decoder tolerates.
        unsafe { std::slice::from_raw_parts(buf, size) }.to_vec()
    }

    fn cell(&self, idx: usize) -> *const AtomicU64 {
        let buf = self.buf.load(Ordering::Relaxed) as usize;
        (buf + idx * EVENT_SIZE) as *const AtomicU64
    }

    fn cycle_at(&self, idx: usize) -> u64 {
        // SAFETY: idx < capacity_events(); cells are read with relaxed
        // atomic loads to stay defined against straggler writes.
        unsafe { (*self.cell(idx).add(1)).load(Ordering::Relaxed) }
    }

    fn event_at(&self, idx: usize) -> TraceEvent {
        // SAFETY: as in cycle_at.
        unsafe {
            TraceEvent {
                addr_and_flags: (*self.cell(idx)).load(Ordering::Relaxed),
                cycle: (*self.cell(idx).add(1)).load(Ordering::Relaxed),
            }
        }
    }

    /// Collect every event with `cycle >= t` into a dense buffer sized
    /// exactly to the found count. The two halves of the paused ring are
    /// binary-searched independently and their tails concatenated; entries
    /// stamped after `pause_time` are the straggler class and are excluded.
    pub fn copy_events_since(&self, t: u64, pause_time: u64) -> Vec<TraceEvent> {
        let total = self.capacity_events();
        if total == 0 {
            return Vec::new();
        }
        let buf = self.buf.load(Ordering::Relaxed) as usize;
        let pos = self.pos.load(Ordering::Relaxed) as usize;
        let pos_idx = (pos - buf) / EVENT_SIZE;

        // Oldest events live at [pos_idx, total), newer ones at [0, pos_idx).
        let high_len = total - pos_idx;
        let high_start =
            extract::tail_start(high_len, t, pause_time, |i| self.cycle_at(pos_idx + i));
        let low_start = extract::tail_start(pos_idx, t, pause_time, |i| self.cycle_at(i));

        let count = (high_len - high_start) + (pos_idx - low_start);
        let mut out = Vec::with_capacity(count);
        for idx in (pos_idx + high_start)..total {
            out.push(self.event_at(idx));
        }
        for idx in low_start..pos_idx {
            out.push(self.event_at(idx));
        }
        out
    }

    /// Replace the buffer with a fresh one of `2^log` bytes. Owner-only;
    /// the registry lock must be held so no snapshot is mid-read.
    pub fn resize(&self, log: u32) -> bool {
        if log > MAX_LOG_BUF_SIZE {
            return false;
        }
        let new_size = 1usize << log;
        // SAFETY: as in new().
        let new_buf = unsafe { alloc_zeroed(buf_layout(new_size)) };
        if new_buf.is_null() {
            return false;
        }
        let old_buf = self.buf.swap(new_buf, Ordering::Relaxed);
        let old_size = self.size.swap(new_size, Ordering::Relaxed);
        self.pos.store(new_buf, Ordering::Relaxed);
        if !old_buf.is_null() {
            // SAFETY: old_buf was allocated with this exact layout.
            unsafe { dealloc(old_buf, buf_layout(old_size)) };
        }
        true
    }
}

impl Drop for ThreadRing {
    fn drop(&mut self) {
        let buf = self.buf.swap(ptr::null_mut(), Ordering::Relaxed);
        if !buf.is_null() {
            // SAFETY: buf was allocated with this exact layout.
            unsafe { dealloc(buf, buf_layout(self.size.load(Ordering::Relaxed))) };
        }
    }
}
