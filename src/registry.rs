//! Process-wide registry of live per-thread rings.
//!
//! One mutex guards the ordered set of ring pointers and the lazily opened
//! output file. Registration happens on thread start (via the spawn
//! interposer or the process constructor), removal on thread exit or
//! explicit opt-out. Snapshots iterate the set under the lock, so a
//! registration that happens-before a snapshot is visible to it and a
//! thread can never observe its own removal mid-snapshot.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io;
use std::ptr;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::ring::{ThreadRing, MIN_LOG_BUF_SIZE};

/// Default output path of trace snapshots, appended to in the working
/// directory.
pub const TRACE_OUTPUT_PATH: &str = "funtrace.raw";

/// A ring pointer parked in the registry. The pointee is owned by its
/// thread; the registry only dereferences it under the lock.
struct RingPtr(*mut ThreadRing);

// SAFETY: ThreadRing is Sync; the raw pointer is only dereferenced under
// the registry lock while the owning thread is alive (unregistration
// happens-before the owner frees the ring).
unsafe impl Send for RingPtr {}

pub struct RegistryInner {
    rings: Vec<RingPtr>,
    out: Option<File>,
}

impl RegistryInner {
    /// Iterate the live rings in registration order.
    pub fn for_each<F: FnMut(&ThreadRing)>(&self, mut f: F) {
        for ptr in &self.rings {
            // SAFETY: see RingPtr.
            f(unsafe { &*ptr.0 });
        }
    }

    /// The shared snapshot output file, opened for append on first use.
    pub fn output_file(&mut self) -> io::Result<&mut File> {
        if self.out.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(TRACE_OUTPUT_PATH)?;
            self.out = Some(file);
        }
        Ok(self.out.as_mut().unwrap())
    }
}

static REGISTRY: Mutex<RegistryInner> = Mutex::new(RegistryInner {
    rings: Vec::new(),
    out: None,
});

pub fn lock() -> MutexGuard<'static, RegistryInner> {
    REGISTRY.lock().unwrap()
}

thread_local! {
    // Const-initialized so the hot path is a plain TLS load with no lazy
    // initialization check; null means "this thread is not traced".
    static CURRENT: Cell<*mut ThreadRing> = const { Cell::new(ptr::null_mut()) };
}

/// The calling thread's ring, or null when it has none.
#[inline(always)]
pub fn current_ring() -> *mut ThreadRing {
    CURRENT.get()
}

/// Allocate and register a ring for the calling thread. Idempotent: a
/// thread that already has a ring keeps it.
pub fn init_current_thread(log: u32) {
    if !CURRENT.get().is_null() {
        return;
    }
    let ring = match ThreadRing::new(log) {
        Some(r) => r,
        None => {
            eprintln!("calltrace: failed to allocate a {}-byte trace buffer, thread will not be traced", 1u64 << log);
            return;
        }
    };
    let raw = Box::into_raw(ring);
    lock().rings.push(RingPtr(raw));
    CURRENT.set(raw);
}

/// Unregister and free the calling thread's ring, if any. The pointer is
/// removed under the lock before the backing memory goes away, so no
/// snapshot can be left holding it.
pub fn drop_current_thread() {
    let raw = CURRENT.replace(ptr::null_mut());
    if raw.is_null() {
        return;
    }
    {
        let mut inner = lock();
        if let Some(idx) = inner.rings.iter().position(|p| p.0 == raw) {
            inner.rings.swap_remove(idx);
        }
    }
    // SAFETY: raw came from Box::into_raw in init_current_thread and is no
    // longer reachable from the registry.
    drop(unsafe { Box::from_raw(raw) });
}

/// Opt the calling thread out of tracing for good (until it re-registers
/// by resizing its buffer).
pub fn ignore_current_thread() {
    drop_current_thread();
}

/// Replace the calling thread's buffer with one of `2^log` bytes. A size
/// below the two-event minimum opts the thread out instead; a thread that
/// previously opted out is re-registered.
pub fn set_thread_log_buf_size(log: u32) {
    if log < MIN_LOG_BUF_SIZE {
        ignore_current_thread();
        return;
    }
    let raw = CURRENT.get();
    if raw.is_null() {
        init_current_thread(log);
        return;
    }
    // Hold the lock so no snapshot reads the ring mid-swap.
    let _guard = lock();
    // SAFETY: raw is this thread's live ring.
    if !unsafe { &*raw }.resize(log) {
        eprintln!(
            "calltrace: failed to allocate a {}-byte trace buffer, keeping the old one",
            1u64 << log
        );
    }
}

/// Pause every ring. Does not wait for in-flight writes; snapshot readers
/// handle the stragglers.
pub fn disable_tracing() {
    lock().for_each(|ring| ring.set_enabled(false));
}

/// Resume every ring.
pub fn enable_tracing() {
    lock().for_each(|ring| ring.set_enabled(true));
}

/// The process command line with the kernel's NUL separators turned into
/// spaces, cached on first use.
pub fn cmdline() -> &'static [u8] {
    static CMDLINE: OnceLock<Vec<u8>> = OnceLock::new();
    CMDLINE.get_or_init(|| {
        let mut raw = std::fs::read("/proc/self/cmdline").unwrap_or_default();
        while raw.last() == Some(&0) {
            raw.pop();
        }
        for b in &mut raw {
            if *b == 0 {
                *b = b' ';
            }
        }
        raw
    })
}
