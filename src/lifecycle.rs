//! Process start and exit glue, and the signal-triggered snapshot worker.
//!
//! The constructor pins the clock frequency, builds the counter store over
//! every executable segment (count mode), registers the main thread's ring,
//! starts scheduler-event capture and installs the snapshot signal (trace
//! mode). The destructor writes the counter report. The signal handler
//! itself only pokes an eventfd; a dedicated worker thread does the actual
//! snapshot writing, since nothing about it is async-signal-safe.

use std::ffi::c_void;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use ctor::{ctor, dtor};
use nix::errno::Errno;

use crate::clock;
use crate::counters;
use crate::ftrace;
use crate::registry;
use crate::ring::DEFAULT_LOG_BUF_SIZE;
use crate::snapshot;

/// Environment variable overriding the snapshot signal number.
pub const SIGNAL_ENV: &str = "FUNTRACE_SIGNAL";

static SNAPSHOT_EVENTFD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_snapshot_signal(_sig: libc::c_int) {
    // Async-signal-safe only: wake the worker through the eventfd.
    let fd = SNAPSHOT_EVENTFD.load(Ordering::Relaxed);
    if fd >= 0 {
        let val: u64 = 1;
        // SAFETY: write(2) on an eventfd is async-signal-safe.
        unsafe { libc::write(fd, &val as *const u64 as *const c_void, 8) };
    }
}

fn snapshot_signal() -> libc::c_int {
    match std::env::var(SIGNAL_ENV) {
        Ok(s) => s.trim().parse().unwrap_or(libc::SIGTRAP),
        Err(_) => libc::SIGTRAP,
    }
}

fn install_signal_worker() {
    // SAFETY: plain eventfd creation.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        eprintln!(
            "calltrace: failed to create the snapshot eventfd, signal-triggered snapshots are off"
        );
        return;
    }
    SNAPSHOT_EVENTFD.store(fd, Ordering::Relaxed);

    let spawned = thread::Builder::new()
        .name("calltrace-snap".to_string())
        .spawn(move || {
            // The worker's own activity has no place in the traces it dumps.
            registry::ignore_current_thread();
            loop {
                let mut val = 0u64;
                // SAFETY: fd stays open for the life of the process.
                let n = unsafe { libc::read(fd, &mut val as *mut u64 as *mut c_void, 8) };
                if n != 8 {
                    if Errno::last() == Errno::EINTR {
                        continue;
                    }
                    break;
                }
                snapshot::write_current_snapshot();
            }
        });
    if spawned.is_err() {
        eprintln!("calltrace: failed to spawn the snapshot worker, signal-triggered snapshots are off");
        return;
    }

    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    let handler: extern "C" fn(libc::c_int) = on_snapshot_signal;
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_RESTART;
    // SAFETY: the handler is async-signal-safe and the struct is fully
    // initialized.
    let rc = unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(snapshot_signal(), &sa, std::ptr::null_mut())
    };
    if rc != 0 {
        eprintln!(
            "calltrace: failed to install the snapshot signal handler: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Runs before main, ahead of any instrumented call the runtime can serve.
#[ctor]
fn calltrace_init() {
    // Pin the frequency before threads start racing for it.
    clock::cycles_per_second();
    if cfg!(feature = "count") {
        counters::init_global();
    }
    if cfg!(feature = "trace") {
        registry::init_current_thread(DEFAULT_LOG_BUF_SIZE);
        ftrace::init();
        install_signal_worker();
    }
}

/// Runs at process exit: emit the counter report and tear down the
/// kernel-side tracer instance.
#[dtor]
fn calltrace_fini() {
    if cfg!(feature = "count") {
        if let Err(e) = counters::write_report() {
            eprintln!("calltrace: failed to write the call-count report: {e:#}");
        }
    }
    ftrace::shutdown();
}
