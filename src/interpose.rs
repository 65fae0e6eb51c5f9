//! Interposition of the dynamic loader, thread creation and C++ exception
//! entry points.
//!
//! Each wrapper resolves the real definition with `dlsym(RTLD_NEXT, ..)`
//! once and forwards to it. Thread creation is wrapped so the injected
//! trampoline can allocate and register the new thread's ring before any
//! user code runs - keeping the hot path free of a first-call check - and
//! free it when the start routine returns. Dynamic loads re-preallocate the
//! counter store; exception entry points log pseudo-events so the decoder
//! can see stack unwinding.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::counters;
#[cfg(target_arch = "x86_64")]
use crate::hooks::trace_event;
use crate::registry;
use crate::ring::DEFAULT_LOG_BUF_SIZE;
#[cfg(target_arch = "x86_64")]
use crate::ring::{FLAG_CALL, FLAG_CATCH, FLAG_RETURN};

/// The next definition of `name` in lookup order after our own.
fn next_symbol(name: &CStr) -> *mut c_void {
    // SAFETY: dlsym(RTLD_NEXT) is the documented interposition idiom; the
    // name is NUL-terminated.
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) }
}

/// Resolve-once cache for a real entry point.
fn resolve(cache: &AtomicUsize, name: &CStr) -> usize {
    let mut real = cache.load(Ordering::Relaxed);
    if real == 0 {
        real = next_symbol(name) as usize;
        cache.store(real, Ordering::Relaxed);
    }
    real
}

type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

struct SpawnArgs {
    start: StartRoutine,
    arg: *mut c_void,
}

extern "C" fn spawn_trampoline(raw: *mut c_void) -> *mut c_void {
    // SAFETY: raw is the SpawnArgs box leaked by pthread_create below.
    let args = unsafe { Box::from_raw(raw as *mut SpawnArgs) };
    if cfg!(feature = "trace") {
        registry::init_current_thread(DEFAULT_LOG_BUF_SIZE);
    }
    let ret = (args.start)(args.arg);
    registry::drop_current_thread();
    ret
}

type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> c_int;

/// # Safety
///
/// Exactly the contract of `pthread_create(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    static REAL: AtomicUsize = AtomicUsize::new(0);
    let real = resolve(&REAL, c"pthread_create");
    if real == 0 {
        return libc::EAGAIN;
    }
    let real: PthreadCreateFn = std::mem::transmute(real);
    let args = Box::into_raw(Box::new(SpawnArgs { start, arg }));
    let rc = real(thread, attr, spawn_trampoline, args as *mut c_void);
    if rc != 0 {
        // The trampoline never ran; reclaim its arguments.
        drop(Box::from_raw(args));
    }
    rc
}

type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

/// # Safety
///
/// Exactly the contract of `dlopen(3)`.
#[no_mangle]
pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    static REAL: AtomicUsize = AtomicUsize::new(0);
    let real = resolve(&REAL, c"dlopen");
    if real == 0 {
        return std::ptr::null_mut();
    }
    let real: DlopenFn = std::mem::transmute(real);
    let handle = real(filename, flags);
    if !handle.is_null() {
        // Newly mapped executable segments need counter pages before the
        // library's code starts getting charged.
        counters::on_executable_mapped();
    }
    handle
}

#[cfg(target_arch = "x86_64")]
type BeginCatchFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

#[cfg(target_arch = "x86_64")]
extern "C" fn begin_catch_impl(exception: *mut c_void, landing_pad: u64) -> *mut c_void {
    // The return address of the interposer is inside the catching
    // function's landing pad; that is the address the marker carries.
    trace_event(landing_pad, FLAG_CATCH);
    static REAL: AtomicUsize = AtomicUsize::new(0);
    let real = resolve(&REAL, c"__cxa_begin_catch");
    if real == 0 {
        return std::ptr::null_mut();
    }
    // SAFETY: forwarding the original argument to the real entry point.
    unsafe {
        let real: BeginCatchFn = std::mem::transmute(real);
        real(exception)
    }
}

/// C++ catch entry. The wrapper grabs its own return address for the catch
/// marker and tail-jumps into the implementation with it as a second
/// argument.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn __cxa_begin_catch(_exception: *mut c_void) -> *mut c_void {
    core::arch::naked_asm!(
        "mov rsi, [rsp]",
        "jmp {imp}",
        imp = sym begin_catch_impl,
    )
}

#[cfg(target_arch = "x86_64")]
type CxaThrowFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> !;

#[cfg(target_arch = "x86_64")]
extern "C" fn throw_impl(
    exception: *mut c_void,
    tinfo: *mut c_void,
    dest: *mut c_void,
    throw_site: u64,
) -> ! {
    // The throw never returns, so bracket it with a call/return point pair;
    // the decoder then sees a balanced frame at the throw site before the
    // unwind rips the stack.
    trace_event(throw_site, FLAG_CALL);
    trace_event(throw_site, FLAG_RETURN);
    static REAL: AtomicUsize = AtomicUsize::new(0);
    let real = resolve(&REAL, c"__cxa_throw");
    if real == 0 {
        // No unwinder to forward to; matching the real entry point's
        // promise not to return.
        std::process::abort();
    }
    // SAFETY: forwarding the original arguments to the real entry point.
    unsafe {
        let real: CxaThrowFn = std::mem::transmute(real);
        real(exception, tinfo, dest)
    }
}

/// C++ throw entry; never returns.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn __cxa_throw(
    _exception: *mut c_void,
    _tinfo: *mut c_void,
    _dest: *mut c_void,
) -> ! {
    core::arch::naked_asm!(
        "mov rcx, [rsp]",
        "jmp {imp}",
        imp = sym throw_impl,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_entry_points_resolve() {
        assert!(!next_symbol(c"pthread_create").is_null());
        assert!(!next_symbol(c"dlopen").is_null());
    }

    #[cfg(feature = "trace")]
    #[test]
    fn test_spawned_threads_get_a_ring_before_user_code() {
        std::thread::spawn(|| {
            assert!(!registry::current_ring().is_null());
            registry::drop_current_thread();
        })
        .join()
        .unwrap();
    }
}
