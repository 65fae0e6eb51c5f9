//! The compiler-facing hook surface and the C ABI of the public API.
//!
//! Instrumented builds call `__cyg_profile_func_enter` / `_exit` on every
//! function boundary; builds using entry-point patching call the
//! register-preserving `__fentry__` / `__return__` pair instead. Which
//! engine the hooks feed is a build-time choice: the `count` feature tallies
//! calls in the page-table store, otherwise events go to the calling
//! thread's ring.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::os::unix::ffi::OsStrExt;

use crate::clock;
use crate::counters;
use crate::registry;
use crate::ring::{FLAG_CALL, FLAG_RETURN, FLAG_RETURN_WITH_CALLER};
use crate::snapshot::{self, Snapshot};

/// Append one event to the calling thread's ring; a thread with no ring
/// (opted out, or created before the runtime) drops the event.
#[inline(always)]
pub fn trace_event(addr: u64, flags: u64) {
    let ring = registry::current_ring();
    if ring.is_null() {
        return;
    }
    // SAFETY: a non-null TLS ring pointer refers to the calling thread's
    // live ring.
    unsafe { (*ring).trace(addr, flags) }
}

#[no_mangle]
pub extern "C" fn __cyg_profile_func_enter(func: *mut c_void, _caller: *mut c_void) {
    if cfg!(feature = "count") {
        counters::record_call(func as u64);
    } else {
        trace_event(func as u64, FLAG_CALL);
    }
}

#[no_mangle]
pub extern "C" fn __cyg_profile_func_exit(func: *mut c_void, _caller: *mut c_void) {
    if cfg!(feature = "count") {
        return;
    }
    trace_event(func as u64, FLAG_RETURN);
}

#[cfg(target_arch = "x86_64")]
extern "C" fn fentry_hook(func: u64, _caller: u64) {
    if cfg!(feature = "count") {
        counters::record_call(func);
    } else {
        trace_event(func, FLAG_CALL);
    }
}

#[cfg(target_arch = "x86_64")]
extern "C" fn return_hook(_func: u64, caller: u64) {
    if cfg!(feature = "count") {
        return;
    }
    // This instrumentation style does not know the returning function, only
    // the return site; the flag tells the decoder which one it got.
    trace_event(caller, FLAG_RETURN_WITH_CALLER);
}

/// Entry hook for `-mfentry`-style instrumentation: called before the
/// prologue, must preserve every volatile register. The argument registers
/// are spilled, the instrumented function's address (this call's return
/// address) and its caller's return address are dug out of the stack, and
/// the ordinary hook runs on top. The hook path stays free of FP and SIMD,
/// so the vector registers are left alone.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn __fentry__() {
    core::arch::naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        // 9 pushes leave the stack 8 short of 16-byte alignment.
        "sub rsp, 8",
        // [rsp+80]: return address into the instrumented function.
        // [rsp+88]: the instrumented function's own return address.
        "mov rdi, [rsp + 80]",
        "mov rsi, [rsp + 88]",
        "call {hook}",
        "add rsp, 8",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "ret",
        hook = sym fentry_hook,
    )
}

/// Exit counterpart of [`__fentry__`]; additionally preserves the return
/// value registers, which the same spill set already covers.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn __return__() {
    core::arch::naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "sub rsp, 8",
        "mov rdi, [rsp + 80]",
        "mov rsi, [rsp + 88]",
        "call {hook}",
        "add rsp, 8",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "ret",
        hook = sym return_hook,
    )
}

// C ABI wrappers around the public API, for consumers that are not Rust.

#[no_mangle]
pub extern "C" fn calltrace_now() -> u64 {
    clock::now()
}

#[no_mangle]
pub extern "C" fn calltrace_ticks_per_second() -> u64 {
    clock::cycles_per_second()
}

#[no_mangle]
pub extern "C" fn calltrace_write_current_snapshot() {
    snapshot::write_current_snapshot();
}

#[no_mangle]
pub extern "C" fn calltrace_get_snapshot() -> *mut Snapshot {
    Box::into_raw(Box::new(snapshot::get_snapshot()))
}

#[no_mangle]
pub extern "C" fn calltrace_get_snapshot_starting_at_time(t: u64) -> *mut Snapshot {
    Box::into_raw(Box::new(snapshot::get_snapshot_starting_at_time(t)))
}

#[no_mangle]
pub extern "C" fn calltrace_get_snapshot_up_to_age(dt: u64) -> *mut Snapshot {
    Box::into_raw(Box::new(snapshot::get_snapshot_up_to_age(dt)))
}

/// Serialize `snapshot` to the NUL-terminated `path`. Returns 0 on success.
///
/// # Safety
///
/// `path` must be a valid NUL-terminated string and `snapshot` a pointer
/// previously returned by one of the `calltrace_get_snapshot*` calls.
#[no_mangle]
pub unsafe extern "C" fn calltrace_write_snapshot(
    path: *const c_char,
    snapshot: *const Snapshot,
) -> c_int {
    if path.is_null() || snapshot.is_null() {
        return -1;
    }
    let path = std::ffi::OsStr::from_bytes(CStr::from_ptr(path).to_bytes());
    match snapshot::write_snapshot(path, &*snapshot) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("calltrace: {e:#}");
            -1
        }
    }
}

/// Release a snapshot returned by one of the `calltrace_get_snapshot*`
/// calls.
///
/// # Safety
///
/// `snapshot` must be such a pointer, not freed before, or null.
#[no_mangle]
pub unsafe extern "C" fn calltrace_free_snapshot(snapshot: *mut Snapshot) {
    if !snapshot.is_null() {
        drop(Box::from_raw(snapshot));
    }
}

#[no_mangle]
pub extern "C" fn calltrace_ignore_this_thread() {
    registry::ignore_current_thread();
}

#[no_mangle]
pub extern "C" fn calltrace_set_thread_log_buf_size(log: u32) {
    registry::set_thread_log_buf_size(log);
}

#[no_mangle]
pub extern "C" fn calltrace_disable_tracing() {
    registry::disable_tracing();
}

#[no_mangle]
pub extern "C" fn calltrace_enable_tracing() {
    registry::enable_tracing();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use std::ptr;

    #[test]
    fn test_cyg_hooks_feed_the_thread_ring() {
        let _serial = crate::test_sync::lock();
        std::thread::spawn(|| {
            registry::init_current_thread(9);
            let f = 0x1111_2222u64;
            __cyg_profile_func_enter(f as *mut c_void, ptr::null_mut());
            __cyg_profile_func_exit(f as *mut c_void, ptr::null_mut());
            let ring = registry::current_ring();
            // SAFETY: our own live ring.
            let events = unsafe { &*ring }.copy_events_since(1, clock::now());
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].address(), f);
            assert!(!events[0].is_return());
            assert_eq!(events[1].address(), f);
            assert!(events[1].is_return());
            registry::drop_current_thread();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_hooks_without_a_ring_are_noops() {
        std::thread::spawn(|| {
            registry::ignore_current_thread();
            assert!(registry::current_ring().is_null());
            __cyg_profile_func_enter(0x1234 as *mut c_void, ptr::null_mut());
            __cyg_profile_func_exit(0x1234 as *mut c_void, ptr::null_mut());
            assert!(registry::current_ring().is_null());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_snapshot_handle_round_trip_over_c_abi() {
        let _serial = crate::test_sync::lock();
        let s = calltrace_get_snapshot();
        assert!(!s.is_null());
        // SAFETY: s came from calltrace_get_snapshot just above.
        unsafe {
            assert!((*s).cycles_per_second > 0);
            calltrace_free_snapshot(s);
        }
    }
}
