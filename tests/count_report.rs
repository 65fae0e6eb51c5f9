//! Counter-mode end-to-end tests: drive the entry hook the way an
//! instrumented build would and check the process-exit report. Built only
//! with `--features count`.
//!
//! Counts land in 8-byte slots, so function addresses are compared
//! slot-rounded; the linker's 16-byte function alignment keeps distinct
//! functions in distinct slots.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

// The report path is relative to the working directory, which is
// process-global state; serialize the tests that touch it.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

fn enter(addr: u64) {
    calltrace::__cyg_profile_func_enter(addr as *mut c_void, ptr::null_mut());
}

fn leave(addr: u64) {
    calltrace::__cyg_profile_func_exit(addr as *mut c_void, ptr::null_mut());
}

#[inline(never)]
fn leaf_fn() {
    std::hint::black_box(0u64);
}

#[inline(never)]
fn mid_fn() {
    std::hint::black_box(1u64);
}

#[inline(never)]
fn top_fn() {
    std::hint::black_box(2u64);
}

#[inline(never)]
fn concurrent_fn() {
    std::hint::black_box(3u64);
}

#[inline(never)]
fn order_a_fn() {
    std::hint::black_box(4u64);
}

#[inline(never)]
fn order_b_fn() {
    std::hint::black_box(5u64);
}

fn slot_of(f: fn()) -> u64 {
    (f as usize as u64) & !7
}

/// Write the report into a fresh directory and parse its COUNTS section.
fn dump_and_parse() -> (String, HashMap<u64, u64>) {
    let dir = tempfile::tempdir().unwrap();
    let old_cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let res = calltrace::counters::write_report();
    std::env::set_current_dir(old_cwd).unwrap();
    res.unwrap();

    let text = std::fs::read_to_string(dir.path().join("funcount.txt")).unwrap();
    let counts_at = text.find("COUNTS\n").expect("report has no COUNTS section");
    let mut counts = HashMap::new();
    for line in text[counts_at + "COUNTS\n".len()..].lines() {
        let (addr, count) = line.split_once(' ').expect("malformed count line");
        let addr = u64::from_str_radix(addr.trim_start_matches("0x"), 16).unwrap();
        counts.insert(addr, count.parse::<u64>().unwrap());
    }
    (text, counts)
}

#[test]
fn test_nested_call_counts_are_exact() {
    let _guard = serial();
    const K: u64 = 100_000;
    let f = leaf_fn as usize as u64;
    let g = mid_fn as usize as u64;
    let h = top_fn as usize as u64;

    // h() calls g(); g() calls f() twice.
    for _ in 0..K {
        enter(h);
        enter(g);
        for _ in 0..2 {
            enter(f);
            leave(f);
        }
        leave(g);
        leave(h);
    }

    let (text, counts) = dump_and_parse();
    assert!(text.starts_with("FUNCOUNT\nPROCMAPS\n"));
    // The map section carries the test binary itself.
    assert!(text.contains("r-xp"));
    assert_eq!(counts.get(&slot_of(leaf_fn)), Some(&(2 * K)));
    assert_eq!(counts.get(&slot_of(mid_fn)), Some(&K));
    assert_eq!(counts.get(&slot_of(top_fn)), Some(&K));
}

#[test]
fn test_counts_sum_exactly_across_threads() {
    let _guard = serial();
    const THREADS: usize = 4;
    const PER_THREAD: u64 = 50_000;
    let target = concurrent_fn as usize as u64;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    enter(target);
                    leave(target);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let (_, counts) = dump_and_parse();
    assert_eq!(
        counts.get(&slot_of(concurrent_fn)),
        Some(&(THREADS as u64 * PER_THREAD))
    );
}

#[test]
fn test_report_addresses_are_ascending() {
    let _guard = serial();
    // Both directions, so the ordering cannot come from issue order.
    enter(order_b_fn as usize as u64);
    enter(order_a_fn as usize as u64);

    let dir = tempfile::tempdir().unwrap();
    let old_cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let res = calltrace::counters::write_report();
    std::env::set_current_dir(old_cwd).unwrap();
    res.unwrap();
    let text = std::fs::read_to_string(dir.path().join("funcount.txt")).unwrap();
    let counts_at = text.find("COUNTS\n").unwrap();
    let addrs: Vec<u64> = text[counts_at + "COUNTS\n".len()..]
        .lines()
        .map(|l| {
            u64::from_str_radix(l.split(' ').next().unwrap().trim_start_matches("0x"), 16).unwrap()
        })
        .collect();
    assert!(addrs.len() >= 2);
    assert!(addrs.windows(2).all(|w| w[0] < w[1]));
}
