//! Sparse page-table store of per-function call counters.
//!
//! Code addresses live in a 48-bit space, split into three 16-bit slices
//! that index a fixed-shape radix tree: a top table of mid tables of leaf
//! pages, where a leaf page holds 8192 atomic 64-bit counters. Pages
//! covering the executable segments are materialized up front so the hot
//! path is three array indexes and one atomic add, with no allocation and no
//! lock. An address whose page is missing (code mapped after the last
//! preallocation pass) is charged to a per-store `unknown` sink instead -
//! the hot path refuses to allocate.
//!
//! Tree slots are installed with a compare-and-swap; a losing installer
//! parks its freshly allocated node in a thread-local spare slot for the
//! next attempt, so no node is freed and none is leaked in the steady state.
//! Pages are never reclaimed before the process-exit report.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;

use anyhow::{Context, Result};

use crate::proc_maps;

/// Bits per address slice; 3 slices cover the 48-bit user address space.
pub const PAGE_BITS: u32 = 16;
const SLOTS: usize = 1 << PAGE_BITS;
const SLICE_MASK: u64 = (SLOTS - 1) as u64;
const COUNTS_PER_PAGE: usize = SLOTS / std::mem::size_of::<u64>();

/// Number of independent stores a single logical store is split into.
/// Each event increments exactly one shard; shards are summed at dump time.
#[cfg(feature = "sharded-counters")]
pub const SHARDS: usize = 4;
#[cfg(not(feature = "sharded-counters"))]
pub const SHARDS: usize = 1;

/// Default output path of the counter-mode report.
pub const COUNT_REPORT_PATH: &str = "funcount.txt";

#[repr(C)]
struct CountsPage {
    counts: [AtomicU64; COUNTS_PER_PAGE],
}

#[repr(C)]
struct MidTable {
    pages: [AtomicPtr<CountsPage>; SLOTS],
}

#[repr(C)]
struct TopTable {
    tables: [AtomicPtr<MidTable>; SLOTS],
}

/// Allocate a zeroed `T` off the heap without constructing it on the stack.
/// Returns null when the allocator refuses.
///
/// Valid only for types whose all-zero bit pattern is a valid value; the
/// tree nodes are arrays of atomics, so zero means "0" or "null slot".
fn alloc_zeroed_raw<T>() -> *mut T {
    let layout = Layout::new::<T>();
    // SAFETY: layout is non-zero-sized and correctly aligned for T.
    unsafe { std::alloc::alloc_zeroed(layout) as *mut T }
}

thread_local! {
    // Spare nodes kept by CAS losers for their next installation attempt.
    static SPARE_MID: Cell<*mut MidTable> = const { Cell::new(ptr::null_mut()) };
    static SPARE_PAGE: Cell<*mut CountsPage> = const { Cell::new(ptr::null_mut()) };
}

/// One radix tree plus its `unknown` sink.
pub struct CounterStore {
    top: *mut TopTable,
    unknown: AtomicU64,
}

// SAFETY: all mutation goes through atomics; tree nodes are never freed
// while the store is alive.
unsafe impl Send for CounterStore {}
unsafe impl Sync for CounterStore {}

#[inline(always)]
fn high_bits(addr: u64) -> usize {
    ((addr >> (2 * PAGE_BITS)) & SLICE_MASK) as usize
}

#[inline(always)]
fn mid_bits(addr: u64) -> usize {
    ((addr >> PAGE_BITS) & SLICE_MASK) as usize
}

#[inline(always)]
fn low_bits(addr: u64) -> usize {
    (addr & SLICE_MASK) as usize
}

impl CounterStore {
    /// Fails only when the top-level table itself cannot be allocated.
    pub fn new() -> Option<CounterStore> {
        let top = alloc_zeroed_raw::<TopTable>();
        if top.is_null() {
            return None;
        }
        Some(CounterStore {
            top,
            unknown: AtomicU64::new(0),
        })
    }

    fn top(&self) -> &TopTable {
        // SAFETY: self.top is non-null for the lifetime of the store.
        unsafe { &*self.top }
    }

    fn ensure_mid(&self, high: usize) -> Option<&MidTable> {
        let slot = &self.top().tables[high];
        let mut p = slot.load(Ordering::Acquire);
        if p.is_null() {
            let fresh = SPARE_MID.with(|c| {
                let spare = c.replace(ptr::null_mut());
                if spare.is_null() {
                    alloc_zeroed_raw()
                } else {
                    spare
                }
            });
            if fresh.is_null() {
                return None;
            }
            match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => p = fresh,
                Err(existing) => {
                    // Lost the install race; keep the node for next time.
                    SPARE_MID.with(|c| c.set(fresh));
                    p = existing;
                }
            }
        }
        // SAFETY: a non-null slot never reverts to null.
        Some(unsafe { &*p })
    }

    fn ensure_page(&self, addr: u64) -> Option<&CountsPage> {
        let mid = self.ensure_mid(high_bits(addr))?;
        let slot = &mid.pages[mid_bits(addr)];
        let mut p = slot.load(Ordering::Acquire);
        if p.is_null() {
            let fresh = SPARE_PAGE.with(|c| {
                let spare = c.replace(ptr::null_mut());
                if spare.is_null() {
                    alloc_zeroed_raw()
                } else {
                    spare
                }
            });
            if fresh.is_null() {
                return None;
            }
            match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => p = fresh,
                Err(existing) => {
                    SPARE_PAGE.with(|c| c.set(fresh));
                    p = existing;
                }
            }
        }
        // SAFETY: a non-null slot never reverts to null.
        Some(unsafe { &*p })
    }

    /// Materialize every leaf page covering `[base, base + size)`.
    /// Returns false if any page could not be allocated; counts for the
    /// uncovered range will fall through to the `unknown` sink.
    pub fn preallocate(&self, base: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        let last = base + size - 1;
        if last >> (3 * PAGE_BITS) != 0 {
            return false;
        }
        let mut ok = true;
        let mut page = base & !SLICE_MASK;
        loop {
            if self.ensure_page(page).is_none() {
                ok = false;
            }
            match page.checked_add(SLOTS as u64) {
                Some(next) if next <= last => page = next,
                _ => break,
            }
        }
        ok
    }

    /// Atomically add 1 to the counter for `addr`. Never allocates: an
    /// address with no materialized page is charged to the unknown sink.
    #[inline(always)]
    pub fn increment(&self, addr: u64) {
        if addr >> (3 * PAGE_BITS) != 0 {
            self.unknown.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mid = self.top().tables[high_bits(addr)].load(Ordering::Acquire);
        if mid.is_null() {
            self.unknown.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // SAFETY: non-null slots point at live, zero-initialized nodes.
        let page = unsafe { &*mid }.pages[mid_bits(addr)].load(Ordering::Acquire);
        if page.is_null() {
            self.unknown.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let slot = low_bits(addr) / std::mem::size_of::<u64>();
        unsafe { &*page }.counts[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Visit every populated nonzero counter in ascending address order.
    pub fn visit_nonzero<F: FnMut(u64, u64)>(&self, mut cb: F) {
        for hi in 0..SLOTS {
            let mid = self.top().tables[hi].load(Ordering::Acquire);
            if mid.is_null() {
                continue;
            }
            for mi in 0..SLOTS {
                // SAFETY: as above.
                let page = unsafe { &*mid }.pages[mi].load(Ordering::Acquire);
                if page.is_null() {
                    continue;
                }
                for lo in 0..COUNTS_PER_PAGE {
                    let count = unsafe { &*page }.counts[lo].load(Ordering::Relaxed);
                    if count != 0 {
                        let addr = ((hi as u64) << (2 * PAGE_BITS))
                            | ((mi as u64) << PAGE_BITS)
                            | ((lo * std::mem::size_of::<u64>()) as u64);
                        cb(addr, count);
                    }
                }
            }
        }
    }

    /// Calls charged to this store whose address had no materialized page.
    pub fn unknown(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }
}

// Tree nodes are deliberately leaked: the store lives until the process-exit
// report and freeing half a million interior pointers buys nothing there.

/// `SHARDS` independent stores behind one facade. A single event increments
/// exactly one shard; dump order is made deterministic by merging into an
/// address-sorted map.
pub struct ShardedStore {
    shards: Vec<CounterStore>,
}

thread_local! {
    static SHARD_SEED: Cell<u32> = const { Cell::new(0) };
}

#[inline(always)]
fn shard_index() -> usize {
    if SHARDS == 1 {
        return 0;
    }
    SHARD_SEED.with(|seed| {
        let mut x = seed.get();
        if x == 0 {
            x = nix::unistd::gettid().as_raw() as u32 | 1;
        }
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        seed.set(x);
        x as usize % SHARDS
    })
}

impl ShardedStore {
    pub fn new() -> Option<ShardedStore> {
        let mut shards = Vec::with_capacity(SHARDS);
        for _ in 0..SHARDS {
            shards.push(CounterStore::new()?);
        }
        Some(ShardedStore { shards })
    }

    /// Preallocate `[base, base + size)` across every shard.
    pub fn preallocate(&self, base: u64, size: u64) -> bool {
        let mut ok = true;
        for shard in &self.shards {
            ok &= shard.preallocate(base, size);
        }
        ok
    }

    #[inline(always)]
    pub fn increment(&self, addr: u64) {
        self.shards[shard_index()].increment(addr);
    }

    /// Sum per-shard counts for each address, ascending by address.
    pub fn merged(&self) -> BTreeMap<u64, u64> {
        let mut merged = BTreeMap::new();
        for shard in &self.shards {
            shard.visit_nonzero(|addr, count| {
                *merged.entry(addr).or_insert(0) += count;
            });
        }
        merged
    }

    pub fn unknown_total(&self) -> u64 {
        self.shards.iter().map(|s| s.unknown()).sum()
    }
}

static GLOBAL_STORE: OnceLock<Option<ShardedStore>> = OnceLock::new();

/// Build the process-wide store and preallocate every currently mapped
/// executable segment. Called from the process constructor and safe to call
/// again (subsequent calls are no-ops).
pub fn init_global() {
    GLOBAL_STORE.get_or_init(|| {
        let store = match ShardedStore::new() {
            Some(s) => s,
            None => {
                eprintln!("calltrace: failed to allocate the call-count page table, counts will not be recorded");
                return None;
            }
        };
        preallocate_mapped_segments(&store);
        Some(store)
    });
}

/// Re-scan `/proc/self/maps` and materialize pages for any newly mapped
/// executable segment. Called at startup and after every dynamic load.
pub fn preallocate_mapped_segments(store: &ShardedStore) {
    let mut all_ok = true;
    let res = proc_maps::executable_segments(|start, size, _| {
        all_ok &= store.preallocate(start, size);
    });
    if res.is_err() {
        eprintln!("calltrace: failed to read /proc/self/maps, counts will go to the unknown sink");
    } else if !all_ok {
        eprintln!("calltrace: could not preallocate every executable segment, some counts will go to the unknown sink");
    }
}

/// Refresh preallocation on the global store, if counting is live.
pub fn on_executable_mapped() {
    if let Some(Some(store)) = GLOBAL_STORE.get() {
        preallocate_mapped_segments(store);
    }
}

/// The hot-path entry point for counter mode. Events arriving before the
/// constructor has run are dropped.
#[inline(always)]
pub fn record_call(addr: u64) {
    if let Some(Some(store)) = GLOBAL_STORE.get() {
        store.increment(addr);
    }
}

/// Write the process-exit report: the `FUNCOUNT` header, the raw process
/// map, and one `0x<addr> <count>` line per nonzero counter in ascending
/// address order. Shards are merged by addition.
pub fn write_report() -> Result<()> {
    let store = match GLOBAL_STORE.get() {
        Some(Some(store)) => store,
        _ => return Ok(()),
    };
    let file = File::create(COUNT_REPORT_PATH)
        .with_context(|| format!("failed to create {COUNT_REPORT_PATH}"))?;
    let mut out = BufWriter::new(file);
    out.write_all(b"FUNCOUNT\nPROCMAPS\n")?;
    let maps = proc_maps::raw_maps().context("failed to read /proc/self/maps")?;
    out.write_all(&maps)?;
    out.write_all(b"COUNTS\n")?;
    for (addr, count) in store.merged() {
        writeln!(out, "0x{addr:x} {count}")?;
    }
    out.flush()?;
    let unknown = store.unknown_total();
    if unknown > 0 {
        eprintln!(
            "calltrace: {unknown} calls hit addresses outside preallocated segments and were \
             counted as unknown"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unpreallocated_address_goes_to_unknown() {
        let store = CounterStore::new().unwrap();
        store.increment(0x5555_0000_1234);
        assert_eq!(store.unknown(), 1);
        let mut seen = 0;
        store.visit_nonzero(|_, _| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_address_above_48_bits_goes_to_unknown() {
        let store = CounterStore::new().unwrap();
        store.preallocate(0x1000, 0x1000);
        store.increment(0xffff_0000_0000_1000);
        assert_eq!(store.unknown(), 1);
    }

    #[test]
    fn test_preallocated_counts_land_on_slot_boundaries() {
        let store = CounterStore::new().unwrap();
        assert!(store.preallocate(0x7f00_1234_5000, 0x2000));
        store.increment(0x7f00_1234_5010);
        store.increment(0x7f00_1234_5010);
        store.increment(0x7f00_1234_5018);
        // Addresses within the same 8-byte slot share a counter.
        store.increment(0x7f00_1234_5013);
        let mut found = Vec::new();
        store.visit_nonzero(|addr, count| found.push((addr, count)));
        assert_eq!(found, vec![(0x7f00_1234_5010, 3), (0x7f00_1234_5018, 1)]);
        assert_eq!(store.unknown(), 0);
    }

    #[test]
    fn test_preallocate_spans_page_boundaries() {
        let store = CounterStore::new().unwrap();
        // Range crossing a 64 KiB page boundary must materialize both pages.
        assert!(store.preallocate(0x1_0000_f000, 0x2000));
        store.increment(0x1_0000_f008);
        store.increment(0x1_0001_0008);
        assert_eq!(store.unknown(), 0);
        let mut found = 0;
        store.visit_nonzero(|_, count| found += count);
        assert_eq!(found, 2);
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        const THREADS: usize = 4;
        const PER_THREAD: u64 = 100_000;
        let store = Arc::new(CounterStore::new().unwrap());
        store.preallocate(0x4000_0000, 0x1000);
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    store.increment(0x4000_0040);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut found = Vec::new();
        store.visit_nonzero(|addr, count| found.push((addr, count)));
        assert_eq!(found, vec![(0x4000_0040, THREADS as u64 * PER_THREAD)]);
    }

    #[test]
    fn test_sharded_store_merges_by_addition() {
        let store = Arc::new(ShardedStore::new().unwrap());
        store.preallocate(0x4000_0000, 0x1000);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    store.increment(0x4000_0100);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let merged = store.merged();
        assert_eq!(merged.get(&0x4000_0100), Some(&40_000));
        assert_eq!(store.unknown_total(), 0);
    }

    #[test]
    fn test_visit_order_is_ascending() {
        let store = CounterStore::new().unwrap();
        store.preallocate(0x10_0000, 0x1000);
        store.preallocate(0x7fff_0000_0000, 0x1000);
        store.increment(0x7fff_0000_0008);
        store.increment(0x10_0008);
        let mut addrs = Vec::new();
        store.visit_nonzero(|addr, _| addrs.push(addr));
        assert_eq!(addrs, vec![0x10_0008, 0x7fff_0000_0008]);
    }
}
