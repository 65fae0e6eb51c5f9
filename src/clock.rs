//! Cycle-counter time source and frequency discovery.
//!
//! Timestamps are raw TSC reads. The conversion factor to wall-clock time is
//! discovered once at startup through a three-tier fallback: the CPUID
//! frequency leaf, the kernel boot log, and finally a short busy calibration
//! against the monotonic clock. Whichever tier succeeds first wins and the
//! value is cached for the life of the process.

use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

/// Read the cycle counter. Monotonic per CPU; cores are loosely synchronized
/// by the hardware so cross-thread comparisons are approximate.
#[inline(always)]
pub fn now() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    monotonic_ns()
}

/// CLOCK_MONOTONIC in nanoseconds. Used for calibration and as the event
/// clock on targets without a cheap cycle counter.
pub fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

static CYCLES_PER_SECOND: OnceLock<u64> = OnceLock::new();

/// Cycles-per-second of the counter behind [`now`]. Computed on first use,
/// cached process-wide.
pub fn cycles_per_second() -> u64 {
    *CYCLES_PER_SECOND.get_or_init(|| {
        if let Some(freq) = cpuid_tsc_hz() {
            return freq;
        }
        if let Some(freq) = boot_log_tsc_hz() {
            return freq;
        }
        calibrated_tsc_hz()
    })
}

/// Tier 1: the CPUID processor-frequency leaf (0x16) reports the nominal
/// core frequency in MHz on CPUs where the TSC ticks at the nominal rate.
#[cfg(target_arch = "x86_64")]
fn cpuid_tsc_hz() -> Option<u64> {
    use core::arch::x86_64::__cpuid;

    // SAFETY: cpuid is unprivileged; leaf 0 reports the highest valid leaf.
    let max_leaf = unsafe { __cpuid(0) }.eax;
    if max_leaf < 0x16 {
        return None;
    }
    let leaf = unsafe { __cpuid(0x16) };
    if leaf.eax == 0 {
        return None;
    }
    Some(leaf.eax as u64 * 1_000_000)
}

#[cfg(not(target_arch = "x86_64"))]
fn cpuid_tsc_hz() -> Option<u64> {
    // Non-x86 targets use the monotonic clock directly, which ticks in
    // nanoseconds.
    Some(1_000_000_000)
}

/// Tier 2: the kernel logs the measured TSC rate at boot ("Detected
/// NNNN.NNN MHz TSC"). Scrape it out of the boot log.
fn boot_log_tsc_hz() -> Option<u64> {
    let out = Command::new("dmesg").output().ok()?;
    if !out.status.success() {
        return None;
    }
    parse_mhz_tsc(std::str::from_utf8(&out.stdout).ok()?)
}

fn parse_mhz_tsc(log: &str) -> Option<u64> {
    for line in log.lines() {
        if !line.contains("MHz TSC") {
            continue;
        }
        let mut prev: Option<&str> = None;
        for tok in line.split_whitespace() {
            if tok == "MHz" {
                if let Some(mhz) = prev.and_then(|p| p.parse::<f64>().ok()) {
                    return Some((mhz * 1e6) as u64);
                }
            }
            prev = Some(tok);
        }
    }
    None
}

/// Tier 3: measure the counter against CLOCK_MONOTONIC over a short sleep.
fn calibrated_tsc_hz() -> u64 {
    let ns0 = monotonic_ns();
    let c0 = now();
    std::thread::sleep(Duration::from_millis(50));
    let ns1 = monotonic_ns();
    let c1 = now();
    let dns = ns1.saturating_sub(ns0).max(1);
    let dc = c1.saturating_sub(c0);
    ((dc as u128 * 1_000_000_000) / dns as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic_on_one_thread() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn test_cycles_per_second_is_plausible() {
        let hz = cycles_per_second();
        // Anything between 100 MHz and 10 GHz is a believable clock.
        assert!(hz > 100_000_000, "frequency too low: {hz}");
        assert!(hz < 10_000_000_000, "frequency too high: {hz}");
        // Cached value is stable.
        assert_eq!(hz, cycles_per_second());
    }

    #[test]
    fn test_parse_mhz_tsc() {
        let log = "[    0.000000] tsc: Fast TSC calibration using PIT\n\
                   [    0.000000] tsc: Detected 2904.000 MHz processor\n\
                   [    0.152351] tsc: Detected 2903.998 MHz TSC\n";
        assert_eq!(parse_mhz_tsc(log), Some(2_903_998_000));
        assert_eq!(parse_mhz_tsc("no frequency here"), None);
    }
}
