//! Scheduler-event enrichment from a private kernel tracer instance.
//!
//! A dedicated tracefs instance is configured once - clock switched to the
//! CPU cycle counter, scheduling and task events enabled, filtered to this
//! process and its descendants minus the collecting thread - and a
//! background thread streams `trace_pipe` lines into a process-wide cyclic
//! buffer of fixed line count. Snapshots pull a time window out of that
//! buffer with the same two-sorted-subarrays search the event rings use,
//! keyed on the cycle stamp parsed from each line.
//!
//! Everything here is optional: a kernel without tracefs, missing
//! privileges, or the `FUNTRACE_NO_FTRACE` environment variable degrade to
//! no enrichment after a single warning.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::{bail, Context, Result};

use crate::extract;
use crate::registry;

/// Setting this environment variable (to anything) disables scheduler-event
/// capture.
pub const FTRACE_DISABLE_ENV: &str = "FUNTRACE_NO_FTRACE";

/// Fixed capacity of the per-process line buffer.
const LINE_CAPACITY: usize = 20_000;

/// Cyclic buffer of raw ftrace lines. Grows to capacity, then overwrites
/// the oldest line; logical order is `[pos, len)` then `[0, pos)`.
#[derive(Default)]
struct LineRing {
    lines: Vec<String>,
    pos: usize,
}

impl LineRing {
    fn push(&mut self, line: String) {
        if self.lines.len() < LINE_CAPACITY {
            self.lines.push(line);
        } else {
            self.lines[self.pos] = line;
            self.pos = (self.pos + 1) % LINE_CAPACITY;
        }
    }

    /// Lines stamped in `[t, pause_time]`, oldest first. Lines whose stamp
    /// does not parse sort as cycle 0 and are trimmed with the rest.
    fn extract(&self, t: u64, pause_time: u64) -> Vec<String> {
        let cycle_of = |line: &String| parse_cycle(line).unwrap_or(0);
        let high = &self.lines[self.pos..];
        let low = &self.lines[..self.pos];
        let high_start = extract::tail_start(high.len(), t, pause_time, |i| cycle_of(&high[i]));
        let low_start = extract::tail_start(low.len(), t, pause_time, |i| cycle_of(&low[i]));
        let mut out = Vec::with_capacity((high.len() - high_start) + (low.len() - low_start));
        out.extend_from_slice(&high[high_start..]);
        out.extend_from_slice(&low[low_start..]);
        out
    }
}

/// The cycle stamp of one ftrace line: the first whitespace-separated token
/// that is all digits and dots and ends with a colon. With the clock set to
/// `x86-tsc` the dot is just formatting, so it is stripped before parsing.
pub fn parse_cycle(line: &str) -> Option<u64> {
    for tok in line.split_whitespace() {
        let num = match tok.strip_suffix(':') {
            Some(n) if !n.is_empty() => n,
            _ => continue,
        };
        if !num.chars().all(|c| c.is_ascii_digit() || c == '.') {
            continue;
        }
        let digits: String = num.chars().filter(|c| *c != '.').collect();
        return digits.parse().ok();
    }
    None
}

static LINES: Mutex<Option<LineRing>> = Mutex::new(None);
static ACTIVE: AtomicBool = AtomicBool::new(false);
static STARTED: AtomicBool = AtomicBool::new(false);

fn tracefs_root() -> Result<&'static Path> {
    for root in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
        if Path::new(root).join("trace_clock").exists() {
            return Ok(Path::new(root));
        }
    }
    bail!("no writable tracefs found");
}

fn instance_dir() -> Result<PathBuf> {
    Ok(tracefs_root()?
        .join("instances")
        .join(format!("calltrace-{}", std::process::id())))
}

fn write_tracefs(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).with_context(|| format!("failed to write {}", path.display()))
}

/// Create and configure the private tracer instance; returns the path of
/// its `trace_pipe`.
fn setup_instance(collector_tid: u32) -> Result<PathBuf> {
    let dir = instance_dir()?;
    match fs::create_dir(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e).with_context(|| format!("failed to create {}", dir.display())),
    }
    write_tracefs(&dir.join("trace_clock"), "x86-tsc")?;
    write_tracefs(&dir.join("events/sched/sched_switch/enable"), "1")?;
    write_tracefs(&dir.join("events/sched/sched_wakeup/enable"), "1")?;
    // Not every kernel exposes the rest; they only sharpen the picture.
    let _ = fs::write(dir.join("events/sched/sched_waking/enable"), "1");
    let _ = fs::write(dir.join("events/sched/sched_process_exit/enable"), "1");
    let _ = fs::write(dir.join("events/task/task_newtask/enable"), "1");
    // Follow children of the filtered pids.
    let _ = fs::write(dir.join("options/event-fork"), "1");

    // Filter to every task of this process except the collector itself.
    let mut pids = String::new();
    for entry in fs::read_dir("/proc/self/task").context("failed to list own tasks")? {
        let entry = entry?;
        let tid = entry.file_name().to_string_lossy().into_owned();
        if tid == collector_tid.to_string() {
            continue;
        }
        pids.push_str(&tid);
        pids.push(' ');
    }
    write_tracefs(&dir.join("set_event_pid"), pids.trim_end())?;
    Ok(dir.join("trace_pipe"))
}

fn reader_main() {
    // The collector's own scheduling noise is excluded from the filter, and
    // its function events are of no interest either.
    registry::ignore_current_thread();
    let tid = nix::unistd::gettid().as_raw() as u32;
    let pipe = match setup_instance(tid) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("calltrace: scheduler event capture disabled: {e:#}");
            return;
        }
    };
    let file = match File::open(&pipe) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("calltrace: scheduler event capture disabled: cannot open {}: {e}", pipe.display());
            return;
        }
    };
    *LINES.lock().unwrap() = Some(LineRing::default());
    ACTIVE.store(true, Ordering::Release);
    let reader = BufReader::new(file);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if let Some(ring) = LINES.lock().unwrap().as_mut() {
                    ring.push(line);
                }
            }
            Err(_) => break,
        }
    }
}

/// Start the capture worker unless disabled by environment. Idempotent.
pub fn init() {
    if std::env::var_os(FTRACE_DISABLE_ENV).is_some() {
        return;
    }
    if STARTED.swap(true, Ordering::AcqRel) {
        return;
    }
    let spawned = thread::Builder::new()
        .name("calltrace-ftrace".to_string())
        .spawn(reader_main);
    if let Err(e) = spawned {
        eprintln!("calltrace: scheduler event capture disabled: failed to spawn reader: {e}");
    }
}

/// Whether enrichment is live (setup succeeded and the reader is pumping).
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

/// Scheduler lines stamped in `[t, pause_time]`, for the snapshot writer.
/// Empty when capture is inactive.
pub fn snapshot_lines(t: u64, pause_time: u64) -> Vec<String> {
    if !is_active() {
        return Vec::new();
    }
    match LINES.lock().unwrap().as_ref() {
        Some(ring) => ring.extract(t, pause_time),
        None => Vec::new(),
    }
}

/// Best-effort teardown of the kernel-side instance at process exit.
pub fn shutdown() {
    if !STARTED.load(Ordering::Acquire) {
        return;
    }
    if let Ok(dir) = instance_dir() {
        let _ = fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cycle_from_tsc_lines() {
        let line = "   worker-1234  [003] d..2. 8086714522.129795: sched_switch: prev_comm=worker";
        assert_eq!(parse_cycle(line), Some(8086714522129795));
        let no_stamp = "not an ftrace line at all";
        assert_eq!(parse_cycle(no_stamp), None);
    }

    #[test]
    fn test_parse_cycle_skips_comm_with_colon() {
        let line = " kworker/0:1-462   [000] d..2. 123456.000100: sched_wakeup: comm=x";
        assert_eq!(parse_cycle(line), Some(123456000100));
    }

    #[test]
    fn test_line_ring_wraps_at_capacity() {
        let mut ring = LineRing::default();
        for i in 0..(LINE_CAPACITY + 10) {
            ring.push(format!("x [000] d. {i}.000000: e:"));
        }
        assert_eq!(ring.lines.len(), LINE_CAPACITY);
        let all = ring.extract(0, u64::MAX);
        assert_eq!(all.len(), LINE_CAPACITY);
        // Oldest surviving line is number 10.
        assert_eq!(parse_cycle(&all[0]), Some(10_000000));
        assert_eq!(
            parse_cycle(all.last().unwrap()),
            Some((LINE_CAPACITY as u64 + 9) * 1_000_000)
        );
    }

    #[test]
    fn test_extract_trims_by_cycle() {
        let mut ring = LineRing::default();
        for i in 1..=10u64 {
            ring.push(format!("x [000] d. {i}.000000: e:"));
        }
        let lines = ring.extract(7_000_000, u64::MAX);
        assert_eq!(lines.len(), 4);
        assert_eq!(parse_cycle(&lines[0]), Some(7_000_000));
    }
}
