//! Snapshot extraction and serialization.
//!
//! Three flavors share one pause protocol: flip every ring's enabled flag,
//! stamp the pause time, read the rings while holding the registry lock,
//! then re-enable. The write-through flavor streams straight from the ring
//! memory into the shared output file; the detached flavors copy events out
//! (optionally trimmed to a cycle threshold) into a [`Snapshot`] that can be
//! serialized later without stopping the world again.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::clock;
use crate::container::{
    events_as_bytes, ChunkWriter, ThreadIdRecord, MAGIC_CMD_LINE, MAGIC_ENDTRACE, MAGIC_FTRACETX,
    MAGIC_FUNTRACE, MAGIC_PROCMAPS, MAGIC_THREADID, MAGIC_TRACEBUF,
};
use crate::ftrace;
use crate::proc_maps;
use crate::registry;
use crate::ring::ThreadRing;

/// Events of one thread, already detached from its ring.
pub struct ThreadDump {
    pub id: ThreadIdRecord,
    /// Raw event bytes, a whole number of 16-byte events.
    pub events: Vec<u8>,
}

/// A detached, point-in-time copy of the whole tracing state.
pub struct Snapshot {
    pub cycles_per_second: u64,
    pub maps: Vec<u8>,
    pub cmdline: Vec<u8>,
    pub threads: Vec<ThreadDump>,
    pub sched_lines: Vec<String>,
}

fn thread_id_of(ring: &ThreadRing) -> ThreadIdRecord {
    ThreadIdRecord {
        pid: ring.pid() as u64,
        tid: ring.tid() as u64,
        name: ring.name(),
    }
}

fn read_maps_or_warn() -> Vec<u8> {
    match proc_maps::raw_maps() {
        Ok(maps) => maps,
        Err(e) => {
            eprintln!("calltrace: failed to read /proc/self/maps, traces will be impossible to decode: {e}");
            Vec::new()
        }
    }
}

/// Pause every ring, write one full snapshot record to the shared output
/// file, resume. Event data is written straight from the rings, with no
/// per-event allocation.
pub fn write_current_snapshot() {
    let mut inner = registry::lock();
    inner.for_each(|ring| ring.set_enabled(false));
    let pause_time = clock::now();

    let maps = read_maps_or_warn();
    let sched_lines = ftrace::snapshot_lines(0, pause_time);

    // Collect identities and raw extents first; the rings stay pinned by
    // the registry lock while we stream them out below.
    let mut extents: Vec<(ThreadIdRecord, *const u8, usize)> = Vec::new();
    inner.for_each(|ring| {
        ring.refresh_name();
        let (buf, size) = ring.raw_parts();
        extents.push((thread_id_of(ring), buf, size));
    });

    let res = (|| -> Result<()> {
        let file = inner.output_file().context("failed to open trace output file")?;
        let mut w = ChunkWriter::new(BufWriter::new(file));
        w.chunk(&MAGIC_PROCMAPS, &maps)?;
        w.chunk(&MAGIC_FUNTRACE, &clock::cycles_per_second().to_ne_bytes())?;
        w.chunk(&MAGIC_CMD_LINE, registry::cmdline())?;
        for (id, buf, size) in &extents {
            w.chunk(&MAGIC_THREADID, id.as_bytes())?;
            // SAFETY: the owner is paused and the ring cannot be freed or
            // resized while the registry lock is held; a straggler
            // in-flight write can at worst tear one event.
            let bytes = unsafe { std::slice::from_raw_parts(*buf, *size) };
            w.chunk(&MAGIC_TRACEBUF, bytes)?;
        }
        if !sched_lines.is_empty() {
            w.chunk(&MAGIC_FTRACETX, sched_lines.join("\n").as_bytes())?;
        }
        w.chunk(&MAGIC_ENDTRACE, &[])?;
        w.flush()?;
        Ok(())
    })();

    inner.for_each(|ring| ring.set_enabled(true));
    drop(inner);

    if let Err(e) = res {
        eprintln!("calltrace: failed to write snapshot: {e:#}");
    }
}

fn snapshot_impl(since: Option<u64>) -> Snapshot {
    let inner = registry::lock();
    inner.for_each(|ring| ring.set_enabled(false));
    let pause_time = clock::now();

    let mut threads = Vec::new();
    inner.for_each(|ring| {
        ring.refresh_name();
        let events = match since {
            None => ring.copy_raw(),
            Some(t) => events_as_bytes(&ring.copy_events_since(t, pause_time)).to_vec(),
        };
        threads.push(ThreadDump {
            id: thread_id_of(ring),
            events,
        });
    });
    let sched_lines = ftrace::snapshot_lines(since.unwrap_or(0), pause_time);

    inner.for_each(|ring| ring.set_enabled(true));
    drop(inner);

    Snapshot {
        cycles_per_second: clock::cycles_per_second(),
        maps: read_maps_or_warn(),
        cmdline: registry::cmdline().to_vec(),
        threads,
        sched_lines,
    }
}

/// Pause, copy every ring in full, resume.
pub fn get_snapshot() -> Snapshot {
    snapshot_impl(None)
}

/// As [`get_snapshot`], but each ring is trimmed to events with
/// `cycle >= t`.
pub fn get_snapshot_starting_at_time(t: u64) -> Snapshot {
    snapshot_impl(Some(t))
}

/// As [`get_snapshot`], trimmed to the last `dt` cycles.
pub fn get_snapshot_up_to_age(dt: u64) -> Snapshot {
    snapshot_impl(Some(clock::now().saturating_sub(dt)))
}

/// Serialize a detached snapshot to `path` (created or truncated). Runs
/// without touching the registry, so tracing proceeds undisturbed.
pub fn write_snapshot<P: AsRef<Path>>(path: P, snapshot: &Snapshot) -> Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = ChunkWriter::new(BufWriter::new(file));
    w.chunk(&MAGIC_PROCMAPS, &snapshot.maps)?;
    w.chunk(&MAGIC_FUNTRACE, &snapshot.cycles_per_second.to_ne_bytes())?;
    w.chunk(&MAGIC_CMD_LINE, &snapshot.cmdline)?;
    for thread in &snapshot.threads {
        w.chunk(&MAGIC_THREADID, thread.id.as_bytes())?;
        w.chunk(&MAGIC_TRACEBUF, &thread.events)?;
    }
    if !snapshot.sched_lines.is_empty() {
        w.chunk(&MAGIC_FTRACETX, snapshot.sched_lines.join("\n").as_bytes())?;
    }
    w.chunk(&MAGIC_ENDTRACE, &[])?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Chunk, ChunkReader};
    use crate::ring::EVENT_SIZE;
    use std::io::Cursor;

    #[test]
    fn test_written_snapshot_round_trips() {
        let snapshot = Snapshot {
            cycles_per_second: 3_000_000_000,
            maps: b"400000-401000 r-xp 0 0:0 0 /bin/demo\n".to_vec(),
            cmdline: b"demo arg".to_vec(),
            threads: vec![ThreadDump {
                id: ThreadIdRecord {
                    pid: 7,
                    tid: 8,
                    name: *b"main\0\0\0\0\0\0\0\0\0\0\0\0",
                },
                events: vec![0u8; 3 * EVENT_SIZE],
            }],
            sched_lines: vec!["x [000] d. 1.000000: sched_switch:".to_string()],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.raw");
        write_snapshot(&path, &snapshot).unwrap();

        let mut r = ChunkReader::new(Cursor::new(std::fs::read(&path).unwrap()));
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::ProcMaps(snapshot.maps.clone())
        );
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::TraceStart {
                cycles_per_second: 3_000_000_000
            }
        );
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::CmdLine(b"demo arg".to_vec())
        );
        match r.next_chunk().unwrap().unwrap() {
            Chunk::ThreadId(id) => assert_eq!(id.name_str(), "main"),
            other => panic!("expected THREADID, got {other:?}"),
        }
        match r.next_chunk().unwrap().unwrap() {
            Chunk::TraceBuf(events) => assert_eq!(events.len(), 3),
            other => panic!("expected TRACEBUF, got {other:?}"),
        }
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::FtraceText(snapshot.sched_lines.clone())
        );
        assert_eq!(r.next_chunk().unwrap().unwrap(), Chunk::EndTrace);
        assert!(r.next_chunk().unwrap().is_none());
    }
}
