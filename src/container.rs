//! The tagged-chunk trace container.
//!
//! A trace file is a sequence of chunks, each an 8-byte magic, an 8-byte
//! native-endian payload length, and the payload. One snapshot is the
//! sequence `PROCMAPS`, `FUNTRACE` (cycles per second), `CMD LINE`, then one
//! `THREADID`/`TRACEBUF` pair per thread, optionally `FTRACETX` with
//! scheduler events, and a zero-length `ENDTRACE` terminator. Trace mode
//! appends snapshots to one file, so a file may hold many of them.

use std::io::{self, Read, Write};

use anyhow::{bail, Result};

use crate::ring::{TraceEvent, EVENT_SIZE};

pub const MAGIC_LEN: usize = 8;

pub const MAGIC_PROCMAPS: [u8; 8] = *b"PROCMAPS";
pub const MAGIC_FUNTRACE: [u8; 8] = *b"FUNTRACE";
pub const MAGIC_CMD_LINE: [u8; 8] = *b"CMD LINE";
pub const MAGIC_THREADID: [u8; 8] = *b"THREADID";
pub const MAGIC_TRACEBUF: [u8; 8] = *b"TRACEBUF";
pub const MAGIC_FTRACETX: [u8; 8] = *b"FTRACETX";
pub const MAGIC_ENDTRACE: [u8; 8] = *b"ENDTRACE";

/// Identity of the thread whose `TRACEBUF` follows.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadIdRecord {
    pub pid: u64,
    pub tid: u64,
    pub name: [u8; 16],
}

// SAFETY: #[repr(C)] with no padding (8 + 8 + 16 bytes) and no invalid bit
// patterns.
unsafe impl plain::Plain for ThreadIdRecord {}

impl ThreadIdRecord {
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ThreadIdRecord is plain old data.
        unsafe {
            std::slice::from_raw_parts(
                self as *const ThreadIdRecord as *const u8,
                std::mem::size_of::<ThreadIdRecord>(),
            )
        }
    }
}

/// View a dense event buffer as raw bytes for serialization.
pub fn events_as_bytes(events: &[TraceEvent]) -> &[u8] {
    // SAFETY: TraceEvent is plain old data of size EVENT_SIZE.
    unsafe { std::slice::from_raw_parts(events.as_ptr() as *const u8, events.len() * EVENT_SIZE) }
}

/// Parse a dense event byte buffer (a `TRACEBUF` payload or a detached
/// snapshot buffer) back into events. Copies, so the input needs no
/// particular alignment.
pub fn events_from_bytes(bytes: &[u8]) -> Result<Vec<TraceEvent>> {
    if bytes.len() % EVENT_SIZE != 0 {
        bail!(
            "event buffer length {} is not a multiple of {EVENT_SIZE}",
            bytes.len()
        );
    }
    Ok(bytes
        .chunks_exact(EVENT_SIZE)
        .map(|chunk| TraceEvent {
            addr_and_flags: u64::from_ne_bytes(chunk[0..8].try_into().unwrap()),
            cycle: u64::from_ne_bytes(chunk[8..16].try_into().unwrap()),
        })
        .collect())
}

pub struct ChunkWriter<W: Write> {
    w: W,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(w: W) -> Self {
        ChunkWriter { w }
    }

    pub fn chunk(&mut self, magic: &[u8; MAGIC_LEN], payload: &[u8]) -> io::Result<()> {
        self.w.write_all(magic)?;
        self.w.write_all(&(payload.len() as u64).to_ne_bytes())?;
        self.w.write_all(payload)
    }

    /// A chunk whose payload arrives as several slices, written without
    /// gathering them into one allocation.
    pub fn chunk_parts(&mut self, magic: &[u8; MAGIC_LEN], parts: &[&[u8]]) -> io::Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        self.w.write_all(magic)?;
        self.w.write_all(&(len as u64).to_ne_bytes())?;
        for part in parts {
            self.w.write_all(part)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

/// One decoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    ProcMaps(Vec<u8>),
    /// Begins a snapshot; carries the clock rate used for its cycles.
    TraceStart {
        cycles_per_second: u64,
    },
    CmdLine(Vec<u8>),
    ThreadId(ThreadIdRecord),
    TraceBuf(Vec<TraceEvent>),
    FtraceText(Vec<String>),
    EndTrace,
    Other {
        magic: [u8; MAGIC_LEN],
        payload: Vec<u8>,
    },
}

pub struct ChunkReader<R: Read> {
    r: R,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(r: R) -> Self {
        ChunkReader { r }
    }

    /// The next chunk, or None at a clean end of file. A file truncated
    /// mid-chunk is an error.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let mut magic = [0u8; MAGIC_LEN];
        if !read_or_eof(&mut self.r, &mut magic)? {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 8];
        self.r.read_exact(&mut len_bytes)?;
        let len = u64::from_ne_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        self.r.read_exact(&mut payload)?;

        let chunk = match magic {
            MAGIC_PROCMAPS => Chunk::ProcMaps(payload),
            MAGIC_FUNTRACE => {
                // Legacy traces used a zero-length start marker.
                let cycles_per_second = match payload.len() {
                    0 => 0,
                    8 => u64::from_ne_bytes(payload.try_into().unwrap()),
                    n => bail!("FUNTRACE chunk length {n} is neither 0 nor 8"),
                };
                Chunk::TraceStart { cycles_per_second }
            }
            MAGIC_CMD_LINE => Chunk::CmdLine(payload),
            MAGIC_THREADID => {
                let mut rec = ThreadIdRecord::default();
                plain::copy_from_bytes(&mut rec, &payload)
                    .map_err(|_| anyhow::anyhow!("THREADID chunk length {len} is too short"))?;
                Chunk::ThreadId(rec)
            }
            MAGIC_TRACEBUF => Chunk::TraceBuf(events_from_bytes(&payload)?),
            MAGIC_FTRACETX => {
                let text = String::from_utf8_lossy(&payload);
                Chunk::FtraceText(text.lines().map(str::to_owned).collect())
            }
            MAGIC_ENDTRACE => {
                if len != 0 {
                    bail!("ENDTRACE chunk has non-zero length {len}");
                }
                Chunk::EndTrace
            }
            _ => Chunk::Other { magic, payload },
        };
        Ok(Some(chunk))
    }
}

/// Fill `buf` completely, or report a clean EOF if no bytes were available.
fn read_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            bail!("truncated chunk header");
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::FLAG_RETURN;
    use std::io::Cursor;

    #[test]
    fn test_chunk_stream_round_trip() {
        let mut buf = Vec::new();
        let mut w = ChunkWriter::new(&mut buf);
        w.chunk(&MAGIC_PROCMAPS, b"400000-401000 r-xp ...\n").unwrap();
        w.chunk(&MAGIC_FUNTRACE, &1_000_000_000u64.to_ne_bytes()).unwrap();
        w.chunk(&MAGIC_CMD_LINE, b"demo --fast").unwrap();
        let id = ThreadIdRecord {
            pid: 100,
            tid: 101,
            name: *b"worker\0\0\0\0\0\0\0\0\0\0",
        };
        w.chunk(&MAGIC_THREADID, id.as_bytes()).unwrap();
        let events = vec![
            TraceEvent {
                addr_and_flags: 0x401000,
                cycle: 5,
            },
            TraceEvent {
                addr_and_flags: 0x401000 | FLAG_RETURN,
                cycle: 9,
            },
        ];
        w.chunk(&MAGIC_TRACEBUF, events_as_bytes(&events)).unwrap();
        w.chunk(&MAGIC_FTRACETX, b"a: 1\nb: 2").unwrap();
        w.chunk(&MAGIC_ENDTRACE, &[]).unwrap();

        let mut r = ChunkReader::new(Cursor::new(buf));
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::ProcMaps(b"400000-401000 r-xp ...\n".to_vec())
        );
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::TraceStart {
                cycles_per_second: 1_000_000_000
            }
        );
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::CmdLine(b"demo --fast".to_vec())
        );
        match r.next_chunk().unwrap().unwrap() {
            Chunk::ThreadId(rec) => {
                assert_eq!(rec, id);
                assert_eq!(rec.name_str(), "worker");
            }
            other => panic!("expected THREADID, got {other:?}"),
        }
        assert_eq!(r.next_chunk().unwrap().unwrap(), Chunk::TraceBuf(events));
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::FtraceText(vec!["a: 1".to_string(), "b: 2".to_string()])
        );
        assert_eq!(r.next_chunk().unwrap().unwrap(), Chunk::EndTrace);
        assert!(r.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_unknown_magic_is_preserved() {
        let mut buf = Vec::new();
        let mut w = ChunkWriter::new(&mut buf);
        w.chunk(b"MYSTERY!", b"xyz").unwrap();
        let mut r = ChunkReader::new(Cursor::new(buf));
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::Other {
                magic: *b"MYSTERY!",
                payload: b"xyz".to_vec()
            }
        );
    }

    #[test]
    fn test_truncated_header_is_an_error() {
        let mut r = ChunkReader::new(Cursor::new(b"FUNT".to_vec()));
        assert!(r.next_chunk().is_err());
    }

    #[test]
    fn test_misaligned_tracebuf_is_an_error() {
        let mut buf = Vec::new();
        let mut w = ChunkWriter::new(&mut buf);
        w.chunk(&MAGIC_TRACEBUF, &[0u8; 17]).unwrap();
        let mut r = ChunkReader::new(Cursor::new(buf));
        assert!(r.next_chunk().is_err());
    }

    #[test]
    fn test_chunk_parts_concatenates() {
        let mut buf = Vec::new();
        let mut w = ChunkWriter::new(&mut buf);
        w.chunk_parts(&MAGIC_CMD_LINE, &[b"abc", b" ", b"def"]).unwrap();
        let mut r = ChunkReader::new(Cursor::new(buf));
        assert_eq!(
            r.next_chunk().unwrap().unwrap(),
            Chunk::CmdLine(b"abc def".to_vec())
        );
    }
}
