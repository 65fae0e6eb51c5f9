//! Quick inspection of a recorded trace file: one line per chunk, with
//! per-thread event statistics. The heavy lifting (symbolization, flame
//! graphs) belongs to the off-line decoder; this tool answers "did the
//! snapshot land, and what is in it".

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use calltrace::container::{Chunk, ChunkReader};

#[derive(Debug, Parser)]
#[command(
    name = "calltrace-dump",
    about = "Print a chunk-level summary of a calltrace trace file"
)]
struct Opts {
    /// Trace file to inspect, e.g. funtrace.raw
    file: PathBuf,
    /// Also print the first events of every thread buffer
    #[arg(short, long)]
    verbose: bool,
    /// How many events to print per buffer with --verbose
    #[arg(long, default_value = "10")]
    events: usize,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let file =
        File::open(&opts.file).with_context(|| format!("failed to open {}", opts.file.display()))?;
    let mut reader = ChunkReader::new(BufReader::new(file));

    let mut snapshot = 0u32;
    let mut pending_thread: Option<String> = None;
    while let Some(chunk) = reader.next_chunk()? {
        match chunk {
            Chunk::ProcMaps(maps) => {
                println!("PROCMAPS  {} bytes, {} lines", maps.len(), maps.iter().filter(|&&b| b == b'\n').count());
            }
            Chunk::TraceStart { cycles_per_second } => {
                snapshot += 1;
                println!("FUNTRACE  snapshot #{snapshot}, {cycles_per_second} cycles/second");
            }
            Chunk::CmdLine(cmd) => {
                println!("CMD LINE  {}", String::from_utf8_lossy(&cmd));
            }
            Chunk::ThreadId(id) => {
                let name = id.name_str();
                println!("THREADID  pid {} tid {} name \"{name}\"", id.pid, id.tid);
                pending_thread = Some(name);
            }
            Chunk::TraceBuf(events) => {
                let nonzero: Vec<_> = events.iter().filter(|e| e.addr_and_flags != 0).collect();
                let thread = pending_thread.take().unwrap_or_default();
                match (
                    nonzero.iter().map(|e| e.cycle).min(),
                    nonzero.iter().map(|e| e.cycle).max(),
                ) {
                    (Some(first), Some(last)) => println!(
                        "TRACEBUF  {} slots, {} events, cycles {first}..{last} ({thread})",
                        events.len(),
                        nonzero.len()
                    ),
                    _ => println!("TRACEBUF  {} slots, empty ({thread})", events.len()),
                }
                if opts.verbose {
                    for event in nonzero.iter().take(opts.events) {
                        let kind = if event.is_catch() {
                            "catch "
                        } else if event.is_return() {
                            "return"
                        } else {
                            "call  "
                        };
                        println!("    {kind} 0x{:012x} @ {}", event.address(), event.cycle);
                    }
                }
            }
            Chunk::FtraceText(lines) => {
                println!("FTRACETX  {} scheduler events", lines.len());
                if opts.verbose {
                    for line in lines.iter().take(opts.events) {
                        println!("    {line}");
                    }
                }
            }
            Chunk::EndTrace => {
                println!("ENDTRACE");
            }
            Chunk::Other { magic, payload } => {
                println!(
                    "{}  {} bytes (unknown chunk)",
                    String::from_utf8_lossy(&magic),
                    payload.len()
                );
            }
        }
    }
    Ok(())
}
