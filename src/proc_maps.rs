//! Enumeration of the executable memory segments of the current process.
//!
//! Decoders need the load addresses of every executable mapping to turn raw
//! code addresses back into symbols, and the counter store preallocates leaf
//! pages over exactly these ranges.

use std::fs;
use std::io;

/// The raw text of `/proc/self/maps`, byte for byte. This is what snapshot
/// files carry so the decoder sees the same view of the address space that
/// the events were recorded under.
pub fn raw_maps() -> io::Result<Vec<u8>> {
    fs::read("/proc/self/maps")
}

/// Invoke `cb(start, size, name)` for every currently mapped executable
/// segment. `name` is the backing path, or an empty string for anonymous
/// executable mappings (JIT regions and the like).
pub fn executable_segments<F: FnMut(u64, u64, &str)>(mut cb: F) -> io::Result<()> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    parse_executable_segments(&maps, &mut cb);
    Ok(())
}

fn parse_executable_segments<F: FnMut(u64, u64, &str)>(maps: &str, cb: &mut F) {
    for line in maps.lines() {
        // start-end perms offset dev inode [path]
        let mut fields = line.split_whitespace();
        let range = match fields.next() {
            Some(r) => r,
            None => continue,
        };
        let perms = match fields.next() {
            Some(p) => p,
            None => continue,
        };
        if !perms.contains('x') {
            continue;
        }
        let (start, end) = match range.split_once('-') {
            Some(r) => r,
            None => continue,
        };
        let start = match u64::from_str_radix(start, 16) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let end = match u64::from_str_radix(end, 16) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if end <= start {
            continue;
        }
        let name = fields.nth(3).unwrap_or("");
        cb(start, end - start, name);
    }
}
