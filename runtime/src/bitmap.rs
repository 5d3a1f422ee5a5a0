// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The code-range bitmap: an AOT-produced map from text addresses to
//! "does a switch from here need to preserve extended state?".
//!
//! An offline pass over the executable emits `<exe>.gprdump`, a headerless
//! sequence of 16-byte records: two little-endian u64 RVAs `(start, end)`,
//! end-exclusive, each describing a run of instructions that touch only
//! general-purpose registers. At startup those ranges clear bytes in a
//! one-byte-per-region bitmap; everything else (including queries outside
//! the mapped text) conservatively reports that extended state is live.

use std::convert::TryInto;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Read-only after construction and shared by every worker.
pub struct GprBitmap {
    start: u64,
    end: u64,
    region_shift: u32,
    bytes: Vec<u8>,
}

impl GprBitmap {
    /// Builds the bitmap for the text mapping `[text_base, text_base +
    /// text_len)` with `2^region_shift`-byte regions. `ranges` hold RVAs
    /// relative to `text_base`; every region they touch is marked
    /// "general-purpose only".
    pub fn from_ranges(
        text_base: u64,
        text_len: u64,
        region_shift: u32,
        ranges: &[(u64, u64)],
    ) -> GprBitmap {
        let region = 1u64 << region_shift;
        let count = ((text_len + region - 1) >> region_shift) as usize;
        let mut bytes = vec![1u8; count];
        for &(start, end) in ranges {
            if end <= start || start >= text_len {
                continue;
            }
            let last = end.min(text_len) - 1;
            for idx in (start >> region_shift)..=(last >> region_shift) {
                bytes[idx as usize] = 0;
            }
        }
        GprBitmap {
            start: text_base,
            end: text_base + text_len,
            region_shift,
            bytes,
        }
    }

    /// O(1) query: does a switch at `rip` need an extended-state save?
    pub fn needs_xsave(&self, rip: u64) -> bool {
        if rip < self.start || rip >= self.end {
            return true;
        }
        let idx = (rip - self.start) >> self.region_shift;
        self.bytes[idx as usize] != 0
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Parses a gprdump file: 16-byte records, two little-endian u64s each.
pub fn read_gprdump(path: &Path) -> io::Result<Vec<(u64, u64)>> {
    let data = fs::read(path)?;
    if data.len() % 16 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("gprdump length {} is not a multiple of 16", data.len()),
        ));
    }
    let mut ranges = Vec::with_capacity(data.len() / 16);
    for record in data.chunks_exact(16) {
        let start = u64::from_le_bytes(record[..8].try_into().unwrap());
        let end = u64::from_le_bytes(record[8..].try_into().unwrap());
        ranges.push((start, end));
    }
    Ok(ranges)
}

/// Locates the main executable's text mapping at runtime.
fn main_text_mapping(exe: &Path) -> io::Result<(u64, u64)> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields.next().unwrap_or("");
        let perms = fields.next().unwrap_or("");
        let path = line.splitn(6, char::is_whitespace).nth(5).unwrap_or("").trim();
        if !perms.contains('x') || Path::new(path) != exe {
            continue;
        }
        let mut bounds = range.splitn(2, '-');
        let start = u64::from_str_radix(bounds.next().unwrap_or(""), 16);
        let end = u64::from_str_radix(bounds.next().unwrap_or(""), 16);
        if let (Ok(start), Ok(end)) = (start, end) {
            return Ok((start, end));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no executable text mapping found",
    ))
}

static BITMAP: spin::Once<GprBitmap> = spin::Once::new();

/// Loads `<exe>.gprdump` against the live text mapping. A negative region
/// factor disables the bitmap: every query reports "save".
pub fn init(cfg: &Config) -> io::Result<()> {
    if cfg.bitmap_pgsz_factor < 0 {
        log::info!("code-range bitmap disabled by configuration");
        return Ok(());
    }
    let exe = std::env::current_exe()?;
    let (start, end) = main_text_mapping(&exe)?;

    let mut dump = PathBuf::from(&exe).into_os_string();
    dump.push(".gprdump");
    let ranges = read_gprdump(Path::new(&dump))?;

    let map = GprBitmap::from_ranges(
        start,
        end - start,
        cfg.bitmap_pgsz_factor as u32,
        &ranges,
    );
    log::info!(
        "code-range bitmap: {:#x}-{:#x}, {} regions of {} bytes, {} gpr-only ranges",
        map.start(),
        map.end(),
        map.size(),
        1u64 << cfg.bitmap_pgsz_factor,
        ranges.len()
    );
    BITMAP.call_once(|| map);
    Ok(())
}

/// The handler's gate. Without a loaded bitmap every address saves.
pub fn needs_xsave(rip: u64) -> bool {
    match BITMAP.get() {
        Some(map) => map.needs_xsave(rip),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_only_region_skips_the_save() {
        // Region 4 (0x100..0x140 at a 64-byte grain) is gpr-only.
        let map = GprBitmap::from_ranges(0x40_0000, 0x1000, 6, &[(0x100, 0x140)]);
        assert!(!map.needs_xsave(0x40_0123));
        assert!(map.needs_xsave(0x40_0800));
    }

    #[test]
    fn out_of_range_is_conservative() {
        let map = GprBitmap::from_ranges(0x40_0000, 0x1000, 6, &[(0, 0x1000)]);
        assert!(!map.needs_xsave(0x40_0000));
        assert!(!map.needs_xsave(0x40_0fff));
        assert!(map.needs_xsave(0x3f_ffff));
        assert!(map.needs_xsave(0x40_1000));
        assert!(map.needs_xsave(u64::MAX));
    }

    #[test]
    fn end_is_exclusive() {
        // [0x80, 0xc0) covers only region 2 at a 64-byte grain.
        let map = GprBitmap::from_ranges(0, 0x200, 6, &[(0x80, 0xc0)]);
        assert!(!map.needs_xsave(0x80));
        assert!(!map.needs_xsave(0xbf));
        assert!(map.needs_xsave(0xc0));
        assert!(map.needs_xsave(0x7f));
    }

    #[test]
    fn ranges_clamp_to_the_text_segment() {
        let map = GprBitmap::from_ranges(0, 0x100, 6, &[(0xc0, 0x4000), (0x5000, 0x6000)]);
        assert!(!map.needs_xsave(0xff));
        assert!(map.needs_xsave(0x00));
    }

    #[test]
    fn gprdump_round_trip() {
        let mut path = std::env::temp_dir();
        path.push(format!("gprdump-test-{}", std::process::id()));

        let mut raw = Vec::new();
        for &(s, e) in &[(0x100u64, 0x140u64), (0x200, 0x1000)] {
            raw.extend_from_slice(&s.to_le_bytes());
            raw.extend_from_slice(&e.to_le_bytes());
        }
        fs::write(&path, &raw).unwrap();

        let ranges = read_gprdump(&path).unwrap();
        assert_eq!(ranges, vec![(0x100, 0x140), (0x200, 0x1000)]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn truncated_gprdump_is_rejected() {
        let mut path = std::env::temp_dir();
        path.push(format!("gprdump-trunc-{}", std::process::id()));
        fs::write(&path, &[0u8; 24]).unwrap();
        let err = read_gprdump(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn finds_our_own_text_mapping() {
        let exe = std::env::current_exe().unwrap();
        let (start, end) = main_text_mapping(&exe).unwrap();
        assert!(start < end);
        // This very function must live inside the mapping.
        let here = finds_our_own_text_mapping as usize as u64;
        assert!(here >= start && here < end);
    }
}
