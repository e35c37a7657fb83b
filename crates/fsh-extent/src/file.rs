//! Plain-text extent files.
//!
//! The format is shared by job journals and test inputs: six `#`
//! banner lines, a `count N` line, a tab-separated column header, then
//! `N` rows of four decimal integers. Any deviation is a protocol
//! error: these files gate resuming a half-finished device rewrite,
//! so nothing is guessed.

use crate::{BlockSizeBitmask, Extent, ExtentList};
use fsh_error::{FshError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const BANNER: [&str; 6] = [
    "################################################################################",
    "######################  DO NOT EDIT THIS FILE ! ################################",
    "################################################################################",
    "############# This file was automatically generated by fsshift.     ############",
    "############# Any change you may do will CORRUPT resuming this job! ############",
    "################################################################################",
];

const HEADER: &str = "physical\tlogical\tlength\tuser_data";

fn protocol(detail: impl Into<String>) -> FshError {
    FshError::Protocol {
        what: "extent file",
        detail: detail.into(),
    }
}

/// Write an extent list, including user data.
pub fn save_extents<W: Write>(w: &mut W, list: &ExtentList) -> Result<()> {
    for line in BANNER {
        writeln!(w, "{line}")?;
    }
    writeln!(w, "count {}", list.len())?;
    writeln!(w, "{HEADER}")?;
    for e in list {
        writeln!(w, "{}\t{}\t{}\t{}", e.physical, e.logical, e.length, e.user_data)?;
    }
    Ok(())
}

/// Write an extent list to `path`, fsyncing the result.
pub fn save_extents_file(path: &Path, list: &ExtentList) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    save_extents(&mut w, list)?;
    w.flush()?;
    w.into_inner()
        .map_err(|e| FshError::Io(e.into_error()))?
        .sync_all()?;
    Ok(())
}

/// Load an extent list previously written by [`save_extents`],
/// appending to `out` and OR-ing every offset and length into
/// `bitmask`.
pub fn load_extents<R: BufRead>(
    r: &mut R,
    out: &mut ExtentList,
    bitmask: &mut BlockSizeBitmask,
) -> Result<()> {
    let mut lines = r.lines();
    let mut next_line = |what: &str| -> Result<String> {
        lines
            .next()
            .transpose()?
            .ok_or_else(|| protocol(format!("unexpected end of file, expected {what}")))
    };

    for i in 0..BANNER.len() {
        let line = next_line("banner")?;
        if !line.starts_with('#') {
            return Err(protocol(format!("banner line {} does not start with '#'", i + 1)));
        }
    }

    let count_line = next_line("count line")?;
    let count: usize = count_line
        .strip_prefix("count ")
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| protocol(format!("bad count line {count_line:?}")))?;

    let header = next_line("column header")?;
    if header != HEADER {
        return Err(protocol(format!("bad column header {header:?}")));
    }

    for row in 0..count {
        let line = next_line("extent row")?;
        let mut fields = line.split_whitespace().map(str::parse::<u64>);
        let mut field = |name: &str| -> Result<u64> {
            fields
                .next()
                .transpose()
                .ok()
                .flatten()
                .ok_or_else(|| protocol(format!("row {row}: bad or missing {name}")))
        };
        let physical = field("physical")?;
        let logical = field("logical")?;
        let length = field("length")?;
        let user_data = field("user_data")?;
        if fields.next().is_some() {
            return Err(protocol(format!("row {row}: trailing fields")));
        }

        bitmask.absorb(physical);
        bitmask.absorb(logical);
        bitmask.absorb(length);
        out.push(Extent {
            physical,
            logical,
            length,
            user_data,
        });
    }
    Ok(())
}

/// Load an extent file from `path`.
pub fn load_extents_file(
    path: &Path,
    out: &mut ExtentList,
    bitmask: &mut BlockSizeBitmask,
) -> Result<()> {
    let mut r = BufReader::new(File::open(path)?);
    load_extents(&mut r, out, bitmask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZEROED_USER_DATA;
    use std::io::Cursor;

    fn sample() -> ExtentList {
        let mut v = ExtentList::new();
        v.push(Extent::new(4096, 0, 8192));
        v.push(Extent::with_user_data(0, 8192, 4096, ZEROED_USER_DATA));
        v.push(Extent::with_user_data(20480, 12288, 4096, 77));
        v
    }

    #[test]
    fn save_load_round_trips_including_user_data() {
        let original = sample();
        let mut buf = Vec::new();
        save_extents(&mut buf, &original).unwrap();

        let mut loaded = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        load_extents(&mut Cursor::new(&buf), &mut loaded, &mut mask).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(mask.effective_block_size(), 4096);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extents.fsx");
        let original = sample();
        save_extents_file(&path, &original).unwrap();

        let mut loaded = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        load_extents_file(&path, &mut loaded, &mut mask).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn empty_list_round_trips() {
        let mut buf = Vec::new();
        save_extents(&mut buf, &ExtentList::new()).unwrap();
        let mut loaded = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        load_extents(&mut Cursor::new(&buf), &mut loaded, &mut mask).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn rejects_mangled_banner() {
        let mut buf = Vec::new();
        save_extents(&mut buf, &sample()).unwrap();
        buf[0] = b'@';
        let mut loaded = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        let err = load_extents(&mut Cursor::new(&buf), &mut loaded, &mut mask).unwrap_err();
        assert!(matches!(err, FshError::Protocol { .. }));
    }

    #[test]
    fn rejects_short_row_count() {
        let original = sample();
        let mut buf = Vec::new();
        save_extents(&mut buf, &original).unwrap();
        // Claim one more row than present.
        let text = String::from_utf8(buf).unwrap();
        let text = text.replace("count 3", "count 4");
        let mut loaded = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        let err =
            load_extents(&mut Cursor::new(text.as_bytes()), &mut loaded, &mut mask).unwrap_err();
        assert!(matches!(err, FshError::Protocol { .. }));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        let text = format!(
            "{}\ncount 1\n{HEADER}\n1\ttwo\t3\t4\n",
            BANNER.join("\n")
        );
        let mut loaded = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        let err =
            load_extents(&mut Cursor::new(text.as_bytes()), &mut loaded, &mut mask).unwrap_err();
        assert!(matches!(err, FshError::Protocol { .. }));
    }
}
