//! Dump retrieval port and record parsing.
//!
//! A dump is a path-sorted listing of one side (storage or catalog) of one
//! RSE, one record per line: `path`, optionally followed by tab-separated
//! byte count and checksum. Sortedness is the producer's contract; the
//! reconciler rejects regressions. Unparsable lines are counted and skipped,
//! they never abort a location.

use std::io::BufRead;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::rse::RseInfo;
use crate::types::{Checksum, DumpHeader, DumpRecord, FileKey};

pub mod fs;

pub use fs::FsDumpProvider;

/// A fully loaded dump for one side of one RSE.
#[derive(Debug, Clone)]
pub struct DumpSet {
    pub header: DumpHeader,
    pub records: Vec<DumpRecord>,
    pub malformed_lines: u64,
}

#[async_trait]
pub trait DumpProvider: Send + Sync {
    /// The storage-side dump: pinned to a date, or the newest available.
    async fn storage_dump(
        &self,
        rse: &RseInfo,
        pinned: Option<NaiveDate>,
    ) -> Result<DumpSet>;

    /// The catalog-side dump generated closest to `near`.
    async fn catalog_dump(&self, rse: &RseInfo, near: NaiveDate) -> Result<DumpSet>;

    /// Drop the RSE's cached working copies after a cycle.
    async fn cleanup(&self, rse: &RseInfo) -> Result<()>;
}

/// Parse dump records from a reader. Returns the records plus the number of
/// malformed lines skipped. Blank lines are not an error.
pub fn parse_dump_records<R: BufRead>(reader: R) -> Result<(Vec<DumpRecord>, u64)> {
    let mut records = Vec::new();
    let mut malformed = 0u64;
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        match parse_dump_line(trimmed) {
            Some(record) => records.push(record),
            None => malformed += 1,
        }
    }
    Ok((records, malformed))
}

fn parse_dump_line(line: &str) -> Option<DumpRecord> {
    let mut fields = line.split('\t');
    let path = fields.next()?;
    if path.is_empty() {
        return None;
    }
    let bytes = match fields.next() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<u64>().ok()?),
    };
    let checksum = fields.next().filter(|c| !c.is_empty()).map(Checksum::new);
    Some(DumpRecord {
        path: path.to_string(),
        bytes,
        checksum,
    })
}

/// Best-effort mapping from an RSE-local path to a catalog identity.
///
/// The first path segment is the scope, the last is the file name; `user`
/// and `group` areas use two-level scopes (`user.<account>`). Paths with a
/// single segment carry no scope and cannot be mapped.
pub fn infer_file_key(path: &str) -> Option<FileKey> {
    let items: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match items.as_slice() {
        [] | [_] => None,
        items if items.len() > 2 && matches!(items[0], "user" | "group") => {
            Some(FileKey::new(
                format!("{}.{}", items[0], items[1]),
                *items.last()?,
            ))
        }
        items => Some(FileKey::new(items[0], *items.last()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_field_arities() {
        let input = "data/raw/f1\ndata/raw/f2\t2048\ndata/raw/f3\t4096\tad:9f8e\n";
        let (records, malformed) =
            parse_dump_records(input.as_bytes()).unwrap();
        assert_eq!(malformed, 0);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].bytes, None);
        assert_eq!(records[1].bytes, Some(2048));
        assert_eq!(records[2].checksum, Some(Checksum::new("ad:9f8e")));
    }

    #[test]
    fn counts_malformed_lines_and_skips_blanks() {
        let input = "data/raw/f1\t123\n\n\tno-path\ndata/raw/f2\tnot-a-size\n\r\ndata/raw/f3\n";
        let (records, malformed) =
            parse_dump_records(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(malformed, 2);
    }

    #[test]
    fn windows_line_endings_are_tolerated() {
        let input = "data/raw/f1\t10\r\ndata/raw/f2\t20\r\n";
        let (records, malformed) =
            parse_dump_records(input.as_bytes()).unwrap();
        assert_eq!(malformed, 0);
        assert_eq!(records[1].bytes, Some(20));
    }

    #[test]
    fn infers_scope_and_name_from_paths() {
        assert_eq!(
            infer_file_key("data/raw/2024/f1.root"),
            Some(FileKey::new("data", "f1.root"))
        );
        assert_eq!(
            infer_file_key("/data/raw/f1.root"),
            Some(FileKey::new("data", "f1.root"))
        );
        assert_eq!(
            infer_file_key("user/jdoe/analysis/f1.root"),
            Some(FileKey::new("user.jdoe", "f1.root"))
        );
        assert_eq!(
            infer_file_key("group/phys/2024/f1.root"),
            Some(FileKey::new("group.phys", "f1.root"))
        );
        // Two segments: the area name itself is the scope.
        assert_eq!(
            infer_file_key("user/f1.root"),
            Some(FileKey::new("user", "f1.root"))
        );
        assert_eq!(infer_file_key("orphan.root"), None);
        assert_eq!(infer_file_key(""), None);
    }
}
