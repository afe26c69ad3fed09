//! Filesystem-backed dump provider.
//!
//! External producers drop listings into a spool:
//!
//! ```text
//! <spool>/storage/<RSE>/dump_YYYYMMDD
//! <spool>/catalog/<RSE>/dump_YYYYMMDD
//! ```
//!
//! Selected dumps are staged into a per-RSE cache directory before parsing,
//! so a rerun on the same day reuses the copy it already worked from even if
//! the producer has since replaced the spool file.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{DumpProvider, DumpSet, parse_dump_records};
use crate::config::AuditorConfig;
use crate::error::{Result, VigilError};
use crate::rse::RseInfo;
use crate::types::{DumpHeader, DumpSide};

/// Reads dumps from a local spool, staging working copies under a cache
/// directory for the duration of a cycle.
#[derive(Debug, Clone)]
pub struct FsDumpProvider {
    spool_dir: PathBuf,
    cache_dir: PathBuf,
    lookback_days: u32,
    keep_dumps: bool,
}

impl FsDumpProvider {
    pub fn new(config: &AuditorConfig) -> Self {
        Self {
            spool_dir: config.spool_dir.clone(),
            cache_dir: config.cache_dir.clone(),
            lookback_days: config.lookback_days,
            keep_dumps: config.keep_dumps,
        }
    }

    fn spool_rse_dir(&self, side: DumpSide, rse: &str) -> PathBuf {
        self.spool_dir.join(side.to_string()).join(rse)
    }

    fn staged_path(&self, rse: &str, side: DumpSide, date: NaiveDate) -> PathBuf {
        self.cache_dir
            .join(rse)
            .join(format!("{side}_{}", date.format("%Y%m%d")))
    }

    fn fetch_storage(
        &self,
        rse: &str,
        pinned: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<DumpSet> {
        let dir = self.spool_rse_dir(DumpSide::Storage, rse);
        let available = list_available(&dir)?;
        let picked = match pinned {
            Some(date) => available
                .into_iter()
                .find(|(found, _)| *found == date)
                .ok_or_else(|| VigilError::DumpUnavailable {
                    rse: rse.to_string(),
                    side: DumpSide::Storage,
                    detail: format!("no dump for requested date {date}"),
                })?,
            None => {
                let cutoff = today - Duration::days(i64::from(self.lookback_days));
                available
                    .into_iter()
                    .filter(|(found, _)| *found >= cutoff)
                    .max_by_key(|(found, _)| *found)
                    .ok_or_else(|| VigilError::DumpUnavailable {
                        rse: rse.to_string(),
                        side: DumpSide::Storage,
                        detail: format!("no dump newer than {cutoff} in {}", dir.display()),
                    })?
            }
        };
        self.stage_and_load(rse, DumpSide::Storage, picked.0, &picked.1)
    }

    fn fetch_catalog(&self, rse: &str, near: NaiveDate) -> Result<DumpSet> {
        let dir = self.spool_rse_dir(DumpSide::Catalog, rse);
        let available = list_available(&dir)?;
        // Closest to the storage dump's date; on a tie the earlier dump wins
        // so both sides predate the same catalog churn.
        let picked = available
            .into_iter()
            .min_by_key(|(found, _)| ((*found - near).num_days().abs(), *found))
            .ok_or_else(|| VigilError::DumpUnavailable {
                rse: rse.to_string(),
                side: DumpSide::Catalog,
                detail: format!("no dumps in {}", dir.display()),
            })?;
        self.stage_and_load(rse, DumpSide::Catalog, picked.0, &picked.1)
    }

    fn stage_and_load(
        &self,
        rse: &str,
        side: DumpSide,
        date: NaiveDate,
        source: &Path,
    ) -> Result<DumpSet> {
        let staged = self.staged_path(rse, side, date);
        self.stage(source, &staged)?;
        let file = fs::File::open(&staged)?;
        let (records, malformed_lines) = parse_dump_records(BufReader::new(file))?;
        if malformed_lines > 0 {
            warn!(rse, %side, malformed_lines, "dump contains unparsable lines");
        }
        Ok(DumpSet {
            header: DumpHeader {
                rse: rse.to_string(),
                side,
                generated_at: dump_generated_at(date),
            },
            records,
            malformed_lines,
        })
    }

    fn stage(&self, source: &Path, target: &Path) -> Result<()> {
        if target.exists() {
            debug!(path = %target.display(), "reusing staged dump");
            return Ok(());
        }
        let parent = target.parent().unwrap_or(&self.cache_dir);
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        let mut reader = fs::File::open(source)?;
        std::io::copy(&mut reader, tmp.as_file_mut())?;
        tmp.persist(target)
            .map_err(|err| VigilError::Io(err.error))?;
        Ok(())
    }

    fn remove_cached(&self, rse: &str) -> Result<()> {
        if self.keep_dumps {
            return Ok(());
        }
        match fs::remove_dir_all(self.cache_dir.join(rse)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl DumpProvider for FsDumpProvider {
    async fn storage_dump(
        &self,
        rse: &RseInfo,
        pinned: Option<NaiveDate>,
    ) -> Result<DumpSet> {
        let provider = self.clone();
        let rse = rse.name.clone();
        let today = Utc::now().date_naive();
        tokio::task::spawn_blocking(move || provider.fetch_storage(&rse, pinned, today))
            .await
            .map_err(|err| VigilError::Internal(format!("dump load task failed: {err}")))?
    }

    async fn catalog_dump(&self, rse: &RseInfo, near: NaiveDate) -> Result<DumpSet> {
        let provider = self.clone();
        let rse = rse.name.clone();
        tokio::task::spawn_blocking(move || provider.fetch_catalog(&rse, near))
            .await
            .map_err(|err| VigilError::Internal(format!("dump load task failed: {err}")))?
    }

    async fn cleanup(&self, rse: &RseInfo) -> Result<()> {
        let provider = self.clone();
        let rse = rse.name.clone();
        tokio::task::spawn_blocking(move || provider.remove_cached(&rse))
            .await
            .map_err(|err| VigilError::Internal(format!("dump cleanup task failed: {err}")))?
    }
}

/// All `dump_YYYYMMDD` files in one spool directory. A missing directory is
/// an empty listing, not an error.
fn list_available(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>> {
    static DUMP_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^dump_(\d{8})$").unwrap());

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(captures) = DUMP_NAME.captures(name) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(&captures[1], "%Y%m%d") else {
            continue;
        };
        found.push((date, entry.path()));
    }
    Ok(found)
}

/// Dump filenames carry a day, not an instant; midnight UTC is the
/// conservative capture time for skew checks.
fn dump_generated_at(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(root: &TempDir) -> FsDumpProvider {
        let config = AuditorConfig {
            spool_dir: root.path().join("spool"),
            cache_dir: root.path().join("cache"),
            ..AuditorConfig::default()
        };
        FsDumpProvider::new(&config)
    }

    fn write_dump(root: &TempDir, side: &str, rse: &str, stamp: &str, contents: &str) {
        let dir = root.path().join("spool").join(side).join(rse);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("dump_{stamp}")), contents).unwrap();
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn newest_storage_dump_within_lookback_wins() {
        let root = TempDir::new().unwrap();
        write_dump(&root, "storage", "SITE_DISK", "20240101", "data/raw/old\n");
        write_dump(&root, "storage", "SITE_DISK", "20240105", "data/raw/new\t42\n");

        let dumps = provider(&root)
            .fetch_storage("SITE_DISK", None, date(2024, 1, 10))
            .unwrap();
        assert_eq!(dumps.header.generated_at.date_naive(), date(2024, 1, 5));
        assert_eq!(dumps.records.len(), 1);
        assert_eq!(dumps.records[0].path, "data/raw/new");
        assert_eq!(dumps.records[0].bytes, Some(42));
    }

    #[test]
    fn dumps_older_than_lookback_are_ignored() {
        let root = TempDir::new().unwrap();
        write_dump(&root, "storage", "SITE_DISK", "20240101", "data/raw/f\n");

        let err = provider(&root)
            .fetch_storage("SITE_DISK", None, date(2024, 3, 15))
            .unwrap_err();
        assert!(matches!(err, VigilError::DumpUnavailable { .. }));
    }

    #[test]
    fn pinned_date_requires_exact_dump() {
        let root = TempDir::new().unwrap();
        write_dump(&root, "storage", "SITE_DISK", "20240105", "data/raw/f\n");

        let found = provider(&root)
            .fetch_storage("SITE_DISK", Some(date(2024, 1, 5)), date(2024, 1, 10))
            .unwrap();
        assert_eq!(found.header.generated_at.date_naive(), date(2024, 1, 5));

        let err = provider(&root)
            .fetch_storage("SITE_DISK", Some(date(2024, 1, 3)), date(2024, 1, 10))
            .unwrap_err();
        assert!(matches!(
            err,
            VigilError::DumpUnavailable {
                side: DumpSide::Storage,
                ..
            }
        ));
    }

    #[test]
    fn closest_catalog_dump_prefers_earlier_on_tie() {
        let root = TempDir::new().unwrap();
        write_dump(&root, "catalog", "SITE_DISK", "20240101", "a/f1\n");
        write_dump(&root, "catalog", "SITE_DISK", "20240105", "a/f2\n");

        let dumps = provider(&root)
            .fetch_catalog("SITE_DISK", date(2024, 1, 3))
            .unwrap();
        assert_eq!(dumps.header.generated_at.date_naive(), date(2024, 1, 1));
    }

    #[test]
    fn staged_copy_is_reused_over_replaced_spool_file() {
        let root = TempDir::new().unwrap();
        write_dump(&root, "storage", "SITE_DISK", "20240105", "a/first\n");
        let fetcher = provider(&root);

        let first = fetcher
            .fetch_storage("SITE_DISK", None, date(2024, 1, 10))
            .unwrap();
        assert_eq!(first.records[0].path, "a/first");

        // Producer rewrites the spool file; the cycle's staged copy wins.
        write_dump(&root, "storage", "SITE_DISK", "20240105", "a/second\n");
        let second = fetcher
            .fetch_storage("SITE_DISK", None, date(2024, 1, 10))
            .unwrap();
        assert_eq!(second.records[0].path, "a/first");
    }

    #[test]
    fn cleanup_honors_keep_dumps() {
        let root = TempDir::new().unwrap();
        write_dump(&root, "storage", "SITE_DISK", "20240105", "a/f\n");

        let fetcher = provider(&root);
        fetcher
            .fetch_storage("SITE_DISK", None, date(2024, 1, 10))
            .unwrap();
        let staged = fetcher.staged_path("SITE_DISK", DumpSide::Storage, date(2024, 1, 5));
        assert!(staged.exists());

        let mut keeper = fetcher.clone();
        keeper.keep_dumps = true;
        keeper.remove_cached("SITE_DISK").unwrap();
        assert!(staged.exists());

        fetcher.remove_cached("SITE_DISK").unwrap();
        assert!(!staged.exists());
        // Idempotent once gone.
        fetcher.remove_cached("SITE_DISK").unwrap();
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let root = TempDir::new().unwrap();
        write_dump(
            &root,
            "storage",
            "SITE_DISK",
            "20240105",
            "a/f1\t12\nbroken\tsize\na/f2\n",
        );

        let dumps = provider(&root)
            .fetch_storage("SITE_DISK", None, date(2024, 1, 10))
            .unwrap();
        assert_eq!(dumps.records.len(), 2);
        assert_eq!(dumps.malformed_lines, 1);
    }

    #[tokio::test]
    async fn provider_trait_round_trip() {
        let root = TempDir::new().unwrap();
        write_dump(&root, "storage", "SITE_DISK", "20240105", "a/f1\n");
        write_dump(&root, "catalog", "SITE_DISK", "20240104", "a/f1\n");

        let fetcher = provider(&root);
        let rse = RseInfo::new("SITE_DISK");

        let storage = fetcher.storage_dump(&rse, Some(date(2024, 1, 5))).await.unwrap();
        let catalog = fetcher
            .catalog_dump(&rse, storage.header.generated_at.date_naive())
            .await
            .unwrap();
        assert_eq!(catalog.header.generated_at.date_naive(), date(2024, 1, 4));

        fetcher.cleanup(&rse).await.unwrap();
        assert!(!root.path().join("cache").join("SITE_DISK").exists());
    }
}
