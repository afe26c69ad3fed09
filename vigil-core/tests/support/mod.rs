//! Shared fixtures for the engine integration tests.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use vigil_core::catalog::MemoryCatalog;
use vigil_core::config::{AuditorConfig, NecromancerConfig};
use vigil_core::types::{Checksum, FileKey, ReplicaKey, ReplicaState, RseId};

/// Fixed declaration instant so deterministic request ids are comparable
/// across independently seeded catalogs.
#[allow(dead_code)]
pub fn declared_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn replica_key(scope: &str, name: &str, rse: RseId) -> ReplicaKey {
    ReplicaKey {
        file: FileKey::new(scope, name),
        rse_id: rse,
    }
}

#[allow(dead_code)]
pub fn seed_bad(catalog: &MemoryCatalog, key: ReplicaKey, rse: &str) {
    catalog.insert_replica(
        key,
        rse,
        ReplicaState::Bad,
        Some(2048),
        Some(Checksum("f3a91c40".into())),
        "checksum mismatch",
        declared_at(),
    );
}

#[allow(dead_code)]
pub fn seed_available(catalog: &MemoryCatalog, key: ReplicaKey, rse: &str) {
    catalog.insert_replica(
        key,
        rse,
        ReplicaState::Available,
        Some(2048),
        Some(Checksum("f3a91c40".into())),
        "",
        declared_at(),
    );
}

#[allow(dead_code)]
pub fn necromancer_config(threads: usize, bulk: usize) -> NecromancerConfig {
    NecromancerConfig {
        threads,
        bulk,
        run_once: true,
        ..NecromancerConfig::default()
    }
}

/// Auditor tuned for tiny fixtures: run-once, local directories, and a
/// sanity threshold that only trips when a test wants it to.
#[allow(dead_code)]
pub fn auditor_config(root: &Path) -> AuditorConfig {
    AuditorConfig {
        threads: 2,
        bulk: 100,
        run_once: true,
        sanity_threshold: 1.0,
        spool_dir: root.join("spool"),
        cache_dir: root.join("cache"),
        results_dir: root.join("results"),
        ..AuditorConfig::default()
    }
}

#[allow(dead_code)]
pub fn write_dump(root: &Path, side: &str, rse: &str, date: NaiveDate, lines: &[String]) {
    let dir = root.join("spool").join(side).join(rse);
    fs::create_dir_all(&dir).unwrap();
    let name = format!("dump_{}", date.format("%Y%m%d"));
    fs::write(dir.join(name), lines.join("\n")).unwrap();
}
