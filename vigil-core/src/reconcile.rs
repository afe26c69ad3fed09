//! Storage/catalog listing reconciliation.
//!
//! A sorted merge-join over the two sides of one RSE classifies every path
//! as dark (storage only), lost (catalog only), corrupt (both, mismatching
//! metadata) or consistent. The pair is rejected up front when the dumps'
//! generation times are further apart than the configured skew; candidates
//! touching entries with recent catalog activity are suppressed afterwards
//! as in-flight writes, not inconsistencies.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Duration;

use crate::catalog::EntryActivity;
use crate::dumps::{DumpSet, infer_file_key};
use crate::error::{Result, VigilError};
use crate::rse::RseInfo;
use crate::types::{DumpHeader, DumpRecord, DumpSide, FileKey, Finding, FindingKind};

/// Outcome of reconciling one dump pair, before recency suppression.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub findings: Vec<Finding>,
    /// Record counts per side, the denominators for the sanity threshold.
    pub storage_records: u64,
    pub catalog_records: u64,
    pub malformed_lines: u64,
}

/// Merge-join one RSE's dump pair into findings.
///
/// Fails with `StaleDumpPair` when the generation times differ by more than
/// `delta`, and with `MalformedDump` when either listing regresses; both
/// abort this location only.
pub fn reconcile(
    rse: &RseInfo,
    storage: &DumpSet,
    catalog: &DumpSet,
    delta: Duration,
) -> Result<Reconciliation> {
    let skew = storage.header.generated_at - catalog.header.generated_at;
    if skew.abs() > delta {
        return Err(VigilError::StaleDumpPair {
            rse: rse.name.clone(),
            storage_generated: storage.header.generated_at,
            catalog_generated: catalog.header.generated_at,
            delta_days: delta.num_days(),
        });
    }
    ensure_sorted(&storage.records, &rse.name, DumpSide::Storage)?;
    ensure_sorted(&catalog.records, &rse.name, DumpSide::Catalog)?;

    let mut findings = Vec::new();
    let mut storage_iter = storage.records.iter().peekable();
    let mut catalog_iter = catalog.records.iter().peekable();
    loop {
        let order = match (storage_iter.peek(), catalog_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(on_storage), Some(in_catalog)) => on_storage.path.cmp(&in_catalog.path),
        };
        match order {
            Ordering::Less => {
                if let Some(record) = storage_iter.next() {
                    findings.push(dark_finding(rse, record, &storage.header, &catalog.header));
                }
            }
            Ordering::Greater => {
                if let Some(record) = catalog_iter.next() {
                    findings.push(lost_finding(rse, record, &storage.header, &catalog.header));
                }
            }
            Ordering::Equal => {
                if let (Some(on_storage), Some(in_catalog)) =
                    (storage_iter.next(), catalog_iter.next())
                    && meta_mismatch(on_storage, in_catalog)
                {
                    findings.push(corrupt_finding(
                        rse,
                        on_storage,
                        in_catalog,
                        &storage.header,
                        &catalog.header,
                    ));
                }
            }
        }
    }

    Ok(Reconciliation {
        findings,
        storage_records: storage.records.len() as u64,
        catalog_records: catalog.records.len() as u64,
        malformed_lines: storage.malformed_lines + catalog.malformed_lines,
    })
}

/// Drop Dark/Lost candidates whose catalog entry saw creation or deletion
/// within `window` of either dump's generation time. Corrupt findings and
/// candidates without a catalog identity pass through. Returns the surviving
/// findings and the suppressed count.
pub fn suppress_recent(
    findings: Vec<Finding>,
    activity: &HashMap<FileKey, EntryActivity>,
    window: Duration,
) -> (Vec<Finding>, u64) {
    let mut kept = Vec::with_capacity(findings.len());
    let mut suppressed = 0u64;
    for finding in findings {
        let recent = matches!(finding.kind, FindingKind::Dark | FindingKind::Lost)
            && finding
                .key
                .as_ref()
                .and_then(|key| activity.get(key))
                .is_some_and(|entry| activity_is_recent(entry, &finding, window));
        if recent {
            suppressed += 1;
        } else {
            kept.push(finding);
        }
    }
    (kept, suppressed)
}

fn activity_is_recent(entry: &EntryActivity, finding: &Finding, window: Duration) -> bool {
    let generations = [finding.storage_generated_at, finding.catalog_generated_at];
    [Some(entry.created_at), entry.deleted_at]
        .into_iter()
        .flatten()
        .any(|instant| {
            generations
                .iter()
                .any(|generation| (instant - *generation).abs() <= window)
        })
}

fn ensure_sorted(records: &[DumpRecord], rse: &str, side: DumpSide) -> Result<()> {
    for pair in records.windows(2) {
        if pair[1].path < pair[0].path {
            return Err(VigilError::MalformedDump {
                rse: rse.to_string(),
                side,
                detail: format!("listing regresses at '{}'", pair[1].path),
            });
        }
    }
    Ok(())
}

fn meta_mismatch(on_storage: &DumpRecord, in_catalog: &DumpRecord) -> bool {
    let bytes_differ = matches!(
        (on_storage.bytes, in_catalog.bytes),
        (Some(a), Some(b)) if a != b
    );
    let checksums_differ = matches!(
        (&on_storage.checksum, &in_catalog.checksum),
        (Some(a), Some(b)) if a != b
    );
    bytes_differ || checksums_differ
}

fn dark_finding(
    rse: &RseInfo,
    record: &DumpRecord,
    storage: &DumpHeader,
    catalog: &DumpHeader,
) -> Finding {
    Finding {
        rse_id: rse.id,
        rse: rse.name.clone(),
        path: record.path.clone(),
        key: infer_file_key(&record.path),
        kind: FindingKind::Dark,
        bytes_on_storage: record.bytes,
        bytes_in_catalog: None,
        checksum_on_storage: record.checksum.clone(),
        checksum_in_catalog: None,
        storage_generated_at: storage.generated_at,
        catalog_generated_at: catalog.generated_at,
    }
}

fn lost_finding(
    rse: &RseInfo,
    record: &DumpRecord,
    storage: &DumpHeader,
    catalog: &DumpHeader,
) -> Finding {
    Finding {
        rse_id: rse.id,
        rse: rse.name.clone(),
        path: record.path.clone(),
        key: infer_file_key(&record.path),
        kind: FindingKind::Lost,
        bytes_on_storage: None,
        bytes_in_catalog: record.bytes,
        checksum_on_storage: None,
        checksum_in_catalog: record.checksum.clone(),
        storage_generated_at: storage.generated_at,
        catalog_generated_at: catalog.generated_at,
    }
}

fn corrupt_finding(
    rse: &RseInfo,
    on_storage: &DumpRecord,
    in_catalog: &DumpRecord,
    storage: &DumpHeader,
    catalog: &DumpHeader,
) -> Finding {
    Finding {
        rse_id: rse.id,
        rse: rse.name.clone(),
        path: on_storage.path.clone(),
        key: infer_file_key(&on_storage.path),
        kind: FindingKind::Corrupt,
        bytes_on_storage: on_storage.bytes,
        bytes_in_catalog: in_catalog.bytes,
        checksum_on_storage: on_storage.checksum.clone(),
        checksum_in_catalog: in_catalog.checksum.clone(),
        storage_generated_at: storage.generated_at,
        catalog_generated_at: catalog.generated_at,
    }
}
