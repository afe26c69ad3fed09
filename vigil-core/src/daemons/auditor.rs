//! Storage/catalog audit daemon.
//!
//! Each cycle selects the RSEs matching the configured expression and audits
//! them concurrently: load the dump pair, reconcile, write the results file,
//! then record and declare the findings. A results file that already exists
//! for the storage generation makes the whole location a no-op, so re-runs
//! are cheap and never duplicate declarations.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::catalog::{FindingStore, RecencyOracle, ReplicaCatalog};
use crate::config::AuditorConfig;
use crate::dumps::DumpProvider;
use crate::error::{Result, VigilError};
use crate::reconcile::{reconcile, suppress_recent};
use crate::rse::{RseFilter, RseInfo};
use crate::runtime::{CycleOutcome, Daemon, DaemonContext, fan_out};
use crate::types::{FileKey, Finding, FindingKind};

/// Replica declaration reason attached to lost/corrupt findings, so operators
/// can trace a suspicious flag back to the audit.
const DECLARE_REASON: &str = "Reported by auditor";

enum LocationOutcome {
    Audited,
    Skipped,
}

/// The audit daemon. Holds its collaborators behind `Arc` so per-RSE workers
/// can share them.
pub struct Auditor {
    inner: Arc<AuditorInner>,
}

struct AuditorInner {
    config: AuditorConfig,
    filter: RseFilter,
    catalog: Arc<dyn ReplicaCatalog>,
    oracle: Arc<dyn RecencyOracle>,
    findings: Arc<dyn FindingStore>,
    dumps: Arc<dyn DumpProvider>,
}

impl std::fmt::Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Auditor {
    /// Fails when the RSE selection expression does not parse, so a typo
    /// stops the daemon at startup.
    pub fn new(
        config: AuditorConfig,
        catalog: Arc<dyn ReplicaCatalog>,
        oracle: Arc<dyn RecencyOracle>,
        findings: Arc<dyn FindingStore>,
        dumps: Arc<dyn DumpProvider>,
    ) -> Result<Self> {
        let filter = config.rse_filter()?;
        Ok(Self {
            inner: Arc::new(AuditorInner {
                config,
                filter,
                catalog,
                oracle,
                findings,
                dumps,
            }),
        })
    }
}

#[async_trait]
impl Daemon for Auditor {
    fn name(&self) -> &'static str {
        "auditor"
    }

    async fn run_cycle(&self, ctx: &DaemonContext) -> Result<CycleOutcome> {
        let rses = self.inner.catalog.list_rses().await?;
        let selected: Vec<RseInfo> = self
            .inner
            .filter
            .select(&rses)
            .into_iter()
            .cloned()
            .collect();
        if selected.is_empty() {
            warn!(
                expression = %self.inner.config.rses,
                "selection matches no RSEs, nothing to audit"
            );
            return Ok(CycleOutcome::Idle);
        }

        info!(rses = selected.len(), "audit cycle starting");
        let inner = self.inner.clone();
        let worker_ctx = ctx.clone();
        let handler = move |rse: RseInfo| {
            let inner = inner.clone();
            let ctx = worker_ctx.clone();
            async move {
                inner.audit_location(&ctx, rse).await;
            }
        };
        fan_out(ctx, self.inner.config.threads, selected, handler).await;

        let snap = ctx.stats().snapshot();
        info!(
            audited = snap.locations_audited,
            skipped = snap.locations_skipped,
            dark = snap.dark_recorded,
            lost = snap.lost_recorded,
            corrupt = snap.corrupt_recorded,
            suppressed = snap.suppressed_recent,
            malformed_lines = snap.malformed_lines,
            "audit cycle complete"
        );
        // Audits run on dump cadence; there is never a reason to re-pull
        // immediately.
        Ok(CycleOutcome::Idle)
    }

    fn sleep_time(&self) -> Duration {
        self.config().sleep_time()
    }

    fn run_once(&self) -> bool {
        self.config().run_once
    }
}

impl Auditor {
    fn config(&self) -> &AuditorConfig {
        &self.inner.config
    }
}

impl AuditorInner {
    /// Audit one RSE, translating errors into per-location accounting. The
    /// staged dumps are removed afterwards whatever the outcome.
    async fn audit_location(&self, ctx: &DaemonContext, rse: RseInfo) {
        let result = self.audit_rse(ctx, &rse).await;
        if let Err(err) = self.dumps.cleanup(&rse).await {
            warn!(rse = %rse.name, %err, "failed to remove cached dumps");
        }
        match result {
            Ok(LocationOutcome::Audited) => ctx.stats().on_location_audited(),
            Ok(LocationOutcome::Skipped) => ctx.stats().on_location_skipped(),
            Err(
                err @ (VigilError::StaleDumpPair { .. }
                | VigilError::MalformedDump { .. }
                | VigilError::DumpUnavailable { .. }),
            ) => {
                warn!(rse = %rse.name, %err, "location skipped");
                ctx.stats().on_location_skipped();
            }
            Err(err) => {
                warn!(rse = %rse.name, %err, "audit failed for location");
                ctx.stats().on_failed();
            }
        }
    }

    async fn audit_rse(
        &self,
        ctx: &DaemonContext,
        rse: &RseInfo,
    ) -> Result<LocationOutcome> {
        let storage = self.dumps.storage_dump(rse, self.config.date).await?;
        let storage_day = storage.header.generated_at.date_naive();

        let results_path = self.results_path(&rse.name, storage_day);
        if tokio::fs::try_exists(&results_path).await? {
            info!(
                rse = %rse.name,
                path = %results_path.display(),
                "results for this generation already exist, skipping"
            );
            return Ok(LocationOutcome::Skipped);
        }

        let catalog_dump = self.dumps.catalog_dump(rse, storage_day).await?;
        let outcome = reconcile(rse, &storage, &catalog_dump, self.config.delta())?;
        ctx.stats().on_malformed_lines(outcome.malformed_lines);

        // Recency lookups only matter for findings that map back to the
        // catalog namespace.
        let keys: Vec<FileKey> = outcome
            .findings
            .iter()
            .filter(|finding| {
                matches!(finding.kind, FindingKind::Dark | FindingKind::Lost)
            })
            .filter_map(|finding| finding.key.clone())
            .collect();
        let activity = self.oracle.entry_activity(&keys).await?;
        let (kept, suppressed) =
            suppress_recent(outcome.findings, &activity, self.config.recent_window());
        ctx.stats().on_suppressed_recent(suppressed);

        let kept = write_results(&results_path, kept).await?;

        let mut dark = Vec::new();
        let mut lost = Vec::new();
        let mut corrupt = Vec::new();
        for finding in kept {
            match finding.kind {
                FindingKind::Dark => dark.push(finding),
                FindingKind::Lost => lost.push(finding),
                FindingKind::Corrupt => corrupt.push(finding),
            }
        }

        if exceeds_sanity(
            dark.len(),
            lost.len() + corrupt.len(),
            outcome.storage_records,
            outcome.catalog_records,
            self.config.sanity_threshold,
        ) {
            warn!(
                rse = %rse.name,
                dark = dark.len(),
                lost = lost.len() + corrupt.len(),
                storage_records = outcome.storage_records,
                catalog_records = outcome.catalog_records,
                threshold = self.config.sanity_threshold,
                "findings exceed the sanity threshold, likely a bad dump; declaration withheld"
            );
        } else if self.config.no_declaration {
            debug!(rse = %rse.name, "declaration disabled, results file only");
        } else {
            self.record_and_declare(ctx, rse, &dark, &lost, &corrupt)
                .await?;
        }

        info!(
            rse = %rse.name,
            dark = dark.len(),
            lost = lost.len(),
            corrupt = corrupt.len(),
            suppressed,
            malformed_lines = outcome.malformed_lines,
            results = %results_path.display(),
            "location audited"
        );
        Ok(LocationOutcome::Audited)
    }

    /// Persist findings and push them into the catalog: dark paths queue for
    /// quarantine cleanup, lost/corrupt replicas are flagged bad so the
    /// recovery daemon picks them up.
    async fn record_and_declare(
        &self,
        ctx: &DaemonContext,
        rse: &RseInfo,
        dark: &[Finding],
        lost: &[Finding],
        corrupt: &[Finding],
    ) -> Result<()> {
        let bulk = self.config.bulk;

        ctx.stats()
            .on_dark_recorded(record_chunked(&*self.findings, dark, bulk).await?);
        ctx.stats()
            .on_lost_recorded(record_chunked(&*self.findings, lost, bulk).await?);
        ctx.stats()
            .on_corrupt_recorded(record_chunked(&*self.findings, corrupt, bulk).await?);

        let paths: Vec<String> = dark.iter().map(|finding| finding.path.clone()).collect();
        let mut quarantined = 0u64;
        for chunk in paths.chunks(bulk) {
            quarantined += self.catalog.quarantine_paths(rse.id, chunk).await?;
        }

        let keys: Vec<FileKey> = lost
            .iter()
            .chain(corrupt.iter())
            .filter_map(|finding| finding.key.clone())
            .collect();
        let unmapped = lost.len() + corrupt.len() - keys.len();
        if unmapped > 0 {
            debug!(rse = %rse.name, unmapped, "findings without a catalog identity cannot be declared");
        }
        let mut flagged = 0u64;
        for chunk in keys.chunks(bulk) {
            flagged += self.catalog.declare_bad(rse.id, chunk, DECLARE_REASON).await?;
        }

        debug!(rse = %rse.name, quarantined, flagged, "findings declared to the catalog");
        Ok(())
    }

    fn results_path(&self, rse: &str, generation: NaiveDate) -> PathBuf {
        self.config
            .results_dir
            .join(format!("result.{}_{}", rse, generation.format("%Y%m%d")))
    }
}

async fn record_chunked(
    store: &dyn FindingStore,
    findings: &[Finding],
    bulk: usize,
) -> Result<u64> {
    let mut inserted = 0u64;
    for chunk in findings.chunks(bulk) {
        inserted += store.record_findings(chunk).await?;
    }
    Ok(inserted)
}

/// One JSON object per line, written through a temp file in the same
/// directory so a crash never leaves a half-written results file behind.
async fn write_results(path: &Path, findings: Vec<Finding>) -> Result<Vec<Finding>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<Finding>> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let tmp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            for finding in &findings {
                serde_json::to_writer(&mut writer, finding)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        tmp.persist(&path).map_err(|err| VigilError::Io(err.error))?;
        Ok(findings)
    })
    .await
    .map_err(|err| VigilError::Internal(format!("results write task failed: {err}")))?
}

fn exceeds_sanity(
    dark: usize,
    lost_and_corrupt: usize,
    storage_records: u64,
    catalog_records: u64,
    threshold: f64,
) -> bool {
    dark as f64 > threshold * storage_records as f64
        || lost_and_corrupt as f64 > threshold * catalog_records as f64
}
