use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the cycle counters, for the cycle summary log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStatsSnapshot {
    pub processed: u64,
    pub repairs_submitted: u64,
    pub lost_declared: u64,
    pub deferred: u64,
    pub failed: u64,
    pub dark_recorded: u64,
    pub lost_recorded: u64,
    pub corrupt_recorded: u64,
    pub suppressed_recent: u64,
    pub locations_audited: u64,
    pub locations_skipped: u64,
    pub malformed_lines: u64,
}

/// Shared counters for one daemon cycle. Workers increment concurrently;
/// the runtime resets at cycle start and snapshots at cycle end.
#[derive(Debug, Default)]
pub struct CycleStats {
    processed: AtomicU64,
    repairs_submitted: AtomicU64,
    lost_declared: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
    dark_recorded: AtomicU64,
    lost_recorded: AtomicU64,
    corrupt_recorded: AtomicU64,
    suppressed_recent: AtomicU64,
    locations_audited: AtomicU64,
    locations_skipped: AtomicU64,
    malformed_lines: AtomicU64,
}

impl CycleStats {
    pub fn on_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_repair_submitted(&self) {
        self.repairs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_lost_declared(&self) {
        self.lost_declared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_dark_recorded(&self, count: u64) {
        self.dark_recorded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn on_lost_recorded(&self, count: u64) {
        self.lost_recorded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn on_corrupt_recorded(&self, count: u64) {
        self.corrupt_recorded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn on_suppressed_recent(&self, count: u64) {
        self.suppressed_recent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn on_location_audited(&self) {
        self.locations_audited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_location_skipped(&self) {
        self.locations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_malformed_lines(&self, count: u64) {
        self.malformed_lines.fetch_add(count, Ordering::Relaxed);
    }

    /// Zero every counter. Called at the top of each cycle.
    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.repairs_submitted.store(0, Ordering::Relaxed);
        self.lost_declared.store(0, Ordering::Relaxed);
        self.deferred.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.dark_recorded.store(0, Ordering::Relaxed);
        self.lost_recorded.store(0, Ordering::Relaxed);
        self.corrupt_recorded.store(0, Ordering::Relaxed);
        self.suppressed_recent.store(0, Ordering::Relaxed);
        self.locations_audited.store(0, Ordering::Relaxed);
        self.locations_skipped.store(0, Ordering::Relaxed);
        self.malformed_lines.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CycleStatsSnapshot {
        CycleStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            repairs_submitted: self.repairs_submitted.load(Ordering::Relaxed),
            lost_declared: self.lost_declared.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dark_recorded: self.dark_recorded.load(Ordering::Relaxed),
            lost_recorded: self.lost_recorded.load(Ordering::Relaxed),
            corrupt_recorded: self.corrupt_recorded.load(Ordering::Relaxed),
            suppressed_recent: self.suppressed_recent.load(Ordering::Relaxed),
            locations_audited: self.locations_audited.load(Ordering::Relaxed),
            locations_skipped: self.locations_skipped.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
        }
    }
}
