//! Ports onto the catalog of record.
//!
//! The engine never talks to a database directly; everything goes through
//! these traits. `memory` backs tests and fixtures, `postgres` is the shipped
//! adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::rse::RseInfo;
use crate::types::{BadReplica, FileKey, Finding, ReplicaKey, RseId, SiblingReplica};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryCatalog;
#[cfg(feature = "postgres")]
pub use postgres::PgCatalog;

/// Creation/deletion timestamps for one catalog entry, used by the
/// reconciler's recency suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryActivity {
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Replica-state queries and transitions.
///
/// `list_bad_replicas` pages in `ReplicaKey` order and yields replicas in
/// state Bad or Recovering; Recovering items are re-examined for timeout by
/// the planner. Transitions are guarded by current state and report whether
/// a row actually changed, so re-execution is a no-op rather than an error.
#[async_trait]
pub trait ReplicaCatalog: Send + Sync {
    async fn list_rses(&self) -> Result<Vec<RseInfo>>;

    /// Pending bad-replica count per RSE.
    async fn bad_replica_backlog(&self) -> Result<HashMap<RseId, u64>>;

    async fn list_bad_replicas(
        &self,
        after: Option<&ReplicaKey>,
        limit: usize,
        rses: Option<&[RseId]>,
    ) -> Result<Vec<BadReplica>>;

    /// All replicas of the logical file, in catalog listing order.
    async fn sibling_states(&self, file: &FileKey) -> Result<Vec<SiblingReplica>>;

    /// Bad/Recovering -> Recovering with the given start time.
    async fn mark_recovering(
        &self,
        key: &ReplicaKey,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Bad/Recovering -> Lost. Already-Lost replicas report `false`.
    async fn mark_lost(&self, key: &ReplicaKey) -> Result<bool>;

    /// Queue storage-only paths for quarantine cleanup.
    async fn quarantine_paths(&self, rse_id: RseId, paths: &[String]) -> Result<u64>;

    /// Flag catalog entries whose files are missing or corrupt on storage as
    /// bad, so the recovery daemon picks them up. Returns how many replicas
    /// were newly flagged.
    async fn declare_bad(
        &self,
        rse_id: RseId,
        keys: &[FileKey],
        reason: &str,
    ) -> Result<u64>;
}

/// Recency lookups for reconciliation candidates.
#[async_trait]
pub trait RecencyOracle: Send + Sync {
    /// Activity timestamps for the given entries. Unknown keys are simply
    /// absent from the result.
    async fn entry_activity(
        &self,
        keys: &[FileKey],
    ) -> Result<HashMap<FileKey, EntryActivity>>;
}

/// Write-once persistence for reconciliation findings.
#[async_trait]
pub trait FindingStore: Send + Sync {
    /// Insert findings keyed by `(path, rse_id, storage_generation)`,
    /// ignoring duplicates. Returns the number of newly inserted rows.
    async fn record_findings(&self, findings: &[Finding]) -> Result<u64>;
}
