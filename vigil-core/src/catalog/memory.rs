//! In-memory catalog, for tests and local fixtures.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::catalog::{EntryActivity, FindingStore, RecencyOracle, ReplicaCatalog};
use crate::error::Result;
use crate::rse::RseInfo;
use crate::types::{
    BadReplica, Checksum, FileKey, Finding, ReplicaKey, ReplicaState, RseId,
    SiblingReplica,
};

#[derive(Debug, Clone)]
struct StoredReplica {
    rse: String,
    state: ReplicaState,
    bytes: Option<u64>,
    checksum: Option<Checksum>,
    reason: String,
    declared_at: DateTime<Utc>,
    recovering_since: Option<DateTime<Utc>>,
    /// Insertion order, so sibling listings are stable under test control.
    seq: usize,
}

#[derive(Debug, Default)]
struct Inner {
    rses: Vec<RseInfo>,
    replicas: BTreeMap<ReplicaKey, StoredReplica>,
    entries: HashMap<FileKey, EntryActivity>,
    quarantined: HashMap<RseId, BTreeSet<String>>,
    findings: BTreeMap<(RseId, String, DateTime<Utc>), Finding>,
    next_seq: usize,
}

/// Catalog backed by plain maps behind a lock. Implements every port.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rse(&self, name: &str) -> RseInfo {
        let info = RseInfo::new(name);
        self.inner.write().rses.push(info.clone());
        info
    }

    pub fn add_rse_info(&self, info: RseInfo) {
        self.inner.write().rses.push(info);
    }

    /// Insert a replica row. Listing order for siblings follows insertion.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_replica(
        &self,
        key: ReplicaKey,
        rse: &str,
        state: ReplicaState,
        bytes: Option<u64>,
        checksum: Option<Checksum>,
        reason: &str,
        declared_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.replicas.insert(
            key,
            StoredReplica {
                rse: rse.to_string(),
                state,
                bytes,
                checksum,
                reason: reason.to_string(),
                declared_at,
                recovering_since: None,
                seq,
            },
        );
    }

    pub fn insert_entry(
        &self,
        key: FileKey,
        created_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) {
        self.inner.write().entries.insert(
            key,
            EntryActivity {
                created_at,
                deleted_at,
            },
        );
    }

    pub fn set_recovering_since(&self, key: &ReplicaKey, at: DateTime<Utc>) {
        if let Some(row) = self.inner.write().replicas.get_mut(key) {
            row.recovering_since = Some(at);
        }
    }

    pub fn replica_state(&self, key: &ReplicaKey) -> Option<ReplicaState> {
        self.inner.read().replicas.get(key).map(|row| row.state)
    }

    pub fn quarantined(&self, rse_id: RseId) -> Vec<String> {
        self.inner
            .read()
            .quarantined
            .get(&rse_id)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.inner.read().findings.values().cloned().collect()
    }

    fn sibling_rows(inner: &Inner, file: &FileKey) -> Vec<(ReplicaKey, StoredReplica)> {
        let mut rows: Vec<_> = inner
            .replicas
            .iter()
            .filter(|(key, _)| &key.file == file)
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect();
        rows.sort_by_key(|(_, row)| row.seq);
        rows
    }
}

#[async_trait]
impl ReplicaCatalog for MemoryCatalog {
    async fn list_rses(&self) -> Result<Vec<RseInfo>> {
        Ok(self.inner.read().rses.clone())
    }

    async fn bad_replica_backlog(&self) -> Result<HashMap<RseId, u64>> {
        let inner = self.inner.read();
        let mut backlog: HashMap<RseId, u64> = HashMap::new();
        for (key, row) in &inner.replicas {
            if row.state == ReplicaState::Bad {
                *backlog.entry(key.rse_id).or_default() += 1;
            }
        }
        Ok(backlog)
    }

    async fn list_bad_replicas(
        &self,
        after: Option<&ReplicaKey>,
        limit: usize,
        rses: Option<&[RseId]>,
    ) -> Result<Vec<BadReplica>> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for (key, row) in &inner.replicas {
            if out.len() >= limit {
                break;
            }
            if after.is_some_and(|cursor| key <= cursor) {
                continue;
            }
            if !matches!(row.state, ReplicaState::Bad | ReplicaState::Recovering) {
                continue;
            }
            if rses.is_some_and(|ids| !ids.contains(&key.rse_id)) {
                continue;
            }
            out.push(BadReplica {
                key: key.clone(),
                rse: row.rse.clone(),
                state: row.state,
                bytes: row.bytes,
                checksum: row.checksum.clone(),
                reason: row.reason.clone(),
                declared_at: row.declared_at,
                recovering_since: row.recovering_since,
            });
        }
        Ok(out)
    }

    async fn sibling_states(&self, file: &FileKey) -> Result<Vec<SiblingReplica>> {
        let inner = self.inner.read();
        Ok(Self::sibling_rows(&inner, file)
            .into_iter()
            .map(|(key, row)| SiblingReplica {
                rse_id: key.rse_id,
                rse: row.rse,
                state: row.state,
                recovering_since: row.recovering_since,
            })
            .collect())
    }

    async fn mark_recovering(
        &self,
        key: &ReplicaKey,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.replicas.get_mut(key) {
            Some(row)
                if matches!(
                    row.state,
                    ReplicaState::Bad | ReplicaState::Recovering
                ) =>
            {
                row.state = ReplicaState::Recovering;
                row.recovering_since = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_lost(&self, key: &ReplicaKey) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.replicas.get_mut(key) {
            Some(row)
                if matches!(
                    row.state,
                    ReplicaState::Bad | ReplicaState::Recovering
                ) =>
            {
                row.state = ReplicaState::Lost;
                row.recovering_since = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn quarantine_paths(&self, rse_id: RseId, paths: &[String]) -> Result<u64> {
        let mut inner = self.inner.write();
        let set = inner.quarantined.entry(rse_id).or_default();
        let mut added = 0;
        for path in paths {
            if set.insert(path.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn declare_bad(
        &self,
        rse_id: RseId,
        keys: &[FileKey],
        reason: &str,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let mut flagged = 0;
        for file in keys {
            let key = ReplicaKey {
                file: file.clone(),
                rse_id,
            };
            if let Some(row) = inner.replicas.get_mut(&key) {
                if !matches!(
                    row.state,
                    ReplicaState::Bad | ReplicaState::Recovering | ReplicaState::Lost
                ) {
                    row.state = ReplicaState::Bad;
                    row.reason = reason.to_string();
                    row.declared_at = now;
                    flagged += 1;
                }
            }
        }
        Ok(flagged)
    }
}

#[async_trait]
impl RecencyOracle for MemoryCatalog {
    async fn entry_activity(
        &self,
        keys: &[FileKey],
    ) -> Result<HashMap<FileKey, EntryActivity>> {
        let inner = self.inner.read();
        Ok(keys
            .iter()
            .filter_map(|key| inner.entries.get(key).map(|a| (key.clone(), *a)))
            .collect())
    }
}

#[async_trait]
impl FindingStore for MemoryCatalog {
    async fn record_findings(&self, findings: &[Finding]) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut inserted = 0;
        for finding in findings {
            let (rse_id, path, generation) = finding.dedup_key();
            let key = (rse_id, path.to_string(), generation);
            if !inner.findings.contains_key(&key) {
                inner.findings.insert(key, finding.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
