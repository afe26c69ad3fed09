//! Cursor-driven batch pulls over the bad-replica backlog.
//!
//! Batches advance a `ReplicaKey` cursor in (scope, name, rse) order, so the
//! replicas of one logical file are always adjacent. A full batch is extended
//! past the configured limit until the trailing file's replicas are all
//! included; decisions therefore never depend on where a batch boundary
//! happens to fall.

use std::sync::Arc;

use crate::catalog::ReplicaCatalog;
use crate::error::{Result, VigilError};
use crate::types::{BadReplica, ReplicaKey, RseId};

/// Continuation pulls while completing the trailing file-key group. A file
/// has at most one replica per RSE, so small chunks suffice.
const GROUP_EXTENSION_CHUNK: usize = 16;

/// One pulled batch plus the cursor to resume after it.
#[derive(Debug, Clone)]
pub struct WorkBatch<T> {
    pub items: Vec<T>,
    /// Key of the last item; resuming here skips everything in this batch.
    pub cursor: Option<ReplicaKey>,
    /// False once the backlog behind the cursor is drained.
    pub has_more: bool,
}

impl<T> WorkBatch<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Stateless pull source over the catalog's bad-replica backlog, optionally
/// scoped to a set of RSEs. The caller owns the cursor and advances it only
/// after a batch is fully processed, so a failed cycle re-pulls the same work.
pub struct BadReplicaSource {
    catalog: Arc<dyn ReplicaCatalog>,
    rses: Option<Vec<RseId>>,
}

impl std::fmt::Debug for BadReplicaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BadReplicaSource")
            .field("rses", &self.rses)
            .finish_non_exhaustive()
    }
}

impl BadReplicaSource {
    pub fn new(catalog: Arc<dyn ReplicaCatalog>, rses: Option<Vec<RseId>>) -> Self {
        Self { catalog, rses }
    }

    /// Pull the next batch after `cursor`. An empty batch with
    /// `has_more = false` signals exhaustion. A zero `limit` is rejected
    /// rather than treated as an empty pull.
    pub async fn next_batch(
        &self,
        cursor: Option<&ReplicaKey>,
        limit: usize,
    ) -> Result<WorkBatch<BadReplica>> {
        if limit == 0 {
            return Err(VigilError::Config(
                "batch limit must be at least 1".to_string(),
            ));
        }
        let mut items = self
            .catalog
            .list_bad_replicas(cursor, limit, self.rses.as_deref())
            .await?;
        let mut has_more = items.len() == limit;

        // Full batch: keep pulling while the boundary would split the
        // trailing file's replica group.
        while has_more {
            let Some(tail_file) = items.last().map(|item| item.key.file.clone()) else {
                break;
            };
            let continuation = self
                .catalog
                .list_bad_replicas(
                    items.last().map(|item| &item.key),
                    GROUP_EXTENSION_CHUNK,
                    self.rses.as_deref(),
                )
                .await?;
            if continuation.is_empty() {
                has_more = false;
                break;
            }
            let drained = continuation.len() < GROUP_EXTENSION_CHUNK;
            let mut boundary_found = false;
            for item in continuation {
                if item.key.file == tail_file {
                    items.push(item);
                } else {
                    // First foreign file: it re-pulls as the head of the
                    // next batch.
                    boundary_found = true;
                    break;
                }
            }
            if boundary_found {
                break;
            }
            if drained {
                has_more = false;
                break;
            }
        }

        let cursor = items.last().map(|item| item.key.clone());
        Ok(WorkBatch {
            items,
            cursor,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::catalog::MemoryCatalog;
    use crate::types::{FileKey, ReplicaState};

    fn seed_backlog(catalog: &MemoryCatalog, rses: &[RseId], files: &[(&str, usize)]) {
        for (name, copies) in files {
            for rse_id in rses.iter().take(*copies) {
                catalog.insert_replica(
                    ReplicaKey::new(FileKey::new("data", *name), *rse_id),
                    "SITE",
                    ReplicaState::Bad,
                    Some(1024),
                    None,
                    "checksum mismatch",
                    Utc::now(),
                );
            }
        }
    }

    fn fixed_rses(count: u128) -> Vec<RseId> {
        (1..=count).map(|n| RseId(Uuid::from_u128(n))).collect()
    }

    #[tokio::test]
    async fn full_batches_extend_to_file_boundaries() {
        let catalog = Arc::new(MemoryCatalog::new());
        let rses = fixed_rses(3);
        seed_backlog(&catalog, &rses, &[("a.root", 3), ("b.root", 1)]);

        let source = BadReplicaSource::new(catalog, None);
        let first = source.next_batch(None, 2).await.unwrap();
        // Limit 2 would split a.root's three replicas; all of them come along.
        assert_eq!(first.items.len(), 3);
        assert!(first.items.iter().all(|r| r.key.file.name == "a.root"));
        assert!(first.has_more);

        let second = source.next_batch(first.cursor.as_ref(), 2).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].key.file.name, "b.root");
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn drain_is_finite_ordered_and_disjoint() {
        let catalog = Arc::new(MemoryCatalog::new());
        let rses = fixed_rses(2);
        seed_backlog(
            &catalog,
            &rses,
            &[("a.root", 2), ("b.root", 1), ("c.root", 2), ("d.root", 1)],
        );

        let source = BadReplicaSource::new(catalog, None);
        let mut cursor = None;
        let mut seen: Vec<ReplicaKey> = Vec::new();
        loop {
            let batch = source.next_batch(cursor.as_ref(), 3).await.unwrap();
            for item in &batch.items {
                seen.push(item.key.clone());
            }
            cursor = batch.cursor;
            if !batch.has_more {
                break;
            }
        }

        assert_eq!(seen.len(), 6);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn scoped_source_only_yields_requested_rses() {
        let catalog = Arc::new(MemoryCatalog::new());
        let rses = fixed_rses(2);
        seed_backlog(&catalog, &rses, &[("a.root", 2), ("b.root", 2)]);

        let source = BadReplicaSource::new(catalog, Some(vec![rses[0]]));
        let batch = source.next_batch(None, 10).await.unwrap();
        assert_eq!(batch.items.len(), 2);
        assert!(batch.items.iter().all(|r| r.key.rse_id == rses[0]));
        assert!(!batch.has_more);
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let source = BadReplicaSource::new(Arc::new(MemoryCatalog::new()), None);
        let err = source.next_batch(None, 0).await.unwrap_err();
        assert!(matches!(err, VigilError::Config(_)));
    }

    #[tokio::test]
    async fn same_cursor_repulls_the_same_batch() {
        let catalog = Arc::new(MemoryCatalog::new());
        let rses = fixed_rses(2);
        seed_backlog(&catalog, &rses, &[("a.root", 2), ("b.root", 2)]);

        let source = BadReplicaSource::new(catalog, None);
        let once = source.next_batch(None, 3).await.unwrap();
        let again = source.next_batch(None, 3).await.unwrap();
        let keys = |batch: &WorkBatch<BadReplica>| {
            batch
                .items
                .iter()
                .map(|r| r.key.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&once), keys(&again));
        assert_eq!(once.cursor, again.cursor);
    }
}
