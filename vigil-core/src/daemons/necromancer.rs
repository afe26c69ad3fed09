//! Bad-replica recovery daemon.
//!
//! Each cycle pulls the bad-replica backlog in batches, plans one action per
//! replica against its siblings and executes it. When the global backlog
//! exceeds `max_backlog` the pull is split into per-RSE shards so one flooded
//! site cannot starve the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::batch::BadReplicaSource;
use crate::catalog::ReplicaCatalog;
use crate::config::NecromancerConfig;
use crate::error::Result;
use crate::execute::{ActionExecutor, ActionOutcome};
use crate::recovery;
use crate::runtime::{CycleOutcome, Daemon, DaemonContext, fan_out};
use crate::transfer::TransferSubmitter;
use crate::types::{BadReplica, RseId};

/// Per-RSE backlog counts, cached so sharding does not hit the catalog with
/// an aggregate query every cycle.
#[derive(Debug)]
struct BacklogSnapshot {
    counts: HashMap<RseId, u64>,
    taken_at: DateTime<Utc>,
}

/// The recovery daemon. One instance drives the whole backlog; parallelism
/// happens inside the cycle, not across instances.
pub struct Necromancer {
    config: NecromancerConfig,
    catalog: Arc<dyn ReplicaCatalog>,
    executor: Arc<ActionExecutor>,
    backlog_cache: Mutex<Option<BacklogSnapshot>>,
}

impl std::fmt::Debug for Necromancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Necromancer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Necromancer {
    pub fn new(
        config: NecromancerConfig,
        catalog: Arc<dyn ReplicaCatalog>,
        transfers: Arc<dyn TransferSubmitter>,
    ) -> Self {
        let executor = Arc::new(ActionExecutor::new(catalog.clone(), transfers));
        Self {
            config,
            catalog,
            executor,
            backlog_cache: Mutex::new(None),
        }
    }

    /// Backlog counts per RSE, refreshed when the cached snapshot is older
    /// than `backlog_cache_secs`.
    async fn backlog_counts(&self) -> Result<HashMap<RseId, u64>> {
        if let Some(snapshot) = self.backlog_cache.lock().as_ref()
            && Utc::now() - snapshot.taken_at < self.config.backlog_cache()
        {
            return Ok(snapshot.counts.clone());
        }

        let counts = self.catalog.bad_replica_backlog().await?;
        debug!(
            rses = counts.len(),
            total = counts.values().sum::<u64>(),
            "refreshed backlog counts"
        );
        *self.backlog_cache.lock() = Some(BacklogSnapshot {
            counts: counts.clone(),
            taken_at: Utc::now(),
        });
        Ok(counts)
    }

    /// Decide the pull plan for this cycle. `None` means one unsharded pull
    /// across all RSEs.
    async fn plan_shards(&self) -> Result<Vec<Option<Vec<RseId>>>> {
        if self.config.max_backlog == 0 {
            return Ok(vec![None]);
        }

        let counts = self.backlog_counts().await?;
        let total: u64 = counts.values().sum();
        if total > self.config.max_backlog && counts.len() > 1 {
            debug!(
                total,
                max_backlog = self.config.max_backlog,
                "backlog over limit, sharding pulls by RSE"
            );
            let shards = shard_rses(&counts, self.config.bulk as u64);
            return Ok(shards.into_iter().map(Some).collect());
        }
        Ok(vec![None])
    }

    /// Pull one shard to exhaustion, batch by batch. The cursor only moves
    /// after the batch it closed has been fully processed, so a crash re-pulls
    /// unfinished work instead of dropping it.
    async fn drain_shard(
        &self,
        ctx: &DaemonContext,
        shard: Option<Vec<RseId>>,
    ) -> Result<u64> {
        let source = BadReplicaSource::new(self.catalog.clone(), shard);
        let mut cursor = None;
        let mut pulled = 0u64;
        loop {
            if ctx.is_shutdown_requested() {
                break;
            }
            let batch = source.next_batch(cursor.as_ref(), self.config.bulk).await?;
            if batch.is_empty() {
                break;
            }
            pulled += batch.items.len() as u64;
            self.process_batch(ctx, batch.items).await;
            cursor = batch.cursor;
            if !batch.has_more {
                break;
            }
        }
        Ok(pulled)
    }

    async fn process_batch(&self, ctx: &DaemonContext, items: Vec<BadReplica>) {
        let catalog = self.catalog.clone();
        let executor = self.executor.clone();
        let timeout = self.config.recovering_timeout();
        let worker_ctx = ctx.clone();
        let handler = move |item: BadReplica| {
            let catalog = catalog.clone();
            let executor = executor.clone();
            let ctx = worker_ctx.clone();
            async move {
                process_item(catalog, executor, ctx, timeout, item).await;
            }
        };
        fan_out(ctx, self.config.threads, items, handler).await;
    }
}

#[async_trait]
impl Daemon for Necromancer {
    fn name(&self) -> &'static str {
        "necromancer"
    }

    async fn run_cycle(&self, ctx: &DaemonContext) -> Result<CycleOutcome> {
        let shards = self.plan_shards().await?;
        let mut pulled = 0u64;
        for shard in shards {
            if ctx.is_shutdown_requested() {
                break;
            }
            pulled += self.drain_shard(ctx, shard).await?;
        }

        let snap = ctx.stats().snapshot();
        info!(
            pulled,
            repairs = snap.repairs_submitted,
            lost = snap.lost_declared,
            deferred = snap.deferred,
            failed = snap.failed,
            "recovery cycle complete"
        );

        // Skip the sleep only while the cycle is actually moving replicas;
        // a backlog of freshly deferred items would otherwise spin.
        let acted = snap.repairs_submitted + snap.lost_declared > 0;
        if pulled > 0 && acted {
            Ok(CycleOutcome::Busy)
        } else {
            Ok(CycleOutcome::Idle)
        }
    }

    fn sleep_time(&self) -> Duration {
        self.config.sleep_time()
    }

    fn run_once(&self) -> bool {
        self.config.run_once
    }
}

/// Plan, execute and account for a single replica. Failures are recorded and
/// logged; the item stays Bad and is re-pulled next cycle.
async fn process_item(
    catalog: Arc<dyn ReplicaCatalog>,
    executor: Arc<ActionExecutor>,
    ctx: DaemonContext,
    recovering_timeout: chrono::Duration,
    item: BadReplica,
) {
    ctx.stats().on_processed();
    let outcome = async {
        let siblings = catalog.sibling_states(&item.key.file).await?;
        let decision = recovery::plan(&item, &siblings, recovering_timeout, Utc::now());
        executor.execute(&item, &decision, Utc::now()).await
    }
    .await;

    match outcome {
        Ok(ActionOutcome::RepairUnderway { newly_submitted }) => {
            if newly_submitted {
                ctx.stats().on_repair_submitted();
            }
        }
        Ok(ActionOutcome::Lost { newly_declared }) => {
            if newly_declared {
                ctx.stats().on_lost_declared();
            }
        }
        Ok(ActionOutcome::Deferred) => ctx.stats().on_deferred(),
        Err(err) => {
            ctx.stats().on_failed();
            warn!(replica = %item.key, %err, "recovery failed, will retry next cycle");
        }
    }
}

/// Group RSEs into pull shards, largest backlog first, closing a group once
/// it accumulates at least `bulk` pending replicas. The trailing partial
/// group is kept so small sites still get pulled.
fn shard_rses(counts: &HashMap<RseId, u64>, bulk: u64) -> Vec<Vec<RseId>> {
    let mut by_backlog: Vec<(RseId, u64)> = counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(rse_id, count)| (*rse_id, *count))
        .collect();
    by_backlog.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut shards = Vec::new();
    let mut group = Vec::new();
    let mut accumulated = 0u64;
    for (rse_id, count) in by_backlog {
        group.push(rse_id);
        accumulated += count;
        if accumulated >= bulk {
            shards.push(std::mem::take(&mut group));
            accumulated = 0;
        }
    }
    if !group.is_empty() {
        shards.push(group);
    }
    shards
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::transfer::RecordingSubmitter;
    use crate::types::{Checksum, FileKey, ReplicaKey, ReplicaState};

    fn rse_id(seed: u128) -> RseId {
        RseId(Uuid::from_u128(seed))
    }

    fn key(scope: &str, name: &str, rse: RseId) -> ReplicaKey {
        ReplicaKey {
            file: FileKey::new(scope, name),
            rse_id: rse,
        }
    }

    fn seed_bad(catalog: &MemoryCatalog, key: ReplicaKey, rse: &str) {
        catalog.insert_replica(
            key,
            rse,
            ReplicaState::Bad,
            Some(1024),
            Some(Checksum("ad0c9931".into())),
            "checksum mismatch",
            Utc::now() - ChronoDuration::hours(1),
        );
    }

    fn config() -> NecromancerConfig {
        NecromancerConfig {
            threads: 2,
            bulk: 10,
            run_once: true,
            ..NecromancerConfig::default()
        }
    }

    #[test]
    fn sharding_closes_groups_at_bulk_and_keeps_the_tail() {
        let counts: HashMap<RseId, u64> = [
            (rse_id(1), 500),
            (rse_id(2), 300),
            (rse_id(3), 250),
            (rse_id(4), 10),
            (rse_id(5), 0),
        ]
        .into_iter()
        .collect();

        let shards = shard_rses(&counts, 600);
        assert_eq!(shards, vec![
            vec![rse_id(1), rse_id(2)],
            vec![rse_id(3), rse_id(4)],
        ]);
    }

    #[test]
    fn sharding_with_everything_under_bulk_yields_one_group() {
        let counts: HashMap<RseId, u64> =
            [(rse_id(1), 5), (rse_id(2), 3)].into_iter().collect();
        assert_eq!(shard_rses(&counts, 600), vec![vec![rse_id(1), rse_id(2)]]);
    }

    #[tokio::test]
    async fn cycle_repairs_when_a_sibling_exists_and_declares_lost_otherwise() {
        let catalog = Arc::new(MemoryCatalog::new());
        let good = catalog.add_rse("SITE_A_DISK");
        let bad = catalog.add_rse("SITE_B_DISK");

        // orphan: bad on B with no other copy anywhere
        let orphan = key("data", "orphan.root", bad.id);
        seed_bad(&catalog, orphan.clone(), "SITE_B_DISK");

        // repairable: bad on B, available on A
        let repairable = key("data", "repairable.root", bad.id);
        seed_bad(&catalog, repairable.clone(), "SITE_B_DISK");
        catalog.insert_replica(
            key("data", "repairable.root", good.id),
            "SITE_A_DISK",
            ReplicaState::Available,
            Some(1024),
            Some(Checksum("ad0c9931".into())),
            "",
            Utc::now() - ChronoDuration::days(30),
        );

        let submitter = Arc::new(RecordingSubmitter::default());
        let daemon = Necromancer::new(config(), catalog.clone(), submitter.clone());
        let ctx = DaemonContext::default();

        let outcome = daemon.run_cycle(&ctx).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Busy);

        assert_eq!(catalog.replica_state(&orphan), Some(ReplicaState::Lost));
        assert_eq!(
            catalog.replica_state(&repairable),
            Some(ReplicaState::Recovering)
        );
        let submitted = submitter.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].dest_rse_id, bad.id);

        let snap = ctx.stats().snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.repairs_submitted, 1);
        assert_eq!(snap.lost_declared, 1);
        assert_eq!(snap.failed, 0);
    }

    #[tokio::test]
    async fn second_cycle_defers_fresh_recoveries_and_reports_idle() {
        let catalog = Arc::new(MemoryCatalog::new());
        let good = catalog.add_rse("SITE_A_DISK");
        let bad = catalog.add_rse("SITE_B_DISK");

        let item = key("data", "f.root", bad.id);
        seed_bad(&catalog, item.clone(), "SITE_B_DISK");
        catalog.insert_replica(
            key("data", "f.root", good.id),
            "SITE_A_DISK",
            ReplicaState::Available,
            Some(1024),
            None,
            "",
            Utc::now() - ChronoDuration::days(30),
        );

        let submitter = Arc::new(RecordingSubmitter::default());
        let daemon = Necromancer::new(config(), catalog.clone(), submitter.clone());

        let first = DaemonContext::default();
        assert_eq!(daemon.run_cycle(&first).await.unwrap(), CycleOutcome::Busy);

        let second = DaemonContext::default();
        assert_eq!(daemon.run_cycle(&second).await.unwrap(), CycleOutcome::Idle);

        let snap = second.stats().snapshot();
        assert_eq!(snap.deferred, 1);
        assert_eq!(snap.repairs_submitted, 0);
        assert_eq!(submitter.submitted().len(), 1);
    }

    #[tokio::test]
    async fn empty_backlog_is_an_idle_cycle() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_rse("SITE_A_DISK");

        let daemon = Necromancer::new(
            config(),
            catalog,
            Arc::new(RecordingSubmitter::default()),
        );
        let ctx = DaemonContext::default();
        assert_eq!(daemon.run_cycle(&ctx).await.unwrap(), CycleOutcome::Idle);
        assert_eq!(ctx.stats().snapshot().processed, 0);
    }

    #[tokio::test]
    async fn shutdown_between_shards_stops_the_pull() {
        let catalog = Arc::new(MemoryCatalog::new());
        let rse = catalog.add_rse("SITE_A_DISK");
        seed_bad(&catalog, key("data", "f.root", rse.id), "SITE_A_DISK");

        let daemon = Necromancer::new(
            config(),
            catalog,
            Arc::new(RecordingSubmitter::default()),
        );
        let ctx = DaemonContext::default();
        ctx.request_shutdown();

        assert_eq!(daemon.run_cycle(&ctx).await.unwrap(), CycleOutcome::Idle);
        assert_eq!(ctx.stats().snapshot().processed, 0);
    }
}
