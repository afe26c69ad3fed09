//! Shared daemon loop: INIT, then PULL/PROCESS/SLEEP until told to stop.
//!
//! Cancellation is observed between cycles, between items, and during the
//! sleep; an item that has started always runs to completion, so no decision
//! is ever left half-applied by a shutdown.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::stats::CycleStats;

/// Shared per-daemon state: the shutdown token and the cycle counters.
#[derive(Debug, Clone, Default)]
pub struct DaemonContext {
    shutdown: CancellationToken,
    stats: Arc<CycleStats>,
}

impl DaemonContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request a graceful stop. Safe to call repeatedly.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Sleep that wakes early on shutdown. Returns false when it did.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// How a cycle left the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing left to do right now: sleep before the next cycle.
    Idle,
    /// A full backlog was processed: pull again without sleeping.
    Busy,
}

/// One long-running daemon: the necromancer or the auditor.
#[async_trait]
pub trait Daemon: Send + Sync {
    fn name(&self) -> &'static str;

    /// One PULL then PROCESS pass. Per-item failures are absorbed inside;
    /// an `Err` from here is a cycle-level failure (catalog unreachable),
    /// logged and retried after the sleep.
    async fn run_cycle(&self, ctx: &DaemonContext) -> Result<CycleOutcome>;

    fn sleep_time(&self) -> Duration;

    fn run_once(&self) -> bool;
}

/// Drive a daemon until shutdown (or one cycle with `run_once`). In
/// `run_once` mode a failed cycle propagates so the process can exit
/// nonzero.
pub async fn run_daemon(daemon: &dyn Daemon, ctx: &DaemonContext) -> Result<()> {
    info!(daemon = daemon.name(), "daemon starting");
    loop {
        if ctx.is_shutdown_requested() {
            break;
        }
        ctx.stats().reset();
        let outcome = match daemon.run_cycle(ctx).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_transient() && !daemon.run_once() => {
                error!(daemon = daemon.name(), %err, "cycle failed, retrying after sleep");
                CycleOutcome::Idle
            }
            Err(err) => return Err(err),
        };
        let stats = ctx.stats().snapshot();
        debug!(
            daemon = daemon.name(),
            processed = stats.processed,
            failed = stats.failed,
            "cycle complete"
        );
        if daemon.run_once() {
            break;
        }
        if outcome == CycleOutcome::Idle && !ctx.sleep(daemon.sleep_time()).await {
            break;
        }
    }
    info!(daemon = daemon.name(), "daemon stopped");
    Ok(())
}

/// Fan `items` across up to `threads` worker tasks. Workers claim disjoint
/// items through a shared index, clone them out, and run the handler to
/// completion; once the context is cancelled no further items are claimed.
/// The handler owns per-item error isolation.
pub async fn fan_out<T, F, Fut>(ctx: &DaemonContext, threads: usize, items: Vec<T>, handler: F)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if items.is_empty() {
        return;
    }
    let workers = threads.clamp(1, items.len());
    let items = Arc::new(items);
    let next = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let items = Arc::clone(&items);
        let next = Arc::clone(&next);
        let handler = handler.clone();
        let shutdown = ctx.shutdown_token();
        handles.push(tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(item) = items.get(index) else { break };
                handler(item.clone()).await;
            }
        }));
    }
    for handle in handles {
        if let Err(err) = handle.await {
            error!(%err, "batch worker task failed");
        }
    }
}
