//! # vigild
//!
//! The Vigil daemon binary. Two subcommands share one catalog:
//!
//! - **necromancer** drives bad replicas to Recovering (repair transfer from
//!   a surviving sibling) or Lost
//! - **auditor** reconciles storage dumps against catalog dumps and declares
//!   the differences
//!
//! Both run the cycle loop from `vigil_core::runtime`: pull, process across
//! a worker pool, sleep, repeat, with graceful shutdown on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vigil_core::catalog::PgCatalog;
use vigil_core::config::{AuditorConfig, NecromancerConfig, Settings};
use vigil_core::daemons::{Auditor, Necromancer};
use vigil_core::dumps::FsDumpProvider;
use vigil_core::runtime::{DaemonContext, run_daemon};
use vigil_core::transfer::PgTransferQueue;

#[derive(Parser, Debug)]
#[command(name = "vigild", version)]
#[command(about = "Consistency daemons for replica catalogs - recovery and audit")]
struct Cli {
    /// Optional TOML settings file (database, directories, thresholds)
    #[arg(long, global = true, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover bad replicas: repair from a surviving copy or declare lost
    Necromancer(NecromancerArgs),
    /// Reconcile storage dumps against the catalog and declare the findings
    Auditor(AuditorArgs),
}

#[derive(Args, Debug, Clone)]
struct SharedArgs {
    /// Execute one cycle and exit
    #[arg(long)]
    run_once: bool,

    /// Worker pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Batch size per pull
    #[arg(long)]
    bulk: Option<usize>,

    /// Seconds to sleep after an idle cycle
    #[arg(long)]
    sleep_time: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct NecromancerArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Hours before a stuck Recovering replica is re-planned
    #[arg(long)]
    recovering_timeout: Option<i64>,

    /// Shard pulls across RSE groups when the backlog exceeds this
    #[arg(long)]
    max_backlog: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct AuditorArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// RSE selection expression, e.g. 'tier=2&disk!=slow' or '*'
    #[arg(long)]
    rses: Option<String>,

    /// Maximum dump pair skew in days
    #[arg(long)]
    delta: Option<i64>,

    /// Audit the storage dump generated on this date instead of the newest
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Keep staged dumps after the cycle
    #[arg(long)]
    keep_dumps: bool,

    /// Write results files but perform no catalog actions
    #[arg(long)]
    no_declaration: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("cannot load settings from {}", path.display()))?,
        None => Settings::default(),
    };

    match cli.command {
        Command::Necromancer(args) => run_necromancer(settings, args).await,
        Command::Auditor(args) => run_auditor(settings, args).await,
    }
}

async fn run_necromancer(
    mut settings: Settings,
    args: NecromancerArgs,
) -> anyhow::Result<()> {
    apply_necromancer_args(&mut settings.necromancer, &args);
    settings
        .necromancer
        .validate()
        .context("invalid necromancer configuration")?;

    let catalog = Arc::new(
        PgCatalog::connect(&settings.database)
            .await
            .context("cannot connect to the catalog")?,
    );
    catalog.initialize_schema().await?;
    let transfers = Arc::new(PgTransferQueue::new(catalog.pool().clone()));
    transfers.initialize_schema().await?;

    let daemon = Necromancer::new(settings.necromancer, catalog, transfers);
    let ctx = DaemonContext::default();
    spawn_signal_listener(&ctx);
    run_daemon(&daemon, &ctx)
        .await
        .context("necromancer terminated with an error")
}

async fn run_auditor(mut settings: Settings, args: AuditorArgs) -> anyhow::Result<()> {
    apply_auditor_args(&mut settings.auditor, &args);
    settings
        .auditor
        .validate()
        .context("invalid auditor configuration")?;
    if !settings.auditor.spool_dir.is_dir() {
        anyhow::bail!(
            "spool directory {} does not exist",
            settings.auditor.spool_dir.display()
        );
    }

    let catalog = Arc::new(
        PgCatalog::connect(&settings.database)
            .await
            .context("cannot connect to the catalog")?,
    );
    catalog.initialize_schema().await?;
    let dumps = Arc::new(FsDumpProvider::new(&settings.auditor));

    let daemon = Auditor::new(
        settings.auditor,
        catalog.clone(),
        catalog.clone(),
        catalog,
        dumps,
    )
    .context("invalid RSE selection expression")?;
    let ctx = DaemonContext::default();
    spawn_signal_listener(&ctx);
    run_daemon(&daemon, &ctx)
        .await
        .context("auditor terminated with an error")
}

fn apply_necromancer_args(config: &mut NecromancerConfig, args: &NecromancerArgs) {
    apply_shared_args(
        &mut config.threads,
        &mut config.bulk,
        &mut config.sleep_time_secs,
        &mut config.run_once,
        &args.shared,
    );
    if let Some(hours) = args.recovering_timeout {
        config.recovering_timeout_hours = hours;
    }
    if let Some(max_backlog) = args.max_backlog {
        config.max_backlog = max_backlog;
    }
}

fn apply_auditor_args(config: &mut AuditorConfig, args: &AuditorArgs) {
    apply_shared_args(
        &mut config.threads,
        &mut config.bulk,
        &mut config.sleep_time_secs,
        &mut config.run_once,
        &args.shared,
    );
    if let Some(rses) = &args.rses {
        config.rses = rses.clone();
    }
    if let Some(delta) = args.delta {
        config.delta_days = delta;
    }
    if let Some(date) = args.date {
        config.date = Some(date);
    }
    if args.keep_dumps {
        config.keep_dumps = true;
    }
    if args.no_declaration {
        config.no_declaration = true;
    }
}

fn apply_shared_args(
    threads: &mut usize,
    bulk: &mut usize,
    sleep_time_secs: &mut u64,
    run_once: &mut bool,
    args: &SharedArgs,
) {
    if let Some(value) = args.threads {
        *threads = value;
    }
    if let Some(value) = args.bulk {
        *bulk = value;
    }
    if let Some(value) = args.sleep_time {
        *sleep_time_secs = value;
    }
    if args.run_once {
        *run_once = true;
    }
}

/// First SIGINT or SIGTERM requests a graceful stop; further signals while
/// the daemon drains are acknowledged and ignored.
fn spawn_signal_listener(ctx: &DaemonContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("interrupt received, finishing in-flight work"),
            _ = sigterm.recv() => info!("termination requested, finishing in-flight work"),
        }
        ctx.request_shutdown();
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => debug!("shutdown already in progress"),
                _ = sigterm.recv() => debug!("shutdown already in progress"),
            }
        }
    });
}
