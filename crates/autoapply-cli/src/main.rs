use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use autoapply_engine::report::render_audit;
use autoapply_engine::{EngineConfig, Orchestrator};
use autoapply_storage::{FinalReport, FingerprintStore, StatsStore};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "autoapply")]
#[command(about = "Continuous job application engine")]
struct Cli {
    /// Config file; defaults to $AUTOAPPLY_CONFIG, then config/continuous.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Cycle until SIGINT/SIGTERM.
    Run,
    /// One cycle, then the shutdown sequence.
    Once,
    /// Persisted totals, read without starting the engine.
    Status,
    /// Every application record grouped by outcome.
    Report,
    /// Validate the config and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,autoapply_engine=info,autoapply_storage=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let report = run_engine(config, false).await?;
            print_final(&report);
        }
        Commands::Once => {
            let report = run_engine(config, true).await?;
            print_final(&report);
        }
        Commands::Status => status(&config).await?,
        Commands::Report => audit(&config).await?,
        Commands::CheckConfig => {
            println!(
                "config ok: sources={:?} interval={}s min_score={} max_per_cycle={}",
                config.enabled_sources,
                config.search_interval,
                config.min_match_score,
                config.max_applications_per_cycle
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::from_env(),
    };
    config.context("loading engine configuration")
}

async fn run_engine(config: EngineConfig, once: bool) -> Result<FinalReport> {
    let shutdown = CancellationToken::new();
    let monitor_addr = config
        .monitor_addr
        .as_deref()
        .map(|addr| addr.parse::<SocketAddr>().with_context(|| format!("parsing monitor_addr {addr}")))
        .transpose()?;
    let reports_dir = config.reports_dir.clone();

    let mut engine = Orchestrator::from_config(config, shutdown.clone()).context("building engine")?;
    tokio::spawn(forward_signals(shutdown.clone()));

    let monitor = monitor_addr.map(|addr| {
        let state = autoapply_web::AppState::new(engine.subscribe(), engine.stats(), reports_dir);
        let token = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(err) = autoapply_web::serve(addr, state, token).await {
                error!(error = %err, "monitor server stopped");
            }
        })
    });

    let result = if once { engine.run_once().await } else { engine.run().await };
    shutdown.cancel();
    if let Some(handle) = monitor {
        if let Err(err) = handle.await {
            warn!(error = %err, "monitor task did not finish cleanly");
        }
    }
    result.context("engine stopped with an error")
}

async fn forward_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; listening for SIGINT only");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = shutdown.cancelled() => return,
        }
    }
    info!("shutdown requested; finishing in-flight applications");
    shutdown.cancel();
}

fn print_final(report: &FinalReport) {
    println!(
        "run complete: run_id={} cycles={} applied={} succeeded={} failed={} success_rate={:.1}%",
        report.run_id,
        report.total_cycles,
        report.totals.postings_applied,
        report.totals.successes,
        report.totals.failures,
        report.success_rate
    );
}

async fn status(config: &EngineConfig) -> Result<()> {
    let stats_dir = config.stats_dir();
    let Some(totals) = StatsStore::read_totals_file(&stats_dir)
        .await
        .with_context(|| format!("reading totals from {}", stats_dir.display()))?
    else {
        println!("no cycles recorded yet in {}", stats_dir.display());
        return Ok(());
    };
    let history = StatsStore::read_history_file(&stats_dir)
        .await
        .with_context(|| format!("reading history from {}", stats_dir.display()))?;

    let t = &totals.totals;
    println!(
        "cycles={} seen={} scored={} applied={} succeeded={} failed={} duplicates={} success_rate={:.1}% updated_at={}",
        t.cycles,
        t.postings_seen,
        t.postings_scored,
        t.postings_applied,
        t.successes,
        t.failures,
        t.duplicates_skipped,
        t.success_rate(),
        totals.updated_at.to_rfc3339()
    );
    if let Some(last) = history.last() {
        println!(
            "last cycle #{}: seen={} applied={} succeeded={} failed={} in {:.1}s",
            last.cycle_number,
            last.postings_seen,
            last.postings_applied,
            last.successes,
            last.failures,
            last.duration_secs()
        );
    }
    Ok(())
}

/// Reads the store without loading it, so a running engine's journal is never touched.
async fn audit(config: &EngineConfig) -> Result<()> {
    let dir = config.fingerprint_dir();
    let records = FingerprintStore::read_records(&dir)
        .await
        .with_context(|| format!("reading fingerprints from {}", dir.display()))?;
    print!("{}", render_audit(&records));
    Ok(())
}
