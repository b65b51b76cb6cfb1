use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_core::exclusions::ExclusionOracle;
use vigil_core::paths::AppLayout;
use vigil_core::schedule::load_schedule;
use vigil_core::telemetry::Telemetry;
use vigil_core::user_exclusions::UserExclusions;
use vigil_service::events::{ChannelEvents, CoreEvents, NullEvents, UiEvent};
use vigil_service::orchestrator::{Orchestrator, OrchestratorConfig};
use vigil_service::quarantine::QuarantineStore;
use vigil_service::rules::RuleEngine;
use vigil_service::scanner::Scanner;
use vigil_service::scheduler::ScheduledScanner;

#[derive(Parser, Debug)]
#[command(author, version, about = "Vigil endpoint protection service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the background protection service
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// No UI surface; events go to the log only
        #[arg(long)]
        silent: bool,
        /// Start minimized to the tray
        #[arg(long)]
        tray: bool,
        /// Extra root to watch (repeatable); defaults to user folders
        #[arg(long = "watch")]
        watch: Vec<PathBuf>,
        /// Out-of-process watcher helper emitting JSON path records
        #[arg(long)]
        watcher_helper: Option<PathBuf>,
    },
    /// Fire the configured scheduled scan once and exit
    ScanNow {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            data_dir,
            silent,
            tray,
            watch,
            watcher_helper,
        } => run_command(data_dir, silent, tray, watch, watcher_helper).await,
        Commands::ScanNow { data_dir } => scan_now_command(data_dir).await,
    }
}

async fn run_command(
    data_dir: Option<PathBuf>,
    silent: bool,
    tray: bool,
    watch: Vec<PathBuf>,
    watcher_helper: Option<PathBuf>,
) -> Result<()> {
    let data_root = match data_dir {
        Some(dir) => dir,
        None => AppLayout::default_root()?,
    };
    let mut config = OrchestratorConfig::new(data_root);
    config.watch_roots = watch;
    config.watcher_helper = watcher_helper;
    config.ui_enabled = !silent;
    if tray {
        info!("starting minimized to tray");
    }

    let events: Arc<dyn CoreEvents> = if silent {
        Arc::new(NullEvents)
    } else {
        // Stand-in UI thread: drain the event channel into the log.
        let (events, mut rx) = ChannelEvents::new();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    UiEvent::Notification { title, body } => {
                        info!(%title, %body, "notification")
                    }
                    other => info!(event = ?other, "ui event"),
                }
            }
        });
        Arc::new(events)
    };

    let orchestrator = Orchestrator::start(config, events).await?;
    signal::ctrl_c().await?;
    orchestrator.shutdown().await;
    Ok(())
}

async fn scan_now_command(data_dir: Option<PathBuf>) -> Result<()> {
    let data_root = match data_dir {
        Some(dir) => dir,
        None => AppLayout::default_root()?,
    };
    let layout = AppLayout::new(data_root);
    layout.ensure()?;

    let cfg = load_schedule(&layout.schedule_path());
    if cfg.paths.is_empty() {
        anyhow::bail!("no scan paths configured in {}", layout.schedule_path().display());
    }

    let telemetry = Arc::new(Telemetry::new());
    let user_exclusions = Arc::new(UserExclusions::load(layout.user_exclusions_path()));
    let oracle = Arc::new(ExclusionOracle::new(&layout, user_exclusions));
    let scanner = Arc::new(Scanner::new(
        Arc::new(RuleEngine::compile(&layout.rules_dir())),
        Arc::new(QuarantineStore::new(layout.quarantine_dir())),
        oracle.clone(),
        telemetry.clone(),
    ));
    let events: Arc<dyn CoreEvents> = Arc::new(NullEvents);
    let scheduler = ScheduledScanner::new(
        layout.schedule_path(),
        scanner,
        oracle,
        events,
        telemetry.clone(),
    );

    let summary = scheduler.run_scan_job(&cfg).await;
    info!(
        total_files = summary.total_files,
        matches = summary.matches,
        "scan-now finished"
    );
    telemetry.log_snapshot();
    Ok(())
}
