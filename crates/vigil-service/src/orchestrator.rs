//! Orchestrator: wires every component, owns lifecycles, and runs the
//! startup/shutdown orders.
//!
//! Startup: user exclusions → rules → vault processor (with startup
//! reconciliation and re-enqueue of pending entries) → watcher + capture
//! pipeline → scheduler → installation-mode watchdog. Shutdown reverses the
//! order and drains the vault queue with a bounded grace.

use crate::capture::CapturePipeline;
use crate::events::{CoreEvents, NotificationGate};
use crate::processor::{VaultJob, VaultProcessor, DEFAULT_WORKERS, DRAIN_GRACE};
use crate::quarantine::QuarantineStore;
use crate::recheck::RecheckSubsystem;
use crate::rules::RuleEngine;
use crate::scanner::Scanner;
use crate::scheduler::ScheduledScanner;
use crate::vault::ScanVault;
use crate::watcher::{default_watch_roots, spawn_pipe_reader, FileWatcher};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use vigil_core::exclusions::ExclusionOracle;
use vigil_core::install_mode::InstallationMode;
use vigil_core::paths::AppLayout;
use vigil_core::signature::SIGNATURE_TTL;
use vigil_core::telemetry::Telemetry;
use vigil_core::user_exclusions::UserExclusions;

const INSTALL_MODE_WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

pub struct OrchestratorConfig {
    pub data_root: PathBuf,
    /// Roots to watch; empty means the platform defaults.
    pub watch_roots: Vec<PathBuf>,
    /// Optional out-of-process change source.
    pub watcher_helper: Option<PathBuf>,
    /// Extra argv for the helper (exclude prefixes).
    pub watcher_excludes: Vec<String>,
    pub ui_enabled: bool,
    /// Enable the same-stem rename-follow fallback.
    pub follow_heuristic: bool,
    pub workers: usize,
    pub signature_ttl: Duration,
}

impl OrchestratorConfig {
    pub fn new(data_root: PathBuf) -> Self {
        Self {
            data_root,
            watch_roots: Vec::new(),
            watcher_helper: None,
            watcher_excludes: Vec::new(),
            ui_enabled: true,
            follow_heuristic: false,
            workers: DEFAULT_WORKERS,
            signature_ttl: SIGNATURE_TTL,
        }
    }
}

pub struct Orchestrator {
    layout: AppLayout,
    telemetry: Arc<Telemetry>,
    user_exclusions: Arc<UserExclusions>,
    install_mode: Arc<InstallationMode>,
    quarantine: Arc<QuarantineStore>,
    vault: Arc<ScanVault>,
    scanner: Arc<Scanner>,
    recheck: Arc<RecheckSubsystem>,
    pipeline: Arc<CapturePipeline>,
    scheduler: Arc<ScheduledScanner>,
    job_tx: mpsc::Sender<VaultJob>,
    // Dropped on shutdown; the notify watcher stops when this does.
    watcher: Option<FileWatcher>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    processor_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    ui_enabled: bool,
}

impl Orchestrator {
    pub async fn start(config: OrchestratorConfig, events: Arc<dyn CoreEvents>) -> Result<Self> {
        let layout = AppLayout::new(config.data_root.clone());
        layout.ensure()?;

        let telemetry = Arc::new(Telemetry::new());
        let user_exclusions = Arc::new(UserExclusions::load(layout.user_exclusions_path()));
        let install_mode = Arc::new(InstallationMode::new());
        let oracle = Arc::new(ExclusionOracle::new(&layout, user_exclusions.clone()));

        let engine = Arc::new(RuleEngine::compile(&layout.rules_dir()));
        if !engine.is_loaded() {
            warn!("no rules loaded; every scan will report NoRules until rules are installed");
        }

        let quarantine = Arc::new(QuarantineStore::new(layout.quarantine_dir()));
        let vault = Arc::new(ScanVault::new(
            &layout,
            install_mode.clone(),
            telemetry.clone(),
            config.signature_ttl,
        ));
        let scanner = Arc::new(Scanner::new(
            engine,
            quarantine.clone(),
            oracle.clone(),
            telemetry.clone(),
        ));
        let gate = Arc::new(NotificationGate::new());
        let recheck = RecheckSubsystem::new(
            scanner.clone(),
            quarantine.clone(),
            telemetry.clone(),
            events.clone(),
            gate.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Vault processor first: the capture pipeline needs its queue.
        let processor = VaultProcessor::new(
            vault.clone(),
            scanner.clone(),
            recheck.clone(),
            telemetry.clone(),
            events.clone(),
            gate.clone(),
            config.workers,
        );
        let (job_tx, processor_handle) = processor.spawn(shutdown_rx.clone());

        // Reconcile orphans, then requeue entries left pending by a previous
        // run.
        vault.reconcile_startup();
        for (vaulted_path, meta_path) in vault.pending_entries() {
            info!(path = %vaulted_path.display(), "requeueing pending vault entry");
            let _ = job_tx
                .send(VaultJob {
                    vaulted_path,
                    meta_path,
                })
                .await;
        }

        let pipeline = CapturePipeline::new(
            oracle.clone(),
            vault.clone(),
            scanner.clone(),
            telemetry.clone(),
            events.clone(),
            gate,
            job_tx.clone(),
            config.follow_heuristic,
        );

        let mut handles = Vec::new();
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        handles.push(pipeline.spawn(candidate_rx, shutdown_rx.clone()));

        let mut watcher = match FileWatcher::new(candidate_tx.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "failed to start file watcher");
                None
            }
        };
        if let Some(w) = watcher.as_mut() {
            let roots = if config.watch_roots.is_empty() {
                default_watch_roots()
            } else {
                config.watch_roots.clone()
            };
            if let Err(e) = w.watch_roots(&roots) {
                warn!(error = %e, "failed to watch roots");
            }
        }
        if let Some(helper) = config.watcher_helper.clone() {
            handles.push(spawn_pipe_reader(
                helper,
                config.watcher_excludes.clone(),
                candidate_tx,
                shutdown_rx.clone(),
            ));
        }

        let scheduler = ScheduledScanner::new(
            layout.schedule_path(),
            scanner.clone(),
            oracle,
            events.clone(),
            telemetry.clone(),
        );
        handles.push(scheduler.spawn(shutdown_rx.clone()));

        // Installation-mode watchdog.
        {
            let mode = install_mode.clone();
            let mut shutdown = shutdown_rx;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(INSTALL_MODE_WATCHDOG_INTERVAL) => {
                            mode.expire_if_due();
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        pipeline.set_monitoring_active(true);
        pipeline.process_pending().await;

        info!("service started – all subsystems online");
        Ok(Self {
            layout,
            telemetry,
            user_exclusions,
            install_mode,
            quarantine,
            vault,
            scanner,
            recheck,
            pipeline,
            scheduler,
            job_tx,
            watcher,
            handles,
            processor_handle,
            shutdown_tx,
            ui_enabled: config.ui_enabled,
        })
    }

    /// Reverse-order shutdown: stop producers, drain the vault queue with a
    /// bounded grace, then snapshot telemetry.
    pub async fn shutdown(mut self) {
        info!("service stopping");
        let _ = self.shutdown_tx.send(true);
        self.pipeline.set_monitoring_active(false);

        // Stops the notify event source.
        drop(self.watcher.take());
        for handle in self.handles.drain(..) {
            handle.abort();
        }

        drop(self.job_tx);
        if tokio::time::timeout(DRAIN_GRACE + Duration::from_secs(5), &mut self.processor_handle)
            .await
            .is_err()
        {
            warn!("vault processor did not drain in time");
            self.processor_handle.abort();
        }

        self.telemetry.log_snapshot();
        info!("service stopped");
    }

    // ── surface for the CLI / UI ────────────────────────────────────────

    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    pub fn ui_enabled(&self) -> bool {
        self.ui_enabled
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn user_exclusions(&self) -> &Arc<UserExclusions> {
        &self.user_exclusions
    }

    pub fn install_mode(&self) -> &Arc<InstallationMode> {
        &self.install_mode
    }

    pub fn quarantine(&self) -> &Arc<QuarantineStore> {
        &self.quarantine
    }

    pub fn vault(&self) -> &Arc<ScanVault> {
        &self.vault
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    /// Fire the scheduled scan immediately, bypassing due-time evaluation.
    pub fn run_scheduled_now(&self) {
        self.scheduler.run_now();
    }

    /// User-initiated restore of a quarantined file back to its original
    /// location, guarded by the usual post-restore rechecks.
    pub async fn restore_from_quarantine(&self, quarantined: &std::path::Path) -> Result<PathBuf> {
        let restored = self.quarantine.restore(quarantined)?;
        let pre_hash = vigil_core::signature::sha256_file(&restored).unwrap_or_default();
        self.recheck.immediate_recheck(&restored, &pre_hash).await;
        self.recheck
            .schedule_delayed(restored.clone(), pre_hash);
        self.telemetry.incr("quarantine_restored");
        Ok(restored)
    }
}
