//! Vault processor: a bounded worker pool that scans vaulted files and
//! routes each to its fate — quarantine on match, restore to the original
//! location when clean, or left in the vault for manual review on engine
//! errors.
//!
//! A semaphore of the pool size caps concurrent rule matches. Terminal
//! routing always archives the pending sidecar into `scanvault/history/`
//! before the payload leaves the vault directory.

use crate::events::{CoreEvents, NotificationGate};
use crate::fsutil::move_with_retries;
use crate::recheck::RecheckSubsystem;
use crate::scanner::{ScanOutcome, Scanner};
use crate::vault::ScanVault;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};
use vigil_core::exclusions::ExclusionPolicy;
use vigil_core::paths::normalize_path;
use vigil_core::signature::sha256_file;
use vigil_core::telemetry::Telemetry;

pub const DEFAULT_WORKERS: usize = 6;
pub const QUEUE_CAPACITY: usize = 1024;
/// Grace period for in-flight workers during shutdown.
pub const DRAIN_GRACE: Duration = Duration::from_secs(30);
/// Delay before the post-copy sweep of an installer-mode capture.
pub const INSTALLER_SWEEP_DELAY: Duration = Duration::from_secs(60);

const RESTORE_MOVE_ATTEMPTS: u32 = 3;
const RESTORE_MOVE_BACKOFF: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct VaultJob {
    pub vaulted_path: PathBuf,
    pub meta_path: PathBuf,
}

pub struct VaultProcessor {
    vault: Arc<ScanVault>,
    scanner: Arc<Scanner>,
    recheck: Arc<RecheckSubsystem>,
    telemetry: Arc<Telemetry>,
    events: Arc<dyn CoreEvents>,
    gate: Arc<NotificationGate>,
    workers: usize,
    worker_sem: Arc<Semaphore>,
    scan_sem: Arc<Semaphore>,
}

impl VaultProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vault: Arc<ScanVault>,
        scanner: Arc<Scanner>,
        recheck: Arc<RecheckSubsystem>,
        telemetry: Arc<Telemetry>,
        events: Arc<dyn CoreEvents>,
        gate: Arc<NotificationGate>,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            vault,
            scanner,
            recheck,
            telemetry,
            events,
            gate,
            workers,
            worker_sem: Arc::new(Semaphore::new(workers)),
            scan_sem: Arc::new(Semaphore::new(workers)),
        })
    }

    /// Start the dispatcher. Returns the job queue sender and the task
    /// handle; the handle resolves once the queue is drained after shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Sender<VaultJob>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<VaultJob>(QUEUE_CAPACITY);
        let processor = self.clone();
        let handle = tokio::spawn(async move {
            info!(workers = processor.workers, "vault processor started");
            loop {
                tokio::select! {
                    job = rx.recv() => {
                        match job {
                            Some(job) => {
                                let Ok(permit) =
                                    processor.worker_sem.clone().acquire_owned().await
                                else {
                                    return;
                                };
                                let p = processor.clone();
                                tokio::spawn(async move {
                                    p.process_entry(job).await;
                                    drop(permit);
                                });
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            // Wait for in-flight workers to finish their current file.
            let drained = tokio::time::timeout(
                DRAIN_GRACE,
                processor
                    .worker_sem
                    .clone()
                    .acquire_many_owned(processor.workers as u32),
            )
            .await;
            if drained.is_err() {
                warn!("vault processor drain grace elapsed with workers still busy");
            }
            info!("vault processor stopped");
        });
        (tx, handle)
    }

    pub async fn process_entry(self: Arc<Self>, job: VaultJob) {
        let meta = match ScanVault::load_meta(&job.meta_path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(meta = %job.meta_path.display(), error = %e, "cannot read vault sidecar");
                return;
            }
        };
        if !job.vaulted_path.exists() {
            warn!(path = %job.vaulted_path.display(), "vault payload missing");
            return;
        }
        let original = PathBuf::from(&meta.original_path);
        self.telemetry.incr("vault_entry_processed");

        debug!(path = %job.vaulted_path.display(), "scanning vaulted file");
        let outcome = {
            let _permit = self.scan_sem.acquire().await.ok();
            self.scanner
                .scan_file(&job.vaulted_path, ExclusionPolicy::ForceVault)
        };

        match outcome {
            ScanOutcome::Match {
                rule,
                quarantined_path,
                ..
            } => {
                self.vault
                    .archive_quarantined(&job.meta_path, &quarantined_path, &rule, false);
                info!(original = %original.display(), %rule, "threat quarantined from vault");
                self.notify_threat(&original, &rule);
            }
            ScanOutcome::Clean | ScanOutcome::SkippedInternal | ScanOutcome::SkippedTemp => {
                self.restore_clean(&job, &original).await;
            }
            other => {
                warn!(
                    path = %job.vaulted_path.display(),
                    outcome = ?other,
                    "scan did not complete, leaving file in vault for manual review"
                );
            }
        }

        if meta.installer_mode {
            self.spawn_installer_sweep(original);
        }
    }

    /// Clean path: hash, recheck once more right before restore to close the
    /// race window, then move the payload back to its origin and hand the
    /// restored path to the recheck subsystem.
    async fn restore_clean(self: &Arc<Self>, job: &VaultJob, original: &Path) {
        let pre_hash = match sha256_file(&job.vaulted_path) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = %job.vaulted_path.display(), error = %e, "cannot hash vaulted file, leaving in vault");
                return;
            }
        };

        let recheck_outcome = {
            let _permit = self.scan_sem.acquire().await.ok();
            self.scanner
                .scan_file(&job.vaulted_path, ExclusionPolicy::ForceVault)
        };
        if let ScanOutcome::Match {
            rule,
            quarantined_path,
            ..
        } = recheck_outcome
        {
            self.vault
                .archive_quarantined(&job.meta_path, &quarantined_path, &rule, true);
            info!(original = %original.display(), %rule, "pre-restore recheck caught threat");
            self.notify_threat(original, &rule);
            return;
        }

        if let Some(parent) = original.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %e, "cannot create restore directory");
                return;
            }
        }
        if let Err(e) = move_with_retries(
            &job.vaulted_path,
            original,
            RESTORE_MOVE_ATTEMPTS,
            RESTORE_MOVE_BACKOFF,
            RESTORE_MOVE_BACKOFF,
            1.0,
        ) {
            warn!(
                from = %job.vaulted_path.display(),
                to = %original.display(),
                error = ?e,
                "restore move failed, leaving file in vault"
            );
            return;
        }
        let restored = original.to_path_buf();

        self.vault
            .archive_restored(&job.meta_path, &restored, &pre_hash);
        info!(path = %restored.display(), "clean file restored");
        self.events.on_restore(&restored);
        if self.gate.first_time(&normalize_path(&restored)) {
            self.events.on_notification(
                "File restored",
                &format!("Clean file returned\nFile: {}", basename(&restored)),
            );
        }

        self.recheck.immediate_recheck(&restored, &pre_hash).await;
        self.recheck
            .schedule_delayed(restored, pre_hash);
    }

    /// Installers can lay down additional payloads after the captured copy;
    /// re-scan the original path once, 60 s later. Scope is deliberately
    /// limited to the captured path.
    fn spawn_installer_sweep(self: &Arc<Self>, original: PathBuf) {
        let processor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INSTALLER_SWEEP_DELAY).await;
            if !original.is_file() {
                return;
            }
            debug!(path = %original.display(), "installer-mode delayed sweep");
            let outcome = {
                let _permit = processor.scan_sem.acquire().await.ok();
                processor
                    .scanner
                    .scan_file(&original, ExclusionPolicy::Normal)
            };
            if let ScanOutcome::Match { rule, .. } = outcome {
                info!(path = %original.display(), %rule, "installer sweep caught threat");
                processor.notify_threat(&original, &rule);
            }
        });
    }

    fn notify_threat(&self, original: &Path, rule: &str) {
        self.events
            .on_quarantine(original, std::slice::from_ref(&rule.to_string()));
        if self.gate.first_time(&normalize_path(original)) {
            self.events.on_notification(
                "Threat quarantined",
                &format!("Rule: {rule}\nFile: {}", basename(original)),
            );
        }
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
