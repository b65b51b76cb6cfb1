//! Real-time capture pipeline: debounces watcher events, waits for each
//! candidate file to stabilize, follows browser partial-download renames,
//! and hands stabilized files to the vault.
//!
//! Work is concurrent across distinct paths (one short-lived task per
//! candidate); per-path serialization comes from the debounce map. The last
//! stable observation of a path wins.

use crate::events::{CoreEvents, NotificationGate};
use crate::processor::VaultJob;
use crate::scanner::{ScanOutcome, Scanner};
use crate::vault::{CaptureEvent, CaptureOutcome, ScanVault};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vigil_core::exclusions::{ExclusionOracle, ExclusionPolicy, ExclusionReason};
use vigil_core::paths::{extension_of, normalize_path};
use vigil_core::telemetry::Telemetry;

pub const STABILIZE_MAX_WAIT: Duration = Duration::from_secs(30);
pub const STABILIZE_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
pub const STABLE_SAMPLES_REQUIRED: u32 = 4;
pub const SETTLE_MARGIN: Duration = Duration::from_millis(200);
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Suffixes browsers and download managers use for in-flight files.
pub const PARTIAL_DOWNLOAD_EXTS: &[&str] =
    &[".crdownload", ".part", ".partial", ".download", ".tmp"];

/// How recent a same-stem sibling must be for the heuristic rename follow.
const HEURISTIC_RECENCY: Duration = Duration::from_secs(5);

pub struct CapturePipeline {
    oracle: Arc<ExclusionOracle>,
    vault: Arc<ScanVault>,
    scanner: Arc<Scanner>,
    telemetry: Arc<Telemetry>,
    events: Arc<dyn CoreEvents>,
    gate: Arc<NotificationGate>,
    job_tx: mpsc::Sender<VaultJob>,
    recent: Mutex<HashMap<String, Instant>>,
    pending: Mutex<BTreeSet<PathBuf>>,
    monitoring_active: AtomicBool,
    /// Same-stem sibling fallback can misattribute files in busy
    /// directories, so it ships disabled; exact suffix-strip always runs.
    follow_heuristic: bool,
}

impl CapturePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oracle: Arc<ExclusionOracle>,
        vault: Arc<ScanVault>,
        scanner: Arc<Scanner>,
        telemetry: Arc<Telemetry>,
        events: Arc<dyn CoreEvents>,
        gate: Arc<NotificationGate>,
        job_tx: mpsc::Sender<VaultJob>,
        follow_heuristic: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            oracle,
            vault,
            scanner,
            telemetry,
            events,
            gate,
            job_tx,
            recent: Mutex::new(HashMap::new()),
            pending: Mutex::new(BTreeSet::new()),
            monitoring_active: AtomicBool::new(false),
            follow_heuristic,
        })
    }

    pub fn set_monitoring_active(&self, active: bool) {
        self.monitoring_active.store(active, Ordering::Relaxed);
    }

    /// Dispatcher: reads candidate paths and spawns a stabilization task per
    /// candidate.
    pub fn spawn(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    candidate = rx.recv() => {
                        match candidate {
                            Some(path) => {
                                let p = pipeline.clone();
                                tokio::spawn(async move { p.handle_candidate(path).await });
                            }
                            None => {
                                debug!("candidate channel closed, capture dispatcher exiting");
                                return;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    pub async fn handle_candidate(self: Arc<Self>, path: PathBuf) {
        let mut tracked = path;
        let norm = normalize_path(&tracked);

        // Directory-shaped events never stabilize into anything scannable.
        if extension_of(&tracked).is_empty() && !tracked.is_file() {
            return;
        }

        let (excluded, reason) = self.oracle.classify(&tracked);
        if excluded
            && matches!(
                reason,
                ExclusionReason::Internal | ExclusionReason::RecycleBin
            )
        {
            self.touch_recent(&norm);
            return;
        }

        if self.seen_recently(&norm) {
            return;
        }

        let mut rename_followed = false;
        let stabilized = self.stabilize(&mut tracked, &mut rename_followed).await;
        if !stabilized {
            info!(path = %tracked.display(), "skipping early capture (unstable download)");
            self.touch_recent(&normalize_path(&tracked));
            return;
        }

        tokio::time::sleep(SETTLE_MARGIN).await;

        let event = if rename_followed {
            CaptureEvent::DownloadFinalized
        } else {
            CaptureEvent::Created
        };
        match self.vault.capture(&tracked, event) {
            Ok(CaptureOutcome::Captured {
                vaulted_path,
                meta_path,
            }) => {
                self.events.on_vault_capture(&vaulted_path, &meta_path);
                if self
                    .job_tx
                    .send(VaultJob {
                        vaulted_path,
                        meta_path,
                    })
                    .await
                    .is_err()
                {
                    warn!("vault processor queue closed, entry left pending");
                }
            }
            Ok(CaptureOutcome::DuplicateSuppressed) => {}
            Ok(CaptureOutcome::SkippedByInstallMode) => {
                debug!(path = %tracked.display(), "capture skipped by installation mode");
            }
            Err(e) => {
                warn!(path = %tracked.display(), error = %e, "vault capture failed");
                if self.monitoring_active.load(Ordering::Relaxed) {
                    let outcome = self.scanner.scan_file(&tracked, ExclusionPolicy::Normal);
                    if let ScanOutcome::Match { rule, .. } = outcome {
                        self.events.on_quarantine(&tracked, std::slice::from_ref(&rule));
                        if self.gate.first_time(&normalize_path(&tracked)) {
                            self.events.on_notification(
                                "Threat quarantined",
                                &format!("Rule: {rule}\nFile: {}", basename(&tracked)),
                            );
                        }
                    }
                } else {
                    info!(path = %tracked.display(), "queued for future scan");
                    self.pending.lock().insert(tracked.clone());
                }
            }
        }

        self.touch_recent(&normalize_path(&tracked));
    }

    /// Re-run candidates remembered while monitoring was inactive.
    pub async fn process_pending(self: &Arc<Self>) {
        let paths: Vec<PathBuf> = std::mem::take(&mut *self.pending.lock())
            .into_iter()
            .collect();
        for path in paths {
            if path.exists() {
                self.clone().handle_candidate(path).await;
            }
        }
    }

    // ── stabilization ───────────────────────────────────────────────────

    /// Wait until size and mtime stop changing and the file opens for read.
    /// Tracks renames of partial downloads to their final name. Returns
    /// false when the 30 s ceiling elapses.
    async fn stabilize(&self, tracked: &mut PathBuf, rename_followed: &mut bool) -> bool {
        let mut waited = Duration::ZERO;
        let mut stable: u32 = 0;
        let mut last_size: i64 = -1;
        let mut last_mtime: i64 = -1;

        while waited < STABILIZE_MAX_WAIT {
            if !tracked.exists() {
                if let Some(next) = self.follow_rename(tracked, rename_followed) {
                    *tracked = next;
                    stable = 0;
                    last_size = -1;
                    last_mtime = -1;
                    continue;
                }
                // Grace period: the writer may still be mid-rename.
                tokio::time::sleep(STABILIZE_SAMPLE_INTERVAL).await;
                waited += STABILIZE_SAMPLE_INTERVAL;
                continue;
            }

            let (size, mtime) = match std::fs::metadata(&*tracked) {
                Ok(meta) => {
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(-1);
                    (meta.len() as i64, mtime)
                }
                Err(_) => (-1, -1),
            };

            if has_partial_suffix(tracked) {
                stable = 0;
            } else if size == last_size && mtime == last_mtime && size > 0 {
                stable += 1;
            } else {
                stable = 0;
            }
            last_size = size;
            last_mtime = mtime;

            if size > 0 && std::fs::File::open(&*tracked).is_err() {
                stable = 0;
            }

            if stable >= STABLE_SAMPLES_REQUIRED {
                return true;
            }
            tokio::time::sleep(STABILIZE_SAMPLE_INTERVAL).await;
            waited += STABILIZE_SAMPLE_INTERVAL;
        }
        false
    }

    /// A partial-download file disappeared: locate its final name. The exact
    /// suffix strip runs first; the same-stem recency heuristic only when
    /// enabled.
    fn follow_rename(&self, current: &Path, rename_followed: &mut bool) -> Option<PathBuf> {
        let current_str = current.to_string_lossy();
        let lower = current_str.to_lowercase();
        for ext in PARTIAL_DOWNLOAD_EXTS {
            if lower.ends_with(ext) {
                let base = PathBuf::from(&current_str[..current_str.len() - ext.len()]);
                if base.exists() {
                    debug!(from = %current.display(), to = %base.display(), "rename follow");
                    self.telemetry.incr("rename_follow_hit");
                    *rename_followed = true;
                    return Some(base);
                }
            }
        }

        if !self.follow_heuristic {
            return None;
        }
        let dir = current.parent()?;
        let stem = current
            .file_name()?
            .to_string_lossy()
            .split('.')
            .next()?
            .to_string();
        let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir).ok()?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&stem) || has_partial_suffix(&entry.path()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if modified.elapsed().map(|e| e < HEURISTIC_RECENCY).unwrap_or(false) {
                candidates.push((modified, entry.path()));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        let (_, next) = candidates.into_iter().next()?;
        debug!(from = %current.display(), to = %next.display(), "rename follow (heuristic)");
        self.telemetry.incr("rename_follow_hit");
        *rename_followed = true;
        Some(next)
    }

    // ── debounce ────────────────────────────────────────────────────────

    fn seen_recently(&self, norm: &str) -> bool {
        self.recent
            .lock()
            .get(norm)
            .map(|t| t.elapsed() < DEBOUNCE_WINDOW)
            .unwrap_or(false)
    }

    fn touch_recent(&self, norm: &str) {
        self.recent.lock().insert(norm.to_string(), Instant::now());
    }
}

pub(crate) fn has_partial_suffix(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    PARTIAL_DOWNLOAD_EXTS.iter().any(|ext| name.ends_with(ext))
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_suffix_detection() {
        assert!(has_partial_suffix(Path::new("/d/setup.exe.crdownload")));
        assert!(has_partial_suffix(Path::new("/d/video.PART")));
        assert!(!has_partial_suffix(Path::new("/d/setup.exe")));
    }
}
