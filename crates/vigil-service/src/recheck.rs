//! Post-restore recheck subsystem.
//!
//! A restored file gets an immediate recheck plus three delayed ones, each
//! hash-guarded: if the content no longer matches the pre-restore hash the
//! file is quarantined outright under the synthesized rule
//! `HASH_GUARD_CHANGE`. A restored path that disappears before its recheck
//! triggers a sibling sweep over the OS duplicate-rename pattern
//! `name (N).ext`.

use crate::events::{CoreEvents, NotificationGate};
use crate::quarantine::QuarantineStore;
use crate::scanner::{ScanOutcome, Scanner};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vigil_core::exclusions::ExclusionPolicy;
use vigil_core::paths::normalize_path;
use vigil_core::signature::sha256_file;
use vigil_core::telemetry::Telemetry;

/// Rule name recorded when the hash guard fires.
pub const HASH_GUARD_RULE: &str = "HASH_GUARD_CHANGE";

/// Base delay for the second of the three delayed rechecks.
pub const POST_RESTORE_RECHECK_DELAY: Duration = Duration::from_secs(4);

const IMMEDIATE_SAMPLES: u32 = 6;
const IMMEDIATE_DELAY_START: Duration = Duration::from_millis(150);
const IMMEDIATE_DELAY_CAP: Duration = Duration::from_millis(600);

pub struct RecheckSubsystem {
    scanner: Arc<Scanner>,
    quarantine: Arc<QuarantineStore>,
    telemetry: Arc<Telemetry>,
    events: Arc<dyn CoreEvents>,
    gate: Arc<NotificationGate>,
}

impl RecheckSubsystem {
    pub fn new(
        scanner: Arc<Scanner>,
        quarantine: Arc<QuarantineStore>,
        telemetry: Arc<Telemetry>,
        events: Arc<dyn CoreEvents>,
        gate: Arc<NotificationGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scanner,
            quarantine,
            telemetry,
            events,
            gate,
        })
    }

    /// Fast safety net run inline right after a restore: a short
    /// stabilization so the copy settles, then hash guard, then a scan.
    pub async fn immediate_recheck(&self, restored: &Path, pre_hash: &str) {
        if !restored.exists() {
            if !self.sibling_sweep(restored, pre_hash) {
                self.telemetry.incr("recheck_immediate_missing_post_restore");
            }
            return;
        }

        let mut last_size: i64 = -1;
        let mut delay = IMMEDIATE_DELAY_START;
        for _ in 0..IMMEDIATE_SAMPLES {
            let size = std::fs::metadata(restored)
                .map(|m| m.len() as i64)
                .unwrap_or(-1);
            if size == last_size && size > 0 {
                break;
            }
            last_size = size;
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(1.6).min(IMMEDIATE_DELAY_CAP);
        }

        if self.hash_guard(restored, pre_hash) {
            return;
        }
        match self.scanner.scan_file(restored, ExclusionPolicy::Normal) {
            ScanOutcome::Match { rule, .. } => {
                self.telemetry.incr("recheck_immediate_match_post_restore");
                self.notify_quarantined(restored, &rule);
            }
            ScanOutcome::YaraError | ScanOutcome::Error | ScanOutcome::QuarantineFailed { .. } => {
                self.telemetry.incr("recheck_immediate_error_post_restore");
            }
            _ => {
                self.telemetry.incr("recheck_immediate_clean_post_restore");
            }
        }
    }

    /// Schedule the delayed rechecks: +1 s, +delay, and +max(2·delay+2, 10) s
    /// to catch slow writers and second-stage drops.
    pub fn schedule_delayed(self: &Arc<Self>, path: PathBuf, pre_hash: String) {
        let base = POST_RESTORE_RECHECK_DELAY.as_secs();
        let delays = [
            Duration::from_secs(1),
            POST_RESTORE_RECHECK_DELAY,
            Duration::from_secs((base * 2 + 2).max(10)),
        ];
        for delay in delays {
            let recheck = self.clone();
            let path = path.clone();
            let pre_hash = pre_hash.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                recheck.delayed_recheck(&path, &pre_hash).await;
            });
            self.telemetry.incr("recheck_scheduled_post_restore");
        }
    }

    pub async fn delayed_recheck(&self, path: &Path, pre_hash: &str) {
        if !path.exists() {
            if !self.sibling_sweep(path, pre_hash) {
                self.telemetry.incr("recheck_delayed_missing_post_restore");
            }
            return;
        }
        if self.hash_guard(path, pre_hash) {
            return;
        }
        match self.scanner.scan_file(path, ExclusionPolicy::Normal) {
            ScanOutcome::Match { rule, .. } => {
                self.telemetry.incr("recheck_delayed_match_post_restore");
                self.notify_quarantined(path, &rule);
            }
            ScanOutcome::YaraError | ScanOutcome::Error | ScanOutcome::QuarantineFailed { .. } => {
                self.telemetry.incr("recheck_delayed_error_post_restore");
            }
            _ => {
                self.telemetry.incr("recheck_delayed_clean_post_restore");
            }
        }
    }

    /// Quarantine on content flip. True if the file was quarantined.
    fn hash_guard(&self, path: &Path, pre_hash: &str) -> bool {
        if pre_hash.is_empty() {
            return false;
        }
        let Ok(now_hash) = sha256_file(path) else {
            // Unreadable right now; the scan attempt will surface it.
            return false;
        };
        if now_hash == pre_hash {
            return false;
        }
        match self
            .quarantine
            .quarantine(path, &[HASH_GUARD_RULE.to_string()])
        {
            Ok(_) => {
                warn!(path = %path.display(), "hash guard quarantined content flip");
                self.telemetry.incr("hash_guard_quarantined_on_change");
                self.notify_quarantined(path, HASH_GUARD_RULE);
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "hash guard quarantine failed");
                self.telemetry.incr("hash_guard_error");
                false
            }
        }
    }

    /// Scan duplicate-renamed siblings (`name (N).ext`) of a vanished
    /// restore target. True if any sibling was quarantined.
    fn sibling_sweep(&self, target: &Path, pre_hash: &str) -> bool {
        let Some(dir) = target.parent() else {
            return false;
        };
        if !dir.is_dir() {
            return false;
        }
        let base = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (stem, ext) = match base.rfind('.') {
            Some(i) => (&base[..i], &base[i..]),
            None => (base.as_str(), ""),
        };
        let pattern = match Regex::new(&format!(
            r"(?i)^{}( \(\d+\))?{}$",
            regex::escape(stem),
            regex::escape(ext)
        )) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "sibling sweep pattern failed");
                self.telemetry
                    .incr("recheck_sibling_sweep_error_post_restore");
                return false;
            }
        };

        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        let mut any_scanned = false;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !pattern.is_match(&name) {
                continue;
            }
            let sibling = entry.path();
            if !sibling.is_file() {
                continue;
            }
            any_scanned = true;
            debug!(sibling = %sibling.display(), "sibling sweep candidate");
            if self.hash_guard(&sibling, pre_hash) {
                return true;
            }
            match self.scanner.scan_file(&sibling, ExclusionPolicy::Normal) {
                ScanOutcome::Match { rule, .. } => {
                    self.telemetry
                        .incr("recheck_sibling_sweep_match_post_restore");
                    self.notify_quarantined(&sibling, &rule);
                    return true;
                }
                ScanOutcome::YaraError | ScanOutcome::Error => {
                    self.telemetry
                        .incr("recheck_sibling_sweep_error_post_restore");
                }
                _ => {}
            }
        }
        if any_scanned {
            self.telemetry
                .incr("recheck_sibling_sweep_clean_post_restore");
        }
        false
    }

    fn notify_quarantined(&self, path: &Path, rule: &str) {
        self.events
            .on_quarantine(path, std::slice::from_ref(&rule.to_string()));
        if self.gate.first_time(&normalize_path(path)) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            self.events
                .on_notification("Threat quarantined", &format!("Rule: {rule}\nFile: {name}"));
        }
    }
}
