//! ScanVault store: atomically captures a live file into the staging
//! directory with a sidecar and a short-TTL dedup signature.
//!
//! Invariant: exactly one `.meta` sidecar per `.vaulted` payload while
//! pending. On terminal routing the sidecar moves to `scanvault/history/`
//! with a `final_status` field and the payload leaves the vault (to
//! quarantine or back to its origin). Sidecars are the record of what the
//! pipeline did; payload presence alone is not enough to reconstruct state.

use crate::fsutil::{move_file, move_with_retries, MoveError};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vigil_core::error::VaultError;
use vigil_core::install_mode::InstallationMode;
use vigil_core::paths::{normalize_path, AppLayout};
use vigil_core::signature::{scan_signature, sha256_hex, SignatureCache};
use vigil_core::storage::read_json;
use vigil_core::telemetry::Telemetry;

pub const CAPTURE_MOVE_ATTEMPTS: u32 = 10;
pub const CAPTURE_BACKOFF_START: Duration = Duration::from_millis(150);
pub const CAPTURE_BACKOFF_CAP: Duration = Duration::from_millis(1200);
pub const CAPTURE_BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureEvent {
    Created,
    DownloadFinalized,
    Modified,
}

impl fmt::Display for CaptureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::DownloadFinalized => "download_finalized",
            Self::Modified => "modified",
        };
        f.write_str(s)
    }
}

/// Sidecar for a pending vault entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMeta {
    pub original_path: String,
    pub vaulted_path: String,
    pub timestamp: String,
    pub event: CaptureEvent,
    pub signature: String,
    pub installer_mode: bool,
}

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Captured {
        vaulted_path: PathBuf,
        meta_path: PathBuf,
    },
    /// Same signature seen within the TTL; a visible history entry records it.
    DuplicateSuppressed,
    /// Installation mode vetoed the capture; the payload stays on disk.
    SkippedByInstallMode,
}

pub struct ScanVault {
    dir: PathBuf,
    history_dir: PathBuf,
    recovery_dir: PathBuf,
    signatures: SignatureCache,
    install_mode: Arc<InstallationMode>,
    telemetry: Arc<Telemetry>,
}

impl ScanVault {
    pub fn new(
        layout: &AppLayout,
        install_mode: Arc<InstallationMode>,
        telemetry: Arc<Telemetry>,
        signature_ttl: Duration,
    ) -> Self {
        Self {
            dir: layout.vault_dir(),
            history_dir: layout.vault_history_dir(),
            recovery_dir: layout.vault_recovery_dir(),
            signatures: SignatureCache::new(signature_ttl),
            install_mode,
            telemetry,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn meta_path_for(vaulted: &Path) -> PathBuf {
        PathBuf::from(format!("{}.meta", vaulted.display()))
    }

    /// Capture a stabilized file into the vault.
    pub fn capture(&self, path: &Path, event: CaptureEvent) -> Result<CaptureOutcome, VaultError> {
        if !path.exists() {
            return Err(VaultError::FileGone(path.to_path_buf()));
        }

        let signature = scan_signature(path);
        if self.signatures.is_recent(&signature) {
            self.write_duplicate_history(path, &signature, event);
            self.telemetry.incr("duplicate_suppressed");
            info!(%signature, path = %path.display(), "duplicate capture suppressed");
            return Ok(CaptureOutcome::DuplicateSuppressed);
        }

        if self.install_mode.should_skip(path) {
            return Ok(CaptureOutcome::SkippedByInstallMode);
        }

        std::fs::create_dir_all(&self.dir)
            .map_err(|source| VaultError::MoveFailed { attempts: 0, source })?;

        let now = Local::now();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let normalized = normalize_path(path);
        let path_hash = &sha256_hex(normalized.as_bytes())[..16];
        let vaulted = self.dir.join(format!(
            "{file_name}__{}__{path_hash}.vaulted",
            now.format("%Y%m%d%H%M%S")
        ));

        move_with_retries(
            path,
            &vaulted,
            CAPTURE_MOVE_ATTEMPTS,
            CAPTURE_BACKOFF_START,
            CAPTURE_BACKOFF_CAP,
            CAPTURE_BACKOFF_FACTOR,
        )
        .map_err(|e| match e {
            MoveError::SourceMissing => VaultError::FileGone(path.to_path_buf()),
            MoveError::Io { attempts, source } => VaultError::MoveFailed { attempts, source },
        })?;

        let meta = VaultMeta {
            original_path: normalized,
            vaulted_path: normalize_path(&vaulted),
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            event,
            signature: signature.clone(),
            installer_mode: self.install_mode.is_active(),
        };
        let meta_path = Self::meta_path_for(&vaulted);
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| VaultError::MetaWriteFailed(std::io::Error::other(e)))?;
        std::fs::write(&meta_path, json).map_err(VaultError::MetaWriteFailed)?;

        self.signatures.record(signature);
        self.telemetry.incr("stabilized_capture");
        info!(from = %path.display(), to = %vaulted.display(), %event, "file captured into vault");
        Ok(CaptureOutcome::Captured {
            vaulted_path: vaulted,
            meta_path,
        })
    }

    pub fn load_meta(meta_path: &Path) -> anyhow::Result<VaultMeta> {
        Ok(read_json(meta_path)?)
    }

    /// Move a pending sidecar to history with extra terminal-state fields.
    /// Best-effort: history bookkeeping must never change a payload's fate.
    pub fn archive_meta(&self, meta_path: &Path, extra: serde_json::Value) {
        if let Err(e) = std::fs::create_dir_all(&self.history_dir) {
            warn!(error = %e, "cannot create vault history dir");
            return;
        }
        let mut doc = read_json::<serde_json::Value>(meta_path)
            .unwrap_or_else(|_| serde_json::json!({}));
        if let (Some(obj), Some(add)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in add {
                obj.insert(k.clone(), v.clone());
            }
        }
        let base = meta_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown.meta".to_string());
        let history_meta = self.history_dir.join(base);
        match serde_json::to_string_pretty(&doc) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&history_meta, json) {
                    warn!(path = %history_meta.display(), error = %e, "failed to write history meta");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize history meta");
                return;
            }
        }
        if let Err(e) = std::fs::remove_file(meta_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %meta_path.display(), error = %e, "failed to remove pending sidecar");
            }
        }
    }

    pub fn archive_quarantined(
        &self,
        meta_path: &Path,
        quarantine_path: &Path,
        matched_rule: &str,
        recheck_before_restore: bool,
    ) {
        let mut extra = serde_json::json!({
            "final_status": "Quarantined",
            "action_timestamp": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "quarantine_path": normalize_path(quarantine_path),
            "matched_rule": matched_rule,
        });
        if recheck_before_restore {
            extra["recheck_before_restore"] = serde_json::Value::Bool(true);
        }
        self.archive_meta(meta_path, extra);
    }

    pub fn archive_restored(&self, meta_path: &Path, restored_path: &Path, pre_restore_hash: &str) {
        self.archive_meta(
            meta_path,
            serde_json::json!({
                "final_status": "Restored",
                "action_timestamp": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                "restored_path": normalize_path(restored_path),
                "pre_restore_hash": pre_restore_hash,
                "recheck_before_restore": false,
            }),
        );
    }

    fn write_duplicate_history(&self, path: &Path, signature: &str, event: CaptureEvent) {
        if let Err(e) = std::fs::create_dir_all(&self.history_dir) {
            warn!(error = %e, "cannot create vault history dir");
            return;
        }
        let now = Local::now();
        let stub = format!(
            "duplicate__{}__{}.meta",
            &signature[..12],
            now.format("%Y%m%d%H%M%S")
        );
        let doc = serde_json::json!({
            "original_path": normalize_path(path),
            "timestamp": now.format("%Y-%m-%d %H:%M:%S").to_string(),
            "final_status": "DuplicateSuppressed",
            "signature": signature,
            "file_name": path.file_name().map(|n| n.to_string_lossy().to_string()),
            "event": event.to_string(),
        });
        match serde_json::to_string_pretty(&doc) {
            Ok(json) => {
                if let Err(e) = std::fs::write(self.history_dir.join(stub), json) {
                    warn!(error = %e, "failed to write duplicate history meta");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize duplicate history meta"),
        }
    }

    /// Complete payload/sidecar pairs still pending in the vault.
    pub fn pending_entries(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "vaulted") != Some(true) {
                continue;
            }
            let meta = Self::meta_path_for(&path);
            if meta.exists() {
                out.push((path, meta));
            }
        }
        out
    }

    /// Startup reconciliation: orphan payloads move to the recovery folder,
    /// orphan sidecars are archived to history with `final_status: Unknown`.
    pub fn reconcile_startup(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            let Some(name) = name else { continue };

            if name.ends_with(".vaulted") {
                if !Self::meta_path_for(&path).exists() {
                    if std::fs::create_dir_all(&self.recovery_dir).is_ok() {
                        let dest = self.recovery_dir.join(&name);
                        match move_file(&path, &dest) {
                            Ok(()) => {
                                warn!(payload = %path.display(), "orphan vault payload moved to recovery")
                            }
                            Err(e) => {
                                warn!(payload = %path.display(), error = %e, "failed to move orphan payload")
                            }
                        }
                    }
                }
            } else if name.ends_with(".vaulted.meta") {
                let payload = PathBuf::from(
                    path.to_string_lossy()
                        .trim_end_matches(".meta")
                        .to_string(),
                );
                if !payload.exists() {
                    warn!(meta = %path.display(), "orphan vault sidecar archived as Unknown");
                    self.archive_meta(
                        &path,
                        serde_json::json!({
                            "final_status": "Unknown",
                            "action_timestamp":
                                Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                        }),
                    );
                }
            }
        }
    }
}
