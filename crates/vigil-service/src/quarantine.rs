//! Quarantine store: moves a suspect file into the protected quarantine
//! directory and writes a sidecar describing where it came from and which
//! rules matched. Files are never deleted here, only moved; destruction is
//! an explicit user action.
//!
//! Layout: `quarantine/<basename>__<YYYYMMDDhhmmss>__<sha256(path)[:16]>.quarantined`
//! plus `<name>.quarantined.meta`.

use crate::fsutil::{move_with_retries, MoveError};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use vigil_core::error::QuarantineError;
use vigil_core::paths::normalize_path;
use vigil_core::signature::sha256_hex;
use vigil_core::storage::read_json;

pub const MOVE_ATTEMPTS: u32 = 3;
pub const MOVE_BACKOFF: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineMeta {
    pub original_path: String,
    pub quarantined_path: String,
    pub timestamp: String,
    pub matched_rules: Vec<String>,
}

pub struct QuarantineStore {
    dir: PathBuf,
}

impl QuarantineStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sidecar path for a quarantined payload.
    pub fn meta_path_for(quarantined: &Path) -> PathBuf {
        PathBuf::from(format!("{}.meta", quarantined.display()))
    }

    /// Move `path` into quarantine. The sidecar is written only after a
    /// successful move; a failed sidecar write leaves the payload quarantined
    /// (payload state is authoritative) and is logged.
    pub fn quarantine(
        &self,
        path: &Path,
        matched_rules: &[String],
    ) -> Result<PathBuf, QuarantineError> {
        if !path.exists() {
            return Err(QuarantineError::SourceMissing(path.to_path_buf()));
        }
        std::fs::create_dir_all(&self.dir)
            .map_err(|source| QuarantineError::MoveFailed { attempts: 0, source })?;

        let now = Local::now();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let normalized = normalize_path(path);
        let path_hash = &sha256_hex(normalized.as_bytes())[..16];
        let quarantined = self.dir.join(format!(
            "{file_name}__{}__{path_hash}.quarantined",
            now.format("%Y%m%d%H%M%S")
        ));

        move_with_retries(path, &quarantined, MOVE_ATTEMPTS, MOVE_BACKOFF, MOVE_BACKOFF, 1.0)
            .map_err(|e| match e {
                MoveError::SourceMissing => QuarantineError::SourceMissing(path.to_path_buf()),
                MoveError::Io { attempts, source } => {
                    QuarantineError::MoveFailed { attempts, source }
                }
            })?;

        let meta = QuarantineMeta {
            original_path: normalized,
            quarantined_path: normalize_path(&quarantined),
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            matched_rules: matched_rules.to_vec(),
        };
        let meta_path = Self::meta_path_for(&quarantined);
        match serde_json::to_string_pretty(&meta) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&meta_path, json) {
                    warn!(path = %meta_path.display(), error = %e, "quarantine sidecar write failed; payload remains quarantined");
                }
            }
            Err(e) => {
                warn!(error = %e, "quarantine sidecar serialization failed");
            }
        }

        info!(
            from = %path.display(),
            to = %quarantined.display(),
            rules = ?matched_rules,
            "file quarantined"
        );
        Ok(quarantined)
    }

    /// Copy the payload back to its stored original location and remove the
    /// quarantine entry. Returns the restored path; callers are expected to
    /// schedule a post-restore recheck on it.
    pub fn restore(&self, quarantined: &Path) -> anyhow::Result<PathBuf> {
        let meta_path = Self::meta_path_for(quarantined);
        let meta: QuarantineMeta = read_json(&meta_path)?;
        let original = PathBuf::from(&meta.original_path);
        if let Some(parent) = original.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(quarantined, &original)?;
        std::fs::remove_file(quarantined)?;
        std::fs::remove_file(&meta_path)?;
        info!(
            from = %quarantined.display(),
            to = %original.display(),
            "quarantined file restored"
        );
        Ok(original)
    }

    /// Payload/sidecar pairs currently held in quarantine.
    pub fn entries(&self) -> Vec<(PathBuf, QuarantineMeta)> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "quarantined") != Some(true) {
                continue;
            }
            if let Ok(meta) = read_json::<QuarantineMeta>(&Self::meta_path_for(&path)) {
                out.push((path, meta));
            }
        }
        out
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn quarantine_moves_payload_and_writes_sidecar() {
        let dir = tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("quarantine"));
        let hot = dir.path().join("evil.exe");
        std::fs::write(&hot, b"payload").unwrap();

        let quarantined = store
            .quarantine(&hot, &["Eicar_Test".to_string()])
            .unwrap();
        assert!(!hot.exists());
        assert!(quarantined.exists());
        let name = quarantined.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("evil.exe__"));
        assert!(name.ends_with(".quarantined"));

        let meta: QuarantineMeta =
            read_json(&QuarantineStore::meta_path_for(&quarantined)).unwrap();
        assert_eq!(meta.matched_rules, vec!["Eicar_Test"]);
        assert!(meta.original_path.ends_with("evil.exe"));
    }

    #[test]
    fn quarantine_missing_source_fails() {
        let dir = tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("quarantine"));
        let err = store
            .quarantine(&dir.path().join("gone.exe"), &[])
            .unwrap_err();
        assert!(matches!(err, QuarantineError::SourceMissing(_)));
    }

    #[test]
    fn restore_round_trips_bytes_and_clears_entry() {
        let dir = tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("quarantine"));
        let hot = dir.path().join("docs").join("report.pdf");
        std::fs::create_dir_all(hot.parent().unwrap()).unwrap();
        std::fs::write(&hot, b"original bytes").unwrap();

        let quarantined = store.quarantine(&hot, &["Rule".to_string()]).unwrap();
        assert!(!hot.exists());
        assert_eq!(store.entries().len(), 1);

        let restored = store.restore(&quarantined).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), b"original bytes");
        assert!(!quarantined.exists());
        assert!(!QuarantineStore::meta_path_for(&quarantined).exists());
        assert!(store.entries().is_empty());
    }
}
