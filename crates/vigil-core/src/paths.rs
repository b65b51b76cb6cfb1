//! Path normalization and the on-disk layout of the working directory.
//!
//! Every path that participates in equality or prefix checks goes through
//! [`normalize_path`] first: absolute, forward slashes, lowercased on Windows.
//! Containment checks themselves are always case-insensitive because the
//! primary deployment target is NTFS.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "one";
pub const APP_ORG: &str = "vigil";
pub const APP_NAME: &str = "vigil";

/// Canonical string form of a path: absolute, `/`-separated, lowercased on
/// Windows. Used for sidecar fields, dedup keys, and prefix checks.
pub fn normalize_path(path: &Path) -> String {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let s = abs.to_string_lossy().replace('\\', "/");
    #[cfg(windows)]
    {
        s.to_lowercase()
    }
    #[cfg(not(windows))]
    {
        s
    }
}

/// Case-insensitive containment: `path` equals `root` or lives below it.
/// Both arguments are expected in [`normalize_path`] form.
pub fn is_under(path: &str, root: &str) -> bool {
    let p = path.to_lowercase();
    let r = root.trim_end_matches('/').to_lowercase();
    if r.is_empty() {
        return false;
    }
    p == r || p.starts_with(&format!("{r}/"))
}

/// Lowercased extension including the leading dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Resolves the working-directory layout: quarantine, vault, rules, and
/// config documents all live under a single root.
#[derive(Debug, Clone)]
pub struct AppLayout {
    root: PathBuf,
}

impl AppLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Platform data directory, used when no `--data-dir` override is given.
    pub fn default_root() -> anyhow::Result<PathBuf> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
            .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
        Ok(dirs.data_dir().to_path_buf())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.root.join("scanvault")
    }

    pub fn vault_history_dir(&self) -> PathBuf {
        self.vault_dir().join("history")
    }

    pub fn vault_recovery_dir(&self) -> PathBuf {
        self.vault_dir().join("recovery")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.root.join("assets").join("yara")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir().join("vigil.log")
    }

    pub fn user_exclusions_path(&self) -> PathBuf {
        self.data_dir().join("user_exclusions.json")
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.data_dir().join("scan_schedule.json")
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.quarantine_dir(),
            self.vault_dir(),
            self.vault_history_dir(),
            self.rules_dir(),
            self.data_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_uses_forward_slashes() {
        let n = normalize_path(Path::new("/tmp/some/file.txt"));
        assert!(!n.contains('\\'));
        assert!(n.ends_with("file.txt"));
    }

    #[test]
    fn is_under_matches_prefix_and_self() {
        assert!(is_under("/a/b/c", "/a/b"));
        assert!(is_under("/a/b", "/a/b"));
        assert!(!is_under("/a/bc", "/a/b"));
        assert!(!is_under("/a", "/a/b"));
    }

    #[test]
    fn is_under_is_case_insensitive() {
        assert!(is_under("c:/users/u/Downloads/x.exe", "C:/Users/u/downloads"));
    }

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(extension_of(Path::new("a/B.EXE")), ".exe");
        assert_eq!(extension_of(Path::new("a/noext")), "");
    }

    #[test]
    fn layout_paths_hang_off_root() {
        let layout = AppLayout::new(PathBuf::from("/opt/vigil"));
        assert_eq!(layout.vault_history_dir(), PathBuf::from("/opt/vigil/scanvault/history"));
        assert_eq!(layout.user_exclusions_path(), PathBuf::from("/opt/vigil/data/user_exclusions.json"));
    }
}
