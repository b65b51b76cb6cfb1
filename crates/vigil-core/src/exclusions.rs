//! The exclusion oracle: classifies any path as scannable or skipped with a
//! reason code. Evaluated hot on every watcher event, so the root sets are
//! computed once at construction.
//!
//! Order matters and first match wins: user exclusions, internal workspace
//! roots, recycle bin, temp roots, temp-like files, installer-protected
//! system roots.

use crate::paths::{extension_of, is_under, normalize_path, AppLayout};
use crate::user_exclusions::UserExclusions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Why a path was excluded from scanning. `None` means scannable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    None,
    Internal,
    RecycleBin,
    TempRoot,
    TempFile,
    UserExcluded,
    InstallerProtected,
}

/// `ForceVault` lets the vault processor scan files inside the (internal)
/// vault directory; temp-style exclusions still apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionPolicy {
    Normal,
    ForceVault,
}

const TEMP_EXTENSIONS: &[&str] = &[
    ".tmp", ".temp", ".part", ".partial", ".crdownload", ".download", ".swp", ".swo", ".bak",
    ".old", ".log", ".lock", ".cache", ".dmp", ".tmp~", ".~tmp",
];

const TEMP_FILE_NAMES: &[&str] = &["thumbs.db", ".ds_store"];

const TEMP_PREFIXES: &[&str] = &["~$", "._"];

pub struct ExclusionOracle {
    internal_roots: Vec<String>,
    temp_roots: Vec<String>,
    installer_roots: Vec<String>,
    vault_root: String,
    user: Arc<UserExclusions>,
}

impl ExclusionOracle {
    /// Build the oracle from the app layout and the process environment.
    pub fn new(layout: &AppLayout, user: Arc<UserExclusions>) -> Self {
        let base = layout.root().to_path_buf();
        let mut internal: Vec<PathBuf> = vec![
            base.clone(),
            layout.rules_dir(),
            layout.quarantine_dir(),
            layout.vault_dir(),
            base.join("build"),
            base.join("dist"),
            base.join("__pycache__"),
            base.join(".git"),
            base.join(".venv"),
            base.join(".mypy_cache"),
            base.join(".pytest_cache"),
            base.join("data").join("scan_queue"),
        ];
        // Packaged builds also shield the executable's directory and its
        // sibling asset/vault/quarantine dirs.
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                internal.extend([
                    dir.to_path_buf(),
                    dir.join("assets"),
                    dir.join("assets").join("yara"),
                    dir.join("quarantine"),
                    dir.join("scanvault"),
                    dir.join("data"),
                ]);
            }
        }

        let mut temp: Vec<PathBuf> = Vec::new();
        for env in ["TEMP", "TMP"] {
            if let Ok(val) = std::env::var(env) {
                if !val.is_empty() {
                    temp.push(PathBuf::from(val));
                }
            }
        }
        let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".into());
        temp.push(Path::new(&system_root).join("Temp"));
        #[cfg(windows)]
        for letter in 'A'..='Z' {
            let drive = PathBuf::from(format!("{letter}:\\"));
            if drive.exists() {
                temp.push(drive.join("$Recycle.Bin"));
                temp.push(drive.join("System Volume Information"));
            }
        }

        let installer: Vec<PathBuf> = vec![
            PathBuf::from(
                std::env::var("ProgramFiles").unwrap_or_else(|_| r"C:\Program Files".into()),
            ),
            PathBuf::from(
                std::env::var("ProgramFiles(x86)")
                    .unwrap_or_else(|_| r"C:\Program Files (x86)".into()),
            ),
            PathBuf::from(std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".into())),
            PathBuf::from(&system_root),
            Path::new(&system_root).join("Installer"),
            Path::new(&system_root).join("WinSxS"),
        ];

        Self::with_roots(internal, temp, installer, layout.vault_dir(), user)
    }

    /// Explicit-root constructor for embedders and tests that need hermetic
    /// root sets independent of the process environment.
    pub fn with_roots(
        internal_roots: Vec<PathBuf>,
        temp_roots: Vec<PathBuf>,
        installer_roots: Vec<PathBuf>,
        vault_root: PathBuf,
        user: Arc<UserExclusions>,
    ) -> Self {
        let norm = |roots: Vec<PathBuf>| -> Vec<String> {
            roots.iter().map(|p| normalize_path(p)).collect()
        };
        Self {
            internal_roots: norm(internal_roots),
            temp_roots: norm(temp_roots),
            installer_roots: norm(installer_roots),
            vault_root: normalize_path(&vault_root),
            user,
        }
    }

    pub fn classify(&self, path: &Path) -> (bool, ExclusionReason) {
        self.classify_with_policy(path, ExclusionPolicy::Normal)
    }

    pub fn classify_with_policy(
        &self,
        path: &Path,
        policy: ExclusionPolicy,
    ) -> (bool, ExclusionReason) {
        let norm = normalize_path(path);

        if self.user.is_excluded(path) {
            return (true, ExclusionReason::UserExcluded);
        }

        if self.internal_roots.iter().any(|r| is_under(&norm, r)) {
            let vault_override = policy == ExclusionPolicy::ForceVault
                && is_under(&norm, &self.vault_root);
            if !vault_override {
                return (true, ExclusionReason::Internal);
            }
        }

        if norm
            .to_lowercase()
            .split('/')
            .any(|seg| seg == "$recycle.bin")
        {
            return (true, ExclusionReason::RecycleBin);
        }

        if self.temp_roots.iter().any(|r| is_under(&norm, r)) {
            return (true, ExclusionReason::TempRoot);
        }

        if is_temp_like_file(path) {
            return (true, ExclusionReason::TempFile);
        }

        if self.installer_roots.iter().any(|r| is_under(&norm, r)) {
            return (true, ExclusionReason::InstallerProtected);
        }

        (false, ExclusionReason::None)
    }
}

/// Transient-file heuristic: editor lock prefixes, OS droppings, temp
/// extensions, zero-byte files, and files that cannot be stat'd.
pub fn is_temp_like_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if TEMP_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    if TEMP_FILE_NAMES.contains(&name.as_str()) {
        return true;
    }
    let ext = extension_of(path);
    if TEMP_EXTENSIONS.contains(&ext.as_str()) {
        return true;
    }
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() == 0,
        Err(e) => e.kind() != std::io::ErrorKind::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn oracle_with(dir: &Path, user: Arc<UserExclusions>) -> ExclusionOracle {
        let base = dir.join("app");
        ExclusionOracle::with_roots(
            vec![base.clone(), base.join("scanvault"), base.join("quarantine")],
            vec![dir.join("win-temp")],
            vec![dir.join("program files")],
            base.join("scanvault"),
            user,
        )
    }

    fn empty_user(dir: &Path) -> Arc<UserExclusions> {
        Arc::new(UserExclusions::load(dir.join("user_exclusions.json")))
    }

    #[test]
    fn internal_paths_are_excluded() {
        let tmp = tempdir().unwrap();
        let oracle = oracle_with(tmp.path(), empty_user(tmp.path()));
        let (excluded, reason) = oracle.classify(&tmp.path().join("app").join("x.exe"));
        assert!(excluded);
        assert_eq!(reason, ExclusionReason::Internal);
    }

    #[test]
    fn force_vault_overrides_internal_only_inside_vault() {
        let tmp = tempdir().unwrap();
        let oracle = oracle_with(tmp.path(), empty_user(tmp.path()));
        let vaulted = tmp.path().join("app").join("scanvault").join("x.exe.vaulted");
        std::fs::create_dir_all(vaulted.parent().unwrap()).unwrap();
        std::fs::write(&vaulted, b"data").unwrap();
        let (excluded, _) = oracle.classify_with_policy(&vaulted, ExclusionPolicy::ForceVault);
        assert!(!excluded);
        // Outside the vault, ForceVault still treats internal paths as internal.
        let other = tmp.path().join("app").join("quarantine").join("y.exe");
        let (excluded, reason) = oracle.classify_with_policy(&other, ExclusionPolicy::ForceVault);
        assert!(excluded);
        assert_eq!(reason, ExclusionReason::Internal);
    }

    #[test]
    fn recycle_bin_segment_is_detected_case_insensitively() {
        let tmp = tempdir().unwrap();
        let oracle = oracle_with(tmp.path(), empty_user(tmp.path()));
        let p = tmp.path().join("$Recycle.Bin").join("S-1-5").join("file.exe");
        let (excluded, reason) = oracle.classify(&p);
        assert!(excluded);
        assert_eq!(reason, ExclusionReason::RecycleBin);
    }

    #[test]
    fn temp_root_containment() {
        let tmp = tempdir().unwrap();
        let oracle = oracle_with(tmp.path(), empty_user(tmp.path()));
        let p = tmp.path().join("win-temp").join("setup.dat");
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"x").unwrap();
        let (excluded, reason) = oracle.classify(&p);
        assert!(excluded);
        assert_eq!(reason, ExclusionReason::TempRoot);
    }

    #[test]
    fn temp_like_files() {
        let tmp = tempdir().unwrap();
        assert!(is_temp_like_file(Path::new("/x/~$report.docx")));
        assert!(is_temp_like_file(Path::new("/x/Thumbs.db")));
        assert!(is_temp_like_file(Path::new("/x/setup.part")));
        // Zero-byte files are transient.
        let empty = tmp.path().join("empty.pdf");
        std::fs::write(&empty, b"").unwrap();
        assert!(is_temp_like_file(&empty));
        // A nonexistent path with a benign extension is not temp-like.
        assert!(!is_temp_like_file(&tmp.path().join("missing.pdf")));
        let real = tmp.path().join("real.pdf");
        std::fs::write(&real, b"content").unwrap();
        assert!(!is_temp_like_file(&real));
    }

    #[test]
    fn installer_roots_are_last() {
        let tmp = tempdir().unwrap();
        let oracle = oracle_with(tmp.path(), empty_user(tmp.path()));
        let p = tmp.path().join("program files").join("App").join("app.exe");
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"MZ").unwrap();
        let (excluded, reason) = oracle.classify(&p);
        assert!(excluded);
        assert_eq!(reason, ExclusionReason::InstallerProtected);
    }

    #[test]
    fn user_exclusions_win_over_everything() {
        let tmp = tempdir().unwrap();
        let user = empty_user(tmp.path());
        let inside_app = tmp.path().join("app").join("watched");
        std::fs::create_dir_all(&inside_app).unwrap();
        user.add_path(&inside_app);
        let oracle = oracle_with(tmp.path(), user);
        let (excluded, reason) = oracle.classify(&inside_app.join("f.txt"));
        assert!(excluded);
        assert_eq!(reason, ExclusionReason::UserExcluded);
    }

    #[test]
    fn classification_is_deterministic() {
        let tmp = tempdir().unwrap();
        let oracle = oracle_with(tmp.path(), empty_user(tmp.path()));
        let p = tmp.path().join("docs").join("report.pdf");
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"%PDF").unwrap();
        let first = oracle.classify(&p);
        for _ in 0..10 {
            assert_eq!(oracle.classify(&p), first);
        }
        assert_eq!(first, (false, ExclusionReason::None));
    }
}
