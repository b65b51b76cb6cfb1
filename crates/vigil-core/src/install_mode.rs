//! Installation Mode: a time-boxed gate that suppresses vault capture for
//! installer-class files, so a legitimate setup run doesn't get its payload
//! files yanked into staging mid-install.
//!
//! The instance is constructor-injected and owned by the orchestrator, which
//! also runs the watchdog that expires the gate.

use crate::paths::normalize_path;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Extensions skipped while the mode is active.
pub const INSTALLER_EXTENSIONS: &[&str] = &[
    ".msi", ".exe", ".dll", ".sys", ".ocx", ".scr", ".cab", ".inf", ".cat", ".drv", ".cpl",
    ".tmp", ".temp", ".dat", ".bin",
];

/// System installer locations that are skipped regardless of mode state.
pub const TRUSTED_INSTALLER_SUBPATHS: &[&str] = &[
    "windows/installer",
    "windows/winsxs",
    "windows/softwaredistribution",
    "programdata/package cache",
    "appdata/local/temp",
    "appdata/local/microsoft/windows/inetcache",
];

#[derive(Default)]
struct State {
    active: bool,
    end_time: Option<Instant>,
    trusted_folders: BTreeSet<String>,
}

#[derive(Default)]
pub struct InstallationMode {
    state: Mutex<State>,
}

impl InstallationMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        let mut state = self.state.lock();
        Self::expire_locked(&mut state);
        state.active
    }

    pub fn activate(&self, duration_minutes: u64) {
        self.activate_for(Duration::from_secs(duration_minutes * 60));
        info!(duration_minutes, "installation mode activated");
    }

    pub fn activate_for(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.active = true;
        state.end_time = Some(Instant::now() + duration);
    }

    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        if state.active {
            state.active = false;
            state.end_time = None;
            info!("installation mode deactivated");
        }
    }

    pub fn remaining_secs(&self) -> u64 {
        let mut state = self.state.lock();
        Self::expire_locked(&mut state);
        if !state.active {
            return 0;
        }
        state
            .end_time
            .map(|end| end.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or(0)
    }

    /// Watchdog tick: auto-deactivate once the window has elapsed.
    pub fn expire_if_due(&self) {
        let mut state = self.state.lock();
        Self::expire_locked(&mut state);
    }

    fn expire_locked(state: &mut State) {
        if state.active {
            if let Some(end) = state.end_time {
                if Instant::now() >= end {
                    state.active = false;
                    state.end_time = None;
                    info!("installation mode expired");
                }
            }
        }
    }

    pub fn add_trusted_folder(&self, folder: &Path) {
        let normalized = normalize_path(folder);
        self.state.lock().trusted_folders.insert(normalized);
    }

    pub fn remove_trusted_folder(&self, folder: &Path) {
        let normalized = normalize_path(folder);
        self.state.lock().trusted_folders.remove(&normalized);
    }

    pub fn trusted_folders(&self) -> Vec<String> {
        self.state.lock().trusted_folders.iter().cloned().collect()
    }

    /// Whether vault capture should skip this file. The decision is recorded
    /// in the vault sidecar so the processor can run its post-copy sweep.
    pub fn should_skip(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        let norm = normalize_path(path).to_lowercase();

        if TRUSTED_INSTALLER_SUBPATHS.iter().any(|sub| norm.contains(sub)) {
            debug!(path = %path.display(), "skipping file in system installer path");
            return true;
        }

        {
            let state = self.state.lock();
            if state
                .trusted_folders
                .iter()
                .any(|folder| norm.starts_with(&folder.to_lowercase()))
            {
                debug!(path = %path.display(), "skipping file in user-trusted folder");
                return true;
            }
        }

        if self.is_active() {
            let ext = crate::paths::extension_of(path);
            if INSTALLER_EXTENSIONS.contains(&ext.as_str()) {
                debug!(path = %path.display(), "skipping installer file while mode active");
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn inactive_mode_skips_nothing_outside_trusted_roots() {
        let tmp = tempdir().unwrap();
        let mode = InstallationMode::new();
        let exe = tmp.path().join("setup.exe");
        std::fs::write(&exe, b"MZ").unwrap();
        assert!(!mode.should_skip(&exe));
    }

    #[test]
    fn active_mode_skips_installer_extensions_only() {
        let tmp = tempdir().unwrap();
        let mode = InstallationMode::new();
        mode.activate(10);
        let exe = tmp.path().join("setup.exe");
        let doc = tmp.path().join("readme.pdf");
        std::fs::write(&exe, b"MZ").unwrap();
        std::fs::write(&doc, b"%PDF").unwrap();
        assert!(mode.should_skip(&exe));
        assert!(!mode.should_skip(&doc));
    }

    #[test]
    fn mode_expires() {
        let tmp = tempdir().unwrap();
        let mode = InstallationMode::new();
        mode.activate_for(Duration::from_millis(20));
        assert!(mode.is_active());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!mode.is_active());
        let exe = tmp.path().join("setup.msi");
        std::fs::write(&exe, b"x").unwrap();
        assert!(!mode.should_skip(&exe));
    }

    #[test]
    fn trusted_folders_skip_regardless_of_mode() {
        let tmp = tempdir().unwrap();
        let mode = InstallationMode::new();
        let folder = tmp.path().join("installers");
        std::fs::create_dir(&folder).unwrap();
        let file = folder.join("notes.txt");
        std::fs::write(&file, b"plain").unwrap();
        mode.add_trusted_folder(&folder);
        assert!(mode.should_skip(&file));
        mode.remove_trusted_folder(&folder);
        assert!(!mode.should_skip(&file));
    }

    #[test]
    fn missing_files_are_never_skipped() {
        let mode = InstallationMode::new();
        mode.activate(10);
        assert!(!mode.should_skip(Path::new("/nonexistent/setup.exe")));
    }
}
