//! Filesystem watcher: feeds candidate paths into the capture pipeline.
//!
//! Two sources share one channel. The in-process source bridges `notify`
//! events from their sync callback into the async world through a named
//! thread. The optional out-of-process source supervises a helper
//! executable that emits newline-delimited JSON `{"path": "..."}` records on
//! stdout; on disconnect the reader respawns it with a short backoff.
//! Duplicate and storm events are expected — the pipeline debounces.

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Reconnect backoff for the out-of-process helper.
pub const PIPE_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Create the watcher; interesting events land in `tx` as bare paths.
    pub fn new(tx: mpsc::UnboundedSender<PathBuf>) -> Result<Self> {
        let (sync_tx, sync_rx) = std_mpsc::channel::<Result<Event, notify::Error>>();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default(),
        )?;

        // Bridge sync notify callbacks to the async channel.
        std::thread::Builder::new()
            .name("fs-watcher-bridge".into())
            .spawn(move || {
                while let Ok(res) = sync_rx.recv() {
                    match res {
                        Ok(event) => {
                            if !is_candidate_event(&event.kind) {
                                continue;
                            }
                            for path in event.paths {
                                if tx.send(path).is_err() {
                                    debug!("candidate channel closed, watcher bridge exiting");
                                    return;
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "watcher error"),
                    }
                }
            })?;

        Ok(Self { watcher })
    }

    pub fn watch_roots(&mut self, roots: &[PathBuf]) -> Result<()> {
        for root in roots {
            if root.exists() {
                self.watcher.watch(root, RecursiveMode::Recursive)?;
                info!(root = %root.display(), "watching");
            } else {
                warn!(root = %root.display(), "watch root does not exist");
            }
        }
        Ok(())
    }

    pub fn unwatch(&mut self, root: &Path) -> Result<()> {
        self.watcher.unwatch(root)?;
        Ok(())
    }
}

/// Creations and content/name modifications of closed files are what the
/// pipeline stabilizes on; pure metadata changes are noise here.
fn is_candidate_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(modify) => !matches!(modify, notify::event::ModifyKind::Metadata(_)),
        _ => false,
    }
}

/// Default watch roots: the user-relevant folders, plus (on Windows) every
/// non-system drive root that exists.
pub fn default_watch_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(dirs) = directories::UserDirs::new() {
        for dir in [
            dirs.download_dir().map(Path::to_path_buf),
            dirs.desktop_dir().map(Path::to_path_buf),
            dirs.document_dir().map(Path::to_path_buf),
        ]
        .into_iter()
        .flatten()
        {
            if dir.exists() {
                roots.push(dir);
            }
        }
    }
    #[cfg(windows)]
    for letter in 'A'..='Z' {
        if letter == 'C' {
            continue;
        }
        let drive = PathBuf::from(format!("{letter}:\\"));
        if drive.exists() {
            roots.push(drive);
        }
    }
    roots
}

#[derive(Debug, Deserialize)]
struct PipeRecord {
    path: String,
}

/// Supervise an out-of-process change source. The helper writes one JSON
/// record per line; partial lines across reads are handled by the buffered
/// reader. Exits only on shutdown.
pub fn spawn_pipe_reader(
    helper: PathBuf,
    excludes: Vec<String>,
    tx: mpsc::UnboundedSender<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match Command::new(&helper)
                .args(&excludes)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(mut child) => {
                    info!(helper = %helper.display(), "external watcher started");
                    if let Some(stdout) = child.stdout.take() {
                        let mut lines = BufReader::new(stdout).lines();
                        loop {
                            tokio::select! {
                                line = lines.next_line() => match line {
                                    Ok(Some(line)) => {
                                        let line = line.trim();
                                        if line.is_empty() {
                                            continue;
                                        }
                                        match serde_json::from_str::<PipeRecord>(line) {
                                            Ok(record) => {
                                                if tx.send(PathBuf::from(record.path)).is_err() {
                                                    let _ = child.start_kill();
                                                    return;
                                                }
                                            }
                                            Err(e) => debug!(error = %e, "unparseable watcher record"),
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(error = %e, "watcher stream read failed");
                                        break;
                                    }
                                },
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        let _ = child.start_kill();
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    let _ = child.start_kill();
                    warn!("external watcher disconnected, restarting");
                }
                Err(e) => {
                    warn!(helper = %helper.display(), error = %e, "cannot start external watcher");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(PIPE_RECONNECT_BACKOFF) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, MetadataKind, ModifyKind};

    #[test]
    fn candidate_event_filter() {
        assert!(is_candidate_event(&EventKind::Create(CreateKind::File)));
        assert!(is_candidate_event(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_candidate_event(&EventKind::Modify(
            ModifyKind::Metadata(MetadataKind::Permissions)
        )));
        assert!(!is_candidate_event(&EventKind::Remove(
            notify::event::RemoveKind::File
        )));
    }

    #[tokio::test]
    async fn watcher_emits_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = FileWatcher::new(tx).unwrap();
        watcher.watch_roots(&[dir.path().to_path_buf()]).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("fresh.bin"), b"data").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(path) = rx.recv().await {
                    if path.file_name().map(|n| n == "fresh.bin") == Some(true) {
                        return path;
                    }
                }
            }
        })
        .await;
        assert!(got.is_ok(), "expected a watcher event for fresh.bin");
    }
}
