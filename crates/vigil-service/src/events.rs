//! The UI boundary.
//!
//! Background components never touch UI state directly: they post events
//! through the [`CoreEvents`] trait. A real frontend installs
//! [`ChannelEvents`] and drains the channel on its own thread; headless runs
//! use [`NullEvents`]; tests use [`RecordingEvents`].

use crate::scheduler::ScanSummary;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum UiEvent {
    VaultCaptured {
        vaulted_path: PathBuf,
        meta_path: PathBuf,
    },
    Quarantined {
        original_path: PathBuf,
        rules: Vec<String>,
    },
    Restored {
        path: PathBuf,
    },
    ScanStarted {
        total: usize,
    },
    ScanProgress {
        scanned: usize,
        total: usize,
        matches: usize,
    },
    ScheduleComplete {
        summary: ScanSummary,
    },
    Notification {
        title: String,
        body: String,
    },
}

pub trait CoreEvents: Send + Sync {
    fn on_vault_capture(&self, vaulted_path: &Path, meta_path: &Path);
    fn on_quarantine(&self, original_path: &Path, rules: &[String]);
    fn on_restore(&self, path: &Path);
    fn on_scan_started(&self, total: usize);
    fn on_scan_progress(&self, scanned: usize, total: usize, matches: usize);
    fn on_schedule_complete(&self, summary: &ScanSummary);
    fn on_notification(&self, title: &str, body: &str);
}

/// Headless sink.
pub struct NullEvents;

impl CoreEvents for NullEvents {
    fn on_vault_capture(&self, _: &Path, _: &Path) {}
    fn on_quarantine(&self, _: &Path, _: &[String]) {}
    fn on_restore(&self, _: &Path) {}
    fn on_scan_started(&self, _: usize) {}
    fn on_scan_progress(&self, _: usize, _: usize, _: usize) {}
    fn on_schedule_complete(&self, _: &ScanSummary) {}
    fn on_notification(&self, _: &str, _: &str) {}
}

/// Posts events into a channel owned by the UI. Sends are best-effort: a
/// departed UI must never stall the pipeline.
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn post(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }
}

impl CoreEvents for ChannelEvents {
    fn on_vault_capture(&self, vaulted_path: &Path, meta_path: &Path) {
        self.post(UiEvent::VaultCaptured {
            vaulted_path: vaulted_path.to_path_buf(),
            meta_path: meta_path.to_path_buf(),
        });
    }

    fn on_quarantine(&self, original_path: &Path, rules: &[String]) {
        self.post(UiEvent::Quarantined {
            original_path: original_path.to_path_buf(),
            rules: rules.to_vec(),
        });
    }

    fn on_restore(&self, path: &Path) {
        self.post(UiEvent::Restored {
            path: path.to_path_buf(),
        });
    }

    fn on_scan_started(&self, total: usize) {
        self.post(UiEvent::ScanStarted { total });
    }

    fn on_scan_progress(&self, scanned: usize, total: usize, matches: usize) {
        self.post(UiEvent::ScanProgress {
            scanned,
            total,
            matches,
        });
    }

    fn on_schedule_complete(&self, summary: &ScanSummary) {
        self.post(UiEvent::ScheduleComplete {
            summary: summary.clone(),
        });
    }

    fn on_notification(&self, title: &str, body: &str) {
        self.post(UiEvent::Notification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }
}

/// Recording sink for tests and embedders that assert on emitted events.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<UiEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn snapshot(&self) -> Vec<UiEvent> {
        self.events.lock().clone()
    }

    fn push(&self, event: UiEvent) {
        self.events.lock().push(event);
    }
}

impl CoreEvents for RecordingEvents {
    fn on_vault_capture(&self, vaulted_path: &Path, meta_path: &Path) {
        self.push(UiEvent::VaultCaptured {
            vaulted_path: vaulted_path.to_path_buf(),
            meta_path: meta_path.to_path_buf(),
        });
    }

    fn on_quarantine(&self, original_path: &Path, rules: &[String]) {
        self.push(UiEvent::Quarantined {
            original_path: original_path.to_path_buf(),
            rules: rules.to_vec(),
        });
    }

    fn on_restore(&self, path: &Path) {
        self.push(UiEvent::Restored {
            path: path.to_path_buf(),
        });
    }

    fn on_scan_started(&self, total: usize) {
        self.push(UiEvent::ScanStarted { total });
    }

    fn on_scan_progress(&self, scanned: usize, total: usize, matches: usize) {
        self.push(UiEvent::ScanProgress {
            scanned,
            total,
            matches,
        });
    }

    fn on_schedule_complete(&self, summary: &ScanSummary) {
        self.push(UiEvent::ScheduleComplete {
            summary: summary.clone(),
        });
    }

    fn on_notification(&self, title: &str, body: &str) {
        self.push(UiEvent::Notification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }
}

/// How long before the per-run notification dedup set is cleared.
pub const NOTIFY_CLEAR_INTERVAL: Duration = Duration::from_secs(300);

/// Dedup gate for user-facing toasts: one notification per original path per
/// window, so recheck cycles don't spam the same detection.
pub struct NotificationGate {
    inner: Mutex<GateState>,
}

struct GateState {
    notified: HashSet<String>,
    last_clear: Instant,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateState {
                notified: HashSet::new(),
                last_clear: Instant::now(),
            }),
        }
    }

    /// True exactly once per key per clear window.
    pub fn first_time(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        if state.last_clear.elapsed() > NOTIFY_CLEAR_INTERVAL {
            state.notified.clear();
            state.last_clear = Instant::now();
        }
        state.notified.insert(key.to_string())
    }
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_dedups_within_window() {
        let gate = NotificationGate::new();
        assert!(gate.first_time("/a/b.exe"));
        assert!(!gate.first_time("/a/b.exe"));
        assert!(gate.first_time("/a/c.exe"));
    }

    #[test]
    fn channel_events_reach_receiver() {
        let (events, mut rx) = ChannelEvents::new();
        events.on_scan_started(7);
        match rx.try_recv().unwrap() {
            UiEvent::ScanStarted { total } => assert_eq!(total, 7),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
