//! Scheduled-scan runtime: a single evaluator task that wakes periodically,
//! checks the persisted schedule against the clock, and spawns one worker
//! per due scan. `last_run` is persisted before the worker starts so a
//! second evaluator tick in the same window cannot double-fire.

use crate::events::CoreEvents;
use crate::scanner::{ScanOutcome, Scanner};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use vigil_core::exclusions::{ExclusionOracle, ExclusionPolicy};
use vigil_core::schedule::{load_schedule, save_schedule, ScheduleConfig};
use vigil_core::telemetry::Telemetry;
use walkdir::WalkDir;

/// Evaluator wake interval; due-time dedup makes more frequent ticks safe.
pub const EVALUATOR_INTERVAL: Duration = Duration::from_secs(30);
/// Cap on matched samples carried in the completion summary.
pub const MATCHED_SAMPLES_CAP: usize = 25;

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub total_files: usize,
    pub matches: usize,
    pub missing_paths: Vec<PathBuf>,
    pub matched_samples: Vec<(PathBuf, String)>,
    pub duration_sec: f64,
    pub ended_at: String,
}

pub struct ScheduledScanner {
    config_path: PathBuf,
    scanner: Arc<Scanner>,
    oracle: Arc<ExclusionOracle>,
    events: Arc<dyn CoreEvents>,
    telemetry: Arc<Telemetry>,
}

impl ScheduledScanner {
    pub fn new(
        config_path: PathBuf,
        scanner: Arc<Scanner>,
        oracle: Arc<ExclusionOracle>,
        events: Arc<dyn CoreEvents>,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config_path,
            scanner,
            oracle,
            events,
            telemetry,
        })
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("scheduled scan evaluator started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(EVALUATOR_INTERVAL) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("scheduled scan evaluator stopped");
                            return;
                        }
                    }
                }
                let cfg = load_schedule(&scheduler.config_path);
                if cfg.is_due(Local::now()) {
                    scheduler.trigger(cfg);
                }
            }
        })
    }

    /// Fire the worker immediately with the current config, bypassing
    /// due-time evaluation.
    pub fn run_now(self: &Arc<Self>) {
        let cfg = load_schedule(&self.config_path);
        if cfg.paths.is_empty() {
            warn!("run-now aborted: no paths configured");
            return;
        }
        self.trigger(cfg);
    }

    fn trigger(self: &Arc<Self>, mut cfg: ScheduleConfig) {
        // Persist last_run before the scan body: the dedup guard.
        cfg.mark_triggered(Local::now());
        if let Err(e) = save_schedule(&self.config_path, &cfg) {
            warn!(error = %e, "failed to persist schedule trigger");
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_scan_job(&cfg).await;
        });
    }

    /// The scan worker body: enumerate, scan, report.
    pub async fn run_scan_job(&self, cfg: &ScheduleConfig) -> ScanSummary {
        info!(
            time = %cfg.time,
            paths = cfg.paths.len(),
            "starting scheduled scan"
        );
        let started = Instant::now();
        let (files, missing_paths) = self.enumerate(cfg);
        let total = files.len();
        self.events.on_scan_started(total);

        let mut matches = 0usize;
        let mut matched_samples: Vec<(PathBuf, String)> = Vec::new();
        for (idx, file) in files.iter().enumerate() {
            match self.scanner.scan_file(file, ExclusionPolicy::Normal) {
                ScanOutcome::Match { rule, .. } => {
                    matches += 1;
                    if matched_samples.len() < MATCHED_SAMPLES_CAP {
                        matched_samples.push((file.clone(), rule));
                    }
                }
                ScanOutcome::QuarantineFailed { rule } => {
                    warn!(path = %file.display(), %rule, "scheduled scan match could not be quarantined");
                }
                _ => {}
            }
            self.events.on_scan_progress(idx + 1, total, matches);
        }

        let duration_sec = started.elapsed().as_secs_f64();
        let summary = ScanSummary {
            total_files: total,
            matches,
            missing_paths,
            matched_samples,
            duration_sec,
            ended_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        info!(
            total_files = summary.total_files,
            matches = summary.matches,
            duration_sec = format!("{duration_sec:.2}"),
            "scheduled scan completed"
        );
        self.telemetry.incr("scheduled_scan_completed");
        if matches > 0 {
            self.events.on_notification(
                "Vigil threat alert",
                &format!("Scheduled scan found {matches} suspicious file(s)."),
            );
        }
        self.events.on_schedule_complete(&summary);
        summary
    }

    /// Enumerate candidate files for the configured roots: missing roots are
    /// collected, excluded directories pruned, excluded files skipped.
    fn enumerate(&self, cfg: &ScheduleConfig) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let mut files = Vec::new();
        let mut missing = Vec::new();
        for base in &cfg.paths {
            if !base.exists() {
                missing.push(base.clone());
                continue;
            }
            if base.is_file() {
                if !self.is_excluded(base) {
                    files.push(base.clone());
                }
                continue;
            }
            let mut walker = WalkDir::new(base).follow_links(false);
            if !cfg.include_subdirs {
                walker = walker.max_depth(1);
            }
            let oracle = &self.oracle;
            for entry in walker
                .into_iter()
                .filter_entry(|e| !(e.file_type().is_dir() && oracle.classify(e.path()).0))
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() && !self.is_excluded(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        (files, missing)
    }

    fn is_excluded(&self, path: &std::path::Path) -> bool {
        self.oracle.classify(path).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RecordingEvents, UiEvent};
    use crate::quarantine::QuarantineStore;
    use crate::rules::RuleEngine;
    use std::path::Path;
    use tempfile::tempdir;
    use vigil_core::user_exclusions::UserExclusions;

    const EICAR_RULE: &str = r#"
rule Eicar_Test {
    strings:
        $marker = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE"
    condition:
        $marker
}
"#;

    fn scheduler_in(root: &Path, events: Arc<RecordingEvents>) -> Arc<ScheduledScanner> {
        let rules_dir = root.join("rules");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(rules_dir.join("eicar.yar"), EICAR_RULE).unwrap();
        let user = Arc::new(UserExclusions::load(root.join("user_exclusions.json")));
        let oracle = Arc::new(ExclusionOracle::with_roots(
            vec![root.join("app")],
            vec![],
            vec![],
            root.join("app").join("scanvault"),
            user,
        ));
        let telemetry = Arc::new(Telemetry::new());
        let scanner = Arc::new(Scanner::new(
            Arc::new(RuleEngine::compile(&rules_dir)),
            Arc::new(QuarantineStore::new(root.join("quarantine"))),
            oracle.clone(),
            telemetry.clone(),
        ));
        ScheduledScanner::new(
            root.join("scan_schedule.json"),
            scanner,
            oracle,
            events,
            telemetry,
        )
    }

    #[tokio::test]
    async fn scan_job_walks_reports_and_quarantines() {
        let dir = tempdir().unwrap();
        let events = Arc::new(RecordingEvents::new());
        let scheduler = scheduler_in(dir.path(), events.clone());

        let docs = dir.path().join("docs");
        std::fs::create_dir_all(docs.join("sub")).unwrap();
        std::fs::write(docs.join("clean.txt"), b"fine").unwrap();
        std::fs::write(
            docs.join("sub").join("bad.exe"),
            b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE",
        )
        .unwrap();

        let cfg = ScheduleConfig {
            enabled: true,
            paths: vec![docs.clone(), dir.path().join("not-there")],
            ..ScheduleConfig::default()
        };
        let summary = scheduler.run_scan_job(&cfg).await;

        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.matches, 1);
        assert_eq!(summary.missing_paths, vec![dir.path().join("not-there")]);
        assert_eq!(summary.matched_samples.len(), 1);
        assert_eq!(summary.matched_samples[0].1, "Eicar_Test");
        assert!(!docs.join("sub").join("bad.exe").exists());

        let recorded = events.take();
        assert!(matches!(recorded.first(), Some(UiEvent::ScanStarted { total: 2 })));
        let progress = recorded
            .iter()
            .filter(|e| matches!(e, UiEvent::ScanProgress { .. }))
            .count();
        assert_eq!(progress, 2);
        assert!(recorded
            .iter()
            .any(|e| matches!(e, UiEvent::ScheduleComplete { .. })));
        assert!(recorded
            .iter()
            .any(|e| matches!(e, UiEvent::Notification { .. })));
    }

    #[tokio::test]
    async fn include_subdirs_false_limits_depth() {
        let dir = tempdir().unwrap();
        let events = Arc::new(RecordingEvents::new());
        let scheduler = scheduler_in(dir.path(), events);

        let docs = dir.path().join("docs");
        std::fs::create_dir_all(docs.join("deep")).unwrap();
        std::fs::write(docs.join("top.txt"), b"top").unwrap();
        std::fs::write(docs.join("deep").join("below.txt"), b"below").unwrap();

        let cfg = ScheduleConfig {
            enabled: true,
            include_subdirs: false,
            paths: vec![docs],
            ..ScheduleConfig::default()
        };
        let summary = scheduler.run_scan_job(&cfg).await;
        assert_eq!(summary.total_files, 1);
    }

    #[tokio::test]
    async fn excluded_directories_are_pruned() {
        let dir = tempdir().unwrap();
        let events = Arc::new(RecordingEvents::new());
        let scheduler = scheduler_in(dir.path(), events);

        // The app dir is an internal root; a scan rooted above it must not
        // descend into it.
        let app_payload = dir.path().join("app").join("scanvault");
        std::fs::create_dir_all(&app_payload).unwrap();
        std::fs::write(app_payload.join("staged.vaulted"), b"staged").unwrap();
        std::fs::write(dir.path().join("visible.txt"), b"visible").unwrap();
        std::fs::write(dir.path().join("rules").join("ignore.me"), b"x").unwrap();

        let cfg = ScheduleConfig {
            enabled: true,
            paths: vec![dir.path().to_path_buf()],
            ..ScheduleConfig::default()
        };
        let summary = scheduler.run_scan_job(&cfg).await;
        // visible.txt, user_exclusions.json (absent), rule files and
        // schedule artifacts are outside the internal app root, but nothing
        // under app/ is scanned.
        assert!(summary
            .matched_samples
            .iter()
            .all(|(p, _)| !p.starts_with(dir.path().join("app"))));
        assert!(summary.total_files >= 1);
    }
}
