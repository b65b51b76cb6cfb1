//! The single scan-and-route function shared by the real-time pipeline, the
//! vault processor, the recheck subsystem, and the scheduled scanner.
//!
//! Behavior differences between "scan normally" and "scan a vaulted file"
//! are expressed through [`ExclusionPolicy`] instead of parallel functions,
//! so the routing logic lives in exactly one place.

use crate::quarantine::QuarantineStore;
use crate::rules::{RuleEngine, RuleEngineError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vigil_core::exclusions::{ExclusionOracle, ExclusionPolicy, ExclusionReason};
use vigil_core::telemetry::Telemetry;

/// Outcome carried by every scan.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// Ruleset not loaded; nothing was scanned.
    NoRules,
    SkippedInternal,
    SkippedTemp,
    /// Path disappeared or is not a regular file.
    SkippedNonFile,
    Clean,
    /// Matched and quarantined.
    Match {
        rule: String,
        quarantined_path: PathBuf,
        meta_path: PathBuf,
    },
    /// Matched but the quarantine move failed; the file is untouched.
    QuarantineFailed { rule: String },
    /// Rule engine failure (unreadable file, timeout).
    YaraError,
    /// Unexpected failure outside the engine.
    Error,
}

pub struct Scanner {
    engine: Arc<RuleEngine>,
    quarantine: Arc<QuarantineStore>,
    oracle: Arc<ExclusionOracle>,
    telemetry: Arc<Telemetry>,
    no_rules_logged: AtomicBool,
}

impl Scanner {
    pub fn new(
        engine: Arc<RuleEngine>,
        quarantine: Arc<QuarantineStore>,
        oracle: Arc<ExclusionOracle>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            engine,
            quarantine,
            oracle,
            telemetry,
            no_rules_logged: AtomicBool::new(false),
        }
    }

    pub fn rules_loaded(&self) -> bool {
        self.engine.is_loaded()
    }

    /// Scan one file and route a match into quarantine.
    pub fn scan_file(&self, path: &Path, policy: ExclusionPolicy) -> ScanOutcome {
        if !self.engine.is_loaded() {
            if !self.no_rules_logged.swap(true, Ordering::Relaxed) {
                error!("no rules loaded; scans report NoRules until a ruleset compiles");
            }
            return ScanOutcome::NoRules;
        }
        if !path.is_file() {
            return ScanOutcome::SkippedNonFile;
        }

        let (excluded, reason) = self.oracle.classify_with_policy(path, policy);
        if excluded {
            debug!(path = %path.display(), ?reason, "scan skipped by exclusion");
            return match reason {
                ExclusionReason::Internal => ScanOutcome::SkippedInternal,
                _ => ScanOutcome::SkippedTemp,
            };
        }

        let matches = match self.engine.match_file(path) {
            Ok(matches) => matches,
            Err(RuleEngineError::NoRules) => return ScanOutcome::NoRules,
            Err(RuleEngineError::Engine(e)) => {
                warn!(path = %path.display(), error = %e, "rule match failed");
                self.telemetry.incr("scan_error");
                return ScanOutcome::YaraError;
            }
        };

        let Some(rule) = matches.first().cloned() else {
            self.telemetry.incr("scan_clean");
            return ScanOutcome::Clean;
        };

        match self.quarantine.quarantine(path, &matches) {
            Ok(quarantined_path) => {
                info!(path = %path.display(), %rule, "match quarantined");
                self.telemetry.incr("scan_match");
                let meta_path = QuarantineStore::meta_path_for(&quarantined_path);
                ScanOutcome::Match {
                    rule,
                    quarantined_path,
                    meta_path,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), %rule, error = %e, "quarantine failed");
                self.telemetry.incr("scan_quarantine_failed");
                ScanOutcome::QuarantineFailed { rule }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
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

    fn scanner_in(root: &Path) -> Scanner {
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
        Scanner::new(
            Arc::new(RuleEngine::compile(&rules_dir)),
            Arc::new(QuarantineStore::new(root.join("quarantine"))),
            oracle,
            Arc::new(Telemetry::new()),
        )
    }

    #[test]
    fn clean_file_passes_through() {
        let dir = tempdir().unwrap();
        let scanner = scanner_in(dir.path());
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"harmless text").unwrap();
        assert!(matches!(
            scanner.scan_file(&file, ExclusionPolicy::Normal),
            ScanOutcome::Clean
        ));
        assert_eq!(scanner.telemetry.get("scan_clean"), 1);
    }

    #[test]
    fn match_is_quarantined() {
        let dir = tempdir().unwrap();
        let scanner = scanner_in(dir.path());
        let file = dir.path().join("dropper.exe");
        std::fs::write(&file, b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE").unwrap();
        match scanner.scan_file(&file, ExclusionPolicy::Normal) {
            ScanOutcome::Match {
                rule,
                quarantined_path,
                meta_path,
            } => {
                assert_eq!(rule, "Eicar_Test");
                assert!(quarantined_path.exists());
                assert!(meta_path.exists());
                assert!(!file.exists());
            }
            other => panic!("expected match, got {other:?}"),
        }
        assert_eq!(scanner.telemetry.get("scan_match"), 1);
    }

    #[test]
    fn internal_path_is_skipped_unless_force_vault() {
        let dir = tempdir().unwrap();
        let scanner = scanner_in(dir.path());
        let vaulted = dir.path().join("app").join("scanvault").join("x.vaulted");
        std::fs::create_dir_all(vaulted.parent().unwrap()).unwrap();
        std::fs::write(&vaulted, b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE").unwrap();

        assert!(matches!(
            scanner.scan_file(&vaulted, ExclusionPolicy::Normal),
            ScanOutcome::SkippedInternal
        ));
        assert!(matches!(
            scanner.scan_file(&vaulted, ExclusionPolicy::ForceVault),
            ScanOutcome::Match { .. }
        ));
    }

    #[test]
    fn missing_path_is_skipped_non_file() {
        let dir = tempdir().unwrap();
        let scanner = scanner_in(dir.path());
        assert!(matches!(
            scanner.scan_file(&dir.path().join("gone.bin"), ExclusionPolicy::Normal),
            ScanOutcome::SkippedNonFile
        ));
    }
}
