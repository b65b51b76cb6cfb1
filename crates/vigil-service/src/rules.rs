//! Rule engine: compiles a tree of YARA rule files and matches single files
//! with a hard timeout.
//!
//! Every `.yar` file under the rules root is validated individually first so
//! one broken rule never blocks the rest; the surviving set is then compiled
//! together into one ruleset. Compilation happens once at process start.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Hard ceiling for a single file match.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RuleEngineError {
    #[error("no rules loaded")]
    NoRules,
    #[error("rule engine failure: {0}")]
    Engine(String),
}

pub struct RuleEngine {
    rules: Option<yara_x::Rules>,
    timeout: Duration,
}

impl RuleEngine {
    /// Walk `rule_root`, compile every valid `.yar` file into one ruleset.
    /// Individual compile failures are logged and skipped, never fatal; an
    /// empty or missing tree yields an engine with no rules loaded.
    pub fn compile(rule_root: &Path) -> Self {
        let mut sources: Vec<(PathBuf, String)> = Vec::new();
        let mut failed = 0usize;

        for entry in WalkDir::new(rule_root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().map(|e| e == "yar") != Some(true) {
                continue;
            }
            let src = match std::fs::read_to_string(path) {
                Ok(src) => src,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read rule file");
                    failed += 1;
                    continue;
                }
            };
            // Probe-compile the file alone so a broken rule is skipped
            // without poisoning the combined set.
            let mut probe = yara_x::Compiler::new();
            if let Err(e) = probe.add_source(src.as_str()) {
                warn!(path = %path.display(), error = %e, "skipping invalid rule file");
                failed += 1;
                continue;
            }
            sources.push((path.to_path_buf(), src));
        }

        if sources.is_empty() {
            warn!(root = %rule_root.display(), failed, "no valid rule files found");
            return Self {
                rules: None,
                timeout: SCAN_TIMEOUT,
            };
        }

        let mut compiler = yara_x::Compiler::new();
        let mut compiled = 0usize;
        for (path, src) in &sources {
            match compiler.add_source(src.as_str()) {
                Ok(_) => compiled += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "rule rejected from combined set");
                    failed += 1;
                }
            }
        }
        let rules = compiler.build();
        info!(compiled, failed, "compiled rule files");
        Self {
            rules: Some(rules),
            timeout: SCAN_TIMEOUT,
        }
    }

    /// An engine with no rules; every match attempt reports `NoRules`.
    pub fn empty() -> Self {
        Self {
            rules: None,
            timeout: SCAN_TIMEOUT,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.rules.is_some()
    }

    /// Match a single file, returning the identifiers of every matching rule.
    /// Engine failures (unreadable file, timeout) are typed distinctly from
    /// "no matches".
    pub fn match_file(&self, path: &Path) -> Result<Vec<String>, RuleEngineError> {
        let rules = self.rules.as_ref().ok_or(RuleEngineError::NoRules)?;
        let mut scanner = yara_x::Scanner::new(rules);
        scanner.set_timeout(self.timeout);
        let results = scanner
            .scan_file(path)
            .map_err(|e| RuleEngineError::Engine(e.to_string()))?;
        Ok(results
            .matching_rules()
            .map(|r| r.identifier().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const EICAR_RULE: &str = r#"
rule Eicar_Test {
    strings:
        $marker = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE"
    condition:
        $marker
}
"#;

    #[test]
    fn compiles_rules_and_matches() {
        let dir = tempdir().unwrap();
        let rules_dir = dir.path().join("rules").join("test");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(rules_dir.join("eicar.yar"), EICAR_RULE).unwrap();

        let engine = RuleEngine::compile(&dir.path().join("rules"));
        assert!(engine.is_loaded());

        let hot = dir.path().join("sample.exe");
        std::fs::write(&hot, b"xx EICAR-STANDARD-ANTIVIRUS-TEST-FILE xx").unwrap();
        assert_eq!(engine.match_file(&hot).unwrap(), vec!["Eicar_Test"]);

        let clean = dir.path().join("clean.txt");
        std::fs::write(&clean, b"nothing to see").unwrap();
        assert!(engine.match_file(&clean).unwrap().is_empty());
    }

    #[test]
    fn broken_rule_file_does_not_block_the_rest() {
        let dir = tempdir().unwrap();
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(rules_dir.join("good.yar"), EICAR_RULE).unwrap();
        std::fs::write(rules_dir.join("broken.yar"), "rule { this is not yara").unwrap();

        let engine = RuleEngine::compile(&rules_dir);
        assert!(engine.is_loaded());
        let hot = dir.path().join("x.bin");
        std::fs::write(&hot, b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE").unwrap();
        assert_eq!(engine.match_file(&hot).unwrap(), vec!["Eicar_Test"]);
    }

    #[test]
    fn empty_tree_yields_no_rules() {
        let dir = tempdir().unwrap();
        let engine = RuleEngine::compile(dir.path());
        assert!(!engine.is_loaded());
        assert!(matches!(
            engine.match_file(Path::new("/nope")),
            Err(RuleEngineError::NoRules)
        ));
    }

    #[test]
    fn missing_file_is_engine_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("r.yar"), EICAR_RULE).unwrap();
        let engine = RuleEngine::compile(dir.path());
        assert!(matches!(
            engine.match_file(&dir.path().join("gone.bin")),
            Err(RuleEngineError::Engine(_))
        ));
    }
}
