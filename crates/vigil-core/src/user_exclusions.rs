//! User-managed scan exclusions: a persisted denylist of paths and file
//! extensions consulted by the exclusion oracle before any built-in rule.

use crate::paths::{extension_of, is_under, normalize_path};
use crate::storage::{read_json, write_json_atomic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExclusionsDoc {
    #[serde(default)]
    paths: BTreeSet<String>,
    #[serde(default)]
    extensions: BTreeSet<String>,
}

pub struct UserExclusions {
    config_path: PathBuf,
    inner: Mutex<ExclusionsDoc>,
}

impl UserExclusions {
    /// Load from the config document; a missing or unreadable document yields
    /// an empty set rather than an error.
    pub fn load(config_path: PathBuf) -> Self {
        let doc = match read_json::<ExclusionsDoc>(&config_path) {
            Ok(doc) => doc,
            Err(e) => {
                if config_path.exists() {
                    warn!(error = %e, "failed to load user exclusions, starting empty");
                }
                ExclusionsDoc::default()
            }
        };
        Self {
            config_path,
            inner: Mutex::new(doc),
        }
    }

    fn save_locked(&self, doc: &ExclusionsDoc) {
        if let Err(e) = write_json_atomic(&self.config_path, doc) {
            warn!(error = %e, "failed to save user exclusions");
        }
    }

    /// Add a path exclusion. Only paths that currently exist are accepted.
    pub fn add_path(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        let normalized = normalize_path(path);
        let mut doc = self.inner.lock();
        doc.paths.insert(normalized);
        self.save_locked(&doc);
        true
    }

    pub fn remove_path(&self, path: &Path) -> bool {
        let normalized = normalize_path(path);
        let mut doc = self.inner.lock();
        let removed = doc.paths.remove(&normalized);
        if removed {
            self.save_locked(&doc);
        }
        removed
    }

    /// Add an extension exclusion, e.g. `iso` or `.ISO` both become `.iso`.
    pub fn add_extension(&self, ext: &str) -> bool {
        let ext = normalize_extension(ext);
        if ext == "." {
            return false;
        }
        let mut doc = self.inner.lock();
        doc.extensions.insert(ext);
        self.save_locked(&doc);
        true
    }

    pub fn remove_extension(&self, ext: &str) -> bool {
        let ext = normalize_extension(ext);
        let mut doc = self.inner.lock();
        let removed = doc.extensions.remove(&ext);
        if removed {
            self.save_locked(&doc);
        }
        removed
    }

    /// True if the path's extension is excluded or the path equals/lives
    /// under an excluded path.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let normalized = normalize_path(path);
        let ext = extension_of(path);
        let doc = self.inner.lock();
        if !ext.is_empty() && doc.extensions.contains(&ext) {
            return true;
        }
        doc.paths.iter().any(|root| is_under(&normalized, root))
    }

    pub fn excluded_paths(&self) -> Vec<String> {
        self.inner.lock().paths.iter().cloned().collect()
    }

    pub fn excluded_extensions(&self) -> Vec<String> {
        self.inner.lock().extensions.iter().cloned().collect()
    }

    pub fn clear_all(&self) {
        let mut doc = self.inner.lock();
        doc.paths.clear();
        doc.extensions.clear();
        self.save_locked(&doc);
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_path_requires_existence() {
        let dir = tempdir().unwrap();
        let store = UserExclusions::load(dir.path().join("excl.json"));
        assert!(!store.add_path(&dir.path().join("missing")));
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        assert!(store.add_path(&real));
        assert!(store.is_excluded(&real.join("inner.txt")));
    }

    #[test]
    fn extensions_are_normalized() {
        let dir = tempdir().unwrap();
        let store = UserExclusions::load(dir.path().join("excl.json"));
        assert!(store.add_extension("ISO"));
        assert_eq!(store.excluded_extensions(), vec![".iso".to_string()]);
        assert!(store.is_excluded(Path::new("/x/y/image.iso")));
        assert!(!store.is_excluded(Path::new("/x/y/image.img")));
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("excl.json");
        let target = dir.path().join("t");
        std::fs::create_dir(&target).unwrap();
        {
            let store = UserExclusions::load(config.clone());
            store.add_path(&target);
            store.add_extension(".mp4");
        }
        let store = UserExclusions::load(config);
        assert!(store.is_excluded(&target));
        assert!(store.is_excluded(Path::new("/a/b.mp4")));
    }

    #[test]
    fn remove_updates_membership() {
        let dir = tempdir().unwrap();
        let store = UserExclusions::load(dir.path().join("excl.json"));
        store.add_extension(".iso");
        assert!(store.remove_extension("iso"));
        assert!(!store.is_excluded(Path::new("/x.iso")));
        assert!(!store.remove_extension(".iso"));
    }
}
