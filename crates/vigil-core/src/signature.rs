//! Content hashing and the capture dedup signature.
//!
//! The signature distinguishes rapid repeat saves of the same file: it mixes
//! size, high-resolution mtime, a prefix of the head-content hash, and a
//! stable hash of the normalized path. The cache holds recently seen
//! signatures for a short TTL so a "save twice" burst produces exactly one
//! vault entry.

use crate::paths::normalize_path;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant, UNIX_EPOCH};

/// Window in which a repeated capture of the same signature is suppressed.
pub const SIGNATURE_TTL: Duration = Duration::from_secs(15);

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming sha256 of a whole file.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn first_64k_hash(path: &Path) -> String {
    let chunk = std::fs::File::open(path)
        .and_then(|f| {
            let mut buf = Vec::with_capacity(64 * 1024);
            f.take(64 * 1024).read_to_end(&mut buf)?;
            Ok(buf)
        })
        .unwrap_or_default();
    if chunk.is_empty() && !path.exists() {
        return "0".repeat(16);
    }
    sha256_hex(&chunk)[..16].to_string()
}

/// Capture dedup signature:
/// `sha256(size | mtime_ns | head_hash[:16] | path_hash[:12])[:32]`.
pub fn scan_signature(path: &Path) -> String {
    let (size, mtime_ns) = match std::fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            (meta.len() as i128, mtime)
        }
        Err(_) => (-1, 0),
    };
    let path_hash = sha256_hex(normalize_path(path).as_bytes())[..12].to_string();
    let head_hash = first_64k_hash(path);
    let raw = format!("{size}|{mtime_ns}|{head_hash}|{path_hash}");
    sha256_hex(raw.as_bytes())[..32].to_string()
}

/// In-memory map of recently captured signatures. Expired entries are purged
/// whenever the cache is consulted.
pub struct SignatureCache {
    ttl: Duration,
    inner: Mutex<HashMap<String, Instant>>,
}

impl SignatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// True if the signature was recorded within the TTL.
    pub fn is_recent(&self, signature: &str) -> bool {
        let mut map = self.inner.lock();
        let now = Instant::now();
        map.retain(|_, seen| now.duration_since(*seen) <= self.ttl);
        map.contains_key(signature)
    }

    pub fn record(&self, signature: String) {
        self.inner.lock().insert(signature, Instant::now());
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(SIGNATURE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn signature_is_stable_for_unchanged_file() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("a.bin");
        std::fs::File::create(&p)
            .unwrap()
            .write_all(b"payload")
            .unwrap();
        assert_eq!(scan_signature(&p), scan_signature(&p));
        assert_eq!(scan_signature(&p).len(), 32);
    }

    #[test]
    fn signature_changes_with_content() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("a.bin");
        std::fs::write(&p, b"one").unwrap();
        let first = scan_signature(&p);
        std::fs::write(&p, b"two-longer").unwrap();
        assert_ne!(first, scan_signature(&p));
    }

    #[test]
    fn cache_expires_entries() {
        let cache = SignatureCache::new(Duration::from_millis(30));
        cache.record("sig".into());
        assert!(cache.is_recent("sig"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!cache.is_recent("sig"));
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("x");
        std::fs::write(&p, b"abc").unwrap();
        assert_eq!(
            sha256_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
