//! Typed errors crossing component boundaries.
//!
//! Components never panic across their boundary: every failure is either one
//! of these variants or logged and swallowed when it only concerns a
//! best-effort side channel (telemetry, notifications, history sidecars).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("file no longer exists: {0}")]
    FileGone(PathBuf),
    #[error("move failed after {attempts} attempts: {source}")]
    MoveFailed {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata write failed: {0}")]
    MetaWriteFailed(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("file no longer exists: {0}")]
    SourceMissing(PathBuf),
    #[error("move failed after {attempts} attempts: {source}")]
    MoveFailed {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}
