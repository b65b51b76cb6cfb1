//! Atomic persistence for config documents.
//!
//! Documents are written to a temp file in the destination directory and
//! renamed into place, so readers never observe a half-written document.

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_err)?;
    let json = serde_json::to_string_pretty(value).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
    std::fs::write(tmp.path(), json.as_bytes()).map_err(io_err)?;
    tmp.persist(path)
        .map_err(|e| io_err(e.error))
        .map(|_| ())
}
