//! File-move plumbing shared by the vault and quarantine stores.
//!
//! Windows writers hold transient sharing locks around close, so every move
//! out of a live directory runs under a bounded-backoff retry loop. The
//! schedules are exposed as constants on the callers so tests can reason
//! about worst-case durations.

use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub(crate) enum MoveError {
    /// Source disappeared before a successful move.
    SourceMissing,
    /// All attempts failed; carries the last I/O error.
    Io {
        attempts: u32,
        source: std::io::Error,
    },
}

/// Rename, falling back to copy-then-delete for cross-device moves.
pub(crate) fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            let _ = std::fs::remove_file(from);
            Ok(())
        }
    }
}

/// Move with retries: `attempts` tries, sleeping `backoff` between failures,
/// multiplying by `factor` up to `cap`. A source that vanishes mid-retry is
/// reported as [`MoveError::SourceMissing`].
pub(crate) fn move_with_retries(
    from: &Path,
    to: &Path,
    attempts: u32,
    backoff: Duration,
    cap: Duration,
    factor: f64,
) -> Result<(), MoveError> {
    let mut delay = backoff;
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..attempts {
        if !from.exists() {
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }
        match move_file(from, to) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    std::thread::sleep(delay);
                    delay = delay.mul_f64(factor).min(cap);
                }
            }
        }
    }
    match last_err {
        Some(source) if from.exists() => Err(MoveError::Io { attempts, source }),
        _ => Err(MoveError::SourceMissing),
    }
}
