//! Scheduled-scan configuration and due-time evaluation.
//!
//! The config is one JSON document; `last_run` is written before the scan
//! body executes so two evaluator ticks in the same window cannot
//! double-fire. Legacy frequency names from older installs are mapped on
//! load: `weekly` becomes `daily`, `interval` becomes `custom`, anything
//! unknown falls back to `realtime`.

use crate::error::ConfigError;
use crate::storage::{read_json, write_json_atomic};
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_TIME: &str = "02:00";
pub const DEFAULT_INTERVAL_MINUTES: u32 = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFrequency {
    Realtime,
    Hourly,
    TwiceDaily,
    Daily,
    Custom,
}

impl<'de> Deserialize<'de> for ScanFrequency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "realtime" => Self::Realtime,
            "hourly" => Self::Hourly,
            "twice_daily" => Self::TwiceDaily,
            "daily" | "weekly" => Self::Daily,
            "custom" | "interval" => Self::Custom,
            _ => Self::Realtime,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub include_subdirs: bool,
    #[serde(default = "default_frequency")]
    pub frequency: ScanFrequency,
    #[serde(default = "default_interval")]
    pub interval_minutes: u32,
    #[serde(default)]
    pub last_run: Option<DateTime<Local>>,
}

fn default_time() -> String {
    DEFAULT_TIME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_frequency() -> ScanFrequency {
    ScanFrequency::Realtime
}

fn default_interval() -> u32 {
    DEFAULT_INTERVAL_MINUTES
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            time: default_time(),
            paths: Vec::new(),
            include_subdirs: true,
            frequency: default_frequency(),
            interval_minutes: default_interval(),
            last_run: None,
        }
    }
}

impl ScheduleConfig {
    /// `(hour, minute)` parsed from the configured `HH:MM`; malformed values
    /// fall back to 02:00.
    pub fn parsed_time(&self) -> (u32, u32) {
        let mut parts = self.time.splitn(2, ':');
        let hh = parts.next().and_then(|s| s.trim().parse().ok());
        let mm = parts.next().and_then(|s| s.trim().parse().ok());
        match (hh, mm) {
            (Some(h), Some(m)) if h < 24 && m < 60 => (h, m),
            _ => (2, 0),
        }
    }

    /// Due-time evaluation, deterministic from `(self, now)`.
    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        if !self.enabled {
            return false;
        }
        let (hh, mm) = self.parsed_time();
        match self.frequency {
            // The real-time pipeline covers these paths; no batch fires.
            ScanFrequency::Realtime => false,
            ScanFrequency::Hourly => now.minute() == mm && self.last_run_differs(now, "%Y-%m-%d %H"),
            ScanFrequency::TwiceDaily => {
                let alt = (hh + 12) % 24;
                now.minute() == mm
                    && (now.hour() == hh || now.hour() == alt)
                    && self.last_run_differs(now, "%Y-%m-%d %H")
            }
            ScanFrequency::Daily => {
                now.hour() == hh && now.minute() == mm && self.last_run_differs(now, "%Y-%m-%d %H:%M")
            }
            ScanFrequency::Custom => match self.last_run {
                None => true,
                Some(last) => {
                    now.signed_duration_since(last)
                        >= ChronoDuration::minutes(i64::from(self.interval_minutes))
                }
            },
        }
    }

    /// Record the trigger instant. Must be persisted before the scan body
    /// starts, otherwise a second evaluator tick can double-fire.
    pub fn mark_triggered(&mut self, now: DateTime<Local>) {
        self.last_run = Some(now);
    }

    fn last_run_differs(&self, now: DateTime<Local>, granularity: &str) -> bool {
        match self.last_run {
            None => true,
            Some(last) => {
                last.format(granularity).to_string() != now.format(granularity).to_string()
            }
        }
    }
}

pub fn load_schedule(path: &Path) -> ScheduleConfig {
    match read_json::<ScheduleConfig>(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            if path.exists() {
                warn!(error = %e, "failed to load scan schedule, using defaults");
            }
            ScheduleConfig::default()
        }
    }
}

pub fn save_schedule(path: &Path, cfg: &ScheduleConfig) -> Result<(), ConfigError> {
    write_json_atomic(path, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 1, h, m, 0).unwrap()
    }

    fn cfg(frequency: ScanFrequency) -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            time: "02:00".into(),
            frequency,
            ..ScheduleConfig::default()
        }
    }

    #[test]
    fn realtime_never_fires() {
        let c = cfg(ScanFrequency::Realtime);
        assert!(!c.is_due(at(2, 0)));
    }

    #[test]
    fn disabled_never_fires() {
        let mut c = cfg(ScanFrequency::Daily);
        c.enabled = false;
        assert!(!c.is_due(at(2, 0)));
    }

    #[test]
    fn daily_fires_at_configured_minute_once() {
        let mut c = cfg(ScanFrequency::Daily);
        assert!(c.is_due(at(2, 0)));
        assert!(!c.is_due(at(2, 1)));
        assert!(!c.is_due(at(3, 0)));
        // Mark triggered in the same minute: second evaluation is deduped.
        c.mark_triggered(at(2, 0));
        assert!(!c.is_due(at(2, 0)));
        // Next day same minute fires again.
        let next_day = Local.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap();
        assert!(c.is_due(next_day));
    }

    #[test]
    fn hourly_dedups_per_calendar_hour() {
        let mut c = cfg(ScanFrequency::Hourly);
        c.time = "00:30".into();
        assert!(c.is_due(at(5, 30)));
        c.mark_triggered(at(5, 30));
        assert!(!c.is_due(at(5, 30)));
        assert!(c.is_due(at(6, 30)));
        assert!(!c.is_due(at(6, 31)));
    }

    #[test]
    fn twice_daily_fires_at_both_hours() {
        let mut c = cfg(ScanFrequency::TwiceDaily);
        c.time = "02:15".into();
        assert!(c.is_due(at(2, 15)));
        assert!(c.is_due(at(14, 15)));
        assert!(!c.is_due(at(8, 15)));
        c.mark_triggered(at(2, 15));
        assert!(!c.is_due(at(2, 15)));
        assert!(c.is_due(at(14, 15)));
    }

    #[test]
    fn custom_uses_elapsed_interval() {
        let mut c = cfg(ScanFrequency::Custom);
        c.interval_minutes = 30;
        // Never run: fires immediately.
        assert!(c.is_due(at(9, 0)));
        c.mark_triggered(at(9, 0));
        assert!(!c.is_due(at(9, 20)));
        assert!(c.is_due(at(9, 30)));
    }

    #[test]
    fn malformed_time_falls_back() {
        let mut c = cfg(ScanFrequency::Daily);
        c.time = "junk".into();
        assert_eq!(c.parsed_time(), (2, 0));
        assert!(c.is_due(at(2, 0)));
    }

    #[test]
    fn legacy_frequencies_map_on_load() {
        let weekly: ScheduleConfig =
            serde_json::from_str(r#"{"enabled": true, "frequency": "weekly"}"#).unwrap();
        assert_eq!(weekly.frequency, ScanFrequency::Daily);
        let interval: ScheduleConfig =
            serde_json::from_str(r#"{"enabled": true, "frequency": "interval"}"#).unwrap();
        assert_eq!(interval.frequency, ScanFrequency::Custom);
        let unknown: ScheduleConfig =
            serde_json::from_str(r#"{"enabled": true, "frequency": "lunar"}"#).unwrap();
        assert_eq!(unknown.frequency, ScanFrequency::Realtime);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan_schedule.json");
        let mut c = cfg(ScanFrequency::Daily);
        c.paths = vec![PathBuf::from("/docs")];
        c.mark_triggered(at(2, 0));
        save_schedule(&path, &c).unwrap();
        let back = load_schedule(&path);
        assert!(back.enabled);
        assert_eq!(back.frequency, ScanFrequency::Daily);
        assert_eq!(back.paths, vec![PathBuf::from("/docs")]);
        assert!(back.last_run.is_some());
    }

    #[test]
    fn missing_document_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_schedule(&dir.path().join("none.json"));
        assert!(!cfg.enabled);
        assert_eq!(cfg.frequency, ScanFrequency::Realtime);
        assert_eq!(cfg.time, "02:00");
    }
}
