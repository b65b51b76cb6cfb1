pub mod error;
pub mod exclusions;
pub mod install_mode;
pub mod paths;
pub mod schedule;
pub mod signature;
pub mod storage;
pub mod telemetry;
pub mod user_exclusions;
