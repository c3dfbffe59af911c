//! Configuration module for dbmon.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Scheduler settings (tick, query/connect/shutdown timeouts, reconnect cooldown)
//! - Data sources and the credentials that log into them
//! - Sinks (InfluxDB, SQLite)
//! - Metric definitions, inline or from an include directory

mod app;
mod validation;

pub use app::{AppConfig, SchedulerConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration};

// Re-export constants
pub use app::{DEFAULT_QUERY_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TICK};
