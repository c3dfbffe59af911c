//! Application configuration structures.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{MetricCatalog, MetricDefinition, MetricsFile};
use crate::connection::ReconnectPolicy;
use crate::credential::{CredentialConfig, CredentialKey};
use crate::sink::SinkConfig;
use crate::source::SourceConfig;

use super::validation::ConfigError;

// =============================================================================
// Constants
// =============================================================================

/// Default scheduler tick (1 second).
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default per-query deadline (30 seconds).
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect deadline (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = crate::connection::DEFAULT_CONNECT_TIMEOUT;

/// Default time allowed for releasing connections on shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn default_tick() -> Duration {
    DEFAULT_TICK
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

// =============================================================================
// Scheduler Configuration
// =============================================================================

/// Loop timing and connection behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick period of the loop (default: 1s).
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,

    /// Deadline for a single query unless the metric sets its own (default: 30s).
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Deadline for opening a connection (default: 10s).
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Deadline for closing connections on shutdown (default: 5s).
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Cooldown before a failed credential may be tried again.
    /// Unset means a failed credential is never retried.
    #[serde(default, with = "humantime_serde")]
    pub reconnect_after: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            reconnect_after: None,
        }
    }
}

impl SchedulerConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_cooldown(self.reconnect_after)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("tick", self.tick),
            ("query_timeout", self.query_timeout),
            ("connect_timeout", self.connect_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(format!(
                    "scheduler {name} must be positive"
                )));
            }
        }
        if self.reconnect_after.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid(
                "scheduler reconnect_after must be positive",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Data sources by name; the name is the part after `@` in a login.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,

    /// Passwords keyed by `user@source`.
    #[serde(default)]
    pub credentials: BTreeMap<CredentialKey, CredentialConfig>,

    /// Sinks by name.
    #[serde(default)]
    pub sinks: BTreeMap<String, SinkConfig>,

    /// Inline metric definitions.
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,

    /// Path to a directory with additional metric definition files.
    #[serde(default)]
    pub metric_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// Metric definitions found under `metric_path` are appended after the
    /// inline ones before validation.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_yaml::from_str(&content)?;

        if let Some(ref metric_dir) = config.metric_path {
            let additional = MetricsFile::load_from_dir(metric_dir)?;
            tracing::debug!(
                path = %metric_dir,
                count = additional.metrics.len(),
                "Loaded metric include directory"
            );
            config.metrics.extend(additional.metrics);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values and cross-references.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;

        for (name, source) in &self.sources {
            source
                .validate()
                .map_err(|e| ConfigError::invalid(format!("source '{name}': {e}")))?;
        }

        for key in self.credentials.keys() {
            if !self.sources.contains_key(key.source()) {
                return Err(ConfigError::invalid(format!(
                    "credential '{key}' references unknown source '{}'",
                    key.source()
                )));
            }
        }

        for (name, sink) in &self.sinks {
            sink.validate()
                .map_err(|e| ConfigError::invalid(format!("sink '{name}': {e}")))?;
        }

        let catalog = self.catalog()?;
        for metric in catalog.iter() {
            if !self.credentials.contains_key(&metric.login) {
                return Err(ConfigError::invalid(format!(
                    "metric '{}': no credential for login '{}'",
                    metric.id, metric.login
                )));
            }
            if !self.sinks.contains_key(&metric.sink) {
                return Err(ConfigError::invalid(format!(
                    "metric '{}': unknown sink '{}'",
                    metric.id, metric.sink
                )));
            }
        }

        if let Some(smallest) = catalog.smallest_interval()
            && self.scheduler.tick >= smallest
        {
            tracing::warn!(
                tick = ?self.scheduler.tick,
                smallest_interval = ?smallest,
                "Scheduler tick is not finer than the smallest metric interval; runs will be late"
            );
        }

        Ok(())
    }

    /// Build the metric catalog (enabled metrics only, in file order).
    pub fn catalog(&self) -> Result<MetricCatalog, ConfigError> {
        MetricCatalog::new(self.metrics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IntervalUnit;

    const SAMPLE: &str = r#"
scheduler:
  tick: 500ms
  query_timeout: 20s
  reconnect_after: 5m

sources:
  bscsrep:
    url: postgres://10.95.14.20:5432/bscsrep

credentials:
  sysadm@bscsrep:
    password: ${DBMON_TEST_UNSET_PASSWORD:-secret}

sinks:
  dbmon:
    kind: influx
    url: http://10.95.14.58:8086
    database: dbmon

metrics:
  - id: cchourdata80
    measurement: CCHOURDATA80
    description: 80% Cost Control Data in last hour
    login: sysadm@bscsrep
    sink: dbmon
    interval: 10
    unit: minutes
    query: select count(1) from cost_control
  - id: disabled
    measurement: DISABLED
    login: sysadm@bscsrep
    sink: dbmon
    interval: 1
    unit: hours
    query: select 1
    enabled: false
"#;

    fn sample() -> AppConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick, DEFAULT_TICK);
        assert_eq!(config.query_timeout, DEFAULT_QUERY_TIMEOUT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::Never);
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();
        assert_eq!(config.scheduler.tick, Duration::from_millis(500));
        assert_eq!(config.scheduler.query_timeout, Duration::from_secs(20));
        assert_eq!(config.scheduler.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(
            config.scheduler.reconnect_policy(),
            ReconnectPolicy::After(Duration::from_secs(300))
        );
        assert_eq!(config.metrics.len(), 2);
        assert_eq!(config.metrics[0].unit, IntervalUnit::Minutes);
        assert!(config.validate().is_ok());

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("disabled").is_none());
    }

    #[test]
    fn test_validation_unknown_sink() {
        let mut config = sample();
        config.metrics[0].sink = "graphite".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown sink 'graphite'"), "{err}");
    }

    #[test]
    fn test_validation_missing_credential() {
        let mut config = sample();
        config.metrics[0].login = CredentialKey::parse("other@bscsrep").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("no credential for login 'other@bscsrep'"), "{err}");
    }

    #[test]
    fn test_validation_credential_unknown_source() {
        let mut config = sample();
        config.sources.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown source 'bscsrep'"), "{err}");
    }

    #[test]
    fn test_validation_zero_tick() {
        let mut config = sample();
        config.scheduler.tick = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_unit_is_parse_error() {
        let yaml = SAMPLE.replace("unit: minutes", "unit: fortnights");
        assert!(serde_yaml::from_str::<AppConfig>(&yaml).is_err());
    }

    #[test]
    fn test_load_with_metric_path() {
        let dir = tempfile::tempdir().unwrap();
        let metric_dir = dir.path().join("metrics.d");
        std::fs::create_dir(&metric_dir).unwrap();
        std::fs::write(
            metric_dir.join("extra.yaml"),
            r#"
metrics:
  - id: extra
    measurement: EXTRA
    login: sysadm@bscsrep
    sink: dbmon
    interval: 30
    unit: seconds
    query: select 2
"#,
        )
        .unwrap();
        std::fs::write(metric_dir.join("notes.txt"), "ignored").unwrap();

        let main = format!("{SAMPLE}\nmetric_path: {}\n", metric_dir.display());
        let path = dir.path().join("dbmon.yaml");
        std::fs::write(&path, main).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.metrics.len(), 3);
        let catalog = config.catalog().unwrap();
        let ids: Vec<&str> = catalog.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["cchourdata80", "extra"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load("/nonexistent/dbmon.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
