//! Metric catalog.
//!
//! The catalog is the fixed set of metric definitions the scheduler runs.
//! It is built once at startup from the main config file plus an optional
//! include directory, validated as a whole, and never mutated afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::config::ConfigError;
use crate::credential::CredentialKey;
use crate::scheduler::interval_duration;

/// Longest interval a metric may be scheduled with (ten years).
pub const MAX_INTERVAL: Duration = Duration::from_secs(10 * 52 * 604_800);

fn default_enabled() -> bool {
    true
}

/// Unit of a metric's interval magnitude.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl IntervalUnit {
    /// Number of seconds in one unit.
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3_600,
            Self::Days => 86_400,
            Self::Weeks => 604_800,
        }
    }
}

/// A single configured metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Unique metric identifier.
    pub id: String,
    /// Measurement name written to the sink.
    pub measurement: String,
    /// Human-readable text sent as the `description` tag.
    #[serde(default)]
    pub description: String,
    /// Credential used to run the query (`user@source`).
    pub login: CredentialKey,
    /// Name of the sink the points are forwarded to.
    pub sink: String,
    /// Interval magnitude, must be positive.
    pub interval: u64,
    /// Interval unit.
    pub unit: IntervalUnit,
    /// Query text; the first column of every row is the forwarded value.
    pub query: String,
    /// Disabled metrics are dropped when the catalog is built.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-metric query deadline, overriding the scheduler default.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Extra static tags added to every point.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricDefinition {
    /// Create an enabled definition with no extra tags.
    pub fn new(
        id: impl Into<String>,
        measurement: impl Into<String>,
        login: CredentialKey,
        sink: impl Into<String>,
        interval: u64,
        unit: IntervalUnit,
        query: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            measurement: measurement.into(),
            description: String::new(),
            login,
            sink: sink.into(),
            interval,
            unit,
            query: query.into(),
            enabled: true,
            timeout: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Interval as a duration.
    pub fn interval_duration(&self) -> Duration {
        interval_duration(self.interval, self.unit)
    }

    /// Validate a single definition.
    pub fn validate(&self) -> Result<(), String> {
        if self.measurement.trim().is_empty() {
            return Err("measurement cannot be empty".to_string());
        }
        if self.sink.trim().is_empty() {
            return Err("sink cannot be empty".to_string());
        }
        if self.query.trim().is_empty() {
            return Err("query cannot be empty".to_string());
        }
        if self.interval == 0 {
            return Err("interval must be positive".to_string());
        }
        let too_long = self
            .interval
            .checked_mul(self.unit.seconds())
            .is_none_or(|secs| secs > MAX_INTERVAL.as_secs());
        if too_long {
            return Err(format!(
                "interval {} {} exceeds the maximum of {}",
                self.interval,
                self.unit,
                humantime::format_duration(MAX_INTERVAL)
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err("timeout must be positive".to_string());
        }
        Ok(())
    }
}

/// Metric definitions as they appear in an include file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsFile {
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

impl MetricsFile {
    /// Load and merge metric definitions from every YAML file in a directory.
    ///
    /// Files are read in file-name order so the resulting catalog order is
    /// stable across runs.
    pub fn load_from_dir(dir_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir_path.as_ref();
        if !dir.exists() {
            return Err(ConfigError::invalid(format!(
                "metric_path '{}' does not exist",
                dir.display()
            )));
        }
        if !dir.is_dir() {
            return Err(ConfigError::invalid(format!(
                "metric_path '{}' is not a directory",
                dir.display()
            )));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext == "yaml" || ext == "yml" {
                paths.push(path);
            }
        }
        paths.sort();

        let mut merged = Self::default();
        for path in paths {
            tracing::debug!("Loading metric definitions from: {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            let file: Self = serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::invalid(format!("failed to parse '{}': {}", path.display(), e))
            })?;
            merged.metrics.extend(file.metrics);
        }

        Ok(merged)
    }
}

/// Validated, ordered set of enabled metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    metrics: Vec<MetricDefinition>,
}

impl MetricCatalog {
    /// Build a catalog, dropping disabled metrics.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` for an empty or duplicate id or
    /// any invalid definition. Disabled metrics are validated too.
    pub fn new(definitions: Vec<MetricDefinition>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for def in &definitions {
            if def.id.trim().is_empty() {
                return Err(ConfigError::invalid("metric id cannot be empty"));
            }
            if !seen.insert(def.id.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate metric id: '{}'",
                    def.id
                )));
            }
            def.validate()
                .map_err(|e| ConfigError::invalid(format!("metric '{}': {}", def.id, e)))?;
        }

        let metrics = definitions
            .into_iter()
            .filter(|def| {
                if !def.enabled {
                    tracing::debug!(metric = %def.id, "Skipping disabled metric");
                }
                def.enabled
            })
            .collect();

        Ok(Self { metrics })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.iter()
    }

    pub fn get(&self, id: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|def| def.id == id)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Shortest configured interval, if any metric is present.
    pub fn smallest_interval(&self) -> Option<Duration> {
        self.metrics
            .iter()
            .map(MetricDefinition::interval_duration)
            .min()
    }
}
