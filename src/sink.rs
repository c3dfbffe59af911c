//! Sink Layer
//!
//! Named time-series sinks the scheduler forwards points to.
//!
//! - [`Sink`]: write contract
//! - [`InfluxSink`]: InfluxDB v1 over HTTP
//! - [`SqliteSink`]: local SQLite table
//! - [`SinkSet`]: sinks by name, built from configuration

mod influx;
mod sqlite;
mod traits;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use influx::{InfluxConfig, InfluxSink, encode_line};
pub use sqlite::{SqliteSink, SqliteSinkConfig};
pub use traits::{Point, Sink, SinkError};

/// Sink settings selected by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    Influx(InfluxConfig),
    Sqlite(SqliteSinkConfig),
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Influx(cfg) => cfg.validate(),
            Self::Sqlite(cfg) => cfg.validate(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Influx(_) => "influx",
            Self::Sqlite(_) => "sqlite",
        }
    }
}

/// Sinks addressed by their configured name.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: HashMap<String, Arc<dyn Sink>>,
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.sinks.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SinkSet").field("sinks", &names).finish()
    }
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured sink.
    pub async fn from_config(configs: &BTreeMap<String, SinkConfig>) -> Result<Self, SinkError> {
        let mut set = Self::new();
        for (name, config) in configs {
            let sink: Arc<dyn Sink> = match config {
                SinkConfig::Influx(cfg) => Arc::new(InfluxSink::new(name, cfg.clone())?),
                SinkConfig::Sqlite(cfg) => Arc::new(SqliteSink::connect(name, cfg).await?),
            };
            tracing::info!(sink = %name, kind = config.kind(), "Sink ready");
            set.insert(sink);
        }
        Ok(set)
    }

    /// Add a sink under its own name, replacing any previous one.
    pub fn insert(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Sink>, SinkError> {
        self.sinks
            .get(name)
            .ok_or_else(|| SinkError::UnknownSink(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Close every sink, logging failures.
    pub async fn close_all(&self) {
        for (name, sink) in &self.sinks {
            if let Err(e) = sink.close().await {
                tracing::warn!(sink = %name, error = %e, "Failed to close sink");
            }
        }
    }
}
