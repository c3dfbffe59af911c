//! Sink contract and the point type forwarded to it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while writing points.
#[derive(Debug, Error)]
pub enum SinkError {
    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-success status.
    #[error("write rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// The point cannot be represented by the sink.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid sink settings.
    #[error("config error: {0}")]
    Config(String),

    /// A metric references a sink that does not exist.
    #[error("unknown sink '{0}'")]
    UnknownSink(String),
}

/// A single timestamped, tagged, field-valued record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Time-series sink.
///
/// Implementations must be safe to share; the scheduler holds them behind
/// `Arc<dyn Sink>` and writes one point at a time.
#[async_trait::async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Configured sink name.
    fn name(&self) -> &str;

    /// Write one point.
    async fn write(&self, point: &Point) -> Result<(), SinkError>;

    /// Release resources. Called once on shutdown.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
