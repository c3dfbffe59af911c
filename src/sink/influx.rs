//! InfluxDB v1 HTTP sink.
//!
//! Points are encoded as line protocol with nanosecond timestamps and
//! posted to `/write?db=<database>&precision=ns`.

use std::fmt::Write as _;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::expand_env_vars;
use crate::sink::{Point, Sink, SinkError};

/// Default request timeout (10 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum response body length kept in error messages.
const MAX_ERROR_BODY: usize = 512;

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Configuration for an InfluxDB v1 sink.
#[derive(Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://10.95.14.58:8086`.
    pub url: String,
    /// Target database.
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Password; `${VAR}` expansion applies.
    #[serde(default)]
    pub password: Option<String>,
    /// Request timeout (default: 10s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl std::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl InfluxConfig {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            username: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| format!("invalid url '{}': {}", self.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("url '{}' must be http or https", self.url));
        }
        if self.database.trim().is_empty() {
            return Err("database cannot be empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be positive".to_string());
        }
        Ok(())
    }
}

/// Writes points to InfluxDB over HTTP.
pub struct InfluxSink {
    name: String,
    config: InfluxConfig,
    write_url: String,
    /// Password with `${VAR}` references already expanded.
    password: Option<String>,
    client: Client,
}

impl std::fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxSink")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InfluxSink {
    pub fn new(name: impl Into<String>, config: InfluxConfig) -> Result<Self, SinkError> {
        config.validate().map_err(SinkError::Config)?;
        let client = Client::builder().timeout(config.timeout).build()?;
        let write_url = format!("{}/write", config.url.trim_end_matches('/'));
        let password = config.password.as_deref().map(expand_env_vars);

        Ok(Self {
            name: name.into(),
            config,
            write_url,
            password,
            client,
        })
    }
}

#[async_trait::async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, point: &Point) -> Result<(), SinkError> {
        let line = encode_line(point)?;
        tracing::debug!(sink = %self.name, line = %line, "Writing point");

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.config.database.as_str()), ("precision", "ns")])
            .body(line);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Encode a point as one line of InfluxDB line protocol.
///
/// Tags with empty values are omitted since InfluxDB rejects them.
pub fn encode_line(point: &Point) -> Result<String, SinkError> {
    if point.measurement.is_empty() {
        return Err(SinkError::Encoding("measurement cannot be empty".to_string()));
    }
    if point.fields.is_empty() {
        return Err(SinkError::Encoding(format!(
            "point '{}' has no fields",
            point.measurement
        )));
    }

    let mut line = escape(&point.measurement, &[',', ' ']);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        let _ = write!(
            line,
            ",{}={}",
            escape(key, &[',', '=', ' ']),
            escape(value, &[',', '=', ' '])
        );
    }

    let mut separator = ' ';
    for (key, value) in &point.fields {
        if !value.is_finite() {
            return Err(SinkError::Encoding(format!(
                "field '{}' of '{}' is not finite: {}",
                key, point.measurement, value
            )));
        }
        let _ = write!(line, "{separator}{}={}", escape(key, &[',', '=', ' ']), value);
        separator = ',';
    }

    let nanos = point.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        SinkError::Encoding(format!("timestamp {} out of range", point.timestamp))
    })?;
    let _ = write!(line, " {nanos}");
    Ok(line)
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        if c == '\n' {
            out.push_str("\\n");
            continue;
        }
        out.push(c);
    }
    out
}
