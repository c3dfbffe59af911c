//! SQLite sink using sqlx.
//!
//! Stores points in a local `points` table. Useful when no InfluxDB is
//! reachable, for development, and as a test double with real storage.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::sink::{Point, Sink, SinkError};

/// Default maximum connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default connection acquire timeout.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Schema for the points table.
///
/// Tags and fields are stored as JSON objects; `ts` is Unix nanoseconds.
const POINTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS points (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ts          INTEGER NOT NULL,
    measurement TEXT NOT NULL,
    tags        TEXT NOT NULL DEFAULT '{}',
    fields      TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_points_measurement_ts ON points (measurement, ts);
"#;

/// Configuration for a SQLite sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSinkConfig {
    /// Database file path, or a full `sqlite:` URL such as `sqlite::memory:`.
    pub path: String,
}

impl SqliteSinkConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite:{}", self.path)
        }
    }

    fn is_memory(&self) -> bool {
        self.path.contains(":memory:")
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.path.trim().is_empty() {
            return Err("path cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Writes points into a local SQLite database.
#[derive(Clone)]
pub struct SqliteSink {
    name: String,
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSink")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SqliteSink {
    /// Open (creating if needed) the database and initialize the schema.
    ///
    /// Uses WAL journal mode with normal synchronous mode. In-memory
    /// databases are limited to a single connection so every write and read
    /// sees the same database.
    pub async fn connect(name: impl Into<String>, config: &SqliteSinkConfig) -> Result<Self, SinkError> {
        config.validate().map_err(SinkError::Config)?;

        if !config.path.starts_with("sqlite:")
            && let Some(parent) = Path::new(&config.path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SinkError::Config(format!(
                    "failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&config.url())?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let max_connections = if config.is_memory() {
            1
        } else {
            DEFAULT_MAX_CONNECTIONS
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(POINTS_TABLE_DDL).execute(&pool).await?;

        Ok(Self {
            name: name.into(),
            pool,
        })
    }

    /// Number of stored points, optionally for one measurement.
    pub async fn count(&self, measurement: Option<&str>) -> Result<i64, SinkError> {
        let count: i64 = match measurement {
            Some(m) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM points WHERE measurement = ?")
                    .bind(m)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM points")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    /// Most recent points of a measurement, newest first.
    pub async fn recent(&self, measurement: &str, limit: u32) -> Result<Vec<Point>, SinkError> {
        let rows = sqlx::query(
            "SELECT ts, measurement, tags, fields FROM points \
             WHERE measurement = ? ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(measurement)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Point, SinkError> {
                let ts: i64 = row.try_get("ts")?;
                let tags: String = row.try_get("tags")?;
                let fields: String = row.try_get("fields")?;
                Ok(Point {
                    measurement: row.try_get("measurement")?,
                    tags: serde_json::from_str::<BTreeMap<String, String>>(&tags)?,
                    timestamp: DateTime::<Utc>::from_timestamp_nanos(ts),
                    fields: serde_json::from_str::<BTreeMap<String, f64>>(&fields)?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Sink for SqliteSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, point: &Point) -> Result<(), SinkError> {
        let ts = point.timestamp.timestamp_nanos_opt().ok_or_else(|| {
            SinkError::Encoding(format!("timestamp {} out of range", point.timestamp))
        })?;
        if let Some((key, value)) = point.fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SinkError::Encoding(format!(
                "field '{}' of '{}' is not finite: {}",
                key, point.measurement, value
            )));
        }
        let tags = serde_json::to_string(&point.tags)?;
        let fields = serde_json::to_string(&point.fields)?;

        sqlx::query("INSERT INTO points (ts, measurement, tags, fields) VALUES (?, ?, ?, ?)")
            .bind(ts)
            .bind(&point.measurement)
            .bind(tags)
            .bind(fields)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(value: f64, secs: i64) -> Point {
        Point::new("CCHOURDATA100", Utc.timestamp_opt(secs, 0).unwrap())
            .with_tag("database", "bscsrep")
            .with_field("value", value)
    }

    #[tokio::test]
    async fn test_sqlite_sink_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("points.db");
        let config = SqliteSinkConfig::new(path.to_string_lossy());

        let sink = SqliteSink::connect("local", &config).await.unwrap();
        sink.write(&point(1.0, 100)).await.unwrap();
        sink.write(&point(2.0, 200)).await.unwrap();

        assert_eq!(sink.count(None).await.unwrap(), 2);
        assert_eq!(sink.count(Some("other")).await.unwrap(), 0);

        let recent = sink.recent("CCHOURDATA100", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], point(2.0, 200));
        assert_eq!(recent[1].fields.get("value"), Some(&1.0));

        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_sink_rejects_non_finite_value() {
        let sink = SqliteSink::connect("mem", &SqliteSinkConfig::new("sqlite::memory:"))
            .await
            .unwrap();

        let err = sink.write(&point(f64::NAN, 1)).await.unwrap_err();
        assert!(matches!(err, SinkError::Encoding(_)), "{err}");
        assert!(matches!(
            sink.write(&point(f64::INFINITY, 2)).await,
            Err(SinkError::Encoding(_))
        ));

        sink.write(&point(1.0, 3)).await.unwrap();
        let recent = sink.recent("CCHOURDATA100", 10).await.unwrap();
        assert_eq!(recent, vec![point(1.0, 3)]);
        assert_eq!(sink.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_sink_in_memory() {
        let sink = SqliteSink::connect("mem", &SqliteSinkConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        assert_eq!(sink.name(), "mem");

        sink.write(&point(5.0, 1)).await.unwrap();
        assert_eq!(sink.count(Some("CCHOURDATA100")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_sink_keeps_duplicate_values() {
        let sink = SqliteSink::connect("mem", &SqliteSinkConfig::new("sqlite::memory:"))
            .await
            .unwrap();

        // Same value twice, different timestamps: both are kept.
        sink.write(&point(7.0, 10)).await.unwrap();
        sink.write(&point(7.0, 11)).await.unwrap();
        let recent = sink.recent("CCHOURDATA100", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_ne!(recent[0].timestamp, recent[1].timestamp);
    }

    #[test]
    fn test_config_url() {
        assert_eq!(SqliteSinkConfig::new("data/dbmon.db").url(), "sqlite:data/dbmon.db");
        assert_eq!(
            SqliteSinkConfig::new("sqlite::memory:").url(),
            "sqlite::memory:"
        );
        assert!(SqliteSinkConfig::new("").validate().is_err());
    }
}
