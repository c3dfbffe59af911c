//! dbmon - Database Metric Scheduler
//!
//! Runs metric queries against relational databases on per-metric intervals
//! and forwards every result row as a timestamped point to a time-series
//! sink. It can be used as a library, or run as the `dbmon` binary.
//!
//! # Architecture
//!
//! - **Catalog**: validated metric definitions, loaded once at startup
//! - **Scheduler**: per-metric job tracking and the single orchestration loop
//! - **Connection**: one lazily opened connection per credential, with health tracking
//! - **Source**: query execution through `sqlx` (PostgreSQL, MySQL, SQLite)
//! - **Sink**: InfluxDB line protocol over HTTP, or a local SQLite table
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dbmon::{AppConfig, ConnectionRegistry, CredentialStore, Orchestrator, SinkSet, SqlSource};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load("configs/dbmon.yaml")?;
//! let source = Arc::new(SqlSource::new(config.sources.clone()));
//! let registry = ConnectionRegistry::new(source, CredentialStore::from_config(&config.credentials));
//! let sinks = SinkSet::from_config(&config.sinks).await?;
//!
//! let mut orchestrator = Orchestrator::new(config.catalog()?, registry, sinks, CancellationToken::new());
//! orchestrator.run().await;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod connection;
pub mod credential;
pub mod scheduler;
pub mod sink;
pub mod source;

pub use catalog::{IntervalUnit, MetricCatalog, MetricDefinition};
pub use config::{AppConfig, ConfigError};
pub use connection::{ConnectionError, ConnectionRegistry, ReconnectPolicy};
pub use credential::{Credential, CredentialKey, CredentialStore};
pub use scheduler::{JobTracker, Orchestrator, OrchestratorOptions, TickReport};
pub use sink::{InfluxSink, Point, Sink, SinkError, SinkSet, SqliteSink};
pub use source::{DataSource, QueryError, Row, SqlSource};
