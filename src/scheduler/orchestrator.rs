//! Orchestration loop.
//!
//! One cooperative loop walks the catalog on every tick. A due metric
//! acquires its credential's connection, runs its query under a deadline and
//! forwards every row to its sink. Metrics never run concurrently, so the
//! connection handed out by the registry is used by one query at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::catalog::{MetricCatalog, MetricDefinition};
use crate::config::{DEFAULT_QUERY_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TICK, SchedulerConfig};
use crate::connection::{ConnectionError, ConnectionRegistry};
use crate::scheduler::JobTracker;
use crate::sink::{Point, SinkSet};
use crate::source::{DataSource, QueryError, Row};

/// Field name carrying the query value on every point.
pub const VALUE_FIELD: &str = "value";

/// Why a metric step produced no rows.
#[derive(Debug, Error)]
pub enum MetricError {
    /// No usable connection; the run does not count and the metric stays due.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The query failed; the run still counts.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The query exceeded its deadline; the run still counts.
    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),
}

impl MetricError {
    /// Whether the schedule advances despite the failure.
    pub fn counts_as_run(&self) -> bool {
        !matches!(self, Self::Connection(_))
    }
}

/// Loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub tick: Duration,
    pub query_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl From<&SchedulerConfig> for OrchestratorOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            tick: config.tick,
            query_timeout: config.query_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// What happened during one or more ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Metrics whose schedule advanced (including failed queries).
    pub executed: usize,
    pub not_due: usize,
    pub connection_failures: usize,
    pub query_failures: usize,
    pub points_written: usize,
    pub forward_failures: usize,
    /// The stop signal cut the tick short.
    pub interrupted: bool,
}

impl TickReport {
    /// Add the counters of `other` to `self`.
    pub fn absorb(&mut self, other: &TickReport) {
        self.executed += other.executed;
        self.not_due += other.not_due;
        self.connection_failures += other.connection_failures;
        self.query_failures += other.query_failures;
        self.points_written += other.points_written;
        self.forward_failures += other.forward_failures;
        self.interrupted |= other.interrupted;
    }
}

/// Drives every metric of the catalog on its own interval.
pub struct Orchestrator<S: DataSource> {
    catalog: MetricCatalog,
    jobs: HashMap<String, JobTracker>,
    registry: ConnectionRegistry<S>,
    source: Arc<S>,
    sinks: SinkSet,
    options: OrchestratorOptions,
    shutdown: CancellationToken,
}

impl<S: DataSource> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("metrics", &self.catalog.len())
            .field("jobs", &self.jobs.len())
            .field("registry", &self.registry)
            .field("sinks", &self.sinks)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: DataSource> Orchestrator<S> {
    pub fn new(
        catalog: MetricCatalog,
        registry: ConnectionRegistry<S>,
        sinks: SinkSet,
        shutdown: CancellationToken,
    ) -> Self {
        let source = Arc::clone(registry.source());
        Self {
            catalog,
            jobs: HashMap::new(),
            registry,
            source,
            sinks,
            options: OrchestratorOptions::default(),
            shutdown,
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Schedule state of a metric, once it has been seen by a tick.
    pub fn job(&self, metric_id: &str) -> Option<&JobTracker> {
        self.jobs.get(metric_id)
    }

    pub fn registry(&self) -> &ConnectionRegistry<S> {
        &self.registry
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Run ticks until the shutdown token is cancelled, then release
    /// connections and close sinks.
    ///
    /// Returns the counters summed over every tick.
    pub async fn run(&mut self) -> TickReport {
        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            metrics = self.catalog.len(),
            tick = ?self.options.tick,
            "Scheduler started"
        );

        let mut totals = TickReport::default();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                scheduled = ticker.tick() => {
                    let report = self.run_tick(scheduled).await;
                    totals.absorb(&report);
                    if report.interrupted {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            executed = totals.executed,
            points = totals.points_written,
            "Scheduler stopping"
        );
        self.release().await;
        totals
    }

    /// Walk the catalog once, in order, running every metric due at `now`.
    ///
    /// The stop signal is honored between metrics only.
    pub async fn run_tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        for metric in self.catalog.iter() {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let job = self
                .jobs
                .entry(metric.id.clone())
                .or_insert_with(|| JobTracker::new(metric.interval_duration()));
            if !job.is_due(now) {
                report.not_due += 1;
                continue;
            }

            let started = std::time::Instant::now();
            let timeout = metric.timeout.unwrap_or(self.options.query_timeout);
            let rows = match collect(&mut self.registry, &self.source, metric, now, timeout).await {
                Ok(rows) => rows,
                Err(e) => {
                    if e.counts_as_run() {
                        report.query_failures += 1;
                        report.executed += 1;
                        job.mark_executed(now);
                        tracing::error!(
                            metric = %metric.id,
                            credential = %metric.login,
                            error = %e,
                            "Metric query failed"
                        );
                    } else {
                        report.connection_failures += 1;
                        tracing::warn!(
                            metric = %metric.id,
                            credential = %metric.login,
                            error = %e,
                            "Skipping metric, no connection"
                        );
                    }
                    continue;
                }
            };

            let (written, failed) = forward(&self.sinks, metric, &rows).await;
            report.points_written += written;
            report.forward_failures += failed;
            report.executed += 1;
            job.mark_executed(now);

            tracing::debug!(
                metric = %metric.id,
                rows = rows.len(),
                written,
                failed,
                duration_ms = started.elapsed().as_millis() as u64,
                "Metric executed"
            );
        }

        if report.executed > 0 || report.connection_failures > 0 {
            tracing::debug!(?report, "Tick finished");
        }
        report
    }

    // --- Private helpers ---

    async fn release(&mut self) {
        match tokio::time::timeout(self.options.shutdown_timeout, self.registry.release_all()).await {
            Ok(closed) => tracing::debug!(closed, "Connections released"),
            Err(_) => tracing::warn!(
                timeout = ?self.options.shutdown_timeout,
                "Timed out releasing connections"
            ),
        }
        self.sinks.close_all().await;
        tracing::info!("Scheduler stopped");
    }
}

/// Acquire the metric's connection and run its query under `timeout`.
async fn collect<S: DataSource>(
    registry: &mut ConnectionRegistry<S>,
    source: &S,
    metric: &MetricDefinition,
    now: Instant,
    timeout: Duration,
) -> Result<Vec<Row>, MetricError> {
    let conn = registry.acquire_at(&metric.login, now).await?;
    match tokio::time::timeout(timeout, source.execute(conn, &metric.query)).await {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(e)) => {
            if e.connection_lost {
                registry.mark_unhealthy(&metric.login, now);
            }
            Err(e.into())
        }
        Err(_) => Err(MetricError::QueryTimeout(timeout)),
    }
}

/// Write one point per row. Returns `(written, failed)`.
async fn forward(sinks: &SinkSet, metric: &MetricDefinition, rows: &[Row]) -> (usize, usize) {
    let sink = match sinks.get(&metric.sink) {
        Ok(sink) => sink,
        Err(e) => {
            tracing::error!(metric = %metric.id, error = %e, "Cannot forward points");
            return (0, rows.len());
        }
    };

    let mut written = 0;
    let mut failed = 0;
    for row in rows {
        let point = build_point(metric, row);
        match sink.write(&point).await {
            Ok(()) => written += 1,
            Err(e) => {
                failed += 1;
                tracing::error!(
                    metric = %metric.id,
                    sink = %metric.sink,
                    value = row.value,
                    error = %e,
                    "Failed to forward point"
                );
            }
        }
    }
    (written, failed)
}

/// Point for one row, stamped with the current wall-clock time.
///
/// Static metric tags come first so `database` and `description` always
/// reflect the metric itself.
pub fn build_point(metric: &MetricDefinition, row: &Row) -> Point {
    let mut point = Point::new(metric.measurement.clone(), Utc::now());
    point.tags.extend(metric.tags.clone());
    point
        .with_tag("database", metric.login.source())
        .with_tag("description", metric.description.clone())
        .with_field(VALUE_FIELD, row.value)
}
