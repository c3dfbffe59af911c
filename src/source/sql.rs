//! SQL data source backed by `sqlx::AnyConnection`.
//!
//! Each configured source is a connection URL without credentials, e.g.
//! `postgres://db.internal:5432/billing`. The login user and password of
//! the credential are injected into the URL when connecting. SQLite URLs
//! are used as-is since SQLite has no authentication.
//!
//! The `Any` driver cannot carry PostgreSQL `NUMERIC` or MySQL `DECIMAL`
//! columns; queries over such columns must cast the result to a floating
//! point type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Connection, Row as _};
use url::Url;

use crate::credential::Credential;
use crate::source::{ConnectError, DataSource, QueryError, Row};

/// Configuration for one named data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connection URL without user or password.
    pub url: String,
}

impl SourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }

    /// Validate the URL shape.
    pub fn validate(&self) -> Result<(), String> {
        if self.is_sqlite() {
            return Ok(());
        }
        let url = Url::parse(&self.url).map_err(|e| format!("invalid url '{}': {}", self.url, e))?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err("url must not embed credentials; use the credentials section".to_string());
        }
        if !url.has_host() {
            return Err(format!("url '{}' has no host", self.url));
        }
        Ok(())
    }
}

/// `sqlx` implementation of [`DataSource`] for PostgreSQL, MySQL and SQLite.
#[derive(Debug, Clone, Default)]
pub struct SqlSource {
    sources: BTreeMap<String, SourceConfig>,
}

impl SqlSource {
    pub fn new(sources: BTreeMap<String, SourceConfig>) -> Self {
        sqlx::any::install_default_drivers();
        Self { sources }
    }

    /// Build the URL used to connect with `credential`.
    ///
    /// The returned string contains the password; never log it.
    pub fn connection_url(&self, credential: &Credential) -> Result<String, ConnectError> {
        let name = credential.key.source();
        let config = self
            .sources
            .get(name)
            .ok_or_else(|| ConnectError::UnknownSource(name.to_string()))?;

        if config.is_sqlite() {
            return Ok(config.url.clone());
        }

        let mut url =
            Url::parse(&config.url).map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;
        url.set_username(credential.key.username())
            .and_then(|()| url.set_password(Some(&credential.password)))
            .map_err(|()| {
                ConnectError::InvalidUrl(format!("source '{name}' url cannot carry credentials"))
            })?;
        Ok(url.into())
    }
}

#[async_trait::async_trait]
impl DataSource for SqlSource {
    type Connection = AnyConnection;

    async fn connect(&self, credential: &Credential) -> Result<AnyConnection, ConnectError> {
        let url = self.connection_url(credential)?;
        let conn = AnyConnection::connect(&url).await?;
        tracing::debug!(credential = %credential.key, backend = conn.backend_name(), "Connection established");
        Ok(conn)
    }

    async fn execute(&self, conn: &mut AnyConnection, query: &str) -> Result<Vec<Row>, QueryError> {
        let rows = sqlx::query(query)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| query_error(e, query))?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            match first_column(row).map_err(|e| query_error(e, query))? {
                Some(value) => values.push(Row::new(value)),
                None => tracing::warn!(query = %query.trim(), "Skipping row with NULL value"),
            }
        }
        Ok(values)
    }

    async fn close(&self, conn: AnyConnection) -> Result<(), ConnectError> {
        conn.close().await?;
        Ok(())
    }
}

/// Decode the first column as a number. Integer, floating point and numeric
/// text columns are accepted; `None` means SQL NULL.
fn first_column(row: &AnyRow) -> Result<Option<f64>, sqlx::Error> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(0) {
        return Ok(value.map(|v| v as f64));
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(0) {
        return Ok(value);
    }
    let text: Option<String> = row.try_get(0)?;
    text.map(|s| {
        s.trim()
            .parse::<f64>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))
    })
    .transpose()
}

/// Appended to errors about column types the `Any` driver cannot carry,
/// such as PostgreSQL `NUMERIC` or MySQL `DECIMAL`.
const CAST_HINT: &str =
    "cast the first column to a floating point type, e.g. CAST(sum(amount) AS DOUBLE PRECISION)";

fn query_error(err: sqlx::Error, query: &str) -> QueryError {
    let context = query.trim().to_string();
    match &err {
        sqlx::Error::Database(db) => {
            let error = QueryError::new(db.message(), context);
            match db.code() {
                Some(code) => error.with_code(code.into_owned()),
                None => error,
            }
        }
        sqlx::Error::AnyDriverError(e) if e.to_string().contains("does not support") => {
            QueryError::new(format!("{err}; {CAST_HINT}"), context)
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            QueryError::new(err.to_string(), context).with_connection_lost()
        }
        _ => QueryError::new(err.to_string(), context),
    }
}
