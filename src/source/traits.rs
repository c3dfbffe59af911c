//! Data source contract consumed by the scheduler.

use thiserror::Error;

use crate::credential::Credential;

/// Failure to establish a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The credential references a source that is not configured.
    #[error("unknown data source '{0}'")]
    UnknownSource(String),

    /// The connection URL could not be built.
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),

    /// The data source rejected the connection.
    #[error("connect failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Anything else reported by a data source implementation.
    #[error("{0}")]
    Other(String),
}

/// Query failure with the diagnostic triple reported by the database.
#[derive(Debug, Clone, Error)]
#[error("query failed [{}]: {message} (context: {context})", .code.as_deref().unwrap_or("-"))]
pub struct QueryError {
    /// Vendor error code, when the database supplied one.
    pub code: Option<String>,
    pub message: String,
    /// Where the error happened, usually the query text.
    pub context: String,
    /// The connection itself broke; it must not be handed out again.
    pub connection_lost: bool,
}

impl QueryError {
    pub fn new(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            context: context.into(),
            connection_lost: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_connection_lost(mut self) -> Self {
        self.connection_lost = true;
        self
    }
}

/// One result row; only the first column is forwarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Row {
    pub value: f64,
}

impl Row {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

/// Relational data source: connects per credential and runs queries on a
/// connection it handed out earlier.
///
/// Connections are owned by the connection registry and lent to
/// [`DataSource::execute`] one call at a time.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Live connection handle.
    type Connection: Send + 'static;

    /// Open a connection for `credential`.
    async fn connect(&self, credential: &Credential) -> Result<Self::Connection, ConnectError>;

    /// Run `query` and return its rows.
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        query: &str,
    ) -> Result<Vec<Row>, QueryError>;

    /// Close a connection. Only called on shutdown.
    async fn close(&self, conn: Self::Connection) -> Result<(), ConnectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display_with_code() {
        let err = QueryError::new("table or view does not exist", "select * from nope")
            .with_code("ORA-00942");
        assert_eq!(
            err.to_string(),
            "query failed [ORA-00942]: table or view does not exist (context: select * from nope)"
        );
    }

    #[test]
    fn test_query_error_display_without_code() {
        let err = QueryError::new("boom", "select 1");
        assert!(err.to_string().starts_with("query failed [-]: boom"));
        assert!(!err.connection_lost);
        assert!(err.with_connection_lost().connection_lost);
    }
}
