//! Data Source Layer
//!
//! The scheduler talks to relational databases only through the
//! [`DataSource`] trait. [`SqlSource`] is the `sqlx` implementation used by
//! the binary.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use dbmon::source::{DataSource, SourceConfig, SqlSource};
//! use dbmon::credential::{Credential, CredentialKey};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut sources = BTreeMap::new();
//! sources.insert("billing".to_string(), SourceConfig::new("postgres://db:5432/billing"));
//! let source = SqlSource::new(sources);
//!
//! let credential = Credential {
//!     key: CredentialKey::parse("reader@billing")?,
//!     password: "secret".to_string(),
//! };
//! let mut conn = source.connect(&credential).await?;
//! let rows = source.execute(&mut conn, "select count(*) from invoices").await?;
//! # Ok(())
//! # }
//! ```

mod sql;
mod traits;

pub use sql::{SourceConfig, SqlSource};
pub use traits::{ConnectError, DataSource, QueryError, Row};
