//! Connection registry keyed by credential.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::credential::{CredentialKey, CredentialStore};
use crate::source::{ConnectError, DataSource};

/// Default deadline for establishing a connection (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`ConnectionRegistry::acquire`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No secret is configured for the credential.
    #[error("no credential configured for '{0}'")]
    MissingCredential(CredentialKey),

    /// The data source refused or failed the connection.
    #[error("connection for '{credential}' failed: {source}")]
    Connect {
        credential: CredentialKey,
        #[source]
        source: ConnectError,
    },

    /// Connecting took longer than the connect timeout.
    #[error("connection for '{credential}' timed out after {timeout:?}")]
    Timeout {
        credential: CredentialKey,
        timeout: Duration,
    },

    /// An earlier attempt failed and the policy forbids another one.
    #[error("credential '{0}' previously failed; not reconnecting")]
    PreviouslyFailed(CredentialKey),

    /// An earlier attempt failed and the reconnect cooldown is still running.
    #[error("credential '{credential}' previously failed; next attempt in {remaining:?}")]
    CoolingDown {
        credential: CredentialKey,
        remaining: Duration,
    },
}

/// What to do with a credential whose connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Never try again for the lifetime of the process.
    #[default]
    Never,
    /// Allow one new attempt once this long has passed since the last failure.
    After(Duration),
}

impl ReconnectPolicy {
    pub fn from_cooldown(cooldown: Option<Duration>) -> Self {
        cooldown.map_or(Self::Never, Self::After)
    }
}

impl std::fmt::Display for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::After(d) => write!(f, "after {}", humantime::format_duration(*d)),
        }
    }
}

/// Health and connection for one credential.
///
/// Entries are created on the first attempt and never removed.
struct ConnectionStatus<C> {
    healthy: bool,
    connection: Option<C>,
    last_failure: Option<Instant>,
    attempts: u32,
}

impl<C> ConnectionStatus<C> {
    fn new() -> Self {
        Self {
            healthy: false,
            connection: None,
            last_failure: None,
            attempts: 0,
        }
    }
}

enum Decision {
    Reuse,
    Connect,
    Refuse(ConnectionError),
}

/// Lazily opens one connection per credential and remembers its health.
///
/// Every metric that uses the same credential shares the entry. A failed
/// attempt leaves an unhealthy entry behind; whether it is ever retried is
/// governed by the [`ReconnectPolicy`].
pub struct ConnectionRegistry<S: DataSource> {
    source: Arc<S>,
    credentials: CredentialStore,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    entries: HashMap<CredentialKey, ConnectionStatus<S::Connection>>,
}

impl<S: DataSource> std::fmt::Debug for ConnectionRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let healthy = self.entries.values().filter(|e| e.healthy).count();
        f.debug_struct("ConnectionRegistry")
            .field("known", &self.entries.len())
            .field("healthy", &healthy)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<S: DataSource> ConnectionRegistry<S> {
    pub fn new(source: Arc<S>, credentials: CredentialStore) -> Self {
        Self {
            source,
            credentials,
            policy: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            entries: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether any attempt, successful or not, was made for `credential`.
    pub fn known(&self, credential: &CredentialKey) -> bool {
        self.entries.contains_key(credential)
    }

    /// Current health flag, or `None` if the credential was never attempted.
    pub fn healthy(&self, credential: &CredentialKey) -> Option<bool> {
        self.entries.get(credential).map(|e| e.healthy)
    }

    /// Number of connection attempts made for `credential`.
    pub fn attempts(&self, credential: &CredentialKey) -> u32 {
        self.entries.get(credential).map_or(0, |e| e.attempts)
    }

    /// Data source the registry connects through.
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Get the connection for `credential`, connecting on first use.
    pub async fn acquire(
        &mut self,
        credential: &CredentialKey,
    ) -> Result<&mut S::Connection, ConnectionError> {
        self.acquire_at(credential, Instant::now()).await
    }

    /// Same as [`acquire`](Self::acquire) with an explicit clock reading,
    /// which only matters for the reconnect cooldown.
    pub async fn acquire_at(
        &mut self,
        credential: &CredentialKey,
        now: Instant,
    ) -> Result<&mut S::Connection, ConnectionError> {
        match self.decide(credential, now) {
            Decision::Reuse => {}
            Decision::Refuse(err) => return Err(err),
            Decision::Connect => self.connect(credential, now).await?,
        }

        self.entries
            .get_mut(credential)
            .and_then(|e| e.connection.as_mut())
            .ok_or_else(|| ConnectionError::PreviouslyFailed(credential.clone()))
    }

    /// Drop the connection of `credential` after it broke in use.
    ///
    /// The entry is treated like a failed attempt at `now`: the reconnect
    /// policy decides whether and when it is tried again.
    pub fn mark_unhealthy(&mut self, credential: &CredentialKey, now: Instant) {
        let Some(entry) = self.entries.get_mut(credential) else {
            return;
        };
        entry.healthy = false;
        entry.connection = None;
        entry.last_failure = Some(now);
        tracing::error!(
            credential = %credential,
            policy = %self.policy,
            "Connection lost"
        );
    }

    /// Close every stored connection. Entries stay known but turn unhealthy.
    ///
    /// Returns the number of connections closed.
    pub async fn release_all(&mut self) -> usize {
        let mut closed = 0;
        for (key, entry) in &mut self.entries {
            entry.healthy = false;
            let Some(conn) = entry.connection.take() else {
                continue;
            };
            match self.source.close(conn).await {
                Ok(()) => {
                    tracing::debug!(credential = %key, "Connection closed");
                    closed += 1;
                }
                Err(e) => tracing::warn!(credential = %key, error = %e, "Failed to close connection"),
            }
        }
        tracing::info!(closed, "Released all connections");
        closed
    }

    // --- Private helpers ---

    fn decide(&self, credential: &CredentialKey, now: Instant) -> Decision {
        let Some(entry) = self.entries.get(credential) else {
            return Decision::Connect;
        };
        if entry.healthy {
            return Decision::Reuse;
        }
        match self.policy {
            ReconnectPolicy::Never => {
                Decision::Refuse(ConnectionError::PreviouslyFailed(credential.clone()))
            }
            ReconnectPolicy::After(cooldown) => {
                let retry_at = entry.last_failure.map_or(now, |failed| failed + cooldown);
                if now >= retry_at {
                    Decision::Connect
                } else {
                    Decision::Refuse(ConnectionError::CoolingDown {
                        credential: credential.clone(),
                        remaining: retry_at - now,
                    })
                }
            }
        }
    }

    async fn connect(
        &mut self,
        credential: &CredentialKey,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        tracing::info!(credential = %credential, "Connecting to data source");

        let result = match self.credentials.get(credential) {
            None => Err(ConnectionError::MissingCredential(credential.clone())),
            Some(secret) => {
                match tokio::time::timeout(self.connect_timeout, self.source.connect(secret)).await
                {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(source)) => Err(ConnectionError::Connect {
                        credential: credential.clone(),
                        source,
                    }),
                    Err(_) => Err(ConnectionError::Timeout {
                        credential: credential.clone(),
                        timeout: self.connect_timeout,
                    }),
                }
            }
        };

        let entry = self
            .entries
            .entry(credential.clone())
            .or_insert_with(ConnectionStatus::new);
        entry.attempts += 1;

        match result {
            Ok(conn) => {
                entry.healthy = true;
                entry.connection = Some(conn);
                entry.last_failure = None;
                tracing::info!(credential = %credential, "Connected to data source");
                Ok(())
            }
            Err(e) => {
                entry.healthy = false;
                entry.connection = None;
                entry.last_failure = Some(now);
                tracing::error!(
                    credential = %credential,
                    attempts = entry.attempts,
                    policy = %self.policy,
                    error = %e,
                    "Connection failed"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::source::{QueryError, Row};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Data source whose connect outcome is scripted per call.
    #[derive(Default)]
    struct ScriptedSource {
        connects: AtomicU32,
        closes: AtomicU32,
        fail: AtomicBool,
        hang: AtomicBool,
    }

    impl ScriptedSource {
        fn failing() -> Self {
            let source = Self::default();
            source.fail.store(true, Ordering::SeqCst);
            source
        }
    }

    #[async_trait::async_trait]
    impl DataSource for ScriptedSource {
        type Connection = u32;

        async fn connect(&self, _credential: &Credential) -> Result<u32, ConnectError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectError::Other("ORA-01017: invalid username/password".into()));
            }
            Ok(n)
        }

        async fn execute(&self, _conn: &mut u32, _query: &str) -> Result<Vec<Row>, QueryError> {
            Ok(vec![])
        }

        async fn close(&self, _conn: u32) -> Result<(), ConnectError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn key(s: &str) -> CredentialKey {
        CredentialKey::parse(s).unwrap()
    }

    fn store(keys: &[&str]) -> CredentialStore {
        let mut store = CredentialStore::default();
        for k in keys {
            store.insert(key(k), "secret");
        }
        store
    }

    #[tokio::test]
    async fn test_first_acquire_connects_and_reuses() {
        let source = Arc::new(ScriptedSource::default());
        let mut registry = ConnectionRegistry::new(Arc::clone(&source), store(&["u@db"]));
        let k = key("u@db");

        assert!(!registry.known(&k));
        assert_eq!(registry.healthy(&k), None);

        let first = *registry.acquire(&k).await.unwrap();
        let second = *registry.acquire(&k).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.connects.load(Ordering::SeqCst), 1);
        assert!(registry.known(&k));
        assert_eq!(registry.healthy(&k), Some(true));
        assert_eq!(registry.attempts(&k), 1);
    }

    #[tokio::test]
    async fn test_failed_credential_is_never_retried() {
        let source = Arc::new(ScriptedSource::failing());
        let mut registry = ConnectionRegistry::new(Arc::clone(&source), store(&["u@db"]));
        let k = key("u@db");

        let err = registry.acquire(&k).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }));
        assert!(registry.known(&k));
        assert_eq!(registry.healthy(&k), Some(false));

        // Even once the database would accept us, the entry stays failed.
        source.fail.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            let err = registry.acquire(&k).await.unwrap_err();
            assert!(matches!(err, ConnectionError::PreviouslyFailed(_)));
        }
        assert_eq!(source.connects.load(Ordering::SeqCst), 1);
        assert_eq!(registry.attempts(&k), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_marks_entry_failed() {
        let source = Arc::new(ScriptedSource::default());
        let mut registry = ConnectionRegistry::new(Arc::clone(&source), store(&[]));
        let k = key("ghost@db");

        let err = registry.acquire(&k).await.unwrap_err();
        assert!(matches!(err, ConnectionError::MissingCredential(_)));
        assert_eq!(registry.healthy(&k), Some(false));
        assert_eq!(source.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_credentials_are_tracked_independently() {
        let source = Arc::new(ScriptedSource::default());
        let mut registry =
            ConnectionRegistry::new(Arc::clone(&source), store(&["a@db1", "b@db2"]));

        let a = *registry.acquire(&key("a@db1")).await.unwrap();
        let b = *registry.acquire(&key("b@db2")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(source.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cooldown_policy_allows_one_retry_after_cooldown() {
        let source = Arc::new(ScriptedSource::failing());
        let cooldown = Duration::from_secs(60);
        let mut registry = ConnectionRegistry::new(Arc::clone(&source), store(&["u@db"]))
            .with_policy(ReconnectPolicy::After(cooldown));
        let k = key("u@db");
        let t0 = Instant::now();

        assert!(registry.acquire_at(&k, t0).await.is_err());

        let err = registry
            .acquire_at(&k, t0 + Duration::from_secs(30))
            .await
            .unwrap_err();
        match err {
            ConnectionError::CoolingDown { remaining, .. } => {
                assert_eq!(remaining, Duration::from_secs(30));
            }
            other => panic!("expected CoolingDown, got {other:?}"),
        }
        assert_eq!(source.connects.load(Ordering::SeqCst), 1);

        source.fail.store(false, Ordering::SeqCst);
        let conn = *registry.acquire_at(&k, t0 + cooldown).await.unwrap();
        assert_eq!(conn, 2);
        assert_eq!(registry.healthy(&k), Some(true));
        assert_eq!(registry.attempts(&k), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_marks_unhealthy() {
        let source = Arc::new(ScriptedSource::default());
        source.hang.store(true, Ordering::SeqCst);
        let mut registry = ConnectionRegistry::new(Arc::clone(&source), store(&["u@db"]))
            .with_connect_timeout(Duration::from_millis(200));
        let k = key("u@db");

        let err = registry.acquire(&k).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
        assert_eq!(registry.healthy(&k), Some(false));
    }

    #[tokio::test]
    async fn test_release_all_closes_healthy_connections() {
        let source = Arc::new(ScriptedSource::default());
        let mut registry =
            ConnectionRegistry::new(Arc::clone(&source), store(&["a@db1", "b@db2"]));
        registry.acquire(&key("a@db1")).await.unwrap();
        registry.acquire(&key("b@db2")).await.unwrap();
        let _ = registry.acquire(&key("missing@db3")).await;

        assert_eq!(registry.release_all().await, 2);
        assert_eq!(source.closes.load(Ordering::SeqCst), 2);
        assert!(registry.known(&key("a@db1")));
        assert_eq!(registry.healthy(&key("a@db1")), Some(false));
    }

    #[tokio::test]
    async fn test_lost_connection_follows_policy() {
        let t0 = Instant::now();
        let cooldown = Duration::from_secs(60);

        // Never: the credential is gone for good.
        let source = Arc::new(ScriptedSource::default());
        let mut registry = ConnectionRegistry::new(Arc::clone(&source), store(&["u@db"]));
        let k = key("u@db");
        registry.acquire_at(&k, t0).await.unwrap();
        registry.mark_unhealthy(&k, t0);
        assert_eq!(registry.healthy(&k), Some(false));
        let err = registry.acquire_at(&k, t0 + cooldown).await.unwrap_err();
        assert!(matches!(err, ConnectionError::PreviouslyFailed(_)));
        assert_eq!(source.connects.load(Ordering::SeqCst), 1);

        // After: one new attempt once the cooldown has passed.
        let source = Arc::new(ScriptedSource::default());
        let mut registry = ConnectionRegistry::new(Arc::clone(&source), store(&["u@db"]))
            .with_policy(ReconnectPolicy::After(cooldown));
        registry.acquire_at(&k, t0).await.unwrap();
        registry.mark_unhealthy(&k, t0);
        assert!(matches!(
            registry.acquire_at(&k, t0 + Duration::from_secs(10)).await,
            Err(ConnectionError::CoolingDown { .. })
        ));
        let conn = *registry.acquire_at(&k, t0 + cooldown).await.unwrap();
        assert_eq!(conn, 2);
        assert_eq!(registry.healthy(&k), Some(true));
    }

    #[test]
    fn test_mark_unhealthy_unknown_credential_is_ignored() {
        let mut registry = ConnectionRegistry::new(Arc::new(ScriptedSource::default()), store(&[]));
        registry.mark_unhealthy(&key("u@db"), Instant::now());
        assert!(!registry.known(&key("u@db")));
    }

    #[test]
    fn test_reconnect_policy_display() {
        assert_eq!(ReconnectPolicy::Never.to_string(), "never");
        assert_eq!(
            ReconnectPolicy::from_cooldown(Some(Duration::from_secs(300))).to_string(),
            "after 5m"
        );
    }
}
