//! Data-source credentials.
//!
//! A credential is addressed by a `user@source` key. The key names both the
//! login user and the configured data source, and it is also the unit the
//! connection registry tracks health for.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::expand_env_vars;

/// Credential key in `user@source` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CredentialKey(String);

impl CredentialKey {
    /// Parse a `user@source` key.
    ///
    /// Both parts must be non-empty; the split happens at the first `@`.
    pub fn parse(key: impl Into<String>) -> Result<Self, String> {
        let key = key.into();
        match key.split_once('@') {
            Some((user, source)) if !user.is_empty() && !source.is_empty() => Ok(Self(key)),
            _ => Err(format!("invalid credential '{key}': expected 'user@source'")),
        }
    }

    /// Login user part.
    pub fn username(&self) -> &str {
        self.0.split_once('@').map(|(user, _)| user).unwrap_or("")
    }

    /// Data source part. Also used as the `database` tag on forwarded points.
    pub fn source(&self) -> &str {
        self.0.split_once('@').map(|(_, source)| source).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CredentialKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CredentialKey> for String {
    fn from(key: CredentialKey) -> Self {
        key.0
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secret material for one credential as written in the config file.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Password; `${VAR}` and `${VAR:-default}` are expanded at load.
    pub password: String,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("password", &"***")
            .finish()
    }
}

/// Resolved credential handed to a data source when connecting.
#[derive(Clone)]
pub struct Credential {
    pub key: CredentialKey,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Read-only credential lookup built once at startup.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: BTreeMap<CredentialKey, Credential>,
}

impl CredentialStore {
    /// Build the store from config entries, expanding environment variables
    /// in every password.
    pub fn from_config(entries: &BTreeMap<CredentialKey, CredentialConfig>) -> Self {
        let entries = entries
            .iter()
            .map(|(key, cfg)| {
                let credential = Credential {
                    key: key.clone(),
                    password: expand_env_vars(&cfg.password),
                };
                (key.clone(), credential)
            })
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, key: CredentialKey, password: impl Into<String>) {
        let credential = Credential {
            key: key.clone(),
            password: password.into(),
        };
        self.entries.insert(key, credential);
    }

    pub fn get(&self, key: &CredentialKey) -> Option<&Credential> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CredentialKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_key_parts() {
        let key = CredentialKey::parse("sysadm@bscsrep").unwrap();
        assert_eq!(key.username(), "sysadm");
        assert_eq!(key.source(), "bscsrep");
        assert_eq!(key.to_string(), "sysadm@bscsrep");
    }

    #[test]
    fn test_credential_key_rejects_malformed() {
        assert!(CredentialKey::parse("sysadm").is_err());
        assert!(CredentialKey::parse("@bscsrep").is_err());
        assert!(CredentialKey::parse("sysadm@").is_err());
    }

    #[test]
    fn test_credential_key_from_yaml() {
        let key: CredentialKey = serde_yaml::from_str("reader@warehouse").unwrap();
        assert_eq!(key.source(), "warehouse");

        let err = serde_yaml::from_str::<CredentialKey>("no-at-sign").unwrap_err();
        assert!(err.to_string().contains("expected 'user@source'"));
    }

    #[test]
    fn test_store_expands_passwords() {
        let mut config = BTreeMap::new();
        config.insert(
            CredentialKey::parse("u@db").unwrap(),
            CredentialConfig {
                password: "${DBMON_STORE_TEST_UNSET_42:-hunter2}".to_string(),
            },
        );

        let store = CredentialStore::from_config(&config);
        let key = CredentialKey::parse("u@db").unwrap();
        assert_eq!(store.get(&key).unwrap().password, "hunter2");
        assert!(store.contains(&key));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_debug_redacts_password() {
        let credential = Credential {
            key: CredentialKey::parse("u@db").unwrap(),
            password: "topsecret".to_string(),
        };
        let cfg = CredentialConfig {
            password: "topsecret".to_string(),
        };
        assert!(!format!("{credential:?}").contains("topsecret"));
        assert!(!format!("{cfg:?}").contains("topsecret"));
    }
}
