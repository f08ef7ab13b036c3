//! Broker credential providers
//!
//! Credentials come from a secrets store keyed by a secret title. Lookups never
//! fail: problems are logged and empty credentials are returned, so the broker
//! connection is what ultimately rejects a bad login.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn};

/// Username used when a secret record has no login-like field
pub const DEFAULT_USERNAME: &str = "guest";

/// Field names tried, in order, for the username
const USERNAME_FIELDS: [&str; 3] = ["login", "username", "user"];

const PASSWORD_FIELD: &str = "password";

#[derive(Clone, Default, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

impl BrokerCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both username and password are present
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field(
                "password",
                &if self.password.is_empty() {
                    "<empty>"
                } else {
                    "<redacted>"
                },
            )
            .finish()
    }
}

/// Supplies broker credentials for a secret identifier
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn broker_credentials(&self, secret_id: &str) -> BrokerCredentials;
}

/// One record in the local secrets file
#[derive(Debug, Clone, Deserialize)]
pub struct SecretRecord {
    pub title: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl SecretRecord {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Resolve credentials: first login-like field for the user, falling back
    /// to `guest`; the password field or empty.
    pub fn credentials(&self) -> BrokerCredentials {
        let username = USERNAME_FIELDS
            .iter()
            .find_map(|name| self.field(name))
            .unwrap_or(DEFAULT_USERNAME);
        let password = self.field(PASSWORD_FIELD).unwrap_or_default();
        BrokerCredentials::new(username, password)
    }
}

#[derive(Debug, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    records: Vec<SecretRecord>,
}

/// Credentials read from a local JSON secrets file
///
/// ```json
/// { "records": [ { "title": "MessageBroker", "fields": { "login": "worker", "password": "..." } } ] }
/// ```
///
/// The file is loaded once at construction. A missing or invalid file leaves
/// the provider empty; every lookup then returns empty credentials.
pub struct SecretsFileProvider {
    path: PathBuf,
    records: Option<Vec<SecretRecord>>,
}

impl SecretsFileProvider {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = match Self::read_records(&path) {
            Ok(records) => {
                info!(
                    "Secrets file loaded from {} ({} records)",
                    path.display(),
                    records.len()
                );
                Some(records)
            }
            Err(e) => {
                error!("Failed to load secrets file {}: {:#}", path.display(), e);
                None
            }
        };
        Self { path, records }
    }

    fn read_records(path: &Path) -> Result<Vec<SecretRecord>> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Secrets file not readable at {}", path.display()))?;
        let file: SecretsFile =
            serde_json::from_str(&contents).context("Secrets file is not valid JSON")?;
        Ok(file.records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialProvider for SecretsFileProvider {
    async fn broker_credentials(&self, secret_id: &str) -> BrokerCredentials {
        let Some(records) = &self.records else {
            error!(
                "Secrets file {} not loaded - cannot fetch secret {}",
                self.path.display(),
                secret_id
            );
            return BrokerCredentials::default();
        };

        match records.iter().find(|r| r.title == secret_id) {
            Some(record) => {
                info!("Fetched broker credentials for {}", secret_id);
                record.credentials()
            }
            None => {
                warn!("No secret found for title {}", secret_id);
                BrokerCredentials::default()
            }
        }
    }
}

/// Credentials taken from `BROKER_USERNAME` / `BROKER_PASSWORD`
#[derive(Debug, Default)]
pub struct EnvCredentialProvider;

pub const USERNAME_ENV: &str = "BROKER_USERNAME";
pub const PASSWORD_ENV: &str = "BROKER_PASSWORD";

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn broker_credentials(&self, secret_id: &str) -> BrokerCredentials {
        let username = std::env::var(USERNAME_ENV).unwrap_or_default();
        let password = std::env::var(PASSWORD_ENV).unwrap_or_default();
        if username.is_empty() && password.is_empty() {
            warn!(
                "{} and {} not set - no credentials for {}",
                USERNAME_ENV, PASSWORD_ENV, secret_id
            );
        }
        BrokerCredentials::new(username, password)
    }
}
