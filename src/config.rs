//! Environment-based configuration types for the authorization server runtime.

use anyhow::Result;
use std::time::Duration;

use crate::errors::{ConfigError, StorageError};
use crate::storage::{StorageBackend, parse_storage_backend};

/// Maximum size of the database connection pool
#[derive(Clone, Debug)]
pub struct DatabaseMaxConnections(u32);

/// How long to wait for a pooled connection
#[derive(Clone, Debug)]
pub struct DatabaseAcquireTimeout(Duration);

/// Whether commits write change history rows
#[derive(Clone, Debug)]
pub struct EnsureAutoHistory(bool);

/// Administrator account created by seeding
#[derive(Clone, Debug, PartialEq)]
pub struct AdminCredentials {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Optional administrator account configuration
#[derive(Clone, Debug, Default)]
pub struct AdminAccount(Option<AdminCredentials>);

/// Main application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub storage_backend: String,
    pub database_url: Option<String>,
    pub database_max_connections: DatabaseMaxConnections,
    pub database_acquire_timeout: DatabaseAcquireTimeout,
    pub ensure_auto_history: EnsureAutoHistory,
    pub seed_client_secret: Option<String>,
    pub admin_account: AdminAccount,
}

impl Config {
    /// Create a new configuration from environment variables
    pub fn new() -> Result<Self> {
        let storage_backend = default_env("STORAGE_BACKEND", "memory");
        let database_url = optional_env("DATABASE_URL").filter(|value| !value.is_empty());
        if storage_backend == "postgres" && database_url.is_none() {
            return Err(ConfigError::EnvVarRequired("DATABASE_URL".to_string()).into());
        }
        let database_max_connections: DatabaseMaxConnections =
            default_env("DATABASE_MAX_CONNECTIONS", "10").try_into()?;
        let database_acquire_timeout: DatabaseAcquireTimeout =
            default_env("DATABASE_ACQUIRE_TIMEOUT", "10s").try_into()?;
        let ensure_auto_history: EnsureAutoHistory =
            default_env("ENSURE_AUTO_HISTORY", "false").try_into()?;
        let seed_client_secret = optional_env("SEED_CLIENT_SECRET").filter(|value| !value.is_empty());
        let admin_account = AdminAccount::from_parts(
            optional_env("ADMIN_EMAIL"),
            optional_env("ADMIN_PASSWORD"),
            optional_env("ADMIN_FIRST_NAME"),
            optional_env("ADMIN_LAST_NAME"),
        )?;

        Ok(Self {
            version: version()?,
            storage_backend,
            database_url,
            database_max_connections,
            database_acquire_timeout,
            ensure_auto_history,
            seed_client_secret,
            admin_account,
        })
    }

    /// The storage backend these settings select.
    pub fn storage(&self) -> Result<StorageBackend, StorageError> {
        parse_storage_backend(
            &self.storage_backend,
            self.database_url.as_deref(),
            *self.database_max_connections.as_ref(),
            *self.database_acquire_timeout.as_ref(),
        )
    }
}

/// Get application version from build environment
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotSet.into())
}

pub(crate) fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default_value.to_string())
}

impl TryFrom<String> for DatabaseMaxConnections {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|err| ConfigError::NumberParsingFailed(value, err))
    }
}

impl AsRef<u32> for DatabaseMaxConnections {
    fn as_ref(&self) -> &u32 {
        &self.0
    }
}

impl TryFrom<String> for DatabaseAcquireTimeout {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let duration = duration_str::parse(&value)
            .map_err(|e| ConfigError::DurationParsingFailed(value, e.to_string()))?;
        Ok(Self(duration))
    }
}

impl AsRef<Duration> for DatabaseAcquireTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for EnsureAutoHistory {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Self(true)),
            "false" | "0" | "no" | "off" | "" => Ok(Self(false)),
            _ => Err(ConfigError::BoolParsingFailed(value)),
        }
    }
}

impl AsRef<bool> for EnsureAutoHistory {
    fn as_ref(&self) -> &bool {
        &self.0
    }
}

impl AdminAccount {
    /// Build from the raw environment values. Email and password must be set
    /// together; the names are optional either way.
    pub fn from_parts(
        email: Option<String>,
        password: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Result<Self, ConfigError> {
        let non_empty = |value: Option<String>| value.filter(|s| !s.trim().is_empty());
        match (non_empty(email), non_empty(password)) {
            (None, None) => Ok(Self(None)),
            (Some(email), Some(password)) => Ok(Self(Some(AdminCredentials {
                email,
                password,
                first_name: non_empty(first_name),
                last_name: non_empty(last_name),
            }))),
            _ => Err(ConfigError::IncompleteAdminAccount),
        }
    }
}

impl AsRef<Option<AdminCredentials>> for AdminAccount {
    fn as_ref(&self) -> &Option<AdminCredentials> {
        &self.0
    }
}
