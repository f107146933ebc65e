//! Application settings.
//!
//! Values are layered: built-in defaults, then an optional `config.toml`
//! (or the file named by `FEES_CONFIG`), then `FEES__SECTION__KEY`
//! environment variables, e.g. `FEES__AUTH__SESSION_SECRET`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

static KEYSPACE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,47}$").expect("valid keyspace regex"));

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub bulk: BulkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Scylla,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

/// Scylla connection. `nodes` is the connection string split into hosts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub nodes: Vec<String>,
    pub keyspace: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub schema_path: String,
    pub schema_version: i32,
    pub replication_factor: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub session_secret: String,
    pub session_hours: i64,
    pub secure_cookies: bool,
}

/// Retry policy for bulk fee-request sending.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Settings {
    /// Load settings from defaults, the config file and the environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var("FEES_CONFIG").unwrap_or_else(|_| "config".to_string());
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Settings::default())?)
            .add_source(::config::File::with_name(&file).required(false))
            .add_source(
                ::config::Environment::with_prefix("FEES")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("database.nodes")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.session_secret.len() < MIN_SECRET_LEN {
            return Err(AppError::Validation(format!(
                "auth.session_secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if self.auth.session_hours <= 0 {
            return Err(AppError::Validation("auth.session_hours must be positive".to_string()));
        }
        if self.bulk.max_attempts == 0 {
            return Err(AppError::Validation("bulk.max_attempts must be at least 1".to_string()));
        }
        if self.server.port == 0 {
            return Err(AppError::Validation("server.port must be set".to_string()));
        }
        if self.storage.backend == StorageBackend::Scylla {
            if self.database.nodes.iter().all(|n| n.trim().is_empty()) {
                return Err(AppError::Validation("database.nodes is required".to_string()));
            }
            if !KEYSPACE_NAME.is_match(&self.database.keyspace) {
                return Err(AppError::Validation(format!(
                    "database.keyspace '{}' is not a valid keyspace name",
                    self.database.keyspace
                )));
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 1227,
            },
            storage: StorageConfig {
                backend: StorageBackend::Scylla,
            },
            database: DatabaseConfig {
                nodes: vec!["127.0.0.1:9042".to_string()],
                keyspace: "fees".to_string(),
                user: None,
                password: None,
                schema_path: "schema".to_string(),
                schema_version: 1,
                replication_factor: 1,
            },
            auth: AuthConfig {
                session_secret: String::new(),
                session_hours: 24,
                secure_cookies: true,
            },
            bulk: BulkConfig {
                max_attempts: 4,
                base_delay_ms: 200,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        let mut settings = Settings::default();
        settings.auth.session_secret = "x".repeat(MIN_SECRET_LEN);
        settings
    }

    #[test]
    fn defaults_require_a_secret() {
        assert!(Settings::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn keyspace_name_is_checked_for_scylla_only() {
        let mut settings = valid();
        settings.database.keyspace = "fees; DROP KEYSPACE x".to_string();
        assert!(settings.validate().is_err());

        settings.storage.backend = StorageBackend::Memory;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn scylla_needs_nodes() {
        let mut settings = valid();
        settings.database.nodes = vec![];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bulk_needs_at_least_one_attempt() {
        let mut settings = valid();
        settings.bulk.max_attempts = 0;
        assert!(settings.validate().is_err());
    }
}
