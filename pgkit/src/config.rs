// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Connection and pool settings for the PostgreSQL server
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub min_size: u32,
    pub max_size: u32,
    /// Upper bound for a single round trip, in seconds
    pub command_timeout_seconds: u64,
    /// How long `acquire` waits for a free connection. `None` waits indefinitely.
    pub acquire_timeout_seconds: Option<u64>,
    /// When set, TLS is required for every connection
    pub server_hostname: Option<String>,
    /// Server run-time parameters applied at connect (`SET key = value`)
    pub server_settings: Option<BTreeMap<String, String>>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            min_size: 5,
            max_size: 20,
            command_timeout_seconds: 60,
            acquire_timeout_seconds: Some(30),
            server_hostname: None,
            server_settings: None,
        }
    }
}

impl DatabaseConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_seconds.map(Duration::from_secs)
    }

    /// Connection URL with the password masked, safe for logs and errors
    pub fn redacted_url(&self) -> String {
        let password = if self.password.is_empty() { "" } else { ":***" };
        format!(
            "postgresql://{}{}@{}:{}/{}",
            self.user, password, self.host, self.port, self.database
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Database host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("Database port must be greater than 0".to_string());
        }
        if self.database.is_empty() {
            return Err("Database name cannot be empty".to_string());
        }
        if self.max_size == 0 {
            return Err("Database max_size must be greater than 0".to_string());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "Database min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            ));
        }
        if self.command_timeout_seconds == 0 {
            return Err("Database command_timeout_seconds must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("command_timeout_seconds", &self.command_timeout_seconds)
            .field("acquire_timeout_seconds", &self.acquire_timeout_seconds)
            .field("server_hostname", &self.server_hostname)
            .field("server_settings", &self.server_settings)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        self.database.validate()?;
        if self.observability.log_level.is_empty() {
            return Err("Log level cannot be empty".to_string());
        }
        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }
        Ok(())
    }
}
