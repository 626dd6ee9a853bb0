use config::{Config, ConfigError, Environment, File, Map};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use validator::{Validate, ValidationError};

use crate::repair::orphans::OrphanPolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_DB_DATABASE: &str = "laundry";
const DEFAULT_DB_USERNAME: &str = "postgres";
const DEFAULT_DB_SCHEMA: &str = "public";
const DEFAULT_BATCH_SIZE: usize = 500;

/// Tool configuration.
///
/// Database settings are read from the `DB_*` variables the application itself
/// uses (`DB_HOST`, `DB_PORT`, `DB_DATABASE`, `DB_USERNAME`, `DB_PASSWORD`,
/// `DB_SSL`), repair options from `REPAIR__*`.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Full connection URL; when set it wins over the individual parts
    #[serde(default)]
    pub db_url: Option<String>,

    #[validate(length(min = 1))]
    pub db_host: String,

    #[validate(range(min = 1))]
    pub db_port: u16,

    #[validate(length(min = 1))]
    pub db_database: String,

    #[validate(length(min = 1))]
    pub db_username: String,

    #[serde(default)]
    pub db_password: String,

    #[serde(default)]
    pub db_ssl: bool,

    /// Schema holding the laundry tables
    #[serde(default = "default_db_schema")]
    #[validate(length(min = 1))]
    pub db_schema: String,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Log every statement through sqlx
    #[serde(default)]
    pub db_log_statements: bool,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// What the identifier migration does with rows whose parent is missing
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,

    /// Rows per multi-row INSERT when writing the identifier map
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 10000))]
    pub batch_size: usize,

    /// Re-apply NOT NULL on known columns once the backfill leaves them clean
    #[serde(default)]
    pub enforce_not_null: bool,

    /// Rollback retypes key columns back to UUID when every value parses
    #[serde(default = "default_true_bool")]
    pub restore_uuid_type: bool,

    /// Comma-separated tables the NULL scan must never touch
    #[serde(default)]
    pub excluded_tables: Option<String>,
}

impl AppConfig {
    /// Creates a configuration pointing at the given database with default options
    pub fn new(
        db_host: String,
        db_port: u16,
        db_database: String,
        db_username: String,
        db_password: String,
        environment: String,
    ) -> Self {
        Self {
            db_url: None,
            db_host,
            db_port,
            db_database,
            db_username,
            db_password,
            db_ssl: false,
            db_schema: default_db_schema(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            db_log_statements: false,
            environment,
            log_level: default_log_level(),
            log_json: false,
            orphan_policy: OrphanPolicy::default(),
            batch_size: default_batch_size(),
            enforce_not_null: false,
            restore_uuid_type: default_true_bool(),
            excluded_tables: None,
        }
    }

    /// Builds the Postgres connection URL from the configured parts
    pub fn database_url(&self) -> Result<String, AppConfigError> {
        if let Some(url) = self.db_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.trim().to_string());
        }

        let invalid = |part: &str| AppConfigError::InvalidDatabaseUrl(part.to_string());

        let mut url = Url::parse("postgres://localhost").map_err(|e| invalid(&e.to_string()))?;
        url.set_host(Some(&self.db_host))
            .map_err(|e| invalid(&format!("host {}: {}", self.db_host, e)))?;
        url.set_port(Some(self.db_port))
            .map_err(|_| invalid("port"))?;
        url.set_username(&self.db_username)
            .map_err(|_| invalid("username"))?;
        if !self.db_password.is_empty() {
            url.set_password(Some(&self.db_password))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(&self.db_database);
        url.query_pairs_mut()
            .append_pair("sslmode", if self.db_ssl { "require" } else { "disable" });

        Ok(url.to_string())
    }

    /// Connection URL safe to log
    pub fn redacted_database_url(&self) -> String {
        match self.database_url().ok().and_then(|raw| Url::parse(&raw).ok()) {
            Some(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            None => "<invalid database url>".to_string(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.db_acquire_timeout_secs)
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Tables excluded from the NULL scan on top of the built-in metadata tables
    pub fn excluded_tables(&self) -> Vec<String> {
        self.excluded_tables
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid database url: {0}")]
    InvalidDatabaseUrl(String),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_schema() -> String {
    DEFAULT_DB_SCHEMA.to_string()
}

fn default_db_connect_timeout_secs() -> u64 {
    10
}

fn default_db_acquire_timeout_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_true_bool() -> bool {
    true
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Loads configuration from `config/` and the process environment
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. `DB_*` environment variables
/// 5. `REPAIR__*` environment variables
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR), env::vars().collect())
}

/// Loads configuration from an explicit directory and variable set
pub fn load_config_from(
    config_dir: &Path,
    vars: HashMap<String, String>,
) -> Result<AppConfig, AppConfigError> {
    let run_env = vars
        .get("RUN_ENV")
        .or_else(|| vars.get("APP_ENV"))
        .cloned()
        .unwrap_or_else(|| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let source: Map<String, String> = vars.into_iter().collect();

    let config = Config::builder()
        .set_default("db_host", DEFAULT_DB_HOST)?
        .set_default("db_port", DEFAULT_DB_PORT as i64)?
        .set_default("db_database", DEFAULT_DB_DATABASE)?
        .set_default("db_username", DEFAULT_DB_USERNAME)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&run_env)).required(false))
        .add_source(
            Environment::with_prefix("DB")
                .keep_prefix(true)
                .source(Some(source.clone())),
        )
        .add_source(
            Environment::with_prefix("REPAIR")
                .prefix_separator("__")
                .source(Some(source)),
        )
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
