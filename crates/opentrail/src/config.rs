use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;

use crate::error::ConfigError;

/// Default template applied when no `--log-format` is given.
pub const DEFAULT_LOG_FORMAT: &str = "{{timestamp}}|{{level}}|{{tracking_id}}|{{message}}";

/// Command-line flags. Every flag has an `OPENTRAIL_*` environment variable
/// counterpart which takes precedence over the flag value.
#[derive(Debug, Parser)]
#[command(name = "opentrail", version, about = "Syslog collection, storage, and query service")]
pub struct Cli {
    /// TCP syslog ingestion port
    #[arg(long = "tcp-port", default_value_t = 2253)]
    pub tcp_port: u16,

    /// HTTP query/stream port
    #[arg(long = "http-port", default_value_t = 8080)]
    pub http_port: u16,

    /// Path of the SQLite database file
    #[arg(long = "database-path", default_value = "logs.db")]
    pub database_path: String,

    /// Template for pipe-delimited log lines; must contain {{message}}
    #[arg(long = "log-format", default_value = DEFAULT_LOG_FORMAT)]
    pub log_format: String,

    /// Days to retain entries before cleanup deletes them
    #[arg(long = "retention-days", default_value_t = 30)]
    pub retention_days: u32,

    /// Maximum concurrent TCP ingestion connections
    #[arg(long = "max-connections", default_value_t = 100)]
    pub max_connections: usize,

    /// HTTP Basic auth username
    #[arg(long = "auth-username", default_value = "")]
    pub auth_username: String,

    /// HTTP Basic auth password
    #[arg(long = "auth-password", default_value = "")]
    pub auth_password: String,

    /// Enable HTTP Basic auth (implied when both credentials are set)
    #[arg(long = "auth-enabled")]
    pub auth_enabled: bool,

    /// Hours between retention cleanup runs
    #[arg(long = "cleanup-interval-hours", default_value_t = 1)]
    pub cleanup_interval_hours: u64,

    /// Log verbosity (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

/// Validated runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tcp_port: u16,
    pub http_port: u16,
    pub database_path: String,
    pub log_format: String,
    pub retention_days: u32,
    pub max_connections: usize,
    pub auth_username: String,
    pub auth_password: String,
    pub auth_enabled: bool,
    pub cleanup_interval_hours: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: 2253,
            http_port: 8080,
            database_path: "logs.db".to_string(),
            log_format: DEFAULT_LOG_FORMAT.to_string(),
            retention_days: 30,
            max_connections: 100,
            auth_username: String::new(),
            auth_password: String::new(),
            auth_enabled: false,
            cleanup_interval_hours: 1,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse flags, apply environment overrides, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_cli(Cli::parse());
        config.apply_env_overrides()?;
        config.finalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_cli(cli: Cli) -> Self {
        Self {
            tcp_port: cli.tcp_port,
            http_port: cli.http_port,
            database_path: cli.database_path,
            log_format: cli.log_format,
            retention_days: cli.retention_days,
            max_connections: cli.max_connections,
            auth_username: cli.auth_username,
            auth_password: cli.auth_password,
            auth_enabled: cli.auth_enabled,
            cleanup_interval_hours: cli.cleanup_interval_hours,
            log_level: cli.log_level,
        }
    }

    /// Environment variables override flag values. A set-but-unparseable
    /// variable is a hard error rather than a silent fallback.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = parse_env("OPENTRAIL_TCP_PORT")? {
            self.tcp_port = port;
        }
        if let Some(port) = parse_env("OPENTRAIL_HTTP_PORT")? {
            self.http_port = port;
        }
        if let Ok(path) = env::var("OPENTRAIL_DATABASE_PATH") {
            self.database_path = path;
        }
        if let Ok(format) = env::var("OPENTRAIL_LOG_FORMAT") {
            self.log_format = format;
        }
        if let Some(days) = parse_env("OPENTRAIL_RETENTION_DAYS")? {
            self.retention_days = days;
        }
        if let Some(max) = parse_env("OPENTRAIL_MAX_CONNECTIONS")? {
            self.max_connections = max;
        }
        if let Ok(user) = env::var("OPENTRAIL_AUTH_USERNAME") {
            self.auth_username = user;
        }
        if let Ok(pass) = env::var("OPENTRAIL_AUTH_PASSWORD") {
            self.auth_password = pass;
        }
        if let Some(enabled) = parse_env("OPENTRAIL_AUTH_ENABLED")? {
            self.auth_enabled = enabled;
        }
        if let Some(hours) = parse_env("OPENTRAIL_CLEANUP_INTERVAL_HOURS")? {
            self.cleanup_interval_hours = hours;
        }
        if let Ok(level) = env::var("OPENTRAIL_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Auth is auto-enabled when both credentials are present.
    fn finalize(&mut self) {
        if !self.auth_username.is_empty() && !self.auth_password.is_empty() {
            self.auth_enabled = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_port == 0 {
            return Err(ConfigError::new("tcp-port", "must be in 1..=65535"));
        }
        if self.http_port == 0 {
            return Err(ConfigError::new("http-port", "must be in 1..=65535"));
        }
        if self.http_port == self.tcp_port {
            return Err(ConfigError::new(
                "http-port",
                format!("must differ from tcp-port ({})", self.tcp_port),
            ));
        }
        if self.database_path.is_empty() {
            return Err(ConfigError::new("database-path", "must not be empty"));
        }
        if !self.log_format.contains("{{message}}") {
            return Err(ConfigError::new(
                "log-format",
                "template must contain {{message}}",
            ));
        }
        if self.retention_days < 1 {
            return Err(ConfigError::new("retention-days", "must be at least 1"));
        }
        if self.max_connections < 1 {
            return Err(ConfigError::new("max-connections", "must be at least 1"));
        }
        if self.auth_enabled && (self.auth_username.is_empty() || self.auth_password.is_empty()) {
            return Err(ConfigError::new(
                "auth-enabled",
                "requires both auth-username and auth-password",
            ));
        }
        if self.cleanup_interval_hours < 1 {
            return Err(ConfigError::new("cleanup-interval-hours", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::new(name, format!("{:?}: {}", raw, e))),
        Err(_) => Ok(None),
    }
}
