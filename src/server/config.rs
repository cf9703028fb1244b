//! Configuration for the log shipper service.
//!
//! Built once at startup, either from flags (each with an `IF_*` environment
//! fallback) or from a TOML file passed with `--config`.

use crate::delivery::config::MAX_BATCH_RECORDS;
use crate::delivery::{BatchConfig, RetryPolicy, RotationConfig, TargetConfig, TargetError, TargetNamer};
use crate::observability::{LogConfig, LogFormat};
use crate::store::{Credentials, SYSTEM_DATABASE};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI arguments for the log shipper.
#[derive(Debug, Parser)]
#[command(name = "immufluent")]
#[command(about = "Batches fluent-bit HTTP output into an append-only ledger")]
pub struct CliArgs {
    /// HTTP listen address.
    #[arg(long, env = "IF_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// HTTP listen port.
    #[arg(long, env = "IF_PORT", default_value_t = 8090)]
    pub port: u16,

    /// Ledger server hostname.
    #[arg(long, env = "IF_IMMUDB_HOSTNAME", default_value = "127.0.0.1")]
    pub immudb_hostname: String,

    /// Ledger server port.
    #[arg(long, env = "IF_IMMUDB_PORT", default_value_t = 3322)]
    pub immudb_port: u16,

    #[arg(long, env = "IF_IMMUDB_USERNAME", default_value = "immudb")]
    pub immudb_username: String,

    #[arg(long, env = "IF_IMMUDB_PASSWORD", default_value = "immudb", hide_env_values = true)]
    pub immudb_password: String,

    /// strftime pattern naming the target database (UTC).
    #[arg(long, env = "IF_IMMUDB_PATTERN", default_value = "log_%Y_%m")]
    pub immudb_pattern: String,

    /// Ledger backend.
    #[arg(long, env = "IF_STORE", value_enum, default_value_t = StoreKind::LocalFs)]
    pub store: StoreKind,

    /// Data directory of the local ledger.
    #[arg(long, env = "IF_DATA_DIR", default_value = "./ledger")]
    pub data_dir: PathBuf,

    /// Records per transaction.
    #[arg(long, env = "IF_BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    /// Idle time before a partial batch is flushed.
    #[arg(long, env = "IF_BATCH_DELAY_MS", default_value_t = 3000)]
    pub batch_delay_ms: u64,

    /// Scheduled rotation interval; 0 disables it.
    #[arg(long, env = "IF_ROTATION_INTERVAL_MS", default_value_t = 0)]
    pub rotation_interval_ms: u64,

    #[arg(long, env = "IF_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "IF_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Load the whole configuration from a TOML file instead of flags.
    #[arg(long, env = "IF_CONFIG")]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Convert CLI args to a service configuration.
    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            listen: ListenConfig {
                address: self.address.clone(),
                port: self.port,
            },
            store: StoreConfig {
                kind: self.store,
                hostname: self.immudb_hostname.clone(),
                port: self.immudb_port,
                username: self.immudb_username.clone(),
                password: self.immudb_password.clone(),
                data_dir: self.data_dir.clone(),
                system_database: SYSTEM_DATABASE.to_string(),
            },
            target: TargetConfig {
                pattern: self.immudb_pattern.clone(),
            },
            batch: BatchConfig::new(self.batch_size, Duration::from_millis(self.batch_delay_ms)),
            rotation: RotationConfig {
                interval: Duration::from_millis(self.rotation_interval_ms),
            },
            retry: RetryPolicy::default(),
            log: LogConfig {
                level: self.log_level.clone(),
                format: self.log_format,
            },
        }
    }
}

/// Ledger backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Volatile, for local testing
    Memory,
    /// Append-only files under `data_dir`
    #[value(name = "localfs")]
    LocalFs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            address: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

impl ListenConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Address of a networked ledger server. Local backends only log it.
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub data_dir: PathBuf,
    pub system_database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            kind: StoreKind::LocalFs,
            hostname: "127.0.0.1".to_string(),
            port: 3322,
            username: "immudb".to_string(),
            password: "immudb".to_string(),
            data_dir: PathBuf::from("./ledger"),
            system_database: SYSTEM_DATABASE.to_string(),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("kind", &self.kind)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("data_dir", &self.data_dir)
            .field("system_database", &self.system_database)
            .finish()
    }
}

impl StoreConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    /// Where the ledger lives, for logs.
    pub fn describe(&self) -> String {
        match self.kind {
            StoreKind::Memory => format!("memory ({}:{})", self.hostname, self.port),
            StoreKind::LocalFs => format!("{}", self.data_dir.display()),
        }
    }
}

/// Main configuration for the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen: ListenConfig,
    pub store: StoreConfig,
    pub target: TargetConfig,
    pub batch: BatchConfig,
    pub rotation: RotationConfig,
    pub retry: RetryPolicy,
    pub log: LogConfig,
}

impl ServiceConfig {
    /// Config from flags, or from the TOML file named by `--config`.
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None => args.to_service_config(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_records == 0 {
            return Err(ConfigError::Invalid("batch.max_records must be at least 1".into()));
        }
        if self.batch.max_records > MAX_BATCH_RECORDS {
            return Err(ConfigError::Invalid(format!(
                "batch.max_records must be at most {}",
                MAX_BATCH_RECORDS
            )));
        }
        if self.batch.max_delay.is_zero() {
            return Err(ConfigError::Invalid("batch.max_delay_ms must be positive".into()));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry.attempts must be at least 1".into()));
        }
        self.target_namer()?;
        Ok(())
    }

    pub fn target_namer(&self) -> Result<TargetNamer, ConfigError> {
        TargetNamer::new(self.target.pattern.clone()).map_err(ConfigError::Target)
    }
}

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(String),
    Target(TargetError),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            ConfigError::Parse(msg) => write!(f, "invalid config file: {}", msg),
            ConfigError::Target(e) => write!(f, "{}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Target(e) => Some(e),
            _ => None,
        }
    }
}
