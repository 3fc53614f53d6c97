use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_DB_FILE_NAME: &str = "threadhub.db";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Config {
    /// Path to the loaded config file (computed, never serialized).
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Agent WebSocket and event intake server (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Reliable delivery to agents (`[delivery]`).
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Inbound dedup window (`[dedup]`).
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Idle job detection (`[jobs]`).
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Orchestration database (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_FILE_NAME),
            gateway: GatewayConfig::default(),
            delivery: DeliveryConfig::default(),
            dedup: DedupConfig::default(),
            jobs: JobsConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

// ── Gateway ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 42800)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Timeout for plain HTTP requests. WebSocket sessions are not subject to it.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum accepted request body for `POST /events`.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    42800
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Delivery ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Age after which an unacknowledged message is resent.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Period of the retry sweep.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Resends before a message is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Capacity of each connection's dispatch lane.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            max_retries: default_max_retries(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

// ── Dedup ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct DedupConfig {
    /// How long an inbound message id is remembered.
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,
}

fn default_retention_minutes() -> u64 {
    30
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_minutes: default_retention_minutes(),
        }
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes.saturating_mul(60))
    }
}

// ── Jobs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct JobsConfig {
    /// Minutes without activity before a job with no active messages is idle.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u32,
    /// Period of the idle sweep in the daemon.
    #[serde(default = "default_idle_sweep_interval_secs")]
    pub idle_sweep_interval_secs: u64,
}

fn default_idle_minutes() -> u32 {
    30
}

fn default_idle_sweep_interval_secs() -> u64 {
    60
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            idle_minutes: default_idle_minutes(),
            idle_sweep_interval_secs: default_idle_sweep_interval_secs(),
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to `threadhub.db` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

// ── Loading ─────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".threadhub"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var("THREADHUB_CONFIG_DIR") {
        let custom = custom.trim();
        if !custom.is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    default_config_dir()
}

impl Config {
    /// Load `config.toml` from `THREADHUB_CONFIG_DIR` or `~/.threadhub`,
    /// writing defaults on first run, then apply env overrides and validate.
    pub async fn load_or_init() -> Result<Self> {
        let dir = resolve_config_dir()?;
        let mut config = Self::load_or_init_in(&dir).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load (or create) the config file inside `dir` without env overrides.
    pub async fn load_or_init_in(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        let config_path = dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            return Ok(config);
        }

        let config = Config {
            config_path,
            ..Config::default()
        };
        config.save().await?;
        tracing::info!(path = %config.config_path.display(), "Wrote default config");
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str)
            .await
            .with_context(|| format!("Failed to write config file: {}", self.config_path.display()))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `THREADHUB_*` overrides read through `lookup`. Empty and
    /// unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = lookup("THREADHUB_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = lookup("THREADHUB_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid THREADHUB_PORT"),
            }
        }
        if let Some(path) = lookup("THREADHUB_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Gateway
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.request_timeout_secs == 0 {
            anyhow::bail!("gateway.request_timeout_secs must be greater than 0");
        }
        if self.gateway.max_body_bytes == 0 {
            anyhow::bail!("gateway.max_body_bytes must be greater than 0");
        }

        // Delivery
        if self.delivery.ack_timeout_secs == 0 {
            anyhow::bail!("delivery.ack_timeout_secs must be greater than 0");
        }
        if self.delivery.retry_interval_secs == 0 {
            anyhow::bail!("delivery.retry_interval_secs must be greater than 0");
        }
        if self.delivery.queue_capacity == 0 {
            anyhow::bail!("delivery.queue_capacity must be greater than 0");
        }

        // Dedup
        if self.dedup.retention_minutes == 0 {
            anyhow::bail!("dedup.retention_minutes must be greater than 0");
        }

        // Jobs
        if self.jobs.idle_minutes == 0 {
            anyhow::bail!("jobs.idle_minutes must be greater than 0");
        }
        if self.jobs.idle_sweep_interval_secs == 0 {
            anyhow::bail!("jobs.idle_sweep_interval_secs must be greater than 0");
        }

        Ok(())
    }

    /// Database path, falling back to `threadhub.db` beside the config file.
    pub fn db_path(&self) -> PathBuf {
        if let Some(path) = &self.storage.db_path {
            return path.clone();
        }
        self.config_path
            .parent()
            .map(|dir| dir.join(DEFAULT_DB_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE_NAME))
    }
}
