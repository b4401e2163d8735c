use alloy::primitives::Address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub deposit: DepositConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub guardian: GuardianConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Node endpoint, http(s):// or ws(s):// - overridden by env RPC_URL
    #[serde(default = "default_rpc_url")]
    pub url: String,
    /// Deadline for a single RPC request in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Head polling interval when the endpoint cannot push blocks.
    #[serde(default = "default_block_poll_interval_ms")]
    pub block_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractsConfig {
    /// Lido contract. The deposit contract address is read from it.
    #[serde(default = "default_lido_address")]
    pub lido: String,
    /// Node operators registry.
    #[serde(default = "default_registry_address")]
    pub registry: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositConfig {
    /// Blocks per historical log query.
    #[serde(default = "default_events_step")]
    pub events_step: u64,
    /// Blocks behind the head that are always fetched live.
    #[serde(default = "default_fresh_blocks")]
    pub fresh_blocks: u64,
    /// Refresh the cache on every block number divisible by this.
    #[serde(default = "default_cache_update_block_rate")]
    pub cache_update_block_rate: u64,
    /// Blocks behind the head never persisted, as reorg protection.
    #[serde(default = "default_cache_lag_blocks")]
    pub cache_lag_blocks: u64,
    /// Delay before retrying a failed log query.
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
    /// Attempts per range before giving up. Retries forever when unset.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Directory holding the per-chain event caches.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Overrides the built-in deposit contract deployment block.
    #[serde(default)]
    pub deployment_block: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Size of the next-keys batch asked from the registry.
    #[serde(default = "default_max_deposit_keys")]
    pub max_deposit_keys: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardianConfig {
    /// Executable plus args that pauses the protocol - overridden by env PAUSE_COMMAND.
    /// Dry run when unset.
    #[serde(default)]
    pub pause_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Memory,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    /// Relay endpoint for the webhook transport - overridden by env TRANSPORT_WEBHOOK_URL
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_block_poll_interval_ms() -> u64 {
    12_000
}
fn default_lido_address() -> String {
    "0xae7ab96520DE3A18E5e111B5EaAb095312D7fE84".to_string()
}
fn default_registry_address() -> String {
    "0x55032650b14df07b85bF18A3a3eC8E0Af2e028d5".to_string()
}
fn default_events_step() -> u64 {
    10_000
}
fn default_fresh_blocks() -> u64 {
    100
}
fn default_cache_update_block_rate() -> u64 {
    10
}
fn default_cache_lag_blocks() -> u64 {
    100
}
fn default_retry_timeout_ms() -> u64 {
    5_000
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}
fn default_max_deposit_keys() -> u64 {
    100
}
fn default_topic_prefix() -> String {
    crate::transport::DEFAULT_TOPIC_PREFIX.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            request_timeout_ms: default_request_timeout_ms(),
            block_poll_interval_ms: default_block_poll_interval_ms(),
        }
    }
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self {
            lido: default_lido_address(),
            registry: default_registry_address(),
        }
    }
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            events_step: default_events_step(),
            fresh_blocks: default_fresh_blocks(),
            cache_update_block_rate: default_cache_update_block_rate(),
            cache_lag_blocks: default_cache_lag_blocks(),
            retry_timeout_ms: default_retry_timeout_ms(),
            max_retries: None,
            cache_dir: default_cache_dir(),
            deployment_block: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_deposit_keys: default_max_deposit_keys(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            webhook_url: None,
            topic_prefix: default_topic_prefix(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment, no file needed. RPC_URL is required here.
    pub fn from_env() -> Result<Self, ConfigError> {
        if std::env::var("RPC_URL").is_err() {
            return Err(ConfigError::MissingEnv("RPC_URL".to_string()));
        }
        let mut config = Self::parse("")?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    // Endpoints and the pause command never need to live in the file.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("RPC_URL") {
            self.rpc.url = url;
        }
        if let Ok(command) = std::env::var("PAUSE_COMMAND") {
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            self.guardian.pause_command = (!parts.is_empty()).then_some(parts);
        }
        if let Ok(url) = std::env::var("TRANSPORT_WEBHOOK_URL") {
            self.transport.webhook_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deposit.events_step == 0 {
            return Err(invalid("deposit.events_step", "must be greater than zero"));
        }
        if self.deposit.cache_update_block_rate == 0 {
            return Err(invalid(
                "deposit.cache_update_block_rate",
                "must be greater than zero",
            ));
        }
        if self.registry.max_deposit_keys == 0 {
            return Err(invalid("registry.max_deposit_keys", "must be greater than zero"));
        }
        self.lido_address()?;
        self.registry_address()?;
        if self.transport.kind == TransportKind::Webhook
            && self.transport.webhook_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(invalid("transport.webhook_url", "required by the webhook transport"));
        }
        Ok(())
    }

    pub fn lido_address(&self) -> Result<Address, ConfigError> {
        parse_address("contracts.lido", &self.contracts.lido)
    }

    pub fn registry_address(&self) -> Result<Address, ConfigError> {
        parse_address("contracts.registry", &self.contracts.registry)
    }
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, ConfigError> {
    Address::from_str(value).map_err(|e| invalid(field, format!("{value}: {e}")))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
