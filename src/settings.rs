use crate::connection::ReconnectPolicy;
use crate::networks::Network;
use config::{Config, ConfigError, Environment, File};
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    #[serde(default)]
    pub default: Network,
    /// Endpoint overrides keyed by network name (`mainnet`, `xahau-testnet`, ...).
    #[serde(default)]
    pub endpoints: HashMap<String, Vec<String>>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            default: Network::default(),
            endpoints: HashMap::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            // Never let the cap undercut the first delay.
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms)),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_requests_per_second() -> u32 {
    crate::queue::DEFAULT_REQUESTS_PER_SECOND
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationSettings {
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_wait_ms() -> u64 {
    20_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransactionSettings {
    /// Upper bound on an autofilled fee (2 XRP).
    #[serde(default = "default_max_fee_drops")]
    pub max_fee_drops: u64,
    /// `LastLedgerSequence` = current ledger + this offset.
    #[serde(default = "default_last_ledger_offset")]
    pub last_ledger_offset: u32,
}

fn default_max_fee_drops() -> u64 {
    2_000_000
}
fn default_last_ledger_offset() -> u32 {
    20
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            max_fee_drops: default_max_fee_drops(),
            last_ledger_offset: default_last_ledger_offset(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// `sqlite://...` URL of the persistent cache. Unset disables caching.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_account_info_ttl_seconds")]
    pub account_info_ttl_seconds: u64,
    #[serde(default = "default_nfts_ttl_seconds")]
    pub nfts_ttl_seconds: u64,
    #[serde(default = "default_nft_offers_ttl_seconds")]
    pub nft_offers_ttl_seconds: u64,
}

fn default_account_info_ttl_seconds() -> u64 {
    10
}
fn default_nfts_ttl_seconds() -> u64 {
    60
}
fn default_nft_offers_ttl_seconds() -> u64 {
    30
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            account_info_ttl_seconds: default_account_info_ttl_seconds(),
            nfts_ttl_seconds: default_nfts_ttl_seconds(),
            nft_offers_ttl_seconds: default_nft_offers_ttl_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub validation: ValidationSettings,
    #[serde(default)]
    pub transaction: TransactionSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Settings {
    /// Loads `Config.toml` (optional) from the working directory, then `LEDGER__*` overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml", false)
    }

    pub fn from_file(path: &str, required: bool) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(required))
            .add_source(
                Environment::with_prefix("LEDGER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Endpoint lists and the cache URL also accept flat variables, which are easier to set
    /// from a shell or a `.env` file than the nested `LEDGER__*` form.
    fn apply_env_overrides(&mut self) {
        for network in Network::ALL {
            let var = format!(
                "LEDGER_ENDPOINTS_{}",
                network.as_str().replace('-', "_").to_ascii_uppercase()
            );
            if let Ok(raw) = env::var(&var) {
                if let Some(list) = parse_string_list(&raw) {
                    if !list.is_empty() {
                        self.network
                            .endpoints
                            .insert(network.as_str().to_string(), list);
                    }
                }
            }
        }

        if let Ok(network) = env::var("LEDGER_NETWORK") {
            match network.parse() {
                Ok(network) => self.network.default = network,
                Err(e) => warn!("⚠️ [Settings] Ignoring LEDGER_NETWORK: {}", e),
            }
        }

        if let Ok(url) = env::var("LEDGER_CACHE_DATABASE_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                self.cache.database_url = Some(trimmed.to_string());
            }
        }
    }

    /// Configured endpoints for `network`, or its public defaults.
    pub fn endpoints_for(&self, network: Network) -> Vec<String> {
        self.network
            .endpoints
            .iter()
            .find(|(name, _)| name.parse::<Network>().ok() == Some(network))
            .map(|(_, urls)| urls.clone())
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| network.default_endpoints())
    }
}

/// Parses a JSON array or a comma-separated list of strings.
fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }

    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Some(v);
        }
        // Unquoted URLs inside brackets: [wss://a, wss://b]
        let without_brackets = trimmed.trim_start_matches('[').trim_end_matches(']');
        return Some(split_list(without_brackets));
    }

    Some(split_list(trimmed))
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
