//! Configuration for the payment gateway.
//!
//! Loaded from a JSON file named by `--config` (or the `CONFIG` environment
//! variable), after `.env` has been applied. Secret-bearing fields accept
//! `$VAR` / `${VAR}` environment references so the file itself can be
//! committed without credentials.

use alloy::primitives::Address;
use clap::Parser;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// CLI arguments for the gateway server.
#[derive(Parser, Debug)]
#[command(name = "paygate-rs")]
#[command(about = "Crypto payment gateway server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("can not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl Config {
    /// Load configuration from the path given by `--config` / `CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let args = CliArgs::parse();
        Self::from_path(args.config)
    }

    pub fn from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.rpc_urls.is_empty() {
            return Err(ConfigError::Invalid {
                field: "chain.rpcUrls",
                reason: "at least one RPC endpoint is required".to_string(),
            });
        }
        // Fail fast on a malformed at-rest key instead of at first use.
        self.security.encryption_key_bytes()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "defaults::host")]
    pub host: IpAddr,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Requests per minute allowed per API key.
    #[serde(default = "defaults::rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            rate_limit_per_minute: defaults::rate_limit_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub url: LiteralOrEnv<String>,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// Ordered JSON-RPC endpoints; the pool fails over front to back.
    pub rpc_urls: Vec<Url>,
    /// Ordered push-stream endpoints.
    #[serde(default)]
    pub ws_urls: Vec<Url>,
    /// Confirmations required before a payment is final.
    #[serde(default = "defaults::confirmations")]
    pub confirmations: u32,
    /// Base gas price in wei for emitted transfers.
    pub gas_price: LiteralOrEnv<u128>,
    #[serde(default = "defaults::gas_limit")]
    pub gas_limit: u64,
    /// The monitored token contract.
    pub token_contract: LiteralOrEnv<Address>,
    #[serde(default = "defaults::currency")]
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    /// BIP-44 style prefix under which deposit addresses derive.
    #[serde(default = "defaults::hd_base_path")]
    pub hd_base_path: String,
    /// Seed phrase for the wallet tree.
    pub mnemonic: LiteralOrEnv<String>,
    /// How long an issued deposit address accepts payment.
    #[serde(default = "defaults::address_lifetime_ms")]
    pub address_lifetime_ms: u64,
    /// Hot wallet token balance above which funds move to cold storage.
    pub hot_threshold: LiteralOrEnv<Decimal>,
    /// Cold storage destination. Hot→cold transfers are skipped when unset.
    #[serde(default)]
    pub cold_address: Option<LiteralOrEnv<Address>>,
    /// Minimum native-coin balance a hot wallet keeps for gas.
    #[serde(default = "defaults::gas_reserve_wei")]
    pub gas_reserve_wei: u128,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "defaults::queue_url")]
    pub url: LiteralOrEnv<String>,
    #[serde(default = "defaults::queue_max_retries")]
    pub max_retries: u32,
    /// Dead-letter TTL: how long a nacked message waits before redelivery.
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Scale the retry delay exponentially with the attempt count.
    #[serde(default = "defaults::use_backoff")]
    pub use_backoff: bool,
    #[serde(default = "defaults::health_check_ms")]
    pub health_check_ms: u64,
    #[serde(default = "defaults::store_failed_messages")]
    pub store_failed_messages: bool,
    #[serde(default = "defaults::prefetch")]
    pub prefetch: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: LiteralOrEnv(defaults::queue_url_literal()),
            max_retries: defaults::queue_max_retries(),
            retry_delay_ms: defaults::retry_delay_ms(),
            use_backoff: defaults::use_backoff(),
            health_check_ms: defaults::health_check_ms(),
            store_failed_messages: defaults::store_failed_messages(),
            prefetch: defaults::prefetch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfig {
    /// Shortfall within this percentage of the expected amount is accepted.
    #[serde(default = "defaults::underpayment_tolerance_pct")]
    pub underpayment_tolerance_pct: Decimal,
    /// Excess within this percentage is kept without refund.
    #[serde(default = "defaults::overpayment_tolerance_pct")]
    pub overpayment_tolerance_pct: Decimal,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            underpayment_tolerance_pct: defaults::underpayment_tolerance_pct(),
            overpayment_tolerance_pct: defaults::overpayment_tolerance_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Hex-encoded 32-byte key for private-key encryption at rest.
    pub encryption_key: LiteralOrEnv<String>,
    /// Default secret for webhook endpoints created without one.
    pub webhook_secret: LiteralOrEnv<String>,
    /// Cost factor used by the account surface when hashing API secrets.
    #[serde(default = "defaults::api_key_salt_rounds")]
    pub api_key_salt_rounds: u32,
}

impl SecurityConfig {
    /// Decode and length-check the at-rest encryption key.
    pub fn encryption_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(self.encryption_key.deref()).map_err(|e| ConfigError::Invalid {
            field: "security.encryptionKey",
            reason: e.to_string(),
        })?;
        bytes.try_into().map_err(|_| ConfigError::Invalid {
            field: "security.encryptionKey",
            reason: "must be exactly 32 bytes of hex".to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default = "defaults::webhook_max_retries")]
    pub max_retries: u32,
    /// Base delay for the `base · 2^attempt` retry schedule.
    #[serde(default = "defaults::webhook_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "defaults::webhook_timeout_ms")]
    pub timeout_ms: u64,
    /// Failures within the window that open a per-URL circuit breaker.
    #[serde(default = "defaults::breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "defaults::breaker_window_ms")]
    pub breaker_window_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::webhook_max_retries(),
            retry_delay_ms: defaults::webhook_retry_delay_ms(),
            timeout_ms: defaults::webhook_timeout_ms(),
            breaker_threshold: defaults::breaker_threshold(),
            breaker_window_ms: defaults::breaker_window_ms(),
        }
    }
}

mod defaults {
    use rust_decimal::Decimal;
    use std::net::{IpAddr, Ipv4Addr};

    pub fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
    pub fn port() -> u16 {
        8080
    }
    pub fn rate_limit_per_minute() -> u32 {
        100
    }
    pub fn max_connections() -> u32 {
        10
    }
    pub fn confirmations() -> u32 {
        6
    }
    pub fn gas_limit() -> u64 {
        100_000
    }
    pub fn currency() -> String {
        "USDT".to_string()
    }
    pub fn hd_base_path() -> String {
        "m/44'/60'/0'/0".to_string()
    }
    pub fn address_lifetime_ms() -> u64 {
        3_600_000
    }
    pub fn gas_reserve_wei() -> u128 {
        10_000_000_000_000_000 // 0.01 native coin
    }
    pub fn queue_url_literal() -> String {
        "amqp://127.0.0.1:5672".to_string()
    }
    pub fn queue_url() -> super::LiteralOrEnv<String> {
        super::LiteralOrEnv(queue_url_literal())
    }
    pub fn queue_max_retries() -> u32 {
        3
    }
    pub fn retry_delay_ms() -> u64 {
        60_000
    }
    pub fn use_backoff() -> bool {
        true
    }
    pub fn health_check_ms() -> u64 {
        30_000
    }
    pub fn store_failed_messages() -> bool {
        true
    }
    pub fn prefetch() -> u16 {
        10
    }
    pub fn underpayment_tolerance_pct() -> Decimal {
        Decimal::ONE
    }
    pub fn overpayment_tolerance_pct() -> Decimal {
        Decimal::new(5, 1) // 0.5
    }
    pub fn api_key_salt_rounds() -> u32 {
        10
    }
    pub fn webhook_max_retries() -> u32 {
        5
    }
    pub fn webhook_retry_delay_ms() -> u64 {
        15_000
    }
    pub fn webhook_timeout_ms() -> u64 {
        10_000
    }
    pub fn breaker_threshold() -> u32 {
        5
    }
    pub fn breaker_window_ms() -> u64 {
        60_000
    }
}

/// A value that is either written literally in the config file or resolved
/// from the environment at load time.
///
/// - Literal: `"amqp://broker:5672"`
/// - Simple reference: `"$QUEUE_URL"`
/// - Braced reference: `"${QUEUE_URL}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(pub T);

impl<T> LiteralOrEnv<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    fn env_var_name(s: &str) -> Option<&str> {
        if let Some(inner) = s.strip_prefix("${") {
            inner.strip_suffix('}')
        } else if let Some(name) = s.strip_prefix('$') {
            (!name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_'))
                .then_some(name)
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = match Self::env_var_name(&s) {
            Some(name) => std::env::var(name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable '{name}' not set (referenced as '{s}')"
                ))
            })?,
            None => s,
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("can not parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_name_syntax() {
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$QUEUE_URL"), Some("QUEUE_URL"));
        assert_eq!(LiteralOrEnv::<String>::env_var_name("${QUEUE_URL}"), Some("QUEUE_URL"));
        assert_eq!(LiteralOrEnv::<String>::env_var_name("amqp://host"), None);
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$"), None);
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$not-a-var"), None);
    }

    #[test]
    fn literal_value_parses() {
        let v: LiteralOrEnv<u128> = serde_json::from_str("\"5000000000\"").unwrap();
        assert_eq!(*v, 5_000_000_000u128);
    }

    #[test]
    fn missing_env_reference_errors() {
        let result: Result<LiteralOrEnv<String>, _> =
            serde_json::from_str("\"$PAYGATE_TEST_UNSET_VARIABLE\"");
        assert!(result.is_err());
    }

    #[test]
    fn encryption_key_must_be_32_bytes() {
        let security = SecurityConfig {
            encryption_key: LiteralOrEnv("ab".repeat(32)),
            webhook_secret: LiteralOrEnv("whsec".to_string()),
            api_key_salt_rounds: 10,
        };
        assert!(security.encryption_key_bytes().is_ok());
        let short = SecurityConfig {
            encryption_key: LiteralOrEnv("abcd".to_string()),
            ..security
        };
        assert!(short.encryption_key_bytes().is_err());
    }

    #[test]
    fn defaults_apply() {
        let queue = QueueConfig::default();
        assert_eq!(queue.max_retries, 3);
        assert_eq!(queue.retry_delay_ms, 60_000);
        assert!(queue.store_failed_messages);
        let payment = PaymentConfig::default();
        assert_eq!(payment.underpayment_tolerance_pct, Decimal::ONE);
        assert_eq!(payment.overpayment_tolerance_pct, "0.5".parse().unwrap());
    }
}
