//! Configuration for the FlowPay agent.
//!
//! The JSON file is optional field by field: anything left out is resolved by
//! the functions in [`config_defaults`], which look at `FLOWPAY_*` environment
//! variables before falling back to built-in values. Secrets may be written
//! as `"$ENV_VAR"` references, see [`LiteralOrEnv`].

use clap::Parser;
use flowpay_types::amount::{MAX_TOKEN_DECIMALS, MoneyAmount, MoneyAmountParseError};
use flowpay_types::config::LiteralOrEnv;
use flowpay_types::headers::HeaderNames;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::engine::RetryPolicy;
use crate::spending::{ActivityPolicy, SpendingLimits};

/// CLI arguments for the FlowPay agent.
#[derive(Parser, Debug)]
#[command(name = "flowpay")]
#[command(about = "Fetch 402-priced HTTP resources, paying as negotiated")]
pub struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    pub config: PathBuf,
    /// Print the resolved settings and planned requests, then exit without fetching
    #[arg(long)]
    pub dry_run: bool,
    /// Resource URLs to fetch, in order
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "config_defaults::default_agent_id")]
    agent_id: String,
    #[serde(default = "config_defaults::default_namespace")]
    namespace: String,
    #[serde(default = "config_defaults::default_token_decimals")]
    token_decimals: u32,
    #[serde(default)]
    spending: SpendingConfig,
    #[serde(default)]
    negotiation: NegotiationConfig,
    /// Sent as `x-api-key` on every resource request.
    #[serde(default)]
    api_key: Option<LiteralOrEnv<String>>,
    #[serde(default)]
    oracle: Option<OracleConfig>,
    #[serde(default)]
    ledger: LedgerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpendingConfig {
    #[serde(default = "config_defaults::default_daily_limit")]
    pub daily_limit: MoneyAmount,
    #[serde(default = "config_defaults::default_total_limit")]
    pub total_limit: MoneyAmount,
    #[serde(default = "config_defaults::default_max_renewals")]
    pub max_renewals_per_window: usize,
    #[serde(default = "config_defaults::default_renewal_window_secs")]
    pub renewal_window_secs: u64,
}

impl Default for SpendingConfig {
    fn default() -> Self {
        Self {
            daily_limit: config_defaults::default_daily_limit(),
            total_limit: config_defaults::default_total_limit(),
            max_renewals_per_window: config_defaults::default_max_renewals(),
            renewal_window_secs: config_defaults::default_renewal_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NegotiationConfig {
    #[serde(default = "config_defaults::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "config_defaults::default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "config_defaults::default_stream_duration_secs")]
    pub stream_duration_secs: u64,
    #[serde(default = "config_defaults::default_per_request_stream_secs")]
    pub per_request_stream_secs: u64,
    #[serde(default = "config_defaults::default_low_balance_percent")]
    pub low_balance_percent: u8,
    #[serde(default = "config_defaults::default_estimated_request_volume")]
    pub estimated_request_volume: u32,
    #[serde(default = "config_defaults::default_streaming_threshold")]
    pub streaming_threshold: u32,
    #[serde(default = "config_defaults::default_verify_stream_on_reuse")]
    pub verify_stream_on_reuse: bool,
    /// Per-attempt timeout for resource requests. None waits indefinitely.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_attempts: config_defaults::default_max_attempts(),
            backoff_base_ms: config_defaults::default_backoff_base_ms(),
            stream_duration_secs: config_defaults::default_stream_duration_secs(),
            per_request_stream_secs: config_defaults::default_per_request_stream_secs(),
            low_balance_percent: config_defaults::default_low_balance_percent(),
            estimated_request_volume: config_defaults::default_estimated_request_volume(),
            streaming_threshold: config_defaults::default_streaming_threshold(),
            verify_stream_on_reuse: config_defaults::default_verify_stream_on_reuse(),
            request_timeout_ms: None,
        }
    }
}

impl NegotiationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Decision oracle settings. Without this section the heuristic alone picks the mode.
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub api_key: LiteralOrEnv<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<Url>,
    #[serde(default = "config_defaults::default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Simulated ledger settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "config_defaults::default_initial_balance")]
    pub initial_balance: MoneyAmount,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_balance: config_defaults::default_initial_balance(),
        }
    }
}

pub mod config_defaults {
    use flowpay_types::amount::{DEFAULT_TOKEN_DECIMALS, MoneyAmount};
    use flowpay_types::headers::HeaderNames;
    use std::env;
    use std::str::FromStr;

    use crate::cache::DEFAULT_LOW_BALANCE_PERCENT;
    use crate::engine::{DEFAULT_BACKOFF_BASE, DEFAULT_ESTIMATED_VOLUME, DEFAULT_MAX_ATTEMPTS};
    use crate::executor::{DEFAULT_PER_REQUEST_STREAM_SECS, DEFAULT_STREAM_DURATION_SECS};
    use crate::selector::{DEFAULT_ORACLE_TIMEOUT, DEFAULT_STREAMING_THRESHOLD};
    use crate::spending::{DEFAULT_MAX_RENEWALS, DEFAULT_RENEWAL_WINDOW_SECS};

    pub const DEFAULT_AGENT_ID: &str = "flowpay-agent";

    fn from_env<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }

    /// $FLOWPAY_AGENT_ID -> "flowpay-agent"
    pub fn default_agent_id() -> String {
        env::var("FLOWPAY_AGENT_ID").unwrap_or_else(|_| DEFAULT_AGENT_ID.to_string())
    }

    /// $FLOWPAY_NAMESPACE -> "flowpay"
    pub fn default_namespace() -> String {
        env::var("FLOWPAY_NAMESPACE").unwrap_or_else(|_| HeaderNames::DEFAULT_NAMESPACE.to_string())
    }

    /// $FLOWPAY_TOKEN_DECIMALS -> 18
    pub fn default_token_decimals() -> u32 {
        from_env("FLOWPAY_TOKEN_DECIMALS").unwrap_or(DEFAULT_TOKEN_DECIMALS)
    }

    /// $FLOWPAY_DAILY_LIMIT -> 100
    pub fn default_daily_limit() -> MoneyAmount {
        from_env("FLOWPAY_DAILY_LIMIT").unwrap_or(MoneyAmount::from(100))
    }

    /// $FLOWPAY_TOTAL_LIMIT -> 1000
    pub fn default_total_limit() -> MoneyAmount {
        from_env("FLOWPAY_TOTAL_LIMIT").unwrap_or(MoneyAmount::from(1000))
    }

    /// $FLOWPAY_INITIAL_BALANCE -> 100
    pub fn default_initial_balance() -> MoneyAmount {
        from_env("FLOWPAY_INITIAL_BALANCE").unwrap_or(MoneyAmount::from(100))
    }

    pub fn default_max_renewals() -> usize {
        DEFAULT_MAX_RENEWALS
    }

    pub fn default_renewal_window_secs() -> u64 {
        DEFAULT_RENEWAL_WINDOW_SECS
    }

    pub fn default_max_attempts() -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }

    pub fn default_backoff_base_ms() -> u64 {
        DEFAULT_BACKOFF_BASE.as_millis() as u64
    }

    pub fn default_stream_duration_secs() -> u64 {
        DEFAULT_STREAM_DURATION_SECS
    }

    pub fn default_per_request_stream_secs() -> u64 {
        DEFAULT_PER_REQUEST_STREAM_SECS
    }

    pub fn default_low_balance_percent() -> u8 {
        DEFAULT_LOW_BALANCE_PERCENT
    }

    /// $FLOWPAY_ESTIMATED_VOLUME -> 10
    pub fn default_estimated_request_volume() -> u32 {
        from_env("FLOWPAY_ESTIMATED_VOLUME").unwrap_or(DEFAULT_ESTIMATED_VOLUME)
    }

    pub fn default_streaming_threshold() -> u32 {
        DEFAULT_STREAMING_THRESHOLD
    }

    pub fn default_verify_stream_on_reuse() -> bool {
        true
    }

    pub fn default_oracle_timeout_ms() -> u64 {
        DEFAULT_ORACLE_TIMEOUT.as_millis() as u64
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid {field}: {source}")]
    InvalidAmount {
        field: &'static str,
        #[source]
        source: MoneyAmountParseError,
    },
    #[error("token_decimals {0} exceeds the supported maximum of {MAX_TOKEN_DECIMALS}")]
    InvalidDecimals(u32),
}

impl AgentConfig {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn token_decimals(&self) -> u32 {
        self.token_decimals
    }

    pub fn spending(&self) -> &SpendingConfig {
        &self.spending
    }

    pub fn negotiation(&self) -> &NegotiationConfig {
        &self.negotiation
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|key| key.inner().as_str())
    }

    pub fn oracle(&self) -> Option<&OracleConfig> {
        self.oracle.as_ref()
    }

    pub fn ledger(&self) -> &LedgerConfig {
        &self.ledger
    }

    pub fn header_names(&self) -> HeaderNames {
        HeaderNames::for_namespace(&self.namespace)
    }

    /// Spend ceilings in smallest units at the configured precision.
    pub fn spending_limits(&self) -> Result<SpendingLimits, ConfigError> {
        SpendingLimits::from_amounts(
            self.spending.daily_limit,
            self.spending.total_limit,
            self.token_decimals,
        )
        .map_err(|source| ConfigError::InvalidAmount {
            field: "spending limit",
            source,
        })
    }

    pub fn activity_policy(&self) -> ActivityPolicy {
        ActivityPolicy {
            max_renewals: self.spending.max_renewals_per_window,
            window_secs: self.spending.renewal_window_secs,
        }
    }

    /// Load the file named by `--config` (or `$CONFIG`, or `./config.json`).
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config.clone(), e))?;
        Self::load_from_path(config_path)
    }

    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_json::from_str(content)?;
        if config.token_decimals > MAX_TOKEN_DECIMALS {
            return Err(ConfigError::InvalidDecimals(config.token_decimals));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    #[test]
    fn test_full_config() {
        let config = AgentConfig::from_json(
            r#"{
                "agent_id": "weather-bot",
                "namespace": "acme",
                "token_decimals": 6,
                "spending": { "daily_limit": "5", "total_limit": "50", "max_renewals_per_window": 2 },
                "negotiation": { "max_attempts": 5, "backoff_base_ms": 250, "streaming_threshold": 4,
                                 "verify_stream_on_reuse": false, "request_timeout_ms": 5000 },
                "api_key": "secret",
                "oracle": { "api_key": "gemini-key", "model": "gemini-2.0-flash", "timeout_ms": 2000 },
                "ledger": { "initial_balance": "12.5" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.agent_id(), "weather-bot");
        assert_eq!(config.header_names().mode, "x-acme-mode");
        assert_eq!(config.api_key(), Some("secret"));

        let limits = config.spending_limits().unwrap();
        assert_eq!(limits.daily_limit, U256::from(5_000_000u64));
        assert_eq!(limits.total_limit, U256::from(50_000_000u64));
        assert_eq!(config.activity_policy().max_renewals, 2);
        assert_eq!(config.activity_policy().window_secs, 60);

        let negotiation = config.negotiation();
        assert_eq!(negotiation.retry_policy().max_attempts, 5);
        assert_eq!(negotiation.retry_policy().base_delay, Duration::from_millis(250));
        assert_eq!(negotiation.request_timeout(), Some(Duration::from_secs(5)));
        assert!(!negotiation.verify_stream_on_reuse);
        assert_eq!(negotiation.stream_duration_secs, 3600);

        let oracle = config.oracle().unwrap();
        assert_eq!(oracle.api_key.inner(), "gemini-key");
        assert_eq!(oracle.timeout(), Duration::from_secs(2));
        assert_eq!(config.ledger().initial_balance.to_string(), "12.5");
    }

    #[test]
    fn test_sections_fall_back_to_defaults() {
        let config = AgentConfig::from_json(r#"{ "agent_id": "a", "namespace": "flowpay", "token_decimals": 18 }"#).unwrap();
        let negotiation = config.negotiation();
        assert_eq!(negotiation.max_attempts, 3);
        assert_eq!(negotiation.backoff_base_ms, 1000);
        assert_eq!(negotiation.per_request_stream_secs, 60);
        assert_eq!(negotiation.low_balance_percent, 10);
        assert_eq!(negotiation.streaming_threshold, 3);
        assert!(negotiation.verify_stream_on_reuse);
        assert_eq!(negotiation.request_timeout(), None);
        assert!(config.oracle().is_none());
        assert!(config.api_key().is_none());
        assert_eq!(config.activity_policy().max_renewals, 5);
    }

    #[test]
    fn test_bad_amount_is_a_parse_error() {
        let error = AgentConfig::from_json(r#"{ "spending": { "daily_limit": "-3" } }"#).unwrap_err();
        assert!(matches!(error, ConfigError::JsonParse(_)));
    }

    #[test]
    fn test_token_decimals_must_fit_u256() {
        let error = AgentConfig::from_json(r#"{ "token_decimals": 78 }"#).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidDecimals(78)));
        let config = AgentConfig::from_json(r#"{ "token_decimals": 77 }"#).unwrap();
        assert_eq!(config.token_decimals(), 77);
    }

    #[test]
    fn test_missing_file() {
        let path = std::env::temp_dir().join("flowpay-config-that-does-not-exist.json");
        let error = AgentConfig::load_from_path(path).unwrap_err();
        assert!(matches!(error, ConfigError::FileRead(..)));
    }

    #[test]
    fn test_load_from_path() {
        let path = std::env::temp_dir().join(format!("flowpay-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "agent_id": "from-file" }"#).unwrap();
        let config = AgentConfig::load_from_path(path.clone()).unwrap();
        fs::remove_file(path).unwrap();
        assert_eq!(config.agent_id(), "from-file");
    }
}
