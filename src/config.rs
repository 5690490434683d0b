//! Configuration for the deferred settlement facilitator.

use clap::Parser;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::SettlementThreshold;

/// CLI arguments for the facilitator server.
#[derive(Parser, Debug)]
#[command(name = "x402-deferred")]
#[command(about = "Deferred x402 settlement facilitator HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long = "config", short = 'c')]
    config: Option<PathBuf>,
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default = "config_defaults::default_threshold_amount")]
    settlement_threshold_amount: Decimal,
    #[serde(default = "config_defaults::default_threshold_time")]
    settlement_threshold_time: u64,
    #[serde(default = "config_defaults::default_threshold_count")]
    settlement_threshold_count: usize,
    #[serde(default = "config_defaults::default_auto_settlement")]
    auto_settlement: bool,
    #[serde(default = "config_defaults::default_check_interval")]
    settlement_check_interval: u64,
    #[serde(default = "config_defaults::default_snapshot_interval")]
    metrics_snapshot_interval: u64,
    #[serde(default = "config_defaults::default_solana_rpc_url")]
    solana_rpc_url: String,
    #[serde(default = "config_defaults::default_usdc_mint")]
    usdc_mint: String,
    #[serde(default = "config_defaults::default_solana_private_key")]
    solana_private_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            settlement_threshold_amount: config_defaults::default_threshold_amount(),
            settlement_threshold_time: config_defaults::default_threshold_time(),
            settlement_threshold_count: config_defaults::default_threshold_count(),
            auto_settlement: config_defaults::default_auto_settlement(),
            settlement_check_interval: config_defaults::default_check_interval(),
            metrics_snapshot_interval: config_defaults::default_snapshot_interval(),
            solana_rpc_url: config_defaults::default_solana_rpc_url(),
            usdc_mint: config_defaults::default_usdc_mint(),
            solana_private_key: config_defaults::default_solana_private_key(),
        }
    }
}

mod config_defaults {
    use rust_decimal::Decimal;
    use std::env;
    use std::net::IpAddr;
    use std::str::FromStr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_THRESHOLD_AMOUNT: &str = "1.00";
    pub const DEFAULT_THRESHOLD_TIME: u64 = 3600;
    pub const DEFAULT_THRESHOLD_COUNT: usize = 100;
    pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 60_000;
    pub const DEFAULT_SNAPSHOT_INTERVAL_S: u64 = 300;
    pub const DEFAULT_SOLANA_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
    pub const DEFAULT_USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    /// $PORT env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }

    /// $SETTLEMENT_THRESHOLD_AMOUNT env var -> 1.00
    pub fn default_threshold_amount() -> Decimal {
        env::var("SETTLEMENT_THRESHOLD_AMOUNT")
            .ok()
            .and_then(|s| Decimal::from_str(&s).ok())
            .unwrap_or_else(|| Decimal::from_str(DEFAULT_THRESHOLD_AMOUNT).expect("valid decimal"))
    }

    /// $SETTLEMENT_THRESHOLD_TIME env var (seconds) -> 3600
    pub fn default_threshold_time() -> u64 {
        env::var("SETTLEMENT_THRESHOLD_TIME")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_THRESHOLD_TIME)
    }

    /// $SETTLEMENT_THRESHOLD_COUNT env var -> 100
    pub fn default_threshold_count() -> usize {
        env::var("SETTLEMENT_THRESHOLD_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_THRESHOLD_COUNT)
    }

    /// $AUTO_SETTLEMENT env var -> true
    pub fn default_auto_settlement() -> bool {
        env::var("AUTO_SETTLEMENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(true)
    }

    /// $SETTLEMENT_CHECK_INTERVAL env var (milliseconds) -> 60000
    pub fn default_check_interval() -> u64 {
        env::var("SETTLEMENT_CHECK_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHECK_INTERVAL_MS)
    }

    /// $METRICS_SNAPSHOT_INTERVAL env var (seconds) -> 300
    pub fn default_snapshot_interval() -> u64 {
        env::var("METRICS_SNAPSHOT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SNAPSHOT_INTERVAL_S)
    }

    /// $SOLANA_RPC_URL env var -> mainnet public RPC
    pub fn default_solana_rpc_url() -> String {
        env::var("SOLANA_RPC_URL").unwrap_or_else(|_| DEFAULT_SOLANA_RPC_URL.to_string())
    }

    /// $USDC_MINT env var -> mainnet USDC mint
    pub fn default_usdc_mint() -> String {
        env::var("USDC_MINT").unwrap_or_else(|_| DEFAULT_USDC_MINT.to_string())
    }

    /// $SOLANA_PRIVATE_KEY env var (base58 keypair) -> none
    pub fn default_solana_private_key() -> Option<String> {
        env::var("SOLANA_PRIVATE_KEY").ok()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by:
    /// 1. `--config <path>` CLI argument
    /// 2. `./config.json` (if it exists)
    ///
    /// Values not present in the config file will be resolved via
    /// environment variables or defaults during deserialization.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Self::get_config_path(cli_args.config);
        Self::load_from_path(config_path)
    }

    fn load_from_path(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let content = fs::read_to_string(&p)?;
                let config: Config = serde_json::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    fn get_config_path(cli_config: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(path) = cli_config {
            return Some(path);
        }
        let default_path = PathBuf::from("config.json");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// The settlement trigger thresholds.
    pub fn thresholds(&self) -> SettlementThreshold {
        SettlementThreshold {
            amount_threshold: self.settlement_threshold_amount,
            time_threshold: self.settlement_threshold_time,
            count_threshold: self.settlement_threshold_count,
        }
    }

    /// Whether the settlement scheduler starts at boot.
    pub fn auto_settlement(&self) -> bool {
        self.auto_settlement
    }

    /// Interval between settlement scheduler ticks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.settlement_check_interval)
    }

    /// Interval between metrics history snapshots.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_snapshot_interval)
    }

    pub fn solana_rpc_url(&self) -> &str {
        &self.solana_rpc_url
    }

    pub fn usdc_mint(&self) -> &str {
        &self.usdc_mint
    }

    /// Base58 operator keypair for on-chain dispatch, if configured.
    pub fn solana_private_key(&self) -> Option<&str> {
        self.solana_private_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::str::FromStr;

    fn clear_env() {
        // SAFETY: This is safe in a single-threaded test context
        unsafe {
            env::remove_var("PORT");
            env::remove_var("HOST");
            env::remove_var("SETTLEMENT_THRESHOLD_AMOUNT");
            env::remove_var("SETTLEMENT_THRESHOLD_TIME");
            env::remove_var("SETTLEMENT_THRESHOLD_COUNT");
            env::remove_var("AUTO_SETTLEMENT");
            env::remove_var("SETTLEMENT_CHECK_INTERVAL");
            env::remove_var("METRICS_SNAPSHOT_INTERVAL");
        }
    }

    #[test]
    fn test_config_parsing_full() {
        let json = r#"{
            "port": 3000,
            "host": "127.0.0.1",
            "settlement_threshold_amount": "2.50",
            "settlement_threshold_time": 600,
            "settlement_threshold_count": 10,
            "auto_settlement": false,
            "settlement_check_interval": 5000
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port(), 3000);
        assert_eq!(config.host().to_string(), "127.0.0.1");
        let thresholds = config.thresholds();
        assert_eq!(thresholds.amount_threshold, Decimal::from_str("2.50").unwrap());
        assert_eq!(thresholds.time_threshold, 600);
        assert_eq!(thresholds.count_threshold, 10);
        assert!(!config.auto_settlement());
        assert_eq!(config.check_interval(), Duration::from_millis(5000));
    }

    #[test]
    fn test_config_parsing_empty() {
        clear_env();
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port(), 8080);
        assert_eq!(config.host().to_string(), "0.0.0.0");
        let thresholds = config.thresholds();
        assert_eq!(thresholds.amount_threshold.to_string(), "1.00");
        assert_eq!(thresholds.time_threshold, 3600);
        assert_eq!(thresholds.count_threshold, 100);
        assert!(config.auto_settlement());
        assert_eq!(config.check_interval(), Duration::from_millis(60_000));
        assert_eq!(config.snapshot_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_config_default_matches_documented_defaults() {
        clear_env();
        let config = Config::default();
        assert_eq!(config.port(), 8080);
        assert_eq!(
            config.usdc_mint(),
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
        );
        assert!(config.solana_rpc_url().starts_with("https://"));
    }

    #[test]
    fn test_env_overrides_thresholds() {
        // SAFETY: This is safe in a single-threaded test context
        unsafe {
            env::set_var("SETTLEMENT_THRESHOLD_AMOUNT", "0.25");
            env::set_var("SETTLEMENT_THRESHOLD_COUNT", "5");
        }
        let config: Config = serde_json::from_str("{}").unwrap();
        let thresholds = config.thresholds();
        assert_eq!(thresholds.amount_threshold, Decimal::from_str("0.25").unwrap());
        assert_eq!(thresholds.count_threshold, 5);
        // SAFETY: This is safe in a single-threaded test context
        unsafe {
            env::remove_var("SETTLEMENT_THRESHOLD_AMOUNT");
            env::remove_var("SETTLEMENT_THRESHOLD_COUNT");
        }
    }

    #[test]
    fn test_get_config_path_with_cli_arg() {
        let path = Config::get_config_path(Some(PathBuf::from("/custom/config.json")));
        assert_eq!(path, Some(PathBuf::from("/custom/config.json")));
    }
}
