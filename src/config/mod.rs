//! Configuration management for PolyHook
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub trading: TradingConfig,
    pub exchange: ExchangeConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Worker version tag for logging and CSV
    pub tag: String,
    /// Concurrent signal jobs
    pub signal_concurrency: usize,
    /// Concurrent metrics jobs
    pub metrics_concurrency: usize,
    /// Maximum attempts for a job hitting transient errors
    pub max_retries: usize,
    /// Initial retry backoff in milliseconds (doubles per attempt)
    pub retry_backoff_ms: u64,
    /// Claim scanner interval in seconds
    pub claim_scan_interval_secs: u64,
}

/// Process-wide trading safety configuration, consumed once at startup by the
/// safety controller. No business logic lives here.
#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Configured trading mode: "mock", "gamma" or "mainnet"
    pub mode: String,
    /// Operator confirmation phrase; must equal
    /// "I_UNDERSTAND_LIVE_TRADING" for the effective mode to leave mock
    pub live_confirm: String,
    /// Maximum single trade size in USDC (upper bound over per-bot config)
    pub max_trade_usdc: f64,
    /// Maximum total notional placed per local day across all bots
    pub max_daily_notional_usdc: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// CLOB API endpoint (mainnet)
    pub clob_url: String,
    /// Gamma API endpoint (sandbox + market discovery)
    pub gamma_url: String,
    /// Polygon chain ID (137)
    pub chain_id: u64,
    /// Per-call timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Market discovery refresh interval in seconds
    pub market_refresh_secs: u64,
    /// Mock client: simulated slippage bound in basis points
    pub mock_slippage_bps: f64,
    /// Mock client: simulated fee in basis points
    pub mock_fee_bps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for CSV audit files
    pub data_dir: String,
    /// Enable CSV logging
    pub csv_enabled: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Worker defaults
            .set_default("worker.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("worker.signal_concurrency", 5)?
            .set_default("worker.metrics_concurrency", 10)?
            .set_default("worker.max_retries", 3)?
            .set_default("worker.retry_backoff_ms", 250)?
            .set_default("worker.claim_scan_interval_secs", 300)?
            // Trading defaults: mock unless explicitly configured otherwise
            .set_default("trading.mode", "mock")?
            .set_default("trading.live_confirm", "")?
            .set_default("trading.max_trade_usdc", 100.0)?
            .set_default("trading.max_daily_notional_usdc", 1000.0)?
            // Exchange defaults
            .set_default("exchange.clob_url", "https://clob.polymarket.com")?
            .set_default("exchange.gamma_url", "https://gamma-api.polymarket.com")?
            .set_default("exchange.chain_id", 137)?
            .set_default("exchange.request_timeout_ms", 5000)?
            .set_default("exchange.market_refresh_secs", 60)?
            .set_default("exchange.mock_slippage_bps", 5.0)?
            .set_default("exchange.mock_fee_bps", 10.0)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (POLYHOOK_*)
            .add_source(Environment::with_prefix("POLYHOOK").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.trading.mode.as_str(), "mock" | "gamma" | "mainnet") {
            bail!(
                "trading.mode must be one of mock/gamma/mainnet, got '{}'",
                self.trading.mode
            );
        }
        if self.worker.signal_concurrency == 0 || self.worker.metrics_concurrency == 0 {
            bail!("worker concurrency must be at least 1");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "worker={} mode={} signal_conc={} metrics_conc={} scan_secs={}",
            self.worker.tag,
            self.trading.mode,
            self.worker.signal_concurrency,
            self.worker.metrics_concurrency,
            self.worker.claim_scan_interval_secs
        )
    }

    /// Validate required environment variables for non-mock modes
    pub fn validate_env(&self) -> Result<()> {
        if self.trading.mode == "mock" {
            return Ok(());
        }

        let required = vec!["PRIVATE_KEY", "POLYMARKET_ADDRESS"];

        for var in required {
            if std::env::var(var).is_err() {
                bail!("Required environment variable {} is not set", var);
            }
        }

        // Validate private key format
        let pk = std::env::var("PRIVATE_KEY")?;
        if !pk.starts_with("0x") || pk.len() != 66 {
            bail!("PRIVATE_KEY must be a hex string with 0x prefix (66 chars total)");
        }

        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            worker: WorkerConfig {
                tag: "test".to_string(),
                signal_concurrency: 5,
                metrics_concurrency: 10,
                max_retries: 3,
                retry_backoff_ms: 250,
                claim_scan_interval_secs: 300,
            },
            trading: TradingConfig {
                mode: "mock".to_string(),
                live_confirm: String::new(),
                max_trade_usdc: 100.0,
                max_daily_notional_usdc: 1000.0,
            },
            exchange: ExchangeConfig {
                clob_url: "https://clob.polymarket.com".to_string(),
                gamma_url: "https://gamma-api.polymarket.com".to_string(),
                chain_id: 137,
                request_timeout_ms: 5000,
                market_refresh_secs: 60,
                mock_slippage_bps: 5.0,
                mock_fee_bps: 10.0,
            },
            persistence: PersistenceConfig {
                data_dir: "./data".to_string(),
                csv_enabled: true,
            },
        }
    }

    #[test]
    fn test_validate_rejects_unknown_mode() {
        let mut cfg = base_config();
        cfg.trading.mode = "paper".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut cfg = base_config();
        cfg.worker.signal_concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mock_mode_needs_no_env() {
        let cfg = base_config();
        assert!(cfg.validate_env().is_ok());
    }

    #[test]
    fn test_digest_contains_mode() {
        let cfg = base_config();
        assert!(cfg.digest().contains("mode=mock"));
    }
}
