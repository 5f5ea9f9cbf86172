//! Trading-Mode Safety Controller
//!
//! Decides once, at worker startup, whether this process may submit real
//! orders. The configured mode only takes effect after wallet diagnostics
//! pass and the operator has confirmed live trading; any failure downgrades
//! the effective mode to mock. The result is read-only for the process
//! lifetime and is the only constructor path for a live exchange client, so
//! an unconfirmed live order is impossible by construction.

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{AppConfig, ExchangeConfig};
use crate::exchange::{
    ClobClient, ClobCredentials, ExchangeClient, MarketDirectory, MarketDiscovery, MockExchange,
    StaticMarkets,
};

/// Operator confirmation phrase required to leave mock mode
pub const LIVE_CONFIRM_PHRASE: &str = "I_UNDERSTAND_LIVE_TRADING";

/// Trading mode for a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradingMode {
    /// Simulated fills, no network writes
    Mock,
    /// Sandbox live API
    Gamma,
    /// Real funds
    Mainnet,
}

impl TradingMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mock" => Some(TradingMode::Mock),
            "gamma" => Some(TradingMode::Gamma),
            "mainnet" => Some(TradingMode::Mainnet),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, TradingMode::Mock)
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Mock => write!(f, "mock"),
            TradingMode::Gamma => write!(f, "gamma"),
            TradingMode::Mainnet => write!(f, "mainnet"),
        }
    }
}

/// Outcome of startup wallet diagnostics
#[derive(Debug, Clone, Default)]
pub struct WalletDiagnostics {
    pub wallet_ok: bool,
    pub credentials_ok: bool,
    pub network_ok: bool,
    pub balance_usdc: Option<f64>,
    /// Human-readable reasons for every failed check
    pub failures: Vec<String>,
}

impl WalletDiagnostics {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Wallet key + API credentials resolved from the environment
struct LiveIdentity {
    wallet: LocalWallet,
    credentials: ClobCredentials,
}

impl LiveIdentity {
    fn from_env(chain_id: u64) -> Result<Self> {
        let pk = std::env::var("PRIVATE_KEY").context("PRIVATE_KEY is not set")?;
        let wallet: LocalWallet = pk
            .trim_start_matches("0x")
            .parse()
            .context("PRIVATE_KEY is not a valid secp256k1 key")?;
        let wallet = wallet.with_chain_id(chain_id);

        let configured: Address = std::env::var("POLYMARKET_ADDRESS")
            .context("POLYMARKET_ADDRESS is not set")?
            .parse()
            .context("POLYMARKET_ADDRESS is not a valid address")?;
        if wallet.address() != configured {
            anyhow::bail!(
                "POLYMARKET_ADDRESS {:?} does not match the key's address {:?}",
                configured,
                wallet.address()
            );
        }

        let credentials = ClobCredentials::from_env()
            .context("POLY_API_KEY / POLY_API_SECRET / POLY_API_PASSPHRASE not configured")?;
        Ok(Self {
            wallet,
            credentials,
        })
    }
}

/// Process-wide safety state, computed once and then read-only.
///
/// Constructed at startup and passed by `Arc` into every worker task.
pub struct SafetyController {
    configured: TradingMode,
    effective: TradingMode,
    live_confirmed: bool,
    diagnostics: WalletDiagnostics,
    exchange_config: ExchangeConfig,
    /// Present only when diagnostics passed for a confirmed live mode
    live_identity: Option<LiveIdentity>,
}

impl SafetyController {
    /// Run startup diagnostics and fix the effective mode for this process.
    pub async fn initialize(config: &AppConfig) -> Self {
        let configured =
            TradingMode::from_str(&config.trading.mode).unwrap_or(TradingMode::Mock);

        if configured == TradingMode::Mock {
            info!(mode = %configured, "trading mode: mock (no diagnostics needed)");
            return Self::forced_mock(configured, config.exchange.clone(), WalletDiagnostics::default());
        }

        let mut diagnostics = WalletDiagnostics::default();
        let confirmed = config.trading.live_confirm == LIVE_CONFIRM_PHRASE;
        if !confirmed {
            diagnostics
                .failures
                .push("live trading not confirmed by operator".to_string());
        }

        let identity = match LiveIdentity::from_env(config.exchange.chain_id) {
            Ok(identity) => {
                diagnostics.wallet_ok = true;
                diagnostics.credentials_ok = true;
                Some(identity)
            }
            Err(e) => {
                diagnostics.failures.push(format!("wallet diagnostics: {e:#}"));
                None
            }
        };

        // Only probe the network once local checks hold
        if confirmed && identity.is_some() {
            let base_url = Self::endpoint_for(configured, &config.exchange);
            let timeout = Duration::from_millis(config.exchange.request_timeout_ms);
            match probe_exchange(base_url, timeout).await {
                Ok(balance) => {
                    diagnostics.network_ok = true;
                    diagnostics.balance_usdc = balance;
                }
                Err(e) => {
                    diagnostics.failures.push(format!("exchange unreachable: {e:#}"));
                }
            }
        }

        if confirmed && diagnostics.passed() {
            info!(mode = %configured, "live trading confirmed, diagnostics passed");
            Self {
                configured,
                effective: configured,
                live_confirmed: true,
                diagnostics,
                exchange_config: config.exchange.clone(),
                live_identity: identity,
            }
        } else {
            for failure in &diagnostics.failures {
                warn!(configured = %configured, reason = %failure, "forcing mock mode");
            }
            Self::forced_mock(configured, config.exchange.clone(), diagnostics)
        }
    }

    fn forced_mock(
        configured: TradingMode,
        exchange_config: ExchangeConfig,
        diagnostics: WalletDiagnostics,
    ) -> Self {
        Self {
            configured,
            effective: TradingMode::Mock,
            live_confirmed: false,
            diagnostics,
            exchange_config,
            live_identity: None,
        }
    }

    /// Controller that always simulates, for tests and tooling
    pub fn mock(exchange_config: ExchangeConfig) -> Self {
        Self::forced_mock(
            TradingMode::Mock,
            exchange_config,
            WalletDiagnostics::default(),
        )
    }

    fn endpoint_for(mode: TradingMode, exchange: &ExchangeConfig) -> &str {
        match mode {
            TradingMode::Gamma => &exchange.gamma_url,
            _ => &exchange.clob_url,
        }
    }

    /// The safety-gated mode actually in force
    pub fn effective_mode(&self) -> TradingMode {
        self.effective
    }

    /// The mode the operator configured, before any downgrade
    pub fn configured_mode(&self) -> TradingMode {
        self.configured
    }

    pub fn is_live_confirmed(&self) -> bool {
        self.live_confirmed
    }

    pub fn diagnostics(&self) -> &WalletDiagnostics {
        &self.diagnostics
    }

    /// Build the exchange client for this process. A live client only exists
    /// when the effective mode is live, which in turn requires confirmed
    /// diagnostics - there is no other construction path.
    pub fn build_exchange_client(&self) -> Result<Arc<dyn ExchangeClient>> {
        match (self.effective, &self.live_identity) {
            (TradingMode::Mock, _) | (_, None) => Ok(Arc::new(MockExchange::new(
                self.exchange_config.mock_slippage_bps,
                self.exchange_config.mock_fee_bps,
            ))),
            (mode, Some(identity)) => {
                let client = ClobClient::new(
                    Self::endpoint_for(mode, &self.exchange_config),
                    identity.credentials.clone(),
                    identity.wallet.clone(),
                    self.exchange_config.chain_id,
                    Duration::from_millis(self.exchange_config.request_timeout_ms),
                )
                .context("failed to construct CLOB client")?;
                Ok(Arc::new(client))
            }
        }
    }

    /// Build the market-discovery collaborator matching the effective mode
    pub fn build_market_directory(&self) -> Arc<dyn MarketDirectory> {
        if self.effective.is_live() {
            Arc::new(MarketDiscovery::new(
                self.exchange_config.gamma_url.clone(),
                self.exchange_config.market_refresh_secs,
            ))
        } else {
            Arc::new(StaticMarkets)
        }
    }
}

/// Reachability + collateral-balance probe against the exchange endpoint
async fn probe_exchange(base_url: &str, timeout: Duration) -> Result<Option<f64>> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build probe client")?;

    let response = client
        .get(format!("{}/time", base_url.trim_end_matches('/')))
        .send()
        .await
        .context("exchange /time probe failed")?;
    if !response.status().is_success() {
        anyhow::bail!("exchange /time returned {}", response.status());
    }

    // Balance endpoint is best-effort: reachable-but-absent is not a failure,
    // an unreadable balance on a reachable exchange is.
    let address = std::env::var("POLYMARKET_ADDRESS").unwrap_or_default();
    let response = client
        .get(format!(
            "{}/balance?address={}",
            base_url.trim_end_matches('/'),
            address
        ))
        .send()
        .await
        .context("exchange balance probe failed")?;
    if response.status().is_success() {
        #[derive(serde::Deserialize)]
        struct Balance {
            balance: f64,
        }
        let parsed: Balance = response
            .json()
            .await
            .context("exchange balance response unreadable")?;
        Ok(Some(parsed.balance))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PersistenceConfig, TradingConfig, WorkerConfig};

    fn app_config(mode: &str, confirm: &str) -> AppConfig {
        AppConfig {
            worker: WorkerConfig {
                tag: "test".to_string(),
                signal_concurrency: 2,
                metrics_concurrency: 2,
                max_retries: 1,
                retry_backoff_ms: 1,
                claim_scan_interval_secs: 60,
            },
            trading: TradingConfig {
                mode: mode.to_string(),
                live_confirm: confirm.to_string(),
                max_trade_usdc: 100.0,
                max_daily_notional_usdc: 1000.0,
            },
            exchange: ExchangeConfig {
                clob_url: "http://127.0.0.1:9".to_string(),
                gamma_url: "http://127.0.0.1:9".to_string(),
                chain_id: 137,
                request_timeout_ms: 100,
                market_refresh_secs: 60,
                mock_slippage_bps: 5.0,
                mock_fee_bps: 10.0,
            },
            persistence: PersistenceConfig {
                data_dir: "./data".to_string(),
                csv_enabled: false,
            },
        }
    }

    #[tokio::test]
    async fn test_mock_mode_skips_diagnostics() {
        let controller = SafetyController::initialize(&app_config("mock", "")).await;
        assert_eq!(controller.effective_mode(), TradingMode::Mock);
        assert!(!controller.is_live_confirmed());
    }

    #[tokio::test]
    async fn test_unconfirmed_mainnet_forces_mock() {
        let controller = SafetyController::initialize(&app_config("mainnet", "")).await;
        assert_eq!(controller.configured_mode(), TradingMode::Mainnet);
        assert_eq!(controller.effective_mode(), TradingMode::Mock);
        assert!(!controller.is_live_confirmed());
        assert!(!controller.diagnostics().passed());
    }

    #[tokio::test]
    async fn test_failed_diagnostics_force_mock_for_process_lifetime() {
        // Confirmed, but no wallet env and an unreachable endpoint: the
        // effective mode must be mock and only a mock client constructible.
        let controller =
            SafetyController::initialize(&app_config("mainnet", LIVE_CONFIRM_PHRASE)).await;
        assert_eq!(controller.effective_mode(), TradingMode::Mock);

        let client = controller.build_exchange_client().unwrap();
        // The mock client never touches the network; submitting works locally.
        let fill = client
            .submit_order(&crate::exchange::OrderRequest {
                condition_id: "cond-1".to_string(),
                outcome: crate::types::Outcome::Yes,
                side: crate::types::OrderSide::Buy,
                price: 0.5,
                size_usdc: 5.0,
                shares: 0.0,
            })
            .await
            .unwrap();
        assert!(fill.exchange_order_id.starts_with("mock-"));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(TradingMode::from_str("MOCK"), Some(TradingMode::Mock));
        assert_eq!(TradingMode::from_str("gamma"), Some(TradingMode::Gamma));
        assert_eq!(TradingMode::from_str("mainnet"), Some(TradingMode::Mainnet));
        assert_eq!(TradingMode::from_str("paper"), None);
        assert!(TradingMode::Gamma.is_live());
        assert!(!TradingMode::Mock.is_live());
    }

    #[test]
    fn test_mock_controller_builds_static_directory() {
        let controller = SafetyController::mock(app_config("mock", "").exchange);
        assert_eq!(controller.effective_mode(), TradingMode::Mock);
        let _directory = controller.build_market_directory();
    }
}
