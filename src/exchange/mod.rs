//! Exchange client capability
//!
//! The pipeline treats the exchange as an opaque capability: submit an order,
//! read a price, read a resolution status, claim settlement value. The mock
//! client simulates fills locally; the CLOB client talks to the real
//! (sandbox or mainnet) API. Which one a worker gets is decided by the
//! safety controller, never by call sites.

pub mod clob;
pub mod discovery;
pub mod mock;

pub use clob::{ClobClient, ClobCredentials};
pub use discovery::{DiscoveredMarket, MarketDirectory, MarketDiscovery, StaticMarkets};
pub use mock::MockExchange;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Outcome, OrderSide};

/// Errors surfaced by exchange clients.
///
/// The transient/terminal split drives the queue's retry classification:
/// transient errors are retried with backoff, terminal ones reject the order.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange call timed out")]
    Timeout,
    #[error("exchange transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("exchange API error: {0}")]
    Api(String),
    #[error("order rejected by exchange: {0}")]
    Rejected(String),
    #[error("malformed exchange response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    /// Whether the surrounding job runner should retry this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout | ExchangeError::Transport(_) | ExchangeError::Api(_)
        )
    }
}

/// One order toward the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Market condition ID
    pub condition_id: String,
    /// Outcome token to trade
    pub outcome: Outcome,
    /// BUY or SELL
    pub side: OrderSide,
    /// Reference share price the caller observed (0.01 - 0.99)
    pub price: f64,
    /// Notional in USDC for buys; for sells, the share count to unwind
    pub size_usdc: f64,
    /// Shares to sell (ignored for buys)
    pub shares: f64,
}

/// Confirmed execution returned by `submit_order`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillReport {
    /// Exchange-side order ID
    pub exchange_order_id: String,
    /// Execution price per share
    pub price: f64,
    /// Shares executed
    pub shares: f64,
    /// Executed notional in USDC
    pub size_usdc: f64,
    /// Fee charged in USDC
    pub fee_usdc: f64,
}

/// Market resolution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStatus {
    Open,
    Resolved,
}

/// Result of claiming a resolved position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResult {
    /// USDC credited
    pub amount_usdc: f64,
    /// Transaction reference
    pub tx_ref: String,
}

/// The opaque exchange capability the pipeline depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order and await its confirmation. Every call carries the
    /// client's configured timeout; a timed-out call returns
    /// `ExchangeError::Timeout` rather than leaving the order in flight.
    async fn submit_order(&self, request: &OrderRequest) -> Result<FillReport, ExchangeError>;

    /// Current reference price for an outcome token
    async fn market_price(&self, condition_id: &str, outcome: Outcome)
        -> Result<f64, ExchangeError>;

    /// Whether a market has resolved
    async fn resolution_status(&self, condition_id: &str)
        -> Result<ResolutionStatus, ExchangeError>;

    /// Claim settlement value from a resolved market
    async fn claim(&self, condition_id: &str) -> Result<ClaimResult, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout.is_transient());
        assert!(ExchangeError::Api("502".to_string()).is_transient());
        assert!(!ExchangeError::Rejected("insufficient balance".to_string()).is_transient());
        assert!(!ExchangeError::InvalidResponse("bad json".to_string()).is_transient());
    }
}
