//! Mock exchange client
//!
//! Simulates fills locally with bounded synthetic slippage and fees so the
//! whole pipeline runs without touching the network. Also the fail-safe
//! client the safety controller falls back to when diagnostics fail.

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    ClaimResult, ExchangeClient, ExchangeError, FillReport, OrderRequest, ResolutionStatus,
};
use crate::types::{Outcome, OrderSide};

/// In-process exchange simulator.
///
/// Prices default to 0.50 per outcome token and can be pinned per market for
/// tests. Write operations (order submission, claims) are counted so tests
/// can assert that a pass performed zero writes.
pub struct MockExchange {
    /// Simulated slippage bound in basis points
    slippage_bps: f64,
    /// Simulated fee in basis points of notional
    fee_bps: f64,
    /// Pinned prices per (condition_id, outcome)
    prices: RwLock<HashMap<(String, Outcome), f64>>,
    /// Resolution status per condition_id (default: open)
    resolutions: RwLock<HashMap<String, ResolutionStatus>>,
    /// Claimable USDC per condition_id
    claimables: RwLock<HashMap<String, f64>>,
    /// Markets already claimed
    claimed: RwLock<HashSet<String>>,
    submit_calls: AtomicUsize,
    claim_calls: AtomicUsize,
}

impl MockExchange {
    pub fn new(slippage_bps: f64, fee_bps: f64) -> Self {
        Self {
            slippage_bps,
            fee_bps,
            prices: RwLock::new(HashMap::new()),
            resolutions: RwLock::new(HashMap::new()),
            claimables: RwLock::new(HashMap::new()),
            claimed: RwLock::new(HashSet::new()),
            submit_calls: AtomicUsize::new(0),
            claim_calls: AtomicUsize::new(0),
        }
    }

    /// Pin the reference price for an outcome token
    pub fn set_price(&self, condition_id: &str, outcome: Outcome, price: f64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert((condition_id.to_string(), outcome), price);
        }
    }

    /// Mark a market resolved with the given claimable value
    pub fn resolve_market(&self, condition_id: &str, claimable_usdc: f64) {
        if let Ok(mut resolutions) = self.resolutions.write() {
            resolutions.insert(condition_id.to_string(), ResolutionStatus::Resolved);
        }
        if let Ok(mut claimables) = self.claimables.write() {
            claimables.insert(condition_id.to_string(), claimable_usdc);
        }
    }

    /// Number of submit_order calls made against this client
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Number of claim calls made against this client
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    fn reference_price(&self, condition_id: &str, outcome: Outcome) -> f64 {
        self.prices
            .read()
            .ok()
            .and_then(|p| p.get(&(condition_id.to_string(), outcome)).copied())
            .unwrap_or(0.50)
    }

    /// Slip the price against the taker, bounded by `slippage_bps`
    fn slipped_price(&self, reference: f64, side: OrderSide) -> f64 {
        let slip_bps = rand::thread_rng().gen_range(0.0..=self.slippage_bps);
        let factor = slip_bps / 10_000.0;
        let price = match side {
            OrderSide::Buy => reference * (1.0 + factor),
            OrderSide::Sell => reference * (1.0 - factor),
        };
        price.clamp(0.01, 0.99)
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn submit_order(&self, request: &OrderRequest) -> Result<FillReport, ExchangeError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        let reference = self.reference_price(&request.condition_id, request.outcome);
        let price = self.slipped_price(reference, request.side);

        let (shares, notional) = match request.side {
            OrderSide::Buy => {
                let shares = request.size_usdc / price;
                (shares, request.size_usdc)
            }
            OrderSide::Sell => {
                let notional = request.shares * price;
                (request.shares, notional)
            }
        };
        let fee_usdc = notional * self.fee_bps / 10_000.0;

        let report = FillReport {
            exchange_order_id: format!("mock-{}", Uuid::new_v4()),
            price,
            shares,
            size_usdc: notional,
            fee_usdc,
        };
        debug!(
            condition_id = %request.condition_id,
            side = %request.side,
            price = report.price,
            shares = report.shares,
            "mock fill"
        );
        Ok(report)
    }

    async fn market_price(
        &self,
        condition_id: &str,
        outcome: Outcome,
    ) -> Result<f64, ExchangeError> {
        Ok(self.reference_price(condition_id, outcome))
    }

    async fn resolution_status(
        &self,
        condition_id: &str,
    ) -> Result<ResolutionStatus, ExchangeError> {
        Ok(self
            .resolutions
            .read()
            .ok()
            .and_then(|r| r.get(condition_id).copied())
            .unwrap_or(ResolutionStatus::Open))
    }

    async fn claim(&self, condition_id: &str) -> Result<ClaimResult, ExchangeError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);

        let already_claimed = self
            .claimed
            .read()
            .map(|c| c.contains(condition_id))
            .unwrap_or(false);
        if already_claimed {
            // Idempotent: the position is gone, nothing further to credit
            return Ok(ClaimResult {
                amount_usdc: 0.0,
                tx_ref: format!("noop-{}", condition_id),
            });
        }

        let amount = self
            .claimables
            .read()
            .ok()
            .and_then(|c| c.get(condition_id).copied())
            .unwrap_or(0.0);
        if let Ok(mut claimed) = self.claimed.write() {
            claimed.insert(condition_id.to_string());
        }
        Ok(ClaimResult {
            amount_usdc: amount,
            tx_ref: format!("mock-tx-{}", Uuid::new_v4()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(side: OrderSide) -> OrderRequest {
        OrderRequest {
            condition_id: "cond-1".to_string(),
            outcome: Outcome::Yes,
            side,
            price: 0.50,
            size_usdc: 10.0,
            shares: 20.0,
        }
    }

    #[tokio::test]
    async fn test_buy_fill_slippage_is_bounded() {
        let exchange = MockExchange::new(50.0, 10.0);
        exchange.set_price("cond-1", Outcome::Yes, 0.50);

        for _ in 0..50 {
            let fill = exchange.submit_order(&request(OrderSide::Buy)).await.unwrap();
            // Buy slips upward only, by at most 50 bps
            assert!(fill.price >= 0.50);
            assert!(fill.price <= 0.50 * 1.005 + 1e-9);
            assert!((fill.shares * fill.price - fill.size_usdc).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_sell_fill_slips_downward() {
        let exchange = MockExchange::new(50.0, 0.0);
        exchange.set_price("cond-1", Outcome::Yes, 0.60);

        let fill = exchange.submit_order(&request(OrderSide::Sell)).await.unwrap();
        assert!(fill.price <= 0.60);
        assert!(fill.price >= 0.60 * 0.995 - 1e-9);
        assert!((fill.shares - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fee_proportional_to_notional() {
        let exchange = MockExchange::new(0.0, 100.0); // 1% fee, no slippage
        let fill = exchange.submit_order(&request(OrderSide::Buy)).await.unwrap();
        assert!((fill.fee_usdc - fill.size_usdc * 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_claim_is_idempotent() {
        let exchange = MockExchange::new(0.0, 0.0);
        exchange.resolve_market("cond-9", 42.0);

        let first = exchange.claim("cond-9").await.unwrap();
        assert!((first.amount_usdc - 42.0).abs() < 1e-9);

        let second = exchange.claim("cond-9").await.unwrap();
        assert_eq!(second.amount_usdc, 0.0);
        assert_eq!(exchange.claim_calls(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_market_reads_open() {
        let exchange = MockExchange::new(0.0, 0.0);
        let status = exchange.resolution_status("unknown").await.unwrap();
        assert_eq!(status, ResolutionStatus::Open);
        assert_eq!(exchange.submit_calls(), 0);
    }
}
