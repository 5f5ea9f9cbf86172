//! Position & Metrics Engine
//!
//! Derives a bot's performance snapshot by replaying its full fill ledger.
//! The replay is deliberately not incremental: positions and PnL are rebuilt
//! from scratch on every pass so that recomputing the same ledger twice
//! always yields the same snapshot, at the cost of re-reading history.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::exchange::ExchangeClient;
use crate::persistence::{CsvAudit, MetricsRecord};
use crate::store::Store;
use crate::types::{BotMetrics, Fill, Outcome, OrderSide};

/// Running position per (market, outcome) during replay
#[derive(Debug, Clone, Default)]
struct PositionState {
    total_shares: f64,
    total_cost: f64,
}

/// An open position left at the end of a replay
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub condition_id: String,
    pub outcome: Outcome,
    pub shares: f64,
    pub cost_usdc: f64,
}

/// Everything a full replay derives from the fill ledger
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    /// PnL realized by closed positions
    pub realized_pnl: f64,
    /// Σ(notional + fee) over every fill
    pub capital_deployed: f64,
    pub closed_trades: u64,
    pub winning_trades: u64,
    /// Most negative peak-to-trough move of the running cash-flow series
    pub max_drawdown: f64,
    pub fill_count: u64,
    /// Positions with shares remaining
    pub open_positions: Vec<OpenPosition>,
}

/// Replay the fill ledger. `fills` must already be in non-decreasing
/// `filled_at` order (the store guarantees it); the output is a pure function
/// of that sequence.
pub fn replay_fills(fills: &[Fill]) -> Ledger {
    let mut positions: HashMap<(String, Outcome), PositionState> = HashMap::new();
    let mut ledger = Ledger::default();

    let mut running = 0.0;
    let mut series = Vec::with_capacity(fills.len() + 1);
    series.push(0.0);

    for fill in fills {
        ledger.fill_count += 1;
        ledger.capital_deployed += fill.price * fill.shares + fill.fee_usdc;

        running += fill.cash_flow();
        series.push(running);

        let key = (fill.condition_id.clone(), fill.outcome);
        let position = positions.entry(key.clone()).or_default();
        match fill.side {
            OrderSide::Buy => {
                position.total_shares += fill.shares;
                position.total_cost += fill.price * fill.shares + fill.fee_usdc;
            }
            OrderSide::Sell => {
                position.total_shares -= fill.shares;
                position.total_cost -= fill.price * fill.shares - fill.fee_usdc;
            }
        }

        // Crossing to zero (or below) closes the position: the sign of the
        // leftover cost decides win or loss.
        if position.total_shares <= 1e-9 {
            ledger.closed_trades += 1;
            if position.total_cost < 0.0 {
                ledger.winning_trades += 1;
            }
            ledger.realized_pnl += -position.total_cost;
            positions.remove(&key);
        }
    }

    ledger.max_drawdown = max_drawdown(&series);
    ledger.open_positions = positions
        .into_iter()
        .map(|((condition_id, outcome), state)| OpenPosition {
            condition_id,
            outcome,
            shares: state.total_shares,
            cost_usdc: state.total_cost,
        })
        .collect();
    // Deterministic ordering for downstream consumers
    ledger
        .open_positions
        .sort_by(|a, b| a.condition_id.cmp(&b.condition_id).then(a.outcome.to_string().cmp(&b.outcome.to_string())));
    ledger
}

/// Minimum of `value - peak_so_far` over a chronological series
pub fn max_drawdown(series: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut drawdown: f64 = 0.0;
    for &value in series {
        if value > peak {
            peak = value;
        }
        drawdown = drawdown.min(value - peak);
    }
    drawdown
}

/// Recomputes and upserts `BotMetrics` snapshots
pub struct MetricsEngine {
    store: Arc<dyn Store>,
    exchange: Arc<dyn ExchangeClient>,
    audit: Option<Arc<CsvAudit>>,
}

impl MetricsEngine {
    pub fn new(
        store: Arc<dyn Store>,
        exchange: Arc<dyn ExchangeClient>,
        audit: Option<Arc<CsvAudit>>,
    ) -> Self {
        Self {
            store,
            exchange,
            audit,
        }
    }

    /// Full recomputation for one bot. Callers hold the bot's keyed lock, so
    /// the read-replay-upsert sequence never races a concurrent recompute;
    /// the version counter additionally discards anything out of order.
    pub async fn recompute(&self, bot_id: &str) -> Result<BotMetrics> {
        let fills = self
            .store
            .fills_for_bot(bot_id)
            .with_context(|| format!("loading fills for bot {}", bot_id))?;
        let ledger = replay_fills(&fills);

        // Open positions are marked against the exchange's current price
        let mut unrealized = 0.0;
        for position in &ledger.open_positions {
            let price = self
                .exchange
                .market_price(&position.condition_id, position.outcome)
                .await
                .with_context(|| {
                    format!("reference price for {}", position.condition_id)
                })?;
            unrealized += position.shares * price - position.cost_usdc;
        }

        let pnl_usd = ledger.realized_pnl + unrealized;
        let roi_pct = if ledger.capital_deployed > 0.0 {
            pnl_usd / ledger.capital_deployed * 100.0
        } else {
            0.0
        };
        let win_rate = if ledger.closed_trades > 0 {
            ledger.winning_trades as f64 / ledger.closed_trades as f64 * 100.0
        } else {
            0.0
        };

        let version = self
            .store
            .get_metrics(bot_id)?
            .map(|m| m.version)
            .unwrap_or(0)
            + 1;

        let metrics = BotMetrics {
            bot_id: bot_id.to_string(),
            pnl_usd,
            roi_pct,
            trades: ledger.fill_count,
            win_rate,
            max_drawdown: ledger.max_drawdown,
            version,
            computed_at: Utc::now(),
        };

        let written = self.store.upsert_metrics(metrics.clone())?;
        if !written {
            debug!(bot_id, version, "stale metrics snapshot discarded");
            return Ok(metrics);
        }

        if let Some(audit) = &self.audit {
            audit
                .save_metrics(MetricsRecord {
                    timestamp: metrics.computed_at.timestamp_millis(),
                    bot_id: metrics.bot_id.clone(),
                    pnl_usd: metrics.pnl_usd,
                    roi_pct: metrics.roi_pct,
                    trades: metrics.trades,
                    win_rate: metrics.win_rate,
                    max_drawdown: metrics.max_drawdown,
                    version: metrics.version,
                })
                .await?;
        }

        info!(
            bot_id,
            pnl_usd = metrics.pnl_usd,
            roi_pct = metrics.roi_pct,
            win_rate = metrics.win_rate,
            max_drawdown = metrics.max_drawdown,
            "metrics recomputed"
        );
        Ok(metrics)
    }
}
