//! Signal Processor
//!
//! Turns one queued signal into an order (and, on success, a fill), enforcing
//! the risk gate and the safety-gated exchange client on the way. Policy
//! denials are recorded as rejected orders and are not errors; only
//! infrastructure failures propagate to the job runner for retry.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::exchange::{
    ExchangeClient, ExchangeError, MarketDirectory, OrderRequest,
};
use crate::metrics::{replay_fills, OpenPosition};
use crate::persistence::{CsvAudit, FillRecord, OrderRecord, RejectionRecord};
use crate::risk::{self, DenyReason, RiskInputs, RiskVerdict};
use crate::store::Store;
use crate::types::{
    Bot, BotStatus, Fill, Order, OrderSide, OrderStatus, Outcome, Signal, SignalKind,
};

/// Terminal result of processing one signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// An order was placed and filled
    Filled { order_id: String },
    /// Policy or exchange rejection, recorded on the order row
    Rejected { order_id: Option<String>, reason: String },
    /// Idempotent no-op: this signal already produced a live order
    Duplicate { order_id: String },
    /// Nothing to do (e.g. CLOSE with no open position)
    NoOp,
}

/// Processing failures that are not policy outcomes
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("bot {0} not found")]
    BotNotFound(String),
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ProcessError {
    /// Whether the surrounding job runner should retry
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessError::Exchange(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Process-wide trade limits from the worker's trading configuration: a cap
/// on any single order and a budget of notional placed per local day, shared
/// across all bots.
pub struct TradeLimits {
    max_trade_usdc: f64,
    max_daily_notional_usdc: f64,
    /// (local date key, notional reserved today)
    spent: Mutex<(String, f64)>,
}

impl TradeLimits {
    pub fn new(max_trade_usdc: f64, max_daily_notional_usdc: f64) -> Self {
        Self {
            max_trade_usdc,
            max_daily_notional_usdc,
            spent: Mutex::new((String::new(), 0.0)),
        }
    }

    /// Unbounded limits, for tests and tooling
    pub fn unbounded() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY)
    }

    fn clamp_size(&self, size_usdc: f64) -> f64 {
        size_usdc.min(self.max_trade_usdc)
    }

    /// Reserve notional against today's budget. Callers release it if the
    /// order ends up rejected.
    fn try_reserve(&self, notional: f64, now: DateTime<Utc>) -> bool {
        let today = crate::risk::local_date_key(now);
        let mut spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
        if spent.0 != today {
            *spent = (today, 0.0);
        }
        if spent.1 + notional > self.max_daily_notional_usdc {
            return false;
        }
        spent.1 += notional;
        true
    }

    fn release(&self, notional: f64) {
        let mut spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
        spent.1 = (spent.1 - notional).max(0.0);
    }
}

/// Consumes signals one at a time per bot (the queue enforces the per-bot
/// exclusivity; the processor assumes it holds the bot).
pub struct SignalProcessor {
    store: Arc<dyn Store>,
    exchange: Arc<dyn ExchangeClient>,
    markets: Arc<dyn MarketDirectory>,
    audit: Option<Arc<CsvAudit>>,
    limits: Arc<TradeLimits>,
}

impl SignalProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        exchange: Arc<dyn ExchangeClient>,
        markets: Arc<dyn MarketDirectory>,
        audit: Option<Arc<CsvAudit>>,
        limits: Arc<TradeLimits>,
    ) -> Self {
        Self {
            store,
            exchange,
            markets,
            audit,
            limits,
        }
    }

    /// Process one signal. `last_attempt` tells the processor to finalize the
    /// order as rejected instead of leaving it pending for another retry.
    pub async fn process(
        &self,
        signal: &Signal,
        last_attempt: bool,
    ) -> Result<ProcessOutcome, ProcessError> {
        // Idempotency guard: a non-rejected order for this key means the
        // signal was already consumed (at-least-once delivery).
        if let Some(existing) = self.store.order_for_signal(&signal.id)? {
            match existing.status {
                OrderStatus::Pending => {
                    // A previous attempt died mid-submission; resume it.
                    return self.submit_and_record(existing, last_attempt).await;
                }
                OrderStatus::Rejected => {}
                _ => {
                    return Ok(ProcessOutcome::Duplicate {
                        order_id: existing.id,
                    });
                }
            }
        }

        let bot = self
            .store
            .get_bot(&signal.bot_id)?
            .ok_or_else(|| ProcessError::BotNotFound(signal.bot_id.clone()))?;

        if bot.status != BotStatus::Active {
            return self.reject_without_market(&bot, signal, None, "bot_inactive").await;
        }

        // Map raw alert text through the bot's signal map
        let kind = match bot.config.signal_map.resolve(&signal.raw) {
            Some(kind) => kind,
            None => {
                return self
                    .reject_without_market(
                        &bot,
                        signal,
                        None,
                        DenyReason::UnknownSignalType.as_str(),
                    )
                    .await;
            }
        };

        // Open positions come from a full ledger replay, same as metrics
        let fills = self.store.fills_for_bot(&bot.id)?;
        let ledger = replay_fills(&fills);
        let open_notional: f64 = ledger.open_positions.iter().map(|p| p.cost_usdc).sum();

        // Per-bot size, capped by the process-wide single-trade limit
        let proposed_usdc = self.limits.clamp_size(bot.config.size_usdc);

        let orders = self.store.orders_for_bot(&bot.id)?;
        let verdict = risk::evaluate(&RiskInputs {
            kind,
            config: &bot.config,
            orders: &orders,
            open_notional_usdc: open_notional,
            proposed_usdc,
            now: Utc::now(),
        });
        if let RiskVerdict::Deny(reason) = verdict {
            info!(bot_id = %bot.id, signal_id = %signal.id, reason = %reason, "signal denied by risk gate");
            return self
                .reject_without_market(&bot, signal, Some(kind), reason.as_str())
                .await;
        }

        // Resolve the target: CLOSE unwinds an open position, LONG/SHORT buy
        // into the currently tradable market.
        let order = match kind {
            SignalKind::Close => match ledger.open_positions.first() {
                Some(position) => self.build_close_order(&bot, signal, position),
                None => {
                    if let Some(audit) = &self.audit {
                        audit
                            .save_rejection(RejectionRecord {
                                timestamp: Utc::now().timestamp_millis(),
                                signal_id: signal.id.clone(),
                                bot_id: bot.id.clone(),
                                raw_signal: signal.raw.clone(),
                                reason: "no_open_position".to_string(),
                            })
                            .await?;
                    }
                    return Ok(ProcessOutcome::NoOp);
                }
            },
            SignalKind::Long | SignalKind::Short => {
                // Reserve against the process-wide daily notional budget
                if !self.limits.try_reserve(proposed_usdc, Utc::now()) {
                    return self
                        .reject_without_market(&bot, signal, Some(kind), "daily_notional_cap_reached")
                        .await;
                }

                let market = match self
                    .markets
                    .current_market(bot.config.currency, bot.config.timeframe)
                    .await
                {
                    Ok(market) => market,
                    Err(e) => {
                        self.limits.release(proposed_usdc);
                        return Err(e.into());
                    }
                };
                let outcome = if kind == SignalKind::Long {
                    Outcome::Yes
                } else {
                    Outcome::No
                };
                let reference = match self
                    .exchange
                    .market_price(&market.condition_id, outcome)
                    .await
                {
                    Ok(price) => price,
                    Err(e) => {
                        self.limits.release(proposed_usdc);
                        return Err(e.into());
                    }
                };
                // Cap the acceptable price at the configured slippage bound
                let limit = (reference * (1.0 + bot.config.max_slippage_bps / 10_000.0))
                    .clamp(0.01, 0.99);
                Order {
                    id: Uuid::new_v4().to_string(),
                    bot_id: bot.id.clone(),
                    signal_id: signal.id.clone(),
                    condition_id: market.condition_id,
                    market_slug: market.slug,
                    outcome,
                    side: OrderSide::Buy,
                    price: limit,
                    size_usdc: proposed_usdc,
                    status: OrderStatus::Pending,
                    reject_reason: None,
                    created_at: Utc::now(),
                }
            }
        };

        self.store.insert_order(order.clone())?;
        self.submit_and_record(order, last_attempt).await
    }

    fn build_close_order(&self, bot: &Bot, signal: &Signal, position: &OpenPosition) -> Order {
        Order {
            id: Uuid::new_v4().to_string(),
            bot_id: bot.id.clone(),
            signal_id: signal.id.clone(),
            condition_id: position.condition_id.clone(),
            market_slug: String::new(),
            outcome: position.outcome,
            side: OrderSide::Sell,
            // Reference price is refreshed at submission; keep the basis here
            price: if position.shares > 0.0 {
                (position.cost_usdc / position.shares).clamp(0.01, 0.99)
            } else {
                0.5
            },
            size_usdc: position.cost_usdc.max(0.0),
            status: OrderStatus::Pending,
            reject_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Submit a pending order and persist the resulting fill.
    async fn submit_and_record(
        &self,
        order: Order,
        last_attempt: bool,
    ) -> Result<ProcessOutcome, ProcessError> {
        let shares = if order.price > 0.0 {
            order.size_usdc / order.price
        } else {
            0.0
        };
        let request = OrderRequest {
            condition_id: order.condition_id.clone(),
            outcome: order.outcome,
            side: order.side,
            price: order.price,
            size_usdc: order.size_usdc,
            shares,
        };

        match self.exchange.submit_order(&request).await {
            Ok(report) => {
                self.store
                    .update_order_status(&order.id, OrderStatus::Filled, None)?;
                let fill = Fill {
                    id: Uuid::new_v4().to_string(),
                    order_id: order.id.clone(),
                    bot_id: order.bot_id.clone(),
                    condition_id: order.condition_id.clone(),
                    outcome: order.outcome,
                    side: order.side,
                    price: report.price,
                    size_usdc: report.size_usdc,
                    shares: report.shares,
                    fee_usdc: report.fee_usdc,
                    filled_at: Utc::now(),
                };
                self.store.insert_fill(fill.clone())?;
                self.record_order_and_fill(&order, &fill).await?;
                info!(
                    bot_id = %order.bot_id,
                    order_id = %order.id,
                    price = fill.price,
                    shares = fill.shares,
                    "order filled"
                );
                Ok(ProcessOutcome::Filled { order_id: order.id })
            }
            Err(e) if e.is_transient() => {
                if last_attempt {
                    // No order stays pending past the retry budget
                    let reason = match &e {
                        ExchangeError::Timeout => "exchange_timeout",
                        _ => "exchange_error",
                    };
                    warn!(order_id = %order.id, error = %e, "retries exhausted, rejecting order");
                    self.store.update_order_status(
                        &order.id,
                        OrderStatus::Rejected,
                        Some(reason.to_string()),
                    )?;
                    self.save_order_row(&order, OrderStatus::Rejected, Some(reason.to_string()))
                        .await?;
                    if order.side == OrderSide::Buy {
                        self.limits.release(order.size_usdc);
                    }
                }
                Err(ProcessError::Exchange(e))
            }
            Err(e) => {
                let reason = format!("exchange_rejected: {}", e);
                self.store.update_order_status(
                    &order.id,
                    OrderStatus::Rejected,
                    Some(reason.clone()),
                )?;
                self.save_order_row(&order, OrderStatus::Rejected, Some(reason.clone()))
                    .await?;
                if order.side == OrderSide::Buy {
                    self.limits.release(order.size_usdc);
                }
                Ok(ProcessOutcome::Rejected {
                    order_id: Some(order.id),
                    reason,
                })
            }
        }
    }

    /// Record a policy rejection before market discovery: the order row keeps
    /// the deny reason, the CSV trail keeps the raw signal.
    async fn reject_without_market(
        &self,
        bot: &Bot,
        signal: &Signal,
        kind: Option<SignalKind>,
        reason: &str,
    ) -> Result<ProcessOutcome, ProcessError> {
        let (side, outcome) = match kind {
            Some(SignalKind::Short) => (OrderSide::Buy, Outcome::No),
            Some(SignalKind::Close) => (OrderSide::Sell, Outcome::Yes),
            _ => (OrderSide::Buy, Outcome::Yes),
        };
        let order = Order {
            id: Uuid::new_v4().to_string(),
            bot_id: bot.id.clone(),
            signal_id: signal.id.clone(),
            condition_id: String::new(),
            market_slug: String::new(),
            outcome,
            side,
            price: 0.0,
            size_usdc: bot.config.size_usdc,
            status: OrderStatus::Rejected,
            reject_reason: Some(reason.to_string()),
            created_at: Utc::now(),
        };
        self.store.insert_order(order.clone())?;
        self.save_order_row(&order, OrderStatus::Rejected, Some(reason.to_string()))
            .await?;
        if let Some(audit) = &self.audit {
            audit
                .save_rejection(RejectionRecord {
                    timestamp: Utc::now().timestamp_millis(),
                    signal_id: signal.id.clone(),
                    bot_id: bot.id.clone(),
                    raw_signal: signal.raw.clone(),
                    reason: reason.to_string(),
                })
                .await?;
        }
        Ok(ProcessOutcome::Rejected {
            order_id: Some(order.id),
            reason: reason.to_string(),
        })
    }

    async fn record_order_and_fill(&self, order: &Order, fill: &Fill) -> Result<(), ProcessError> {
        self.save_order_row(order, OrderStatus::Filled, None).await?;
        if let Some(audit) = &self.audit {
            audit
                .save_fill(FillRecord {
                    timestamp: fill.filled_at.timestamp_millis(),
                    fill_id: fill.id.clone(),
                    order_id: fill.order_id.clone(),
                    bot_id: fill.bot_id.clone(),
                    market_slug: order.market_slug.clone(),
                    outcome: fill.outcome.to_string(),
                    side: fill.side.to_string(),
                    price: fill.price,
                    shares: fill.shares,
                    size_usdc: fill.size_usdc,
                    fee_usdc: fill.fee_usdc,
                })
                .await?;
        }
        Ok(())
    }

    async fn save_order_row(
        &self,
        order: &Order,
        status: OrderStatus,
        reject_reason: Option<String>,
    ) -> Result<(), ProcessError> {
        if let Some(audit) = &self.audit {
            audit
                .save_order(OrderRecord {
                    timestamp: Utc::now().timestamp_millis(),
                    order_id: order.id.clone(),
                    bot_id: order.bot_id.clone(),
                    signal_id: order.signal_id.clone(),
                    market_slug: order.market_slug.clone(),
                    outcome: order.outcome.to_string(),
                    side: order.side.to_string(),
                    price: order.price,
                    size_usdc: order.size_usdc,
                    status: status.to_string(),
                    reject_reason,
                })
                .await?;
        }
        Ok(())
    }
}
