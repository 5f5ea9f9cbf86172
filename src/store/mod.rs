//! Record store capability
//!
//! CRUD for bots, orders, fills and metrics snapshots. The storage engine is
//! an external concern; the worker and tests run on the in-memory
//! implementation, with the CSV audit trail alongside for operational
//! history. `BotMetrics` writes go through a versioned upsert so a stale
//! replay can never overwrite a fresher snapshot.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::types::{Bot, BotMetrics, BotStatus, Fill, Order, OrderStatus};

/// A recorded claim of settlement value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub bot_id: String,
    pub condition_id: String,
    pub amount_usdc: f64,
    pub tx_ref: String,
    pub claimed_at: DateTime<Utc>,
}

/// Persistence capability consumed by the pipeline
pub trait Store: Send + Sync {
    fn insert_bot(&self, bot: Bot) -> Result<()>;
    fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>>;
    fn list_bots(&self) -> Result<Vec<Bot>>;
    fn set_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()>;

    fn insert_order(&self, order: Order) -> Result<()>;
    fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        reject_reason: Option<String>,
    ) -> Result<()>;
    /// All orders for a bot, oldest first
    fn orders_for_bot(&self, bot_id: &str) -> Result<Vec<Order>>;
    /// The order created for a signal idempotency key, if any
    fn order_for_signal(&self, signal_id: &str) -> Result<Option<Order>>;

    fn insert_fill(&self, fill: Fill) -> Result<()>;
    /// All fills for a bot in non-decreasing `filled_at` order, ties broken
    /// by fill id for reproducible replay
    fn fills_for_bot(&self, bot_id: &str) -> Result<Vec<Fill>>;

    fn get_metrics(&self, bot_id: &str) -> Result<Option<BotMetrics>>;
    /// Full-snapshot upsert. Returns false (and leaves the stored snapshot
    /// untouched) when the incoming version is not newer.
    fn upsert_metrics(&self, metrics: BotMetrics) -> Result<bool>;

    fn record_claim(&self, claim: ClaimRecord) -> Result<()>;
    fn claimed_markets(&self, bot_id: &str) -> Result<HashSet<String>>;
}

/// In-memory store used by the worker and tests
#[derive(Default)]
pub struct MemoryStore {
    bots: RwLock<HashMap<String, Bot>>,
    orders: RwLock<HashMap<String, Order>>,
    fills: RwLock<Vec<Fill>>,
    metrics: RwLock<HashMap<String, BotMetrics>>,
    claims: RwLock<Vec<ClaimRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_bot(&self, bot: Bot) -> Result<()> {
        let mut bots = self.bots.write().map_err(|e| anyhow::anyhow!("{e}"))?;
        if bots.contains_key(&bot.id) {
            bail!("bot {} already exists", bot.id);
        }
        bots.insert(bot.id.clone(), bot);
        Ok(())
    }

    fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>> {
        let bots = self.bots.read().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(bots.get(bot_id).cloned())
    }

    fn list_bots(&self) -> Result<Vec<Bot>> {
        let bots = self.bots.read().map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut list: Vec<Bot> = bots.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    fn set_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()> {
        let mut bots = self.bots.write().map_err(|e| anyhow::anyhow!("{e}"))?;
        match bots.get_mut(bot_id) {
            Some(bot) => {
                bot.status = status;
                Ok(())
            }
            None => bail!("bot {} not found", bot_id),
        }
    }

    fn insert_order(&self, order: Order) -> Result<()> {
        let mut orders = self.orders.write().map_err(|e| anyhow::anyhow!("{e}"))?;
        if orders.contains_key(&order.id) {
            bail!("order {} already exists", order.id);
        }
        orders.insert(order.id.clone(), order);
        Ok(())
    }

    fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        reject_reason: Option<String>,
    ) -> Result<()> {
        let mut orders = self.orders.write().map_err(|e| anyhow::anyhow!("{e}"))?;
        match orders.get_mut(order_id) {
            Some(order) => {
                if order.status.is_terminal() {
                    bail!(
                        "order {} is terminal ({}), cannot move to {}",
                        order_id,
                        order.status,
                        status
                    );
                }
                order.status = status;
                order.reject_reason = reject_reason;
                Ok(())
            }
            None => bail!("order {} not found", order_id),
        }
    }

    fn orders_for_bot(&self, bot_id: &str) -> Result<Vec<Order>> {
        let orders = self.orders.read().map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut list: Vec<Order> = orders
            .values()
            .filter(|o| o.bot_id == bot_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    fn order_for_signal(&self, signal_id: &str) -> Result<Option<Order>> {
        let orders = self.orders.read().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(orders
            .values()
            .find(|o| o.signal_id == signal_id)
            .cloned())
    }

    fn insert_fill(&self, fill: Fill) -> Result<()> {
        let mut fills = self.fills.write().map_err(|e| anyhow::anyhow!("{e}"))?;
        if fills.iter().any(|f| f.id == fill.id) {
            bail!("fill {} already exists", fill.id);
        }
        fills.push(fill);
        Ok(())
    }

    fn fills_for_bot(&self, bot_id: &str) -> Result<Vec<Fill>> {
        let fills = self.fills.read().map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut list: Vec<Fill> = fills.iter().filter(|f| f.bot_id == bot_id).cloned().collect();
        list.sort_by(|a, b| a.filled_at.cmp(&b.filled_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    fn get_metrics(&self, bot_id: &str) -> Result<Option<BotMetrics>> {
        let metrics = self.metrics.read().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(metrics.get(bot_id).cloned())
    }

    fn upsert_metrics(&self, metrics: BotMetrics) -> Result<bool> {
        let mut stored = self.metrics.write().map_err(|e| anyhow::anyhow!("{e}"))?;
        if let Some(existing) = stored.get(&metrics.bot_id) {
            if metrics.version <= existing.version {
                return Ok(false);
            }
        }
        stored.insert(metrics.bot_id.clone(), metrics);
        Ok(true)
    }

    fn record_claim(&self, claim: ClaimRecord) -> Result<()> {
        let mut claims = self.claims.write().map_err(|e| anyhow::anyhow!("{e}"))?;
        claims.push(claim);
        Ok(())
    }

    fn claimed_markets(&self, bot_id: &str) -> Result<HashSet<String>> {
        let claims = self.claims.read().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(claims
            .iter()
            .filter(|c| c.bot_id == bot_id)
            .map(|c| c.condition_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BotConfig, Outcome, OrderSide};
    use chrono::Duration;

    fn make_bot(id: &str) -> Bot {
        Bot {
            id: id.to_string(),
            wallet: "0x0000000000000000000000000000000000000001".to_string(),
            status: BotStatus::Active,
            config: BotConfig::default(),
            created_at: Utc::now(),
        }
    }

    fn make_fill(id: &str, bot_id: &str, seconds_ago: i64) -> Fill {
        Fill {
            id: id.to_string(),
            order_id: format!("order-{}", id),
            bot_id: bot_id.to_string(),
            condition_id: "cond-1".to_string(),
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            price: 0.5,
            size_usdc: 5.0,
            shares: 10.0,
            fee_usdc: 0.01,
            filled_at: Utc::now() - Duration::seconds(seconds_ago),
        }
    }

    fn make_metrics(bot_id: &str, version: u64, pnl: f64) -> BotMetrics {
        BotMetrics {
            bot_id: bot_id.to_string(),
            pnl_usd: pnl,
            roi_pct: 0.0,
            trades: 0,
            win_rate: 0.0,
            max_drawdown: 0.0,
            version,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_bot_roundtrip_and_duplicate() {
        let store = MemoryStore::new();
        store.insert_bot(make_bot("b1")).unwrap();
        assert!(store.get_bot("b1").unwrap().is_some());
        assert!(store.get_bot("b2").unwrap().is_none());
        assert!(store.insert_bot(make_bot("b1")).is_err());
    }

    #[test]
    fn test_fills_sorted_by_time_then_id() {
        let store = MemoryStore::new();
        store.insert_fill(make_fill("f2", "b1", 10)).unwrap();
        store.insert_fill(make_fill("f1", "b1", 30)).unwrap();
        store.insert_fill(make_fill("f3", "b2", 5)).unwrap();

        let fills = store.fills_for_bot("b1").unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].id, "f1");
        assert_eq!(fills[1].id, "f2");
    }

    #[test]
    fn test_metrics_upsert_discards_stale_version() {
        let store = MemoryStore::new();
        assert!(store.upsert_metrics(make_metrics("b1", 2, 10.0)).unwrap());
        // Same version: discarded
        assert!(!store.upsert_metrics(make_metrics("b1", 2, 99.0)).unwrap());
        // Older version: discarded
        assert!(!store.upsert_metrics(make_metrics("b1", 1, 99.0)).unwrap());
        assert_eq!(store.get_metrics("b1").unwrap().unwrap().pnl_usd, 10.0);

        // Newer version replaces the whole snapshot
        assert!(store.upsert_metrics(make_metrics("b1", 3, -4.0)).unwrap());
        assert_eq!(store.get_metrics("b1").unwrap().unwrap().pnl_usd, -4.0);
    }

    #[test]
    fn test_terminal_order_cannot_transition() {
        let store = MemoryStore::new();
        let order = Order {
            id: "o1".to_string(),
            bot_id: "b1".to_string(),
            signal_id: "s1".to_string(),
            condition_id: "cond-1".to_string(),
            market_slug: "btc-15m".to_string(),
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            price: 0.5,
            size_usdc: 5.0,
            status: OrderStatus::Pending,
            reject_reason: None,
            created_at: Utc::now(),
        };
        store.insert_order(order).unwrap();
        store
            .update_order_status("o1", OrderStatus::Filled, None)
            .unwrap();
        assert!(store
            .update_order_status("o1", OrderStatus::Canceled, None)
            .is_err());
    }

    #[test]
    fn test_claimed_markets_filtered_by_bot() {
        let store = MemoryStore::new();
        store
            .record_claim(ClaimRecord {
                bot_id: "b1".to_string(),
                condition_id: "cond-1".to_string(),
                amount_usdc: 12.0,
                tx_ref: "tx-1".to_string(),
                claimed_at: Utc::now(),
            })
            .unwrap();

        assert!(store.claimed_markets("b1").unwrap().contains("cond-1"));
        assert!(store.claimed_markets("b2").unwrap().is_empty());
    }
}
