//! Claim Scanner
//!
//! Periodic sweep over every bot's open positions: markets that have
//! resolved get their settlement value claimed through the bot's
//! safety-gated exchange client. Each bot is an isolated failure domain,
//! and re-scanning an already-claimed market is a no-op, so the loop is
//! safe to run as often as configured.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeClient, ResolutionStatus};
use crate::metrics::replay_fills;
use crate::persistence::{ClaimCsvRecord, CsvAudit};
use crate::store::{ClaimRecord, Store};
use crate::types::Bot;

/// What one full pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub bots_scanned: usize,
    pub claims_submitted: usize,
    pub bots_failed: usize,
}

pub struct ClaimScanner {
    store: Arc<dyn Store>,
    exchange: Arc<dyn ExchangeClient>,
    audit: Option<Arc<CsvAudit>>,
    interval_secs: u64,
}

impl ClaimScanner {
    pub fn new(
        store: Arc<dyn Store>,
        exchange: Arc<dyn ExchangeClient>,
        audit: Option<Arc<CsvAudit>>,
        interval_secs: u64,
    ) -> Self {
        Self {
            store,
            exchange,
            audit,
            interval_secs,
        }
    }

    /// Fixed-interval loop, independent of the signal queue
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.scan_once().await {
                Ok(summary) if summary.claims_submitted > 0 => {
                    info!(
                        bots = summary.bots_scanned,
                        claims = summary.claims_submitted,
                        failed = summary.bots_failed,
                        "claim scan completed"
                    );
                }
                Ok(summary) => {
                    debug!(bots = summary.bots_scanned, "claim scan found nothing to do");
                }
                Err(e) => warn!(error = %e, "claim scan pass failed"),
            }
        }
    }

    /// One pass over all bots. A failing bot never blocks the others.
    pub async fn scan_once(&self) -> Result<ScanSummary> {
        let bots = self.store.list_bots().context("listing bots for claim scan")?;
        let mut summary = ScanSummary::default();

        for bot in bots {
            summary.bots_scanned += 1;
            match self.scan_bot(&bot).await {
                Ok(claims) => summary.claims_submitted += claims,
                Err(e) => {
                    summary.bots_failed += 1;
                    warn!(bot_id = %bot.id, error = %e, "claim scan failed for bot");
                }
            }
        }
        Ok(summary)
    }

    async fn scan_bot(&self, bot: &Bot) -> Result<usize> {
        let fills = self.store.fills_for_bot(&bot.id)?;
        let ledger = replay_fills(&fills);
        if ledger.open_positions.is_empty() {
            return Ok(0);
        }

        let claimed = self.store.claimed_markets(&bot.id)?;
        let mut claims = 0;

        for position in &ledger.open_positions {
            if claimed.contains(&position.condition_id) {
                // Already claimed; the exchange reports the position gone
                continue;
            }

            let status = self
                .exchange
                .resolution_status(&position.condition_id)
                .await
                .with_context(|| format!("resolution status for {}", position.condition_id))?;
            if status != ResolutionStatus::Resolved {
                continue;
            }

            let result = self
                .exchange
                .claim(&position.condition_id)
                .await
                .with_context(|| format!("claiming {}", position.condition_id))?;
            info!(
                bot_id = %bot.id,
                condition_id = %position.condition_id,
                amount_usdc = result.amount_usdc,
                tx_ref = %result.tx_ref,
                "settlement claimed"
            );

            let now = Utc::now();
            self.store.record_claim(ClaimRecord {
                bot_id: bot.id.clone(),
                condition_id: position.condition_id.clone(),
                amount_usdc: result.amount_usdc,
                tx_ref: result.tx_ref.clone(),
                claimed_at: now,
            })?;
            if let Some(audit) = &self.audit {
                audit
                    .save_claim(ClaimCsvRecord {
                        timestamp: now.timestamp_millis(),
                        bot_id: bot.id.clone(),
                        condition_id: position.condition_id.clone(),
                        amount_usdc: result.amount_usdc,
                        tx_ref: result.tx_ref,
                    })
                    .await?;
            }
            claims += 1;
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ClaimResult, MockExchange, MockExchangeClient};
    use crate::store::MemoryStore;
    use crate::types::{BotConfig, BotStatus, Fill, Outcome, OrderSide};
    use chrono::Duration as ChronoDuration;

    fn make_bot(id: &str) -> Bot {
        Bot {
            id: id.to_string(),
            wallet: "0x0000000000000000000000000000000000000001".to_string(),
            status: BotStatus::Active,
            config: BotConfig::default(),
            created_at: Utc::now(),
        }
    }

    fn open_fill(id: &str, bot_id: &str, condition_id: &str) -> Fill {
        Fill {
            id: id.to_string(),
            order_id: format!("order-{}", id),
            bot_id: bot_id.to_string(),
            condition_id: condition_id.to_string(),
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            price: 0.5,
            size_usdc: 10.0,
            shares: 20.0,
            fee_usdc: 0.05,
            filled_at: Utc::now() - ChronoDuration::minutes(30),
        }
    }

    #[tokio::test]
    async fn test_no_resolved_markets_means_zero_writes() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(MockExchange::new(0.0, 0.0));
        store.insert_bot(make_bot("b1")).unwrap();
        store.insert_fill(open_fill("f1", "b1", "cond-1")).unwrap();

        let scanner = ClaimScanner::new(store.clone(), exchange.clone(), None, 300);
        let summary = scanner.scan_once().await.unwrap();

        assert_eq!(summary.claims_submitted, 0);
        assert_eq!(exchange.claim_calls(), 0);
        assert!(store.claimed_markets("b1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolved_market_is_claimed_once() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(MockExchange::new(0.0, 0.0));
        store.insert_bot(make_bot("b1")).unwrap();
        store.insert_fill(open_fill("f1", "b1", "cond-1")).unwrap();
        exchange.resolve_market("cond-1", 20.0);

        let scanner = ClaimScanner::new(store.clone(), exchange.clone(), None, 300);
        let summary = scanner.scan_once().await.unwrap();
        assert_eq!(summary.claims_submitted, 1);
        assert_eq!(exchange.claim_calls(), 1);
        assert!(store.claimed_markets("b1").unwrap().contains("cond-1"));

        // Re-scan: already-claimed market is skipped before the exchange
        let summary = scanner.scan_once().await.unwrap();
        assert_eq!(summary.claims_submitted, 0);
        assert_eq!(exchange.claim_calls(), 1);
    }

    #[tokio::test]
    async fn test_bot_without_positions_is_untouched() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(MockExchange::new(0.0, 0.0));
        store.insert_bot(make_bot("b1")).unwrap();

        let scanner = ClaimScanner::new(store, exchange.clone(), None, 300);
        let summary = scanner.scan_once().await.unwrap();
        assert_eq!(summary.bots_scanned, 1);
        assert_eq!(exchange.claim_calls(), 0);
    }

    #[tokio::test]
    async fn test_failing_bot_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bot(make_bot("a-bot")).unwrap();
        store.insert_bot(make_bot("b-bot")).unwrap();
        store.insert_fill(open_fill("f1", "a-bot", "cond-bad")).unwrap();
        store.insert_fill(open_fill("f2", "b-bot", "cond-good")).unwrap();

        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_resolution_status()
            .withf(|c| c == "cond-bad")
            .returning(|_| Err(crate::exchange::ExchangeError::Timeout));
        exchange
            .expect_resolution_status()
            .withf(|c| c == "cond-good")
            .returning(|_| Ok(ResolutionStatus::Resolved));
        exchange.expect_claim().withf(|c| c == "cond-good").returning(|_| {
            Ok(ClaimResult {
                amount_usdc: 20.0,
                tx_ref: "tx-1".to_string(),
            })
        });

        let scanner = ClaimScanner::new(store.clone(), Arc::new(exchange), None, 300);
        let summary = scanner.scan_once().await.unwrap();

        assert_eq!(summary.bots_failed, 1);
        assert_eq!(summary.claims_submitted, 1);
        assert!(store.claimed_markets("b-bot").unwrap().contains("cond-good"));
        assert!(store.claimed_markets("a-bot").unwrap().is_empty());
    }
}
