//! Market discovery - resolve the current tradable up/down market
//!
//! Each bot trades the rolling market for its configured currency and
//! timeframe. Discovery tracks the active market per (currency, timeframe),
//! refreshing on an interval and rolling over when a window expires.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::ExchangeError;
use crate::types::{Currency, Timeframe};

/// Discovered market with the metadata the pipeline needs
#[derive(Debug, Clone)]
pub struct DiscoveredMarket {
    pub condition_id: String,
    pub slug: String,
    pub question: String,
    pub end_date: DateTime<Utc>,
    pub currency: Currency,
    pub timeframe: Timeframe,
}

/// The market-discovery collaborator the signal processor depends on
#[async_trait]
pub trait MarketDirectory: Send + Sync {
    /// Resolve the currently tradable market for a currency/timeframe
    async fn current_market(
        &self,
        currency: Currency,
        timeframe: Timeframe,
    ) -> Result<DiscoveredMarket, ExchangeError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    condition_id: String,
    #[serde(default)]
    slug: Option<String>,
    question: String,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    outcomes: Vec<String>,
}

/// Gamma-API backed discovery with a per-key cache and refresh interval
pub struct MarketDiscovery {
    client: Client,
    gamma_url: String,
    refresh_secs: u64,
    /// Currently tracked market per (Currency, Timeframe)
    tracked: RwLock<HashMap<(Currency, Timeframe), (DiscoveredMarket, DateTime<Utc>)>>,
}

impl MarketDiscovery {
    pub fn new(gamma_url: impl Into<String>, refresh_secs: u64) -> Self {
        Self {
            client: Client::new(),
            gamma_url: gamma_url.into(),
            refresh_secs,
            tracked: RwLock::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>, end_date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(fetched_at).num_seconds();
        age < self.refresh_secs as i64 && now < end_date
    }

    async fn fetch_market(
        &self,
        currency: Currency,
        timeframe: Timeframe,
    ) -> Result<DiscoveredMarket, ExchangeError> {
        let now = Utc::now();
        let response = self
            .client
            .get(format!("{}/markets", self.gamma_url.trim_end_matches('/')))
            .query(&[
                ("active", "true"),
                ("closed", "false"),
                ("limit", "100"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout
                } else {
                    ExchangeError::Transport(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(ExchangeError::Api(format!(
                "gamma markets query failed: {}",
                response.status()
            )));
        }

        let markets: Vec<GammaMarket> = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(format!("gamma response: {}", e)))?;

        debug!(%currency, %timeframe, candidates = markets.len(), "fetched candidate markets");

        let best = markets
            .into_iter()
            .filter_map(|m| convert_market(m, currency, timeframe, now))
            // Soonest-ending matching window is the live one
            .min_by_key(|m| m.end_date);

        best.ok_or_else(|| {
            ExchangeError::Api(format!(
                "no tradable {} {} market found",
                currency, timeframe
            ))
        })
    }
}

#[async_trait]
impl MarketDirectory for MarketDiscovery {
    async fn current_market(
        &self,
        currency: Currency,
        timeframe: Timeframe,
    ) -> Result<DiscoveredMarket, ExchangeError> {
        let key = (currency, timeframe);
        let now = Utc::now();

        {
            let tracked = self.tracked.read().await;
            if let Some((market, fetched_at)) = tracked.get(&key) {
                if self.is_fresh(*fetched_at, market.end_date, now) {
                    return Ok(market.clone());
                }
            }
        }

        let market = self.fetch_market(currency, timeframe).await?;
        let mut tracked = self.tracked.write().await;
        match tracked.get(&key) {
            Some((old, _)) if old.condition_id != market.condition_id => {
                info!(
                    %currency,
                    %timeframe,
                    old_slug = %old.slug,
                    new_slug = %market.slug,
                    "market rollover detected"
                );
            }
            None => {
                info!(%currency, %timeframe, slug = %market.slug, "new market discovered");
            }
            _ => {}
        }
        tracked.insert(key, (market.clone(), now));
        Ok(market)
    }
}

/// Convert a Gamma row if it matches the requested currency/timeframe window
fn convert_market(
    market: GammaMarket,
    currency: Currency,
    timeframe: Timeframe,
    now: DateTime<Utc>,
) -> Option<DiscoveredMarket> {
    if !market.active || market.closed.unwrap_or(false) {
        return None;
    }
    if market.outcomes.len() != 2 && !market.outcomes.is_empty() {
        return None;
    }

    let slug = market.slug.unwrap_or_default();
    let text = format!("{} {}", slug, market.question).to_lowercase();

    let currency_match = match currency {
        Currency::BTC => text.contains("btc") || text.contains("bitcoin"),
        Currency::ETH => text.contains("eth") || text.contains("ethereum"),
        Currency::SOL => text.contains("sol") || text.contains("solana"),
        Currency::XRP => text.contains("xrp") || text.contains("ripple"),
    };
    if !currency_match {
        return None;
    }

    let end_date = market.end_date.as_deref().and_then(|d| {
        DateTime::parse_from_rfc3339(d)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })?;
    if end_date <= now {
        return None;
    }

    // Infer the window from the text, falling back to time-to-expiry
    let minutes_to_end = end_date.signed_duration_since(now).num_minutes();
    let inferred = if text.contains("15m") || text.contains("15 minute") {
        Timeframe::Min15
    } else if text.contains("1h") || text.contains("hourly") || text.contains("1 hour") {
        Timeframe::Hour1
    } else if minutes_to_end <= 20 {
        Timeframe::Min15
    } else if minutes_to_end <= 90 {
        Timeframe::Hour1
    } else {
        warn!(condition_id = %market.condition_id, minutes_to_end, "cannot infer timeframe");
        return None;
    };
    if inferred != timeframe {
        return None;
    }

    Some(DiscoveredMarket {
        condition_id: market.condition_id,
        slug,
        question: market.question,
        end_date,
        currency,
        timeframe,
    })
}

/// Deterministic directory for mock mode and tests: one synthetic market per
/// (currency, timeframe) window, rolling over at window boundaries.
pub struct StaticMarkets;

#[async_trait]
impl MarketDirectory for StaticMarkets {
    async fn current_market(
        &self,
        currency: Currency,
        timeframe: Timeframe,
    ) -> Result<DiscoveredMarket, ExchangeError> {
        let now = Utc::now();
        let window = timeframe.duration_secs() as i64;
        let window_start = (now.timestamp() / window) * window;
        let end = Utc
            .timestamp_opt(window_start + window, 0)
            .single()
            .unwrap_or(now + ChronoDuration::seconds(window));

        let slug = format!(
            "{}-{}-{}",
            currency.to_string().to_lowercase(),
            timeframe,
            window_start
        );
        Ok(DiscoveredMarket {
            condition_id: format!("mock-{}", slug),
            slug,
            question: format!("{} up or down ({})", currency, timeframe),
            end_date: end,
            currency,
            timeframe,
        })
    }
}
