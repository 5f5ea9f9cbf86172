//! Core types used throughout PolyHook
//!
//! Defines common data structures for bots, signals, orders, fills and metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Supported underlying currencies for up/down markets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    BTC,
    ETH,
    SOL,
    XRP,
}

impl Default for Currency {
    fn default() -> Self {
        Currency::BTC
    }
}

impl Currency {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BTC" => Some(Currency::BTC),
            "ETH" => Some(Currency::ETH),
            "SOL" => Some(Currency::SOL),
            "XRP" => Some(Currency::XRP),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::BTC => write!(f, "BTC"),
            Currency::ETH => write!(f, "ETH"),
            Currency::SOL => write!(f, "SOL"),
            Currency::XRP => write!(f, "XRP"),
        }
    }
}

/// Supported market timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Min15,
    Hour1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Min15
    }
}

impl Timeframe {
    /// Get duration in seconds
    pub fn duration_secs(&self) -> u64 {
        match self {
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "15m" | "15min" => Some(Timeframe::Min15),
            "1h" | "1hour" => Some(Timeframe::Hour1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Min15 => write!(f, "15m"),
            Timeframe::Hour1 => write!(f, "1h"),
        }
    }
}

/// Normalized trading instruction derived from an external alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Long,
    Short,
    Close,
}

impl SignalKind {
    /// Parse from the normalized form used in signal maps
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LONG" => Some(SignalKind::Long),
            "SHORT" => Some(SignalKind::Short),
            "CLOSE" => Some(SignalKind::Close),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Long => write!(f, "LONG"),
            SignalKind::Short => write!(f, "SHORT"),
            SignalKind::Close => write!(f, "CLOSE"),
        }
    }
}

/// Binary market outcome token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Yes,
    No,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order lifecycle state. Filled, Rejected and Canceled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Canceled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Bot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotStatus {
    Created,
    Active,
    Stopped,
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotStatus::Created => write!(f, "CREATED"),
            BotStatus::Active => write!(f, "ACTIVE"),
            BotStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Alert-text to signal-kind lookup, configured per bot.
///
/// Validated at bot-creation time so the processor can treat every mapped
/// entry as a known `SignalKind`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMap {
    entries: HashMap<String, SignalKind>,
}

impl SignalMap {
    /// Build from raw alert-text → kind-name pairs, rejecting unknown kinds.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self, String> {
        let mut entries = HashMap::new();
        for (text, kind) in pairs {
            let kind = SignalKind::from_str(kind)
                .ok_or_else(|| format!("unknown signal kind '{}' for alert '{}'", kind, text))?;
            entries.insert(text.trim().to_uppercase(), kind);
        }
        if entries.is_empty() {
            return Err("signal map must contain at least one entry".to_string());
        }
        Ok(Self { entries })
    }

    /// Default TradingView-style map: LONG / SHORT / CLOSE alert text verbatim.
    pub fn standard() -> Self {
        let mut entries = HashMap::new();
        entries.insert("LONG".to_string(), SignalKind::Long);
        entries.insert("SHORT".to_string(), SignalKind::Short);
        entries.insert("CLOSE".to_string(), SignalKind::Close);
        Self { entries }
    }

    /// Resolve raw alert text to a signal kind
    pub fn resolve(&self, raw: &str) -> Option<SignalKind> {
        self.entries.get(&raw.trim().to_uppercase()).copied()
    }
}

/// Per-bot trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Underlying currency of the markets this bot trades
    pub currency: Currency,
    /// Market timeframe (15m or 1h)
    pub timeframe: Timeframe,
    /// Order size per signal in USDC
    pub size_usdc: f64,
    /// Minimum minutes between placed orders
    pub cooldown_minutes: i64,
    /// Maximum orders placed per local day
    pub max_trades_per_day: usize,
    /// Maximum open notional in USDC
    pub max_position_usdc: f64,
    /// Maximum acceptable slippage in basis points
    pub max_slippage_bps: f64,
    /// Alert-text to signal-kind mapping
    pub signal_map: SignalMap,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            currency: Currency::BTC,
            timeframe: Timeframe::Min15,
            size_usdc: 10.0,
            cooldown_minutes: 30,
            max_trades_per_day: 10,
            max_position_usdc: 100.0,
            max_slippage_bps: 50.0,
            signal_map: SignalMap::standard(),
        }
    }
}

/// A registered trading bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    /// Bot identifier
    pub id: String,
    /// Owning wallet address (0x-prefixed)
    pub wallet: String,
    /// Lifecycle state
    pub status: BotStatus,
    /// Trading configuration
    pub config: BotConfig,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// An inbound trading instruction. Immutable once recorded; the `id` doubles
/// as the idempotency key for queue delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Idempotency key assigned by the webhook adapter
    pub id: String,
    /// Target bot
    pub bot_id: String,
    /// Raw alert text as received
    pub raw: String,
    /// When the signal was received
    pub received_at: DateTime<Utc>,
}

/// A trade intent submitted toward the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Order ID
    pub id: String,
    /// Owning bot
    pub bot_id: String,
    /// Signal that produced this order
    pub signal_id: String,
    /// Market condition ID (empty for orders rejected before discovery)
    pub condition_id: String,
    /// Market slug
    pub market_slug: String,
    /// Outcome token traded
    pub outcome: Outcome,
    /// Side (BUY/SELL)
    pub side: OrderSide,
    /// Limit price (0.0 - 1.0 share price)
    pub price: f64,
    /// Notional size in USDC
    pub size_usdc: f64,
    /// Lifecycle state
    pub status: OrderStatus,
    /// Rejection reason for terminal REJECTED orders
    pub reject_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A confirmed execution of an Order. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Fill ID
    pub id: String,
    /// Parent order
    pub order_id: String,
    /// Owning bot (denormalized for ledger replay)
    pub bot_id: String,
    /// Market condition ID
    pub condition_id: String,
    /// Outcome token
    pub outcome: Outcome,
    /// Side inherited from the parent order
    pub side: OrderSide,
    /// Execution price per share
    pub price: f64,
    /// Executed notional in USDC
    pub size_usdc: f64,
    /// Shares executed
    pub shares: f64,
    /// Fees paid in USDC
    pub fee_usdc: f64,
    /// Execution time
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    /// Signed cash flow of this fill: negative for buys (capital out),
    /// positive for sells (proceeds in), fees always against us.
    pub fn cash_flow(&self) -> f64 {
        match self.side {
            OrderSide::Buy => -(self.price * self.shares + self.fee_usdc),
            OrderSide::Sell => self.price * self.shares - self.fee_usdc,
        }
    }
}

/// Latest performance snapshot for a bot. Fully overwritten on every
/// recomputation; `version` is monotonic so stale replays are discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotMetrics {
    /// Owning bot
    pub bot_id: String,
    /// Total PnL (realized + unrealized) in USD
    pub pnl_usd: f64,
    /// Return on total capital deployed, percent
    pub roi_pct: f64,
    /// Number of fills replayed
    pub trades: u64,
    /// Winning closed trades / closed trades, percent (0 when none closed)
    pub win_rate: f64,
    /// Most negative peak-to-trough move of the running PnL series
    pub max_drawdown: f64,
    /// Monotonic snapshot version
    pub version: u64,
    /// When this snapshot was computed
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_roundtrip() {
        for c in [Currency::BTC, Currency::ETH, Currency::SOL, Currency::XRP] {
            assert_eq!(Currency::from_str(&c.to_string()), Some(c));
        }
        assert_eq!(Currency::from_str("DOGE"), None);
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!(Timeframe::from_str("15m"), Some(Timeframe::Min15));
        assert_eq!(Timeframe::from_str("1H"), Some(Timeframe::Hour1));
        assert_eq!(Timeframe::from_str("4h"), None);
        assert_eq!(Timeframe::Min15.duration_secs(), 900);
    }

    #[test]
    fn test_signal_map_resolves_case_insensitive() {
        let map = SignalMap::standard();
        assert_eq!(map.resolve("long"), Some(SignalKind::Long));
        assert_eq!(map.resolve(" SHORT "), Some(SignalKind::Short));
        assert_eq!(map.resolve("exit"), None);
    }

    #[test]
    fn test_signal_map_rejects_unknown_kind() {
        let err = SignalMap::from_pairs(&[("buy", "LONG"), ("flat", "FLATTEN")]);
        assert!(err.is_err());

        let map = SignalMap::from_pairs(&[("buy", "LONG"), ("exit", "close")]).unwrap();
        assert_eq!(map.resolve("BUY"), Some(SignalKind::Long));
        assert_eq!(map.resolve("Exit"), Some(SignalKind::Close));
    }

    #[test]
    fn test_fill_cash_flow_sign() {
        let mut fill = Fill {
            id: "f1".to_string(),
            order_id: "o1".to_string(),
            bot_id: "b1".to_string(),
            condition_id: "c1".to_string(),
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            price: 0.40,
            size_usdc: 4.0,
            shares: 10.0,
            fee_usdc: 0.10,
            filled_at: Utc::now(),
        };
        assert!((fill.cash_flow() + 4.10).abs() < 1e-9);

        fill.side = OrderSide::Sell;
        fill.price = 0.60;
        fill.fee_usdc = 0.05;
        assert!((fill.cash_flow() - 5.95).abs() < 1e-9);
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
    }
}
