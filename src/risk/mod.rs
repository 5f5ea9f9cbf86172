//! Risk Gate - Per-signal policy checks
//!
//! Implements:
//! - Cooldown between placed orders
//! - Daily trade cap (local-day boundary)
//! - Open-notional position cap
//! - CLOSE signals bypass cooldown and the daily cap
//!
//! Purely advisory: no side effects, the signal processor acts on the verdict.

use chrono::{DateTime, Datelike, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{BotConfig, Order, OrderStatus, SignalKind};

/// Why a signal was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    CooldownActive,
    DailyCapReached,
    PositionCapExceeded,
    UnknownSignalType,
}

impl DenyReason {
    /// Stable label recorded on rejected orders and in CSV
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::CooldownActive => "cooldown_active",
            DenyReason::DailyCapReached => "daily_cap_reached",
            DenyReason::PositionCapExceeded => "position_cap_exceeded",
            DenyReason::UnknownSignalType => "unknown_signal_type",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Gate verdict for one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Allow,
    Deny(DenyReason),
}

impl RiskVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskVerdict::Allow)
    }
}

/// Everything the gate needs to judge one signal. Assembled by the signal
/// processor from the bot row and its order history.
#[derive(Debug, Clone)]
pub struct RiskInputs<'a> {
    /// Mapped signal kind
    pub kind: SignalKind,
    /// The bot's risk configuration
    pub config: &'a BotConfig,
    /// The bot's full order history, any order of creation
    pub orders: &'a [Order],
    /// Current open notional across the bot's positions, USDC
    pub open_notional_usdc: f64,
    /// Proposed order notional, USDC
    pub proposed_usdc: f64,
    /// Evaluation time
    pub now: DateTime<Utc>,
}

/// Evaluate a signal against the bot's limits.
///
/// An order counts as "placed" unless it was rejected: rejected orders never
/// reached the exchange and must not consume cooldown or the daily budget.
pub fn evaluate(inputs: &RiskInputs) -> RiskVerdict {
    // CLOSE reduces risk: judged against the open position only.
    if inputs.kind == SignalKind::Close {
        return RiskVerdict::Allow;
    }

    let placed: Vec<&Order> = inputs
        .orders
        .iter()
        .filter(|o| o.status != OrderStatus::Rejected)
        .collect();

    // Cooldown since the last placed order
    if let Some(last) = placed.iter().map(|o| o.created_at).max() {
        let elapsed = inputs.now.signed_duration_since(last);
        if elapsed.num_minutes() < inputs.config.cooldown_minutes {
            return RiskVerdict::Deny(DenyReason::CooldownActive);
        }
    }

    // Daily cap, counted from local-day start
    let today = local_date_key(inputs.now);
    let today_count = placed
        .iter()
        .filter(|o| local_date_key(o.created_at) == today)
        .count();
    if today_count >= inputs.config.max_trades_per_day {
        return RiskVerdict::Deny(DenyReason::DailyCapReached);
    }

    // Position cap on open notional
    if inputs.open_notional_usdc + inputs.proposed_usdc > inputs.config.max_position_usdc {
        return RiskVerdict::Deny(DenyReason::PositionCapExceeded);
    }

    RiskVerdict::Allow
}

/// Date key in the worker's local timezone, for daily-cap grouping
pub(crate) fn local_date_key(ts: DateTime<Utc>) -> String {
    let local = ts.with_timezone(&Local);
    format!("{}-{:02}-{:02}", local.year(), local.month(), local.day())
}
