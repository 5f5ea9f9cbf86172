//! PolyHook Library
//!
//! Signal-driven position taker for Polymarket prediction markets.
//!
//! ```text
//! webhook adapter → JobQueue → SignalProcessor → {RiskGate, SafetyController, ExchangeClient}
//!                                      ↓
//!                               Order + Fill store → MetricsEngine → BotMetrics
//!
//! ClaimScanner runs on its own timer over Bot/Fill state.
//! ```

pub mod claims;
pub mod config;
pub mod exchange;
pub mod metrics;
pub mod persistence;
pub mod processor;
pub mod queue;
pub mod risk;
pub mod safety;
pub mod store;
pub mod types;
