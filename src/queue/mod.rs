//! Job queue and worker pool
//!
//! Signals and metrics recomputations run on separate lanes with independent
//! concurrency caps. Jobs for different bots run in parallel; jobs for the
//! same bot are serialized through a keyed mutex map held across risk
//! evaluation and order creation, which is the ordering guarantee the whole
//! pipeline leans on. Delivery is at-least-once: handlers are idempotent and
//! the queue additionally drops idempotency keys it has already accepted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::exchange::ExchangeError;
use crate::metrics::MetricsEngine;
use crate::processor::{ProcessOutcome, SignalProcessor};
use crate::types::Signal;

/// Per-bot async mutexes. Never a single global lock: cross-bot parallelism
/// must survive.
#[derive(Default)]
pub struct BotLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BotLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one bot, created on first use
    pub fn lock_for(&self, bot_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(bot_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Enqueue handle shared with the webhook adapter and the pipeline
#[derive(Clone)]
pub struct JobQueue {
    signal_tx: mpsc::UnboundedSender<Signal>,
    metrics_tx: mpsc::UnboundedSender<String>,
    seen_keys: Arc<Mutex<HashSet<String>>>,
}

/// Consumer ends of the two lanes
pub struct JobReceivers {
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    metrics_rx: mpsc::UnboundedReceiver<String>,
}

/// Create a queue and its receivers
pub fn job_channel() -> (JobQueue, JobReceivers) {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
    (
        JobQueue {
            signal_tx,
            metrics_tx,
            seen_keys: Arc::new(Mutex::new(HashSet::new())),
        },
        JobReceivers {
            signal_rx,
            metrics_rx,
        },
    )
}

impl JobQueue {
    /// Enqueue a signal job. Returns false when the idempotency key was
    /// already accepted; the handler-level guard still protects against
    /// duplicates that slip past this process-local set.
    pub fn enqueue_signal(&self, signal: Signal) -> bool {
        {
            let mut seen = self.seen_keys.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(signal.id.clone()) {
                debug!(signal_id = %signal.id, "duplicate idempotency key dropped at enqueue");
                return false;
            }
        }
        if self.signal_tx.send(signal).is_err() {
            warn!("signal lane closed, dropping job");
            return false;
        }
        true
    }

    /// Enqueue a metrics recomputation. Always safe to repeat.
    pub fn enqueue_metrics(&self, bot_id: &str) {
        if self.metrics_tx.send(bot_id.to_string()).is_err() {
            warn!(bot_id, "metrics lane closed, dropping job");
        }
    }

    /// Sender the signal lane uses to chain metrics jobs after fills. Kept
    /// separate from the full queue handle so the signal lane holding it
    /// cannot keep its own channel open at shutdown.
    pub fn metrics_sender(&self) -> mpsc::UnboundedSender<String> {
        self.metrics_tx.clone()
    }
}

/// Bounded-concurrency consumer over both lanes
pub struct WorkerPool {
    processor: Arc<SignalProcessor>,
    metrics: Arc<MetricsEngine>,
    locks: Arc<BotLocks>,
    metrics_tx: mpsc::UnboundedSender<String>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        processor: Arc<SignalProcessor>,
        metrics: Arc<MetricsEngine>,
        locks: Arc<BotLocks>,
        metrics_tx: mpsc::UnboundedSender<String>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            processor,
            metrics,
            locks,
            metrics_tx,
            config,
        }
    }

    /// Spawn both lane dispatchers. They run until their channels close and
    /// drain, so dropping every `JobQueue` handle is the shutdown signal.
    pub fn start(self, receivers: JobReceivers) -> (JoinHandle<()>, JoinHandle<()>) {
        let JobReceivers {
            mut signal_rx,
            mut metrics_rx,
        } = receivers;

        let signal_sem = Arc::new(Semaphore::new(self.config.signal_concurrency));
        let metrics_sem = Arc::new(Semaphore::new(self.config.metrics_concurrency));

        let processor = self.processor;
        let locks = self.locks.clone();
        let metrics_tx = self.metrics_tx;
        let config = self.config.clone();
        let signal_handle = tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let permit = match signal_sem.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let processor = processor.clone();
                let locks = locks.clone();
                let metrics_tx = metrics_tx.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_signal_job(&processor, &locks, &metrics_tx, &config, signal).await;
                });
            }
            info!("signal lane drained");
        });

        let metrics = self.metrics;
        let locks = self.locks;
        let config = self.config;
        let metrics_handle = tokio::spawn(async move {
            while let Some(bot_id) = metrics_rx.recv().await {
                let permit = match metrics_sem.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let metrics = metrics.clone();
                let locks = locks.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_metrics_job(&metrics, &locks, &config, &bot_id).await;
                });
            }
            info!("metrics lane drained");
        });

        (signal_handle, metrics_handle)
    }
}

/// Process one signal with bounded retries, holding the bot's lock for the
/// whole evaluate-and-place sequence.
async fn run_signal_job(
    processor: &SignalProcessor,
    locks: &BotLocks,
    metrics_tx: &mpsc::UnboundedSender<String>,
    config: &WorkerConfig,
    signal: Signal,
) {
    let lock = locks.lock_for(&signal.bot_id);
    let _guard = lock.lock().await;

    let attempts = config.max_retries.max(1);
    for attempt in 1..=attempts {
        let last = attempt == attempts;
        match processor.process(&signal, last).await {
            Ok(ProcessOutcome::Filled { order_id }) => {
                debug!(signal_id = %signal.id, order_id = %order_id, "signal filled");
                if metrics_tx.send(signal.bot_id.clone()).is_err() {
                    warn!(bot_id = %signal.bot_id, "metrics lane closed");
                }
                return;
            }
            Ok(outcome) => {
                debug!(signal_id = %signal.id, ?outcome, "signal settled without fill");
                return;
            }
            Err(e) if e.is_transient() && !last => {
                let backoff = config.retry_backoff_ms * (1 << (attempt - 1));
                warn!(
                    signal_id = %signal.id,
                    attempt,
                    backoff_ms = backoff,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => {
                // Terminal for this job: data errors and exhausted retries.
                // The processor already left the order in a terminal state.
                error!(signal_id = %signal.id, bot_id = %signal.bot_id, error = %e, "signal job failed");
                return;
            }
        }
    }
}

fn is_transient_metrics_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ExchangeError>()
        .map(|ee| ee.is_transient())
        .unwrap_or(false)
}

/// Recompute one bot's metrics under its lock so a stale replay can never
/// overwrite a fresher snapshot.
async fn run_metrics_job(
    metrics: &MetricsEngine,
    locks: &BotLocks,
    config: &WorkerConfig,
    bot_id: &str,
) {
    let lock = locks.lock_for(bot_id);
    let _guard = lock.lock().await;

    let attempts = config.max_retries.max(1);
    for attempt in 1..=attempts {
        match metrics.recompute(bot_id).await {
            Ok(_) => return,
            Err(e) if is_transient_metrics_error(&e) && attempt < attempts => {
                let backoff = config.retry_backoff_ms * (1 << (attempt - 1));
                warn!(bot_id, attempt, backoff_ms = backoff, error = %e, "metrics retry");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => {
                // Never write a partial snapshot on failure
                error!(bot_id, error = %e, "metrics job failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchange, StaticMarkets};
    use crate::store::{MemoryStore, Store};
    use crate::types::{Bot, BotConfig, BotStatus};
    use chrono::Utc;

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            tag: "test".to_string(),
            signal_concurrency: 5,
            metrics_concurrency: 5,
            max_retries: 2,
            retry_backoff_ms: 1,
            claim_scan_interval_secs: 300,
        }
    }

    fn make_signal(id: &str, bot_id: &str, raw: &str) -> Signal {
        Signal {
            id: id.to_string(),
            bot_id: bot_id.to_string(),
            raw: raw.to_string(),
            received_at: Utc::now(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn pipeline(
        config: BotConfig,
    ) -> (Arc<MemoryStore>, Arc<MockExchange>, JobQueue, JobReceivers, WorkerPool) {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(MockExchange::new(0.0, 0.0));
        store
            .insert_bot(Bot {
                id: "b1".to_string(),
                wallet: "0x0000000000000000000000000000000000000001".to_string(),
                status: BotStatus::Active,
                config,
                created_at: Utc::now(),
            })
            .unwrap();

        let processor = Arc::new(SignalProcessor::new(
            store.clone(),
            exchange.clone(),
            Arc::new(StaticMarkets),
            None,
            Arc::new(crate::processor::TradeLimits::unbounded()),
        ));
        let engine = Arc::new(MetricsEngine::new(store.clone(), exchange.clone(), None));
        let (queue, receivers) = job_channel();
        let pool = WorkerPool::new(
            processor,
            engine,
            Arc::new(BotLocks::new()),
            queue.metrics_sender(),
            worker_config(),
        );
        (store, exchange, queue, receivers, pool)
    }

    #[test]
    fn test_bot_locks_return_same_lock_per_bot() {
        let locks = BotLocks::new();
        let a = locks.lock_for("b1");
        let b = locks.lock_for("b1");
        let c = locks.lock_for("b2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_signal_job_fills_and_triggers_metrics() {
        let (store, _exchange, queue, receivers, pool) = pipeline(BotConfig {
            cooldown_minutes: 0,
            ..Default::default()
        });
        pool.start(receivers);

        assert!(queue.enqueue_signal(make_signal("s1", "b1", "LONG")));
        let probe = store.clone();
        wait_for(move || probe.get_metrics("b1").map(|m| m.is_some()).unwrap_or(false)).await;

        assert_eq!(store.fills_for_bot("b1").unwrap().len(), 1);
        let metrics = store.get_metrics("b1").unwrap().unwrap();
        assert_eq!(metrics.trades, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_dropped_at_enqueue() {
        let (store, exchange, queue, receivers, pool) = pipeline(BotConfig {
            cooldown_minutes: 0,
            ..Default::default()
        });
        pool.start(receivers);

        assert!(queue.enqueue_signal(make_signal("s1", "b1", "LONG")));
        assert!(!queue.enqueue_signal(make_signal("s1", "b1", "LONG")));

        let probe = store.clone();
        wait_for(move || probe.orders_for_bot("b1").map(|o| !o.is_empty()).unwrap_or(false)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.orders_for_bot("b1").unwrap().len(), 1);
        assert_eq!(exchange.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_same_bot_signals_serialize_through_cooldown() {
        // Two near-simultaneous signals must produce exactly one placed order
        // and one cooldown denial, never two fills racing past the gate.
        let (store, exchange, queue, receivers, pool) = pipeline(BotConfig {
            cooldown_minutes: 30,
            ..Default::default()
        });
        pool.start(receivers);

        queue.enqueue_signal(make_signal("s1", "b1", "LONG"));
        queue.enqueue_signal(make_signal("s2", "b1", "LONG"));

        let probe = store.clone();
        wait_for(move || probe.orders_for_bot("b1").map(|o| o.len() == 2).unwrap_or(false)).await;

        let orders = store.orders_for_bot("b1").unwrap();
        let filled = orders
            .iter()
            .filter(|o| o.status == crate::types::OrderStatus::Filled)
            .count();
        let denied = orders
            .iter()
            .filter(|o| o.reject_reason.as_deref() == Some("cooldown_active"))
            .count();
        assert_eq!(filled, 1);
        assert_eq!(denied, 1);
        assert_eq!(exchange.submit_calls(), 1);
    }
}
