//! CSV Audit Trail
//!
//! Append-only operational history of orders, fills, rejections, metrics
//! snapshots and claims. This is not the system of record (the store is);
//! it exists so every policy decision and execution survives in a flat file.

use anyhow::{Context, Result};
use chrono::Utc;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;

/// Order record for CSV storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub timestamp: i64,
    pub order_id: String,
    pub bot_id: String,
    pub signal_id: String,
    pub market_slug: String,
    pub outcome: String,
    pub side: String,
    pub price: f64,
    pub size_usdc: f64,
    pub status: String,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

/// Fill record for CSV storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub timestamp: i64,
    pub fill_id: String,
    pub order_id: String,
    pub bot_id: String,
    pub market_slug: String,
    pub outcome: String,
    pub side: String,
    pub price: f64,
    pub shares: f64,
    pub size_usdc: f64,
    pub fee_usdc: f64,
}

/// Rejection record for policy diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub timestamp: i64,
    pub signal_id: String,
    pub bot_id: String,
    pub raw_signal: String,
    pub reason: String,
}

/// Metrics snapshot record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub timestamp: i64,
    pub bot_id: String,
    pub pnl_usd: f64,
    pub roi_pct: f64,
    pub trades: u64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub version: u64,
}

/// Claim record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimCsvRecord {
    pub timestamp: i64,
    pub bot_id: String,
    pub condition_id: String,
    pub amount_usdc: f64,
    pub tx_ref: String,
}

/// CSV persistence manager
pub struct CsvAudit {
    order_writer: AsyncRwLock<csv::Writer<std::fs::File>>,
    fill_writer: AsyncRwLock<csv::Writer<std::fs::File>>,
    rejection_writer: AsyncRwLock<csv::Writer<std::fs::File>>,
    metrics_writer: AsyncRwLock<csv::Writer<std::fs::File>>,
    claim_writer: AsyncRwLock<csv::Writer<std::fs::File>>,
}

impl CsvAudit {
    /// Create a new CSV audit manager rooted at `data_dir`
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);

        // Create directory if it doesn't exist
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Create subdirectories
        fs::create_dir_all(data_dir.join("orders"))?;
        fs::create_dir_all(data_dir.join("fills"))?;
        fs::create_dir_all(data_dir.join("rejections"))?;
        fs::create_dir_all(data_dir.join("metrics"))?;
        fs::create_dir_all(data_dir.join("claims"))?;

        // Get current date for filenames
        let today = Utc::now().format("%Y-%m-%d");

        let order_writer =
            Self::create_writer(&data_dir.join("orders"), &format!("orders_{}.csv", today))?;
        let fill_writer =
            Self::create_writer(&data_dir.join("fills"), &format!("fills_{}.csv", today))?;
        let rejection_writer = Self::create_writer(
            &data_dir.join("rejections"),
            &format!("rejections_{}.csv", today),
        )?;
        let metrics_writer =
            Self::create_writer(&data_dir.join("metrics"), &format!("metrics_{}.csv", today))?;
        let claim_writer =
            Self::create_writer(&data_dir.join("claims"), &format!("claims_{}.csv", today))?;

        Ok(Self {
            order_writer: AsyncRwLock::new(order_writer),
            fill_writer: AsyncRwLock::new(fill_writer),
            rejection_writer: AsyncRwLock::new(rejection_writer),
            metrics_writer: AsyncRwLock::new(metrics_writer),
            claim_writer: AsyncRwLock::new(claim_writer),
        })
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    /// Save an order row
    pub async fn save_order(&self, record: OrderRecord) -> Result<()> {
        let mut writer = self.order_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write order record")?;
        writer.flush().context("Failed to flush order writer")?;
        Ok(())
    }

    /// Save a fill row
    pub async fn save_fill(&self, record: FillRecord) -> Result<()> {
        let mut writer = self.fill_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write fill record")?;
        writer.flush().context("Failed to flush fill writer")?;
        Ok(())
    }

    /// Save a rejection diagnostics row
    pub async fn save_rejection(&self, record: RejectionRecord) -> Result<()> {
        let mut writer = self.rejection_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write rejection record")?;
        writer.flush().context("Failed to flush rejection writer")?;
        Ok(())
    }

    /// Save a metrics snapshot row
    pub async fn save_metrics(&self, record: MetricsRecord) -> Result<()> {
        let mut writer = self.metrics_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write metrics record")?;
        writer.flush().context("Failed to flush metrics writer")?;
        Ok(())
    }

    /// Save a claim row
    pub async fn save_claim(&self, record: ClaimCsvRecord) -> Result<()> {
        let mut writer = self.claim_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write claim record")?;
        writer.flush().context("Failed to flush claim writer")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_order_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let audit = CsvAudit::new(dir.path().to_str().unwrap()).unwrap();

        for i in 0..2 {
            audit
                .save_order(OrderRecord {
                    timestamp: 1_700_000_000 + i,
                    order_id: format!("o{}", i),
                    bot_id: "b1".to_string(),
                    signal_id: format!("s{}", i),
                    market_slug: "btc-15m".to_string(),
                    outcome: "YES".to_string(),
                    side: "BUY".to_string(),
                    price: 0.5,
                    size_usdc: 5.0,
                    status: "FILLED".to_string(),
                    reject_reason: None,
                })
                .await
                .unwrap();
        }

        let today = Utc::now().format("%Y-%m-%d");
        let path = dir.path().join("orders").join(format!("orders_{}.csv", today));
        let contents = fs::read_to_string(path).unwrap();
        // Header + two rows
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.lines().next().unwrap().contains("order_id"));
    }

    #[tokio::test]
    async fn test_reopen_does_not_duplicate_header() {
        let dir = tempfile::tempdir().unwrap();
        {
            let audit = CsvAudit::new(dir.path().to_str().unwrap()).unwrap();
            audit
                .save_rejection(RejectionRecord {
                    timestamp: 1,
                    signal_id: "s1".to_string(),
                    bot_id: "b1".to_string(),
                    raw_signal: "LONG".to_string(),
                    reason: "cooldown_active".to_string(),
                })
                .await
                .unwrap();
        }
        {
            let audit = CsvAudit::new(dir.path().to_str().unwrap()).unwrap();
            audit
                .save_rejection(RejectionRecord {
                    timestamp: 2,
                    signal_id: "s2".to_string(),
                    bot_id: "b1".to_string(),
                    raw_signal: "SHORT".to_string(),
                    reason: "daily_cap_reached".to_string(),
                })
                .await
                .unwrap();
        }

        let today = Utc::now().format("%Y-%m-%d");
        let path = dir
            .path()
            .join("rejections")
            .join(format!("rejections_{}.csv", today));
        let contents = fs::read_to_string(path).unwrap();
        let headers = contents
            .lines()
            .filter(|l| l.contains("signal_id"))
            .count();
        assert_eq!(headers, 1);
        assert_eq!(contents.lines().count(), 3);
    }
}
