//! CLOB exchange client (sandbox + mainnet)
//!
//! Handles HTTP communication with the Polymarket CLOB API. Orders are
//! signed with the worker's wallet key and authenticated with HMAC L2
//! headers. Construction goes through the safety controller only.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::utils::keccak256;
use hmac::{Hmac, Mac};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, StatusCode,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ClaimResult, ExchangeClient, ExchangeError, FillReport, OrderRequest, ResolutionStatus,
};
use crate::types::Outcome;

/// L2 API credentials for authenticated CLOB requests
#[derive(Debug, Clone)]
pub struct ClobCredentials {
    pub address: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

impl ClobCredentials {
    fn resolve_env(var_names: &[&str]) -> Option<String> {
        for var in var_names {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Resolve credentials from the environment, in the same precedence the
    /// rest of the stack uses
    pub fn from_env() -> Option<Self> {
        Some(Self {
            address: Self::resolve_env(&["POLYMARKET_ADDRESS"])?,
            api_key: Self::resolve_env(&["POLY_API_KEY", "API_KEY", "POLYMARKET_API_KEY"])?,
            api_secret: Self::resolve_env(&[
                "POLY_API_SECRET",
                "API_SECRET",
                "POLYMARKET_API_SECRET",
            ])?,
            api_passphrase: Self::resolve_env(&[
                "POLY_API_PASSPHRASE",
                "API_PASSPHRASE",
                "POLYMARKET_API_PASSPHRASE",
            ])?,
        })
    }
}

/// REST client for the CLOB order API
pub struct ClobClient {
    client: Client,
    base_url: String,
    credentials: ClobCredentials,
    wallet: LocalWallet,
    chain_id: u64,
}

#[derive(Debug, Serialize)]
struct SignedOrderPayload<'a> {
    condition_id: &'a str,
    outcome: &'a str,
    side: &'a str,
    price: f64,
    size: f64,
    taker_amount: f64,
    nonce: String,
    signature: String,
    signer: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderID")]
    order_id: String,
    status: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    size_matched: Option<f64>,
    #[serde(default)]
    fee: Option<f64>,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: String,
}

#[derive(Debug, Deserialize)]
struct MarketStatusResponse {
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    resolved: bool,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    amount: f64,
    tx_hash: String,
}

impl ClobClient {
    pub(crate) fn new(
        base_url: &str,
        credentials: ClobCredentials,
        wallet: LocalWallet,
        chain_id: u64,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(ExchangeError::Transport)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            wallet,
            chain_id,
        })
    }

    fn build_l2_headers(
        &self,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<HeaderMap, ExchangeError> {
        let timestamp = Utc::now().timestamp().to_string();
        let message = format!(
            "{}{}{}{}",
            timestamp,
            method.to_uppercase(),
            request_path,
            body
        );

        let secret_bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(&self.credentials.api_secret)
            .or_else(|_| general_purpose::URL_SAFE.decode(&self.credentials.api_secret))
            .map_err(|_| {
                ExchangeError::InvalidResponse(
                    "API secret is not url-safe base64".to_string(),
                )
            })?;

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| ExchangeError::Api(format!("HMAC init failed: {}", e)))?;
        mac.update(message.as_bytes());
        let signature = general_purpose::URL_SAFE.encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let pairs = [
            ("POLY_ADDRESS", self.credentials.address.as_str()),
            ("POLY_API_KEY", self.credentials.api_key.as_str()),
            ("POLY_PASSPHRASE", self.credentials.api_passphrase.as_str()),
            ("POLY_TIMESTAMP", timestamp.as_str()),
            ("POLY_SIGNATURE", signature.as_str()),
        ];
        for (name, value) in pairs {
            headers.insert(
                name,
                HeaderValue::from_str(value)
                    .map_err(|e| ExchangeError::Api(format!("bad header value: {}", e)))?,
            );
        }
        Ok(headers)
    }

    /// Sign the order digest with the worker wallet
    async fn sign_order(&self, request: &OrderRequest, nonce: &str) -> Result<String, ExchangeError> {
        let digest = keccak256(
            format!(
                "{}:{}:{}:{:.6}:{:.6}:{}:{}",
                request.condition_id,
                request.outcome,
                request.side,
                request.price,
                request.size_usdc,
                nonce,
                self.chain_id
            )
            .as_bytes(),
        );
        let signature = self
            .wallet
            .sign_message(digest)
            .await
            .map_err(|e| ExchangeError::Api(format!("order signing failed: {}", e)))?;
        Ok(format!("0x{}", hex::encode(signature.to_vec())))
    }

    fn classify_status(status: StatusCode, body: String) -> ExchangeError {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            ExchangeError::Api(format!("{}: {}", status, body))
        } else {
            ExchangeError::Rejected(format!("{}: {}", status, body))
        }
    }

    fn map_transport(e: reqwest::Error) -> ExchangeError {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Transport(e)
        }
    }
}

#[async_trait]
impl ExchangeClient for ClobClient {
    async fn submit_order(&self, request: &OrderRequest) -> Result<FillReport, ExchangeError> {
        let nonce = format!("{}", rand::random::<u64>());
        let signature = self.sign_order(request, &nonce).await?;

        let outcome = request.outcome.to_string();
        let side = request.side.to_string();
        let payload = SignedOrderPayload {
            condition_id: &request.condition_id,
            outcome: &outcome,
            side: &side,
            price: request.price,
            size: request.size_usdc,
            taker_amount: request.shares,
            nonce,
            signature,
            signer: format!("{:?}", self.wallet.address()),
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| ExchangeError::Api(format!("payload encoding failed: {}", e)))?;

        let path = "/order";
        let headers = self.build_l2_headers("POST", path, &body)?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let parsed: OrderResponse = response.json().await.map_err(Self::map_transport)?;
        match parsed.status.as_str() {
            "matched" | "filled" => {
                let price = parsed.price.unwrap_or(request.price);
                let shares = parsed
                    .size_matched
                    .unwrap_or(request.size_usdc / price.max(0.01));
                Ok(FillReport {
                    exchange_order_id: parsed.order_id,
                    price,
                    shares,
                    size_usdc: price * shares,
                    fee_usdc: parsed.fee.unwrap_or(0.0),
                })
            }
            "rejected" | "canceled" => Err(ExchangeError::Rejected(
                parsed.error_msg.unwrap_or_else(|| parsed.status.clone()),
            )),
            other => {
                warn!(order_id = %parsed.order_id, status = other, "unexpected order status");
                Err(ExchangeError::InvalidResponse(format!(
                    "unexpected order status '{}'",
                    other
                )))
            }
        }
    }

    async fn market_price(
        &self,
        condition_id: &str,
        outcome: Outcome,
    ) -> Result<f64, ExchangeError> {
        let response = self
            .client
            .get(format!("{}/price", self.base_url))
            .query(&[("condition_id", condition_id), ("outcome", &outcome.to_string())])
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let parsed: PriceResponse = response.json().await.map_err(Self::map_transport)?;
        parsed
            .price
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| {
                ExchangeError::InvalidResponse(format!("unparseable price '{}'", parsed.price))
            })
    }

    async fn resolution_status(
        &self,
        condition_id: &str,
    ) -> Result<ResolutionStatus, ExchangeError> {
        let response = self
            .client
            .get(format!("{}/markets/{}", self.base_url, condition_id))
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let parsed: MarketStatusResponse = response.json().await.map_err(Self::map_transport)?;
        debug!(condition_id, closed = parsed.closed, resolved = parsed.resolved, "market status");
        if parsed.resolved {
            Ok(ResolutionStatus::Resolved)
        } else {
            Ok(ResolutionStatus::Open)
        }
    }

    async fn claim(&self, condition_id: &str) -> Result<ClaimResult, ExchangeError> {
        let body = serde_json::json!({ "condition_id": condition_id }).to_string();
        let path = "/claim";
        let headers = self.build_l2_headers("POST", path, &body)?;

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let parsed: ClaimResponse = response.json().await.map_err(Self::map_transport)?;
        Ok(ClaimResult {
            amount_usdc: parsed.amount,
            tx_ref: parsed.tx_hash,
        })
    }
}
