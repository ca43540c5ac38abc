//! Venue REST adapter — order placement, cancellation, collateral queries.
//!
//! Translates intents to the CLOB wire protocol, signs requests with the
//! HMAC-SHA256 L2 header scheme, and retries transient transport failures
//! (3 attempts, exponential backoff). Callers get a typed error taxonomy:
//! insufficient balance and min-notional rejects are recoverable decisions,
//! not failures.
//!
//! When trading is disabled every operation is acknowledged as simulated,
//! so the whole pipeline can run as a paper-trading dry run.

use std::time::Duration;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("order below minimum notional")]
    MinNotional,
    #[error("rejected by venue: {0}")]
    Rejected(String),
    #[error("venue request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

impl VenueError {
    fn is_transient(&self) -> bool {
        matches!(self, VenueError::Timeout | VenueError::Transport(_))
    }
}

/// Order-accepted ack. Does NOT imply a fill; the ledger mutates only on
/// fill events (or immediately, for simulated acks in dry-run).
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub simulated: bool,
}

/// L2 API credential material. The secret never leaves the signer.
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: SecretString,
    pub passphrase: SecretString,
    pub address: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("address", &self.address)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

pub struct VenueClient {
    http: reqwest::Client,
    rest_url: String,
    creds: Option<ApiCredentials>,
    trading_enabled: bool,
}

impl VenueClient {
    pub fn new(rest_url: &str, creds: Option<ApiCredentials>, trading_enabled: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            creds,
            trading_enabled,
        }
    }

    pub fn is_live(&self) -> bool {
        self.trading_enabled && self.creds.is_some()
    }

    // ─────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────

    /// Place an order. `post_only=true` rests on the book (rejected if it
    /// would cross); `post_only=false` is a marketable order.
    pub async fn place_order(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
        post_only: bool,
    ) -> Result<OrderAck, VenueError> {
        if !self.is_live() {
            let order_id = format!("sim-{}", Uuid::new_v4());
            info!(
                "📝 [DRY-RUN] {} {}x{:.2}@{:.3} post_only={} id={}",
                side.as_str(),
                &token_id[..8.min(token_id.len())],
                size,
                price,
                post_only,
                order_id,
            );
            return Ok(OrderAck {
                order_id,
                simulated: true,
            });
        }

        let body = json!({
            "tokenID": token_id,
            "price": format!("{:.3}", price),
            "size": format!("{:.2}", size),
            "side": side.as_str(),
            "postOnly": post_only,
        })
        .to_string();

        let text = self.request_with_retry("POST", "/order", &body).await?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| VenueError::Transport(format!("bad order response: {e}")))?;

        let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        let order_id = value
            .get("orderID")
            .or_else(|| value.get("orderId"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if !success || order_id.is_empty() {
            let msg = value
                .get("errorMsg")
                .or_else(|| value.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("order not accepted");
            return Err(classify_reject(msg));
        }

        debug!(
            "✅ order accepted {} {}@{:.3} id={}",
            side.as_str(),
            &token_id[..8.min(token_id.len())],
            price,
            &order_id[..8.min(order_id.len())],
        );
        Ok(OrderAck {
            order_id,
            simulated: false,
        })
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        if !self.is_live() {
            info!("📝 [DRY-RUN] cancel {}", order_id);
            return Ok(());
        }
        let body = json!({ "orderID": order_id }).to_string();
        self.request_with_retry("DELETE", "/order", &body).await?;
        debug!("🗑️ canceled {}", &order_id[..8.min(order_id.len())]);
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // Balance
    // ─────────────────────────────────────────────────

    /// Spendable collateral in whole units. The wire format is a raw
    /// 10⁻⁶-denominated string.
    pub async fn collateral_balance(&self) -> Result<f64, VenueError> {
        if !self.is_live() {
            // Paper bankroll: large enough that dry runs exercise the
            // preferred unwind path.
            return Ok(10_000.0);
        }
        let text = self
            .request_with_retry("GET", "/balance-allowance?asset_type=COLLATERAL", "")
            .await?;
        parse_balance(&text)
    }

    // ─────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────

    async fn request_with_retry(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, VenueError> {
        let mut last_err = VenueError::Transport("no attempt made".into());
        for attempt in 1..=MAX_ATTEMPTS {
            match self.request_once(method, path, body).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    warn!(
                        "🔁 {method} {path} attempt {attempt}/{MAX_ATTEMPTS} failed: {e} — retrying in {}ms",
                        delay.as_millis(),
                    );
                    last_err = e;
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn request_once(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, VenueError> {
        let url = format!("{}{}", self.rest_url, path);
        let mut req = match method {
            "POST" => self.http.post(&url),
            "DELETE" => self.http.delete(&url),
            _ => self.http.get(&url),
        };
        for (k, v) in self.auth_headers(method, path, body)? {
            req = req.header(k, v);
        }
        if !body.is_empty() {
            req = req
                .header("Content-Type", "application/json")
                .body(body.to_string());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                VenueError::Timeout
            } else {
                VenueError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(text);
        }
        if status.is_server_error() {
            return Err(VenueError::Transport(format!("HTTP {status}: {text}")));
        }
        Err(classify_reject(&text))
    }

    // ─────────────────────────────────────────────────
    // L2 signing
    // ─────────────────────────────────────────────────

    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(String, String)>, VenueError> {
        let Some(creds) = &self.creds else {
            return Ok(Vec::new());
        };
        let timestamp = Utc::now().timestamp();
        let signature = sign_request(creds.secret.expose_secret(), method, path, body, timestamp)?;
        Ok(vec![
            ("POLY_ADDRESS".into(), creds.address.clone()),
            ("POLY_API_KEY".into(), creds.api_key.clone()),
            ("POLY_SIGNATURE".into(), signature),
            ("POLY_TIMESTAMP".into(), timestamp.to_string()),
            (
                "POLY_PASSPHRASE".into(),
                creds.passphrase.expose_secret().to_string(),
            ),
        ])
    }
}

/// HMAC-SHA256 over `timestamp + method + path + body`, url-safe base64
/// encoded. The secret itself is base64 in one of several alphabets.
fn sign_request(
    secret: &str,
    method: &str,
    path: &str,
    body: &str,
    timestamp: i64,
) -> Result<String, VenueError> {
    let message = format!("{timestamp}{method}{path}{body}");
    let secret_bytes = URL_SAFE
        .decode(secret)
        .or_else(|_| URL_SAFE_NO_PAD.decode(secret))
        .or_else(|_| BASE64.decode(secret))
        .map_err(|e| VenueError::Transport(format!("bad api secret: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&secret_bytes)
        .map_err(|e| VenueError::Transport(format!("hmac key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

fn classify_reject(text: &str) -> VenueError {
    let lower = text.to_lowercase();
    if lower.contains("not enough balance") || lower.contains("insufficient") {
        VenueError::InsufficientBalance
    } else if lower.contains("min") && (lower.contains("size") || lower.contains("notional")) {
        VenueError::MinNotional
    } else {
        VenueError::Rejected(text.trim().chars().take(200).collect())
    }
}

fn parse_balance(text: &str) -> Result<f64, VenueError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| VenueError::Transport(format!("bad balance response: {e}")))?;
    let raw = value
        .get("balance")
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))
        .ok_or_else(|| VenueError::Transport("balance field missing".into()))?;
    let raw: Decimal = raw
        .parse()
        .map_err(|e| VenueError::Transport(format!("bad balance value: {e}")))?;
    (raw / Decimal::from(1_000_000))
        .to_f64()
        .ok_or_else(|| VenueError::Transport("balance out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_classify_insufficient_balance() {
        assert!(matches!(
            classify_reject("not enough balance / allowance"),
            VenueError::InsufficientBalance
        ));
    }

    #[test]
    fn test_classify_min_notional() {
        assert!(matches!(
            classify_reject("invalid order: min size is $5"),
            VenueError::MinNotional
        ));
    }

    #[test]
    fn test_classify_other_reject() {
        assert!(matches!(
            classify_reject("market closed"),
            VenueError::Rejected(_)
        ));
    }

    #[test]
    fn test_parse_balance_raw_six_decimals() {
        let text = r#"{"balance":"12500000","allowances":{"exchange":"99000000"}}"#;
        let bal = parse_balance(text).unwrap();
        assert!((Decimal::try_from(bal).unwrap() - dec!(12.5)).abs() < dec!(0.000001));
    }

    #[test]
    fn test_parse_balance_missing_field() {
        assert!(parse_balance("{}").is_err());
    }

    #[tokio::test]
    async fn test_dry_run_acks_are_simulated() {
        let client = VenueClient::new("https://clob.example", None, false);
        let ack = client
            .place_order("token", OrderSide::Buy, 0.34, 10.0, false)
            .await
            .unwrap();
        assert!(ack.simulated);
        assert!(ack.order_id.starts_with("sim-"));
        assert!(client.cancel_order(&ack.order_id).await.is_ok());
        assert!(client.collateral_balance().await.unwrap() > 0.0);
    }

    #[test]
    fn test_sign_request_is_deterministic() {
        let secret = URL_SAFE.encode(b"super-secret-key");
        let a = sign_request(&secret, "POST", "/order", "{}", 1_700_000_000).unwrap();
        let b = sign_request(&secret, "POST", "/order", "{}", 1_700_000_000).unwrap();
        assert_eq!(a, b);
        let c = sign_request(&secret, "POST", "/order", "{}", 1_700_000_001).unwrap();
        assert_ne!(a, c);
    }
}
