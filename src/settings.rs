//! Process settings, loaded from the environment (with `.env` support).

use std::env;

use secrecy::SecretString;

use crate::scalping::venue::ApiCredentials;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Market family prefix (auto-rotating) or a full slug (single market).
    pub market_slug: String,
    pub rest_url: String,
    /// Base WS url; channel paths (`/market`, `/user`) are appended.
    pub ws_base_url: String,
    pub gamma_url: String,
    pub control_addr: String,
    /// Dry-run gate: when false, orders are logged and acked as simulated.
    pub trading_enabled: bool,
    pub api_key: Option<String>,
    pub api_secret: Option<SecretString>,
    pub api_passphrase: Option<SecretString>,
    pub wallet_address: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            market_slug: env::var("POLYMARKET_MARKET_SLUG")
                .unwrap_or_else(|_| "btc-updown-15m".into()),
            rest_url: env::var("POLYMARKET_REST_URL")
                .unwrap_or_else(|_| "https://clob.polymarket.com".into()),
            ws_base_url: env::var("POLYMARKET_WS_BASE_URL")
                .unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws".into()),
            gamma_url: env::var("POLYMARKET_GAMMA_URL")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".into()),
            control_addr: env::var("CONTROL_ADDR").unwrap_or_else(|_| "127.0.0.1:8090".into()),
            trading_enabled: env::var("TRADING_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            api_key: env::var("POLYMARKET_API_KEY").ok().filter(|s| !s.is_empty()),
            api_secret: env::var("POLYMARKET_API_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            api_passphrase: env::var("POLYMARKET_API_PASSPHRASE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            wallet_address: env::var("POLYMARKET_WALLET_ADDRESS")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }

    /// Complete credential set, or None when any piece is missing.
    pub fn credentials(&self) -> Option<ApiCredentials> {
        Some(ApiCredentials {
            api_key: self.api_key.clone()?,
            secret: self.api_secret.clone()?,
            passphrase: self.api_passphrase.clone()?,
            address: self.wallet_address.clone()?,
        })
    }
}
