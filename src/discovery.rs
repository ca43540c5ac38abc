//! Market discovery — recurring-slug rotation and Gamma resolution.
//!
//! Short-duration markets run on a fixed cadence with predictable slugs:
//! `btc-updown-15m` plus the window's end timestamp. Given the prefix and
//! the wall clock, the live window's slug is pure arithmetic; the Gamma API
//! then resolves it into ids and the token pair.

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::info;

use crate::scalping::types::Market;

/// A "prefix" names the market family (no trailing end timestamp):
/// `btc-updown-15m` is a prefix, `btc-updown-15m-1771904700` is a full slug.
pub fn is_prefix_slug(slug: &str) -> bool {
    slug.rsplit('-')
        .next()
        .map(|last| last.parse::<u64>().is_err())
        .unwrap_or(true)
}

/// Window length implied by the prefix: "...-5m" → 300s, "...-15m" → 900s.
pub fn interval_secs(prefix: &str) -> i64 {
    if prefix.contains("-5m") {
        300
    } else if prefix.contains("-15m") {
        900
    } else {
        900
    }
}

/// Slug and end timestamp of the window live at `now`.
pub fn current_slug(prefix: &str, now: DateTime<Utc>) -> (String, i64) {
    let interval = interval_secs(prefix);
    let end_ts = (now.timestamp() / interval + 1) * interval;
    (format!("{prefix}-{end_ts}"), end_ts)
}

/// Extract the market slug from a venue URL (last path segment).
pub fn slug_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// Resolve a slug into a tradable `Market` via the Gamma REST API.
pub async fn resolve_market_by_slug(gamma_url: &str, slug: &str) -> anyhow::Result<Market> {
    info!("🔍 resolving market: {slug}");
    let url = format!("{}/markets?slug={slug}", gamma_url.trim_end_matches('/'));
    let resp: Value = reqwest::get(&url)
        .await
        .context("gamma request failed")?
        .json()
        .await
        .context("gamma response was not JSON")?;

    let entry = resp
        .as_array()
        .and_then(|a| a.first())
        .with_context(|| format!("no market found for slug {slug}"))?;
    let market = parse_market(entry)?;
    info!(
        "✅ market resolved: {} (YES={}… NO={}…)",
        market.id,
        &market.token_yes[..8.min(market.token_yes.len())],
        &market.token_no[..8.min(market.token_no.len())],
    );
    Ok(market)
}

fn parse_market(value: &Value) -> anyhow::Result<Market> {
    let id = value
        .get("id")
        .map(|v| v.to_string().trim_matches('"').to_string())
        .filter(|s| !s.is_empty() && s != "null")
        .context("market id missing")?;
    let condition_id = value
        .get("conditionId")
        .or_else(|| value.get("condition_id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let slug = value
        .get("slug")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let question = value
        .get("question")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let end_time = value
        .get("endDate")
        .or_else(|| value.get("end_date_iso"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        // Some responses carry a bare unix timestamp instead.
        .or_else(|| {
            value
                .get("endDateTs")
                .and_then(|v| v.as_i64())
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        })
        .context("market end date missing or unparsable")?;

    let (token_yes, token_no) = parse_token_pair(value)?;

    Ok(Market {
        id,
        condition_id,
        slug,
        question,
        end_time,
        token_yes,
        token_no,
    })
}

/// Token ids arrive either as a stringified JSON array (`clobTokenIds`) or
/// as a `tokens` array with explicit outcomes.
fn parse_token_pair(value: &Value) -> anyhow::Result<(String, String)> {
    let ids = value
        .get("clobTokenIds")
        .or_else(|| value.get("clob_token_ids"))
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok());
    if let Some(ids) = ids {
        if ids.len() >= 2 {
            return Ok((ids[0].clone(), ids[1].clone()));
        }
    }

    if let Some(tokens) = value.get("tokens").and_then(|v| v.as_array()) {
        let find = |outcome: &str| {
            tokens
                .iter()
                .find(|t| {
                    t.get("outcome")
                        .and_then(|o| o.as_str())
                        .is_some_and(|o| o.eq_ignore_ascii_case(outcome))
                })
                .and_then(|t| t.get("token_id").or_else(|| t.get("id")))
                .map(|v| v.to_string().trim_matches('"').to_string())
        };
        if let (Some(yes), Some(no)) = (find("Yes"), find("No")) {
            return Ok((yes, no));
        }
    }

    anyhow::bail!("market is missing its token pair")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefix_detection() {
        assert!(is_prefix_slug("btc-updown-15m"));
        assert!(!is_prefix_slug("btc-updown-15m-1771904700"));
    }

    #[test]
    fn test_interval_detection() {
        assert_eq!(interval_secs("btc-updown-5m"), 300);
        assert_eq!(interval_secs("btc-updown-15m"), 900);
        assert_eq!(interval_secs("eth-updown"), 900);
    }

    #[test]
    fn test_current_slug_rounds_up_to_window_end() {
        // 2026-02-24 03:36:40 UTC → window ends at the next 900s boundary.
        let now = Utc.timestamp_opt(1_771_904_200, 0).single().unwrap();
        let (slug, end_ts) = current_slug("btc-updown-15m", now);
        assert_eq!(end_ts, 1_771_904_700);
        assert_eq!(slug, "btc-updown-15m-1771904700");
        assert!(end_ts > now.timestamp());
        assert!(end_ts - now.timestamp() <= 900);
    }

    #[test]
    fn test_slug_from_url() {
        assert_eq!(
            slug_from_url("https://polymarket.com/event/btc-updown-15m-1771904700"),
            Some("btc-updown-15m-1771904700".to_string()),
        );
        assert_eq!(slug_from_url("not a url"), None);
    }

    #[test]
    fn test_parse_market_with_stringified_token_ids() {
        let value = json!({
            "id": "514",
            "conditionId": "0xabc",
            "slug": "btc-updown-15m-1771904700",
            "question": "Bitcoin Up or Down?",
            "endDate": "2026-02-24T03:45:00Z",
            "clobTokenIds": "[\"111\",\"222\"]"
        });
        let m = parse_market(&value).unwrap();
        assert_eq!(m.id, "514");
        assert_eq!(m.token_yes, "111");
        assert_eq!(m.token_no, "222");
        assert_eq!(m.condition_id, "0xabc");
    }

    #[test]
    fn test_parse_market_with_tokens_array() {
        let value = json!({
            "id": 515,
            "conditionId": "0xdef",
            "slug": "btc-updown-15m-x",
            "question": "Bitcoin Up or Down?",
            "endDate": "2026-02-24T04:00:00Z",
            "tokens": [
                { "outcome": "Yes", "token_id": "111" },
                { "outcome": "No", "token_id": "222" }
            ]
        });
        let m = parse_market(&value).unwrap();
        assert_eq!(m.token_yes, "111");
        assert_eq!(m.token_no, "222");
    }

    #[test]
    fn test_parse_market_missing_tokens_fails() {
        let value = json!({
            "id": "516",
            "endDate": "2026-02-24T04:00:00Z"
        });
        assert!(parse_market(&value).is_err());
    }
}
