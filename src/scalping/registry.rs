//! Market registry — the set of tracked markets and their lifecycle.
//!
//! Markets enter at discovery, are iterated while live, and are dropped
//! once past end time plus a grace window. The registry owns no prices.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::Market;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an expired market is kept before removal.
    pub grace: Duration,
    /// Markets closer than this to expiry are not admitted.
    pub min_time_to_expiry: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(600),
            min_time_to_expiry: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
pub struct MarketRegistry {
    cfg: RegistryConfig,
    markets: HashMap<String, Market>,
}

impl MarketRegistry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self {
            cfg,
            markets: HashMap::new(),
        }
    }

    /// Admit a market. Rejects markets already expired or too close to it.
    pub fn register(&mut self, market: Market, now: DateTime<Utc>) -> anyhow::Result<()> {
        let remaining = market.time_remaining_secs(now);
        if remaining <= 0.0 {
            anyhow::bail!("market {} already expired", market.slug);
        }
        if remaining < self.cfg.min_time_to_expiry.as_secs_f64() {
            anyhow::bail!(
                "market {} too close to expiry ({remaining:.0}s remaining)",
                market.slug,
            );
        }
        if self.markets.contains_key(&market.id) {
            anyhow::bail!("market {} already registered", market.id);
        }
        self.markets.insert(market.id.clone(), market);
        Ok(())
    }

    pub fn get(&self, market_id: &str) -> Option<&Market> {
        self.markets.get(market_id)
    }

    pub fn contains(&self, market_id: &str) -> bool {
        self.markets.contains_key(market_id)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn for_each_active<F: FnMut(&Market)>(&self, now: DateTime<Utc>, mut f: F) {
        for m in self.markets.values() {
            if m.time_remaining_secs(now) > 0.0 {
                f(m);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    pub fn remove(&mut self, market_id: &str) -> Option<Market> {
        self.markets.remove(market_id)
    }

    /// Drop markets past `end_time + grace`; returns the removed markets.
    pub fn prune(&mut self, now: DateTime<Utc>) -> Vec<Market> {
        let grace = self.cfg.grace.as_secs_f64();
        let expired: Vec<String> = self
            .markets
            .values()
            .filter(|m| m.time_remaining_secs(now) < -grace)
            .map(|m| m.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.markets.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn market(id: &str, secs_to_end: i64) -> Market {
        Market {
            id: id.to_string(),
            condition_id: format!("cond-{id}"),
            slug: format!("btc-updown-15m-{id}"),
            question: "Bitcoin Up or Down?".to_string(),
            end_time: Utc::now() + TimeDelta::seconds(secs_to_end),
            token_yes: format!("{id}-yes"),
            token_no: format!("{id}-no"),
        }
    }

    #[test]
    fn test_register_rejects_expired() {
        let mut reg = MarketRegistry::new(RegistryConfig::default());
        assert!(reg.register(market("m1", -10), Utc::now()).is_err());
    }

    #[test]
    fn test_register_rejects_too_close_to_expiry() {
        let mut reg = MarketRegistry::new(RegistryConfig::default());
        assert!(reg.register(market("m1", 120), Utc::now()).is_err());
    }

    #[test]
    fn test_register_and_duplicate() {
        let mut reg = MarketRegistry::new(RegistryConfig::default());
        assert!(reg.register(market("m1", 900), Utc::now()).is_ok());
        assert!(reg.register(market("m1", 900), Utc::now()).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_prune_respects_grace() {
        let mut reg = MarketRegistry::new(RegistryConfig::default());
        let now = Utc::now();
        reg.register(market("live", 900), now).unwrap();
        assert!(reg.register(market("old", 400), now).is_ok());

        // 500s past "old"'s end: still inside the 600s grace.
        let later = now + TimeDelta::seconds(900);
        assert!(reg.prune(later).is_empty());

        // 701s past its end: pruned.
        let much_later = now + TimeDelta::seconds(1101);
        let removed = reg.prune(much_later);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "old");
        assert!(reg.contains("live"));
    }
}
