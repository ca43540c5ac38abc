//! Exit coordinator — owns one market's resting take-profit orders.
//!
//! Placement policy: place when nothing rests, cancel-and-replace only when
//! the new exit price is strictly better (lower). A placement failure
//! records a price sentinel so the next ticks do not hammer the venue with
//! the same doomed order; the sentinel clears on price improvement, on an
//! exit fill, or at the forced-unwind gate.

use tracing::{debug, info, warn};

use super::venue::{OrderAck, OrderSide, VenueClient};

#[derive(Debug, Clone)]
struct TpOrder {
    order_id: String,
    price: f64,
}

#[derive(Debug, Default)]
pub struct ExitCoordinator {
    active: Vec<TpOrder>,
    /// Price of the most recent failed placement.
    sentinel: Option<f64>,
}

impl ExitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a resting order or a failed-placement sentinel exists.
    /// Either state blocks new grid entries.
    pub fn blocks_entries(&self) -> bool {
        !self.active.is_empty() || self.sentinel.is_some()
    }

    pub fn resting_count(&self) -> usize {
        self.active.len()
    }

    fn best_price(&self) -> Option<f64> {
        self.active
            .iter()
            .map(|o| o.price)
            .min_by(|a, b| a.partial_cmp(b).expect("finite prices"))
    }

    /// Handle a take-profit intent: BUY `token_id` post-only at `price`.
    /// Returns the ack of a newly placed order, None when nothing changed.
    pub async fn place_or_reprice(
        &mut self,
        venue: &VenueClient,
        token_id: &str,
        price: f64,
        size: f64,
    ) -> Option<OrderAck> {
        if let Some(failed_at) = self.sentinel {
            if price < failed_at - 1e-9 {
                // Improved enough to justify another attempt.
                self.sentinel = None;
            } else {
                debug!(
                    "⏸ TP suppressed after failure @{:.3} (current {:.3})",
                    failed_at, price,
                );
                return None;
            }
        }

        if let Some(best) = self.best_price() {
            if price >= best - 1e-9 {
                return None; // not strictly better, leave the order resting
            }
            info!("🔄 repricing TP {:.3} → {:.3}", best, price);
            if !self.cancel_all(venue).await {
                // Stale order may still be live; placing now could double up.
                return None;
            }
        }

        match venue
            .place_order(token_id, OrderSide::Buy, price, size, true)
            .await
        {
            Ok(ack) => {
                info!(
                    "📤 TP resting: BUY {}@{:.3} x{:.1} id={}",
                    &token_id[..8.min(token_id.len())],
                    price,
                    size,
                    &ack.order_id[..8.min(ack.order_id.len())],
                );
                self.active.push(TpOrder {
                    order_id: ack.order_id.clone(),
                    price,
                });
                Some(ack)
            }
            Err(e) => {
                warn!("❌ TP placement failed @{:.3}: {e} — holding off", price);
                self.sentinel = Some(price);
                None
            }
        }
    }

    /// Cancel every resting order (gate crossing, emergency unwind, market
    /// shutdown). Orders whose cancel failed stay tracked so we never place
    /// on top of a possibly-live order. Returns true when the set is empty.
    pub async fn cancel_all(&mut self, venue: &VenueClient) -> bool {
        self.sentinel = None;
        let orders = std::mem::take(&mut self.active);
        for order in orders {
            match venue.cancel_order(&order.order_id).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        "❌ cancel {} failed: {e} — keeping tracked",
                        &order.order_id[..8.min(order.order_id.len())],
                    );
                    self.active.push(order);
                }
            }
        }
        self.active.is_empty()
    }

    /// An exit fill arrived; whatever rested is finished.
    pub fn on_exit_fill(&mut self) {
        self.active.clear();
        self.sentinel = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry_venue() -> VenueClient {
        VenueClient::new("https://clob.example", None, false)
    }

    #[tokio::test]
    async fn test_place_then_reprice_on_improvement() {
        let venue = dry_venue();
        let mut coord = ExitCoordinator::new();

        let first = coord.place_or_reprice(&venue, "tok-no", 0.62, 10.0).await;
        assert!(first.is_some());
        assert_eq!(coord.resting_count(), 1);
        assert!(coord.blocks_entries());

        // Strictly better price → cancel and replace.
        let second = coord.place_or_reprice(&venue, "tok-no", 0.59, 10.0).await;
        assert!(second.is_some());
        assert_eq!(coord.resting_count(), 1);
        assert!((coord.best_price().unwrap() - 0.59).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_reprice_without_improvement() {
        let venue = dry_venue();
        let mut coord = ExitCoordinator::new();

        coord.place_or_reprice(&venue, "tok-no", 0.59, 10.0).await;
        // Same and worse prices leave the resting order untouched.
        assert!(coord.place_or_reprice(&venue, "tok-no", 0.59, 10.0).await.is_none());
        assert!(coord.place_or_reprice(&venue, "tok-no", 0.62, 10.0).await.is_none());
        assert!((coord.best_price().unwrap() - 0.59).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_placed_prices_are_non_increasing() {
        let venue = dry_venue();
        let mut coord = ExitCoordinator::new();
        let mut placed = Vec::new();
        for price in [0.62, 0.64, 0.60, 0.60, 0.55] {
            if coord.place_or_reprice(&venue, "tok-no", price, 10.0).await.is_some() {
                placed.push(price);
            }
        }
        assert_eq!(placed, vec![0.62, 0.60, 0.55]);
        assert!(placed.windows(2).all(|w| w[1] <= w[0]));
    }

    #[tokio::test]
    async fn test_exit_fill_clears_everything() {
        let venue = dry_venue();
        let mut coord = ExitCoordinator::new();
        coord.place_or_reprice(&venue, "tok-no", 0.62, 10.0).await;
        coord.on_exit_fill();
        assert!(!coord.blocks_entries());
        assert_eq!(coord.resting_count(), 0);
    }

    #[tokio::test]
    async fn test_sentinel_suppresses_until_improvement() {
        let venue = dry_venue();
        let mut coord = ExitCoordinator::new();
        coord.sentinel = Some(0.62);
        assert!(coord.blocks_entries());

        // Same price: still suppressed.
        assert!(coord.place_or_reprice(&venue, "tok-no", 0.62, 10.0).await.is_none());
        // Better price: sentinel clears and the order goes out.
        assert!(coord.place_or_reprice(&venue, "tok-no", 0.60, 10.0).await.is_some());
        assert!(coord.sentinel.is_none());
    }

    #[tokio::test]
    async fn test_cancel_all_clears_sentinel() {
        let venue = dry_venue();
        let mut coord = ExitCoordinator::new();
        coord.sentinel = Some(0.62);
        coord.place_or_reprice(&venue, "tok-no", 0.55, 10.0).await;
        assert!(coord.cancel_all(&venue).await);
        assert!(!coord.blocks_entries());
    }
}
