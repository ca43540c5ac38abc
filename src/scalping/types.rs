use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

/// How a position was opened, which also decides how it is closed:
/// grid entries rest a take-profit limit; late-window scalps exit at market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Level,
    HighScalp,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Level => "LEVEL",
            Classification::HighScalp => "HIGH_SCALP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Medium,
    High,
    Critical,
}

/// A binary market with its complementary token pair.
/// Immutable once registered; live prices stay in the book mirror.
#[derive(Debug, Clone)]
pub struct Market {
    pub id: String,
    pub condition_id: String,
    pub slug: String,
    pub question: String,
    pub end_time: DateTime<Utc>,
    pub token_yes: String,
    pub token_no: String,
}

impl Market {
    pub fn token(&self, side: Side) -> &str {
        match side {
            Side::Yes => &self.token_yes,
            Side::No => &self.token_no,
        }
    }

    pub fn side_of(&self, asset_id: &str) -> Option<Side> {
        if asset_id == self.token_yes {
            Some(Side::Yes)
        } else if asset_id == self.token_no {
            Some(Side::No)
        } else {
            None
        }
    }

    /// Seconds until market resolution. Negative once expired.
    pub fn time_remaining_secs(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_milliseconds() as f64 / 1000.0
    }
}

/// A filled holding. Created only by a confirmed fill ack,
/// removed only by a confirmed exit-fill ack.
#[derive(Debug, Clone)]
pub struct Position {
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub entry_time: DateTime<Utc>,
    pub classification: Classification,
    pub profit_target: f64,
    /// Grid trigger price for LEVEL entries; the entry price itself for scalps.
    pub level: f64,
}

impl Position {
    pub fn target_exit_price(&self) -> f64 {
        target_exit_price(self.entry_price, self.profit_target)
    }
}

/// Price at which buying the complementary token locks in exactly
/// `target` fractional profit on an entry at `entry`:
/// pnl per unit = 1 − entry − exit, so exit* = 1 − (1 + target)·entry.
pub fn target_exit_price(entry: f64, target: f64) -> f64 {
    (1.0 - (1.0 + target) * entry).max(0.01)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_exit_level() {
        // 5% on a 0.34 entry: 1 − 1.05·0.34 = 0.643
        assert!((target_exit_price(0.34, 0.05) - 0.643).abs() < 1e-9);
    }

    #[test]
    fn test_target_exit_high_scalp() {
        // 2% on a 0.88 entry: 1 − 1.02·0.88 = 0.1024
        assert!((target_exit_price(0.88, 0.02) - 0.1024).abs() < 1e-9);
    }

    #[test]
    fn test_target_exit_floors_at_one_cent() {
        assert!((target_exit_price(0.97, 0.05) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert_eq!(Side::No.opposite(), Side::Yes);
    }
}
