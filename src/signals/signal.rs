use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Side;

/// Maximum number of take-profit levels a signal carries.
pub const MAX_TAKE_PROFITS: usize = 4;

/// Strips the perpetual `.P` suffix and upper-cases, e.g. `idolusdt.P` -> `IDOLUSDT`.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().replace(".P", "").replace(".p", "").to_uppercase()
}

/// Stop and take-profit prices at fixed percentage distances from `entry`.
pub fn default_levels(side: Side, entry: f64, tp_percent: f64, sl_percent: f64) -> (f64, f64) {
    match side {
        Side::Long => (entry * (1.0 + tp_percent / 100.0), entry * (1.0 - sl_percent / 100.0)),
        Side::Short => (entry * (1.0 - tp_percent / 100.0), entry * (1.0 + sl_percent / 100.0)),
    }
}

/// A trade alert as it arrives, before validation. Stop and take profits may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInput {
    pub symbol: String,
    pub side: Side,
    pub entry: f64,
    pub stop_loss: Option<f64>,
    pub take_profits: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SignalInput {
    pub fn has_stop(&self) -> bool {
        self.stop_loss.is_some()
    }

    pub fn has_take_profits(&self) -> bool {
        !self.take_profits.is_empty()
    }

    /// Validates as-is. A missing stop or take profit is an error.
    pub fn validate(self) -> Result<Signal> {
        let stop = self
            .stop_loss
            .ok_or_else(|| Error::InvalidSignal(format!("{}: missing stop loss", self.symbol)))?;
        Signal::new(
            &self.symbol,
            self.side,
            self.entry,
            stop,
            self.take_profits,
            self.timestamp,
        )
    }

    /// Fills a missing stop and/or take profit from percentage defaults, then validates.
    pub fn validate_with_defaults(self, tp_percent: f64, sl_percent: f64) -> Result<Signal> {
        let (default_tp, default_sl) = default_levels(self.side, self.entry, tp_percent, sl_percent);
        let stop = self.stop_loss.unwrap_or(default_sl);
        let tps = if self.take_profits.is_empty() {
            vec![default_tp]
        } else {
            self.take_profits
        };
        Signal::new(&self.symbol, self.side, self.entry, stop, tps, self.timestamp)
    }
}

/// A validated, normalized trade intent. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    symbol: String,
    side: Side,
    entry: f64,
    stop_loss: f64,
    take_profits: Vec<f64>,
    timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        symbol: &str,
        side: Side,
        entry: f64,
        stop_loss: f64,
        mut take_profits: Vec<f64>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(Error::InvalidSignal("empty symbol".into()));
        }
        let invalid = |msg: String| Error::InvalidSignal(format!("{}: {}", symbol, msg));

        if !(entry.is_finite() && entry > 0.0) {
            return Err(invalid(format!("invalid entry {}", entry)));
        }
        if !(stop_loss.is_finite() && stop_loss > 0.0) {
            return Err(invalid(format!("invalid stop loss {}", stop_loss)));
        }
        if !side.is_beyond(entry, stop_loss) {
            return Err(invalid(format!(
                "stop {} is not on the adverse side of entry {} for {}",
                stop_loss, entry, side
            )));
        }

        if take_profits.is_empty() {
            return Err(invalid("no take profit".into()));
        }
        take_profits.truncate(MAX_TAKE_PROFITS);
        let mut previous = entry;
        for (i, &tp) in take_profits.iter().enumerate() {
            if !(tp.is_finite() && tp > 0.0) {
                return Err(invalid(format!("invalid TP{} {}", i + 1, tp)));
            }
            if !side.is_beyond(tp, previous) {
                return Err(invalid(format!(
                    "TP{} {} must be beyond {} for {}",
                    i + 1,
                    tp,
                    previous,
                    side
                )));
            }
            previous = tp;
        }

        Ok(Self {
            symbol,
            side,
            entry,
            stop_loss,
            take_profits,
            timestamp,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn entry(&self) -> f64 {
        self.entry
    }

    pub fn stop_loss(&self) -> f64 {
        self.stop_loss
    }

    pub fn take_profits(&self) -> &[f64] {
        &self.take_profits
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} @ {} SL {} TPs {:?} ({})",
            self.symbol,
            self.side.as_str().to_uppercase(),
            self.entry,
            self.stop_loss,
            self.take_profits,
            self.timestamp.format("%Y-%m-%d %H:%M")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::base_time;

    #[test]
    fn normalizes_perpetual_suffix() {
        assert_eq!(normalize_symbol("idolusdt.P"), "IDOLUSDT");
        assert_eq!(normalize_symbol(" BTCUSDT "), "BTCUSDT");
    }

    #[test]
    fn accepts_valid_long() {
        let s = Signal::new("btcusdt.P", Side::Long, 100.0, 95.0, vec![102.0, 104.0], base_time())
            .unwrap();
        assert_eq!(s.symbol(), "BTCUSDT");
        assert_eq!(s.take_profits(), &[102.0, 104.0]);
    }

    #[test]
    fn rejects_stop_on_wrong_side() {
        assert!(Signal::new("X", Side::Long, 100.0, 101.0, vec![102.0], base_time()).is_err());
        assert!(Signal::new("X", Side::Short, 100.0, 99.0, vec![98.0], base_time()).is_err());
    }

    #[test]
    fn requires_a_take_profit() {
        assert!(Signal::new("X", Side::Long, 100.0, 95.0, vec![], base_time()).is_err());
    }

    #[test]
    fn rejects_non_monotonic_take_profits() {
        let r = Signal::new("X", Side::Long, 100.0, 95.0, vec![104.0, 102.0], base_time());
        assert!(r.is_err());
        let r = Signal::new("X", Side::Short, 100.0, 105.0, vec![98.0, 98.0], base_time());
        assert!(r.is_err());
        let r = Signal::new("X", Side::Short, 100.0, 105.0, vec![101.0], base_time());
        assert!(r.is_err());
    }

    #[test]
    fn rejects_non_finite_prices() {
        let tps = || vec![102.0];
        assert!(Signal::new("X", Side::Long, f64::NAN, 95.0, tps(), base_time()).is_err());
        assert!(Signal::new("X", Side::Long, 100.0, 0.0, tps(), base_time()).is_err());
        assert!(Signal::new("X", Side::Long, 100.0, 95.0, vec![f64::INFINITY], base_time()).is_err());
        assert!(Signal::new("", Side::Long, 100.0, 95.0, tps(), base_time()).is_err());
    }

    #[test]
    fn keeps_only_first_four_take_profits() {
        let s = Signal::new(
            "X",
            Side::Long,
            100.0,
            95.0,
            vec![101.0, 102.0, 103.0, 104.0, 105.0],
            base_time(),
        )
        .unwrap();
        assert_eq!(s.take_profits().len(), 4);
    }

    #[test]
    fn defaults_fill_missing_levels() {
        let input = SignalInput {
            symbol: "ethusdt".into(),
            side: Side::Short,
            entry: 200.0,
            stop_loss: None,
            take_profits: vec![],
            timestamp: base_time(),
        };
        assert!(input.clone().validate().is_err());
        let s = input.validate_with_defaults(2.0, 5.0).unwrap();
        assert!((s.stop_loss() - 210.0).abs() < 1e-9);
        assert!((s.take_profits()[0] - 196.0).abs() < 1e-9);
    }
}
