use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::ladder::Outcome;

/// Gate decision for a new signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    InsufficientBalance,
    MaxPositionsReached,
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Admitted => write!(f, "admitted"),
            Admission::InsufficientBalance => write!(f, "insufficient_balance"),
            Admission::MaxPositionsReached => write!(f, "max_positions_reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalancePoint {
    pub time: DateTime<Utc>,
    pub balance: f64,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    symbol: String,
    exit_time: DateTime<Utc>,
    pnl: f64,
}

/// Sequential balance and open-slot accounting. Callers must feed signals in
/// ascending timestamp order.
#[derive(Debug, Clone)]
pub struct CapitalLedger {
    starting_balance: f64,
    balance: f64,
    position_size: f64,
    max_concurrent_positions: usize,
    open: Vec<OpenPosition>,
    curve: Vec<BalancePoint>,
}

impl CapitalLedger {
    pub fn new(starting_balance: f64, position_size: f64, max_concurrent_positions: usize) -> Self {
        Self {
            starting_balance,
            balance: starting_balance,
            position_size,
            max_concurrent_positions,
            open: Vec::new(),
            curve: Vec::new(),
        }
    }

    pub fn starting_balance(&self) -> f64 {
        self.starting_balance
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn position_size(&self) -> f64 {
        self.position_size
    }

    pub fn open_position_count(&self) -> usize {
        self.open.len()
    }

    pub fn balance_curve(&self) -> &[BalancePoint] {
        &self.curve
    }

    /// Applies pnl of every position that exited at or before `t`, in exit order.
    pub fn settle_until(&mut self, t: DateTime<Utc>) {
        let (mut done, still_open): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.open).into_iter().partition(|p| p.exit_time <= t);
        self.open = still_open;
        done.sort_by_key(|p| p.exit_time);
        for p in done {
            self.apply(p);
        }
    }

    pub fn settle_all(&mut self) {
        let mut done = std::mem::take(&mut self.open);
        done.sort_by_key(|p| p.exit_time);
        for p in done {
            self.apply(p);
        }
    }

    fn apply(&mut self, p: OpenPosition) {
        self.balance += p.pnl;
        debug!(
            "Settled {} at {}: pnl {:.2}, balance {:.2}",
            p.symbol, p.exit_time, p.pnl, self.balance
        );
        self.curve.push(BalancePoint {
            time: p.exit_time,
            balance: self.balance,
        });
    }

    /// Settles due positions, then gates a signal arriving at `t`.
    pub fn try_admit(&mut self, t: DateTime<Utc>) -> Admission {
        self.settle_until(t);
        if self.balance < self.position_size {
            Admission::InsufficientBalance
        } else if self.open.len() >= self.max_concurrent_positions {
            Admission::MaxPositionsReached
        } else {
            Admission::Admitted
        }
    }

    /// Occupies a slot until the outcome's exit time. No-entry outcomes are ignored.
    pub fn record(&mut self, symbol: &str, outcome: &Outcome) {
        if !outcome.filled() {
            return;
        }
        let Some(exit_time) = outcome.exit_time else {
            return;
        };
        self.open.push(OpenPosition {
            symbol: symbol.to_string(),
            exit_time,
            pnl: outcome.realized_pnl,
        });
    }

    /// Largest peak-to-trough decline of the balance curve, in percent.
    pub fn max_drawdown_percent(&self) -> f64 {
        let mut peak = self.starting_balance;
        let mut worst: f64 = 0.0;
        for point in &self.curve {
            peak = peak.max(point.balance);
            if peak > 0.0 {
                worst = worst.max((peak - point.balance) / peak * 100.0);
            }
        }
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::TradeResult;
    use crate::test_helpers::base_time;
    use chrono::Duration;

    fn outcome(pnl: f64, exit_minutes: i64) -> Outcome {
        Outcome {
            result: if pnl < 0.0 { TradeResult::Loss } else { TradeResult::Win },
            realized_pnl: pnl,
            pnl_percent: pnl / 50.0 * 100.0,
            entry_time: Some(base_time()),
            entry_price: Some(100.0),
            exit_time: Some(base_time() + Duration::minutes(exit_minutes)),
            exit_price: Some(100.0),
            bars_in_trade: 1,
            exits: vec![],
        }
    }

    #[test]
    fn rejects_when_slots_full() {
        let mut ledger = CapitalLedger::new(1000.0, 50.0, 2);
        assert_eq!(ledger.try_admit(base_time()), Admission::Admitted);
        ledger.record("A", &outcome(5.0, 60));
        assert_eq!(ledger.try_admit(base_time()), Admission::Admitted);
        ledger.record("B", &outcome(-2.0, 90));
        assert_eq!(
            ledger.try_admit(base_time() + Duration::minutes(10)),
            Admission::MaxPositionsReached
        );
        assert_eq!(ledger.open_position_count(), 2);

        // After A exits a slot frees up and its pnl lands.
        assert_eq!(
            ledger.try_admit(base_time() + Duration::minutes(60)),
            Admission::Admitted
        );
        assert_eq!(ledger.open_position_count(), 1);
        assert_eq!(ledger.balance(), 1005.0);

        ledger.settle_all();
        assert_eq!(ledger.balance(), 1003.0);
        assert_eq!(ledger.open_position_count(), 0);
    }

    #[test]
    fn balance_check_comes_first() {
        let mut ledger = CapitalLedger::new(40.0, 50.0, 0);
        assert_eq!(ledger.try_admit(base_time()), Admission::InsufficientBalance);
    }

    #[test]
    fn no_entry_never_occupies_a_slot() {
        let mut ledger = CapitalLedger::new(1000.0, 50.0, 1);
        ledger.record("A", &Outcome::no_entry());
        assert_eq!(ledger.open_position_count(), 0);
        assert_eq!(ledger.try_admit(base_time()), Admission::Admitted);
    }

    #[test]
    fn tracks_drawdown() {
        let mut ledger = CapitalLedger::new(100.0, 10.0, 5);
        ledger.record("A", &outcome(10.0, 1));
        ledger.record("B", &outcome(-22.0, 2));
        ledger.record("C", &outcome(5.0, 3));
        ledger.settle_all();
        assert_eq!(ledger.balance_curve().len(), 3);
        // peak 110, trough 88
        assert!((ledger.max_drawdown_percent() - 20.0).abs() < 1e-9);
    }
}
