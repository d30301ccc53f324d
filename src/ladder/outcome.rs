use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal result tag shared by live and backtest drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeResult {
    NoEntry,
    Win,
    Loss,
    Expired,
}

impl TradeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeResult::NoEntry => "no_entry",
            TradeResult::Win => "win",
            TradeResult::Loss => "loss",
            TradeResult::Expired => "expired",
        }
    }
}

impl fmt::Display for TradeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a slice of the position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "tier", rename_all = "snake_case")]
pub enum ExitReason {
    Tier(usize),
    Stop,
    TimeLimit,
    EndOfData,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Tier(i) => write!(f, "TP{}", i + 1),
            ExitReason::Stop => write!(f, "stop"),
            ExitReason::TimeLimit => write!(f, "time_limit"),
            ExitReason::EndOfData => write!(f, "end_of_data"),
        }
    }
}

/// One partial (or final) close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub reason: ExitReason,
    pub time: DateTime<Utc>,
    pub price: f64,
    /// Share of the original position closed by this exit.
    pub fraction: f64,
    pub pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub result: TradeResult,
    pub realized_pnl: f64,
    pub pnl_percent: f64,
    pub entry_time: Option<DateTime<Utc>>,
    pub entry_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub bars_in_trade: usize,
    pub exits: Vec<ExitRecord>,
}

impl Outcome {
    pub fn no_entry() -> Self {
        Self {
            result: TradeResult::NoEntry,
            realized_pnl: 0.0,
            pnl_percent: 0.0,
            entry_time: None,
            entry_price: None,
            exit_time: None,
            exit_price: None,
            bars_in_trade: 0,
            exits: Vec::new(),
        }
    }

    pub fn filled(&self) -> bool {
        self.result != TradeResult::NoEntry
    }

    pub fn is_win(&self) -> bool {
        self.result == TradeResult::Win
    }

    /// Number of take-profit tiers that filled.
    pub fn tiers_hit(&self) -> usize {
        self.exits
            .iter()
            .filter(|e| matches!(e.reason, ExitReason::Tier(_)))
            .count()
    }

    pub fn holding_minutes(&self) -> Option<i64> {
        Some((self.exit_time? - self.entry_time?).num_minutes())
    }
}
