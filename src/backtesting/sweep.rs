//! TP/SL percentage grid search. Every signal is replayed once per pair with
//! its own levels replaced by a single target and stop at fixed percentages
//! from entry, and the pairs are ranked by a blended score.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::backtesting::report::{mean, percent};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ladder::{LadderPlan, Outcome, TradeResult};
use crate::signals::signal::default_levels;
use crate::signals::{Signal, SignalInput};

/// A pair needs this many trades to be ranked by score.
pub const MIN_TRADES: usize = 10;
pub const MIN_WIN_RATE: f64 = 40.0;
const MAX_RANGE_VALUES: usize = 1_000;

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Percentages from `start` to `end` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl SweepRange {
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        Self { start, end, step }
    }

    /// Values rounded to 2 decimals. Empty for a malformed range.
    pub fn values(&self) -> Vec<f64> {
        let valid = [self.start, self.end, self.step].iter().all(|v| v.is_finite())
            && self.start > 0.0
            && self.step > 0.0
            && self.end >= self.start;
        if !valid {
            return Vec::new();
        }
        let steps = ((self.end - self.start) / self.step + 1e-9).floor() as usize;
        if steps >= MAX_RANGE_VALUES {
            return Vec::new();
        }
        (0..=steps)
            .map(|i| round2(self.start + i as f64 * self.step))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepGrid {
    pub tp: SweepRange,
    pub sl: SweepRange,
}

impl SweepGrid {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tp: SweepRange::new(cfg.sweep_tp_start, cfg.sweep_tp_end, cfg.sweep_tp_step),
            sl: SweepRange::new(cfg.sweep_sl_start, cfg.sweep_sl_end, cfg.sweep_sl_step),
        }
    }

    /// Every (tp, sl) pair, TP-major.
    pub fn combinations(&self) -> Vec<(f64, f64)> {
        let sls = self.sl.values();
        self.tp
            .values()
            .into_iter()
            .flat_map(|tp| sls.iter().map(move |&sl| (tp, sl)))
            .collect()
    }
}

/// The signal with its levels replaced: one target `tp_percent` from entry,
/// stop `sl_percent` from entry. Whatever levels the input carried are ignored.
pub fn forced_signal(
    input: &SignalInput,
    tp_percent: f64,
    sl_percent: f64,
) -> Result<(Signal, LadderPlan)> {
    let (tp, sl) = default_levels(input.side, input.entry, tp_percent, sl_percent);
    let signal = Signal::new(&input.symbol, input.side, input.entry, sl, vec![tp], input.timestamp)?;
    Ok((signal, LadderPlan::single(tp)))
}

/// Stats for one TP/SL pair over trades whose entry filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComboResult {
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub hours_window: f64,
    pub total_signals: usize,
    pub total_trades: usize,
    /// Filled entries as a percent of signals.
    pub entry_hit_rate: f64,
    pub wins: usize,
    pub losses: usize,
    pub expired: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    pub expired_pnl: f64,
    pub profit_factor: f64,
}

impl ComboResult {
    pub fn from_outcomes(
        tp_percent: f64,
        sl_percent: f64,
        hours_window: f64,
        total_signals: usize,
        outcomes: &[Outcome],
    ) -> Self {
        let traded: Vec<&Outcome> = outcomes.iter().filter(|o| o.filled()).collect();
        let pnl_of = |result: TradeResult| -> Vec<f64> {
            traded
                .iter()
                .filter(|o| o.result == result)
                .map(|o| o.realized_pnl)
                .collect()
        };
        let win_pnls = pnl_of(TradeResult::Win);
        let loss_pnls = pnl_of(TradeResult::Loss);
        let expired_pnls = pnl_of(TradeResult::Expired);

        let total_trades = traded.len();
        let total_pnl: f64 = traded.iter().map(|o| o.realized_pnl).sum();
        let avg_win = mean(&win_pnls);
        let avg_loss = mean(&loss_pnls);
        let (win_frac, loss_frac) = if total_trades > 0 {
            (
                win_pnls.len() as f64 / total_trades as f64,
                loss_pnls.len() as f64 / total_trades as f64,
            )
        } else {
            (0.0, 0.0)
        };
        let gross_loss: f64 = loss_pnls.iter().sum();
        let profit_factor = if gross_loss != 0.0 {
            (win_pnls.iter().sum::<f64>() / gross_loss).abs()
        } else {
            0.0
        };

        Self {
            tp_percent,
            sl_percent,
            hours_window,
            total_signals,
            total_trades,
            entry_hit_rate: percent(total_trades, total_signals),
            wins: win_pnls.len(),
            losses: loss_pnls.len(),
            expired: expired_pnls.len(),
            win_rate: percent(win_pnls.len(), total_trades),
            total_pnl,
            avg_pnl: if total_trades > 0 { total_pnl / total_trades as f64 } else { 0.0 },
            avg_win,
            avg_loss,
            expectancy: win_frac * avg_win + loss_frac * avg_loss,
            expired_pnl: expired_pnls.iter().sum(),
            profit_factor,
        }
    }

    pub fn expired_rate(&self) -> f64 {
        percent(self.expired, self.total_trades)
    }

    /// Expectancy 40%, win rate 30%, total pnl 20%, minus 10% of the expiry rate.
    pub fn score(&self) -> f64 {
        self.expectancy * 0.4 + self.win_rate * 0.3 + self.total_pnl * 0.2
            - self.expired_rate() * 0.1
    }

    pub fn qualifies(&self) -> bool {
        self.total_trades >= MIN_TRADES && self.win_rate >= MIN_WIN_RATE && self.expectancy > 0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub hours_window: f64,
    pub total_signals: usize,
    /// One per pair, in grid order.
    pub results: Vec<ComboResult>,
}

impl SweepReport {
    pub fn new(hours_window: f64, total_signals: usize, results: Vec<ComboResult>) -> Self {
        Self {
            hours_window,
            total_signals,
            results,
        }
    }

    /// Qualifying pairs by score. When none qualify, every pair by expectancy.
    pub fn ranked(&self) -> Vec<&ComboResult> {
        let mut ranked: Vec<&ComboResult> = self.results.iter().filter(|r| r.qualifies()).collect();
        if ranked.is_empty() {
            ranked = self.results.iter().collect();
            ranked.sort_by(|a, b| b.expectancy.total_cmp(&a.expectancy));
        } else {
            ranked.sort_by(|a, b| b.score().total_cmp(&a.score()));
        }
        ranked
    }

    pub fn best(&self) -> Option<&ComboResult> {
        self.ranked().into_iter().next()
    }

    pub fn print_summary(&self, top: usize) {
        let ranked = self.ranked();
        let qualified = self.results.iter().filter(|r| r.qualifies()).count();

        println!("\n{}", "=".repeat(70));
        println!("  TP/SL SWEEP ({}h window)", self.hours_window);
        println!("{}", "=".repeat(70));
        println!();
        println!("  Signals:     {}", self.total_signals);
        println!("  Pairs:       {}", self.results.len());
        if qualified > 0 {
            println!(
                "  Qualified:   {} (>= {} trades, >= {:.0}% WR, expectancy > 0)",
                qualified, MIN_TRADES, MIN_WIN_RATE
            );
        } else {
            println!("  Qualified:   none, ranking by expectancy");
        }
        println!();
        println!("  TOP {}", top.min(ranked.len()));
        println!("  ───────────────────────────────────");
        for (i, r) in ranked.iter().take(top).enumerate() {
            println!(
                "  {:>2}. TP {:>4.2}% SL {:>4.2}% | {} trades | W {} L {} E {} | WR {:.1}% | Exp ${:+.2} | PnL ${:+.2} | score {:.2}",
                i + 1,
                r.tp_percent,
                r.sl_percent,
                r.total_trades,
                r.wins,
                r.losses,
                r.expired,
                r.win_rate,
                r.expectancy,
                r.total_pnl,
                r.score()
            );
        }
        println!("{}", "=".repeat(70));
    }

    /// One row per pair, in grid order.
    pub fn to_csv(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record([
            "tp_percent",
            "sl_percent",
            "hours_window",
            "total_signals",
            "total_trades",
            "entry_hit_rate",
            "wins",
            "losses",
            "expired",
            "win_rate",
            "total_pnl",
            "avg_pnl",
            "avg_win",
            "avg_loss",
            "expectancy",
            "expired_pnl",
            "profit_factor",
            "score",
        ])?;

        for r in &self.results {
            let row: Vec<String> = vec![
                format!("{:.2}", r.tp_percent),
                format!("{:.2}", r.sl_percent),
                r.hours_window.to_string(),
                r.total_signals.to_string(),
                r.total_trades.to_string(),
                format!("{:.2}", r.entry_hit_rate),
                r.wins.to_string(),
                r.losses.to_string(),
                r.expired.to_string(),
                format!("{:.2}", r.win_rate),
                format!("{:.4}", r.total_pnl),
                format!("{:.4}", r.avg_pnl),
                format!("{:.4}", r.avg_win),
                format!("{:.4}", r.avg_loss),
                format!("{:.4}", r.expectancy),
                format!("{:.4}", r.expired_pnl),
                format!("{:.4}", r.profit_factor),
                format!("{:.4}", r.score()),
            ];
            wtr.write_record(&row)?;
        }

        let data = wtr.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        String::from_utf8(data).map_err(|e| Error::Config(format!("CSV output is not UTF-8: {}", e)))
    }

    pub fn save_csv(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_csv()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use crate::test_helpers::{base_time, default_test_config};

    fn outcome(result: TradeResult, pnl: f64) -> Outcome {
        Outcome {
            result,
            realized_pnl: pnl,
            pnl_percent: pnl / 50.0 * 100.0,
            entry_time: Some(base_time()),
            entry_price: Some(100.0),
            exit_time: Some(base_time()),
            exit_price: Some(100.0),
            bars_in_trade: 1,
            exits: vec![],
        }
    }

    fn combo(tp: f64, trades: &[(TradeResult, f64)]) -> ComboResult {
        let outcomes: Vec<Outcome> = trades.iter().map(|&(r, p)| outcome(r, p)).collect();
        ComboResult::from_outcomes(tp, 1.0, 12.0, trades.len(), &outcomes)
    }

    #[test]
    fn range_includes_end() {
        let values = SweepRange::new(0.1, 0.5, 0.1).values();
        assert_eq!(values, vec![0.1, 0.2, 0.3, 0.4, 0.5]);
    }

    #[test]
    fn malformed_range_is_empty() {
        assert!(SweepRange::new(0.5, 0.1, 0.1).values().is_empty());
        assert!(SweepRange::new(0.1, 0.5, 0.0).values().is_empty());
        assert!(SweepRange::new(0.0, 0.5, 0.1).values().is_empty());
        assert!(SweepRange::new(0.1, f64::NAN, 0.1).values().is_empty());
        assert!(SweepRange::new(0.1, 5.0, 1e-6).values().is_empty());
    }

    #[test]
    fn default_grid_is_fifty_by_fifty() {
        let grid = SweepGrid::from_config(&default_test_config());
        let combos = grid.combinations();
        assert_eq!(combos.len(), 2500);
        assert_eq!(combos[0], (0.1, 0.1));
        assert_eq!(combos[1], (0.1, 0.2));
        assert_eq!(combos[2499], (5.0, 5.0));
    }

    #[test]
    fn forced_levels_ignore_signal_levels() {
        let input = SignalInput {
            symbol: "btc/usdt".to_string(),
            side: Side::Short,
            entry: 200.0,
            stop_loss: None,
            take_profits: vec![250.0],
            timestamp: base_time(),
        };
        let (signal, plan) = forced_signal(&input, 1.5, 2.0).unwrap();
        assert!((signal.take_profits()[0] - 197.0).abs() < 1e-9);
        assert!((signal.stop_loss() - 204.0).abs() < 1e-9);
        assert_eq!(plan.tiers().len(), 1);
        assert!((plan.tiers()[0].price - 197.0).abs() < 1e-9);
    }

    #[test]
    fn stats_skip_unfilled_signals() {
        let r = combo(
            1.0,
            &[
                (TradeResult::Win, 2.0),
                (TradeResult::Win, 4.0),
                (TradeResult::Loss, -3.0),
                (TradeResult::Expired, 1.0),
                (TradeResult::NoEntry, 0.0),
            ],
        );
        assert_eq!(r.total_signals, 5);
        assert_eq!(r.total_trades, 4);
        assert!((r.entry_hit_rate - 80.0).abs() < 1e-9);
        assert!((r.expired_pnl - 1.0).abs() < 1e-9);
        assert_eq!((r.wins, r.losses, r.expired), (2, 1, 1));
        assert!((r.win_rate - 50.0).abs() < 1e-9);
        assert!((r.total_pnl - 4.0).abs() < 1e-9);
        assert!((r.avg_pnl - 1.0).abs() < 1e-9);
        // 0.5 * 3 + 0.25 * -3
        assert!((r.expectancy - 0.75).abs() < 1e-9);
        assert!((r.profit_factor - 2.0).abs() < 1e-9);
        // 0.3 + 15 + 0.8 - 2.5
        assert!((r.score() - 13.6).abs() < 1e-9);
    }

    #[test]
    fn ranks_qualifying_pairs_by_score() {
        let mut steady = vec![(TradeResult::Win, 1.0); 6];
        steady.extend(vec![(TradeResult::Loss, -0.5); 4]);
        let mut sharp = vec![(TradeResult::Win, 3.0); 5];
        sharp.extend(vec![(TradeResult::Loss, -1.0); 5]);
        // Too few trades to qualify despite the best expectancy.
        let thin = vec![(TradeResult::Win, 10.0); 3];

        let report = SweepReport::new(
            12.0,
            10,
            vec![combo(0.5, &steady), combo(2.0, &sharp), combo(4.0, &thin)],
        );
        let ranked: Vec<f64> = report.ranked().iter().map(|r| r.tp_percent).collect();
        // steady: 0.16 + 18 + 0.8 = 18.96, sharp: 0.4 + 15 + 2 = 17.4
        assert_eq!(ranked, vec![0.5, 2.0]);
        assert_eq!(report.best().map(|r| r.tp_percent), Some(0.5));
    }

    #[test]
    fn falls_back_to_expectancy_when_nothing_qualifies() {
        let report = SweepReport::new(
            12.0,
            3,
            vec![
                combo(0.5, &[(TradeResult::Win, 1.0), (TradeResult::Loss, -2.0)]),
                combo(1.0, &[(TradeResult::Win, 2.0)]),
                combo(2.0, &[(TradeResult::Expired, 5.0)]),
            ],
        );
        let ranked: Vec<f64> = report.ranked().iter().map(|r| r.tp_percent).collect();
        assert_eq!(ranked, vec![1.0, 2.0, 0.5]);
    }

    #[test]
    fn csv_has_a_row_per_pair() {
        let report = SweepReport::new(
            12.0,
            1,
            vec![combo(0.5, &[(TradeResult::Win, 1.0)]), combo(1.0, &[])],
        );
        let csv = report.to_csv().unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("tp_percent,sl_percent,hours_window"));
        assert!(lines[1].starts_with("0.50,1.00,12,"));
    }
}
