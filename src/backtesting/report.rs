use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::backtesting::ledger::{BalancePoint, CapitalLedger};
use crate::backtesting::runner::{RunSettings, SignalRecord, SignalStatus};
use crate::error::{Error, Result};
use crate::ladder::TradeResult;
use crate::models::Side;

/// Win/loss tallies over a subset of filled trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakdownStats {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub expired: usize,
    pub total_pnl: f64,
    pub win_rate: f64,
}

impl BreakdownStats {
    fn collect<'a>(trades: impl Iterator<Item = &'a SignalRecord>) -> Self {
        let mut stats = BreakdownStats::default();
        for rec in trades {
            let Some(outcome) = &rec.outcome else {
                continue;
            };
            stats.trades += 1;
            stats.total_pnl += outcome.realized_pnl;
            match outcome.result {
                TradeResult::Win => stats.wins += 1,
                TradeResult::Loss => stats.losses += 1,
                TradeResult::Expired => stats.expired += 1,
                TradeResult::NoEntry => {}
            }
        }
        stats.win_rate = percent(stats.wins, stats.trades);
        stats
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub hours_limit: f64,
    pub ledger_enabled: bool,

    // Signals
    pub total_signals: usize,
    /// A signal for a symbol that already had one within `hours_limit`.
    pub signal_updates: usize,
    pub filled: usize,
    pub no_entry: usize,
    pub no_data: usize,
    pub errors: usize,
    pub invalid: usize,
    pub skipped_insufficient_balance: usize,
    pub skipped_max_positions: usize,

    // Trades
    pub wins: usize,
    pub losses: usize,
    pub expired: usize,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    pub profit_factor: f64,

    pub long: BreakdownStats,
    pub short: BreakdownStats,
    pub from_signal_levels: BreakdownStats,
    pub from_default_levels: BreakdownStats,

    // Balance
    pub starting_balance: f64,
    pub final_balance: f64,
    pub max_drawdown_pct: f64,
    pub balance_curve: Vec<BalancePoint>,

    pub records: Vec<SignalRecord>,
}

pub(crate) fn percent(part: usize, whole: usize) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64 * 100.0
    } else {
        0.0
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Signals for a symbol seen again within `hours` of its previous signal.
pub fn count_signal_updates(records: &[SignalRecord], hours: f64) -> usize {
    let mut times: Vec<(&str, DateTime<Utc>)> = records
        .iter()
        .map(|r| (r.symbol.as_str(), r.signal_time))
        .collect();
    times.sort_by_key(|(_, t)| *t);

    let window_ms = (hours * 3_600_000.0) as i64;
    let mut last_seen: HashMap<&str, DateTime<Utc>> = HashMap::new();
    let mut updates = 0;
    for (symbol, time) in times {
        if let Some(prev) = last_seen.insert(symbol, time) {
            if (time - prev).num_milliseconds() <= window_ms {
                updates += 1;
            }
        }
    }
    updates
}

impl BacktestReport {
    pub fn from_records(
        mut records: Vec<SignalRecord>,
        settings: &RunSettings,
        ledger: Option<&CapitalLedger>,
    ) -> Self {
        records.sort_by_key(|r| r.index);
        let count = |status: SignalStatus| records.iter().filter(|r| r.status == status).count();

        let traded: Vec<&SignalRecord> = records.iter().filter(|r| r.traded()).collect();
        let pnl_of = |result: TradeResult| -> Vec<f64> {
            traded
                .iter()
                .filter_map(|r| r.outcome.as_ref())
                .filter(|o| o.result == result)
                .map(|o| o.realized_pnl)
                .collect()
        };
        let win_pnls = pnl_of(TradeResult::Win);
        let loss_pnls = pnl_of(TradeResult::Loss);
        let expired = pnl_of(TradeResult::Expired).len();

        let filled = traded.len();
        let total_pnl: f64 = traded
            .iter()
            .filter_map(|r| r.outcome.as_ref())
            .map(|o| o.realized_pnl)
            .sum();
        let avg_win = mean(&win_pnls);
        let avg_loss = mean(&loss_pnls);
        let (win_frac, loss_frac) = if filled > 0 {
            (
                win_pnls.len() as f64 / filled as f64,
                loss_pnls.len() as f64 / filled as f64,
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

        let no_entry = records
            .iter()
            .filter(|r| r.status == SignalStatus::Completed && !r.traded())
            .count();

        let (final_balance, max_drawdown_pct, balance_curve) = match ledger {
            Some(l) => (l.balance(), l.max_drawdown_percent(), l.balance_curve().to_vec()),
            None => (settings.starting_balance + total_pnl, 0.0, Vec::new()),
        };

        BacktestReport {
            hours_limit: settings.hours_limit(),
            ledger_enabled: ledger.is_some(),
            total_signals: records.len(),
            signal_updates: count_signal_updates(&records, settings.hours_limit()),
            filled,
            no_entry,
            no_data: count(SignalStatus::NoData),
            errors: count(SignalStatus::Error),
            invalid: count(SignalStatus::Invalid),
            skipped_insufficient_balance: count(SignalStatus::InsufficientBalance),
            skipped_max_positions: count(SignalStatus::MaxPositionsReached),
            wins: win_pnls.len(),
            losses: loss_pnls.len(),
            expired,
            total_pnl,
            win_rate: percent(win_pnls.len(), filled),
            avg_win,
            avg_loss,
            expectancy: win_frac * avg_win - loss_frac * avg_loss.abs(),
            profit_factor,
            long: BreakdownStats::collect(traded.iter().copied().filter(|r| r.side == Side::Long)),
            short: BreakdownStats::collect(traded.iter().copied().filter(|r| r.side == Side::Short)),
            from_signal_levels: BreakdownStats::collect(traded.iter().copied().filter(|r| !r.used_defaults)),
            from_default_levels: BreakdownStats::collect(traded.iter().copied().filter(|r| r.used_defaults)),
            starting_balance: settings.starting_balance,
            final_balance,
            max_drawdown_pct,
            balance_curve,
            records,
        }
    }

    pub fn return_pct(&self) -> f64 {
        if self.starting_balance > 0.0 {
            (self.final_balance - self.starting_balance) / self.starting_balance * 100.0
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(70));
        println!("  BACKTEST REPORT ({}h window)", self.hours_limit);
        println!("{}", "=".repeat(70));
        println!();
        println!("  BALANCE");
        println!("  ───────────────────────────────────");
        println!("  Starting:    ${:.2}", self.starting_balance);
        println!("  Final:       ${:.2}", self.final_balance);
        println!("  PnL:         ${:+.2}", self.total_pnl);
        println!("  Return:      {:+.2}%", self.return_pct());
        if self.ledger_enabled {
            println!("  Max DD:      {:.1}%", self.max_drawdown_pct);
        }
        println!();
        println!("  SIGNALS");
        println!("  ───────────────────────────────────");
        println!("  Total:       {}", self.total_signals);
        println!("  Updates:     {} (within {}h)", self.signal_updates, self.hours_limit);
        println!(
            "  Filled:      {} ({:.1}%)",
            self.filled,
            percent(self.filled, self.total_signals)
        );
        println!("  No entry:    {}", self.no_entry);
        println!("  No data:     {}", self.no_data);
        if self.errors > 0 {
            println!("  Errors:      {}", self.errors);
        }
        if self.invalid > 0 {
            println!("  Invalid:     {}", self.invalid);
        }
        if self.skipped_insufficient_balance > 0 {
            println!("  Skipped (balance):   {}", self.skipped_insufficient_balance);
        }
        if self.skipped_max_positions > 0 {
            println!("  Skipped (max positions): {}", self.skipped_max_positions);
        }
        println!();
        println!("  TRADES");
        println!("  ───────────────────────────────────");
        println!(
            "  Win/Loss/Expired: {} / {} / {}",
            self.wins, self.losses, self.expired
        );
        println!("  Win Rate:    {:.1}%", self.win_rate);
        println!("  Avg Win:     ${:+.2}", self.avg_win);
        println!("  Avg Loss:    ${:+.2}", self.avg_loss);
        println!("  Expectancy:  ${:+.2} per trade", self.expectancy);
        println!("  Profit Factor: {:.2}", self.profit_factor);

        println!();
        println!("  BY SIDE");
        println!("  ───────────────────────────────────");
        print_breakdown("long", &self.long);
        print_breakdown("short", &self.short);

        if self.from_default_levels.trades > 0 {
            println!();
            println!("  BY LEVEL SOURCE");
            println!("  ───────────────────────────────────");
            print_breakdown("signal", &self.from_signal_levels);
            print_breakdown("defaults", &self.from_default_levels);
        }

        println!("{}", "=".repeat(70));
    }

    /// One row per signal.
    pub fn to_csv(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record([
            "index",
            "symbol",
            "side",
            "signal_time",
            "entry",
            "status",
            "result",
            "entry_time",
            "entry_price",
            "exit_time",
            "exit_price",
            "pnl",
            "pnl_percent",
            "tiers_hit",
            "bars_in_trade",
            "used_defaults",
            "balance_at_signal",
            "error",
        ])?;

        let opt_time = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        let opt_num = |v: Option<f64>| v.map(|v| format!("{:.6}", v)).unwrap_or_default();

        for r in &self.records {
            let o = r.outcome.as_ref();
            let row: Vec<String> = vec![
                r.index.to_string(),
                r.symbol.clone(),
                r.side.to_string(),
                r.signal_time.to_rfc3339(),
                format!("{:.6}", r.entry),
                r.status.to_string(),
                o.map(|o| o.result.to_string()).unwrap_or_default(),
                opt_time(o.and_then(|o| o.entry_time)),
                opt_num(o.and_then(|o| o.entry_price)),
                opt_time(o.and_then(|o| o.exit_time)),
                opt_num(o.and_then(|o| o.exit_price)),
                o.map(|o| format!("{:.4}", o.realized_pnl)).unwrap_or_default(),
                o.map(|o| format!("{:.2}", o.pnl_percent)).unwrap_or_default(),
                o.map(|o| o.tiers_hit().to_string()).unwrap_or_default(),
                o.map(|o| o.bars_in_trade.to_string()).unwrap_or_default(),
                r.used_defaults.to_string(),
                r.balance_at_signal.map(|b| format!("{:.2}", b)).unwrap_or_default(),
                r.error.clone().unwrap_or_default(),
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

fn print_breakdown(label: &str, stats: &BreakdownStats) {
    println!(
        "  {:>8}: {} trades | W {} L {} E {} | WR {:.0}% | PnL ${:+.2}",
        label, stats.trades, stats.wins, stats.losses, stats.expired, stats.win_rate, stats.total_pnl
    );
}
