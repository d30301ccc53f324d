use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use signal_autotrader::backtesting::{BacktestReport, BacktestRunner, SweepGrid};
use signal_autotrader::config::{sanitize_hours_limit, Config};
use signal_autotrader::exchange::BinanceClient;
use signal_autotrader::signals::load_signals;

#[tokio::main]
async fn main() -> Result<()> {
    let mut cfg = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    // backtest [--sweep] [signals.csv] [hours_limit]
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let sweep = args.iter().any(|a| a == "--sweep");
    args.retain(|a| a != "--sweep");
    let signals_path = PathBuf::from(args.first().map(String::as_str).unwrap_or("signals.csv"));
    if let Some(raw) = args.get(1) {
        cfg.hours_limit = raw
            .parse()
            .ok()
            .and_then(sanitize_hours_limit)
            .with_context(|| format!("hours_limit must be a positive number, got '{}'", raw))?;
    }

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║          SIGNAL AUTOTRADER  BACKTESTER                  ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║  Signals:    {}", signals_path.display());
    println!("║  Window:     {}h", cfg.hours_limit);
    println!("║  Position:   ${:.2} x {}", cfg.position_size_usdt, cfg.backtest_leverage);
    println!("║  Balance:    ${:.2}", cfg.starting_balance);
    println!(
        "║  Ledger:     {} (max {} open)",
        if cfg.ledger_enabled { "on" } else { "off" },
        cfg.max_concurrent_positions
    );
    if sweep {
        let grid = SweepGrid::from_config(&cfg);
        println!(
            "║  Sweep:      TP {}..{} step {} | SL {}..{} step {}",
            grid.tp.start, grid.tp.end, grid.tp.step, grid.sl.start, grid.sl.end, grid.sl.step
        );
    } else {
        println!("║  Ladder:     {}", if cfg.use_ladder { "4-tier" } else { "single target" });
    }
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    let signals = load_signals(&signals_path, cfg.signal_utc_offset_minutes)
        .with_context(|| format!("failed to read {}", signals_path.display()))?;
    if signals.is_empty() {
        println!("ERROR: No usable signals in {}", signals_path.display());
        return Ok(());
    }

    let source = Arc::new(BinanceClient::new(&cfg)?);
    let runner = BacktestRunner::new(&cfg, source);
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let results = cfg.results_path();

    if sweep {
        let report = runner.sweep(signals, &SweepGrid::from_config(&cfg)).await?;
        report.print_summary(20);
        if let Some(best) = report.best() {
            println!(
                "\nBest: TP {:.2}% / SL {:.2}% ({} trades, WR {:.1}%, expectancy ${:+.2})",
                best.tp_percent, best.sl_percent, best.total_trades, best.win_rate, best.expectancy
            );
        }
        let csv_file = results.join(format!("sweep_{}h_{}.csv", cfg.hours_limit, stamp));
        report.save_csv(&csv_file)?;
        println!("\nResults saved to: {}", csv_file.display());
        return Ok(());
    }

    let report = runner.run(signals).await?;

    report.print_summary();

    let csv_file = results.join(format!("backtest_{}h_{}.csv", cfg.hours_limit, stamp));
    report.save_csv(&csv_file)?;
    let summary_file = results.join(format!("backtest_{}h_{}.txt", cfg.hours_limit, stamp));
    save_report_to_file(&report, &summary_file)?;
    println!("\nResults saved to: {}", csv_file.display());
    println!("Summary saved to: {}", summary_file.display());

    Ok(())
}

fn save_report_to_file(report: &BacktestReport, path: &Path) -> Result<()> {
    use std::io::Write;

    let mut f = std::fs::File::create(path)?;

    writeln!(f, "Signal Autotrader Backtest Report ({}h window)", report.hours_limit)?;
    writeln!(f, "================================")?;
    writeln!(f)?;
    writeln!(f, "Balance:")?;
    writeln!(f, "  Starting: ${:.2}", report.starting_balance)?;
    writeln!(f, "  Final:    ${:.2}", report.final_balance)?;
    writeln!(f, "  PnL:      ${:+.2}", report.total_pnl)?;
    writeln!(f, "  Return:   {:+.2}%", report.return_pct())?;
    if report.ledger_enabled {
        writeln!(f, "  Max DD:   {:.1}%", report.max_drawdown_pct)?;
    }
    writeln!(f)?;
    writeln!(f, "Signals:")?;
    writeln!(f, "  Total:    {}", report.total_signals)?;
    writeln!(f, "  Updates:  {}", report.signal_updates)?;
    writeln!(f, "  Filled:   {}", report.filled)?;
    writeln!(f, "  No entry: {}", report.no_entry)?;
    writeln!(f, "  No data:  {}", report.no_data)?;
    writeln!(f, "  Errors:   {}", report.errors)?;
    writeln!(f, "  Invalid:  {}", report.invalid)?;
    writeln!(f, "  Skipped (balance):       {}", report.skipped_insufficient_balance)?;
    writeln!(f, "  Skipped (max positions): {}", report.skipped_max_positions)?;
    writeln!(f)?;
    writeln!(f, "Trades:")?;
    writeln!(f, "  Win/Loss/Expired: {} / {} / {}", report.wins, report.losses, report.expired)?;
    writeln!(f, "  Win Rate:    {:.1}%", report.win_rate)?;
    writeln!(f, "  Avg Win:     ${:+.2}", report.avg_win)?;
    writeln!(f, "  Avg Loss:    ${:+.2}", report.avg_loss)?;
    writeln!(f, "  Expectancy:  ${:+.2}", report.expectancy)?;
    writeln!(f, "  Profit Factor: {:.2}", report.profit_factor)?;
    writeln!(f)?;
    writeln!(f, "By Side:")?;
    for (label, stats) in [("long", &report.long), ("short", &report.short)] {
        writeln!(
            f,
            "  {}: {} trades | WR {:.0}% | PnL ${:+.2}",
            label, stats.trades, stats.win_rate, stats.total_pnl
        )?;
    }

    Ok(())
}
