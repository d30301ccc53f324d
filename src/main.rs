use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use signal_autotrader::config::Config;
use signal_autotrader::exchange::{BinanceClient, Broker};
use signal_autotrader::models::Side;
use signal_autotrader::signals::{load_signals, SignalInput};
use signal_autotrader::trading::{ExecutionOutcome, ExecutorSettings, MonitorRegistry, TradeExecutor};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

const USAGE: &str = "usage: signal-autotrader SYMBOL long|short ENTRY STOP TP1 [TP2 TP3 TP4]\n       signal-autotrader --csv signals.csv";

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let inputs = parse_args(&args, &cfg)?;

    info!("{}", "=".repeat(60));
    info!("Signal autotrader starting up");
    info!("Mode: {}", if cfg.testnet { "TESTNET" } else { "LIVE TRADING" });
    info!(
        "Margin ${:.2} x {} | entry {:?} | ladder {}",
        cfg.trade_amount_usdt, cfg.leverage, cfg.entry_order_type, cfg.use_ladder
    );
    info!("{}", "=".repeat(60));

    let broker: Arc<dyn Broker> = Arc::new(BinanceClient::new(&cfg)?);
    let registry = MonitorRegistry::new();
    let executor = TradeExecutor::new(broker, registry.clone(), ExecutorSettings::from_config(&cfg));

    let mut handles = Vec::new();
    for input in inputs {
        let signal = match input.validate() {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Skipping signal: {}", e);
                continue;
            }
        };
        match executor.execute(&signal).await {
            Ok(ExecutionOutcome::Monitoring(handle)) => handles.push(handle),
            Ok(ExecutionOutcome::EntryNotFilled { symbol, order }) => {
                info!("{}: entry {} not filled, nothing to monitor", symbol, order)
            }
            Err(e) => error!("{}: {}", signal.symbol(), e),
        }
    }

    if handles.is_empty() {
        info!("No open positions to monitor");
        return Ok(());
    }

    info!("Monitoring {} position(s). Press Ctrl+C to stop.", handles.len());
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_status(&registry).await;
                registry.stop_all().await;
                break;
            }
            _ = status.tick() => {
                if registry.is_empty().await {
                    break;
                }
                print_status(&registry).await;
            }
        }
    }

    for handle in handles {
        match handle.task.await {
            Ok(exit) => {
                let pnl = exit
                    .outcome
                    .as_ref()
                    .map(|o| format!("{} {:+.4}", o.result, o.realized_pnl))
                    .unwrap_or_else(|| "open".to_string());
                info!(
                    "{}: {} | {} TP(s) filled | {}",
                    exit.symbol, exit.reason, exit.filled_tp_count, pnl
                );
                for w in &exit.warnings {
                    warn!("{}: {}", exit.symbol, w);
                }
            }
            Err(e) => error!("{}: monitor task failed: {}", handle.symbol, e),
        }
    }

    Ok(())
}

async fn print_status(registry: &MonitorRegistry) {
    let rows = registry.snapshot().await;
    info!("--- {} active monitor(s) ---", rows.len());
    for row in rows {
        info!(
            "  #{} {} | stop {} ({}) | TPs {}/{} | {}s",
            row.id,
            row.symbol,
            row.stop_order_id,
            row.stop_status,
            row.filled_tp_count,
            row.tp_order_ids.len(),
            row.runtime_seconds
        );
    }
}

fn parse_args(args: &[String], cfg: &Config) -> Result<Vec<SignalInput>> {
    match args {
        [flag, path] if flag == "--csv" => {
            load_signals(Path::new(path), cfg.signal_utc_offset_minutes)
                .with_context(|| format!("failed to read {}", path))
        }
        [symbol, side, entry, stop, tps @ ..] if !tps.is_empty() => {
            let side: Side = side.parse().map_err(anyhow::Error::msg)?;
            let take_profits = tps
                .iter()
                .map(|tp| tp.parse::<f64>().with_context(|| format!("bad take profit '{}'", tp)))
                .collect::<Result<Vec<_>>>()?;
            Ok(vec![SignalInput {
                symbol: symbol.clone(),
                side,
                entry: entry.parse().with_context(|| format!("bad entry '{}'", entry))?,
                stop_loss: Some(stop.parse().with_context(|| format!("bad stop '{}'", stop))?),
                take_profits,
                timestamp: Utc::now(),
            }])
        }
        _ => bail!(USAGE),
    }
}
