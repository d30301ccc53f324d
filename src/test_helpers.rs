use chrono::{DateTime, Duration, Utc};

use crate::config::{Config, EntryOrderType};
use crate::models::{Candle, CandleSeries, Side};
use crate::signals::Signal;

/// 2024-01-15T12:00:00Z, the start of every generated series.
pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Create candles from (open, high, low, close) tuples with auto-incrementing 1m timestamps.
pub fn make_candles(data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    make_candles_from(base_time(), data)
}

pub fn make_candles_from(start: DateTime<Utc>, data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let candles: Vec<Candle> = data
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Candle {
            timestamp: start + Duration::minutes(i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        })
        .collect();

    CandleSeries::new(candles)
}

/// n flat bars around `price` that touch neither a 5% stop nor a 1% target.
pub fn make_flat(n: usize, price: f64) -> Vec<(f64, f64, f64, f64)> {
    (0..n)
        .map(|_| (price, price * 1.001, price * 0.999, price))
        .collect()
}

pub fn make_signal(side: Side, entry: f64, stop: f64, tps: &[f64]) -> Signal {
    make_signal_at(side, entry, stop, tps, base_time())
}

pub fn make_signal_at(
    side: Side,
    entry: f64,
    stop: f64,
    tps: &[f64],
    at: DateTime<Utc>,
) -> Signal {
    Signal::new("BTCUSDT", side, entry, stop, tps.to_vec(), at).unwrap()
}

/// A Config suitable for testing: testnet, no API keys, temp data dirs.
pub fn default_test_config() -> Config {
    let tmp = std::env::temp_dir().join("signal_autotrader_test");
    Config {
        binance_api_key: String::new(),
        binance_api_secret: String::new(),
        testnet: true,
        leverage: 10,
        trade_amount_usdt: 10.0,
        wait_timeout_secs: 300,
        poll_interval_secs: 10,
        entry_order_type: EntryOrderType::Market,
        use_ladder: true,
        position_size_usdt: 50.0,
        backtest_leverage: 1.0,
        hours_limit: 12.0,
        starting_balance: 1000.0,
        max_concurrent_positions: 5,
        use_better_price: false,
        ledger_enabled: true,
        default_tp_percent: 2.0,
        default_sl_percent: 5.0,
        fetch_concurrency: 2,
        sweep_tp_start: 0.1,
        sweep_tp_end: 5.0,
        sweep_tp_step: 0.1,
        sweep_sl_start: 0.1,
        sweep_sl_end: 5.0,
        sweep_sl_step: 0.1,
        signal_utc_offset_minutes: 0,
        data_dir: tmp.join("price_data").to_string_lossy().to_string(),
        results_dir: tmp.join("results").to_string_lossy().to_string(),
        log_level: "error".to_string(),
    }
}
