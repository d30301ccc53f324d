use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest backtest window accepted, in hours.
pub const MAX_HOURS_LIMIT: f64 = 24.0 * 30.0;

/// Accepts a finite, positive window and caps it at [`MAX_HOURS_LIMIT`].
pub fn sanitize_hours_limit(hours: f64) -> Option<f64> {
    (hours.is_finite() && hours > 0.0).then(|| hours.min(MAX_HOURS_LIMIT))
}

/// How the live entry order is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOrderType {
    Market,
    Limit,
}

impl EntryOrderType {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "limit" => EntryOrderType::Limit,
            _ => EntryOrderType::Market,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Exchange
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub testnet: bool,

    // Live execution
    pub leverage: u32,
    pub trade_amount_usdt: f64,
    pub wait_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub entry_order_type: EntryOrderType,
    pub use_ladder: bool,

    // Backtest
    pub position_size_usdt: f64,
    pub backtest_leverage: f64,
    pub hours_limit: f64,
    pub starting_balance: f64,
    pub max_concurrent_positions: usize,
    pub use_better_price: bool,
    pub ledger_enabled: bool,
    pub default_tp_percent: f64,
    pub default_sl_percent: f64,
    pub fetch_concurrency: usize,

    // TP/SL sweep, percent of entry
    pub sweep_tp_start: f64,
    pub sweep_tp_end: f64,
    pub sweep_tp_step: f64,
    pub sweep_sl_start: f64,
    pub sweep_sl_end: f64,
    pub sweep_sl_step: f64,

    // Signals
    pub signal_utc_offset_minutes: i64,

    // Paths & logging
    pub data_dir: String,
    pub results_dir: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let flag = |key: &str, default: &str| -> bool {
            matches!(
                env(key, default).trim().to_lowercase().as_str(),
                "true" | "1" | "yes"
            )
        };

        Config {
            binance_api_key: env("BINANCE_API_KEY", ""),
            binance_api_secret: env("BINANCE_API_SECRET", ""),
            testnet: flag("BINANCE_TESTNET", "true"),
            leverage: env("LEVERAGE", "10").parse().unwrap_or(10),
            trade_amount_usdt: env("TRADE_AMOUNT_USDT", "10").parse().unwrap_or(10.0),
            wait_timeout_secs: env("WAIT_TIMEOUT_SECS", "300").parse().unwrap_or(300),
            poll_interval_secs: env("POLL_INTERVAL_SECS", "10").parse().unwrap_or(10),
            entry_order_type: EntryOrderType::parse(&env("ENTRY_ORDER_TYPE", "market")),
            use_ladder: flag("USE_LADDER", "true"),
            position_size_usdt: env("POSITION_SIZE_USDT", "50").parse().unwrap_or(50.0),
            backtest_leverage: env("BACKTEST_LEVERAGE", "1").parse().unwrap_or(1.0),
            hours_limit: env("HOURS_LIMIT", "12")
                .parse()
                .ok()
                .and_then(sanitize_hours_limit)
                .unwrap_or(12.0),
            starting_balance: env("STARTING_BALANCE", "1000").parse().unwrap_or(1000.0),
            max_concurrent_positions: env("MAX_CONCURRENT_POSITIONS", "5")
                .parse()
                .unwrap_or(5),
            use_better_price: flag("USE_BETTER_PRICE", "false"),
            ledger_enabled: flag("LEDGER_ENABLED", "true"),
            default_tp_percent: env("DEFAULT_TP_PERCENT", "2.0").parse().unwrap_or(2.0),
            default_sl_percent: env("DEFAULT_SL_PERCENT", "5.0").parse().unwrap_or(5.0),
            fetch_concurrency: env("FETCH_CONCURRENCY", "4").parse().unwrap_or(4).max(1),
            sweep_tp_start: env("SWEEP_TP_START", "0.1").parse().unwrap_or(0.1),
            sweep_tp_end: env("SWEEP_TP_END", "5.0").parse().unwrap_or(5.0),
            sweep_tp_step: env("SWEEP_TP_STEP", "0.1").parse().unwrap_or(0.1),
            sweep_sl_start: env("SWEEP_SL_START", "0.1").parse().unwrap_or(0.1),
            sweep_sl_end: env("SWEEP_SL_END", "5.0").parse().unwrap_or(5.0),
            sweep_sl_step: env("SWEEP_SL_STEP", "0.1").parse().unwrap_or(0.1),
            signal_utc_offset_minutes: env("SIGNAL_UTC_OFFSET_MINUTES", "0")
                .parse()
                .unwrap_or(0),
            data_dir: env("DATA_DIR", "price_data"),
            results_dir: env("RESULTS_DIR", "backtest_results"),
            log_level: env("LOG_LEVEL", "info"),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn results_path(&self) -> PathBuf {
        PathBuf::from(&self.results_dir)
    }

    pub fn base_url(&self) -> &'static str {
        if self.testnet {
            crate::exchange::binance::TESTNET_URL
        } else {
            crate::exchange::binance::LIVE_URL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_order_type_defaults_to_market() {
        assert_eq!(EntryOrderType::parse("LIMIT"), EntryOrderType::Limit);
        assert_eq!(EntryOrderType::parse("market"), EntryOrderType::Market);
        assert_eq!(EntryOrderType::parse("whatever"), EntryOrderType::Market);
    }

    #[test]
    fn hours_limit_must_be_positive_and_is_capped() {
        assert_eq!(sanitize_hours_limit(12.0), Some(12.0));
        assert_eq!(sanitize_hours_limit(0.0), None);
        assert_eq!(sanitize_hours_limit(-4.0), None);
        assert_eq!(sanitize_hours_limit(f64::NAN), None);
        assert_eq!(sanitize_hours_limit(f64::INFINITY), None);
        assert_eq!(sanitize_hours_limit(1e12), Some(MAX_HOURS_LIMIT));
    }

    #[test]
    fn test_config_durations() {
        let cfg = crate::test_helpers::default_test_config();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.wait_timeout(), Duration::from_secs(300));
    }
}
