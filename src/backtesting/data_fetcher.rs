use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{Candle, CandleSeries};

/// Bars fetched before the signal time.
pub const LOOKBACK_HOURS: i64 = 1;

const LOCK_POLL: StdDuration = StdDuration::from_millis(50);
const LOCK_STALE_AFTER: StdDuration = StdDuration::from_secs(60);

/// Source of ascending 1-minute OHLCV bars.
#[async_trait]
pub trait HistoricalPriceSource: Send + Sync {
    async fn fetch_minute_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CandleSeries>;
}

/// `[t - 1h, t + hours_after + 1h]` around a signal.
pub fn fetch_window(signal_time: DateTime<Utc>, hours_after: f64) -> (DateTime<Utc>, DateTime<Utc>) {
    let after = Duration::minutes((hours_after * 60.0).ceil() as i64) + Duration::hours(1);
    (signal_time - Duration::hours(LOOKBACK_HOURS), signal_time + after)
}

/// Exclusive lock file next to a cache entry. Removed on drop.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub async fn acquire(path: PathBuf) -> Result<Self> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if started.elapsed() > LOCK_STALE_AFTER {
                        warn!("Removing stale cache lock {}", path.display());
                        std::fs::remove_file(&path).ok();
                        continue;
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release cache lock {}: {}", self.path.display(), e);
        }
    }
}

/// One JSON file of bars per (symbol, signal minute, window length).
#[derive(Debug, Clone)]
pub struct PriceCache {
    dir: PathBuf,
}

impl PriceCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_path(&self, symbol: &str, signal_time: DateTime<Utc>, hours_after: f64) -> PathBuf {
        let (start, end) = fetch_window(signal_time, hours_after);
        self.dir.join(format!(
            "{}_{}_{}m.json",
            symbol,
            signal_time.format("%Y%m%d_%H%M"),
            (end - start).num_minutes()
        ))
    }

    pub fn load(
        &self,
        symbol: &str,
        signal_time: DateTime<Utc>,
        hours_after: f64,
    ) -> Result<Option<CandleSeries>> {
        let path = self.cache_path(symbol, signal_time, hours_after);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let candles: Vec<Candle> = serde_json::from_str(&content)?;
        debug!("Loaded {} cached bars from {}", candles.len(), path.display());
        Ok(Some(CandleSeries::new(candles)))
    }

    pub fn store(
        &self,
        symbol: &str,
        signal_time: DateTime<Utc>,
        hours_after: f64,
        series: &CandleSeries,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.cache_path(symbol, signal_time, hours_after);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(series.as_slice())?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Cached bars for the signal window, fetching and caching on a miss.
    /// The cache entry is locked for the whole call, released on every path.
    pub async fn get_or_fetch(
        &self,
        source: &dyn HistoricalPriceSource,
        symbol: &str,
        signal_time: DateTime<Utc>,
        hours_after: f64,
    ) -> Result<CandleSeries> {
        std::fs::create_dir_all(&self.dir)?;
        let _lock = CacheLock::acquire(
            self.cache_path(symbol, signal_time, hours_after).with_extension("lock"),
        )
        .await?;

        if let Some(series) = self.load(symbol, signal_time, hours_after)? {
            return Ok(series);
        }

        let (start, end) = fetch_window(signal_time, hours_after);
        info!(
            "Fetching {} bars {} -> {}",
            symbol,
            start.format("%Y-%m-%d %H:%M"),
            end.format("%Y-%m-%d %H:%M")
        );
        let series = source.fetch_minute_bars(symbol, start, end).await?;
        if series.is_empty() {
            warn!("No bars returned for {} around {}", symbol, signal_time);
        } else {
            self.store(symbol, signal_time, hours_after, &series)?;
        }
        Ok(series)
    }
}
