use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One 1-minute OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Ascending run of bars for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// Sorts by timestamp and drops duplicate timestamps, keeping the first.
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    /// Index of the first bar with timestamp >= `ts`.
    pub fn index_at_or_after(&self, ts: DateTime<Utc>) -> Option<usize> {
        let idx = self.candles.partition_point(|c| c.timestamp < ts);
        (idx < self.candles.len()).then_some(idx)
    }
}

impl std::ops::Index<usize> for CandleSeries {
    type Output = Candle;
    fn index(&self, index: usize) -> &Self::Output {
        &self.candles[index]
    }
}
