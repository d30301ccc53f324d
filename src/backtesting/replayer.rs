use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ladder::{ExitLadder, LadderParams, LadderPlan, Outcome};
use crate::models::{CandleSeries, Side};
use crate::signals::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplayOptions {
    /// Fill at the first bar's close when it beats the stated entry.
    pub use_better_price: bool,
    pub params: LadderParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStatus {
    Completed(Outcome),
    /// No bars at or after the signal time.
    NoData,
}

/// Where and at what price the entry filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryFill {
    pub index: usize,
    pub time: DateTime<Utc>,
    pub price: f64,
}

/// First bar at/after the signal that reaches the entry: long `low <= entry`,
/// short `high >= entry`. With `use_better_price`, the first bar's close fills
/// immediately when it is more favorable than the entry.
pub fn find_entry(signal: &Signal, bars: &CandleSeries, use_better_price: bool) -> Option<EntryFill> {
    let start = bars.index_at_or_after(signal.timestamp())?;
    let entry = signal.entry();

    if use_better_price {
        let first = &bars[start];
        if signal.side().is_beyond(entry, first.close) {
            return Some(EntryFill {
                index: start,
                time: first.timestamp,
                price: first.close,
            });
        }
    }

    bars.as_slice()[start..]
        .iter()
        .position(|bar| match signal.side() {
            Side::Long => bar.low <= entry,
            Side::Short => bar.high >= entry,
        })
        .map(|offset| {
            let index = start + offset;
            EntryFill {
                index,
                time: bars[index].timestamp,
                price: entry,
            }
        })
}

/// Drives one `ExitLadder` over historical 1-minute bars.
#[derive(Debug, Clone)]
pub struct BacktestReplayer {
    opts: ReplayOptions,
}

impl BacktestReplayer {
    pub fn new(opts: ReplayOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.opts
    }

    pub fn replay(&self, signal: &Signal, plan: LadderPlan, bars: &CandleSeries) -> ReplayStatus {
        if bars.index_at_or_after(signal.timestamp()).is_none() {
            return ReplayStatus::NoData;
        }

        let mut ladder = ExitLadder::new(signal, plan, self.opts.params);
        let Some(fill) = find_entry(signal, bars, self.opts.use_better_price) else {
            debug!("{}: entry {} never reached", signal.symbol(), signal.entry());
            let outcome = ladder.finish_without_entry().cloned().unwrap_or_else(Outcome::no_entry);
            return ReplayStatus::Completed(outcome);
        };
        ladder.on_entry_filled(fill.time, fill.price);

        // The entry bar itself is never scanned for exits.
        for bar in &bars.as_slice()[fill.index + 1..] {
            match ladder.on_price_event(bar.timestamp, bar.high, bar.low, bar.close) {
                Ok(Some(outcome)) => return ReplayStatus::Completed(outcome),
                Ok(None) => {}
                Err(e) => warn!("{}: {}", signal.symbol(), e),
            }
        }

        let Some(last) = bars.last() else {
            return ReplayStatus::NoData;
        };
        match ladder.on_data_exhausted(last.timestamp, last.close) {
            Some(outcome) => ReplayStatus::Completed(outcome),
            None => ReplayStatus::Completed(ladder.outcome().cloned().unwrap_or_else(Outcome::no_entry)),
        }
    }
}
