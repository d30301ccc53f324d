use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backtesting::data_fetcher::{HistoricalPriceSource, PriceCache};
use crate::backtesting::ledger::{Admission, CapitalLedger};
use crate::backtesting::replayer::{BacktestReplayer, ReplayOptions, ReplayStatus};
use crate::backtesting::report::BacktestReport;
use crate::backtesting::sweep::{forced_signal, ComboResult, SweepGrid, SweepReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ladder::{LadderParams, LadderPlan, Outcome};
use crate::models::{CandleSeries, Side};
use crate::signals::{Signal, SignalInput};

/// Per-signal disposition in a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Completed,
    NoData,
    Error,
    Invalid,
    InsufficientBalance,
    MaxPositionsReached,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Completed => "completed",
            SignalStatus::NoData => "no_data",
            SignalStatus::Error => "error",
            SignalStatus::Invalid => "invalid",
            SignalStatus::InsufficientBalance => "insufficient_balance",
            SignalStatus::MaxPositionsReached => "max_positions_reached",
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn rejection_status(admission: Admission) -> Option<SignalStatus> {
    match admission {
        Admission::Admitted => None,
        Admission::InsufficientBalance => Some(SignalStatus::InsufficientBalance),
        Admission::MaxPositionsReached => Some(SignalStatus::MaxPositionsReached),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub index: usize,
    pub symbol: String,
    pub side: Side,
    pub signal_time: DateTime<Utc>,
    pub entry: f64,
    pub status: SignalStatus,
    pub outcome: Option<Outcome>,
    /// Stop or take profit came from the percentage defaults.
    pub used_defaults: bool,
    /// Ledger balance when the signal arrived, before its own pnl. Ledger mode only.
    pub balance_at_signal: Option<f64>,
    pub error: Option<String>,
}

impl SignalRecord {
    fn new(index: usize, input: &SignalInput, status: SignalStatus) -> Self {
        Self {
            index,
            symbol: crate::signals::normalize_symbol(&input.symbol),
            side: input.side,
            signal_time: input.timestamp,
            entry: input.entry,
            status,
            outcome: None,
            used_defaults: !(input.has_stop() && input.has_take_profits()),
            balance_at_signal: None,
            error: None,
        }
    }

    /// Completed and the entry filled.
    pub fn traded(&self) -> bool {
        self.status == SignalStatus::Completed && self.outcome.as_ref().is_some_and(|o| o.filled())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunSettings {
    pub use_ladder: bool,
    pub replay: ReplayOptions,
    pub ledger_enabled: bool,
    pub starting_balance: f64,
    pub max_concurrent_positions: usize,
    pub default_tp_percent: f64,
    pub default_sl_percent: f64,
    pub fetch_concurrency: usize,
}

impl RunSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            use_ladder: cfg.use_ladder,
            replay: ReplayOptions {
                use_better_price: cfg.use_better_price,
                params: LadderParams {
                    notional: cfg.position_size_usdt,
                    leverage: cfg.backtest_leverage,
                    hours_limit: Some(cfg.hours_limit),
                },
            },
            ledger_enabled: cfg.ledger_enabled,
            starting_balance: cfg.starting_balance,
            max_concurrent_positions: cfg.max_concurrent_positions,
            default_tp_percent: cfg.default_tp_percent,
            default_sl_percent: cfg.default_sl_percent,
            fetch_concurrency: cfg.fetch_concurrency.max(1),
        }
    }

    pub fn hours_limit(&self) -> f64 {
        self.replay.params.hours_limit.unwrap_or(0.0)
    }
}

/// Where a signal's exit levels come from.
#[derive(Clone, Copy)]
enum Levels {
    /// Its own, with percentage defaults for missing ones.
    Signal,
    /// Percentages from entry, as (tp, sl).
    Forced(f64, f64),
}

enum PriceData {
    Bars(CandleSeries),
    Missing,
    Failed(String),
}

struct Prepared {
    index: usize,
    input: SignalInput,
    signal: std::result::Result<(Signal, LadderPlan), String>,
    data: PriceData,
}

/// Batch backtest: fetch/cache bars concurrently, then replay either in
/// parallel (no ledger) or sequentially through the capital ledger.
pub struct BacktestRunner {
    settings: RunSettings,
    cache: PriceCache,
    source: Arc<dyn HistoricalPriceSource>,
}

impl BacktestRunner {
    pub fn new(cfg: &Config, source: Arc<dyn HistoricalPriceSource>) -> Self {
        Self::with_settings(RunSettings::from_config(cfg), PriceCache::new(cfg.data_path()), source)
    }

    pub fn with_settings(
        settings: RunSettings,
        cache: PriceCache,
        source: Arc<dyn HistoricalPriceSource>,
    ) -> Self {
        Self {
            settings,
            cache,
            source,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub async fn run(&self, mut inputs: Vec<SignalInput>) -> Result<BacktestReport> {
        inputs.sort_by_key(|s| s.timestamp);

        info!("=== BACKTEST START ===");
        info!(
            "{} signals | window {}h | ladder {} | ledger {}",
            inputs.len(),
            self.settings.hours_limit(),
            self.settings.use_ladder,
            self.settings.ledger_enabled
        );

        let prepared = self.prepare(inputs, Levels::Signal).await?;

        let (records, ledger) = if self.settings.ledger_enabled {
            let (records, ledger) = self.replay_with_ledger(&prepared);
            (records, Some(ledger))
        } else {
            (self.replay_parallel(&prepared), None)
        };

        info!("=== BACKTEST DONE ===");
        Ok(BacktestReport::from_records(
            records,
            &self.settings,
            ledger.as_ref(),
        ))
    }

    /// Replays every signal once per TP/SL pair in `grid`, with forced single
    /// target levels. Bars are fetched once and the pairs run in parallel.
    pub async fn sweep(&self, mut inputs: Vec<SignalInput>, grid: &SweepGrid) -> Result<SweepReport> {
        let combos = grid.combinations();
        let Some(&(tp, sl)) = combos.first() else {
            return Err(Error::Config(format!("empty TP/SL sweep grid: {:?}", grid)));
        };
        inputs.sort_by_key(|s| s.timestamp);
        let hours = self.settings.hours_limit();

        info!("=== SWEEP START ===");
        info!("{} signals x {} TP/SL pairs | window {}h", inputs.len(), combos.len(), hours);

        // Validity does not depend on the pair, so the first one decides what to fetch.
        let prepared = self.prepare(inputs, Levels::Forced(tp, sl)).await?;

        let results: Vec<ComboResult> = combos
            .par_iter()
            .map(|&(tp, sl)| {
                let outcomes = self.replay_forced(&prepared, tp, sl);
                ComboResult::from_outcomes(tp, sl, hours, prepared.len(), &outcomes)
            })
            .collect();

        info!("=== SWEEP DONE ===");
        Ok(SweepReport::new(hours, prepared.len(), results))
    }

    fn replay_forced(&self, prepared: &[Prepared], tp: f64, sl: f64) -> Vec<Outcome> {
        let replayer = BacktestReplayer::new(self.settings.replay);
        prepared
            .iter()
            .filter_map(|p| {
                let PriceData::Bars(bars) = &p.data else {
                    return None;
                };
                let (signal, plan) = forced_signal(&p.input, tp, sl).ok()?;
                match replayer.replay(&signal, plan, bars) {
                    ReplayStatus::Completed(outcome) if outcome.filled() => Some(outcome),
                    _ => None,
                }
            })
            .collect()
    }

    fn build(&self, input: &SignalInput, levels: Levels) -> std::result::Result<(Signal, LadderPlan), String> {
        if let Levels::Forced(tp, sl) = levels {
            return forced_signal(input, tp, sl).map_err(|e| e.to_string());
        }
        let signal = input
            .clone()
            .validate_with_defaults(self.settings.default_tp_percent, self.settings.default_sl_percent)
            .map_err(|e| e.to_string())?;
        // Defaulted targets get a single 100% tier.
        let use_ladder = self.settings.use_ladder && input.has_take_profits();
        let plan = LadderPlan::for_signal(&signal, use_ladder);
        Ok((signal, plan))
    }

    /// Phase 1: validate every signal and load its bars, fetching concurrently.
    async fn prepare(&self, inputs: Vec<SignalInput>, levels: Levels) -> Result<Vec<Prepared>> {
        let semaphore = Arc::new(Semaphore::new(self.settings.fetch_concurrency));
        let mut tasks = JoinSet::new();
        let mut prepared: Vec<Prepared> = Vec::with_capacity(inputs.len());

        for (index, input) in inputs.into_iter().enumerate() {
            let signal = self.build(&input, levels);
            if let Ok((sig, _)) = &signal {
                let semaphore = semaphore.clone();
                let cache = self.cache.clone();
                let source = self.source.clone();
                let symbol = sig.symbol().to_string();
                let time = sig.timestamp();
                let hours = self.settings.hours_limit();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let data = match cache.get_or_fetch(source.as_ref(), &symbol, time, hours).await {
                        Ok(bars) if bars.is_empty() => PriceData::Missing,
                        Ok(bars) => PriceData::Bars(bars),
                        Err(e) => {
                            warn!("Price data for {} failed: {}", symbol, e);
                            PriceData::Failed(e.to_string())
                        }
                    };
                    (index, data)
                });
            }
            prepared.push(Prepared {
                index,
                input,
                signal,
                data: PriceData::Missing,
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, data)) => prepared[index].data = data,
                Err(e) => warn!("Fetch task panicked: {}", e),
            }
        }
        debug!("Price data ready for {} signals", prepared.len());
        Ok(prepared)
    }

    fn replay_one(&self, p: &Prepared) -> SignalRecord {
        let replayer = BacktestReplayer::new(self.settings.replay);
        let (signal, plan) = match &p.signal {
            Ok(sp) => sp,
            Err(reason) => {
                let mut rec = SignalRecord::new(p.index, &p.input, SignalStatus::Invalid);
                rec.error = Some(reason.clone());
                return rec;
            }
        };

        match &p.data {
            PriceData::Missing => SignalRecord::new(p.index, &p.input, SignalStatus::NoData),
            PriceData::Failed(reason) => {
                let mut rec = SignalRecord::new(p.index, &p.input, SignalStatus::Error);
                rec.error = Some(reason.clone());
                rec
            }
            PriceData::Bars(bars) => match replayer.replay(signal, plan.clone(), bars) {
                ReplayStatus::NoData => SignalRecord::new(p.index, &p.input, SignalStatus::NoData),
                ReplayStatus::Completed(outcome) => {
                    let mut rec = SignalRecord::new(p.index, &p.input, SignalStatus::Completed);
                    rec.outcome = Some(outcome);
                    rec
                }
            },
        }
    }

    /// Independent replays; order of the output matches the input.
    fn replay_parallel(&self, prepared: &[Prepared]) -> Vec<SignalRecord> {
        prepared.par_iter().map(|p| self.replay_one(p)).collect()
    }

    /// Timestamp-ordered, ledger-gated replays. Never parallel.
    fn replay_with_ledger(&self, prepared: &[Prepared]) -> (Vec<SignalRecord>, CapitalLedger) {
        let mut ledger = CapitalLedger::new(
            self.settings.starting_balance,
            self.settings.replay.params.notional,
            self.settings.max_concurrent_positions,
        );
        let mut records = Vec::with_capacity(prepared.len());

        for p in prepared {
            if let Some(status) = rejection_status(ledger.try_admit(p.input.timestamp)) {
                debug!("{} at {}: {}", p.input.symbol, p.input.timestamp, status);
                let mut rec = SignalRecord::new(p.index, &p.input, status);
                rec.balance_at_signal = Some(ledger.balance());
                records.push(rec);
                continue;
            }

            let mut rec = self.replay_one(p);
            if let Some(outcome) = &rec.outcome {
                ledger.record(&rec.symbol, outcome);
            }
            rec.balance_at_signal = Some(ledger.balance());
            records.push(rec);
        }

        ledger.settle_all();
        info!("Final balance: ${:.2}", ledger.balance());
        (records, ledger)
    }
}
