//! Tiered partial-exit / trailing-stop state machine.
//!
//! One `ExitLadder` tracks one position from entry fill to a terminal
//! [`Outcome`]. Both the live monitor (order fills) and the backtest replayer
//! (1-minute bars) drive it, so identical event streams yield identical exits.
//!
//! Per event the checks run in a fixed order: time limit, stop, then the next
//! take-profit tier only.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ladder::outcome::{ExitReason, ExitRecord, Outcome, TradeResult};
use crate::ladder::tiers::LadderPlan;
use crate::models::Side;
use crate::signals::Signal;

/// A stop within this distance of entry realizes zero pnl.
pub const BREAKEVEN_EPSILON: f64 = 1e-4;

/// Remaining fraction below which the position counts as fully closed.
pub const DUST_FRACTION: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderParams {
    /// Position size in quote currency before leverage.
    pub notional: f64,
    pub leverage: f64,
    /// Close whatever remains once an event arrives later than this many hours after entry.
    pub hours_limit: Option<f64>,
}

/// A broker fill reported by the live monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillKind {
    Stop,
    Tier(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub remaining_fraction: f64,
    pub current_stop: f64,
    pub next_tier_index: usize,
    pub realized_pnl: f64,
    pub bars_in_trade: usize,
    pub exits: Vec<ExitRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LadderState {
    AwaitingEntry,
    Open(PositionState),
    Closed(Outcome),
}

#[derive(Clone, Copy)]
enum Touch {
    Bar { high: f64, low: f64, close: f64 },
    Fill { kind: FillKind, price: f64 },
}

#[derive(Debug, Clone)]
pub struct ExitLadder {
    side: Side,
    initial_stop: f64,
    plan: LadderPlan,
    params: LadderParams,
    state: LadderState,
    last_event: Option<DateTime<Utc>>,
}

impl ExitLadder {
    pub fn new(signal: &Signal, plan: LadderPlan, params: LadderParams) -> Self {
        Self {
            side: signal.side(),
            initial_stop: signal.stop_loss(),
            plan,
            params,
            state: LadderState::AwaitingEntry,
            last_event: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn plan(&self) -> &LadderPlan {
        &self.plan
    }

    pub fn params(&self) -> &LadderParams {
        &self.params
    }

    pub fn state(&self) -> &LadderState {
        &self.state
    }

    pub fn position(&self) -> Option<&PositionState> {
        match &self.state {
            LadderState::Open(pos) => Some(pos),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.state {
            LadderState::Closed(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, LadderState::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, LadderState::Closed(_))
    }

    pub fn current_stop(&self) -> Option<f64> {
        self.position().map(|p| p.current_stop)
    }

    pub fn remaining_fraction(&self) -> f64 {
        match &self.state {
            LadderState::AwaitingEntry => 1.0,
            LadderState::Open(pos) => pos.remaining_fraction,
            LadderState::Closed(_) => 0.0,
        }
    }

    pub fn next_tier_index(&self) -> Option<usize> {
        self.position().map(|p| p.next_tier_index)
    }

    /// AwaitingEntry -> Open. No-op in any other state.
    pub fn on_entry_filled(&mut self, time: DateTime<Utc>, price: f64) {
        if !matches!(self.state, LadderState::AwaitingEntry) {
            return;
        }
        self.state = LadderState::Open(PositionState {
            side: self.side,
            entry_price: price,
            entry_time: time,
            remaining_fraction: 1.0,
            current_stop: self.initial_stop,
            next_tier_index: 0,
            realized_pnl: 0.0,
            bars_in_trade: 1,
            exits: Vec::new(),
        });
        self.last_event = Some(time);
    }

    /// Overrides the stop of an open position with the one actually working at
    /// the broker. Later tiers still move it as planned.
    pub fn pin_stop(&mut self, stop: f64) {
        if let LadderState::Open(pos) = &mut self.state {
            if (pos.current_stop - stop).abs() > f64::EPSILON {
                debug!("Stop pinned {} -> {}", pos.current_stop, stop);
                pos.current_stop = stop;
            }
        }
    }

    /// Closes as `no_entry` if the entry never filled. Returns the terminal outcome.
    pub fn finish_without_entry(&mut self) -> Option<&Outcome> {
        if matches!(self.state, LadderState::AwaitingEntry) {
            self.state = LadderState::Closed(Outcome::no_entry());
        }
        self.outcome()
    }

    /// Feeds one bar. Returns the outcome if this bar closed the position.
    pub fn on_price_event(
        &mut self,
        time: DateTime<Utc>,
        high: f64,
        low: f64,
        close: f64,
    ) -> Result<Option<Outcome>> {
        self.process(time, Touch::Bar { high, low, close })
    }

    /// Feeds one broker fill. A stop fill is a touch of the current stop; a tier
    /// fill is a touch of that tier's price. Tiers already applied are ignored.
    pub fn on_fill_event(
        &mut self,
        kind: FillKind,
        time: DateTime<Utc>,
        price: f64,
    ) -> Result<Option<Outcome>> {
        self.process(time, Touch::Fill { kind, price })
    }

    /// Force-closes the remainder at `close` when the data runs out.
    pub fn on_data_exhausted(&mut self, time: DateTime<Utc>, close: f64) -> Option<Outcome> {
        let LadderState::Open(pos) = &mut self.state else {
            return None;
        };
        let outcome = close_remainder(
            pos,
            &self.params,
            ExitReason::EndOfData,
            time,
            close,
            TradeResult::Expired,
        );
        self.state = LadderState::Closed(outcome.clone());
        Some(outcome)
    }

    fn process(&mut self, time: DateTime<Utc>, touch: Touch) -> Result<Option<Outcome>> {
        let LadderState::Open(pos) = &mut self.state else {
            return Ok(None);
        };
        if let Some(last) = self.last_event {
            if time < last {
                return Err(Error::OutOfOrderEvent { event: time, last });
            }
        }

        if let Touch::Fill {
            kind: FillKind::Tier(index),
            ..
        } = touch
        {
            if index < pos.next_tier_index {
                debug!("TP{} fill already applied, ignoring", index + 1);
                return Ok(None);
            }
            if index >= self.plan.len() {
                warn!("Fill for unknown tier {} ignored", index + 1);
                return Ok(None);
            }
        }

        self.last_event = Some(time);
        pos.bars_in_trade += 1;

        // 1. time limit
        if let Some(limit) = self.params.hours_limit.and_then(|h| time_limit(pos.entry_time, h)) {
            if time > limit {
                let price = match touch {
                    Touch::Bar { close, .. } => close,
                    Touch::Fill { price, .. } => price,
                };
                let outcome = close_remainder(
                    pos,
                    &self.params,
                    ExitReason::TimeLimit,
                    time,
                    price,
                    TradeResult::Expired,
                );
                self.state = LadderState::Closed(outcome.clone());
                return Ok(Some(outcome));
            }
        }

        // 2. stop
        let stop_hit = match touch {
            Touch::Bar { high, low, .. } => match pos.side {
                Side::Long => low <= pos.current_stop,
                Side::Short => high >= pos.current_stop,
            },
            Touch::Fill { kind, .. } => kind == FillKind::Stop,
        };
        if stop_hit {
            let outcome = close_at_stop(pos, &self.params, time);
            self.state = LadderState::Closed(outcome.clone());
            return Ok(Some(outcome));
        }

        // 3. take profit
        let last_tier = match touch {
            Touch::Bar { high, low, .. } => {
                let Some(tier) = self.plan.tier(pos.next_tier_index) else {
                    return Ok(None);
                };
                let hit = match pos.side {
                    Side::Long => high >= tier.price,
                    Side::Short => low <= tier.price,
                };
                if !hit {
                    return Ok(None);
                }
                pos.next_tier_index
            }
            Touch::Fill {
                kind: FillKind::Tier(index),
                ..
            } => index,
            Touch::Fill { .. } => return Ok(None),
        };

        while pos.next_tier_index <= last_tier {
            if let Some(outcome) = apply_tier(pos, &self.plan, &self.params, time) {
                self.state = LadderState::Closed(outcome.clone());
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }
}

/// `None` when the window does not fit in a timestamp.
fn time_limit(entry_time: DateTime<Utc>, hours: f64) -> Option<DateTime<Utc>> {
    Duration::try_milliseconds((hours * 3_600_000.0) as i64)
        .and_then(|d| entry_time.checked_add_signed(d))
}

fn pnl_for(pos: &PositionState, params: &LadderParams, price: f64, fraction: f64) -> f64 {
    pos.side.pct_move(pos.entry_price, price) * fraction * params.notional * params.leverage / 100.0
}

fn record_exit(
    pos: &mut PositionState,
    reason: ExitReason,
    time: DateTime<Utc>,
    price: f64,
    fraction: f64,
    pnl: f64,
) {
    pos.realized_pnl += pnl;
    pos.remaining_fraction -= fraction;
    pos.exits.push(ExitRecord {
        reason,
        time,
        price,
        fraction,
        pnl,
    });
}

fn finish(
    pos: &mut PositionState,
    params: &LadderParams,
    time: DateTime<Utc>,
    price: f64,
    result: TradeResult,
) -> Outcome {
    pos.remaining_fraction = 0.0;
    let pnl_percent = if params.notional > 0.0 {
        pos.realized_pnl / params.notional * 100.0
    } else {
        0.0
    };
    Outcome {
        result,
        realized_pnl: pos.realized_pnl,
        pnl_percent,
        entry_time: Some(pos.entry_time),
        entry_price: Some(pos.entry_price),
        exit_time: Some(time),
        exit_price: Some(price),
        bars_in_trade: pos.bars_in_trade,
        exits: std::mem::take(&mut pos.exits),
    }
}

fn close_remainder(
    pos: &mut PositionState,
    params: &LadderParams,
    reason: ExitReason,
    time: DateTime<Utc>,
    price: f64,
    result: TradeResult,
) -> Outcome {
    let fraction = pos.remaining_fraction;
    let pnl = pnl_for(pos, params, price, fraction);
    record_exit(pos, reason, time, price, fraction, pnl);
    finish(pos, params, time, price, result)
}

fn close_at_stop(pos: &mut PositionState, params: &LadderParams, time: DateTime<Utc>) -> Outcome {
    let stop = pos.current_stop;
    let fraction = pos.remaining_fraction;
    let pnl = if (stop - pos.entry_price).abs() < BREAKEVEN_EPSILON {
        0.0
    } else {
        pnl_for(pos, params, stop, fraction)
    };
    record_exit(pos, ExitReason::Stop, time, stop, fraction, pnl);
    let result = if pos.realized_pnl < 0.0 {
        TradeResult::Loss
    } else {
        TradeResult::Win
    };
    debug!("Stop hit at {} ({})", stop, result);
    finish(pos, params, time, stop, result)
}

/// Applies tier `next_tier_index`. Returns the outcome if nothing meaningful remains.
fn apply_tier(
    pos: &mut PositionState,
    plan: &LadderPlan,
    params: &LadderParams,
    time: DateTime<Utc>,
) -> Option<Outcome> {
    let index = pos.next_tier_index;
    let Some(tier) = plan.tier(index).copied() else {
        pos.next_tier_index = usize::MAX;
        return None;
    };

    let fraction = pos.remaining_fraction * tier.close_fraction;
    let pnl = pnl_for(pos, params, tier.price, fraction);
    record_exit(pos, ExitReason::Tier(index), time, tier.price, fraction, pnl);
    if let Some(stop) = tier.new_stop.resolve(pos.entry_price) {
        pos.current_stop = stop;
    }
    pos.next_tier_index += 1;
    debug!(
        "TP{} hit at {} | closed {:.4} | stop -> {}",
        index + 1,
        tier.price,
        fraction,
        pos.current_stop
    );

    (pos.remaining_fraction < DUST_FRACTION)
        .then(|| finish(pos, params, time, tier.price, TradeResult::Win))
}
