//! Live position monitor.
//!
//! Polls the stop order and every take-profit order of one open position,
//! feeds fills into the position's [`ExitLadder`] and retires once the
//! position is finished on the broker side.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exchange::{round_down_to_step, round_to_tick, Broker, OrderRef, OrderSnapshot, SymbolPrecision};
use crate::ladder::{ExitLadder, FillKind, Outcome};
use crate::models::{OrderSide, OrderStatus};
use crate::trading::registry::{MonitorId, MonitorProgress, MonitorRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorExitReason {
    AllTargetsFilled,
    StopFilled,
    /// Stop gone without filling and no take profit left working.
    Orphaned,
    /// Stopped from outside; broker orders were left untouched.
    Stopped,
}

impl fmt::Display for MonitorExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorExitReason::AllTargetsFilled => write!(f, "all_targets_filled"),
            MonitorExitReason::StopFilled => write!(f, "stop_filled"),
            MonitorExitReason::Orphaned => write!(f, "orphaned"),
            MonitorExitReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Final report of a monitor task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorExit {
    pub symbol: String,
    pub reason: MonitorExitReason,
    /// Ladder result when the fills closed the position.
    pub outcome: Option<Outcome>,
    pub filled_tp_count: usize,
    /// Non-fatal problems, e.g. orders that could not be cancelled.
    pub warnings: Vec<String>,
}

/// Orders and sizing of a freshly protected position.
#[derive(Debug, Clone)]
pub struct MonitorSetup {
    pub symbol: String,
    pub exit_side: OrderSide,
    pub quantity: f64,
    pub precision: SymbolPrecision,
    pub stop_order: OrderRef,
    pub stop_price: f64,
    pub tp_orders: Vec<OrderRef>,
    pub tp_quantities: Vec<f64>,
    pub poll_interval: Duration,
}

struct TpOrder {
    order: OrderRef,
    quantity: f64,
    status: OrderStatus,
}

pub struct LiveMonitor {
    broker: Arc<dyn Broker>,
    ladder: ExitLadder,
    symbol: String,
    exit_side: OrderSide,
    quantity: f64,
    precision: SymbolPrecision,
    stop_order: OrderRef,
    stop_price: f64,
    stop_status: OrderStatus,
    tps: Vec<TpOrder>,
    poll_interval: Duration,
    last_event: DateTime<Utc>,
    registry: Option<(MonitorRegistry, MonitorId)>,
    warnings: Vec<String>,
}

impl LiveMonitor {
    /// `ladder` must already hold the entry fill.
    pub fn new(broker: Arc<dyn Broker>, ladder: ExitLadder, setup: MonitorSetup) -> Self {
        let last_event = ladder
            .position()
            .map(|p| p.entry_time)
            .unwrap_or_else(Utc::now);
        let tps = setup
            .tp_orders
            .into_iter()
            .zip(setup.tp_quantities)
            .map(|(order, quantity)| TpOrder {
                order,
                quantity,
                status: OrderStatus::New,
            })
            .collect();
        Self {
            broker,
            ladder,
            symbol: setup.symbol,
            exit_side: setup.exit_side,
            quantity: setup.quantity,
            precision: setup.precision,
            stop_order: setup.stop_order,
            stop_price: setup.stop_price,
            stop_status: OrderStatus::New,
            tps,
            poll_interval: setup.poll_interval,
            last_event,
            registry: None,
            warnings: Vec::new(),
        }
    }

    /// Report progress to `registry` and deregister on exit.
    pub fn with_registry(mut self, registry: MonitorRegistry, id: MonitorId) -> Self {
        self.registry = Some((registry, id));
        self
    }

    pub fn ladder(&self) -> &ExitLadder {
        &self.ladder
    }

    fn filled_tp_count(&self) -> usize {
        self.tps.iter().filter(|t| t.status == OrderStatus::Filled).count()
    }

    fn any_tp_active(&self) -> bool {
        self.tps.iter().any(|t| t.status.is_active())
    }

    fn remaining_quantity(&self) -> f64 {
        let closed: f64 = self
            .tps
            .iter()
            .filter(|t| t.status == OrderStatus::Filled)
            .map(|t| t.quantity)
            .sum();
        round_down_to_step(self.quantity - closed, self.precision.step_size)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> MonitorExit {
        info!(
            "Monitoring {} | stop {} @ {} | {} TP order(s)",
            self.symbol,
            self.stop_order,
            self.stop_price,
            self.tps.len()
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        "Monitor for {} stopped; stop {} and open TP orders remain live on the exchange",
                        self.symbol, self.stop_order
                    );
                    break MonitorExitReason::Stopped;
                }
                _ = ticker.tick() => {
                    if let Some(reason) = self.poll().await {
                        break reason;
                    }
                    self.report_progress().await;
                }
            }
        };

        if let Some((registry, id)) = &self.registry {
            registry.remove(*id).await;
        }
        info!("Monitor for {} retired: {}", self.symbol, reason);

        MonitorExit {
            symbol: self.symbol.clone(),
            reason,
            outcome: self.ladder.outcome().cloned(),
            filled_tp_count: self.filled_tp_count(),
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    async fn report_progress(&self) {
        if let Some((registry, id)) = &self.registry {
            registry
                .update(
                    *id,
                    MonitorProgress {
                        stop_order: self.stop_order.clone(),
                        stop_status: self.stop_status,
                        filled_tp_count: self.filled_tp_count(),
                    },
                )
                .await;
        }
    }

    /// One polling pass. Returns the exit reason once the position is finished.
    async fn poll(&mut self) -> Option<MonitorExitReason> {
        let stop_snapshot = if self.stop_status.is_active() {
            match self.broker.order_status(&self.symbol, &self.stop_order).await {
                Ok(snap) => Some(snap),
                Err(e) => {
                    warn!("{}: stop status query failed, retrying: {}", self.symbol, e);
                    return None;
                }
            }
        } else {
            None
        };

        let mut fills: Vec<(FillKind, OrderSnapshot)> = Vec::new();
        let mut tp_updates = Vec::new();
        for (i, tp) in self.tps.iter().enumerate() {
            if !tp.status.is_active() {
                continue;
            }
            match self.broker.order_status(&self.symbol, &tp.order).await {
                Ok(snap) => tp_updates.push((i, snap)),
                Err(e) => {
                    warn!("{}: TP{} status query failed, retrying: {}", self.symbol, i + 1, e);
                    return None;
                }
            }
        }

        for (i, snap) in tp_updates {
            self.tps[i].status = snap.status;
            if snap.status == OrderStatus::Filled {
                fills.push((FillKind::Tier(i), snap));
            } else if snap.status.is_dead() {
                warn!("{}: TP{} is {} without filling", self.symbol, i + 1, snap.status);
            }
        }
        if let Some(snap) = stop_snapshot {
            self.stop_status = snap.status;
            if snap.status == OrderStatus::Filled {
                fills.push((FillKind::Stop, snap));
            }
        }

        // Fill time order; ties keep tiers in index order ahead of the stop.
        fills.sort_by_key(|(_, snap)| snap.updated_at);
        for (kind, snap) in &fills {
            self.feed(*kind, snap);
        }

        if self.stop_status == OrderStatus::Filled {
            info!("{}: stop filled", self.symbol);
            self.cancel_open_tps().await;
            return Some(MonitorExitReason::StopFilled);
        }

        if !self.tps.is_empty() && self.tps.iter().all(|t| t.status == OrderStatus::Filled) {
            info!("{}: all {} targets filled", self.symbol, self.tps.len());
            if self.stop_status.is_active() {
                let stop = self.stop_order.clone();
                self.cancel(&stop, "stop").await;
            }
            return Some(MonitorExitReason::AllTargetsFilled);
        }

        if fills.iter().any(|(kind, _)| matches!(kind, FillKind::Tier(_))) {
            self.relocate_stop().await;
        }

        if !self.stop_status.is_active() && !self.any_tp_active() {
            warn!(
                "{}: stop is {} and no take profit is working; retiring without a clear outcome",
                self.symbol, self.stop_status
            );
            return Some(MonitorExitReason::Orphaned);
        }

        None
    }

    fn feed(&mut self, kind: FillKind, snap: &OrderSnapshot) {
        let time = snap.updated_at.max(self.last_event);
        self.last_event = time;
        let price = snap.avg_fill_price.unwrap_or(match kind {
            FillKind::Stop => self.stop_price,
            FillKind::Tier(i) => self
                .ladder
                .plan()
                .tier(i)
                .map(|t| t.price)
                .unwrap_or(self.stop_price),
        });
        match self.ladder.on_fill_event(kind, time, price) {
            Ok(Some(outcome)) => info!(
                "{}: position closed ({}) pnl {:+.4}",
                self.symbol, outcome.result, outcome.realized_pnl
            ),
            Ok(None) => debug!("{}: applied {:?} fill at {}", self.symbol, kind, price),
            Err(e) => warn!("{}: fill rejected by ladder: {}", self.symbol, e),
        }
    }

    /// Moves the broker stop to the ladder's stop for the remaining quantity.
    async fn relocate_stop(&mut self) {
        let Some(target) = self.ladder.current_stop() else {
            return;
        };
        let target = round_to_tick(target, self.precision.tick_size);
        if (target - self.stop_price).abs() < f64::EPSILON || !self.stop_status.is_active() {
            return;
        }
        let remaining = self.remaining_quantity();
        if remaining <= 0.0 {
            return;
        }

        if let Err(e) = self.broker.cancel_order(&self.symbol, &self.stop_order).await {
            warn!(
                "{}: could not cancel stop {} to move it to {}: {}. Old stop stays in place",
                self.symbol, self.stop_order, target, e
            );
            // A fill of the old order must book at its own price.
            self.ladder.pin_stop(self.stop_price);
            self.warnings.push(format!(
                "stop {} could not be moved to {} and stays at {}: {}",
                self.stop_order, target, self.stop_price, e
            ));
            return;
        }

        match self
            .broker
            .place_stop_order(&self.symbol, self.exit_side, remaining, target)
            .await
        {
            Ok(order) => {
                info!(
                    "{}: stop moved {} -> {} for {} (order {})",
                    self.symbol, self.stop_price, target, remaining, order
                );
                self.stop_order = order;
                self.stop_price = target;
                self.stop_status = OrderStatus::New;
            }
            Err(e) => {
                error!(
                    "{}: STOP RELOCATION FAILED, {} remaining without a stop: {}",
                    self.symbol, remaining, e
                );
                self.stop_status = OrderStatus::Canceled;
                self.warnings
                    .push(format!("stop relocation to {} failed: {}", target, e));
            }
        }
    }

    async fn cancel_open_tps(&mut self) {
        let open: Vec<(usize, OrderRef)> = self
            .tps
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status.is_active())
            .map(|(i, t)| (i, t.order.clone()))
            .collect();
        for (i, order) in open {
            if self.cancel(&order, &format!("TP{}", i + 1)).await {
                self.tps[i].status = OrderStatus::Canceled;
            }
        }
    }

    async fn cancel(&mut self, order: &OrderRef, label: &str) -> bool {
        match self.broker.cancel_order(&self.symbol, order).await {
            Ok(()) => {
                debug!("{}: cancelled {} {}", self.symbol, label, order);
                true
            }
            Err(e) => {
                let msg = format!("{} order {} could not be cancelled: {}", label, order, e);
                warn!("{}: {}. Order remains live, manual action needed", self.symbol, msg);
                self.warnings.push(msg);
                false
            }
        }
    }
}
