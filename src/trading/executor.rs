use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EntryOrderType};
use crate::error::{Error, Result};
use crate::exchange::{round_down_to_step, round_to_tick, Broker, OrderRef, OrderSnapshot, SymbolPrecision};
use crate::ladder::{ExitLadder, LadderParams, LadderPlan};
use crate::models::OrderStatus;
use crate::signals::Signal;
use crate::trading::monitor::{LiveMonitor, MonitorExit, MonitorSetup};
use crate::trading::registry::{MonitorId, MonitorRegistry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorSettings {
    pub leverage: u32,
    /// Margin per trade in USDT.
    pub trade_amount: f64,
    pub entry_order_type: EntryOrderType,
    pub use_ladder: bool,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            leverage: cfg.leverage,
            trade_amount: cfg.trade_amount_usdt,
            entry_order_type: cfg.entry_order_type,
            use_ladder: cfg.use_ladder,
            poll_interval: cfg.poll_interval(),
            wait_timeout: cfg.wait_timeout(),
        }
    }
}

/// A protected position with its monitor running.
#[derive(Debug)]
pub struct MonitorHandle {
    pub id: MonitorId,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_order: OrderRef,
    pub tp_orders: Vec<OrderRef>,
    pub task: JoinHandle<MonitorExit>,
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Monitoring(MonitorHandle),
    /// The entry did not fill in time and was cancelled.
    EntryNotFilled { symbol: String, order: OrderRef },
}

/// Splits `quantity` across tiers by their share of the original position.
/// The last tier takes the rounding remainder. `None` if any tier would fall
/// below the exchange minimum.
pub fn split_quantity(quantity: f64, fractions: &[f64], precision: &SymbolPrecision) -> Option<Vec<f64>> {
    let (_, head) = fractions.split_last()?;
    let mut parts: Vec<f64> = head
        .iter()
        .map(|f| round_down_to_step(quantity * f, precision.step_size))
        .collect();
    let used: f64 = parts.iter().sum();
    parts.push(round_down_to_step(quantity - used, precision.step_size));

    if parts.iter().any(|q| *q <= 0.0 || *q < precision.min_qty) {
        return None;
    }
    Some(parts)
}

/// Turns a validated signal into a protected, monitored position.
pub struct TradeExecutor {
    broker: Arc<dyn Broker>,
    registry: MonitorRegistry,
    settings: ExecutorSettings,
}

impl TradeExecutor {
    pub fn new(broker: Arc<dyn Broker>, registry: MonitorRegistry, settings: ExecutorSettings) -> Self {
        Self {
            broker,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &MonitorRegistry {
        &self.registry
    }

    pub async fn execute(&self, signal: &Signal) -> Result<ExecutionOutcome> {
        let symbol = signal.symbol();
        info!("Executing {}", signal);

        let precision = self.broker.symbol_precision(symbol).await?;
        self.broker.set_leverage(symbol, self.settings.leverage).await?;

        let notional = self.settings.trade_amount * self.settings.leverage as f64;
        let quantity = round_down_to_step(notional / signal.entry(), precision.step_size);
        if quantity <= 0.0 || quantity < precision.min_qty {
            return Err(Error::ZeroQuantity {
                symbol: symbol.to_string(),
                step_size: precision.step_size,
            });
        }

        let mut plan = LadderPlan::for_signal(signal, self.settings.use_ladder);
        let tp_quantities = match split_quantity(quantity, &plan.original_fractions(), &precision) {
            Some(q) => q,
            None => {
                warn!(
                    "{}: {} too small to split across {} targets, using a single target",
                    symbol,
                    quantity,
                    plan.len()
                );
                plan = LadderPlan::for_signal(signal, false);
                vec![quantity]
            }
        };

        let limit_price = match self.settings.entry_order_type {
            EntryOrderType::Market => None,
            EntryOrderType::Limit => Some(round_to_tick(signal.entry(), precision.tick_size)),
        };
        let entry_order = self
            .broker
            .place_entry_order(symbol, signal.side().entry_order_side(), quantity, limit_price)
            .await?;
        info!(
            "{}: entry {} {} x {} placed ({})",
            symbol,
            signal.side().entry_order_side(),
            quantity,
            limit_price.map_or("market".to_string(), |p| p.to_string()),
            entry_order
        );

        let Some(fill) = self.wait_for_fill(symbol, &entry_order).await? else {
            return Ok(ExecutionOutcome::EntryNotFilled {
                symbol: symbol.to_string(),
                order: entry_order,
            });
        };
        let entry_price = fill.avg_fill_price.unwrap_or(signal.entry());
        info!("{}: entry filled at {}", symbol, entry_price);

        let exit_side = signal.side().exit_order_side();
        let stop_price = round_to_tick(signal.stop_loss(), precision.tick_size);
        let stop_order = self
            .broker
            .place_stop_order(symbol, exit_side, quantity, stop_price)
            .await
            .map_err(|e| unprotected(symbol, format!("stop at {} failed: {}", stop_price, e)))?;

        let mut tp_orders = Vec::with_capacity(plan.len());
        for (i, (tier, qty)) in plan.tiers().iter().zip(&tp_quantities).enumerate() {
            let price = round_to_tick(tier.price, precision.tick_size);
            let order = self
                .broker
                .place_take_profit_order(symbol, exit_side, *qty, price)
                .await
                .map_err(|e| {
                    unprotected(
                        symbol,
                        format!(
                            "TP{} at {} failed after stop {} and {} TP order(s) were placed: {}",
                            i + 1,
                            price,
                            stop_order,
                            tp_orders.len(),
                            e
                        ),
                    )
                })?;
            debug!("{}: TP{} {} x {} ({})", symbol, i + 1, price, qty, order);
            tp_orders.push(order);
        }

        let mut ladder = ExitLadder::new(
            signal,
            plan,
            LadderParams {
                notional: self.settings.trade_amount,
                leverage: self.settings.leverage as f64,
                hours_limit: None,
            },
        );
        ladder.on_entry_filled(fill.updated_at, entry_price);

        let (id, cancel) = self
            .registry
            .add(symbol, stop_order.clone(), tp_orders.clone())
            .await;
        let monitor = LiveMonitor::new(
            self.broker.clone(),
            ladder,
            MonitorSetup {
                symbol: symbol.to_string(),
                exit_side,
                quantity,
                precision,
                stop_order: stop_order.clone(),
                stop_price,
                tp_orders: tp_orders.clone(),
                tp_quantities,
                poll_interval: self.settings.poll_interval,
            },
        )
        .with_registry(self.registry.clone(), id);
        let task = tokio::spawn(monitor.run(cancel));

        Ok(ExecutionOutcome::Monitoring(MonitorHandle {
            id,
            symbol: symbol.to_string(),
            entry_price,
            quantity,
            stop_order,
            tp_orders,
            task,
        }))
    }

    /// Polls the entry until filled. On timeout or a dead order, cancels and
    /// returns `None`.
    async fn wait_for_fill(&self, symbol: &str, order: &OrderRef) -> Result<Option<OrderSnapshot>> {
        let deadline = Instant::now() + self.settings.wait_timeout;
        let mut last_status = OrderStatus::New;

        loop {
            match self.broker.order_status(symbol, order).await {
                Ok(snap) if snap.status == OrderStatus::Filled => return Ok(Some(snap)),
                Ok(snap) if snap.status.is_dead() => {
                    warn!("{}: entry {} is {}", symbol, order, snap.status);
                    return Ok(None);
                }
                Ok(snap) => last_status = snap.status,
                Err(e) if e.is_transient() => warn!("{}: entry status query failed: {}", symbol, e),
                Err(e) => return Err(self.withdraw_entry(symbol, order, e).await),
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        info!(
            "{}: entry not filled within {}s, cancelling {}",
            symbol,
            self.settings.wait_timeout.as_secs(),
            order
        );
        if let Err(e) = self.broker.cancel_order(symbol, order).await {
            warn!("{}: could not cancel entry {}: {}", symbol, order, e);
        }
        if last_status == OrderStatus::PartiallyFilled {
            return Err(unprotected(
                symbol,
                format!("entry {} partially filled before timeout", order),
            ));
        }
        Ok(None)
    }

    /// Cancels an entry whose status could not be read. The entry may be live
    /// or filled if the cancel fails too.
    async fn withdraw_entry(&self, symbol: &str, order: &OrderRef, cause: Error) -> Error {
        warn!("{}: entry {} status query failed, cancelling: {}", symbol, order, cause);
        match self.broker.cancel_order(symbol, order).await {
            Ok(()) => cause,
            Err(e) => unprotected(
                symbol,
                format!(
                    "entry {} status unknown ({}) and cancel failed ({}); it may be live or filled",
                    order, cause, e
                ),
            ),
        }
    }
}

fn unprotected(symbol: &str, detail: String) -> Error {
    error!("{}: POSITION OPEN WITHOUT PROTECTION: {}", symbol, detail);
    Error::UnprotectedPosition {
        symbol: symbol.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn precision(step: f64, min_qty: f64) -> SymbolPrecision {
        SymbolPrecision {
            tick_size: 0.01,
            step_size: step,
            min_qty,
        }
    }

    #[test]
    fn last_tier_takes_the_remainder() {
        let parts = split_quantity(1.0, &[0.5, 0.25, 0.125, 0.125], &precision(0.01, 0.01)).unwrap();
        assert_eq!(parts, vec![0.5, 0.25, 0.12, 0.13]);
        assert!((parts.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn single_tier_gets_everything() {
        assert_eq!(split_quantity(3.0, &[1.0], &precision(1.0, 1.0)), Some(vec![3.0]));
    }

    #[test]
    fn too_small_to_split() {
        assert_eq!(split_quantity(3.0, &[0.5, 0.25, 0.125, 0.125], &precision(1.0, 1.0)), None);
        assert_eq!(split_quantity(1.0, &[], &precision(1.0, 1.0)), None);
    }
}
