pub mod binance;

pub use binance::BinanceClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::models::{OrderSide, OrderStatus};

/// Exchange order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef(pub String);

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for OrderRef {
    fn from(id: u64) -> Self {
        OrderRef(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolPrecision {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
}

/// Point-in-time view of one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_fill_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed: positive long, negative short.
    pub amount: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// Raw order primitives of a futures broker. Protective orders are reduce-only.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;
    async fn symbol_precision(&self, symbol: &str) -> Result<SymbolPrecision>;
    /// Market order when `limit_price` is `None`, GTC limit otherwise.
    async fn place_entry_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        limit_price: Option<f64>,
    ) -> Result<OrderRef>;
    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderRef>;
    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderRef>;
    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<()>;
    async fn order_status(&self, symbol: &str, order: &OrderRef) -> Result<OrderSnapshot>;
    async fn position(&self, symbol: &str) -> Result<Option<PositionInfo>>;
}

fn decimals_for(step: f64) -> usize {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    (-step.log10()).round().max(0.0) as usize
}

/// Rounds `value` down to a multiple of `step`, trimming float noise.
pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step + 1e-9).floor();
    let decimals = decimals_for(step);
    let factor = 10f64.powi(decimals as i32);
    (steps * step * factor).round() / factor
}

/// Rounds a price to the nearest tick.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    let decimals = decimals_for(tick);
    let factor = 10f64.powi(decimals as i32);
    ((price / tick).round() * tick * factor).round() / factor
}

/// Formats a quantity or price with the decimals implied by `step`.
pub fn format_to_step(value: f64, step: f64) -> String {
    format!("{:.*}", decimals_for(step), value)
}
