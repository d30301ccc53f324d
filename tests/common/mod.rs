#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use signal_autotrader::error::{Error, Result};
use signal_autotrader::exchange::{Broker, OrderRef, OrderSnapshot, PositionInfo, SymbolPrecision};
use signal_autotrader::models::{Candle, CandleSeries, OrderSide, OrderStatus};

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Entry,
    Stop,
    TakeProfit,
}

#[derive(Debug, Clone)]
pub struct MockOrder {
    pub id: OrderRef,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub avg_fill_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MockState {
    next_id: u64,
    market_price: f64,
    fill_entries: bool,
    fail_stop: bool,
    fail_tp_at: Option<usize>,
    fail_cancels: bool,
    fail_status: bool,
    leverage_calls: Vec<(String, u32)>,
    cancel_calls: Vec<OrderRef>,
    orders: Vec<MockOrder>,
}

/// In-memory broker. Orders stay where the test puts them.
#[derive(Debug)]
pub struct MockBroker {
    precision: SymbolPrecision,
    state: Mutex<MockState>,
}

impl MockBroker {
    /// Entries fill immediately at `market_price`.
    pub fn new(market_price: f64) -> Self {
        Self {
            precision: SymbolPrecision {
                tick_size: 0.01,
                step_size: 0.001,
                min_qty: 0.001,
            },
            state: Mutex::new(MockState {
                next_id: 1000,
                market_price,
                fill_entries: true,
                fail_stop: false,
                fail_tp_at: None,
                fail_cancels: false,
                fail_status: false,
                leverage_calls: Vec::new(),
                cancel_calls: Vec::new(),
                orders: Vec::new(),
            }),
        }
    }

    pub fn never_fill_entries(self) -> Self {
        self.state.lock().unwrap().fill_entries = false;
        self
    }

    pub fn fail_stop_placement(self) -> Self {
        self.state.lock().unwrap().fail_stop = true;
        self
    }

    /// Fails the take profit with this 0-based index.
    pub fn fail_tp_placement(self, index: usize) -> Self {
        self.state.lock().unwrap().fail_tp_at = Some(index);
        self
    }

    pub fn fail_cancels(self) -> Self {
        self.state.lock().unwrap().fail_cancels = true;
        self
    }

    /// Every status query is rejected with HTTP 400.
    pub fn fail_status_queries(self) -> Self {
        self.state.lock().unwrap().fail_status = true;
        self
    }

    pub fn orders(&self, kind: OrderKind) -> Vec<MockOrder> {
        self.state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.kind == kind)
            .cloned()
            .collect()
    }

    pub fn order(&self, id: &OrderRef) -> Option<MockOrder> {
        self.state.lock().unwrap().orders.iter().find(|o| &o.id == id).cloned()
    }

    pub fn cancel_calls(&self) -> Vec<OrderRef> {
        self.state.lock().unwrap().cancel_calls.clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().leverage_calls.clone()
    }

    pub fn set_status(&self, id: &OrderRef, status: OrderStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(o) = state.orders.iter_mut().find(|o| &o.id == id) {
            o.status = status;
            o.updated_at = Utc::now();
            if status == OrderStatus::Filled {
                o.avg_fill_price = o.price;
            }
        }
    }

    pub fn fill(&self, id: &OrderRef) {
        self.set_status(id, OrderStatus::Filled);
    }

    fn place(&self, kind: OrderKind, side: OrderSide, quantity: f64, price: Option<f64>) -> OrderRef {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = OrderRef::from(state.next_id);
        let (status, avg_fill_price) = if kind == OrderKind::Entry && state.fill_entries {
            (OrderStatus::Filled, Some(price.unwrap_or(state.market_price)))
        } else {
            (OrderStatus::New, None)
        };
        state.orders.push(MockOrder {
            id: id.clone(),
            kind,
            side,
            quantity,
            price,
            status,
            avg_fill_price,
            updated_at: Utc::now(),
        });
        id
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .leverage_calls
            .push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn symbol_precision(&self, _symbol: &str) -> Result<SymbolPrecision> {
        Ok(self.precision)
    }

    async fn place_entry_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: f64,
        limit_price: Option<f64>,
    ) -> Result<OrderRef> {
        Ok(self.place(OrderKind::Entry, side, quantity, limit_price))
    }

    async fn place_stop_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderRef> {
        if self.state.lock().unwrap().fail_stop {
            return Err(Error::BrokerStatus {
                status: 400,
                body: "stop rejected".into(),
            });
        }
        Ok(self.place(OrderKind::Stop, side, quantity, Some(stop_price)))
    }

    async fn place_take_profit_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderRef> {
        let placed = self.orders(OrderKind::TakeProfit).len();
        if self.state.lock().unwrap().fail_tp_at == Some(placed) {
            return Err(Error::BrokerStatus {
                status: 400,
                body: "take profit rejected".into(),
            });
        }
        Ok(self.place(OrderKind::TakeProfit, side, quantity, Some(price)))
    }

    async fn cancel_order(&self, _symbol: &str, order: &OrderRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancel_calls.push(order.clone());
        if state.fail_cancels {
            return Err(Error::Broker("cancel refused".into()));
        }
        let Some(o) = state.orders.iter_mut().find(|o| &o.id == order) else {
            return Err(Error::Broker(format!("unknown order {}", order)));
        };
        if !o.status.is_active() {
            return Err(Error::Broker(format!("order {} is {}", order, o.status)));
        }
        o.status = OrderStatus::Canceled;
        o.updated_at = Utc::now();
        Ok(())
    }

    async fn order_status(&self, _symbol: &str, order: &OrderRef) -> Result<OrderSnapshot> {
        let state = self.state.lock().unwrap();
        if state.fail_status {
            return Err(Error::BrokerStatus {
                status: 400,
                body: "Timestamp for this request is outside of the recvWindow. (code -1021)".into(),
            });
        }
        let o = state
            .orders
            .iter()
            .find(|o| &o.id == order)
            .ok_or_else(|| Error::Broker(format!("unknown order {}", order)))?;
        Ok(OrderSnapshot {
            status: o.status,
            executed_qty: if o.status == OrderStatus::Filled { o.quantity } else { 0.0 },
            avg_fill_price: o.avg_fill_price,
            updated_at: o.updated_at,
        })
    }

    async fn position(&self, symbol: &str) -> Result<Option<PositionInfo>> {
        let state = self.state.lock().unwrap();
        let entry = state
            .orders
            .iter()
            .find(|o| o.kind == OrderKind::Entry && o.status == OrderStatus::Filled);
        Ok(entry.map(|o| PositionInfo {
            symbol: symbol.to_string(),
            amount: match o.side {
                OrderSide::Buy => o.quantity,
                OrderSide::Sell => -o.quantity,
            },
            entry_price: o.avg_fill_price.unwrap_or(state.market_price),
            unrealized_pnl: 0.0,
        }))
    }
}

/// Historical bars keyed by symbol. Unknown symbols have no data.
pub struct StaticPriceSource {
    pub bars: HashMap<String, CandleSeries>,
}

#[async_trait]
impl signal_autotrader::backtesting::HistoricalPriceSource for StaticPriceSource {
    async fn fetch_minute_bars(
        &self,
        symbol: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        Ok(self.bars.get(symbol).cloned().unwrap_or_else(|| CandleSeries::new(Vec::new())))
    }
}
