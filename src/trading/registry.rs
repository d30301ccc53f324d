use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::exchange::OrderRef;
use crate::models::OrderStatus;

pub type MonitorId = u64;

/// What a monitor reports about itself after each poll.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorProgress {
    pub stop_order: OrderRef,
    pub stop_status: OrderStatus,
    pub filled_tp_count: usize,
}

/// Read-only view of one running monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub id: MonitorId,
    pub symbol: String,
    pub stop_order_id: String,
    pub tp_order_ids: Vec<String>,
    pub filled_tp_count: usize,
    pub stop_status: OrderStatus,
    pub runtime_seconds: i64,
}

#[derive(Debug)]
struct MonitorEntry {
    symbol: String,
    stop_order: OrderRef,
    tp_orders: Vec<OrderRef>,
    filled_tp_count: usize,
    stop_status: OrderStatus,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Shared table of live monitors. Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct MonitorRegistry {
    entries: Arc<RwLock<HashMap<MonitorId, MonitorEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a monitor and hands back its id and stop token.
    pub async fn add(
        &self,
        symbol: &str,
        stop_order: OrderRef,
        tp_orders: Vec<OrderRef>,
    ) -> (MonitorId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        self.entries.write().await.insert(
            id,
            MonitorEntry {
                symbol: symbol.to_string(),
                stop_order,
                tp_orders,
                filled_tp_count: 0,
                stop_status: OrderStatus::New,
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    pub async fn update(&self, id: MonitorId, progress: MonitorProgress) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.stop_order = progress.stop_order;
            entry.stop_status = progress.stop_status;
            entry.filled_tp_count = progress.filled_tp_count;
        }
    }

    pub async fn remove(&self, id: MonitorId) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<MonitorSnapshot> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let mut rows: Vec<MonitorSnapshot> = entries
            .iter()
            .map(|(id, e)| MonitorSnapshot {
                id: *id,
                symbol: e.symbol.clone(),
                stop_order_id: e.stop_order.to_string(),
                tp_order_ids: e.tp_orders.iter().map(|o| o.to_string()).collect(),
                filled_tp_count: e.filled_tp_count,
                stop_status: e.stop_status,
                runtime_seconds: (now - e.started_at).num_seconds(),
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Signals one monitor to exit. Broker orders are left as they are.
    pub async fn stop(&self, id: MonitorId) -> bool {
        match self.entries.read().await.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Signals every monitor to exit. Returns how many were signalled.
    pub async fn stop_all(&self) -> usize {
        let entries = self.entries.read().await;
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        if !entries.is_empty() {
            info!("Stopping {} monitor(s)", entries.len());
        }
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_monitors_through_their_lifecycle() {
        let registry = MonitorRegistry::new();
        let (a, _) = registry
            .add("BTCUSDT", OrderRef::from(10), vec![OrderRef::from(11), OrderRef::from(12)])
            .await;
        let (b, _) = registry.add("ETHUSDT", OrderRef::from(20), vec![OrderRef::from(21)]).await;
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);

        registry
            .update(
                a,
                MonitorProgress {
                    stop_order: OrderRef::from(13),
                    stop_status: OrderStatus::New,
                    filled_tp_count: 1,
                },
            )
            .await;

        let rows = registry.snapshot().await;
        assert_eq!(rows[0].symbol, "BTCUSDT");
        assert_eq!(rows[0].stop_order_id, "13");
        assert_eq!(rows[0].tp_order_ids, vec!["11", "12"]);
        assert_eq!(rows[0].filled_tp_count, 1);
        assert!(rows[0].runtime_seconds >= 0);

        assert!(registry.remove(a).await);
        assert!(!registry.remove(a).await);
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_tokens() {
        let registry = MonitorRegistry::new();
        let (a, token_a) = registry.add("A", OrderRef::from(1), vec![]).await;
        let (_, token_b) = registry.add("B", OrderRef::from(2), vec![]).await;

        assert!(registry.stop(a).await);
        assert!(token_a.is_cancelled());
        assert!(!token_b.is_cancelled());
        assert!(!registry.stop(99).await);

        assert_eq!(registry.stop_all().await, 2);
        assert!(token_b.is_cancelled());
    }
}
