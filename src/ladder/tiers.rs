use serde::{Deserialize, Serialize};

use crate::signals::Signal;

/// Share of the *remaining* position each standard tier closes.
pub const STANDARD_CLOSE_FRACTIONS: [f64; 4] = [0.50, 0.50, 0.50, 1.00];

/// Where the protective stop goes after a tier fills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "price", rename_all = "snake_case")]
pub enum StopMove {
    None,
    /// Resolved to the entry fill price at the time the tier fills.
    Breakeven,
    Price(f64),
}

impl StopMove {
    pub fn resolve(&self, entry_price: f64) -> Option<f64> {
        match self {
            StopMove::None => None,
            StopMove::Breakeven => Some(entry_price),
            StopMove::Price(p) => Some(*p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitTier {
    pub price: f64,
    pub close_fraction: f64,
    pub new_stop: StopMove,
}

/// Ordered take-profit tiers. Always non-empty; the last tier closes everything left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderPlan {
    tiers: Vec<ExitTier>,
}

impl LadderPlan {
    /// 50% -> stop to entry, 50% of rest -> stop to TP1, 50% of rest -> stop to TP2,
    /// rest -> stop to TP3. Fewer than four prices are padded with the last one.
    /// Returns `None` when `take_profits` is empty.
    pub fn standard(take_profits: &[f64]) -> Option<Self> {
        let last = *take_profits.last()?;
        let mut prices = [last; 4];
        for (slot, tp) in prices.iter_mut().zip(take_profits) {
            *slot = *tp;
        }

        let stops = [
            StopMove::Breakeven,
            StopMove::Price(prices[0]),
            StopMove::Price(prices[1]),
            StopMove::Price(prices[2]),
        ];

        let tiers = prices
            .iter()
            .zip(STANDARD_CLOSE_FRACTIONS)
            .zip(stops)
            .map(|((&price, close_fraction), new_stop)| ExitTier {
                price,
                close_fraction,
                new_stop,
            })
            .collect();
        Some(Self { tiers })
    }

    /// One tier closing 100% at `price` with no stop relocation.
    pub fn single(price: f64) -> Self {
        Self {
            tiers: vec![ExitTier {
                price,
                close_fraction: 1.0,
                new_stop: StopMove::None,
            }],
        }
    }

    /// Standard ladder when enabled, otherwise a single target at the first TP.
    pub fn for_signal(signal: &Signal, use_ladder: bool) -> Self {
        let tps = signal.take_profits();
        if use_ladder {
            if let Some(plan) = Self::standard(tps) {
                return plan;
            }
        }
        Self::single(tps.first().copied().unwrap_or(signal.entry()))
    }

    pub fn tiers(&self) -> &[ExitTier] {
        &self.tiers
    }

    pub fn tier(&self, index: usize) -> Option<&ExitTier> {
        self.tiers.get(index)
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Share of the *original* position each tier closes, e.g. 0.5/0.25/0.125/0.125.
    pub fn original_fractions(&self) -> Vec<f64> {
        let mut remaining = 1.0;
        self.tiers
            .iter()
            .map(|t| {
                let closed = remaining * t.close_fraction;
                remaining -= closed;
                closed
            })
            .collect()
    }
}
