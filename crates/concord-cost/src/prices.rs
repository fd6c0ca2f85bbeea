use concord_core::{TaskKind, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Base price of one iteration per `(TaskKind, Tier)`, in USD.
///
/// The local tier runs on-device and is free unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    remote: HashMap<TaskKind, f64>,
    local: HashMap<TaskKind, f64>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let remote = HashMap::from([
            (TaskKind::Research, 0.04),
            (TaskKind::ToolExecution, 0.02),
            (TaskKind::Synthesis, 0.06),
            (TaskKind::Validation, 0.02),
        ]);
        Self {
            remote,
            local: HashMap::new(),
        }
    }
}

impl PriceTable {
    /// Override the price of a `(kind, tier)` pair.
    pub fn with_price(mut self, kind: TaskKind, tier: Tier, price: f64) -> Self {
        match tier {
            Tier::Remote => self.remote.insert(kind, price),
            Tier::Local => self.local.insert(kind, price),
        };
        self
    }

    /// Price of one iteration.
    pub fn price(&self, kind: TaskKind, tier: Tier) -> f64 {
        let table = match tier {
            Tier::Remote => &self.remote,
            Tier::Local => &self.local,
        };
        table.get(&kind).copied().unwrap_or(0.0)
    }

    /// Spend of a finished item that used `iterations` iterations (at least one
    /// is always billed once the item started).
    pub fn actual_cost(&self, kind: TaskKind, tier: Tier, iterations: u32) -> f64 {
        self.price(kind, tier) * f64::from(iterations.max(1))
    }
}

/// Running average of actual spend for one `(kind, tier)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalAverage {
    /// Number of recorded items.
    pub samples: u64,
    /// Mean actual spend per item.
    pub mean: f64,
}

impl HistoricalAverage {
    /// Fold one more observation into the mean.
    pub fn observe(&mut self, actual: f64) {
        self.samples += 1;
        self.mean += (actual - self.mean) / self.samples as f64;
    }

    /// Blend a base price with the history: `(base + n*mean) / (n+1)`.
    pub fn blend(&self, base: f64) -> f64 {
        let n = self.samples as f64;
        (base + n * self.mean) / (n + 1.0)
    }
}
