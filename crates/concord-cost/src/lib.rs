//! Cost control for the Concord engine.
//!
//! The [`CostController`] estimates the spend of a work item on a tier,
//! authorizes dispatch against per-task and monthly limits, and records actual
//! spend per billing period once items finish.

/// Estimation, authorization and spend recording.
pub mod controller;
/// Price table and historical averages.
pub mod prices;

pub use controller::{BudgetPolicy, CostController, CostReport};
pub use prices::{HistoricalAverage, PriceTable};
