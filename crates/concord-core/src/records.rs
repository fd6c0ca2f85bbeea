use crate::work::{TaskKind, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Predicted cost of running a work item on a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Work item the estimate is for, if it exists yet.
    pub work_id: Option<Uuid>,
    /// Kind of work.
    pub kind: TaskKind,
    /// Tier the estimate assumes.
    pub tier: Tier,
    /// Estimated spend in USD.
    pub amount: f64,
}

/// Decision of the cost controller for one estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Authorization {
    /// Dispatch may proceed.
    Allow,
    /// Dispatch must pause until the caller confirms.
    RequireConfirmation {
        /// Why confirmation is needed.
        reason: String,
    },
    /// Hard budget exhaustion with no override configured.
    Deny {
        /// Why the work cannot proceed.
        reason: String,
    },
}

impl Authorization {
    /// Whether dispatch may proceed without further input.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allow)
    }
}

/// A single spend entry inside a [`CostRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    /// Work item the spend belongs to.
    pub work_id: Uuid,
    /// Kind of work.
    pub kind: TaskKind,
    /// Tier it ran on.
    pub tier: Tier,
    /// Estimated spend at dispatch time.
    pub estimated: f64,
    /// Actual spend.
    pub actual: f64,
    /// When the spend was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Spend accumulator for one billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    /// Billing period key, `YYYY-MM`.
    pub period: String,
    /// Total actual spend in the period.
    pub total_actual: f64,
    /// Total estimated spend for recorded items.
    pub total_estimated: f64,
    /// Per-item entries.
    #[serde(default)]
    pub entries: Vec<CostEntry>,
    /// Store version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl CostRecord {
    /// An empty record for a period.
    pub fn new(period: impl Into<String>) -> Self {
        Self {
            period: period.into(),
            total_actual: 0.0,
            total_estimated: 0.0,
            entries: Vec::new(),
            version: 0,
        }
    }

    /// Add an entry and update the totals.
    pub fn add(&mut self, entry: CostEntry) {
        self.total_actual += entry.actual;
        self.total_estimated += entry.estimated;
        self.entries.push(entry);
    }
}

/// Billing period key (`YYYY-MM`, UTC) for a timestamp.
pub fn billing_period(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// A versioned, read-only state snapshot published by a cognitive agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CognitiveSnapshot {
    /// Publishing agent.
    pub agent_id: String,
    /// Monotonically increasing per agent.
    pub version: u64,
    /// Agent-specific payload.
    pub data: serde_json::Value,
    /// When this version was published.
    pub published_at: DateTime<Utc>,
}

impl CognitiveSnapshot {
    /// The version-zero snapshot every agent starts from.
    pub fn initial(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            version: 0,
            data: serde_json::Value::Null,
            published_at: Utc::now(),
        }
    }
}
