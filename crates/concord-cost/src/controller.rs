use crate::prices::{HistoricalAverage, PriceTable};
use chrono::Utc;
use concord_core::{
    billing_period, Authorization, ConcordConfig, ConcordError, ConcordResult, CostEntry,
    CostEstimate, CostRecord, TaskKind, Tier, WorkSpecification,
};
use concord_store::StateStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Optimistic write attempts before giving up on a cost record update.
const MAX_RECORD_ATTEMPTS: u32 = 5;

/// Budget limits the controller enforces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    /// Largest estimate a single item may carry without confirmation.
    pub per_task_cost_limit: f64,
    /// Spend allowed per billing period.
    pub monthly_budget: f64,
    /// Estimates above this need explicit confirmation.
    pub confirmation_threshold: f64,
    /// Budget exhaustion asks for confirmation instead of denying.
    pub allow_budget_override: bool,
}

impl From<&ConcordConfig> for BudgetPolicy {
    fn from(config: &ConcordConfig) -> Self {
        Self {
            per_task_cost_limit: config.per_task_cost_limit,
            monthly_budget: config.monthly_budget,
            confirmation_threshold: config.confirmation_threshold,
            allow_budget_override: config.allow_budget_override,
        }
    }
}

/// Spend summary for one billing period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReport {
    /// Billing period, `YYYY-MM`.
    pub period: String,
    /// Configured budget.
    pub monthly_budget: f64,
    /// Actual spend so far.
    pub spent: f64,
    /// Budget left (never negative).
    pub remaining: f64,
    /// Estimated spend of the recorded items.
    pub estimated: f64,
    /// Actual spend per work item.
    pub per_task: BTreeMap<Uuid, f64>,
    /// Actual spend per task kind.
    pub per_kind: BTreeMap<String, f64>,
}

/// Gates dispatch against budgets and records actual spend.
pub struct CostController {
    store: Arc<dyn StateStore>,
    policy: BudgetPolicy,
    prices: PriceTable,
    history: Mutex<HashMap<(TaskKind, Tier), HistoricalAverage>>,
}

impl CostController {
    /// Create a controller with the default price table.
    pub fn new(store: Arc<dyn StateStore>, policy: BudgetPolicy) -> Self {
        Self::with_prices(store, policy, PriceTable::default())
    }

    /// Create a controller with a custom price table.
    pub fn with_prices(store: Arc<dyn StateStore>, policy: BudgetPolicy, prices: PriceTable) -> Self {
        Self {
            store,
            policy,
            prices,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// The enforced limits.
    pub fn policy(&self) -> BudgetPolicy {
        self.policy
    }

    /// The price table.
    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Seed the historical averages from the current period's record.
    pub async fn restore_history(&self) -> ConcordResult<usize> {
        let Some(record) = self.store.load_cost_record(&current_period()).await? else {
            return Ok(0);
        };
        let mut history = self.history.lock();
        history.clear();
        for entry in &record.entries {
            history
                .entry((entry.kind, entry.tier))
                .or_default()
                .observe(entry.actual);
        }
        info!(period = %record.period, entries = record.entries.len(), "Cost history restored");
        Ok(record.entries.len())
    }

    /// Predicted cost of running `spec` on `tier`.
    pub fn estimate(&self, spec: &WorkSpecification, tier: Tier) -> CostEstimate {
        let base = self.prices.price(spec.kind, tier);
        let amount = self
            .history
            .lock()
            .get(&(spec.kind, tier))
            .map_or(base, |avg| avg.blend(base));
        CostEstimate {
            work_id: Some(spec.id),
            kind: spec.kind,
            tier,
            amount,
        }
    }

    /// Actual spend of the current period.
    pub async fn spent(&self) -> ConcordResult<f64> {
        Ok(self
            .store
            .load_cost_record(&current_period())
            .await?
            .map_or(0.0, |r| r.total_actual))
    }

    /// Budget left in the current period.
    pub async fn remaining(&self) -> ConcordResult<f64> {
        Ok((self.policy.monthly_budget - self.spent().await?).max(0.0))
    }

    /// Decide whether an estimate may be dispatched.
    pub async fn authorize(&self, estimate: &CostEstimate) -> ConcordResult<Authorization> {
        let remaining = self.remaining().await?;
        Ok(self.decide(estimate.amount, remaining))
    }

    /// Authorize a whole plan. Earlier estimates are charged against the
    /// budget seen by later ones.
    pub async fn authorize_batch(
        &self,
        estimates: &[CostEstimate],
    ) -> ConcordResult<Vec<Authorization>> {
        let mut remaining = self.remaining().await?;
        let mut decisions = Vec::with_capacity(estimates.len());
        for estimate in estimates {
            decisions.push(self.decide(estimate.amount, remaining));
            remaining = (remaining - estimate.amount).max(0.0);
        }
        Ok(decisions)
    }

    /// Check run before every iteration after the first: denies when the
    /// budget can no longer pay for one more iteration.
    pub async fn iteration_gate(&self, spec: &WorkSpecification) -> ConcordResult<Authorization> {
        let price = self.prices.price(spec.kind, spec.effective_tier());
        if price <= 0.0 {
            return Ok(Authorization::Allow);
        }
        let remaining = self.remaining().await?;
        if price > remaining && !self.policy.allow_budget_override {
            warn!(work_id = %spec.id, price, remaining, "Budget exhausted mid-run");
            return Ok(Authorization::Deny {
                reason: format!(
                    "monthly budget exhausted: next iteration costs ${price:.2}, ${remaining:.2} left"
                ),
            });
        }
        Ok(Authorization::Allow)
    }

    fn decide(&self, amount: f64, remaining: f64) -> Authorization {
        if amount <= 0.0 {
            return Authorization::Allow;
        }
        if remaining <= 0.0 {
            let reason = format!("monthly budget exhausted, estimated ${amount:.2}");
            return if self.policy.allow_budget_override {
                Authorization::RequireConfirmation { reason }
            } else {
                Authorization::Deny { reason }
            };
        }
        if amount > remaining {
            return Authorization::RequireConfirmation {
                reason: format!(
                    "estimated ${amount:.2} exceeds the remaining monthly budget of ${remaining:.2}"
                ),
            };
        }
        if amount > self.policy.per_task_cost_limit {
            return Authorization::RequireConfirmation {
                reason: format!(
                    "estimated ${amount:.2} exceeds the per-task limit of ${:.2}",
                    self.policy.per_task_cost_limit
                ),
            };
        }
        if amount > self.policy.confirmation_threshold {
            return Authorization::RequireConfirmation {
                reason: format!(
                    "estimated ${amount:.2} is above the confirmation threshold of ${:.2}",
                    self.policy.confirmation_threshold
                ),
            };
        }
        Authorization::Allow
    }

    /// Record the spend of a finished item and fold it into the history.
    ///
    /// Concurrent writers are resolved by re-reading and retrying on
    /// version conflicts.
    pub async fn record_actual(&self, spec: &WorkSpecification, actual: f64) -> ConcordResult<CostRecord> {
        let tier = spec.effective_tier();
        let entry = CostEntry {
            work_id: spec.id,
            kind: spec.kind,
            tier,
            estimated: spec.estimated_cost.unwrap_or(actual),
            actual,
            recorded_at: Utc::now(),
        };
        let period = billing_period(entry.recorded_at);

        let mut attempt = 0;
        let stored = loop {
            attempt += 1;
            let mut record = self
                .store
                .load_cost_record(&period)
                .await?
                .unwrap_or_else(|| CostRecord::new(period.clone()));
            record.add(entry.clone());
            match self.store.save_cost_record(&record).await {
                Ok(stored) => break stored,
                Err(ConcordError::VersionConflict { .. }) if attempt < MAX_RECORD_ATTEMPTS => {
                    info!(period = %period, attempt, "Cost record changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        };

        self.history
            .lock()
            .entry((spec.kind, tier))
            .or_default()
            .observe(actual);
        info!(
            work_id = %spec.id,
            tier = %tier,
            actual,
            total = stored.total_actual,
            "Spend recorded"
        );
        Ok(stored)
    }

    /// Spend summary of the current period.
    pub async fn report(&self) -> ConcordResult<CostReport> {
        let period = current_period();
        let record = self
            .store
            .load_cost_record(&period)
            .await?
            .unwrap_or_else(|| CostRecord::new(period.clone()));

        let mut per_task = BTreeMap::new();
        let mut per_kind = BTreeMap::new();
        for entry in &record.entries {
            *per_task.entry(entry.work_id).or_insert(0.0) += entry.actual;
            *per_kind.entry(entry.kind.to_string()).or_insert(0.0) += entry.actual;
        }
        Ok(CostReport {
            period,
            monthly_budget: self.policy.monthly_budget,
            spent: record.total_actual,
            remaining: (self.policy.monthly_budget - record.total_actual).max(0.0),
            estimated: record.total_estimated,
            per_task,
            per_kind,
        })
    }
}

fn current_period() -> String {
    billing_period(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_store::MemoryStateStore;

    fn policy() -> BudgetPolicy {
        BudgetPolicy {
            per_task_cost_limit: 0.50,
            monthly_budget: 20.0,
            confirmation_threshold: 0.25,
            allow_budget_override: false,
        }
    }

    fn controller(policy: BudgetPolicy) -> CostController {
        CostController::new(Arc::new(MemoryStateStore::new()), policy)
    }

    fn estimate(amount: f64) -> CostEstimate {
        CostEstimate {
            work_id: None,
            kind: TaskKind::Research,
            tier: Tier::Remote,
            amount,
        }
    }

    #[tokio::test]
    async fn test_authorize_thresholds() {
        let cost = controller(policy());
        assert_eq!(cost.authorize(&estimate(0.10)).await.unwrap(), Authorization::Allow);
        assert!(matches!(
            cost.authorize(&estimate(0.30)).await.unwrap(),
            Authorization::RequireConfirmation { .. }
        ));
        let auth = cost.authorize(&estimate(0.80)).await.unwrap();
        match auth {
            Authorization::RequireConfirmation { reason } => assert!(reason.contains("per-task")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deny_only_on_exhaustion() {
        let cost = controller(BudgetPolicy {
            monthly_budget: 0.0,
            ..policy()
        });
        assert!(matches!(
            cost.authorize(&estimate(0.04)).await.unwrap(),
            Authorization::Deny { .. }
        ));
        // Free work still runs on an empty budget.
        assert_eq!(cost.authorize(&estimate(0.0)).await.unwrap(), Authorization::Allow);

        let cost = controller(BudgetPolicy {
            monthly_budget: 0.0,
            allow_budget_override: true,
            ..policy()
        });
        assert!(matches!(
            cost.authorize(&estimate(0.04)).await.unwrap(),
            Authorization::RequireConfirmation { .. }
        ));
    }

    #[tokio::test]
    async fn test_batch_charges_earlier_items() {
        let cost = controller(BudgetPolicy {
            monthly_budget: 0.10,
            ..policy()
        });
        let decisions = cost
            .authorize_batch(&[estimate(0.04), estimate(0.04), estimate(0.04)])
            .await
            .unwrap();
        assert_eq!(decisions[0], Authorization::Allow);
        assert_eq!(decisions[1], Authorization::Allow);
        assert!(matches!(decisions[2], Authorization::RequireConfirmation { .. }));

        // Once earlier items use up the budget, later ones are denied.
        let cost = controller(BudgetPolicy {
            monthly_budget: 0.5,
            ..policy()
        });
        let decisions = cost
            .authorize_batch(&[estimate(0.25), estimate(0.25), estimate(0.04)])
            .await
            .unwrap();
        assert_eq!(decisions[1], Authorization::Allow);
        assert!(matches!(decisions[2], Authorization::Deny { .. }));
    }

    #[tokio::test]
    async fn test_partial_budget_asks_for_confirmation() {
        let cost = controller(BudgetPolicy {
            monthly_budget: 0.03,
            ..policy()
        });
        match cost.authorize(&estimate(0.04)).await.unwrap() {
            Authorization::RequireConfirmation { reason } => {
                assert!(reason.contains("remaining monthly budget"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_record_actual_updates_history_and_report() {
        let cost = controller(policy());
        let mut spec = WorkSpecification::new(TaskKind::Research, "flights");
        spec.tier = Some(Tier::Remote);
        let base = cost.estimate(&spec, Tier::Remote).amount;

        cost.record_actual(&spec, 0.12).await.unwrap();
        let blended = cost.estimate(&spec, Tier::Remote).amount;
        assert!((blended - (base + 0.12) / 2.0).abs() < 1e-9);

        let report = cost.report().await.unwrap();
        assert!((report.spent - 0.12).abs() < 1e-9);
        assert!((report.remaining - 19.88).abs() < 1e-9);
        assert_eq!(report.per_task.len(), 1);
        assert!(report.per_kind.contains_key("research"));
    }

    #[tokio::test]
    async fn test_concurrent_records_are_all_kept() {
        let cost = Arc::new(controller(policy()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cost = Arc::clone(&cost);
            handles.push(tokio::spawn(async move {
                let spec = WorkSpecification::new(TaskKind::Validation, "check");
                cost.record_actual(&spec, 0.01).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        let report = cost.report().await.unwrap();
        assert_eq!(report.per_task.len(), ok);
        assert!((report.spent - 0.01 * ok as f64).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_iteration_gate() {
        let cost = controller(BudgetPolicy {
            monthly_budget: 0.01,
            ..policy()
        });
        let mut spec = WorkSpecification::new(TaskKind::Research, "x");
        spec.tier = Some(Tier::Remote);
        assert!(matches!(
            cost.iteration_gate(&spec).await.unwrap(),
            Authorization::Deny { .. }
        ));
        spec.tier = Some(Tier::Local);
        assert_eq!(cost.iteration_gate(&spec).await.unwrap(), Authorization::Allow);
    }

    #[tokio::test]
    async fn test_restore_history() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = CostController::new(Arc::clone(&store), policy());
        let spec = WorkSpecification::new(TaskKind::Synthesis, "merge");
        first.record_actual(&spec, 0.30).await.unwrap();

        let second = CostController::new(store, policy());
        assert_eq!(second.restore_history().await.unwrap(), 1);
        assert_eq!(
            first.estimate(&spec, Tier::Remote).amount,
            second.estimate(&spec, Tier::Remote).amount
        );
    }
}
