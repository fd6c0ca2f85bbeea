use concord_core::TaskKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const KINDS: [TaskKind; 4] = [
    TaskKind::Research,
    TaskKind::ToolExecution,
    TaskKind::Synthesis,
    TaskKind::Validation,
];

/// Counters tracked per task kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    /// Work items started.
    pub dispatched: u32,
    /// Work items that completed.
    pub completed: u32,
    /// Work items that failed.
    pub failed: u32,
    /// Internal errors while driving items.
    pub errors: u32,
    /// Total run time of finished items, in milliseconds.
    pub duration_ms: u64,
}

/// Real-time view of one task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindState {
    /// Task kind this state tracks.
    pub kind: TaskKind,
    /// Work items of this kind currently running.
    pub active: BTreeSet<Uuid>,
    /// Counters of this kind.
    pub metrics: DispatchMetrics,
}

/// Tracks dispatched work items per task kind.
pub struct DispatchMonitor {
    states: Arc<RwLock<HashMap<TaskKind, KindState>>>,
}

impl DispatchMonitor {
    /// Create a monitor with an empty state per kind.
    pub fn new() -> Self {
        let states = KINDS
            .iter()
            .map(|kind| {
                (
                    *kind,
                    KindState {
                        kind: *kind,
                        active: BTreeSet::new(),
                        metrics: DispatchMetrics::default(),
                    },
                )
            })
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Mark a work item as running.
    pub async fn start_task(&self, kind: TaskKind, work_id: Uuid) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.active.insert(work_id);
            state.metrics.dispatched += 1;
        }
    }

    /// Mark a work item as terminal.
    pub async fn finish_task(&self, kind: TaskKind, work_id: Uuid, success: bool, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.active.remove(&work_id);
            if success {
                state.metrics.completed += 1;
            } else {
                state.metrics.failed += 1;
            }
            state.metrics.duration_ms += duration_ms;
        }
    }

    /// Record an internal error while driving a work item.
    pub async fn record_error(&self, kind: TaskKind) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.metrics.errors += 1;
        }
    }

    /// All kinds, in a fixed order.
    pub async fn snapshot(&self) -> Vec<KindState> {
        let states = self.states.read().await;
        KINDS.iter().filter_map(|k| states.get(k).cloned()).collect()
    }

    /// Current state of one kind.
    pub async fn get_state(&self, kind: TaskKind) -> Option<KindState> {
        let states = self.states.read().await;
        states.get(&kind).cloned()
    }

    /// Number of work items currently running.
    pub async fn active_count(&self) -> usize {
        let states = self.states.read().await;
        states.values().map(|s| s.active.len()).sum()
    }

    /// Counters summed over all kinds.
    pub async fn aggregate_metrics(&self) -> DispatchMetrics {
        let states = self.states.read().await;
        let mut total = DispatchMetrics::default();
        for state in states.values() {
            total.dispatched += state.metrics.dispatched;
            total.completed += state.metrics.completed;
            total.failed += state.metrics.failed;
            total.errors += state.metrics.errors;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let kinds = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "kinds": kinds,
            "aggregate": aggregate,
        })
    }
}

impl Default for DispatchMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let monitor = DispatchMonitor::new();
        let states = monitor.snapshot().await;
        assert_eq!(states.len(), 4);
        assert!(states.iter().all(|s| s.active.is_empty()));
        assert_eq!(monitor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_and_finish() {
        let monitor = DispatchMonitor::new();
        let id = Uuid::new_v4();
        monitor.start_task(TaskKind::Research, id).await;
        assert_eq!(monitor.active_count().await, 1);

        monitor.finish_task(TaskKind::Research, id, true, 120).await;
        let state = monitor.get_state(TaskKind::Research).await.unwrap();
        assert!(state.active.is_empty());
        assert_eq!(state.metrics.dispatched, 1);
        assert_eq!(state.metrics.completed, 1);
        assert_eq!(state.metrics.duration_ms, 120);
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = DispatchMonitor::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        monitor.start_task(TaskKind::Research, a).await;
        monitor.start_task(TaskKind::Synthesis, b).await;
        monitor.finish_task(TaskKind::Research, a, false, 10).await;
        monitor.record_error(TaskKind::Synthesis).await;

        let agg = monitor.aggregate_metrics().await;
        assert_eq!(agg.dispatched, 2);
        assert_eq!(agg.failed, 1);
        assert_eq!(agg.errors, 1);

        let json = monitor.to_json().await;
        assert!(json["kinds"].is_array());
        assert_eq!(json["aggregate"]["dispatched"], 2);
    }
}
