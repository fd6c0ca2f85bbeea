use crate::request::Strategy;
use chrono::{DateTime, Utc};
use concord_core::{ConcordError, ConcordResult, WorkSpecification};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// One work item of a plan and the items it waits for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Work item of this node.
    pub work_id: Uuid,
    /// Sub-question the item answers, if any.
    pub domain: Option<String>,
    /// Items that must finish first.
    pub dependencies: Vec<Uuid>,
}

/// The router's output for one request: a set or DAG of work items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan id, shared by every work item of the plan.
    pub id: Uuid,
    /// Strategy the router picked.
    pub strategy: Strategy,
    nodes: Vec<PlanNode>,
    /// Creation time of the plan.
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Create an empty plan.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy,
            nodes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild a plan from its stored work items (crash recovery, late
    /// confirmation).
    pub fn from_specs(id: Uuid, specs: &[WorkSpecification]) -> Self {
        let strategy = if specs.iter().any(|s| !s.dependencies.is_empty()) {
            Strategy::Hybrid
        } else if specs.len() > 1 {
            Strategy::Parallel
        } else {
            Strategy::Single
        };
        let mut plan = Self {
            id,
            strategy,
            nodes: Vec::new(),
            created_at: specs
                .iter()
                .map(|s| s.created_at)
                .min()
                .unwrap_or_else(Utc::now),
        };
        let mut sorted: Vec<&WorkSpecification> = specs.iter().collect();
        sorted.sort_by_key(|s| (s.created_at, s.id));
        for spec in sorted {
            plan.add(spec);
        }
        plan
    }

    /// Add a work item.
    pub fn add(&mut self, spec: &WorkSpecification) {
        self.nodes.push(PlanNode {
            work_id: spec.id,
            domain: spec.domain.clone(),
            dependencies: spec.dependencies.clone(),
        });
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    /// Ids of all work items, in insertion order.
    pub fn work_ids(&self) -> Vec<Uuid> {
        self.nodes.iter().map(|n| n.work_id).collect()
    }

    /// Node of one work item.
    pub fn node(&self, id: Uuid) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.work_id == id)
    }

    /// Number of work items.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the plan has no work items.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Reject dangling dependencies and cycles.
    pub fn validate(&self) -> ConcordResult<()> {
        let ids: HashSet<Uuid> = self.nodes.iter().map(|n| n.work_id).collect();
        for node in &self.nodes {
            if let Some(missing) = node.dependencies.iter().find(|d| !ids.contains(d)) {
                return Err(ConcordError::Validation(format!(
                    "work {} depends on {missing}, which is not part of plan {}",
                    node.work_id, self.id
                )));
            }
        }
        if self.has_cycle() {
            return Err(ConcordError::Validation(format!(
                "dependency cycle detected in plan {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let deps: HashMap<Uuid, &[Uuid]> = self
            .nodes
            .iter()
            .map(|n| (n.work_id, n.dependencies.as_slice()))
            .collect();
        let mut visited = HashMap::new();
        deps.keys()
            .any(|&id| Self::dfs_cycle(&deps, id, &mut visited))
    }

    fn dfs_cycle(deps: &HashMap<Uuid, &[Uuid]>, id: Uuid, visited: &mut HashMap<Uuid, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // done
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(children) = deps.get(&id) {
            for dep in *children {
                if Self::dfs_cycle(deps, *dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Nodes not yet started whose dependencies are all terminal, in plan
    /// order.
    pub fn ready(&self, terminal: &HashSet<Uuid>, started: &HashSet<Uuid>) -> Vec<Uuid> {
        self.nodes
            .iter()
            .filter(|n| !started.contains(&n.work_id))
            .filter(|n| n.dependencies.iter().all(|d| terminal.contains(d)))
            .map(|n| n.work_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::TaskKind;

    fn spec(domain: &str) -> WorkSpecification {
        WorkSpecification::new(TaskKind::Research, domain).with_domain(domain)
    }

    #[test]
    fn test_hybrid_ready_order() {
        let weather = spec("weather");
        let hotels = spec("hotels");
        let synth = WorkSpecification::new(TaskKind::Synthesis, "combine")
            .with_dependencies(vec![weather.id, hotels.id]);

        let mut plan = ExecutionPlan::new(Strategy::Hybrid);
        for s in [&weather, &hotels, &synth] {
            plan.add(s);
        }
        plan.validate().unwrap();

        let mut terminal = HashSet::new();
        let mut started = HashSet::new();
        assert_eq!(plan.ready(&terminal, &started), vec![weather.id, hotels.id]);

        started.extend([weather.id, hotels.id]);
        terminal.insert(weather.id);
        assert!(plan.ready(&terminal, &started).is_empty());

        terminal.insert(hotels.id);
        assert_eq!(plan.ready(&terminal, &started), vec![synth.id]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut a = spec("a");
        let mut b = spec("b");
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];
        let mut plan = ExecutionPlan::new(Strategy::Hybrid);
        plan.add(&a);
        plan.add(&b);
        assert!(plan.has_cycle());
        assert!(matches!(plan.validate(), Err(ConcordError::Validation(_))));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let a = spec("a").with_dependencies(vec![Uuid::new_v4()]);
        let mut plan = ExecutionPlan::new(Strategy::Single);
        plan.add(&a);
        assert!(!plan.has_cycle());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_from_specs_infers_strategy() {
        let a = spec("a");
        let b = spec("b");
        let id = Uuid::new_v4();
        assert_eq!(ExecutionPlan::from_specs(id, &[a.clone()]).strategy, Strategy::Single);
        assert_eq!(
            ExecutionPlan::from_specs(id, &[a.clone(), b.clone()]).strategy,
            Strategy::Parallel
        );
        let c = spec("c").with_dependencies(vec![a.id]);
        let plan = ExecutionPlan::from_specs(id, &[c, b, a]);
        assert_eq!(plan.strategy, Strategy::Hybrid);
        assert_eq!(plan.id, id);
        assert_eq!(plan.len(), 3);
    }
}
