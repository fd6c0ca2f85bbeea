use concord_core::{Checkpoint, SuccessCriterion, TaskKind, ToolCall, WorkSpecification};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Prefix of context facts that carry results of upstream work items.
pub const UPSTREAM_PREFIX: &str = "upstream.";
/// Producer name of outputs written by synthesis items.
pub const SYNTHESIS_OUTPUT: &str = "synthesis";

/// The fresh, minimal view one iteration works from.
///
/// Built from the work item's copied context and the previous checkpoint
/// only. Nothing from earlier iterations leaks in except through the
/// checkpoint.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Work item being executed.
    pub work_id: Uuid,
    /// Kind of the work item.
    pub kind: TaskKind,
    /// Sub-question the item answers, if any.
    pub domain: Option<String>,
    /// Instructions of the work item.
    pub description: String,
    /// Facts copied from the item context, upstream results included.
    pub facts: BTreeMap<String, serde_json::Value>,
    /// Criteria that decide completion.
    pub criteria: Vec<SuccessCriterion>,
    /// Tools this item may call.
    pub allowed_tools: BTreeSet<String>,
    /// Iteration about to run, starting at 1.
    pub iteration: u32,
    /// State carried over from the previous iteration.
    pub checkpoint: Checkpoint,
}

impl ExecutionContext {
    /// Build the context of `iteration` from the work item and the last checkpoint.
    pub fn fresh(spec: &WorkSpecification, checkpoint: &Checkpoint, iteration: u32) -> Self {
        Self {
            work_id: spec.id,
            kind: spec.kind,
            domain: spec.domain.clone(),
            description: spec.description.clone(),
            facts: spec.context.facts.clone(),
            criteria: effective_criteria(spec),
            allowed_tools: spec.constraints.allowed_tools.clone(),
            iteration,
            checkpoint: checkpoint.clone(),
        }
    }

    /// Upstream results copied into the context, keyed by sub-question.
    pub fn upstream(&self) -> BTreeMap<&str, &serde_json::Value> {
        self.facts
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(UPSTREAM_PREFIX).map(|name| (name, v)))
            .collect()
    }
}

/// Criteria the runtime checks. An item without explicit criteria must at
/// least produce one output.
pub fn effective_criteria(spec: &WorkSpecification) -> Vec<SuccessCriterion> {
    if spec.success_criteria.is_empty() {
        vec![SuccessCriterion::min_outputs(1)]
    } else {
        spec.success_criteria.clone()
    }
}

/// What one iteration will try.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attempt {
    /// Tool calls, made in order.
    pub calls: Vec<ToolCall>,
    /// Outputs produced without a tool, keyed by producer.
    pub produced: BTreeMap<String, String>,
}

/// Decides what an iteration attempts. Must be a pure function of the
/// context so that resuming from a checkpoint repeats the same work.
pub trait TaskSolver: Send + Sync {
    /// Attempt of the iteration described by `ctx`.
    fn plan(&self, ctx: &ExecutionContext) -> Attempt;
}

/// Calls every allowed tool that has not produced output yet and has not
/// failed permanently. Synthesis items merge upstream results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolSweepSolver;

impl TaskSolver for ToolSweepSolver {
    fn plan(&self, ctx: &ExecutionContext) -> Attempt {
        let mut attempt = Attempt::default();

        if ctx.kind == TaskKind::Synthesis {
            let upstream = ctx.upstream();
            if !upstream.is_empty() {
                let merged = upstream
                    .iter()
                    .map(|(name, value)| match value.as_str() {
                        Some(text) => format!("{name}: {text}"),
                        None => format!("{name}: {value}"),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                attempt.produced.insert(SYNTHESIS_OUTPUT.to_string(), merged);
            }
        }

        for tool in &ctx.allowed_tools {
            if ctx.checkpoint.outputs.contains_key(tool) || ctx.checkpoint.failed_tools.contains(tool) {
                continue;
            }
            attempt.calls.push(ToolCall::new(
                tool.clone(),
                serde_json::json!({
                    "query": ctx.description,
                    "domain": ctx.domain,
                    "context": ctx.facts,
                }),
            ));
        }
        attempt
    }
}
