use crate::retry::RetryPolicy;
use crate::solver::{effective_criteria, ExecutionContext, TaskSolver, ToolSweepSolver};
use crate::tool::ToolRegistry;
use concord_core::{
    Authorization, Checkpoint, ConcordConfig, ConcordError, ConcordResult, SuccessCriterion,
    ToolCall, ToolError, WorkResult, WorkSpecification, WorkStatus,
};
use concord_cost::CostController;
use concord_store::StateStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Failure tags written into [`WorkResult::reason`].
pub mod reasons {
    /// Cooperative cancellation.
    pub const CANCELLED: &str = "cancelled";
    /// The wall-clock limit passed.
    pub const TIMED_OUT: &str = "timed_out";
    /// `max_iterations` ran without meeting every criterion.
    pub const ITERATIONS_EXHAUSTED: &str = "iterations_exhausted";
    /// The monthly budget cannot pay for another iteration.
    pub const BUDGET_EXHAUSTED: &str = "budget_exhausted";
}

/// Loop state carried from one iteration to the next.
///
/// Passed by value; everything except the deadline is also persisted in the
/// work item's progress, so a crashed loop can be rebuilt from the store.
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Iterations finished so far.
    pub iteration: u32,
    /// What the previous iterations learned.
    pub checkpoint: Checkpoint,
    /// Wall-clock limit of this run.
    pub deadline: Instant,
}

/// Why an iteration stopped before trying everything it planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Deadline,
}

/// Result of one iteration: the checkpoint it produced and whether it was cut
/// short.
struct IterationOutcome {
    checkpoint: Checkpoint,
    interrupted: Option<Interrupt>,
    passed: BTreeSet<usize>,
}

/// Runtime tuning.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Retries of transient tool errors.
    pub retry: RetryPolicy,
    /// Pause between failed iterations.
    pub iteration_backoff: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            iteration_backoff: Duration::from_millis(50),
        }
    }
}

impl RuntimeSettings {
    /// Settings derived from the engine configuration.
    pub fn from_config(config: &ConcordConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            iteration_backoff: Duration::from_millis(config.iteration_backoff_ms),
        }
    }
}

/// Executes one work item to a terminal state with a bounded
/// retry-with-fresh-context loop.
///
/// Per iteration: build a fresh [`ExecutionContext`], let the solver plan an
/// attempt, invoke tools (retrying transient errors), check the success
/// criteria, then either complete or persist a checkpoint and go again.
pub struct TaskAgentRuntime {
    store: Arc<dyn StateStore>,
    tools: Arc<ToolRegistry>,
    solver: Arc<dyn TaskSolver>,
    cost: Option<Arc<CostController>>,
    settings: RuntimeSettings,
}

impl TaskAgentRuntime {
    /// Runtime with the default [`ToolSweepSolver`] and no cost gating.
    pub fn new(store: Arc<dyn StateStore>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            store,
            tools,
            solver: Arc::new(ToolSweepSolver),
            cost: None,
            settings: RuntimeSettings::default(),
        }
    }

    /// Replace the default solver.
    pub fn with_solver(mut self, solver: Arc<dyn TaskSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Consult `cost` before every iteration after the first, and record
    /// actual spend at the end.
    pub fn with_cost_controller(mut self, cost: Arc<CostController>) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Override retry and backoff tuning.
    pub fn with_settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Registered tool providers.
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Work an item to a terminal state and return the stored copy.
    ///
    /// `assigned` items start fresh; `in_progress` items resume from their
    /// stored iteration and checkpoint; terminal items are returned as is.
    pub async fn run(
        &self,
        spec_id: Uuid,
        cancel: CancellationToken,
    ) -> ConcordResult<WorkSpecification> {
        let mut spec = self
            .store
            .load_work(spec_id)
            .await?
            .ok_or_else(|| ConcordError::NotFound(format!("work {spec_id}")))?;

        let deadline = Instant::now() + Duration::from_secs(spec.constraints.timeout_secs);
        let state = match spec.status() {
            WorkStatus::Completed | WorkStatus::Failed => return Ok(spec),
            WorkStatus::Pending => {
                return Err(ConcordError::Orchestrator(format!(
                    "work {spec_id} must be assigned before it can run"
                )));
            }
            WorkStatus::Assigned => {
                spec.begin()?;
                spec = self.store.update_work(&spec).await?;
                info!(work_id = %spec.id, tier = %spec.effective_tier(), "Task agent started");
                LoopState {
                    iteration: 0,
                    checkpoint: Checkpoint::at(0),
                    deadline,
                }
            }
            WorkStatus::InProgress => {
                let (resumed, state) = self.resume_state(spec, deadline).await?;
                spec = resumed;
                state
            }
        };

        self.drive(spec, state, cancel).await
    }

    async fn resume_state(
        &self,
        mut spec: WorkSpecification,
        deadline: Instant,
    ) -> ConcordResult<(WorkSpecification, LoopState)> {
        let iteration = spec.progress().iteration;
        if !spec.progress().checkpoint_intact() {
            error!(
                work_id = %spec.id,
                iteration,
                "Checkpoint digest mismatch, resuming from an empty checkpoint"
            );
            spec.reset_checkpoint()?;
            spec = self.store.update_work(&spec).await?;
        }
        let checkpoint = spec
            .progress()
            .last_checkpoint
            .clone()
            .unwrap_or_else(|| Checkpoint::at(iteration));
        info!(work_id = %spec.id, iteration, "Task agent resumed");
        Ok((
            spec,
            LoopState {
                iteration,
                checkpoint,
                deadline,
            },
        ))
    }

    async fn drive(
        &self,
        mut spec: WorkSpecification,
        mut state: LoopState,
        cancel: CancellationToken,
    ) -> ConcordResult<WorkSpecification> {
        let criteria = effective_criteria(&spec);

        loop {
            if cancel.is_cancelled() {
                return self.finish_failed(spec, &state, &criteria, reasons::CANCELLED).await;
            }
            if Instant::now() >= state.deadline {
                return self.finish_failed(spec, &state, &criteria, reasons::TIMED_OUT).await;
            }
            if state.iteration >= spec.constraints.max_iterations {
                return self
                    .finish_failed(spec, &state, &criteria, reasons::ITERATIONS_EXHAUSTED)
                    .await;
            }
            if state.iteration > 0 {
                if let Some(cost) = &self.cost {
                    if let Authorization::Deny { reason } = cost.iteration_gate(&spec).await? {
                        warn!(work_id = %spec.id, %reason, "Iteration denied by budget");
                        return self
                            .finish_failed(spec, &state, &criteria, reasons::BUDGET_EXHAUSTED)
                            .await;
                    }
                }
            }

            let number = state.iteration + 1;
            let ctx = ExecutionContext::fresh(&spec, &state.checkpoint, number);
            let outcome = self.iterate(&ctx, &criteria, state.deadline, &cancel).await;
            let mut next = LoopState {
                iteration: number,
                checkpoint: outcome.checkpoint,
                deadline: state.deadline,
            };

            if let Some(interrupt) = outcome.interrupted {
                let reason = match interrupt {
                    Interrupt::Cancelled => reasons::CANCELLED,
                    Interrupt::Deadline => reasons::TIMED_OUT,
                };
                return self.finish_failed(spec, &next, &criteria, reason).await;
            }

            if outcome.passed.len() == criteria.len() {
                let result = build_result(&spec, &next, &criteria, None);
                spec.complete(result)?;
                let stored = self.store.update_work(&spec).await?;
                info!(work_id = %stored.id, iterations = number, "Task agent completed");
                self.record_spend(&stored, number).await;
                return Ok(stored);
            }

            // Commit the checkpoint before the next iteration starts.
            next.checkpoint.iteration = number;
            spec.record_checkpoint(number, next.checkpoint.clone())?;
            spec = self.store.update_work(&spec).await?;
            info!(
                work_id = %spec.id,
                iteration = number,
                passed = outcome.passed.len(),
                required = criteria.len(),
                "Iteration did not meet all criteria, retrying with fresh context"
            );
            state = next;

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settings.iteration_backoff) => {}
            }
        }
    }

    /// One iteration. Tool calls already in flight are never aborted;
    /// cancellation and the deadline are checked before each call.
    async fn iterate(
        &self,
        ctx: &ExecutionContext,
        criteria: &[SuccessCriterion],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> IterationOutcome {
        let attempt = self.solver.plan(ctx);
        let mut checkpoint = ctx.checkpoint.clone();
        let mut interrupted = None;

        for (producer, output) in &attempt.produced {
            checkpoint.record_output(producer.clone(), output);
        }

        for call in &attempt.calls {
            if cancel.is_cancelled() {
                interrupted = Some(Interrupt::Cancelled);
                break;
            }
            if Instant::now() >= deadline {
                interrupted = Some(Interrupt::Deadline);
                break;
            }
            match self.invoke_with_retry(ctx, call, cancel).await {
                Ok(output) => checkpoint.record_output(call.name.clone(), &output),
                Err(ToolError::Permanent(reason)) => {
                    warn!(work_id = %ctx.work_id, tool = %call.name, %reason, "Tool failed permanently");
                    checkpoint.record_permanent_failure(call.name.clone(), &reason);
                    break;
                }
                Err(ToolError::Transient(reason)) => {
                    warn!(
                        work_id = %ctx.work_id,
                        tool = %call.name,
                        %reason,
                        "Tool still failing after retries, ending iteration"
                    );
                    checkpoint.note(format!("{} unavailable: {reason}", call.name));
                    break;
                }
            }
        }

        let passed = SuccessCriterion::evaluate_all(criteria, &checkpoint.outputs);
        checkpoint.passed_criteria = passed.clone();
        IterationOutcome {
            checkpoint,
            interrupted,
            passed,
        }
    }

    async fn invoke_with_retry(
        &self,
        ctx: &ExecutionContext,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let policy = &self.settings.retry;
        let mut attempt = 0;
        loop {
            match self.tools.invoke(call, &ctx.allowed_tools).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    let delay = policy.backoff(attempt);
                    info!(
                        work_id = %ctx.work_id,
                        tool = %call.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable tool error, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish_failed(
        &self,
        mut spec: WorkSpecification,
        state: &LoopState,
        criteria: &[SuccessCriterion],
        reason: &str,
    ) -> ConcordResult<WorkSpecification> {
        let result = build_result(&spec, state, criteria, Some(reason));
        spec.fail(result)?;
        let stored = self.store.update_work(&spec).await?;
        warn!(
            work_id = %stored.id,
            iteration = state.iteration,
            reason,
            "Task agent failed"
        );
        self.record_spend(&stored, state.iteration).await;
        Ok(stored)
    }

    async fn record_spend(&self, spec: &WorkSpecification, iterations: u32) {
        let Some(cost) = &self.cost else {
            return;
        };
        if iterations == 0 {
            return;
        }
        let actual = cost
            .prices()
            .actual_cost(spec.kind, spec.effective_tier(), iterations);
        if let Err(e) = cost.record_actual(spec, actual).await {
            warn!(work_id = %spec.id, error = %e, "Failed to record spend");
        }
    }
}

/// Terminal result from the best checkpoint available.
fn build_result(
    spec: &WorkSpecification,
    state: &LoopState,
    criteria: &[SuccessCriterion],
    reason: Option<&str>,
) -> WorkResult {
    let checkpoint = &state.checkpoint;
    let passed = SuccessCriterion::evaluate_all(criteria, &checkpoint.outputs);
    let confidence = if criteria.is_empty() {
        1.0
    } else {
        passed.len() as f64 / criteria.len() as f64
    };

    let mut caveats: Vec<String> = criteria
        .iter()
        .enumerate()
        .filter(|(i, _)| !passed.contains(i))
        .map(|(_, c)| format!("unmet: {}", c.description))
        .collect();
    caveats.extend(
        checkpoint
            .failed_tools
            .iter()
            .map(|t| format!("{t} failed permanently")),
    );
    if let Some(reason) = reason {
        caveats.push(reason.replace('_', " "));
    }

    let summary = if checkpoint.outputs.is_empty() {
        format!("No results for: {}", spec.description)
    } else {
        checkpoint
            .outputs
            .iter()
            .map(|(producer, output)| format!("{producer}: {output}"))
            .collect::<Vec<_>>()
            .join("; ")
    };

    WorkResult {
        summary,
        outputs: checkpoint.outputs.clone(),
        confidence,
        caveats,
        tier: spec.effective_tier(),
        iterations: state.iteration,
        cancelled: reason == Some(reasons::CANCELLED),
        reason: reason.map(str::to_string),
    }
}
