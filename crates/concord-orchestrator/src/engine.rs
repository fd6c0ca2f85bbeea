use crate::inline::{InlineContext, InlineResponder, TemplateResponder};
use crate::monitor::DispatchMonitor;
use crate::plan::ExecutionPlan;
use crate::request::{ConfirmationDetails, Outcome, PendingCharge, Request, Response, Strategy};
use crate::router::{ExecutionRouter, Routing, TierRequest};
use crate::synthesis::{JoinInterruption, Synthesizer};
use chrono::Utc;
use concord_agent::{
    reasons, RuntimeSettings, TaskAgentRuntime, TaskSolver, ToolRegistry, UPSTREAM_PREFIX,
};
use concord_core::{
    Authorization, ConcordConfig, ConcordError, ConcordResult, ConfirmationRecord, ContextSnapshot,
    CostGate, TaskKind, Tier, ToolCall, WorkResult, WorkSpecification, WorkStatus,
};
use concord_cost::{BudgetPolicy, CostController, CostReport, PriceTable};
use concord_mesh::{
    MeshObserver, Observation, SnapshotBoard, AFFECT_AGENT, MEMORY_AGENT, TRAJECTORY_AGENT,
    USER_PATTERNS_AGENT,
};
use concord_store::{Archive, StateStore};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long in-flight items get to observe a cancellation before they are
/// aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Failure tag of items that never started because the join ended.
const NOT_DISPATCHED: &str = "timed out before dispatch";

/// What a worker task hands back to the join loop.
struct Joined {
    work_id: Uuid,
    kind: TaskKind,
    duration_ms: u64,
    result: ConcordResult<WorkSpecification>,
}

/// Outcome of preparing one ready node.
enum Prepared {
    /// Already terminal, or failed before dispatch.
    Settled(WorkSpecification),
    /// Still waiting for a confirmation; left untouched.
    Held(WorkSpecification),
    Dispatch(WorkSpecification),
}

/// Items of a plan after the join.
struct JoinReport {
    results: Vec<WorkSpecification>,
    interruption: Option<JoinInterruption>,
}

/// Summary of a [`Orchestrator::recover`] pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Items found assigned or in progress and driven again.
    pub resumed: usize,
    /// Plans left waiting for a confirmation.
    pub awaiting_confirmation: Vec<Uuid>,
    /// One response per recovered plan.
    pub responses: Vec<Response>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: ConcordConfig,
    store: Arc<dyn StateStore>,
    tools: Arc<ToolRegistry>,
    solver: Option<Arc<dyn TaskSolver>>,
    responder: Arc<dyn InlineResponder>,
    prices: PriceTable,
    board: Option<Arc<SnapshotBoard>>,
    observer: Option<MeshObserver>,
}

impl OrchestratorBuilder {
    /// Read context from a running cognitive mesh and report to it.
    pub fn with_mesh(mut self, board: Arc<SnapshotBoard>, observer: MeshObserver) -> Self {
        self.board = Some(board);
        self.observer = Some(observer);
        self
    }

    /// Replace the default tool-sweep solver of the task agents.
    pub fn with_solver(mut self, solver: Arc<dyn TaskSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Replace the template answers of inline requests.
    pub fn with_responder(mut self, responder: Arc<dyn InlineResponder>) -> Self {
        self.responder = responder;
        self
    }

    /// Replace the default per-tier prices.
    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    /// Validate the configuration and assemble the orchestrator.
    pub fn build(self) -> ConcordResult<Orchestrator> {
        self.config.validate()?;
        let router = ExecutionRouter::new(&self.config)?;
        let cost = Arc::new(CostController::with_prices(
            Arc::clone(&self.store),
            BudgetPolicy::from(&self.config),
            self.prices,
        ));
        let mut runtime = TaskAgentRuntime::new(Arc::clone(&self.store), Arc::clone(&self.tools))
            .with_settings(RuntimeSettings::from_config(&self.config))
            .with_cost_controller(Arc::clone(&cost));
        if let Some(solver) = self.solver {
            runtime = runtime.with_solver(solver);
        }

        info!(
            max_parallel_agents = self.config.max_parallel_agents,
            quality_mode = ?self.config.quality_mode,
            tools = self.tools.tool_count(),
            mesh = self.board.is_some(),
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            permits: Arc::new(Semaphore::new(self.config.max_parallel_agents)),
            synthesizer: Synthesizer::new(self.config.low_confidence_threshold),
            router,
            runtime: Arc::new(runtime),
            store: self.store,
            tools: self.tools,
            cost,
            responder: self.responder,
            board: self.board,
            observer: self.observer,
            monitor: Arc::new(DispatchMonitor::new()),
            running: Mutex::new(HashMap::new()),
            awaiting: Mutex::new(HashMap::new()),
            history_restored: OnceCell::new(),
            config: self.config,
        })
    }
}

/// Entry point for requests: classifies them, gates their cost, dispatches
/// work items to task agents, joins and synthesizes the results.
///
/// Every request yields exactly one [`Response`]; internal errors are logged
/// and reported as an `unable_to_complete` response.
pub struct Orchestrator {
    config: ConcordConfig,
    store: Arc<dyn StateStore>,
    router: ExecutionRouter,
    runtime: Arc<TaskAgentRuntime>,
    tools: Arc<ToolRegistry>,
    cost: Arc<CostController>,
    responder: Arc<dyn InlineResponder>,
    board: Option<Arc<SnapshotBoard>>,
    observer: Option<MeshObserver>,
    monitor: Arc<DispatchMonitor>,
    synthesizer: Synthesizer,
    /// Bounds task agents across all plans.
    permits: Arc<Semaphore>,
    /// Cancellation handles of plans being joined.
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Plans paused on a cost confirmation.
    awaiting: Mutex<HashMap<Uuid, ExecutionPlan>>,
    /// Set once the stored spend history has been loaded.
    history_restored: OnceCell<()>,
}

impl Orchestrator {
    /// Start building an orchestrator over a store and a tool registry.
    pub fn builder(
        config: ConcordConfig,
        store: Arc<dyn StateStore>,
        tools: Arc<ToolRegistry>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            tools,
            solver: None,
            responder: Arc::new(TemplateResponder),
            prices: PriceTable::default(),
            board: None,
            observer: None,
        }
    }

    /// Configuration the orchestrator was built with.
    pub fn config(&self) -> &ConcordConfig {
        &self.config
    }

    /// Router used to classify requests.
    pub fn router(&self) -> &ExecutionRouter {
        &self.router
    }

    /// Cost controller shared with the agent runtime.
    pub fn cost_controller(&self) -> &Arc<CostController> {
        &self.cost
    }

    /// Per-kind dispatch monitor.
    pub fn monitor(&self) -> &Arc<DispatchMonitor> {
        &self.monitor
    }

    /// Spend summary of the current billing period.
    pub async fn cost_report(&self) -> ConcordResult<CostReport> {
        self.cost.report().await
    }

    /// Handle a request end to end.
    pub async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();
        let response = match self.try_handle(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Request failed");
                Response::unable(Strategy::Direct, None, e.to_string())
            }
        };
        info!(
            outcome = %response.outcome,
            strategy = %response.strategy,
            work_items = response.work_items.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
        response
    }

    async fn try_handle(&self, request: &Request) -> ConcordResult<Response> {
        let routing = self.router.route(&request.text);
        let context = self.mesh_context(request);
        self.observe(Observation::Request {
            text: request.text.clone(),
            domains: routing.analysis.domains.clone(),
            facts: request.context_facts(),
            at: Utc::now(),
        });

        if routing.strategy == Strategy::Direct {
            return Ok(self.respond_inline(request, &routing, &context).await);
        }

        let (plan, mut specs) = self
            .router
            .build_plan(request, &routing, &context, &self.tools)?;
        info!(
            plan_id = %plan.id,
            strategy = %plan.strategy,
            rule = %routing.rule,
            items = specs.len(),
            "Plan created"
        );

        self.ensure_cost_history().await?;
        let remaining = self.cost.remaining().await?;
        let mut estimates = Vec::with_capacity(specs.len());
        for spec in &mut specs {
            let choice = self.router.select_tier(&TierRequest {
                complexity: routing.analysis.complexity,
                requires_remote: spec.constraints.requires_remote,
                background: false,
                remote_estimate: self.cost.estimate(spec, Tier::Remote).amount,
                remaining_budget: remaining,
            });
            spec.constraints.preferred_tier = choice.tier;
            let estimate = self.cost.estimate(spec, choice.tier);
            spec.estimated_cost = Some(estimate.amount);
            debug!(
                work_id = %spec.id,
                tier = %choice.tier,
                reason = choice.reason,
                estimate = estimate.amount,
                "Tier selected"
            );
            estimates.push(estimate);
        }

        let decisions = self.cost.authorize_batch(&estimates).await?;
        let mut charges = Vec::new();
        let mut denials = Vec::new();
        for (spec, decision) in specs.iter_mut().zip(&decisions) {
            match decision {
                Authorization::Allow => {}
                Authorization::RequireConfirmation { reason } => {
                    spec.cost_gate = CostGate::ConfirmationRequired;
                    charges.push(PendingCharge {
                        work_id: spec.id,
                        domain: spec.domain.clone(),
                        tier: spec.constraints.preferred_tier,
                        amount: spec.estimated_cost.unwrap_or(0.0),
                        reason: reason.clone(),
                    });
                }
                Authorization::Deny { reason } => denials.push((spec.id, reason.clone())),
            }
        }

        let mut stored = Vec::with_capacity(specs.len());
        for spec in &specs {
            stored.push(self.store.insert_work(spec).await?);
        }

        let denied: HashMap<Uuid, String> = denials.into_iter().collect();
        let mut caveats = Vec::new();
        let mut dispatchable = 0;
        for spec in &mut stored {
            let rejection = match denied.get(&spec.id) {
                Some(reason) => Some(format!("budget denied: {reason}")),
                None => self.dispatch_check(spec).err(),
            };
            match rejection {
                Some(reason) => {
                    warn!(work_id = %spec.id, reason = %reason, "Work rejected before dispatch");
                    caveats.push(format!("{}: {reason}", domain_label(spec)));
                    *spec = self.settle_pending(spec.clone(), &reason).await?;
                }
                None => dispatchable += 1,
            }
        }

        if dispatchable == 0 {
            let outcome = if denied.is_empty() {
                Outcome::UnableToComplete
            } else {
                Outcome::Denied
            };
            return Ok(Response {
                response_text: format!(
                    "This request cannot proceed: {}",
                    caveats.join("; ")
                ),
                requires_confirmation: false,
                confirmation_details: None,
                outcome,
                strategy: plan.strategy,
                plan_id: Some(plan.id),
                caveats,
                work_items: plan.work_ids(),
            });
        }

        let charges: Vec<PendingCharge> = charges
            .into_iter()
            .filter(|c| !denied.contains_key(&c.work_id))
            .collect();
        if !charges.is_empty() {
            let total_estimate: f64 = stored
                .iter()
                .filter(|s| !s.is_terminal())
                .filter_map(|s| s.estimated_cost)
                .sum();
            info!(
                plan_id = %plan.id,
                pending = charges.len(),
                total_estimate,
                "Plan awaiting cost confirmation"
            );
            let text = format!(
                "This request needs your confirmation before it runs. Estimated cost: ${total_estimate:.2}."
            );
            let response = Response {
                response_text: text,
                requires_confirmation: true,
                confirmation_details: Some(ConfirmationDetails {
                    plan_id: plan.id,
                    charges,
                    total_estimate,
                }),
                outcome: Outcome::AwaitingConfirmation,
                strategy: plan.strategy,
                plan_id: Some(plan.id),
                caveats,
                work_items: plan.work_ids(),
            };
            self.awaiting.lock().insert(plan.id, plan);
            return Ok(response);
        }

        let mut response = self.execute(&plan).await?;
        for caveat in caveats {
            if !response.caveats.contains(&caveat) {
                response.caveats.push(caveat);
            }
        }
        Ok(response)
    }

    /// Approve the pending charges of a plan and run it.
    pub async fn confirm(&self, plan_id: Uuid) -> Response {
        match self.try_confirm(plan_id).await {
            Ok(response) => response,
            Err(e) => {
                error!(plan_id = %plan_id, error = %e, "Confirmation failed");
                Response::unable(Strategy::Direct, Some(plan_id), e.to_string())
            }
        }
    }

    async fn try_confirm(&self, plan_id: Uuid) -> ConcordResult<Response> {
        let specs = self.plan_items(plan_id).await?;
        if specs.is_empty() {
            return Err(ConcordError::NotFound(format!("plan {plan_id}")));
        }
        for spec in &specs {
            if spec.status() == WorkStatus::Pending && spec.awaiting_confirmation() {
                let mut spec = spec.clone();
                spec.confirm(ConfirmationRecord {
                    confirmed_at: Utc::now(),
                    estimated_cost: spec.estimated_cost.unwrap_or(0.0),
                })?;
                self.store.update_work(&spec).await?;
                info!(work_id = %spec.id, plan_id = %plan_id, "Cost confirmed");
            }
        }
        let plan = self
            .awaiting
            .lock()
            .remove(&plan_id)
            .unwrap_or_else(|| ExecutionPlan::from_specs(plan_id, &specs));
        self.execute(&plan).await
    }

    /// Reject the pending charges of a plan. Nothing of it runs.
    pub async fn decline(&self, plan_id: Uuid) -> Response {
        match self.try_decline(plan_id).await {
            Ok(response) => response,
            Err(e) => {
                error!(plan_id = %plan_id, error = %e, "Decline failed");
                Response::unable(Strategy::Direct, Some(plan_id), e.to_string())
            }
        }
    }

    async fn try_decline(&self, plan_id: Uuid) -> ConcordResult<Response> {
        let specs = self.plan_items(plan_id).await?;
        if specs.is_empty() {
            return Err(ConcordError::NotFound(format!("plan {plan_id}")));
        }
        let plan = self
            .awaiting
            .lock()
            .remove(&plan_id)
            .unwrap_or_else(|| ExecutionPlan::from_specs(plan_id, &specs));
        for spec in specs {
            if spec.status() == WorkStatus::Pending {
                self.settle_pending(spec, "declined by caller").await?;
            }
        }
        info!(plan_id = %plan_id, "Plan declined");
        Ok(Response {
            response_text: "Request cancelled; nothing was run.".to_string(),
            requires_confirmation: false,
            confirmation_details: None,
            outcome: Outcome::Cancelled,
            strategy: plan.strategy,
            plan_id: Some(plan_id),
            caveats: vec!["declined by caller".to_string()],
            work_items: plan.work_ids(),
        })
    }

    /// Cancel a plan that is being joined. Returns false if no such plan is
    /// running.
    pub fn cancel(&self, plan_id: Uuid) -> bool {
        match self.running.lock().get(&plan_id) {
            Some(token) => {
                info!(plan_id = %plan_id, "Plan cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drive every non-terminal item left in the store to a terminal state.
    ///
    /// Items are grouped back into their plans. Plans still waiting for a
    /// confirmation stay paused; everything else is resumed from its last
    /// checkpoint, and each plan gets its synthesized response.
    pub async fn recover(&self) -> ConcordResult<RecoveryReport> {
        self.ensure_cost_history().await?;
        let active = self.store.list_active().await?;
        if active.is_empty() {
            info!("Recovery found no active work");
            return Ok(RecoveryReport::default());
        }

        let mut report = RecoveryReport::default();
        let mut groups: BTreeMap<Uuid, Vec<WorkSpecification>> = BTreeMap::new();
        for spec in active {
            groups.entry(spec.plan_id.unwrap_or(spec.id)).or_default().push(spec);
        }

        let mut plans = Vec::new();
        for (plan_id, items) in groups {
            let items = match items.first().and_then(|s| s.plan_id) {
                Some(_) => self.plan_items(plan_id).await?,
                None => items,
            };
            let plan = ExecutionPlan::from_specs(plan_id, &items);
            if items.iter().any(|s| s.awaiting_confirmation()) {
                info!(plan_id = %plan_id, "Recovered plan still awaits confirmation");
                report.awaiting_confirmation.push(plan_id);
                self.awaiting.lock().insert(plan_id, plan);
                continue;
            }
            let resumed = items
                .iter()
                .filter(|s| matches!(s.status(), WorkStatus::Assigned | WorkStatus::InProgress))
                .count();
            info!(plan_id = %plan_id, items = items.len(), resumed, "Recovering plan");
            report.resumed += resumed;
            plans.push(plan);
        }

        let responses = futures_util::future::join_all(plans.iter().map(|p| self.execute(p))).await;
        for (plan, response) in plans.iter().zip(responses) {
            match response {
                Ok(response) => report.responses.push(response),
                Err(e) => {
                    error!(plan_id = %plan.id, error = %e, "Plan recovery failed");
                    report
                        .responses
                        .push(Response::unable(plan.strategy, Some(plan.id), e.to_string()));
                }
            }
        }
        info!(
            plans = report.responses.len(),
            resumed = report.resumed,
            awaiting = report.awaiting_confirmation.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Join a plan and synthesize its response.
    async fn execute(&self, plan: &ExecutionPlan) -> ConcordResult<Response> {
        let token = CancellationToken::new();
        self.running.lock().insert(plan.id, token.clone());
        let joined = self.join_plan(plan, &token).await;
        self.running.lock().remove(&plan.id);
        let report = joined?;

        let synthesis = self
            .synthesizer
            .synthesize(&report.results, report.interruption);
        info!(
            plan_id = %plan.id,
            outcome = %synthesis.outcome,
            components = synthesis.components.len(),
            "Plan synthesized"
        );
        Ok(Response {
            response_text: synthesis.text,
            requires_confirmation: false,
            confirmation_details: None,
            outcome: synthesis.outcome,
            strategy: plan.strategy,
            plan_id: Some(plan.id),
            caveats: synthesis.caveats,
            work_items: plan.work_ids(),
        })
    }

    /// Dispatch ready nodes until every item is terminal, the join timeout
    /// passes, or the caller cancels.
    async fn join_plan(
        &self,
        plan: &ExecutionPlan,
        caller: &CancellationToken,
    ) -> ConcordResult<JoinReport> {
        let plan_token = caller.child_token();
        let deadline = Instant::now() + self.config.join_timeout();
        let mut workers: JoinSet<Joined> = JoinSet::new();
        let mut finished: HashMap<Uuid, WorkSpecification> = HashMap::new();
        let mut started: HashSet<Uuid> = HashSet::new();
        let mut interruption = None;

        loop {
            let mut progressed = false;
            let terminal: HashSet<Uuid> = finished.keys().copied().collect();
            for id in plan.ready(&terminal, &started) {
                started.insert(id);
                progressed = true;
                match self.prepare(id, &finished).await? {
                    Prepared::Settled(spec) => {
                        self.report_outcome(&spec);
                        finished.insert(id, spec);
                    }
                    Prepared::Held(spec) => {
                        warn!(work_id = %id, "Work still awaits confirmation, not dispatched");
                        finished.insert(id, spec);
                    }
                    Prepared::Dispatch(spec) => {
                        self.spawn_worker(&mut workers, spec, &plan_token, caller);
                    }
                }
            }

            if workers.is_empty() {
                if progressed {
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = workers.join_next() => {
                    if let Some(joined) = joined {
                        self.absorb(joined, &mut finished).await;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(plan_id = %plan.id, pending = workers.len(), "Join timed out");
                    interruption = Some(JoinInterruption::TimedOut);
                    break;
                }
                _ = caller.cancelled() => {
                    info!(plan_id = %plan.id, pending = workers.len(), "Plan cancelled");
                    interruption = Some(JoinInterruption::Cancelled);
                    break;
                }
            }
        }

        if interruption.is_some() {
            plan_token.cancel();
            let grace = Instant::now() + CANCEL_GRACE;
            loop {
                match tokio::time::timeout_at(grace, workers.join_next()).await {
                    Ok(Some(joined)) => self.absorb(joined, &mut finished).await,
                    Ok(None) => break,
                    Err(_) => {
                        warn!(plan_id = %plan.id, stuck = workers.len(), "Workers ignored cancellation, aborting");
                        workers.abort_all();
                        break;
                    }
                }
            }
            let reason = match interruption {
                Some(JoinInterruption::Cancelled) => reasons::CANCELLED,
                _ => NOT_DISPATCHED,
            };
            for id in plan.work_ids() {
                if started.contains(&id) {
                    continue;
                }
                if let Some(spec) = self.store.load_work(id).await? {
                    let spec = if spec.status() == WorkStatus::Pending {
                        self.settle_pending(spec, reason).await?
                    } else {
                        spec
                    };
                    finished.insert(id, spec);
                }
            }
        }

        let mut results = Vec::with_capacity(plan.len());
        for id in plan.work_ids() {
            match finished.remove(&id) {
                Some(spec) => results.push(spec),
                None => {
                    if let Some(spec) = self.store.load_work(id).await? {
                        results.push(spec);
                    }
                }
            }
        }
        Ok(JoinReport {
            results,
            interruption,
        })
    }

    /// Load a ready node and decide whether it runs.
    async fn prepare(
        &self,
        id: Uuid,
        finished: &HashMap<Uuid, WorkSpecification>,
    ) -> ConcordResult<Prepared> {
        let mut spec = self
            .store
            .load_work(id)
            .await?
            .ok_or_else(|| ConcordError::NotFound(format!("work {id}")))?;
        if spec.is_terminal() {
            return Ok(Prepared::Settled(spec));
        }
        if spec.status() != WorkStatus::Pending {
            return Ok(Prepared::Dispatch(spec));
        }
        if spec.awaiting_confirmation() {
            return Ok(Prepared::Held(spec));
        }
        if spec.dependencies.is_empty() {
            return Ok(Prepared::Dispatch(spec));
        }

        let upstream: Vec<&WorkSpecification> = spec
            .dependencies
            .iter()
            .filter_map(|d| finished.get(d))
            .filter(|d| d.status() == WorkStatus::Completed)
            .collect();
        if upstream.is_empty() {
            let spec = self.settle_pending(spec, "dependencies failed").await?;
            return Ok(Prepared::Settled(spec));
        }
        let facts: Vec<(String, serde_json::Value)> = upstream
            .iter()
            .filter_map(|u| {
                u.result()
                    .map(|r| (format!("{UPSTREAM_PREFIX}{}", domain_label(u)), r.summary.clone().into()))
            })
            .collect();
        for (key, value) in facts {
            spec.context.insert(key, value);
        }
        let spec = self.store.update_work(&spec).await?;
        Ok(Prepared::Dispatch(spec))
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<Joined>,
        spec: WorkSpecification,
        plan_token: &CancellationToken,
        caller: &CancellationToken,
    ) {
        let store = Arc::clone(&self.store);
        let runtime = Arc::clone(&self.runtime);
        let permits = Arc::clone(&self.permits);
        let monitor = Arc::clone(&self.monitor);
        let token = plan_token.clone();
        let caller = caller.clone();
        let work_id = spec.id;
        let kind = spec.kind;

        workers.spawn(async move {
            let started = Instant::now();
            let worker = dispatch(store, runtime, permits, monitor, spec, token, caller);
            let result = AssertUnwindSafe(worker)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ConcordError::Orchestrator(format!(
                        "task agent for work {work_id} panicked"
                    )))
                });
            Joined {
                work_id,
                kind,
                duration_ms: started.elapsed().as_millis() as u64,
                result,
            }
        });
    }

    /// Fold one finished worker into the join state.
    async fn absorb(
        &self,
        joined: Result<Joined, JoinError>,
        finished: &mut HashMap<Uuid, WorkSpecification>,
    ) {
        let joined = match joined {
            Ok(joined) => joined,
            Err(e) => {
                error!(error = %e, "Task agent aborted");
                return;
            }
        };
        match joined.result {
            Ok(spec) => {
                let success = spec.status() == WorkStatus::Completed;
                self.monitor
                    .finish_task(joined.kind, joined.work_id, success, joined.duration_ms)
                    .await;
                self.report_outcome(&spec);
                finished.insert(joined.work_id, spec);
            }
            Err(e) => {
                error!(work_id = %joined.work_id, error = %e, "Task agent failed");
                self.monitor.record_error(joined.kind).await;
                self.monitor
                    .finish_task(joined.kind, joined.work_id, false, joined.duration_ms)
                    .await;
                match self.store.load_work(joined.work_id).await {
                    Ok(Some(spec)) => {
                        finished.insert(joined.work_id, spec);
                    }
                    Ok(None) => {}
                    Err(e) => error!(work_id = %joined.work_id, error = %e, "Work reload failed"),
                }
            }
        }
    }

    /// Answer a direct request without creating work items.
    async fn respond_inline(
        &self,
        request: &Request,
        routing: &Routing,
        context: &ContextSnapshot,
    ) -> Response {
        let mut caveats = Vec::new();
        let mut tool_output = None;

        let tool = routing
            .analysis
            .domains
            .first()
            .filter(|_| !routing.analysis.persona_sensitive && routing.analysis.tool_calls == 1)
            .and_then(|domain| self.router.analyzer().rule(domain))
            .and_then(|rule| rule.tool.clone());
        if let Some(tool) = tool {
            let call = ToolCall::new(
                tool.clone(),
                serde_json::json!({
                    "query": request.text,
                    "context": context.facts,
                }),
            );
            let allowed = BTreeSet::from([tool.clone()]);
            match self.tools.invoke(&call, &allowed).await {
                Ok(output) => tool_output = Some(output),
                Err(e) => {
                    warn!(tool = %tool, error = %e, "Inline tool call failed");
                    caveats.push(format!("{tool} unavailable: {}", e.message()));
                }
            }
        }

        let text = self.responder.respond(&InlineContext {
            request,
            routing,
            context,
            tool_output: tool_output.as_deref(),
        });
        Response::direct(text, caveats)
    }

    /// Request context read from the cognitive mesh and the request itself.
    fn mesh_context(&self, request: &Request) -> ContextSnapshot {
        let mut context = ContextSnapshot::default().with_fact("request.text", request.text.clone().into());
        for (key, value) in request.context_facts() {
            context.insert(format!("conversation.{key}"), value);
        }
        for (tool, value) in &request.tool_results {
            context.insert(format!("tool_result.{tool}"), value.clone());
        }

        let Some(board) = &self.board else {
            return context;
        };
        context.source_versions = board.versions();
        if let Some(memory) = board.latest_snapshot(MEMORY_AGENT) {
            if let Some(facts) = memory.data.get("facts").and_then(|f| f.as_object()) {
                for (key, fact) in facts {
                    if let Some(value) = fact.get("value") {
                        context.insert(format!("memory.{key}"), value.clone());
                    }
                }
            }
        }
        let fields = [
            (TRAJECTORY_AGENT, "focus"),
            (AFFECT_AGENT, "mood"),
            (USER_PATTERNS_AGENT, "predicted_next"),
        ];
        for (agent, field) in fields {
            if let Some(value) = board
                .latest_snapshot(agent)
                .and_then(|s| s.data.get(field).cloned())
                .filter(|v| !v.is_null())
            {
                context.insert(format!("{agent}.{field}"), value);
            }
        }
        context
    }

    /// Seed cost estimates with the spend recorded by earlier processes.
    async fn ensure_cost_history(&self) -> ConcordResult<()> {
        self.history_restored
            .get_or_try_init(|| async { self.cost.restore_history().await.map(|_| ()) })
            .await?;
        Ok(())
    }

    /// Pre-dispatch checks beyond the cost gate.
    fn dispatch_check(&self, spec: &WorkSpecification) -> Result<(), String> {
        spec.validate().map_err(|e| e.to_string())?;
        if let Some(tool) = spec
            .constraints
            .allowed_tools
            .iter()
            .find(|t| !self.tools.contains(t))
        {
            return Err(format!("unsupported tool '{tool}'"));
        }
        Ok(())
    }

    /// Fail a pending item that will never run.
    async fn settle_pending(
        &self,
        mut spec: WorkSpecification,
        reason: &str,
    ) -> ConcordResult<WorkSpecification> {
        spec.fail(WorkResult::rejected(reason, spec.effective_tier()))?;
        let spec = self.store.update_work(&spec).await?;
        debug!(work_id = %spec.id, reason, "Work failed before dispatch");
        Ok(spec)
    }

    /// Every stored item of a plan, active or archived.
    async fn plan_items(&self, plan_id: Uuid) -> ConcordResult<Vec<WorkSpecification>> {
        let mut items: Vec<WorkSpecification> = self
            .store
            .list_active()
            .await?
            .into_iter()
            .filter(|s| s.plan_id == Some(plan_id))
            .collect();
        for archive in [Archive::Completed, Archive::Failed] {
            items.extend(
                self.store
                    .list_archive(archive)
                    .await?
                    .into_iter()
                    .filter(|s| s.plan_id == Some(plan_id)),
            );
        }
        Ok(items)
    }

    fn report_outcome(&self, spec: &WorkSpecification) {
        let Some(result) = spec.result() else {
            return;
        };
        self.observe(Observation::Outcome {
            work_id: spec.id,
            domain: spec.domain.clone(),
            success: spec.status() == WorkStatus::Completed,
            confidence: result.confidence,
            summary: result.summary.clone(),
        });
    }

    fn observe(&self, observation: Observation) {
        if let Some(observer) = &self.observer {
            observer.observe(observation);
        }
    }
}

/// Body of one worker: wait for a slot, assign, run.
async fn dispatch(
    store: Arc<dyn StateStore>,
    runtime: Arc<TaskAgentRuntime>,
    permits: Arc<Semaphore>,
    monitor: Arc<DispatchMonitor>,
    mut spec: WorkSpecification,
    token: CancellationToken,
    caller: CancellationToken,
) -> ConcordResult<WorkSpecification> {
    let permit = tokio::select! {
        permit = permits.acquire_owned() => Some(
            permit.map_err(|_| ConcordError::Orchestrator("dispatch slots closed".into()))?,
        ),
        _ = token.cancelled() => None,
    };
    if permit.is_none() && spec.status() == WorkStatus::Pending {
        let reason = if caller.is_cancelled() {
            reasons::CANCELLED
        } else {
            NOT_DISPATCHED
        };
        spec.fail(WorkResult::rejected(reason, spec.effective_tier()))?;
        return store.update_work(&spec).await;
    }

    monitor.start_task(spec.kind, spec.id).await;
    if spec.status() == WorkStatus::Pending {
        spec.assign(spec.constraints.preferred_tier)?;
        spec = store.update_work(&spec).await?;
        info!(work_id = %spec.id, tier = %spec.effective_tier(), kind = %spec.kind, "Work assigned");
    }
    let result = runtime.run(spec.id, token).await;
    drop(permit);
    result
}

fn domain_label(spec: &WorkSpecification) -> String {
    spec.domain.clone().unwrap_or_else(|| spec.kind.to_string())
}
