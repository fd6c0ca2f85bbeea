//! Orchestrator and execution router for the Concord engine.
//!
//! The [`Orchestrator`] is the entry point for requests. The
//! [`ExecutionRouter`] classifies each one as direct, single, parallel or
//! hybrid and turns delegated requests into an [`ExecutionPlan`] of work
//! items. The orchestrator gates the plan through the cost controller,
//! dispatches ready items to task agents under a global concurrency bound,
//! joins them with a timeout, and merges the results with the
//! [`Synthesizer`]. Non-terminal work left by a crash is picked up by
//! [`Orchestrator::recover`].
//!
//! # Main types
//!
//! - [`Orchestrator`] — Request entry point, dispatch and join.
//! - [`ExecutionRouter`] — Ordered decision table and tier policy.
//! - [`ExecutionPlan`] — Set or DAG of work items for one request.
//! - [`Synthesizer`] — Deterministic merge of terminal results.
//! - [`DispatchMonitor`] — Live per-kind dispatch counters.

/// Keyword-based request analysis.
pub mod analysis;
/// The orchestrator.
pub mod engine;
/// Inline answers for direct requests.
pub mod inline;
/// Per-kind dispatch monitoring.
pub mod monitor;
/// Execution plans.
pub mod plan;
/// Request and response types.
pub mod request;
/// Classification, tier policy and plan building.
pub mod router;
/// Result merging.
pub mod synthesis;

pub use analysis::{RequestAnalysis, RequestAnalyzer};
pub use engine::{Orchestrator, OrchestratorBuilder, RecoveryReport};
pub use inline::{InlineContext, InlineResponder, TemplateResponder};
pub use monitor::{DispatchMetrics, DispatchMonitor, KindState};
pub use plan::{ExecutionPlan, PlanNode};
pub use request::{ConfirmationDetails, Outcome, PendingCharge, Request, Response, Strategy};
pub use router::{
    context_for_domain, ExecutionRouter, RouterPolicy, Routing, TierChoice, TierRequest,
    DIRECT_COMPLEXITY_CEILING, FALLBACK_RULE, SYNTHESIS_DOMAIN,
};
pub use synthesis::{Component, JoinInterruption, Synthesis, Synthesizer};
