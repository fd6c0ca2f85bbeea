//! Task agent runtime for the Concord engine.
//!
//! A [`TaskAgentRuntime`] takes one assigned work item and drives it to a
//! terminal state: each iteration starts from a fresh [`ExecutionContext`]
//! built from the item's copied context and the last checkpoint, invokes
//! tools through the [`ToolRegistry`], and checks the success criteria.
//! Progress is committed to the state store after every iteration, so a
//! crashed run resumes from its last checkpoint.

/// Transient-error retry policy.
pub mod retry;
/// The iteration loop.
pub mod runtime;
/// What each iteration attempts.
pub mod solver;
/// Tool provider boundary.
pub mod tool;

pub use retry::RetryPolicy;
pub use runtime::{reasons, LoopState, RuntimeSettings, TaskAgentRuntime};
pub use solver::{
    effective_criteria, Attempt, ExecutionContext, TaskSolver, ToolSweepSolver, SYNTHESIS_OUTPUT,
    UPSTREAM_PREFIX,
};
pub use tool::{ToolDescriptor, ToolProvider, ToolRegistry};
