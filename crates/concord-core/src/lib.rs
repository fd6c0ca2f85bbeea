//! Core types and error definitions for the Concord orchestration engine.
//!
//! This crate provides the foundational types shared across all Concord crates:
//! the unit of dispatchable work and its state machine, resumable checkpoints,
//! cost and snapshot records, the tool-error taxonomy, and configuration.
//!
//! # Main types
//!
//! - [`ConcordError`] — Unified error enum for all Concord subsystems.
//! - [`ConcordResult`] — Convenience alias for `Result<T, ConcordError>`.
//! - [`WorkSpecification`] — A single dispatchable unit of work.
//! - [`WorkStatus`] — Lifecycle state of a [`WorkSpecification`].
//! - [`Checkpoint`] — Minimal serializable state needed to resume work.
//! - [`CostRecord`] — Per-period spend accumulator.
//! - [`CognitiveSnapshot`] — A versioned snapshot published by a background agent.
//! - [`ConcordConfig`] — Engine configuration surface.

/// Resumable checkpoint state and success criteria.
pub mod checkpoint;
/// Engine configuration.
pub mod config;
/// Cost and snapshot records shared between the store, cost controller and mesh.
pub mod records;
/// Tool-invocation error taxonomy.
pub mod tool;
/// The WorkSpecification data model and its state machine.
pub mod work;

pub use checkpoint::{Checkpoint, CriterionCheck, SuccessCriterion};
pub use config::{
    CognitiveAgentSettings, CognitiveConfig, ConcordConfig, DomainRule, QualityMode,
};
pub use records::{
    Authorization, CognitiveSnapshot, CostEstimate, CostRecord, CostEntry, billing_period,
};
pub use tool::{ToolCall, ToolError};
pub use work::{
    ConfirmationRecord, Constraints, ContextSnapshot, CostGate, Progress, StatusTransition,
    TaskKind, Tier, WorkResult, WorkSpecification, WorkStatus,
};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Concord engine.
///
/// Each variant corresponds to a class of failure in the error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ConcordError {
    /// A malformed or disallowed work specification, rejected before dispatch.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A tool invocation failed in a way the caller must handle.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// The cost controller refused or paused the operation.
    #[error("Budget error: {0}")]
    Budget(String),

    /// An attempt to mutate a work item that already reached a terminal state.
    #[error("Terminal mutation rejected: work {id} is already {status}")]
    TerminalMutation {
        /// The work item that was targeted.
        id: Uuid,
        /// Its (terminal) status.
        status: WorkStatus,
    },

    /// A status change not permitted by the state machine.
    #[error("Illegal transition for work {id}: {from} -> {to}")]
    IllegalTransition {
        /// The work item that was targeted.
        id: Uuid,
        /// Status before the attempted change.
        from: WorkStatus,
        /// Requested status.
        to: WorkStatus,
    },

    /// An optimistic-concurrency write carried a stale version.
    #[error("Version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        /// Record key.
        key: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// A record that was expected to exist could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A storage backend failure.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestrator control plane.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// Work was cancelled cooperatively.
    #[error("Cancelled")]
    Cancelled,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConcordError {
    /// Whether this error signals an internal invariant violation (a defect),
    /// as opposed to a user-facing or environmental failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ConcordError::TerminalMutation { .. }
                | ConcordError::IllegalTransition { .. }
                | ConcordError::VersionConflict { .. }
        )
    }
}

/// A convenience `Result` alias using [`ConcordError`].
pub type ConcordResult<T> = Result<T, ConcordError>;
