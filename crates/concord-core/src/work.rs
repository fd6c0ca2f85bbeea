use crate::checkpoint::{Checkpoint, SuccessCriterion};
use crate::{ConcordError, ConcordResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// What kind of work a specification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Look something up and report findings.
    Research,
    /// Perform an action through a tool.
    ToolExecution,
    /// Combine upstream results into one answer.
    Synthesis,
    /// Check another result against constraints.
    Validation,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Research => write!(f, "research"),
            TaskKind::ToolExecution => write!(f, "tool_execution"),
            TaskKind::Synthesis => write!(f, "synthesis"),
            TaskKind::Validation => write!(f, "validation"),
        }
    }
}

/// Compute target for a unit of work. `Remote` is the higher tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// On-device execution.
    Local,
    /// Hosted execution; more capable and billed.
    Remote,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

/// Lifecycle state of a [`WorkSpecification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Created, not yet handed to a runtime.
    Pending,
    /// Handed to a runtime instance that has not started iterating.
    Assigned,
    /// A runtime instance holds write access and is iterating.
    InProgress,
    /// Terminal: success criteria met.
    Completed,
    /// Terminal: rejected, exhausted, timed out, or cancelled.
    Failed,
}

impl WorkStatus {
    /// Whether the status is terminal and therefore immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }

    /// Whether `self -> to` is a legal move.
    pub fn can_transition_to(self, to: WorkStatus) -> bool {
        matches!(
            (self, to),
            (WorkStatus::Pending, WorkStatus::Assigned)
                | (WorkStatus::Pending, WorkStatus::Failed)
                | (WorkStatus::Assigned, WorkStatus::InProgress)
                | (WorkStatus::InProgress, WorkStatus::Completed)
                | (WorkStatus::InProgress, WorkStatus::Failed)
        )
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkStatus::Pending => write!(f, "pending"),
            WorkStatus::Assigned => write!(f, "assigned"),
            WorkStatus::InProgress => write!(f, "in_progress"),
            WorkStatus::Completed => write!(f, "completed"),
            WorkStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Pre-filtered facts copied into a work item at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Facts keyed by dotted name, e.g. `memory.home_city`.
    #[serde(default)]
    pub facts: BTreeMap<String, serde_json::Value>,
    /// Version of each cognitive snapshot the facts were copied from.
    #[serde(default)]
    pub source_versions: BTreeMap<String, u64>,
}

impl ContextSnapshot {
    /// Insert a fact.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.facts.insert(key.into(), value);
    }

    /// Builder-style [`ContextSnapshot::insert`].
    pub fn with_fact(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(key, value);
        self
    }
}

/// Execution limits for a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Maximum refinement iterations before the item fails.
    pub max_iterations: u32,
    /// Wall-clock limit for the whole item.
    pub timeout_secs: u64,
    /// Tier the router would like to use.
    pub preferred_tier: Tier,
    /// Tools the runtime may invoke for this item.
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    /// The remote tier must not be silently replaced with the local one.
    #[serde(default)]
    pub requires_remote: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            timeout_secs: 60,
            preferred_tier: Tier::Local,
            allowed_tools: BTreeSet::new(),
            requires_remote: false,
        }
    }
}

/// Progress of an in-flight work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Number of iterations that have finished without meeting all criteria.
    pub iteration: u32,
    /// Checkpoint to resume from.
    pub last_checkpoint: Option<Checkpoint>,
    /// Digest of `last_checkpoint`, checked on resume.
    #[serde(default)]
    pub checkpoint_digest: Option<String>,
    /// Last time progress was written.
    pub last_updated: DateTime<Utc>,
}

impl Progress {
    /// Whether the stored checkpoint still matches its digest.
    pub fn checkpoint_intact(&self) -> bool {
        match (&self.last_checkpoint, &self.checkpoint_digest) {
            (None, None) => true,
            (Some(cp), Some(digest)) => cp.digest() == *digest,
            _ => false,
        }
    }
}

/// The outcome written when a work item reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// One-paragraph summary of what was found or done.
    pub summary: String,
    /// Outputs per producer.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Fraction of success criteria met, in `0.0..=1.0`.
    pub confidence: f64,
    /// Known gaps in the result.
    #[serde(default)]
    pub caveats: Vec<String>,
    /// Tier the result was produced on.
    pub tier: Tier,
    /// Iterations used.
    pub iterations: u32,
    /// Set when the failure was a cooperative cancellation.
    #[serde(default)]
    pub cancelled: bool,
    /// Machine-readable failure tag (e.g. `cancelled`, `budget_exhausted`).
    #[serde(default)]
    pub reason: Option<String>,
}

impl WorkResult {
    /// A zero-confidence failure result carrying only a reason.
    pub fn rejected(reason: impl Into<String>, tier: Tier) -> Self {
        let reason = reason.into();
        Self {
            summary: format!("Not executed: {reason}"),
            outputs: BTreeMap::new(),
            confidence: 0.0,
            caveats: vec![reason.clone()],
            tier,
            iterations: 0,
            cancelled: false,
            reason: Some(reason),
        }
    }
}

/// Whether dispatch of an item is gated on explicit confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostGate {
    /// No confirmation needed.
    #[default]
    Clear,
    /// A [`ConfirmationRecord`] must be attached before the item may start.
    ConfirmationRequired,
}

/// Proof that the caller approved an expensive item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    /// When the confirmation signal was received.
    pub confirmed_at: DateTime<Utc>,
    /// The estimate the caller agreed to.
    pub estimated_cost: f64,
}

/// One entry in the status log of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Status before.
    pub from: WorkStatus,
    /// Status after.
    pub to: WorkStatus,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
}

/// The unit of dispatchable work.
///
/// Status, result and the status log are private: they change only through
/// [`WorkSpecification::transition`] and its wrappers, which enforce the
/// state machine and the immutability of terminal items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpecification {
    /// Immutable identity.
    pub id: Uuid,
    /// Plan this item belongs to, if any.
    #[serde(default)]
    pub plan_id: Option<Uuid>,
    /// Kind of work.
    pub kind: TaskKind,
    /// Logical sub-question this item answers (e.g. `flights`).
    #[serde(default)]
    pub domain: Option<String>,
    /// What to do.
    pub description: String,
    /// Ordered checkable conditions.
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    /// Facts copied at creation; never a live reference.
    #[serde(default)]
    pub context: ContextSnapshot,
    /// Execution limits.
    #[serde(default)]
    pub constraints: Constraints,
    /// Items whose terminal results this one waits for.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Tier chosen at assignment.
    #[serde(default)]
    pub tier: Option<Tier>,
    /// Estimated cost at dispatch time.
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    /// Whether starting requires confirmation.
    #[serde(default)]
    pub cost_gate: CostGate,
    /// Recorded confirmation signal.
    #[serde(default)]
    pub confirmation: Option<ConfirmationRecord>,
    /// Store version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    status: WorkStatus,
    progress: Progress,
    #[serde(default)]
    result: Option<WorkResult>,
    #[serde(default)]
    status_history: Vec<StatusTransition>,
}

impl WorkSpecification {
    /// Create a pending work item.
    pub fn new(kind: TaskKind, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plan_id: None,
            kind,
            domain: None,
            description: description.into(),
            success_criteria: Vec::new(),
            context: ContextSnapshot::default(),
            constraints: Constraints::default(),
            dependencies: Vec::new(),
            tier: None,
            estimated_cost: None,
            cost_gate: CostGate::Clear,
            confirmation: None,
            version: 0,
            created_at: now,
            status: WorkStatus::Pending,
            progress: Progress {
                iteration: 0,
                last_checkpoint: None,
                checkpoint_digest: None,
                last_updated: now,
            },
            result: None,
            status_history: Vec::new(),
        }
    }

    /// Set the logical domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the success criteria.
    pub fn with_criteria(mut self, criteria: Vec<SuccessCriterion>) -> Self {
        self.success_criteria = criteria;
        self
    }

    /// Set the copied context.
    pub fn with_context(mut self, context: ContextSnapshot) -> Self {
        self.context = context;
        self
    }

    /// Set the constraints.
    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Set dependencies.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Attach to a plan.
    pub fn in_plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    /// Current status.
    pub fn status(&self) -> WorkStatus {
        self.status
    }

    /// Whether the item is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Current progress.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Terminal result, if any.
    pub fn result(&self) -> Option<&WorkResult> {
        self.result.as_ref()
    }

    /// Log of every applied status change.
    pub fn status_history(&self) -> &[StatusTransition] {
        &self.status_history
    }

    /// Tier the item runs (or would run) on.
    pub fn effective_tier(&self) -> Tier {
        self.tier.unwrap_or(self.constraints.preferred_tier)
    }

    /// Whether a confirmation is still missing.
    pub fn awaiting_confirmation(&self) -> bool {
        self.cost_gate == CostGate::ConfirmationRequired && self.confirmation.is_none()
    }

    fn reject_if_terminal(&self) -> ConcordResult<()> {
        if self.status.is_terminal() {
            return Err(ConcordError::TerminalMutation {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Apply a status change, enforcing the state machine.
    pub fn transition(&mut self, to: WorkStatus) -> ConcordResult<()> {
        self.reject_if_terminal()?;
        if !self.status.can_transition_to(to) {
            return Err(ConcordError::IllegalTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        if to == WorkStatus::InProgress && self.awaiting_confirmation() {
            return Err(ConcordError::Budget(format!(
                "work {} requires confirmation before it may start",
                self.id
            )));
        }

        let now = Utc::now();
        self.status_history.push(StatusTransition {
            from: self.status,
            to,
            at: now,
        });
        self.status = to;
        self.progress.last_updated = now;
        Ok(())
    }

    /// `pending -> assigned` on the given tier.
    pub fn assign(&mut self, tier: Tier) -> ConcordResult<()> {
        self.transition(WorkStatus::Assigned)?;
        self.tier = Some(tier);
        Ok(())
    }

    /// `assigned -> in_progress`.
    pub fn begin(&mut self) -> ConcordResult<()> {
        self.transition(WorkStatus::InProgress)
    }

    /// Record the checkpoint of a finished iteration.
    ///
    /// Only legal while in progress; the iteration counter never decreases.
    pub fn record_checkpoint(&mut self, iteration: u32, checkpoint: Checkpoint) -> ConcordResult<()> {
        self.reject_if_terminal()?;
        if self.status != WorkStatus::InProgress {
            return Err(ConcordError::Validation(format!(
                "work {} cannot checkpoint while {}",
                self.id, self.status
            )));
        }
        if iteration < self.progress.iteration {
            return Err(ConcordError::Validation(format!(
                "work {} iteration counter would go backwards ({} -> {})",
                self.id, self.progress.iteration, iteration
            )));
        }
        self.progress.checkpoint_digest = Some(checkpoint.digest());
        self.progress.last_checkpoint = Some(checkpoint);
        self.progress.iteration = iteration;
        self.progress.last_updated = Utc::now();
        Ok(())
    }

    /// Discard a checkpoint that failed its digest check, keeping the iteration.
    pub fn reset_checkpoint(&mut self) -> ConcordResult<()> {
        self.reject_if_terminal()?;
        self.progress.last_checkpoint = None;
        self.progress.checkpoint_digest = None;
        self.progress.last_updated = Utc::now();
        Ok(())
    }

    /// `in_progress -> completed` with a result.
    pub fn complete(&mut self, result: WorkResult) -> ConcordResult<()> {
        self.transition(WorkStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// `in_progress|pending -> failed` with a result.
    pub fn fail(&mut self, result: WorkResult) -> ConcordResult<()> {
        self.transition(WorkStatus::Failed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Attach a confirmation signal. Only pending items can be confirmed.
    pub fn confirm(&mut self, record: ConfirmationRecord) -> ConcordResult<()> {
        self.reject_if_terminal()?;
        if self.status != WorkStatus::Pending {
            return Err(ConcordError::Validation(format!(
                "work {} can only be confirmed while pending (is {})",
                self.id, self.status
            )));
        }
        self.confirmation = Some(record);
        Ok(())
    }

    /// Pre-dispatch validation.
    pub fn validate(&self) -> ConcordResult<()> {
        if self.description.trim().is_empty() {
            return Err(ConcordError::Validation(format!(
                "work {} has an empty description",
                self.id
            )));
        }
        if self.constraints.max_iterations == 0 {
            return Err(ConcordError::Validation(format!(
                "work {} allows zero iterations",
                self.id
            )));
        }
        if self.constraints.timeout_secs == 0 {
            return Err(ConcordError::Validation(format!(
                "work {} has a zero timeout",
                self.id
            )));
        }
        if self.dependencies.contains(&self.id) {
            return Err(ConcordError::Validation(format!(
                "work {} depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}
