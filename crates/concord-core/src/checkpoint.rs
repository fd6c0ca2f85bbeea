use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Outputs longer than this are truncated before entering a checkpoint.
pub const MAX_CHECKPOINT_OUTPUT_CHARS: usize = 4_000;

/// The minimal state carried from one iteration of a task agent to the next.
///
/// Only ordered collections are used and no timestamps are stored, so the
/// serialized form (and its digest) is a pure function of its contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Iteration that produced this checkpoint.
    pub iteration: u32,
    /// Output per tool (or per synthetic producer such as `synthesis`).
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Tools that failed permanently and should not be retried.
    #[serde(default)]
    pub failed_tools: BTreeSet<String>,
    /// Short notes on what was learned in earlier iterations.
    #[serde(default)]
    pub notes: Vec<String>,
    /// Indices of success criteria that passed at the end of the iteration.
    #[serde(default)]
    pub passed_criteria: BTreeSet<usize>,
}

impl Checkpoint {
    /// An empty checkpoint at the given iteration.
    pub fn at(iteration: u32) -> Self {
        Self {
            iteration,
            ..Self::default()
        }
    }

    /// Record a tool output, truncated to [`MAX_CHECKPOINT_OUTPUT_CHARS`].
    pub fn record_output(&mut self, producer: impl Into<String>, output: &str) {
        let compact: String = output.chars().take(MAX_CHECKPOINT_OUTPUT_CHARS).collect();
        self.outputs.insert(producer.into(), compact);
    }

    /// Remember that a tool failed permanently.
    pub fn record_permanent_failure(&mut self, tool: impl Into<String>, reason: &str) {
        let tool = tool.into();
        self.notes.push(format!("{tool} failed permanently: {reason}"));
        self.failed_tools.insert(tool);
    }

    /// Append a note.
    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Hex-encoded SHA-256 of the canonical JSON encoding.
    pub fn digest(&self) -> String {
        // Serializing a struct of ordered maps cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// A checkable condition a task result must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    /// Human-readable description, surfaced in caveats when unmet.
    pub description: String,
    /// The mechanical check.
    pub check: CriterionCheck,
}

/// The mechanical part of a [`SuccessCriterion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionCheck {
    /// Some output (or the named tool's output) contains the needle, case-insensitively.
    OutputContains {
        /// Restrict the check to this producer.
        #[serde(default)]
        tool: Option<String>,
        /// Text to look for.
        needle: String,
    },
    /// The named tool produced an output.
    ToolSucceeded {
        /// Tool name.
        tool: String,
    },
    /// At least `count` producers have output.
    MinOutputs {
        /// Required number of outputs.
        count: usize,
    },
}

impl SuccessCriterion {
    /// Create a criterion.
    pub fn new(description: impl Into<String>, check: CriterionCheck) -> Self {
        Self {
            description: description.into(),
            check,
        }
    }

    /// Shorthand for a [`CriterionCheck::ToolSucceeded`] criterion.
    pub fn tool_succeeded(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Self::new(
            format!("{tool} returned a result"),
            CriterionCheck::ToolSucceeded { tool },
        )
    }

    /// Shorthand for a [`CriterionCheck::MinOutputs`] criterion.
    pub fn min_outputs(count: usize) -> Self {
        Self::new(
            format!("at least {count} output(s) produced"),
            CriterionCheck::MinOutputs { count },
        )
    }

    /// Evaluate against the outputs gathered so far.
    pub fn is_met(&self, outputs: &BTreeMap<String, String>) -> bool {
        match &self.check {
            CriterionCheck::OutputContains { tool, needle } => {
                let needle = needle.to_lowercase();
                match tool {
                    Some(name) => outputs
                        .get(name)
                        .is_some_and(|out| out.to_lowercase().contains(&needle)),
                    None => outputs
                        .values()
                        .any(|out| out.to_lowercase().contains(&needle)),
                }
            }
            CriterionCheck::ToolSucceeded { tool } => outputs.contains_key(tool),
            CriterionCheck::MinOutputs { count } => outputs.len() >= *count,
        }
    }

    /// Indices of the criteria in `criteria` that are met.
    pub fn evaluate_all(
        criteria: &[SuccessCriterion],
        outputs: &BTreeMap<String, String>,
    ) -> BTreeSet<usize> {
        criteria
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_met(outputs))
            .map(|(i, _)| i)
            .collect()
    }
}
