use concord_core::Tier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// An incoming request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// The user utterance.
    pub text: String,
    /// Caller-side conversation state. Object entries are treated as facts.
    #[serde(default)]
    pub conversation_context: serde_json::Value,
    /// Results of tools the caller already ran, by tool name.
    #[serde(default)]
    pub tool_results: BTreeMap<String, serde_json::Value>,
    /// The remote tier must not be replaced by the local one.
    #[serde(default)]
    pub requires_remote: bool,
}

impl Request {
    /// Request with no context.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Builder-style conversation context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.conversation_context = context;
        self
    }

    /// Builder-style result of a tool the caller already ran.
    pub fn with_tool_result(mut self, tool: impl Into<String>, result: serde_json::Value) -> Self {
        self.tool_results.insert(tool.into(), result);
        self
    }

    /// Require the remote tier for every item.
    pub fn requiring_remote(mut self) -> Self {
        self.requires_remote = true;
        self
    }

    /// Object entries of the conversation context.
    pub fn context_facts(&self) -> BTreeMap<String, serde_json::Value> {
        match &self.conversation_context {
            serde_json::Value::Object(map) => {
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            _ => BTreeMap::new(),
        }
    }
}

/// How a request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Inline, no work items.
    Direct,
    /// One work item.
    Single,
    /// One independent work item per domain.
    Parallel,
    /// A dependency graph of work items.
    Hybrid,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::Single => write!(f, "single"),
            Strategy::Parallel => write!(f, "parallel"),
            Strategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Answered inline.
    Direct,
    /// Every work item completed.
    Complete,
    /// Some work items completed; the gaps are listed as caveats.
    Partial,
    /// No work item completed.
    UnableToComplete,
    /// Dispatch is paused until the caller confirms the cost.
    AwaitingConfirmation,
    /// The budget cannot pay for the request.
    Denied,
    /// The caller cancelled or declined.
    Cancelled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Direct => "direct",
            Outcome::Complete => "complete",
            Outcome::Partial => "partial",
            Outcome::UnableToComplete => "unable_to_complete",
            Outcome::AwaitingConfirmation => "awaiting_confirmation",
            Outcome::Denied => "denied",
            Outcome::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One item that needs the caller's approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCharge {
    /// Work item to be charged.
    pub work_id: Uuid,
    /// Sub-question of the item, if any.
    pub domain: Option<String>,
    /// Tier the estimate was made for.
    pub tier: Tier,
    /// Estimated cost (USD).
    pub amount: f64,
    /// Why approval is needed.
    pub reason: String,
}

/// What the caller is asked to approve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationDetails {
    /// Pass to `Orchestrator::confirm` or `Orchestrator::decline`.
    pub plan_id: Uuid,
    /// Items over the confirmation threshold.
    pub charges: Vec<PendingCharge>,
    /// Estimated cost of the whole plan.
    pub total_estimate: f64,
}

/// The single response produced for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Text shown to the user.
    pub response_text: String,
    /// The plan is held until the caller confirms or declines.
    pub requires_confirmation: bool,
    /// Set when `requires_confirmation` is.
    #[serde(default)]
    pub confirmation_details: Option<ConfirmationDetails>,
    /// How the request ended.
    pub outcome: Outcome,
    /// Strategy the router picked.
    pub strategy: Strategy,
    /// Plan created for the request, if any.
    #[serde(default)]
    pub plan_id: Option<Uuid>,
    /// Gaps, failures and low-confidence parts of the answer.
    #[serde(default)]
    pub caveats: Vec<String>,
    /// Work items created for the request.
    #[serde(default)]
    pub work_items: Vec<Uuid>,
}

impl Response {
    /// An inline answer.
    pub fn direct(text: impl Into<String>, caveats: Vec<String>) -> Self {
        Self {
            response_text: text.into(),
            requires_confirmation: false,
            confirmation_details: None,
            outcome: Outcome::Direct,
            strategy: Strategy::Direct,
            plan_id: None,
            caveats,
            work_items: Vec::new(),
        }
    }

    /// The defined answer for requests that produced nothing usable.
    pub fn unable(strategy: Strategy, plan_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            response_text: format!("I was unable to complete this request: {reason}"),
            requires_confirmation: false,
            confirmation_details: None,
            outcome: Outcome::UnableToComplete,
            strategy,
            plan_id,
            caveats: vec![reason],
            work_items: Vec::new(),
        }
    }
}
