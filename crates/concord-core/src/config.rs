use crate::work::TaskKind;
use crate::{ConcordError, ConcordResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cost/quality trade-off requested by the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    /// Minimise spend.
    Economy,
    /// Default trade-off.
    #[default]
    Balanced,
    /// Prefer the remote tier.
    Performance,
}

/// Routing rule mapping request keywords to a domain and its tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRule {
    /// Domain name, also the logical sub-question key used in synthesis.
    pub name: String,
    /// Whole-word keywords that signal this domain.
    pub keywords: Vec<String>,
    /// Tool that serves the domain.
    #[serde(default)]
    pub tool: Option<String>,
    /// Kind of work items created for the domain.
    #[serde(default = "default_domain_kind")]
    pub kind: TaskKind,
}

fn default_domain_kind() -> TaskKind {
    TaskKind::Research
}

/// Per-agent settings of the cognitive mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CognitiveAgentSettings {
    /// Whether the agent is started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tick interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for CognitiveAgentSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl CognitiveAgentSettings {
    /// Tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Settings for the cognitive agent mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CognitiveConfig {
    /// Persist each agent's snapshot every N ticks.
    #[serde(default = "default_persist_every")]
    pub persist_every_n_ticks: u64,
    /// Number of past versions kept in memory per agent.
    #[serde(default = "default_retention")]
    pub retention_versions: usize,
    /// Per-agent overrides keyed by agent id.
    #[serde(default)]
    pub agents: BTreeMap<String, CognitiveAgentSettings>,
}

impl Default for CognitiveConfig {
    fn default() -> Self {
        Self {
            persist_every_n_ticks: default_persist_every(),
            retention_versions: default_retention(),
            agents: BTreeMap::new(),
        }
    }
}

impl CognitiveConfig {
    /// Settings for an agent, falling back to defaults.
    pub fn settings_for(&self, agent_id: &str) -> CognitiveAgentSettings {
        self.agents.get(agent_id).copied().unwrap_or_default()
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcordConfig {
    /// Cost/quality trade-off.
    #[serde(default)]
    pub quality_mode: QualityMode,
    /// Prefer the local tier whenever it is available.
    #[serde(default)]
    pub prefer_local_when_available: bool,
    /// Upper bound on concurrently running task agents.
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Estimates above this (USD) need confirmation.
    #[serde(default = "default_per_task_cost_limit")]
    pub per_task_cost_limit: f64,
    /// Budget per billing period (USD).
    #[serde(default = "default_monthly_budget")]
    pub monthly_budget: f64,
    /// Plan estimates above this (USD) ask the caller before running.
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold: f64,
    /// Turn hard budget denials into confirmation requests.
    #[serde(default)]
    pub allow_budget_override: bool,
    /// Complexity above which work goes to the remote tier.
    #[serde(default = "default_remote_complexity_threshold")]
    pub remote_complexity_threshold: f64,
    /// Global join deadline of one plan.
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    /// Iteration cap of work items that do not set one.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    /// Timeout (seconds) of work items that do not set one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Retries of a transient tool error within one iteration.
    #[serde(default = "default_tool_retry_limit")]
    pub tool_retry_limit: u32,
    /// Pause between iterations of one work item, in milliseconds.
    #[serde(default = "default_iteration_backoff_ms")]
    pub iteration_backoff_ms: u64,
    /// Results below this confidence are surfaced as caveats.
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,
    /// Root directory of on-disk state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Cognitive mesh settings.
    #[serde(default)]
    pub cognitive: CognitiveConfig,
    /// Routing rules.
    #[serde(default = "default_domains")]
    pub domains: Vec<DomainRule>,
    /// Words that mark a request as needing persona/emotional continuity.
    #[serde(default = "default_persona_keywords")]
    pub persona_keywords: Vec<String>,
    /// Phrases that mark sub-tasks as dependent on each other.
    #[serde(default = "default_dependency_markers")]
    pub dependency_markers: Vec<String>,
}

fn default_enabled() -> bool {
    true
}
fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_persist_every() -> u64 {
    1
}
fn default_retention() -> usize {
    16
}
fn default_max_parallel_agents() -> usize {
    4
}
fn default_per_task_cost_limit() -> f64 {
    0.50
}
fn default_monthly_budget() -> f64 {
    20.0
}
fn default_confirmation_threshold() -> f64 {
    0.25
}
fn default_remote_complexity_threshold() -> f64 {
    0.7
}
fn default_join_timeout_secs() -> u64 {
    120
}
fn default_max_iterations() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_tool_retry_limit() -> u32 {
    2
}
fn default_iteration_backoff_ms() -> u64 {
    50
}
fn default_low_confidence_threshold() -> f64 {
    0.5
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn rule(name: &str, keywords: &[&str], kind: TaskKind) -> DomainRule {
    DomainRule {
        name: name.to_string(),
        keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
        tool: Some(name.to_string()),
        kind,
    }
}

fn default_domains() -> Vec<DomainRule> {
    vec![
        rule("flights", &["flight", "flights", "fly", "airfare"], TaskKind::Research),
        rule("hotels", &["hotel", "hotels", "accommodation", "stay"], TaskKind::Research),
        rule("activities", &["activities", "activity", "things to do", "tour", "tours"], TaskKind::Research),
        rule("restaurants", &["restaurant", "restaurants", "dinner", "lunch"], TaskKind::Research),
        rule("weather", &["weather", "forecast", "rain", "temperature"], TaskKind::Research),
        rule("calendar", &["calendar", "meeting", "schedule", "appointment"], TaskKind::ToolExecution),
        rule("mail", &["email", "mail", "inbox"], TaskKind::ToolExecution),
        rule("contacts", &["contact", "contacts", "phone number"], TaskKind::Research),
        rule("home", &["lights", "thermostat", "lock", "home"], TaskKind::ToolExecution),
        rule("web", &["search", "look up", "research", "article"], TaskKind::Research),
    ]
}

fn default_persona_keywords() -> Vec<String> {
    [
        "feel", "feeling", "sad", "lonely", "anxious", "upset", "stressed", "grief", "hurt",
        "worried", "overwhelmed",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_dependency_markers() -> Vec<String> {
    ["then", "based on", "after that", "and then", "using the results", "combine"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl Default for ConcordConfig {
    fn default() -> Self {
        Self {
            quality_mode: QualityMode::default(),
            prefer_local_when_available: false,
            max_parallel_agents: default_max_parallel_agents(),
            per_task_cost_limit: default_per_task_cost_limit(),
            monthly_budget: default_monthly_budget(),
            confirmation_threshold: default_confirmation_threshold(),
            allow_budget_override: false,
            remote_complexity_threshold: default_remote_complexity_threshold(),
            join_timeout_secs: default_join_timeout_secs(),
            default_max_iterations: default_max_iterations(),
            default_timeout_secs: default_timeout_secs(),
            tool_retry_limit: default_tool_retry_limit(),
            iteration_backoff_ms: default_iteration_backoff_ms(),
            low_confidence_threshold: default_low_confidence_threshold(),
            data_dir: default_data_dir(),
            cognitive: CognitiveConfig::default(),
            domains: default_domains(),
            persona_keywords: default_persona_keywords(),
            dependency_markers: default_dependency_markers(),
        }
    }
}

impl ConcordConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConcordResult<Self> {
        let config: ConcordConfig = toml::from_str(content)
            .map_err(|e| ConcordError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> ConcordResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConcordError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Join timeout as a [`Duration`].
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConcordResult<()> {
        fn fraction(name: &str, value: f64) -> ConcordResult<()> {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConcordError::Config(format!(
                    "{name} must be within 0.0..=1.0, got {value}"
                )));
            }
            Ok(())
        }
        fn non_negative(name: &str, value: f64) -> ConcordResult<()> {
            if !value.is_finite() || value < 0.0 {
                return Err(ConcordError::Config(format!(
                    "{name} must be a non-negative amount, got {value}"
                )));
            }
            Ok(())
        }

        if self.max_parallel_agents == 0 {
            return Err(ConcordError::Config(
                "max_parallel_agents must be at least 1".into(),
            ));
        }
        non_negative("per_task_cost_limit", self.per_task_cost_limit)?;
        non_negative("monthly_budget", self.monthly_budget)?;
        non_negative("confirmation_threshold", self.confirmation_threshold)?;
        fraction("remote_complexity_threshold", self.remote_complexity_threshold)?;
        fraction("low_confidence_threshold", self.low_confidence_threshold)?;

        if self.join_timeout_secs == 0 || self.default_timeout_secs == 0 {
            return Err(ConcordError::Config("timeouts must be positive".into()));
        }
        if self.default_max_iterations == 0 {
            return Err(ConcordError::Config(
                "default_max_iterations must be at least 1".into(),
            ));
        }
        if self.cognitive.persist_every_n_ticks == 0 || self.cognitive.retention_versions == 0 {
            return Err(ConcordError::Config(
                "cognitive persistence and retention must be at least 1".into(),
            ));
        }
        for (id, settings) in &self.cognitive.agents {
            if settings.tick_interval_ms == 0 {
                return Err(ConcordError::Config(format!(
                    "cognitive agent '{id}' has a zero tick interval"
                )));
            }
        }

        let mut seen = HashSet::new();
        for domain in &self.domains {
            if !seen.insert(domain.name.as_str()) {
                return Err(ConcordError::Config(format!(
                    "duplicate domain '{}'",
                    domain.name
                )));
            }
            if domain.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(ConcordError::Config(format!(
                    "domain '{}' has no keywords",
                    domain.name
                )));
            }
        }
        Ok(())
    }
}
