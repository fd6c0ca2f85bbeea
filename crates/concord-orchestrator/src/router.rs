use crate::analysis::{RequestAnalysis, RequestAnalyzer};
use crate::plan::ExecutionPlan;
use crate::request::{Request, Strategy};
use concord_agent::{ToolRegistry, SYNTHESIS_OUTPUT};
use concord_core::{
    ConcordConfig, ConcordError, ConcordResult, Constraints, ContextSnapshot, QualityMode,
    SuccessCriterion, TaskKind, Tier, WorkSpecification,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Requests at or below this complexity with a single tool call run inline.
pub const DIRECT_COMPLEXITY_CEILING: f64 = 0.35;

/// Domain key of the synthesis node of hybrid plans.
pub const SYNTHESIS_DOMAIN: &str = "synthesis";

/// Router policy derived from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouterPolicy {
    /// Quality/cost trade-off of tier choices.
    pub quality_mode: QualityMode,
    /// Prefer the local tier when both are acceptable.
    pub prefer_local: bool,
    /// Complexity above which work goes remote.
    pub remote_complexity_threshold: f64,
    /// Highest complexity still answered by a direct tool call.
    pub direct_complexity_ceiling: f64,
}

impl From<&ConcordConfig> for RouterPolicy {
    fn from(config: &ConcordConfig) -> Self {
        Self {
            quality_mode: config.quality_mode,
            prefer_local: config.prefer_local_when_available,
            remote_complexity_threshold: config.remote_complexity_threshold,
            direct_complexity_ceiling: DIRECT_COMPLEXITY_CEILING,
        }
    }
}

/// One row of the classification table.
struct DecisionRule {
    name: &'static str,
    strategy: Strategy,
    applies: fn(&RequestAnalysis, &RouterPolicy) -> bool,
}

/// Ordered classification table; the first matching row wins.
const DECISION_TABLE: &[DecisionRule] = &[
    DecisionRule {
        name: "persona_continuity",
        strategy: Strategy::Direct,
        applies: |a, _| a.persona_sensitive,
    },
    DecisionRule {
        name: "single_tool_call",
        strategy: Strategy::Direct,
        applies: |a, p| {
            a.domains.len() == 1 && a.tool_calls == 1 && a.complexity <= p.direct_complexity_ceiling
        },
    },
    DecisionRule {
        name: "single_domain",
        strategy: Strategy::Single,
        applies: |a, _| a.domains.len() == 1,
    },
    DecisionRule {
        name: "independent_domains",
        strategy: Strategy::Parallel,
        applies: |a, _| a.domains.len() > 1 && !a.has_dependencies,
    },
    DecisionRule {
        name: "dependent_domains",
        strategy: Strategy::Hybrid,
        applies: |a, _| a.domains.len() > 1 && a.has_dependencies,
    },
];

/// Name of the fallback row.
pub const FALLBACK_RULE: &str = "conversational";

/// The router's decision for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    /// Execution strategy for the request.
    pub strategy: Strategy,
    /// Name of the decision-table row that matched.
    pub rule: String,
    /// Analysis the decision was based on.
    pub analysis: RequestAnalysis,
}

/// Inputs of the per-item tier decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierRequest {
    /// Estimated complexity of the item.
    pub complexity: f64,
    /// The caller forbids the local tier.
    pub requires_remote: bool,
    /// Continuous/background work always runs locally.
    pub background: bool,
    /// Estimate of the item on the remote tier.
    pub remote_estimate: f64,
    /// Remaining monthly budget.
    pub remaining_budget: f64,
}

/// A tier and the policy that chose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierChoice {
    /// Chosen tier.
    pub tier: Tier,
    /// Policy that made the choice.
    pub reason: &'static str,
}

/// Classifies requests and turns them into execution plans.
pub struct ExecutionRouter {
    policy: RouterPolicy,
    analyzer: RequestAnalyzer,
    max_iterations: u32,
    timeout_secs: u64,
}

impl ExecutionRouter {
    /// Build a router from the configuration.
    pub fn new(config: &ConcordConfig) -> ConcordResult<Self> {
        Ok(Self {
            policy: RouterPolicy::from(config),
            analyzer: RequestAnalyzer::new(config)?,
            max_iterations: config.default_max_iterations,
            timeout_secs: config.default_timeout_secs,
        })
    }

    /// Policy in effect.
    pub fn policy(&self) -> RouterPolicy {
        self.policy
    }

    /// Analyzer used to classify requests.
    pub fn analyzer(&self) -> &RequestAnalyzer {
        &self.analyzer
    }

    /// Analyze and classify a request.
    pub fn route(&self, text: &str) -> Routing {
        let analysis = self.analyzer.analyze(text);
        let (strategy, rule) = self.classify(&analysis);
        debug!(
            strategy = %strategy,
            rule,
            domains = ?analysis.domains,
            complexity = analysis.complexity,
            "Request classified"
        );
        Routing {
            strategy,
            rule: rule.to_string(),
            analysis,
        }
    }

    /// Walk the decision table; falls back to `direct`.
    pub fn classify(&self, analysis: &RequestAnalysis) -> (Strategy, &'static str) {
        DECISION_TABLE
            .iter()
            .find(|row| (row.applies)(analysis, &self.policy))
            .map_or((Strategy::Direct, FALLBACK_RULE), |row| (row.strategy, row.name))
    }

    /// Tier policy. A request flagged `requires_remote` always stays remote;
    /// budget problems are surfaced by the cost controller instead.
    pub fn select_tier(&self, request: &TierRequest) -> TierChoice {
        let choice = |tier, reason| TierChoice { tier, reason };
        if request.requires_remote {
            return choice(Tier::Remote, "requires_remote");
        }
        if request.background {
            return choice(Tier::Local, "background");
        }
        if self.policy.prefer_local {
            return choice(Tier::Local, "prefer_local");
        }
        if request.remote_estimate > request.remaining_budget {
            return choice(Tier::Local, "budget");
        }
        match self.policy.quality_mode {
            QualityMode::Economy => return choice(Tier::Local, "economy"),
            QualityMode::Performance => return choice(Tier::Remote, "performance"),
            QualityMode::Balanced => {}
        }
        if request.complexity > self.policy.remote_complexity_threshold {
            return choice(Tier::Remote, "complexity");
        }
        choice(Tier::Local, "default")
    }

    /// Create the work items and plan for a delegated request. Items are
    /// pending; tiers and estimates are filled in by the caller.
    pub fn build_plan(
        &self,
        request: &Request,
        routing: &Routing,
        context: &ContextSnapshot,
        tools: &ToolRegistry,
    ) -> ConcordResult<(ExecutionPlan, Vec<WorkSpecification>)> {
        if routing.strategy == Strategy::Direct {
            return Err(ConcordError::Orchestrator(
                "direct requests are handled inline and have no plan".into(),
            ));
        }
        let mut plan = ExecutionPlan::new(routing.strategy);
        let mut specs = Vec::new();

        for domain in &routing.analysis.domains {
            let rule = self.analyzer.rule(domain).ok_or_else(|| {
                ConcordError::Orchestrator(format!("no routing rule for domain '{domain}'"))
            })?;
            let mut allowed: BTreeSet<String> = tools.tools_for_domain(domain).into_iter().collect();
            allowed.extend(rule.tool.clone());
            let criteria = match &rule.tool {
                Some(tool) => vec![SuccessCriterion::tool_succeeded(tool.clone())],
                None => Vec::new(),
            };
            let spec = WorkSpecification::new(rule.kind, request.text.clone())
                .with_domain(domain.clone())
                .in_plan(plan.id)
                .with_criteria(criteria)
                .with_context(context_for_domain(context, domain))
                .with_constraints(self.constraints(allowed, request.requires_remote));
            plan.add(&spec);
            specs.push(spec);
        }

        if routing.strategy == Strategy::Hybrid {
            let upstream = specs.iter().map(|s| s.id).collect();
            let synthesis = WorkSpecification::new(TaskKind::Synthesis, request.text.clone())
                .with_domain(SYNTHESIS_DOMAIN)
                .in_plan(plan.id)
                .with_criteria(vec![SuccessCriterion::tool_succeeded(SYNTHESIS_OUTPUT)])
                .with_context(context_for_domain(context, SYNTHESIS_DOMAIN))
                .with_constraints(self.constraints(BTreeSet::new(), request.requires_remote))
                .with_dependencies(upstream);
            plan.add(&synthesis);
            specs.push(synthesis);
        }

        plan.validate()?;
        Ok((plan, specs))
    }

    fn constraints(&self, allowed_tools: BTreeSet<String>, requires_remote: bool) -> Constraints {
        Constraints {
            max_iterations: self.max_iterations,
            timeout_secs: self.timeout_secs,
            preferred_tier: Tier::Local,
            allowed_tools,
            requires_remote,
        }
    }
}

/// The slice of the request context a domain's worker gets: everything
/// except memory facts about other domains.
pub fn context_for_domain(context: &ContextSnapshot, domain: &str) -> ContextSnapshot {
    let own = format!("memory.{domain}.");
    let facts = context
        .facts
        .iter()
        .filter(|(key, _)| {
            !key.starts_with("memory.")
                || key.starts_with(&own)
                || key.starts_with("memory.user.")
                || domain == SYNTHESIS_DOMAIN
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    ContextSnapshot {
        facts,
        source_versions: context.source_versions.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(config: &ConcordConfig) -> ExecutionRouter {
        ExecutionRouter::new(config).unwrap()
    }

    fn tier_request() -> TierRequest {
        TierRequest {
            complexity: 0.4,
            requires_remote: false,
            background: false,
            remote_estimate: 0.04,
            remaining_budget: 20.0,
        }
    }

    #[test]
    fn test_decision_table_rows() {
        let r = router(&ConcordConfig::default());
        let cases = [
            ("What's 2+2?", Strategy::Direct, FALLBACK_RULE),
            ("I feel lonely, can you check the weather?", Strategy::Direct, "persona_continuity"),
            ("Weather in Lisbon?", Strategy::Direct, "single_tool_call"),
            (
                "Find me a quiet hotel near the old town in Lisbon for three nights with breakfast included",
                Strategy::Single,
                "single_domain",
            ),
            ("Flights and hotels for Rome", Strategy::Parallel, "independent_domains"),
            (
                "Check the weather then pick hotels based on it",
                Strategy::Hybrid,
                "dependent_domains",
            ),
        ];
        for (text, strategy, rule) in cases {
            let routing = r.route(text);
            assert_eq!(routing.strategy, strategy, "{text}");
            assert_eq!(routing.rule, rule, "{text}");
        }
    }

    #[test]
    fn test_tier_policy_order() {
        let r = router(&ConcordConfig::default());
        assert_eq!(r.select_tier(&tier_request()).tier, Tier::Local);

        let complex = TierRequest { complexity: 0.9, ..tier_request() };
        assert_eq!(r.select_tier(&complex), TierChoice { tier: Tier::Remote, reason: "complexity" });

        let broke = TierRequest { remaining_budget: 0.01, ..complex };
        assert_eq!(r.select_tier(&broke).reason, "budget");

        let forced = TierRequest { requires_remote: true, remaining_budget: 0.0, ..tier_request() };
        assert_eq!(r.select_tier(&forced).tier, Tier::Remote);

        let background = TierRequest { background: true, ..complex };
        assert_eq!(r.select_tier(&background).tier, Tier::Local);

        let perf = router(&ConcordConfig {
            quality_mode: QualityMode::Performance,
            ..ConcordConfig::default()
        });
        assert_eq!(perf.select_tier(&tier_request()).reason, "performance");

        let economy = router(&ConcordConfig {
            quality_mode: QualityMode::Economy,
            ..ConcordConfig::default()
        });
        assert_eq!(economy.select_tier(&complex).tier, Tier::Local);

        let local = router(&ConcordConfig {
            prefer_local_when_available: true,
            quality_mode: QualityMode::Performance,
            ..ConcordConfig::default()
        });
        assert_eq!(local.select_tier(&complex).tier, Tier::Local);
    }

    #[test]
    fn test_build_parallel_plan() {
        let r = router(&ConcordConfig::default());
        let request = Request::new("Flights, hotels, activities and restaurants in Rome");
        let routing = r.route(&request.text);
        let context = ContextSnapshot::default()
            .with_fact("memory.flights.airline", "TAP".into())
            .with_fact("memory.hotels.chain", "Ibis".into())
            .with_fact("memory.user.name", "Sam".into());
        let (plan, specs) = r
            .build_plan(&request, &routing, &context, &ToolRegistry::new())
            .unwrap();

        assert_eq!(plan.strategy, Strategy::Parallel);
        assert_eq!(specs.len(), 4);
        let flights = specs.iter().find(|s| s.domain.as_deref() == Some("flights")).unwrap();
        assert_eq!(flights.plan_id, Some(plan.id));
        assert!(flights.constraints.allowed_tools.contains("flights"));
        assert!(flights.context.facts.contains_key("memory.flights.airline"));
        assert!(flights.context.facts.contains_key("memory.user.name"));
        assert!(!flights.context.facts.contains_key("memory.hotels.chain"));
    }

    #[test]
    fn test_build_hybrid_plan_adds_synthesis() {
        let r = router(&ConcordConfig::default());
        let request = Request::new("Check the weather then pick hotels based on it").requiring_remote();
        let routing = r.route(&request.text);
        let (plan, specs) = r
            .build_plan(&request, &routing, &ContextSnapshot::default(), &ToolRegistry::new())
            .unwrap();
        assert_eq!(specs.len(), 3);
        let synthesis = specs.last().unwrap();
        assert_eq!(synthesis.kind, TaskKind::Synthesis);
        assert_eq!(synthesis.dependencies.len(), 2);
        assert!(synthesis.constraints.requires_remote);
        assert_eq!(plan.ready(&Default::default(), &Default::default()).len(), 2);
    }

    #[test]
    fn test_direct_has_no_plan() {
        let r = router(&ConcordConfig::default());
        let request = Request::new("What's 2+2?");
        let routing = r.route(&request.text);
        assert!(r
            .build_plan(&request, &routing, &ContextSnapshot::default(), &ToolRegistry::new())
            .is_err());
    }
}
