use concord_core::{ConcordConfig, ConcordError, ConcordResult, DomainRule};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What the router needs to know about a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAnalysis {
    /// Matched domains, in configuration order.
    pub domains: Vec<String>,
    /// The request needs the single persona voice (emotional content).
    pub persona_sensitive: bool,
    /// Matched domains that are served by a tool.
    pub tool_calls: usize,
    /// Rough complexity estimate in `0.0..=1.0`.
    pub complexity: f64,
    /// Sub-tasks depend on each other's results.
    pub has_dependencies: bool,
}

struct CompiledDomain {
    rule: DomainRule,
    pattern: Regex,
}

/// Keyword-table request analysis.
pub struct RequestAnalyzer {
    domains: Vec<CompiledDomain>,
    persona: Option<Regex>,
    dependency: Option<Regex>,
}

/// Case-insensitive whole-word alternation; `None` for an empty list.
fn keyword_regex(keywords: &[String]) -> ConcordResult<Option<Regex>> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| ConcordError::Config(format!("invalid keyword pattern: {e}")))
}

impl RequestAnalyzer {
    /// Compile the keyword tables of `config`.
    pub fn new(config: &ConcordConfig) -> ConcordResult<Self> {
        let mut domains = Vec::with_capacity(config.domains.len());
        for rule in &config.domains {
            let Some(pattern) = keyword_regex(&rule.keywords)? else {
                continue;
            };
            domains.push(CompiledDomain {
                rule: rule.clone(),
                pattern,
            });
        }
        Ok(Self {
            domains,
            persona: keyword_regex(&config.persona_keywords)?,
            dependency: keyword_regex(&config.dependency_markers)?,
        })
    }

    /// Routing rule of a domain.
    pub fn rule(&self, domain: &str) -> Option<&DomainRule> {
        self.domains
            .iter()
            .map(|d| &d.rule)
            .find(|r| r.name == domain)
    }

    /// Match the request text against the domain rules.
    pub fn analyze(&self, text: &str) -> RequestAnalysis {
        let matched: Vec<&DomainRule> = self
            .domains
            .iter()
            .filter(|d| d.pattern.is_match(text))
            .map(|d| &d.rule)
            .collect();
        let persona_sensitive = self.persona.as_ref().is_some_and(|p| p.is_match(text));
        let has_dependencies = self.dependency.as_ref().is_some_and(|p| p.is_match(text));
        let tool_calls = matched.iter().filter(|r| r.tool.is_some()).count();

        let words = text.split_whitespace().count() as f64;
        let mut complexity = 0.1 + 0.15 * matched.len() as f64 + (words / 60.0).min(0.3);
        if has_dependencies {
            complexity += 0.2;
        }

        RequestAnalysis {
            domains: matched.iter().map(|r| r.name.clone()).collect(),
            persona_sensitive,
            tool_calls,
            complexity: complexity.min(1.0),
            has_dependencies,
        }
    }
}
