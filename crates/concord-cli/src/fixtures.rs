//! Fixture tool providers.
//!
//! Each `[[tools]]` entry of the config becomes a provider that answers with a
//! canned response after an optional delay, or fails with a canned error.
//! They stand in for real capability providers when exercising the engine.

use async_trait::async_trait;
use concord_agent::{ToolDescriptor, ToolProvider, ToolRegistry};
use concord_core::ToolError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// One `[[tools]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FixtureToolConfig {
    /// Tool name.
    pub name: String,
    /// Domains the tool answers for; defaults to its own name.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Canned answer. `{query}` is replaced by the request text.
    #[serde(default)]
    pub response: String,
    /// Delay before answering, in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
    /// Raw provider error to fail with, classified as transient or permanent.
    #[serde(default)]
    pub fail_with: Option<String>,
}

/// A provider built from a [`FixtureToolConfig`].
pub struct FixtureTool {
    descriptor: ToolDescriptor,
    response: String,
    latency: Duration,
    fail_with: Option<String>,
}

impl FixtureTool {
    /// Build the provider described by `config`.
    pub fn new(config: &FixtureToolConfig) -> Self {
        let domains = if config.domains.is_empty() {
            vec![config.name.clone()]
        } else {
            config.domains.clone()
        };
        Self {
            descriptor: ToolDescriptor::new(config.name.clone(), "fixture tool")
                .with_domains(domains),
            response: config.response.clone(),
            latency: Duration::from_millis(config.latency_ms),
            fail_with: config.fail_with.clone(),
        }
    }
}

#[async_trait]
impl ToolProvider for FixtureTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: serde_json::Value) -> Result<String, ToolError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(message) = &self.fail_with {
            return Err(ToolError::classify(message.clone()));
        }
        let query = params["query"].as_str().unwrap_or_default();
        Ok(self.response.replace("{query}", query))
    }
}

/// Registry holding one fixture provider per entry.
pub fn build_registry(configs: &[FixtureToolConfig]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for config in configs {
        registry.register(Arc::new(FixtureTool::new(config)));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> FixtureToolConfig {
        FixtureToolConfig {
            name: name.into(),
            domains: vec![],
            response: "forecast for {query}".into(),
            latency_ms: 0,
            fail_with: None,
        }
    }

    #[tokio::test]
    async fn test_response_template() {
        let tool = FixtureTool::new(&fixture("weather"));
        let out = tool
            .invoke(serde_json::json!({ "query": "Lisbon" }))
            .await
            .unwrap();
        assert_eq!(out, "forecast for Lisbon");
        assert_eq!(tool.descriptor().domains, vec!["weather".to_string()]);
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let transient = FixtureTool::new(&FixtureToolConfig {
            fail_with: Some("HTTP 429 Too Many Requests".into()),
            ..fixture("mail")
        });
        let err = transient.invoke(serde_json::json!({})).await.unwrap_err();
        assert!(err.is_transient());

        let permanent = FixtureTool::new(&FixtureToolConfig {
            fail_with: Some("403 Forbidden".into()),
            ..fixture("mail")
        });
        let err = permanent.invoke(serde_json::json!({})).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_registry_by_domain() {
        let registry = build_registry(&[
            fixture("weather"),
            FixtureToolConfig {
                domains: vec!["flights".into(), "hotels".into()],
                ..fixture("travel")
            },
        ]);
        assert_eq!(registry.tool_count(), 2);
        assert_eq!(registry.tools_for_domain("hotels"), vec!["travel".to_string()]);
    }
}
