use crate::agent::{restore_state, CognitiveAgent, Observation, TickInput};
use concord_core::ConcordResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent id of [`UserPatternAgent`].
pub const USER_PATTERNS_AGENT: &str = "user_patterns";

const PREDICTIONS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct DomainOutcomes {
    completed: u64,
    failed: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PatternState {
    domain_counts: BTreeMap<String, u64>,
    outcomes: BTreeMap<String, DomainOutcomes>,
    predicted_next: Vec<String>,
    success_rate: BTreeMap<String, f64>,
}

/// Learns which domains the user asks about and predicts the next ones.
#[derive(Debug, Default)]
pub struct UserPatternAgent {
    state: PatternState,
}

impl UserPatternAgent {
    /// No history.
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_predictions(&mut self) {
        let mut ranked: Vec<(&String, &u64)> = self.state.domain_counts.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        self.state.predicted_next = ranked
            .into_iter()
            .take(PREDICTIONS)
            .map(|(d, _)| d.clone())
            .collect();

        self.state.success_rate = self
            .state
            .outcomes
            .iter()
            .map(|(domain, o)| {
                let total = o.completed + o.failed;
                (domain.clone(), o.completed as f64 / total.max(1) as f64)
            })
            .collect();
    }
}

impl CognitiveAgent for UserPatternAgent {
    fn id(&self) -> &str {
        USER_PATTERNS_AGENT
    }

    fn restore(&mut self, data: &serde_json::Value) -> ConcordResult<()> {
        self.state = restore_state(data)?;
        Ok(())
    }

    fn tick(&mut self, input: &TickInput) -> ConcordResult<serde_json::Value> {
        for observation in &input.observations {
            match observation {
                Observation::Request { domains, .. } => {
                    for domain in domains {
                        *self.state.domain_counts.entry(domain.clone()).or_default() += 1;
                    }
                }
                Observation::Outcome {
                    domain: Some(domain),
                    success,
                    ..
                } => {
                    let entry = self.state.outcomes.entry(domain.clone()).or_default();
                    if *success {
                        entry.completed += 1;
                    } else {
                        entry.failed += 1;
                    }
                }
                Observation::Outcome { .. } => {}
            }
        }
        self.refresh_predictions();
        Ok(serde_json::to_value(&self.state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(domains: &[&str]) -> Observation {
        Observation::Request {
            text: String::new(),
            domains: domains.iter().map(|d| (*d).to_string()).collect(),
            facts: BTreeMap::new(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_predictions_rank_by_frequency() {
        let mut agent = UserPatternAgent::new();
        let input = TickInput::empty(1)
            .with_observation(request(&["weather"]))
            .with_observation(request(&["weather", "calendar"]))
            .with_observation(request(&["hotels"]))
            .with_observation(request(&["calendar"]))
            .with_observation(request(&["weather", "flights"]));
        let out = agent.tick(&input).unwrap();
        assert_eq!(out["predicted_next"], serde_json::json!(["weather", "calendar", "flights"]));
        assert_eq!(out["domain_counts"]["weather"], 3);
    }

    #[test]
    fn test_success_rate() {
        let mut agent = UserPatternAgent::new();
        let outcome = |success| Observation::Outcome {
            work_id: uuid::Uuid::new_v4(),
            domain: Some("mail".into()),
            success,
            confidence: 1.0,
            summary: String::new(),
        };
        let input = TickInput::empty(1)
            .with_observation(outcome(true))
            .with_observation(outcome(true))
            .with_observation(outcome(false))
            .with_observation(outcome(true));
        let out = agent.tick(&input).unwrap();
        assert_eq!(out["success_rate"]["mail"], 0.75);
    }
}
