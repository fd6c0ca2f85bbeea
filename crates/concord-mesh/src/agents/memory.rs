use crate::agent::{restore_state, CognitiveAgent, Observation, TickInput};
use concord_core::ConcordResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent id of [`MemoryAgent`].
pub const MEMORY_AGENT: &str = "memory";

const DECAY: f64 = 0.95;
const REINFORCE: f64 = 0.5;
const PRUNE_BELOW: f64 = 0.05;

/// A consolidated fact and how strongly it is remembered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Latest value.
    pub value: serde_json::Value,
    /// Strength in `0.0..=1.0`; decays every tick, reinforced when seen again.
    pub strength: f64,
    /// Times the fact was observed.
    pub reinforced: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    facts: BTreeMap<String, Fact>,
}

/// Consolidates facts seen in requests and outcomes.
///
/// Facts decay a little on every tick and are pruned once they fall below a
/// floor; seeing a fact again reinforces it.
#[derive(Debug, Default)]
pub struct MemoryAgent {
    state: MemoryState,
}

impl MemoryAgent {
    /// Empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    fn remember(&mut self, key: String, value: serde_json::Value) {
        let fact = self.state.facts.entry(key).or_insert(Fact {
            value: serde_json::Value::Null,
            strength: 0.0,
            reinforced: 0,
        });
        fact.value = value;
        fact.strength = (fact.strength + REINFORCE).min(1.0);
        fact.reinforced += 1;
    }
}

impl CognitiveAgent for MemoryAgent {
    fn id(&self) -> &str {
        MEMORY_AGENT
    }

    fn restore(&mut self, data: &serde_json::Value) -> ConcordResult<()> {
        self.state = restore_state(data)?;
        Ok(())
    }

    fn tick(&mut self, input: &TickInput) -> ConcordResult<serde_json::Value> {
        for fact in self.state.facts.values_mut() {
            fact.strength *= DECAY;
        }
        for observation in &input.observations {
            match observation {
                Observation::Request { facts, .. } => {
                    for (key, value) in facts {
                        self.remember(key.clone(), value.clone());
                    }
                }
                Observation::Outcome {
                    domain: Some(domain),
                    success: true,
                    summary,
                    ..
                } => {
                    self.remember(format!("{domain}.last_result"), summary.clone().into());
                }
                Observation::Outcome { .. } => {}
            }
        }
        let before = self.state.facts.len();
        self.state.facts.retain(|_, f| f.strength >= PRUNE_BELOW);
        let pruned = before - self.state.facts.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Memory pruned faded facts");
        }
        Ok(serde_json::to_value(&self.state)?)
    }
}
