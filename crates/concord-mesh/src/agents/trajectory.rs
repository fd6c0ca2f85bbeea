use crate::agent::{restore_state, CognitiveAgent, Observation, TickInput};
use concord_core::ConcordResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Agent id of [`TrajectoryAgent`].
pub const TRAJECTORY_AGENT: &str = "trajectory";

const WINDOW: usize = 8;
/// Topic recorded for requests that touched no domain.
pub const CONVERSATION_TOPIC: &str = "conversation";

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrajectoryState {
    recent: VecDeque<String>,
    focus: Option<String>,
    topic_shift: bool,
    requests_seen: u64,
}

/// Follows where the conversation is heading: a sliding window of recent
/// topics, the current focus and whether the last request changed subject.
#[derive(Debug, Default)]
pub struct TrajectoryAgent {
    state: TrajectoryState,
}

impl TrajectoryAgent {
    /// Empty trajectory.
    pub fn new() -> Self {
        Self::default()
    }

    fn focus_of(recent: &VecDeque<String>) -> Option<String> {
        let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for (pos, topic) in recent.iter().enumerate() {
            let entry = counts.entry(topic.as_str()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = pos;
        }
        // Most frequent, ties go to the most recent.
        counts
            .into_iter()
            .max_by_key(|(_, (count, last))| (*count, *last))
            .map(|(topic, _)| topic.to_string())
    }
}

impl CognitiveAgent for TrajectoryAgent {
    fn id(&self) -> &str {
        TRAJECTORY_AGENT
    }

    fn restore(&mut self, data: &serde_json::Value) -> ConcordResult<()> {
        self.state = restore_state(data)?;
        Ok(())
    }

    fn tick(&mut self, input: &TickInput) -> ConcordResult<serde_json::Value> {
        for observation in &input.observations {
            let Observation::Request { domains, .. } = observation else {
                continue;
            };
            let topics: Vec<String> = if domains.is_empty() {
                vec![CONVERSATION_TOPIC.to_string()]
            } else {
                domains.clone()
            };
            let previous_focus = self.state.focus.clone();
            self.state.topic_shift = match &previous_focus {
                Some(focus) => !topics.contains(focus),
                None => false,
            };
            for topic in topics {
                self.state.recent.push_back(topic);
            }
            while self.state.recent.len() > WINDOW {
                self.state.recent.pop_front();
            }
            self.state.requests_seen += 1;
            self.state.focus = Self::focus_of(&self.state.recent);
        }
        Ok(serde_json::to_value(&self.state)?)
    }
}
