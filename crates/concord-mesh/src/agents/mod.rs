//! Built-in cognitive agents.

mod affect;
mod memory;
mod patterns;
mod trajectory;

pub use affect::{AffectAgent, AFFECT_AGENT};
pub use memory::{Fact, MemoryAgent, MEMORY_AGENT};
pub use patterns::{UserPatternAgent, USER_PATTERNS_AGENT};
pub use trajectory::{TrajectoryAgent, CONVERSATION_TOPIC, TRAJECTORY_AGENT};

use crate::agent::CognitiveAgent;

/// One fresh instance of every built-in agent.
pub fn default_agents() -> Vec<Box<dyn CognitiveAgent>> {
    vec![
        Box::new(MemoryAgent::new()),
        Box::new(UserPatternAgent::new()),
        Box::new(TrajectoryAgent::new()),
        Box::new(AffectAgent::new()),
    ]
}
