//! Always-on cognitive agents for the Concord engine.
//!
//! Each agent runs on its own timer, reads its peers' latest snapshots, and
//! publishes a new immutable version of its own slice of context. The
//! orchestrator only ever reads the [`SnapshotBoard`]; reads never block and
//! never observe a partial version.
//!
//! # Main types
//!
//! - [`CognitiveAgent`] — Trait implemented by every background agent.
//! - [`SnapshotBoard`] — Append-only, per-agent versioned snapshot space.
//! - [`CognitiveMesh`] — Builder-configured set of agents with warm start.
//! - [`MeshHandle`] — Handle to the running tick loops.
//! - [`Observation`] — Request and outcome events fanned out to agents.

/// The agent trait, tick input and observation channel.
pub mod agent;
/// Built-in agents.
pub mod agents;
/// Versioned snapshot space.
pub mod board;
/// Mesh runtime.
pub mod mesh;

pub use agent::{CognitiveAgent, MeshObserver, Observation, TickInput};
pub use agents::{
    default_agents, AffectAgent, MemoryAgent, TrajectoryAgent, UserPatternAgent, AFFECT_AGENT,
    MEMORY_AGENT, TRAJECTORY_AGENT, USER_PATTERNS_AGENT,
};
pub use board::SnapshotBoard;
pub use mesh::{CognitiveMesh, MeshBuilder, MeshHandle};
