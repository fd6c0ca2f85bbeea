use chrono::{DateTime, Utc};
use concord_core::{CognitiveSnapshot, ConcordResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something the orchestrator saw, fanned out to every cognitive agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    /// An incoming request.
    Request {
        /// Raw request text.
        text: String,
        /// Domains the request touched.
        domains: Vec<String>,
        /// Facts supplied with the request (e.g. tool results).
        #[serde(default)]
        facts: BTreeMap<String, serde_json::Value>,
        /// When it arrived.
        at: DateTime<Utc>,
    },
    /// A work item reached a terminal state.
    Outcome {
        /// The work item.
        work_id: Uuid,
        /// Its domain, if any.
        domain: Option<String>,
        /// Whether it completed.
        success: bool,
        /// Result confidence.
        confidence: f64,
        /// Result summary.
        summary: String,
    },
}

/// Everything an agent sees on one tick.
#[derive(Debug, Clone)]
pub struct TickInput {
    /// Tick counter of the agent, starting at 1.
    pub tick: u64,
    /// Observations received since the previous tick, in arrival order.
    pub observations: Vec<Observation>,
    /// Latest snapshot of every other agent. May be one version behind.
    pub peers: HashMap<String, Arc<CognitiveSnapshot>>,
    /// Tick time.
    pub now: DateTime<Utc>,
}

impl TickInput {
    /// An input with no observations and no peers.
    pub fn empty(tick: u64) -> Self {
        Self {
            tick,
            observations: Vec::new(),
            peers: HashMap::new(),
            now: Utc::now(),
        }
    }

    /// Add an observation.
    pub fn with_observation(mut self, observation: Observation) -> Self {
        self.observations.push(observation);
        self
    }

    /// Add a peer snapshot.
    pub fn with_peer(mut self, snapshot: CognitiveSnapshot) -> Self {
        self.peers
            .insert(snapshot.agent_id.clone(), Arc::new(snapshot));
        self
    }

    /// Payload of a peer, if it published anything.
    pub fn peer_data(&self, agent_id: &str) -> Option<&serde_json::Value> {
        self.peers
            .get(agent_id)
            .map(|s| &s.data)
            .filter(|d| !d.is_null())
    }
}

/// A long-lived background agent owning one slice of shared context.
///
/// An agent instance is owned by exactly one tick loop; it never shares
/// mutable state. Each successful tick returns the payload of its next
/// snapshot.
pub trait CognitiveAgent: Send + 'static {
    /// Stable identifier, also the snapshot key.
    fn id(&self) -> &str;

    /// Rebuild internal state from a persisted payload.
    fn restore(&mut self, data: &serde_json::Value) -> ConcordResult<()>;

    /// Run one update and return the new payload.
    fn tick(&mut self, input: &TickInput) -> ConcordResult<serde_json::Value>;
}

/// Send side of the observation channel.
///
/// Cheap to clone. Sending never blocks; observations sent while no agent is
/// running are dropped.
#[derive(Clone)]
pub struct MeshObserver {
    tx: broadcast::Sender<Observation>,
}

impl MeshObserver {
    pub(crate) fn new(tx: broadcast::Sender<Observation>) -> Self {
        Self { tx }
    }

    /// Fan an observation out to every running agent.
    pub fn observe(&self, observation: Observation) {
        if self.tx.send(observation).is_err() {
            tracing::debug!("No cognitive agent is listening, observation dropped");
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.tx.subscribe()
    }
}

/// Deserialize a persisted payload into `T`, keeping `T::default()` for the
/// version-zero (null) payload.
pub(crate) fn restore_state<T>(data: &serde_json::Value) -> ConcordResult<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if data.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(data.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_serialization() {
        let obs = Observation::Outcome {
            work_id: Uuid::new_v4(),
            domain: Some("flights".into()),
            success: true,
            confidence: 0.9,
            summary: "LH123".into(),
        };
        let json = serde_json::to_string(&obs).unwrap();
        assert!(json.contains("\"type\":\"outcome\""));
        let parsed: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, obs);
    }

    #[test]
    fn test_peer_data_skips_initial() {
        let input = TickInput::empty(1).with_peer(CognitiveSnapshot::initial("trajectory"));
        assert!(input.peer_data("trajectory").is_none());
        assert!(input.peer_data("memory").is_none());
    }

    #[test]
    fn test_restore_state_null_is_default() {
        let v: Vec<u32> = restore_state(&serde_json::Value::Null).unwrap();
        assert!(v.is_empty());
        let v: Vec<u32> = restore_state(&serde_json::json!([1, 2])).unwrap();
        assert_eq!(v, vec![1, 2]);
        assert!(restore_state::<Vec<u32>>(&serde_json::json!("x")).is_err());
    }
}
