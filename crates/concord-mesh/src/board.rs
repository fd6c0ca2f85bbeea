use concord_core::{CognitiveSnapshot, ConcordError, ConcordResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

struct Slot {
    latest: watch::Sender<Arc<CognitiveSnapshot>>,
    history: Mutex<VecDeque<Arc<CognitiveSnapshot>>>,
}

/// Append-only snapshot space shared by the mesh and its readers.
///
/// Each agent gets one `watch` channel holding an `Arc` of its newest
/// snapshot. Publishing swaps the `Arc`; readers clone it without waiting on
/// writers and always see a complete version. A short history per agent is
/// kept for inspection; older versions are dropped.
pub struct SnapshotBoard {
    slots: HashMap<String, Slot>,
    retention: usize,
}

impl SnapshotBoard {
    /// A board with one version-zero slot per agent id.
    pub fn new<I, S>(agent_ids: I, retention: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = agent_ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                let initial = Arc::new(CognitiveSnapshot::initial(id.clone()));
                let (latest, _) = watch::channel(Arc::clone(&initial));
                let slot = Slot {
                    latest,
                    history: Mutex::new(VecDeque::from([initial])),
                };
                (id, slot)
            })
            .collect();
        Self {
            slots,
            retention: retention.max(1),
        }
    }

    /// Registered agent ids, sorted.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Newest published snapshot of an agent. Never blocks.
    pub fn latest_snapshot(&self, agent_id: &str) -> Option<Arc<CognitiveSnapshot>> {
        self.slots
            .get(agent_id)
            .map(|slot| Arc::clone(&slot.latest.borrow()))
    }

    /// Newest snapshot of every agent.
    pub fn latest_all(&self) -> BTreeMap<String, Arc<CognitiveSnapshot>> {
        self.slots
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(&slot.latest.borrow())))
            .collect()
    }

    /// Current version of every agent.
    pub fn versions(&self) -> BTreeMap<String, u64> {
        self.latest_all()
            .into_iter()
            .map(|(id, snap)| (id, snap.version))
            .collect()
    }

    /// Retained versions of an agent, oldest first.
    pub fn history(&self, agent_id: &str) -> Vec<Arc<CognitiveSnapshot>> {
        self.slots
            .get(agent_id)
            .map(|slot| slot.history.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Receiver notified on every publish of an agent.
    pub fn subscribe(&self, agent_id: &str) -> Option<watch::Receiver<Arc<CognitiveSnapshot>>> {
        self.slots.get(agent_id).map(|slot| slot.latest.subscribe())
    }

    /// Publish a new version. It must be newer than the current one.
    pub fn publish(&self, snapshot: CognitiveSnapshot) -> ConcordResult<Arc<CognitiveSnapshot>> {
        let slot = self.slots.get(&snapshot.agent_id).ok_or_else(|| {
            ConcordError::NotFound(format!("cognitive agent '{}'", snapshot.agent_id))
        })?;
        // The history lock also serializes publishers of the same agent.
        let mut history = slot.history.lock();
        let current = slot.latest.borrow().version;
        if snapshot.version <= current {
            return Err(ConcordError::VersionConflict {
                key: format!("snapshot/{}", snapshot.agent_id),
                expected: current + 1,
                found: snapshot.version,
            });
        }

        let snapshot = Arc::new(snapshot);
        history.push_back(Arc::clone(&snapshot));
        while history.len() > self.retention {
            history.pop_front();
        }
        slot.latest.send_replace(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
