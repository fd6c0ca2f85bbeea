use crate::store::{
    check_version, cost_key, snapshot_key, terminal_mutation, validate_key, work_key, Archive,
    RecordLocks, StateStore,
};
use async_trait::async_trait;
use concord_core::{
    CognitiveSnapshot, ConcordError, ConcordResult, CostRecord, WorkSpecification,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Collections {
    active: HashMap<Uuid, WorkSpecification>,
    completed: HashMap<Uuid, WorkSpecification>,
    failed: HashMap<Uuid, WorkSpecification>,
    snapshots: HashMap<String, CognitiveSnapshot>,
    costs: HashMap<String, CostRecord>,
}

impl Collections {
    fn archive(&self, archive: Archive) -> &HashMap<Uuid, WorkSpecification> {
        match archive {
            Archive::Completed => &self.completed,
            Archive::Failed => &self.failed,
        }
    }

    fn archived(&self, id: &Uuid) -> Option<&WorkSpecification> {
        self.completed.get(id).or_else(|| self.failed.get(id))
    }
}

/// In-process [`StateStore`]. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStateStore {
    data: RwLock<Collections>,
    locks: RecordLocks,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut specs: Vec<WorkSpecification>) -> Vec<WorkSpecification> {
    specs.sort_by_key(|s| (s.created_at, s.id));
    specs
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification> {
        let key = work_key(spec.id);
        let _guard = self.locks.acquire(&key).await;

        let mut data = self.data.write();
        if data.active.contains_key(&spec.id) || data.archived(&spec.id).is_some() {
            return Err(ConcordError::Store(format!("work {} already exists", spec.id)));
        }
        let mut stored = spec.clone();
        stored.version = 1;
        match Archive::for_status(stored.status()) {
            Some(Archive::Completed) => data.completed.insert(stored.id, stored.clone()),
            Some(Archive::Failed) => data.failed.insert(stored.id, stored.clone()),
            None => data.active.insert(stored.id, stored.clone()),
        };
        Ok(stored)
    }

    async fn load_work(&self, id: Uuid) -> ConcordResult<Option<WorkSpecification>> {
        let data = self.data.read();
        Ok(data
            .active
            .get(&id)
            .or_else(|| data.archived(&id))
            .cloned())
    }

    async fn update_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification> {
        let key = work_key(spec.id);
        let _guard = self.locks.acquire(&key).await;

        let stored = {
            let mut data = self.data.write();
            if let Some(archived) = data.archived(&spec.id) {
                return Err(terminal_mutation(archived));
            }
            let current = data
                .active
                .get(&spec.id)
                .ok_or_else(|| ConcordError::NotFound(format!("work {}", spec.id)))?;
            check_version(&key, spec.version, current.version)?;

            let mut stored = spec.clone();
            stored.version = current.version + 1;
            match Archive::for_status(stored.status()) {
                Some(archive) => {
                    data.active.remove(&stored.id);
                    match archive {
                        Archive::Completed => data.completed.insert(stored.id, stored.clone()),
                        Archive::Failed => data.failed.insert(stored.id, stored.clone()),
                    };
                }
                None => {
                    data.active.insert(stored.id, stored.clone());
                }
            }
            stored
        };

        if stored.is_terminal() {
            self.locks.forget(&key);
        }
        Ok(stored)
    }

    async fn list_active(&self) -> ConcordResult<Vec<WorkSpecification>> {
        let data = self.data.read();
        Ok(sorted(data.active.values().cloned().collect()))
    }

    async fn list_archive(&self, archive: Archive) -> ConcordResult<Vec<WorkSpecification>> {
        let data = self.data.read();
        Ok(sorted(data.archive(archive).values().cloned().collect()))
    }

    async fn save_snapshot(&self, snapshot: &CognitiveSnapshot) -> ConcordResult<()> {
        validate_key("agent", &snapshot.agent_id)?;
        let _guard = self.locks.acquire(&snapshot_key(&snapshot.agent_id)).await;

        let mut data = self.data.write();
        let newer = data
            .snapshots
            .get(&snapshot.agent_id)
            .map_or(true, |existing| snapshot.version > existing.version);
        if newer {
            data.snapshots
                .insert(snapshot.agent_id.clone(), snapshot.clone());
        }
        Ok(())
    }

    async fn load_snapshot(&self, agent_id: &str) -> ConcordResult<Option<CognitiveSnapshot>> {
        Ok(self.data.read().snapshots.get(agent_id).cloned())
    }

    async fn list_snapshots(&self) -> ConcordResult<Vec<CognitiveSnapshot>> {
        let mut snapshots: Vec<_> = self.data.read().snapshots.values().cloned().collect();
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(snapshots)
    }

    async fn load_cost_record(&self, period: &str) -> ConcordResult<Option<CostRecord>> {
        Ok(self.data.read().costs.get(period).cloned())
    }

    async fn save_cost_record(&self, record: &CostRecord) -> ConcordResult<CostRecord> {
        validate_key("period", &record.period)?;
        let key = cost_key(&record.period);
        let _guard = self.locks.acquire(&key).await;

        let mut data = self.data.write();
        let found = data.costs.get(&record.period).map_or(0, |r| r.version);
        check_version(&key, record.version, found)?;
        let mut stored = record.clone();
        stored.version = found + 1;
        data.costs.insert(stored.period.clone(), stored.clone());
        Ok(stored)
    }
}
