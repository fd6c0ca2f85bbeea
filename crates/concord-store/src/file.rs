use crate::store::{
    check_version, cost_key, snapshot_key, terminal_mutation, validate_key, work_key, Archive,
    RecordLocks, StateStore,
};
use async_trait::async_trait;
use concord_core::{
    CognitiveSnapshot, ConcordError, ConcordResult, CostRecord, WorkSpecification,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

const ACTIVE: &str = "active";
const SNAPSHOTS: &str = "snapshots";
const COSTS: &str = "costs";

/// File-based store: one pretty-printed JSON file per record.
///
/// ```text
/// <root>/active/<work-id>.json
/// <root>/completed/<work-id>.json
/// <root>/failed/<work-id>.json
/// <root>/snapshots/<agent-id>.json
/// <root>/costs/<YYYY-MM>.json
/// ```
///
/// Every write goes to a temporary file first and is renamed into place, so a
/// crash never leaves a half-written record behind.
pub struct FileStateStore {
    root: PathBuf,
    locks: RecordLocks,
}

impl FileStateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> ConcordResult<Self> {
        let root = root.into();
        for dir in [
            ACTIVE,
            Archive::Completed.as_str(),
            Archive::Failed.as_str(),
            SNAPSHOTS,
            COSTS,
        ] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        info!(root = %root.display(), "Opened file state store");
        Ok(Self {
            root,
            locks: RecordLocks::new(),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn work_path(&self, collection: &str, id: Uuid) -> PathBuf {
        self.root.join(collection).join(format!("{id}.json"))
    }

    fn snapshot_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(SNAPSHOTS).join(format!("{agent_id}.json"))
    }

    fn cost_path(&self, period: &str) -> PathBuf {
        self.root.join(COSTS).join(format!("{period}.json"))
    }

    async fn archived(&self, id: Uuid) -> ConcordResult<Option<WorkSpecification>> {
        for archive in [Archive::Completed, Archive::Failed] {
            if let Some(spec) = read_json(&self.work_path(archive.as_str(), id)).await? {
                return Ok(Some(spec));
            }
        }
        Ok(None)
    }

    async fn list_dir(&self, collection: &str) -> ConcordResult<Vec<WorkSpecification>> {
        let mut entries = tokio::fs::read_dir(self.root.join(collection)).await?;
        let mut specs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(spec) = read_json::<WorkSpecification>(&path).await? {
                specs.push(spec);
            }
        }
        specs.sort_by_key(|s| (s.created_at, s.id));
        Ok(specs)
    }

    async fn write_work(&self, spec: &WorkSpecification) -> ConcordResult<()> {
        match Archive::for_status(spec.status()) {
            Some(archive) => {
                write_json(&self.work_path(archive.as_str(), spec.id), spec).await?;
                remove_if_exists(&self.work_path(ACTIVE, spec.id)).await?;
            }
            None => write_json(&self.work_path(ACTIVE, spec.id), spec).await?,
        }
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> ConcordResult<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => {
            let value = serde_json::from_str(&data).map_err(|e| {
                ConcordError::Store(format!("Failed to parse '{}': {e}", path.display()))
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> ConcordResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "Record written");
    Ok(())
}

async fn remove_if_exists(path: &Path) -> ConcordResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn insert_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification> {
        let _guard = self.locks.acquire(&work_key(spec.id)).await;
        if self.load_work(spec.id).await?.is_some() {
            return Err(ConcordError::Store(format!("work {} already exists", spec.id)));
        }
        let mut stored = spec.clone();
        stored.version = 1;
        self.write_work(&stored).await?;
        Ok(stored)
    }

    async fn load_work(&self, id: Uuid) -> ConcordResult<Option<WorkSpecification>> {
        // Archives win: a crash between archiving and removing the active file
        // must not resurrect a terminal item.
        if let Some(spec) = self.archived(id).await? {
            return Ok(Some(spec));
        }
        match read_json(&self.work_path(ACTIVE, id)).await? {
            Some(spec) => Ok(Some(spec)),
            // Archived between the two reads.
            None => self.archived(id).await,
        }
    }

    async fn update_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification> {
        let key = work_key(spec.id);
        let _guard = self.locks.acquire(&key).await;

        if let Some(archived) = self.archived(spec.id).await? {
            return Err(terminal_mutation(&archived));
        }
        let current: WorkSpecification = read_json(&self.work_path(ACTIVE, spec.id))
            .await?
            .ok_or_else(|| ConcordError::NotFound(format!("work {}", spec.id)))?;
        check_version(&key, spec.version, current.version)?;

        let mut stored = spec.clone();
        stored.version = current.version + 1;
        self.write_work(&stored).await?;
        if stored.is_terminal() {
            self.locks.forget(&key);
        }
        Ok(stored)
    }

    async fn list_active(&self) -> ConcordResult<Vec<WorkSpecification>> {
        let mut active = Vec::new();
        for spec in self.list_dir(ACTIVE).await? {
            if self.archived(spec.id).await?.is_some() {
                debug!(work_id = %spec.id, "Removing stale active copy of archived work");
                remove_if_exists(&self.work_path(ACTIVE, spec.id)).await?;
                continue;
            }
            active.push(spec);
        }
        Ok(active)
    }

    async fn list_archive(&self, archive: Archive) -> ConcordResult<Vec<WorkSpecification>> {
        self.list_dir(archive.as_str()).await
    }

    async fn save_snapshot(&self, snapshot: &CognitiveSnapshot) -> ConcordResult<()> {
        validate_key("agent", &snapshot.agent_id)?;
        let _guard = self.locks.acquire(&snapshot_key(&snapshot.agent_id)).await;

        let path = self.snapshot_path(&snapshot.agent_id);
        let existing: Option<CognitiveSnapshot> = read_json(&path).await?;
        if existing.map_or(true, |e| snapshot.version > e.version) {
            write_json(&path, snapshot).await?;
        }
        Ok(())
    }

    async fn load_snapshot(&self, agent_id: &str) -> ConcordResult<Option<CognitiveSnapshot>> {
        validate_key("agent", agent_id)?;
        read_json(&self.snapshot_path(agent_id)).await
    }

    async fn list_snapshots(&self) -> ConcordResult<Vec<CognitiveSnapshot>> {
        let mut entries = tokio::fs::read_dir(self.root.join(SNAPSHOTS)).await?;
        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(snapshot) = read_json::<CognitiveSnapshot>(&path).await? {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(snapshots)
    }

    async fn load_cost_record(&self, period: &str) -> ConcordResult<Option<CostRecord>> {
        validate_key("period", period)?;
        read_json(&self.cost_path(period)).await
    }

    async fn save_cost_record(&self, record: &CostRecord) -> ConcordResult<CostRecord> {
        validate_key("period", &record.period)?;
        let key = cost_key(&record.period);
        let _guard = self.locks.acquire(&key).await;

        let path = self.cost_path(&record.period);
        let found = read_json::<CostRecord>(&path)
            .await?
            .map_or(0, |r| r.version);
        check_version(&key, record.version, found)?;

        let mut stored = record.clone();
        stored.version = found + 1;
        write_json(&path, &stored).await?;
        Ok(stored)
    }
}
