use async_trait::async_trait;
use concord_core::{
    CognitiveSnapshot, ConcordError, ConcordResult, CostRecord, WorkSpecification, WorkStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Archive collection for terminal work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Archive {
    /// Items that reached `completed`.
    Completed,
    /// Items that reached `failed`.
    Failed,
}

impl Archive {
    /// Archive a terminal status belongs in.
    pub fn for_status(status: WorkStatus) -> Option<Archive> {
        match status {
            WorkStatus::Completed => Some(Archive::Completed),
            WorkStatus::Failed => Some(Archive::Failed),
            _ => None,
        }
    }

    /// Directory / collection name.
    pub fn as_str(self) -> &'static str {
        match self {
            Archive::Completed => "completed",
            Archive::Failed => "failed",
        }
    }
}

/// Storage contract for work items, cognitive snapshots and cost records.
///
/// Work items live in an `active` collection until they become terminal, at
/// which point the write that made them terminal moves them to the matching
/// [`Archive`]. Archived items are never modified or pruned.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a new work item. Fails if the id already exists.
    /// Returns the stored copy (version 1).
    async fn insert_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification>;

    /// Load a work item from the active collection or either archive.
    async fn load_work(&self, id: Uuid) -> ConcordResult<Option<WorkSpecification>>;

    /// Replace a work item. `spec.version` is the version the writer read;
    /// a mismatch yields [`ConcordError::VersionConflict`], an archived target
    /// yields [`ConcordError::TerminalMutation`]. Returns the stored copy with
    /// its new version.
    async fn update_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification>;

    /// All in-flight work items, oldest first.
    async fn list_active(&self) -> ConcordResult<Vec<WorkSpecification>>;

    /// All items in an archive, oldest first.
    async fn list_archive(&self, archive: Archive) -> ConcordResult<Vec<WorkSpecification>>;

    /// Persist a snapshot. A snapshot older than the stored one is ignored.
    async fn save_snapshot(&self, snapshot: &CognitiveSnapshot) -> ConcordResult<()>;

    /// Latest persisted snapshot of an agent.
    async fn load_snapshot(&self, agent_id: &str) -> ConcordResult<Option<CognitiveSnapshot>>;

    /// Latest persisted snapshot of every agent.
    async fn list_snapshots(&self) -> ConcordResult<Vec<CognitiveSnapshot>>;

    /// Cost record of a billing period.
    async fn load_cost_record(&self, period: &str) -> ConcordResult<Option<CostRecord>>;

    /// Write a cost record. `record.version` is the version the writer read
    /// (0 for a record that did not exist). Returns the stored copy.
    async fn save_cost_record(&self, record: &CostRecord) -> ConcordResult<CostRecord>;
}

/// Per-record async locks.
///
/// Holding the guard for a key serializes read-check-write sequences on that
/// record only; other keys are unaffected.
#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a record that will never be written again.
    pub fn forget(&self, key: &str) {
        self.locks.lock().remove(key);
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock key of a work item.
pub(crate) fn work_key(id: Uuid) -> String {
    format!("work/{id}")
}

/// Lock key of a snapshot.
pub(crate) fn snapshot_key(agent_id: &str) -> String {
    format!("snapshot/{agent_id}")
}

/// Lock key of a cost record.
pub(crate) fn cost_key(period: &str) -> String {
    format!("cost/{period}")
}

/// Check an optimistic write against the stored version.
pub(crate) fn check_version(key: &str, expected: u64, found: u64) -> ConcordResult<()> {
    if expected != found {
        tracing::warn!(key, expected, found, "Stale write rejected");
        return Err(ConcordError::VersionConflict {
            key: key.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Error for a write that targets an archived item.
pub(crate) fn terminal_mutation(stored: &WorkSpecification) -> ConcordError {
    tracing::error!(
        work_id = %stored.id,
        status = %stored.status(),
        "Rejected write to terminal work item"
    );
    ConcordError::TerminalMutation {
        id: stored.id,
        status: stored.status(),
    }
}

/// Agent ids and periods become file names and SQL keys; keep them tame.
pub(crate) fn validate_key(kind: &str, key: &str) -> ConcordResult<()> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(ConcordError::Store(format!("invalid {kind} key '{key}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_record_locks_serialize_same_key() {
        let locks = Arc::new(RecordLocks::new());
        let guard = locks.acquire("work/a").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire("work/a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_record_locks_independent_keys() {
        let locks = RecordLocks::new();
        let _a = locks.acquire("work/a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("work/b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
        locks.forget("work/b");
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("agent", "user_patterns").is_ok());
        assert!(validate_key("period", "2026-03").is_ok());
        assert!(validate_key("agent", "../etc").is_err());
        assert!(validate_key("agent", "").is_err());
    }

    #[test]
    fn test_archive_for_status() {
        assert_eq!(
            Archive::for_status(WorkStatus::Completed),
            Some(Archive::Completed)
        );
        assert_eq!(Archive::for_status(WorkStatus::Failed), Some(Archive::Failed));
        assert_eq!(Archive::for_status(WorkStatus::InProgress), None);
    }
}
