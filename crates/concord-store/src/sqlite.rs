use crate::store::{check_version, cost_key, terminal_mutation, validate_key, work_key, Archive, StateStore};
use async_trait::async_trait;
use concord_core::{
    CognitiveSnapshot, ConcordError, ConcordResult, CostRecord, WorkSpecification,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS work (
    id          TEXT PRIMARY KEY,
    collection  TEXT NOT NULL,
    version     INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    body        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS work_collection ON work (collection, created_at);
CREATE TABLE IF NOT EXISTS snapshots (
    agent_id    TEXT PRIMARY KEY,
    version     INTEGER NOT NULL,
    body        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS costs (
    period      TEXT PRIMARY KEY,
    version     INTEGER NOT NULL,
    body        TEXT NOT NULL
);
";

/// SQLite-backed store. Writes are serialized by the connection mutex and
/// versioned with conditional `UPDATE`s.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open (creating if needed) a database file.
    pub fn open(path: &Path) -> ConcordResult<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::with_connection(conn)
    }

    /// In-memory database, mainly for tests.
    pub fn in_memory() -> ConcordResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn with_connection(conn: Connection) -> ConcordResult<Self> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> ConcordResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> ConcordResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| ConcordError::Store(format!("sqlite task failed: {e}")))?
    }
}

fn sql_err(e: rusqlite::Error) -> ConcordError {
    ConcordError::Store(format!("sqlite: {e}"))
}

fn collection_of(spec: &WorkSpecification) -> &'static str {
    Archive::for_status(spec.status()).map_or("active", Archive::as_str)
}

fn load_row(conn: &Connection, id: Uuid) -> ConcordResult<Option<(String, WorkSpecification)>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT collection, body FROM work WHERE id = ?1",
            params![id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(sql_err)?;
    match row {
        Some((collection, body)) => Ok(Some((collection, serde_json::from_str(&body)?))),
        None => Ok(None),
    }
}

fn list_collection(conn: &Connection, collection: &str) -> ConcordResult<Vec<WorkSpecification>> {
    let mut stmt = conn
        .prepare("SELECT body FROM work WHERE collection = ?1 ORDER BY created_at, id")
        .map_err(sql_err)?;
    let bodies = stmt
        .query_map(params![collection], |r| r.get::<_, String>(0))
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(ConcordError::from))
        .collect()
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn insert_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification> {
        let mut stored = spec.clone();
        stored.version = 1;
        self.blocking(move |conn| {
            if load_row(conn, stored.id)?.is_some() {
                return Err(ConcordError::Store(format!("work {} already exists", stored.id)));
            }
            conn.execute(
                "INSERT INTO work (id, collection, version, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stored.id.to_string(),
                    collection_of(&stored),
                    stored.version,
                    stored.created_at.to_rfc3339(),
                    serde_json::to_string(&stored)?,
                ],
            )
            .map_err(sql_err)?;
            Ok(stored)
        })
        .await
    }

    async fn load_work(&self, id: Uuid) -> ConcordResult<Option<WorkSpecification>> {
        self.blocking(move |conn| Ok(load_row(conn, id)?.map(|(_, spec)| spec)))
            .await
    }

    async fn update_work(&self, spec: &WorkSpecification) -> ConcordResult<WorkSpecification> {
        let spec = spec.clone();
        self.blocking(move |conn| {
            let key = work_key(spec.id);
            let (collection, current) = load_row(conn, spec.id)?
                .ok_or_else(|| ConcordError::NotFound(format!("work {}", spec.id)))?;
            if collection != "active" {
                return Err(terminal_mutation(&current));
            }
            check_version(&key, spec.version, current.version)?;

            let mut stored = spec;
            stored.version = current.version + 1;
            let changed = conn
                .execute(
                    "UPDATE work SET collection = ?1, version = ?2, body = ?3 WHERE id = ?4 AND version = ?5",
                    params![
                        collection_of(&stored),
                        stored.version,
                        serde_json::to_string(&stored)?,
                        stored.id.to_string(),
                        current.version,
                    ],
                )
                .map_err(sql_err)?;
            if changed != 1 {
                return Err(ConcordError::VersionConflict {
                    key,
                    expected: current.version,
                    found: current.version + 1,
                });
            }
            Ok(stored)
        })
        .await
    }

    async fn list_active(&self) -> ConcordResult<Vec<WorkSpecification>> {
        self.blocking(|conn| list_collection(conn, "active")).await
    }

    async fn list_archive(&self, archive: Archive) -> ConcordResult<Vec<WorkSpecification>> {
        self.blocking(move |conn| list_collection(conn, archive.as_str()))
            .await
    }

    async fn save_snapshot(&self, snapshot: &CognitiveSnapshot) -> ConcordResult<()> {
        validate_key("agent", &snapshot.agent_id)?;
        let snapshot = snapshot.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO snapshots (agent_id, version, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(agent_id) DO UPDATE SET version = excluded.version, body = excluded.body
                 WHERE excluded.version > snapshots.version",
                params![
                    snapshot.agent_id,
                    snapshot.version,
                    serde_json::to_string(&snapshot)?,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn load_snapshot(&self, agent_id: &str) -> ConcordResult<Option<CognitiveSnapshot>> {
        let agent_id = agent_id.to_string();
        self.blocking(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM snapshots WHERE agent_id = ?1",
                    params![agent_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(ConcordError::from))
                .transpose()
        })
        .await
    }

    async fn list_snapshots(&self) -> ConcordResult<Vec<CognitiveSnapshot>> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM snapshots ORDER BY agent_id")
                .map_err(sql_err)?;
            let bodies = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(ConcordError::from))
                .collect()
        })
        .await
    }

    async fn load_cost_record(&self, period: &str) -> ConcordResult<Option<CostRecord>> {
        let period = period.to_string();
        self.blocking(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM costs WHERE period = ?1",
                    params![period],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(ConcordError::from))
                .transpose()
        })
        .await
    }

    async fn save_cost_record(&self, record: &CostRecord) -> ConcordResult<CostRecord> {
        validate_key("period", &record.period)?;
        let record = record.clone();
        self.blocking(move |conn| {
            let key = cost_key(&record.period);
            let found: u64 = conn
                .query_row(
                    "SELECT version FROM costs WHERE period = ?1",
                    params![record.period],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sql_err)?
                .unwrap_or(0);
            check_version(&key, record.version, found)?;

            let mut stored = record;
            stored.version = found + 1;
            conn.execute(
                "INSERT INTO costs (period, version, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(period) DO UPDATE SET version = excluded.version, body = excluded.body",
                params![stored.period, stored.version, serde_json::to_string(&stored)?],
            )
            .map_err(sql_err)?;
            Ok(stored)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{TaskKind, Tier, WorkResult};

    #[tokio::test]
    async fn test_sqlite_lifecycle() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut spec = store
            .insert_work(&WorkSpecification::new(TaskKind::Research, "find"))
            .await
            .unwrap();
        spec.assign(Tier::Local).unwrap();
        spec = store.update_work(&spec).await.unwrap();
        spec.begin().unwrap();
        spec = store.update_work(&spec).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);

        spec.fail(WorkResult::rejected("gave up", Tier::Local)).unwrap();
        let failed = store.update_work(&spec).await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.list_archive(Archive::Failed).await.unwrap().len(), 1);
        assert!(matches!(
            store.update_work(&failed).await,
            Err(ConcordError::TerminalMutation { .. })
        ));
    }

    #[tokio::test]
    async fn test_sqlite_snapshot_newest_wins() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut snap = CognitiveSnapshot::initial("affect");
        snap.version = 4;
        store.save_snapshot(&snap).await.unwrap();
        snap.version = 2;
        store.save_snapshot(&snap).await.unwrap();
        let loaded = store.load_snapshot("affect").await.unwrap().unwrap();
        assert_eq!(loaded.version, 4);
    }
}
