use crate::agent::{CognitiveAgent, MeshObserver, Observation, TickInput};
use crate::agents::default_agents;
use crate::board::SnapshotBoard;
use chrono::Utc;
use concord_core::{CognitiveConfig, CognitiveSnapshot, ConcordError, ConcordResult};
use concord_store::StateStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const OBSERVATION_CAPACITY: usize = 256;

/// Builder for a [`CognitiveMesh`].
pub struct MeshBuilder {
    store: Arc<dyn StateStore>,
    config: CognitiveConfig,
    agents: Vec<Box<dyn CognitiveAgent>>,
}

impl MeshBuilder {
    /// Register an agent. Agents disabled in the config are skipped at build.
    pub fn with_agent(mut self, agent: Box<dyn CognitiveAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Register the four built-in agents.
    pub fn with_default_agents(mut self) -> Self {
        self.agents.extend(default_agents());
        self
    }

    /// Build the mesh. Agent ids must be unique.
    pub fn build(self) -> ConcordResult<CognitiveMesh> {
        let mut seen = HashSet::new();
        let mut agents = Vec::new();
        for agent in self.agents {
            let id = agent.id().to_string();
            if !seen.insert(id.clone()) {
                return Err(ConcordError::Config(format!(
                    "cognitive agent '{id}' registered twice"
                )));
            }
            if !self.config.settings_for(&id).enabled {
                info!(agent = %id, "Cognitive agent disabled");
                continue;
            }
            agents.push(agent);
        }

        let board = Arc::new(SnapshotBoard::new(
            agents.iter().map(|a| a.id().to_string()),
            self.config.retention_versions,
        ));
        let (tx, _) = broadcast::channel(OBSERVATION_CAPACITY);
        Ok(CognitiveMesh {
            store: self.store,
            config: self.config,
            agents,
            board,
            observer: MeshObserver::new(tx),
        })
    }
}

/// A set of background agents publishing versioned snapshots.
///
/// Built once, optionally warm-started from the store, then started; from
/// then on each agent runs on its own timer until [`MeshHandle::shutdown`].
pub struct CognitiveMesh {
    store: Arc<dyn StateStore>,
    config: CognitiveConfig,
    agents: Vec<Box<dyn CognitiveAgent>>,
    board: Arc<SnapshotBoard>,
    observer: MeshObserver,
}

impl CognitiveMesh {
    /// Start building a mesh.
    pub fn builder(store: Arc<dyn StateStore>, config: CognitiveConfig) -> MeshBuilder {
        MeshBuilder {
            store,
            config,
            agents: Vec::new(),
        }
    }

    /// Shared snapshot board.
    pub fn board(&self) -> Arc<SnapshotBoard> {
        Arc::clone(&self.board)
    }

    /// Observation sender.
    pub fn observer(&self) -> MeshObserver {
        self.observer.clone()
    }

    /// Reload persisted snapshots and restore agent state, so the first read
    /// after a restart already sees warm context. Returns the number of
    /// agents restored.
    pub async fn warm_start(&mut self) -> ConcordResult<usize> {
        let mut restored = 0;
        for agent in &mut self.agents {
            let Some(snapshot) = self.store.load_snapshot(agent.id()).await? else {
                continue;
            };
            if snapshot.version == 0 {
                continue;
            }
            if let Err(e) = agent.restore(&snapshot.data) {
                warn!(agent = %agent.id(), error = %e, "Persisted snapshot unreadable, starting cold");
                continue;
            }
            let version = snapshot.version;
            self.board.publish(snapshot)?;
            info!(agent = %agent.id(), version, "Cognitive agent warm-started");
            restored += 1;
        }
        Ok(restored)
    }

    /// Spawn one tick loop per agent.
    pub fn start(self) -> MeshHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.agents.len());
        for agent in self.agents {
            let settings = self.config.settings_for(agent.id());
            let worker = AgentLoop {
                agent,
                board: Arc::clone(&self.board),
                store: Arc::clone(&self.store),
                observations: self.observer.subscribe(),
                period: settings.tick_interval(),
                persist_every: self.config.persist_every_n_ticks.max(1),
            };
            tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
        info!(agents = tasks.len(), "Cognitive mesh started");
        MeshHandle {
            shutdown_tx,
            tasks,
            board: self.board,
            observer: self.observer,
        }
    }
}

/// Handle to a running mesh.
pub struct MeshHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    board: Arc<SnapshotBoard>,
    observer: MeshObserver,
}

impl MeshHandle {
    /// Shared snapshot board.
    pub fn board(&self) -> Arc<SnapshotBoard> {
        Arc::clone(&self.board)
    }

    /// Observation sender.
    pub fn observer(&self) -> MeshObserver {
        self.observer.clone()
    }

    /// Feed one observation to every agent.
    pub fn observe(&self, observation: Observation) {
        self.observer.observe(observation);
    }

    /// Stop every tick loop and wait for the final snapshot flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Cognitive agent task ended abnormally");
            }
        }
        info!("Cognitive mesh stopped");
    }
}

struct AgentLoop {
    agent: Box<dyn CognitiveAgent>,
    board: Arc<SnapshotBoard>,
    store: Arc<dyn StateStore>,
    observations: broadcast::Receiver<Observation>,
    period: Duration,
    persist_every: u64,
}

impl AgentLoop {
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let id = self.agent.id().to_string();
        let mut ticker = interval(self.period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick: u64 = 0;
        let mut unpersisted = false;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    tick += 1;
                    if self.tick_once(&id, tick) {
                        unpersisted = true;
                        if tick % self.persist_every == 0 {
                            persist(&self.board, self.store.as_ref(), &id).await;
                            unpersisted = false;
                        }
                    }
                }
            }
        }

        if unpersisted {
            persist(&self.board, self.store.as_ref(), &id).await;
        }
        debug!(agent = %id, ticks = tick, "Cognitive agent stopped");
    }

    fn drain_observations(&mut self, id: &str) -> Vec<Observation> {
        let mut drained = Vec::new();
        loop {
            match self.observations.try_recv() {
                Ok(observation) => drained.push(observation),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(agent = %id, skipped, "Cognitive agent lagged, observations lost");
                }
                Err(_) => break,
            }
        }
        drained
    }

    /// Returns whether a new snapshot was published.
    fn tick_once(&mut self, id: &str, tick: u64) -> bool {
        let observations = self.drain_observations(id);
        let peers = self
            .board
            .latest_all()
            .into_iter()
            .filter(|(peer, _)| peer != id)
            .collect();
        let input = TickInput {
            tick,
            observations,
            peers,
            now: Utc::now(),
        };

        let data = match self.agent.tick(&input) {
            Ok(data) => data,
            Err(e) => {
                warn!(agent = %id, tick, error = %e, "Cognitive tick failed, keeping previous snapshot");
                return false;
            }
        };
        let version = self
            .board
            .latest_snapshot(id)
            .map_or(0, |s| s.version)
            + 1;
        let snapshot = CognitiveSnapshot {
            agent_id: id.to_string(),
            version,
            data,
            published_at: input.now,
        };
        match self.board.publish(snapshot) {
            Ok(_) => {
                debug!(agent = %id, tick, version, "Snapshot published");
                true
            }
            Err(e) => {
                warn!(agent = %id, error = %e, "Snapshot publish rejected");
                false
            }
        }
    }

}

async fn persist(board: &SnapshotBoard, store: &dyn StateStore, id: &str) {
    let Some(latest) = board.latest_snapshot(id) else {
        return;
    };
    if let Err(e) = store.save_snapshot(&latest).await {
        warn!(agent = %id, version = latest.version, error = %e, "Snapshot persistence failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::CognitiveAgentSettings;
    use concord_store::MemoryStateStore;
    use std::collections::BTreeMap;

    fn fast_config(ids: &[&str]) -> CognitiveConfig {
        let agents = ids
            .iter()
            .map(|id| {
                (
                    (*id).to_string(),
                    CognitiveAgentSettings {
                        enabled: true,
                        tick_interval_ms: 10,
                    },
                )
            })
            .collect();
        CognitiveConfig {
            persist_every_n_ticks: 1,
            retention_versions: 4,
            agents,
        }
    }

    struct Failing;

    impl CognitiveAgent for Failing {
        fn id(&self) -> &str {
            "failing"
        }
        fn restore(&mut self, _data: &serde_json::Value) -> ConcordResult<()> {
            Ok(())
        }
        fn tick(&mut self, _input: &TickInput) -> ConcordResult<serde_json::Value> {
            Err(ConcordError::Validation("boom".into()))
        }
    }

    #[test]
    fn test_disabled_agents_skipped() {
        let mut config = fast_config(&["memory", "user_patterns", "trajectory"]);
        config.agents.insert(
            "affect".into(),
            CognitiveAgentSettings {
                enabled: false,
                tick_interval_ms: 10,
            },
        );
        let mesh = CognitiveMesh::builder(Arc::new(MemoryStateStore::new()), config)
            .with_default_agents()
            .build()
            .unwrap();
        assert_eq!(
            mesh.board().agent_ids(),
            vec!["memory", "trajectory", "user_patterns"]
        );
    }

    #[test]
    fn test_duplicate_agents_rejected() {
        let result = CognitiveMesh::builder(Arc::new(MemoryStateStore::new()), fast_config(&[]))
            .with_default_agents()
            .with_default_agents()
            .build();
        assert!(matches!(result, Err(ConcordError::Config(_))));
    }

    #[tokio::test]
    async fn test_ticks_publish_and_persist() {
        let store = Arc::new(MemoryStateStore::new());
        let mesh = CognitiveMesh::builder(store.clone(), fast_config(&["trajectory"]))
            .with_agent(Box::new(crate::agents::TrajectoryAgent::new()))
            .build()
            .unwrap();
        let handle = mesh.start();
        handle.observe(Observation::Request {
            text: "flights to Rome".into(),
            domains: vec!["flights".into()],
            facts: BTreeMap::new(),
            at: Utc::now(),
        });
        tokio::time::sleep(Duration::from_millis(80)).await;

        let board = handle.board();
        let latest = board.latest_snapshot("trajectory").unwrap();
        assert!(latest.version >= 2);
        handle.shutdown().await;

        let persisted = store.load_snapshot("trajectory").await.unwrap().unwrap();
        assert_eq!(persisted.version, board.latest_snapshot("trajectory").unwrap().version);
        assert_eq!(persisted.data["focus"], "flights");
    }

    #[tokio::test]
    async fn test_failing_tick_keeps_previous_snapshot() {
        let mesh = CognitiveMesh::builder(Arc::new(MemoryStateStore::new()), fast_config(&["failing"]))
            .with_agent(Box::new(Failing))
            .build()
            .unwrap();
        let handle = mesh.start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(handle.board().latest_snapshot("failing").unwrap().version, 0);
        handle.shutdown().await;
    }
}
