use crate::fixtures::FixtureToolConfig;
use concord_core::ConcordConfig;
use concord_store::{FileStateStore, SqliteStateStore, StateStore};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Storage backend of the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One JSON file per record under `data_dir`.
    #[default]
    File,
    /// `data_dir/concord.db`.
    Sqlite,
}

/// The `concord.toml` document: engine settings plus binary-only sections.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Engine settings at the top level of the file.
    #[serde(flatten)]
    pub engine: ConcordConfig,
    /// `[store]` backend selection.
    #[serde(default)]
    pub store: StoreBackend,
    /// `[[tools]]` fixture providers.
    #[serde(default)]
    pub tools: Vec<FixtureToolConfig>,
}

impl CliConfig {
    /// Parse and validate a `concord.toml` document.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(content)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load `path`, or the defaults when it does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Self::from_toml_str("");
        }
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::from_toml_str(&content)
    }

    /// Open the configured store under `data_dir`.
    pub async fn open_store(&self) -> anyhow::Result<Arc<dyn StateStore>> {
        let data_dir = &self.engine.data_dir;
        let store: Arc<dyn StateStore> = match self.store {
            StoreBackend::File => Arc::new(FileStateStore::new(data_dir.clone()).await?),
            StoreBackend::Sqlite => {
                tokio::fs::create_dir_all(data_dir).await?;
                Arc::new(SqliteStateStore::open(&data_dir.join("concord.db"))?)
            }
        };
        info!(backend = ?self.store, data_dir = %data_dir.display(), "State store opened");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::QualityMode;

    #[test]
    fn test_parse_full_document() {
        let config = CliConfig::from_toml_str(
            r#"
            quality_mode = "economy"
            max_parallel_agents = 2
            monthly_budget = 5.0
            store = "sqlite"

            [cognitive.agents.affect]
            enabled = false

            [[tools]]
            name = "weather"
            response = "sunny in {query}"
            latency_ms = 20

            [[tools]]
            name = "mail"
            fail_with = "503 Service Unavailable"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.quality_mode, QualityMode::Economy);
        assert_eq!(config.engine.max_parallel_agents, 2);
        assert_eq!(config.store, StoreBackend::Sqlite);
        assert_eq!(config.tools.len(), 2);
        assert_eq!(config.tools[1].fail_with.as_deref(), Some("503 Service Unavailable"));
        assert!(!config.engine.cognitive.settings_for("affect").enabled);
        // Defaults still apply to everything left out.
        assert_eq!(config.engine.join_timeout_secs, 120);
        assert!(!config.engine.domains.is_empty());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(CliConfig::from_toml_str("max_parallel_agents = 0").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults_and_opens_store() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        let mut config = CliConfig::load(&missing).await.unwrap();
        assert_eq!(config.store, StoreBackend::File);

        config.engine.data_dir = tmp.path().join("data");
        let store = config.open_store().await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
    }
}
