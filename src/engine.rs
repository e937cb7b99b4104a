use std::sync::Arc;

use crate::{
    config::EngineConfig,
    config_db::ConfigDb,
    coordinator::Coordinator,
    data_dir::DataDir,
    embedding::EnginePool,
    error::Result,
    item_store::{ItemStore, StorageStats},
    search::{SearchEngine, SearchMode, SearchRequest, SearchResult},
    storage::Storage,
};

/// The assembled system: storage, the two-stage search engine and the
/// ingestion coordinator, sharing one embedding pool.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    storage: Storage,
    search: SearchEngine,
    coordinator: Coordinator,
}

impl Engine {
    /// Open both databases under `data_dir`, loading the persisted
    /// configuration.
    pub fn open(data_dir: &DataDir, engines: Arc<EnginePool>) -> Result<Self> {
        let config_db = ConfigDb::open(&data_dir.config_db())?;
        let config = EngineConfig::load(&config_db)?;
        let items = ItemStore::open(&data_dir.items_db())?;
        Ok(Self::new(config_db, items, engines, config))
    }

    pub fn new(
        config_db: ConfigDb,
        items: ItemStore,
        engines: Arc<EnginePool>,
        config: EngineConfig,
    ) -> Self {
        let storage = Storage::new(
            Arc::new(items),
            Arc::new(config_db),
            config.storage_timeout,
        );
        let search = SearchEngine::new(storage.clone(), Arc::clone(&engines), &config);
        let coordinator = Coordinator::new(storage.clone(), engines, &config);
        tracing::debug!(?config, "engine ready");
        Self {
            config,
            storage,
            search,
            coordinator,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn search_engine(&self) -> &SearchEngine {
        &self.search
    }

    /// Run a query and return the best `top_k` items by MaxSim.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        self.search
            .search(&SearchRequest::new(query, mode, top_k))
            .await
    }

    pub async fn search_with(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        self.search.search(request).await
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        self.storage.get_storage_stats().await
    }
}
