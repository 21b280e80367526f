//! Everything a command needs: configuration, the task store and the sync
//! machinery built from them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tasksync_core::store::{LocalStore, TaskStore};
use tasksync_core::sync::SyncOrchestrator;
use tasksync_provider_journal::JournalKeyCache;

use crate::config::AppConfig;
use crate::dispatch::BackendDispatcher;
use crate::session;

pub struct App {
    pub config: AppConfig,
    pub store: Arc<LocalStore>,
    pub keys: Arc<JournalKeyCache>,
    sessions: PathBuf,
}

impl App {
    pub fn load() -> Result<Self> {
        let config = AppConfig::load()?;
        let store_path = config.store_path();
        let store = LocalStore::open(&store_path)
            .with_context(|| format!("Failed to open task store at {}", store_path.display()))?;

        Ok(App {
            config,
            store: Arc::new(store),
            keys: JournalKeyCache::global(),
            sessions: session::base_dir()?,
        })
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn orchestrator(&self) -> Result<SyncOrchestrator> {
        let dispatcher = BackendDispatcher::new(
            self.store(),
            self.keys.clone(),
            self.sessions.clone(),
            self.config.retry_policy(),
            self.config.zone()?,
        );
        Ok(SyncOrchestrator::new(
            self.store(),
            Arc::new(dispatcher),
            self.config.sync.max_workers,
        ))
    }
}
