//! Application state management

use std::sync::Arc;

use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::content::ContentServer;
use crate::error::Result;
use crate::storage::{self, ObjectStore};
use crate::upload::UploadService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    uploads: UploadService,
    content: ContentServer,
}

impl AppState {
    /// Create the application state, connecting to the configured object store
    /// and resuming journaled upload sessions
    pub async fn new(config: Config) -> Result<Self> {
        let store = storage::connect(&config.storage).await?;
        Self::open(config, store, Arc::new(SystemClock)).await
    }

    /// Assemble the state over an existing store, resuming its upload sessions
    pub async fn open(config: Config, store: Arc<dyn ObjectStore>, clock: SharedClock) -> Result<Self> {
        let uploads = UploadService::open(store.clone(), clock.clone(), config.uploads.clone()).await?;
        Ok(Self::build(config, uploads, store, clock))
    }

    fn build(config: Config, uploads: UploadService, store: Arc<dyn ObjectStore>, clock: SharedClock) -> Self {
        let limits = &config.uploads;
        let content = ContentServer::new(
            store,
            clock,
            limits.metadata_cache_ttl,
            limits.metadata_cache_capacity,
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                uploads,
                content,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }

    /// Get the content server
    pub fn content(&self) -> &ContentServer {
        &self.inner.content
    }
}
