//! Application state management.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reportbox_storage::{
    BlobResolver, BlobStore, HttpBlobStore, JsonRecordStore, LocalBlobStore, RecordStore,
};
use tracing::{debug, info};

use crate::auth::AuthService;
use crate::config::ServerConfig;
use crate::error::AppResult;
use crate::export::{ArchiveOptions, ExportLedger, ExportService};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: ServerConfig,
    pub store: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: AuthService,
    pub exports: ExportService,
    start_time: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    /// Open the configured record store and blob locations.
    pub async fn new(config: ServerConfig) -> AppResult<Self> {
        let paths = config.storage.paths()?;
        let local = LocalBlobStore::new(paths.uploads_dir.clone());
        let http = HttpBlobStore::new(config.export.http_timeout())?;
        let store = JsonRecordStore::open(paths).await?;

        Ok(Self::with_parts(
            config,
            Arc::new(store),
            Arc::new(BlobResolver::new(local, http)),
        ))
    }

    /// Assemble state from already-built collaborators.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let ledger = Arc::new(ExportLedger::new(config.export.ledger_ttl()));
        let options = ArchiveOptions {
            compression_level: config.export.compression_level,
            chunk_size: config.export.chunk_size,
            channel_capacity: config.export.channel_capacity,
            spool_memory_limit: config.export.spool_memory_limit,
        };
        let exports = ExportService::new(Arc::clone(&store), Arc::clone(&blobs), ledger, options);

        Self {
            auth: AuthService::new(config.auth.clone()),
            config,
            store,
            blobs,
            exports,
            start_time: Instant::now(),
        }
    }

    /// Start background cleanup task that runs periodically.
    /// Call this after wrapping AppState in Arc to start the cleanup loop.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let state = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let evicted = state.exports.ledger().cleanup_expired().await;
                if evicted > 0 {
                    info!(evicted, "Evicted expired export outcomes");
                }
                let outcomes = state.exports.ledger().len().await;
                debug!(outcomes, "Background cleanup completed");
            }
        });
    }

    /// Get uptime duration.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
