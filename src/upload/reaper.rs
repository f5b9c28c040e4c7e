//! Session Expiry Reaper
//!
//! Background sweep that expires abandoned sessions, deletes their staged
//! chunks and eventually forgets terminal sessions.

use chrono::Duration;
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::session::SessionRegistry;
use super::types::SessionStatus;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions moved to EXPIRED
    pub expired: usize,
    /// Terminal sessions dropped from the registry
    pub purged: usize,
    /// Sessions whose staging could not be deleted; retried next sweep
    pub cleanup_failures: usize,
}

/// Delete the staged chunks of a finished session and note it on the session.
///
/// Returns `false` if deletion failed; the next sweep retries it.
pub(crate) async fn reclaim_staging(registry: &SessionRegistry, chunk_store: &ChunkStore, id: Uuid) -> bool {
    match chunk_store.delete_session(id).await {
        Ok(_) => {
            if let Ok(mut state) = registry.lock(id).await {
                state.staging_reclaimed = true;
                registry.persist(&state).await;
            }
            true
        }
        Err(e) => {
            tracing::warn!(session_id = %id, error = %e, "Failed to delete staged chunks");
            false
        }
    }
}

/// Periodically reclaims idle sessions
#[derive(Clone)]
pub struct SessionReaper {
    registry: SessionRegistry,
    chunk_store: ChunkStore,
    interval: std::time::Duration,
    retention: Duration,
}

impl SessionReaper {
    pub fn new(
        registry: SessionRegistry,
        chunk_store: ChunkStore,
        interval: std::time::Duration,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            chunk_store,
            interval,
            retention,
        }
    }

    /// Run one sweep over every session
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.registry.now();

        for id in self.registry.ids().await {
            // Removed by a concurrent sweep
            let Ok(mut state) = self.registry.lock(id).await else {
                continue;
            };

            // Lease held by an assembly
            if state.status() == SessionStatus::Assembling {
                continue;
            }

            if state.expire_if_due(now) {
                report.expired += 1;
                tracing::debug!(session_id = %id, "Expired idle upload session");
                self.registry.persist(&state).await;
            }

            let needs_reclaim = state.needs_reclaim();
            let purge = state.status().is_terminal() && now - state.updated_at >= self.retention;
            drop(state);

            if needs_reclaim && !reclaim_staging(&self.registry, &self.chunk_store, id).await {
                report.cleanup_failures += 1;
                continue;
            }

            if purge && self.registry.remove(id).await.is_some() {
                report.purged += 1;
            }
        }

        if report.expired > 0 || report.purged > 0 || report.cleanup_failures > 0 {
            tracing::info!(
                expired = report.expired,
                purged = report.purged,
                cleanup_failures = report.cleanup_failures,
                "Upload session sweep finished"
            );
        }

        report
    }

    /// Start background sweep task
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}
