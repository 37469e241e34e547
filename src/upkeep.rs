use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::session::SessionStore;
use crate::store::{Store, StoreError};

const COMPACT_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Compact the WAL if more than `threshold` appends landed since the last
/// compaction. Returns whether it ran.
pub async fn compact_if_needed(store: &Store, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.wal_appends_since_compact().await;
    if appends <= threshold {
        return Ok(false);
    }
    store.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

/// Background task that drops expired sessions.
pub async fn run_session_sweeper(sessions: Arc<SessionStore>) {
    let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = sessions.sweep_expired(Instant::now());
        if removed > 0 {
            info!(removed, "swept expired sessions");
        }
    }
}
