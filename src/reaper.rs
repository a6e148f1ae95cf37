use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that periodically releases expired holds. Hygiene only:
/// every read/write path already treats expired holds as absent, so
/// correctness never depends on this sweep running.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64;
        let expired = engine.collect_expired_holds(now);
        for (machine_id, token) in expired {
            match engine.release(machine_id, token).await {
                Ok(()) => {
                    metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(1);
                    info!("reaped expired hold {token} on machine {machine_id}");
                }
                Err(e) => {
                    // May already have been released or confirmed — that's fine
                    tracing::debug!("reaper skip {token}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
