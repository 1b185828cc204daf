use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Rewrite the tenant's WAL as a snapshot once enough appends have piled up.
/// Returns `true` when a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task: one per tenant, checks every minute.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorsched_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_tutors(name: &str, n: usize) -> Engine {
        let engine = Engine::new(test_wal_path(name), EngineOptions::default()).unwrap();
        for i in 0..n {
            engine
                .upsert_catalog(CatalogEntry {
                    id: Ulid::new(),
                    name: Some(format!("Tutor {i}")),
                    archived_at: None,
                    detail: CatalogDetail::Tutor,
                })
                .await
                .unwrap();
        }
        engine
    }

    #[tokio::test]
    async fn below_threshold_is_left_alone() {
        let engine = engine_with_tutors("below.wal", 3).await;
        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);
    }

    #[tokio::test]
    async fn at_threshold_compacts() {
        let engine = engine_with_tutors("at.wal", 5).await;
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
