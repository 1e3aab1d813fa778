use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that compacts the WAL once enough frames have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not needed");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OverflowPolicy;
    use crate::notify::NotifyHub;
    use crate::retry::RetryPolicy;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatline_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), RetryPolicy::default()).unwrap();

        let rid = Ulid::new();
        engine
            .create_resource(rid, None, 1, OverflowPolicy::Waitlist)
            .await
            .unwrap();
        for i in 0..3 {
            engine
                .request_reservation(rid, &format!("s{i}"), None)
                .await
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 4);

        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 4);

        assert!(compact_if_needed(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.get_availability(rid).await.unwrap().waitlist_length, 2);
    }
}
