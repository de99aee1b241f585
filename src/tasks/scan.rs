//! Expiration Scan Task
//!
//! Periodic sweep that removes expired entries so memory is reclaimed even
//! when nothing reads the cache. The engine also scans opportunistically
//! after operations; this task covers idle periods.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheStore;

/// Spawns the periodic expiration sweep. The task runs until the returned
/// handle is aborted or the runtime shuts down.
pub fn spawn_scan_task(store: CacheStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "expiration scan task started");
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.remove_expired();
            if removed > 0 {
                info!(removed, "expiration scan removed entries");
            } else {
                debug!("expiration scan found nothing to remove");
            }
        }
    })
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::config::CacheConfig;
    use chrono::{TimeDelta, Utc};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_task_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = CacheStore::new(CacheConfig::default().with_clock(clock.clone())).unwrap();

        let entry = store.create_entry("stale").unwrap();
        entry
            .set_absolute_expiration_relative_to_now(TimeDelta::seconds(1))
            .unwrap();
        entry.set_value(Arc::new("value".to_string()));
        entry.close();
        assert_eq!(store.len(), 1);

        clock.advance(TimeDelta::seconds(2));
        let handle = spawn_scan_task(store.clone(), Duration::from_millis(20));

        for _ in 0..50 {
            if store.is_empty() {
                handle.abort();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        panic!("scan task did not remove the expired entry");
    }
}
