use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use crate::coord::MemoryCoordStore;

/// 定期清理进程内协调存储的过期键 / Periodically drop expired keys from the in-process store
pub fn spawn_coord_sweep_task(
    store: Arc<MemoryCoordStore>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("🧹 Coordination sweep every {}s", every.as_secs());
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.purge_expired();
                    if removed > 0 {
                        debug!("coordination sweep removed {} expired keys", removed);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
        info!("coordination sweep stopped");
    })
}
