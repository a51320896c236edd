use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::store::LedgerStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that compacts the journal once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(store: Arc<LedgerStore>, threshold: u64) {
    if !store.is_durable() || threshold == 0 {
        debug!("journal compaction disabled");
        return;
    }
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One compactor pass. Returns whether compaction ran.
pub async fn compact_if_due(store: &LedgerStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    info!("compacting journal after {appends} appends");
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            // Retried on the next tick; the old journal stays valid.
            error!("journal compaction failed: {e}");
            false
        }
    }
}
