use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointStore;

/// Renews a run lease in the background until dropped.
pub(crate) struct LeaseHeartbeat {
    handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
    pub fn start(
        store: Arc<dyn CheckpointStore>,
        run_id: String,
        owner: String,
        ttl: Duration,
    ) -> Self {
        let period = (ttl / 3).max(Duration::from_millis(100));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match store.acquire_lease(&run_id, &owner, ttl).await {
                    Ok(lease) => debug!(run_id = %run_id, expires_at = %lease.expires_at, "Lease renewed"),
                    Err(e) => warn!(run_id = %run_id, error = %e, "Failed to renew run lease"),
                }
            }
        });
        Self { handle }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
