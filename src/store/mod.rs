//! Persistence layer: TTL key-value state for calls, markers and the activity log.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use libsql_backend::LibSqlBackend;
pub use memory::{MemoryActivityLog, MemoryStore};
pub use traits::{CallFields, StateStore};

/// How often expired entries are swept.
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn a background task that purges expired entries on an interval.
///
/// Reads already ignore expired rows; this only reclaims space.
pub fn spawn_expiry_task(
    store: Arc<dyn StateStore>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Expiry sweeper started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Expiry sweeper shutting down");
                return;
            }

            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => debug!(removed = n, "Purged expired entries"),
                Err(e) => warn!(error = %e, "Expiry sweep failed"),
            }
        }
    });

    (handle, shutdown_flag)
}
