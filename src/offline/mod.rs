//! Mutations made without connectivity, replayed once it returns.

mod connectivity;
mod queue;

pub use connectivity::Connectivity;
pub use queue::{
  ActionType, DrainReport, FailedAction, OfflineAction, OfflineQueue, QueueEvent,
  DEFAULT_MAX_RETRIES,
};

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Drain `queue` whenever `connectivity` is seen online with actions
/// waiting, starting with the state at spawn time.
pub fn spawn_auto_drain(queue: OfflineQueue, connectivity: &Connectivity) -> JoinHandle<()> {
  let mut rx = connectivity.subscribe();

  tokio::spawn(async move {
    loop {
      // Updates between polls are merged; act on the state, not the edge
      let online = *rx.borrow_and_update();
      if online && !queue.is_empty() {
        info!(pending = queue.len(), "Online with queued actions, draining");
        match queue.drain().await {
          Ok(report) => info!(
            replayed = report.replayed.len(),
            failed = report.failed.len(),
            remaining = report.remaining,
            skipped = report.skipped,
            "Offline queue drained"
          ),
          Err(e) => warn!(error = %e, "Failed to drain offline queue"),
        }
      }
      if rx.changed().await.is_err() {
        break;
      }
    }
  })
}
