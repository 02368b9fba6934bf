//! Background purge of expired client records.
//!
//! Reads already drop expired records lazily; the sweeper bounds table growth
//! from keys that are written once and never read again.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::backend::BoxedClientStore;

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to finish its current pass.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a task that calls `purge_expired` every `interval`.
///
/// The first pass runs immediately. Errors are logged and the loop keeps
/// going; a store that is briefly unreachable should not stop the sweeper.
pub fn spawn_sweeper(store: BoxedClientStore, interval: Duration) -> SweeperHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Purged expired client records"),
                        Err(e) => warn!("Failed to purge expired client records: {}", e),
                    }
                }
                changed = stop_rx.changed() => {
                    // Sender dropped counts as a stop request
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle { stop_tx, task }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::store::{ClientStore, ClientValue, MemoryClientStore};

    #[tokio::test]
    async fn test_sweeper_purges_and_stops() {
        let memory = MemoryClientStore::new();
        memory
            .set(
                "1.2.3.4",
                &ClientValue::first(Utc::now()),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        memory
            .set("5.6.7.8", &ClientValue::first(Utc::now()), None)
            .await
            .unwrap();

        let handle = spawn_sweeper(Arc::new(memory.clone()), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(memory.len().await, 1);
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }
}
