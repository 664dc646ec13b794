use crate::{
    lease::{Lease, LeaseStatus},
    registry::LeaseRegistry,
    store::RecordStore,
    time::Clock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Deletes the durable row of every lease past its lease window plus
/// tolerance, then drops the registry entry. A failed delete leaves the
/// entry for the next scan.
#[derive(Debug, Clone)]
pub struct Reaper {
    registry: Arc<LeaseRegistry>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl Reaper {
    pub fn new(
        registry: Arc<LeaseRegistry>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    /// Runs a single scan and returns the leases it reclaimed.
    pub async fn reap_once(&self) -> Vec<Lease> {
        let now = self.clock.now_us();
        let mut candidates: Vec<Lease> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|lease| lease.is_reclaimable(now))
            .collect();
        candidates.sort_by(|a, b| {
            a.create_time_us
                .cmp(&b.create_time_us)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut reclaimed = Vec::new();
        for candidate in candidates {
            let mut guard = self.registry.lock(&candidate.path).await;

            // Renewed or superseded since the snapshot
            let Some(current) = guard.get() else { continue };
            if current.session_id != candidate.session_id
                || !current.is_reclaimable(self.clock.now_us())
            {
                continue;
            }

            match self.store.delete(&current.path, &current.session_id).await {
                Ok(()) => {
                    if let Some(mut lease) = guard.remove() {
                        info!(
                            path = %lease.path,
                            session_id = %lease.session_id,
                            "Reclaimed expired session"
                        );
                        lease.status = LeaseStatus::Reclaimed;
                        reclaimed.push(lease);
                    }
                }
                Err(e) => {
                    warn!(
                        path = %current.path,
                        session_id = %current.session_id,
                        "Failed to delete expired session, retrying next scan: {}",
                        e
                    );
                }
            }
        }

        reclaimed
    }

    /// Starts the scan loop on the current tokio runtime.
    pub fn spawn(self, scan_interval: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + scan_interval, scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let reclaimed = self.reap_once().await;
                        if !reclaimed.is_empty() {
                            debug!("Reaper scan reclaimed {} sessions", reclaimed.len());
                        }
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            debug!("Reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Asks the loop to exit without waiting for it.
    pub fn signal(&self) {
        // Send only fails when the loop already exited
        let _ = self.shutdown.send(true);
    }

    /// Signals the loop and waits for it to exit. An in-flight scan finishes
    /// first.
    pub async fn stop(self) {
        self.signal();
        if let Err(e) = self.join.await {
            warn!("Reaper task ended abnormally: {}", e);
        }
    }
}
