//! Session manager: grants, renews and reclaims exclusive file sessions.
//!
//! Every check-then-mutate sequence on a path runs under that path's
//! registry lock, including its store round trips. Durable writes precede
//! the matching registry change. Renewals only touch memory.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::SessionOptions,
    error::StoreError,
    lease::{Lease, LeaseStatus},
    reaper::{Reaper, ReaperHandle},
    recovery::{self, Reconciled},
    registry::LeaseRegistry,
    store::RecordStore,
    time::{Clock, SystemClock},
    Error, Result,
};

#[derive(Debug)]
pub struct SessionManager {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<LeaseRegistry>,
    options: RwLock<Option<Arc<SessionOptions>>>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            registry: Arc::new(LeaseRegistry::new()),
            options: RwLock::new(None),
            reaper: Mutex::new(None),
        }
    }

    /// Prepares the store and rebuilds the registry from persisted rows.
    ///
    /// When several rows exist for one path the newest survives and the rest
    /// are deleted before this returns. Any failure, including one on a
    /// re-init, leaves the manager uninitialized and empty.
    #[instrument(skip(self, options))]
    pub async fn init(&self, options: SessionOptions) -> Result<()> {
        if self.reaper.lock().is_some() {
            return Err(Error::Config(
                "cannot re-initialize a running session manager".to_string(),
            ));
        }
        *self.options.write() = None;
        self.registry.reset(Vec::new());
        options.validate()?;

        self.store
            .connect(&options.store)
            .await
            .map_err(|e| setup_failed("connect", &e))?;
        self.store
            .create_schema()
            .await
            .map_err(|e| setup_failed("create database", &e))?;
        self.store
            .select_schema()
            .await
            .map_err(|e| setup_failed("use database", &e))?;
        self.store
            .create_tables()
            .await
            .map_err(|e| setup_failed("create tables", &e))?;

        let rows = self.store.load_all().await.map_err(|e| {
            error!("Loading persisted sessions failed: {}", e);
            Error::Store(e)
        })?;
        let loaded = rows.len();

        let Reconciled {
            survivors,
            discarded,
        } = recovery::reconcile(rows).map_err(|e| {
            error!("Persisted sessions are inconsistent: {}", e);
            e
        })?;

        for lease in &discarded {
            self.store
                .delete(&lease.path, &lease.session_id)
                .await
                .map_err(|e| {
                    error!(
                        path = %lease.path,
                        session_id = %lease.session_id,
                        "Deleting superseded session failed: {}",
                        e
                    );
                    Error::Store(e)
                })?;
            info!(
                path = %lease.path,
                session_id = %lease.session_id,
                "Deleted superseded session"
            );
        }

        let active = survivors.len();
        self.registry.reset(survivors);
        *self.options.write() = Some(Arc::new(options));

        info!(
            loaded,
            active,
            discarded = discarded.len(),
            "Session manager initialized"
        );
        Ok(())
    }

    /// Launches the reaper. Does nothing when already running or when `init`
    /// has not succeeded.
    pub fn start(&self) {
        let Some(options) = self.options.read().clone() else {
            warn!("Session manager start skipped: not initialized");
            return;
        };

        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return;
        }

        let handle = Reaper::new(self.registry.clone(), self.store.clone(), self.clock.clone())
            .spawn(options.scan_interval());
        *reaper = Some(handle);
        info!(
            interval_us = options.interval_time_us,
            "Session manager started"
        );
    }

    /// Stops the reaper, waits for it to exit, then marks every held
    /// session stale in the store so the next instance can re-grant its
    /// path at once. Safe to call repeatedly, or without a prior `start`.
    pub async fn stop(&self) {
        let handle = self.reaper.lock().take();
        let Some(handle) = handle else { return };
        handle.stop().await;

        let staled = self.stale_held_sessions().await;
        info!(staled, "Session manager stopped");
    }

    /// Only the durable rows change; the registry keeps serving the held
    /// sessions until the process goes away.
    async fn stale_held_sessions(&self) -> usize {
        let mut staled = 0;
        for held in self.registry.snapshot().await {
            let guard = self.registry.lock(&held.path).await;
            let Some(current) = guard.get() else { continue };

            let row = match self.store.query(&current.path, &current.session_id).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    warn!(
                        path = %current.path,
                        session_id = %current.session_id,
                        "Held session has no durable row"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(path = %current.path, "Querying session on stop failed: {}", e);
                    continue;
                }
            };

            let stale = Lease {
                create_time_us: current.create_time_us,
                status: LeaseStatus::Stale,
                ..row
            };
            match self.store.update(&stale).await {
                Ok(()) => staled += 1,
                Err(e) => warn!(path = %current.path, "Marking session stale failed: {}", e),
            }
        }
        staled
    }

    pub fn is_running(&self) -> bool {
        self.reaper.lock().is_some()
    }

    /// Opens `path` for `client_ip`, granting a fresh session.
    ///
    /// An unexpired session on the path yields [`Error::FileOccupied`]. An
    /// expired one is deleted durably first; if that delete fails nothing
    /// changes and [`Error::Persistence`] is returned.
    #[instrument(skip(self))]
    pub async fn insert_session(&self, path: &str, client_ip: &str) -> Result<Lease> {
        let options = self.options()?;
        let mut guard = self.registry.lock(path).await;
        let now = self.clock.now_us();

        if let Some(existing) = guard.get() {
            if !existing.is_expired(now) {
                debug!(session_id = %existing.session_id, "File is occupied");
                return Err(Error::FileOccupied {
                    path: path.to_string(),
                    session_id: existing.session_id,
                });
            }

            if let Err(e) = self.store.delete(path, &existing.session_id).await {
                error!(
                    session_id = %existing.session_id,
                    "Deleting expired session failed: {}",
                    e
                );
                return Err(Error::Persistence {
                    path: path.to_string(),
                    source: e,
                });
            }
            guard.remove();
            info!(session_id = %existing.session_id, "Superseded expired session");
        }

        let lease = Lease::new(
            path,
            client_ip,
            options.lease_time_us,
            options.tolerance_time_us,
            now,
        );
        if let Err(e) = self.store.insert(&lease).await {
            error!(session_id = %lease.session_id, "Persisting new session failed: {}", e);
            return Err(Error::Persistence {
                path: path.to_string(),
                source: e,
            });
        }

        // The path lock has been held since the slot was seen empty.
        if let Err(rejected) = guard.insert(lease.clone()) {
            return Err(Error::FileOccupied {
                path: path.to_string(),
                session_id: rejected.session_id,
            });
        }

        info!(session_id = %lease.session_id, "Granted session");
        Ok(lease)
    }

    /// Renews the session on `path`, measuring validity from now.
    ///
    /// The session id and owner token must match the held session. A
    /// session already past its lease window is accepted and re-granted in
    /// place. The refresh is not persisted.
    #[instrument(skip(self, token))]
    pub async fn update_session(
        &self,
        path: &str,
        session_id: &str,
        token: &str,
        client_ip: &str,
    ) -> Result<()> {
        self.options()?;
        let mut guard = self.registry.lock(path).await;

        let Some(existing) = guard.get() else {
            warn!("Refresh for unknown session");
            return Err(Error::IdentityMismatch {
                path: path.to_string(),
            });
        };
        if existing.session_id != session_id || existing.token != token {
            warn!(held = %existing.session_id, "Refresh with mismatched identity");
            return Err(Error::IdentityMismatch {
                path: path.to_string(),
            });
        }
        if existing.client_ip != client_ip {
            debug!(held_ip = %existing.client_ip, "Refresh from a different address");
        }

        let now = self.clock.now_us();
        if existing.is_expired(now) {
            info!(
                elapsed_us = existing.elapsed_us(now),
                "Renewing expired session in place"
            );
        }
        guard.refresh(now);
        Ok(())
    }

    /// Copy of the session held for `path`.
    pub async fn get_session(&self, path: &str) -> Option<Lease> {
        self.registry.get(path).await
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Reads the durable row backing the session currently held for `path`.
    pub async fn durable_session(&self, path: &str) -> Result<Option<Lease>> {
        let Some(lease) = self.registry.get(path).await else {
            return Ok(None);
        };
        Ok(self.store.query(path, &lease.session_id).await?)
    }

    fn options(&self) -> Result<Arc<SessionOptions>> {
        self.options.read().clone().ok_or(Error::NotInitialized)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.get_mut().take() {
            handle.signal();
        }
    }
}

fn setup_failed(step: &str, e: &StoreError) -> Error {
    error!("Session store {} failed: {}", step, e);
    Error::Config(format!("{step}: {e}"))
}
