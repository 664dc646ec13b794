use crate::lease::Lease;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<Option<Lease>>>;

/// Path to lease map. Each path has its own async lock, so a slow store
/// round trip on one path never stalls another.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    slots: DashMap<String, Slot>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `path` for a check-then-mutate sequence.
    ///
    /// The returned guard is the only way to change the entry for `path`.
    pub async fn lock(&self, path: &str) -> PathGuard<'_> {
        loop {
            let slot = self.slots.entry(path.to_string()).or_insert_with(Slot::default).clone();
            let guard = slot.clone().lock_owned().await;

            // The slot may have been pruned while we waited for it.
            let current = self
                .slots
                .get(path)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &slot));
            if current {
                return PathGuard {
                    registry: self,
                    path: path.to_string(),
                    slot,
                    guard,
                };
            }
        }
    }

    /// Copy of the lease for `path`, if any.
    pub async fn get(&self, path: &str) -> Option<Lease> {
        self.lock(path).await.get()
    }

    /// Copies of every lease currently held.
    pub async fn snapshot(&self) -> Vec<Lease> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();

        let mut leases = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(lease) = slot.lock().await.as_ref() {
                leases.push(lease.clone());
            }
        }
        leases
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Replaces the whole content. Only used while no other caller can
    /// reach the registry.
    pub(crate) fn reset(&self, leases: impl IntoIterator<Item = Lease>) {
        self.slots.clear();
        for lease in leases {
            self.slots
                .insert(lease.path.clone(), Arc::new(Mutex::new(Some(lease))));
        }
    }
}

/// Exclusive access to one path's entry.
#[derive(Debug)]
pub struct PathGuard<'a> {
    registry: &'a LeaseRegistry,
    path: String,
    slot: Slot,
    guard: OwnedMutexGuard<Option<Lease>>,
}

impl PathGuard<'_> {
    pub fn get(&self) -> Option<Lease> {
        self.guard.clone()
    }

    /// Inserts `lease` if the path is free. Hands it back otherwise.
    pub fn insert(&mut self, lease: Lease) -> std::result::Result<(), Lease> {
        if self.guard.is_some() {
            return Err(lease);
        }
        *self.guard = Some(lease);
        Ok(())
    }

    pub fn remove(&mut self) -> Option<Lease> {
        self.guard.take()
    }

    /// Moves the create time of the held lease forward.
    pub fn refresh(&mut self, now_us: i64) -> Option<Lease> {
        let lease = self.guard.as_mut()?;
        lease.refresh(now_us);
        Some(lease.clone())
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        if self.guard.is_none() {
            self.registry
                .slots
                .remove_if(&self.path, |_, slot| Arc::ptr_eq(slot, &self.slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lease(path: &str, create_time_us: i64) -> Lease {
        Lease::new(path, "127.0.0.1", 100_000, 0, create_time_us)
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let registry = LeaseRegistry::new();
        let first = lease("/file1", 1);
        let second = lease("/file1", 2);

        let mut guard = registry.lock("/file1").await;
        assert!(guard.insert(first.clone()).is_ok());
        let rejected = guard.insert(second.clone()).unwrap_err();
        assert_eq!(rejected, second);
        drop(guard);

        assert_eq!(registry.get("/file1").await, Some(first));
    }

    #[tokio::test]
    async fn test_reads_are_copies() {
        let registry = LeaseRegistry::new();
        let mut guard = registry.lock("/file1").await;
        guard.insert(lease("/file1", 1)).unwrap();
        drop(guard);

        let mut copy = registry.get("/file1").await.unwrap();
        copy.create_time_us = 999;
        assert_eq!(registry.get("/file1").await.unwrap().create_time_us, 1);
    }

    #[tokio::test]
    async fn test_empty_slots_are_pruned() {
        let registry = LeaseRegistry::new();

        assert!(registry.get("/nothing").await.is_none());
        assert!(registry.slots.is_empty());

        let mut guard = registry.lock("/file1").await;
        guard.insert(lease("/file1", 1)).unwrap();
        drop(guard);
        assert_eq!(registry.slots.len(), 1);

        let mut guard = registry.lock("/file1").await;
        assert!(guard.remove().is_some());
        drop(guard);
        assert!(registry.slots.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_refresh_through_guard() {
        let registry = LeaseRegistry::new();
        let mut guard = registry.lock("/file1").await;
        assert!(guard.refresh(10).is_none());
        guard.insert(lease("/file1", 5)).unwrap();
        assert_eq!(guard.refresh(10).unwrap().create_time_us, 10);
        drop(guard);
        assert_eq!(registry.get("/file1").await.unwrap().create_time_us, 10);
    }

    #[tokio::test]
    async fn test_reset_and_snapshot() {
        let registry = LeaseRegistry::new();
        registry.reset(vec![lease("/a", 1), lease("/b", 2)]);
        let mut paths: Vec<String> =
            registry.snapshot().await.into_iter().map(|l| l.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_same_path_is_serialized() {
        let registry = Arc::new(LeaseRegistry::new());

        let guard = registry.lock("/file1").await;
        let contender = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut guard = registry.lock("/file1").await;
                guard.insert(lease("/file1", 2)).is_ok()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        assert!(contender.await.unwrap());
    }

    #[tokio::test]
    async fn test_other_paths_are_not_blocked() {
        let registry = LeaseRegistry::new();
        let _held = registry.lock("/busy").await;

        let other = tokio::time::timeout(Duration::from_millis(100), registry.lock("/free")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_survives_pruning() {
        let registry = Arc::new(LeaseRegistry::new());

        let mut guard = registry.lock("/file1").await;
        guard.insert(lease("/file1", 1)).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut guard = registry.lock("/file1").await;
                guard.insert(lease("/file1", 2)).is_ok()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Emptying prunes the slot the waiter is parked on
        guard.remove();
        drop(guard);

        assert!(waiter.await.unwrap());
        assert_eq!(registry.get("/file1").await.unwrap().create_time_us, 2);
    }
}
