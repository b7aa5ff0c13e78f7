//! Worker pool: slot accounting and page residency.
//!
//! Residency records which worker's fast tier holds a page after a transfer.
//! A page is resident on at most one worker: committing it to a new worker
//! moves it off the previous one.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::page::PageKey;
use crate::config::WorkerConfig;
use crate::placement::router::PageLocator;

/// Which phase a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Prefill,
    Decode,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Prefill => f.write_str("prefill"),
            Role::Decode => f.write_str("decode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker and its live counters.
#[derive(Debug)]
pub struct Worker {
    pub id: WorkerId,
    pub role: Role,
    pub host: String,
    pub slots: usize,
    pub memory_bytes: u64,
    load: AtomicUsize,
    memory_used: AtomicU64,
}

impl Worker {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            id: WorkerId::from(config.id.as_str()),
            role: config.role,
            host: config.host.clone(),
            slots: config.slots,
            memory_bytes: config.memory_bytes,
            load: AtomicUsize::new(0),
            memory_used: AtomicU64::new(0),
        }
    }

    /// Sequences currently assigned.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub fn load_fraction(&self) -> f64 {
        if self.slots == 0 {
            return 1.0;
        }
        self.load() as f64 / self.slots as f64
    }

    pub fn memory_used(&self) -> u64 {
        self.memory_used.load(Ordering::Acquire)
    }

    pub fn headroom_fraction(&self) -> f64 {
        if self.memory_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.memory_used() as f64 / self.memory_bytes as f64).min(1.0)
    }

    /// Take a slot if one is free.
    pub fn try_claim(&self) -> bool {
        self.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < self.slots).then_some(load + 1)
            })
            .is_ok()
    }

    pub fn release_slot(&self) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                load.checked_sub(1)
            });
    }

    fn add_memory(&self, bytes: u64) {
        self.memory_used.fetch_add(bytes, Ordering::AcqRel);
    }

    fn sub_memory(&self, bytes: u64) {
        let _ = self
            .memory_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// Serializable view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub role: Role,
    pub host: String,
    pub load: usize,
    pub slots: usize,
    pub memory_used: u64,
    pub memory_bytes: u64,
}

/// All workers, and where pages are resident.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<Worker>>,
    residency: DashMap<PageKey, (WorkerId, u64)>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(workers: &[WorkerConfig]) -> Self {
        let registry = Self::new();
        for config in workers {
            registry.register(Worker::new(config));
        }
        registry
    }

    pub fn register(&self, worker: Worker) {
        self.workers.insert(worker.id.clone(), Arc::new(worker));
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers.get(id).map(|w| w.value().clone())
    }

    /// Workers with the given role, ordered by id.
    pub fn with_role(&self, role: Role) -> Vec<Arc<Worker>> {
        let mut workers: Vec<_> = self
            .workers
            .iter()
            .filter(|w| w.role == role)
            .map(|w| w.value().clone())
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn release_slot(&self, id: &WorkerId) {
        if let Some(worker) = self.get(id) {
            worker.release_slot();
        }
    }

    /// Worker holding `key`, if any.
    pub fn resident_on(&self, key: PageKey) -> Option<WorkerId> {
        self.residency.get(&key).map(|r| r.0.clone())
    }

    /// Record that `pages` now live on `worker`, moving them off any previous holder.
    pub fn commit_residency(&self, worker: &WorkerId, pages: &[(PageKey, u64)]) {
        let Some(target) = self.get(worker) else {
            return;
        };
        for (key, size) in pages {
            let previous = self.residency.insert(*key, (worker.clone(), *size));
            if let Some((prev_worker, prev_size)) = previous {
                if let Some(prev) = self.get(&prev_worker) {
                    prev.sub_memory(prev_size);
                }
            }
            target.add_memory(*size);
        }
        debug!(worker = %worker, pages = pages.len(), "Committed page residency");
    }

    /// Forget residency for pages that are gone from the cache or have left device memory.
    pub fn prune_stale(&self, locator: &dyn PageLocator) -> usize {
        let stale: Vec<PageKey> = self
            .residency
            .iter()
            .filter(|r| !locator.on_device(*r.key()))
            .map(|r| *r.key())
            .collect();
        for key in &stale {
            if let Some((_, (worker, size))) = self.residency.remove(key) {
                if let Some(w) = self.get(&worker) {
                    w.sub_memory(size);
                }
            }
        }
        stale.len()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut out: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|w| WorkerSnapshot {
                id: w.id.clone(),
                role: w.role,
                host: w.host.clone(),
                load: w.load(),
                slots: w.slots,
                memory_used: w.memory_used(),
                memory_bytes: w.memory_bytes,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoPages;

    impl PageLocator for NoPages {
        fn page_size(&self, _key: PageKey) -> Option<u64> {
            None
        }

        fn cached_prefix(&self, _keys: &[PageKey]) -> usize {
            0
        }
    }

    fn registry() -> WorkerRegistry {
        let mut small = WorkerConfig::new("d0", Role::Decode, "a");
        small.slots = 1;
        WorkerRegistry::from_config(&[small, WorkerConfig::new("d1", Role::Decode, "b")])
    }

    #[test]
    fn test_claim_respects_slots() {
        let reg = registry();
        let d0 = reg.get(&WorkerId::from("d0")).unwrap();
        assert!(d0.try_claim());
        assert!(!d0.try_claim());
        d0.release_slot();
        assert!(d0.try_claim());
    }

    #[test]
    fn test_residency_moves_between_workers() {
        let reg = registry();
        let d0 = WorkerId::from("d0");
        let d1 = WorkerId::from("d1");
        reg.commit_residency(&d0, &[(PageKey(1), 100)]);
        assert_eq!(reg.resident_on(PageKey(1)), Some(d0.clone()));
        assert_eq!(reg.get(&d0).unwrap().memory_used(), 100);

        reg.commit_residency(&d1, &[(PageKey(1), 100)]);
        assert_eq!(reg.resident_on(PageKey(1)), Some(d1.clone()));
        assert_eq!(reg.get(&d0).unwrap().memory_used(), 0);
        assert_eq!(reg.get(&d1).unwrap().memory_used(), 100);
    }

    #[test]
    fn test_prune_stale_residency() {
        let reg = registry();
        let d0 = WorkerId::from("d0");
        reg.commit_residency(&d0, &[(PageKey(1), 100), (PageKey(2), 50)]);
        assert_eq!(reg.prune_stale(&NoPages), 2);
        assert_eq!(reg.resident_on(PageKey(1)), None);
        assert_eq!(reg.get(&d0).unwrap().memory_used(), 0);
    }
}
