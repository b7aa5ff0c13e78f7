//! Locality-aware worker selection.
//!
//! Decode placement scores each worker as
//!
//! ```text
//! score = locality_w * local_bytes / required_bytes
//!       + load_w     * (1 - load / slots)
//!       + headroom_w * (1 - memory_used / memory_bytes)
//! ```
//!
//! Prefill placement drops the locality term. Ties go to the least loaded
//! worker, then the lowest id. The chosen worker's slot is claimed before
//! returning.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::cache::page::PageKey;
use crate::config::PlacementConfig;
use crate::placement::worker::{Role, Worker, WorkerId, WorkerRegistry};

/// Narrow view of the cache used by placement and admission.
pub trait PageLocator: Send + Sync {
    /// FP16 size of a cached page, if cached.
    fn page_size(&self, key: PageKey) -> Option<u64>;

    /// Number of leading keys that are cached.
    fn cached_prefix(&self, keys: &[PageKey]) -> usize;

    /// Whether the page still has a device-memory copy. Residency recorded
    /// for a worker only counts while this holds.
    fn on_device(&self, key: PageKey) -> bool {
        self.page_size(key).is_some()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no {0} workers registered")]
    NoWorkers(Role),

    #[error("all {0} workers busy")]
    AllWorkersBusy(Role),
}

/// A claimed slot on a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub worker: WorkerId,
    pub role: Role,
    pub score: f64,
    /// Required bytes already resident on the worker.
    pub local_bytes: u64,
}

struct Scored {
    worker: Arc<Worker>,
    score: f64,
    local_bytes: u64,
}

pub struct Router {
    registry: Arc<WorkerRegistry>,
    locator: Arc<dyn PageLocator>,
    weights: PlacementConfig,
    /// Size assumed for pages the cache does not know yet.
    default_page_bytes: u64,
}

impl Router {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        locator: Arc<dyn PageLocator>,
        weights: PlacementConfig,
        default_page_bytes: u64,
    ) -> Self {
        Self {
            registry,
            locator,
            weights,
            default_page_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn locator(&self) -> &Arc<dyn PageLocator> {
        &self.locator
    }

    fn score(&self, worker: &Arc<Worker>, role: Role, required: &[PageKey]) -> Scored {
        let mut local_bytes = 0u64;
        let mut required_bytes = 0u64;
        if role == Role::Decode {
            for key in required {
                let size = self
                    .locator
                    .page_size(*key)
                    .unwrap_or(self.default_page_bytes);
                required_bytes += size;
                if self.registry.resident_on(*key).as_ref() == Some(&worker.id)
                    && self.locator.on_device(*key)
                {
                    local_bytes += size;
                }
            }
        }
        let locality = if required_bytes > 0 {
            local_bytes as f64 / required_bytes as f64
        } else {
            0.0
        };
        let score = self.weights.locality_weight * locality
            + self.weights.load_weight * (1.0 - worker.load_fraction().min(1.0))
            + self.weights.headroom_weight * worker.headroom_fraction();
        Scored {
            worker: worker.clone(),
            score,
            local_bytes,
        }
    }

    /// Rank workers of `role` for a sequence needing `required` pages.
    pub fn rank(&self, role: Role, required: &[PageKey]) -> Vec<Placement> {
        self.ranked(role, required)
            .into_iter()
            .map(|s| Placement {
                worker: s.worker.id.clone(),
                role,
                score: s.score,
                local_bytes: s.local_bytes,
            })
            .collect()
    }

    fn ranked(&self, role: Role, required: &[PageKey]) -> Vec<Scored> {
        let mut scored: Vec<Scored> = self
            .registry
            .with_role(role)
            .iter()
            .map(|w| self.score(w, role, required))
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.worker.load().cmp(&b.worker.load()))
                .then_with(|| a.worker.id.cmp(&b.worker.id))
        });
        scored
    }

    /// Choose a worker and claim one of its slots.
    pub fn place(&self, role: Role, required: &[PageKey]) -> Result<Placement, PlacementError> {
        let ranked = self.ranked(role, required);
        if ranked.is_empty() {
            return Err(PlacementError::NoWorkers(role));
        }
        for candidate in ranked {
            if candidate.worker.try_claim() {
                debug!(
                    worker = %candidate.worker.id,
                    role = %role,
                    score = candidate.score,
                    local_bytes = candidate.local_bytes,
                    "Placed sequence"
                );
                return Ok(Placement {
                    worker: candidate.worker.id.clone(),
                    role,
                    score: candidate.score,
                    local_bytes: candidate.local_bytes,
                });
            }
        }
        Err(PlacementError::AllWorkersBusy(role))
    }

    /// Return a slot claimed by [`place`](Self::place).
    pub fn release(&self, worker: &WorkerId) {
        self.registry.release_slot(worker);
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}
