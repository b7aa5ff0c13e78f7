//! Eviction policy: decides which pages leave a tier.
//!
//! Victims are chosen least-recently-used first. A page is never chosen if
//! it is pinned, referenced, still being written or moved, in cooldown, or
//! if taking it would leave its tenant with fewer resident bytes in the tier
//! than the tenant's hot-set allowance.

use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::cache::page::{PageEntry, PageKey, Tier};
use crate::scheduler::tenant::TenantId;

/// An eviction candidate.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: PageKey,
    pub tenant: TenantId,
    pub size: u64,
    pub last_access: Instant,
}

// Older access = higher eviction priority (popped first).
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.last_access == other.last_access && self.key == other.key
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .last_access
            .cmp(&self.last_access)
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// Per-tenant resident bytes in one tier, and the floor each tenant keeps.
#[derive(Debug, Clone, Default)]
pub struct FloorLedger {
    floors: HashMap<TenantId, u64>,
    resident: HashMap<TenantId, u64>,
}

impl FloorLedger {
    pub fn new(floors: HashMap<TenantId, u64>, resident: HashMap<TenantId, u64>) -> Self {
        Self { floors, resident }
    }

    /// Whether removing `size` bytes of `tenant` would go below its floor.
    pub fn protects(&self, tenant: &TenantId, size: u64) -> bool {
        let floor = self.floors.get(tenant).copied().unwrap_or(0);
        if floor == 0 {
            return false;
        }
        let resident = self.resident.get(tenant).copied().unwrap_or(0);
        resident.saturating_sub(size) < floor
    }

    fn take(&mut self, tenant: &TenantId, size: u64) {
        if let Some(bytes) = self.resident.get_mut(tenant) {
            *bytes = bytes.saturating_sub(size);
        }
    }
}

/// What a selection round is looking for.
#[derive(Debug, Clone, Copy, Default)]
pub struct VictimQuery {
    /// Only pages idle at least this long.
    pub min_idle: Option<Duration>,

    /// Stop once this many bytes are selected.
    pub bytes_needed: Option<u64>,

    pub max_count: usize,
}

/// Outcome of a selection round.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub victims: Vec<EvictionCandidate>,

    /// Pages that qualified but were kept for their tenant's floor.
    pub floor_protected: usize,
}

/// The eviction policy engine.
#[derive(Debug, Clone, Default)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Select victims from `tier`, oldest access first.
    pub fn select_victims<'a>(
        &self,
        pages: impl Iterator<Item = &'a PageEntry>,
        tier: Tier,
        now: Instant,
        query: VictimQuery,
        mut ledger: FloorLedger,
    ) -> Selection {
        let mut heap = BinaryHeap::new();
        for page in pages {
            if page.tier != tier || !page.is_evictable(now) {
                continue;
            }
            if let Some(min_idle) = query.min_idle {
                if page.idle(now) < min_idle {
                    continue;
                }
            }
            heap.push(EvictionCandidate {
                key: page.key,
                tenant: page.tenant.clone(),
                size: page.stored_size,
                last_access: page.last_access,
            });
        }

        let mut selection = Selection::default();
        let mut selected_bytes = 0u64;
        while let Some(candidate) = heap.pop() {
            if selection.victims.len() >= query.max_count {
                break;
            }
            if query.bytes_needed.is_some_and(|needed| selected_bytes >= needed) {
                break;
            }
            if ledger.protects(&candidate.tenant, candidate.size) {
                selection.floor_protected += 1;
                continue;
            }
            ledger.take(&candidate.tenant, candidate.size);
            selected_bytes += candidate.size;
            selection.victims.push(candidate);
        }
        selection
    }
}
