//! Weighted fair queueing across tenants, SRPT within a tenant.
//!
//! Each tenant keeps a virtual start and finish tag. The candidate from tenant
//! `t` is its head (lowest SRPT key) with tag
//!
//! ```text
//! tag = start[t] + max(cost_chunks, 1) / weight[t]
//! ```
//!
//! and the candidate with the lowest tag is served; equal tags go to the
//! earlier submission. `start[t]` is fixed when the tenant becomes backlogged,
//! as `max(finish[t], virtual_time)`, and while it stays backlogged each
//! service chains it to the tag just served. Serving sets
//! `finish[t] = start[t] = tag` and advances `virtual_time` to the served start.
//!
//! The SRPT key shrinks linearly with wait. Once an entry has waited the aging
//! bound its key becomes minus its wait in seconds, so aged entries outrank
//! every non-aged entry and are served oldest first.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use crate::scheduler::sequence::SequenceId;
use crate::scheduler::tenant::TenantId;

/// Prefill cost in chunks, rounded up.
pub fn cost_chunks(uncached_tokens: usize, chunk_tokens: usize) -> u64 {
    uncached_tokens.div_ceil(chunk_tokens.max(1)) as u64
}

/// SRPT key for an entry. Lower is served first.
pub fn srpt_key(cost_chunks: u64, waited: Duration, aging_bound: Duration, penalty: f64) -> f64 {
    if waited >= aging_bound {
        return -waited.as_secs_f64();
    }
    let relax = 1.0 - waited.as_secs_f64() / aging_bound.as_secs_f64();
    cost_chunks as f64 * relax * penalty
}

#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub id: SequenceId,
    pub seq_no: u64,
    pub arrival: Instant,
    pub cost_chunks: u64,
}

#[derive(Debug, Default)]
struct TenantQueue {
    entries: Vec<QueuedEntry>,
    start: f64,
    finish: f64,
}

/// The entry a pass would serve next.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub tenant: TenantId,
    pub id: SequenceId,
    pub seq_no: u64,
    pub arrival: Instant,
    pub cost_chunks: u64,
    pub start: f64,
    pub tag: f64,
}

#[derive(Debug)]
pub struct FairQueue {
    tenants: BTreeMap<TenantId, TenantQueue>,
    virtual_time: f64,
    aging_bound: Duration,
    len: usize,
}

impl FairQueue {
    pub fn new(aging_bound: Duration) -> Self {
        Self {
            tenants: BTreeMap::new(),
            virtual_time: 0.0,
            aging_bound,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn virtual_time(&self) -> f64 {
        self.virtual_time
    }

    pub fn push(&mut self, tenant: TenantId, entry: QueuedEntry) {
        let virtual_time = self.virtual_time;
        let queue = self.tenants.entry(tenant).or_default();
        if queue.entries.is_empty() {
            queue.start = queue.finish.max(virtual_time);
        }
        queue.entries.push(entry);
        self.len += 1;
    }

    pub fn remove(&mut self, tenant: &TenantId, id: SequenceId) -> bool {
        let Some(queue) = self.tenants.get_mut(tenant) else {
            return false;
        };
        let before = queue.entries.len();
        queue.entries.retain(|e| e.id != id);
        let removed = before - queue.entries.len();
        self.len -= removed;
        removed > 0
    }

    fn head<'a>(&self, queue: &'a TenantQueue, now: Instant, penalty: f64) -> Option<&'a QueuedEntry> {
        queue.entries.iter().min_by(|a, b| {
            let ka = srpt_key(a.cost_chunks, now.saturating_duration_since(a.arrival), self.aging_bound, penalty);
            let kb = srpt_key(b.cost_chunks, now.saturating_duration_since(b.arrival), self.aging_bound, penalty);
            ka.total_cmp(&kb).then(a.seq_no.cmp(&b.seq_no))
        })
    }

    /// Lowest-tag candidate among tenants not in `skip`.
    pub fn select(
        &self,
        now: Instant,
        skip: &HashSet<TenantId>,
        weight: impl Fn(&TenantId) -> f64,
        penalty: impl Fn(&TenantId) -> f64,
    ) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for (tenant, queue) in &self.tenants {
            if skip.contains(tenant) {
                continue;
            }
            let Some(head) = self.head(queue, now, penalty(tenant)) else {
                continue;
            };
            let start = queue.start;
            let tag = start + head.cost_chunks.max(1) as f64 / weight(tenant).max(f64::EPSILON);
            let better = match &best {
                None => true,
                Some(b) => tag
                    .total_cmp(&b.tag)
                    .then(head.seq_no.cmp(&b.seq_no))
                    .is_lt(),
            };
            if better {
                best = Some(Candidate {
                    tenant: tenant.clone(),
                    id: head.id,
                    seq_no: head.seq_no,
                    arrival: head.arrival,
                    cost_chunks: head.cost_chunks,
                    start,
                    tag,
                });
            }
        }
        best
    }

    /// Dequeue a selected candidate and advance the tags.
    pub fn commit(&mut self, candidate: &Candidate) {
        if !self.remove(&candidate.tenant, candidate.id) {
            return;
        }
        if let Some(queue) = self.tenants.get_mut(&candidate.tenant) {
            queue.finish = candidate.tag;
            queue.start = candidate.tag;
        }
        self.virtual_time = self.virtual_time.max(candidate.start);
    }

    /// Select and commit in one step.
    #[cfg(test)]
    pub fn pop_next(
        &mut self,
        now: Instant,
        weight: impl Fn(&TenantId) -> f64,
        penalty: impl Fn(&TenantId) -> f64,
    ) -> Option<Candidate> {
        let candidate = self.select(now, &HashSet::new(), weight, penalty)?;
        self.commit(&candidate);
        Some(candidate)
    }
}
