//! Sequences and their lifecycle.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::Reservation;
use crate::cache::prefix::{PrefixPage, Token};
use crate::placement::worker::WorkerId;
use crate::scheduler::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub Uuid);

impl SequenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Admitted,
    Prefilling,
    Transferring,
    Decoding,
    Completed,
    Rejected,
    Cancelled,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Queued,
        Phase::Admitted,
        Phase::Prefilling,
        Phase::Transferring,
        Phase::Decoding,
        Phase::Completed,
        Phase::Rejected,
        Phase::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Rejected | Phase::Cancelled)
    }

    /// Holding a reservation and worker slots.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Phase::Admitted | Phase::Prefilling | Phase::Transferring | Phase::Decoding
        )
    }

    /// Phases a preemption may interrupt.
    pub fn is_preemptible(&self) -> bool {
        matches!(
            self,
            Phase::Admitted | Phase::Prefilling | Phase::Transferring
        )
    }

    pub fn can_transition(&self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Queued, Admitted) => true,
            (Admitted, Prefilling) => true,
            (Prefilling, Transferring) => true,
            (Transferring, Decoding) => true,
            (Decoding, Completed) => true,
            // Preemption, timeout and retry requeue.
            (Admitted | Prefilling | Transferring | Decoding, Queued) => true,
            (from, Rejected | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Admitted => "admitted",
            Phase::Prefilling => "prefilling",
            Phase::Transferring => "transferring",
            Phase::Decoding => "decoding",
            Phase::Completed => "completed",
            Phase::Rejected => "rejected",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a sequence was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    QueueFull,
    RateLimited,
    /// Demands more of some budget than its ceiling.
    ExceedsCapacity,
    UnknownTenant,
    AdmissionTimeout,
    /// Retryable failures exhausted the attempt limit.
    RetriesExhausted,
    /// Execution failed and cannot be retried.
    Failed,
    /// Scheduler invariant violated for this sequence.
    Internal,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::QueueFull => "queue-full",
            RejectReason::RateLimited => "rate-limited",
            RejectReason::ExceedsCapacity => "exceeds-capacity",
            RejectReason::UnknownTenant => "unknown-tenant",
            RejectReason::AdmissionTimeout => "admission-timeout",
            RejectReason::RetriesExhausted => "retries-exhausted",
            RejectReason::Failed => "failed",
            RejectReason::Internal => "internal",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRequest {
    pub tenant: TenantId,
    pub prompt: Vec<Token>,
    pub max_new_tokens: usize,
}

/// A sequence owned by the scheduler arena.
#[derive(Debug)]
pub struct Sequence {
    pub id: SequenceId,
    pub tenant: TenantId,
    pub prompt: Arc<[Token]>,
    pub max_new_tokens: usize,
    /// Prompt split into chained-key pages.
    pub pages: Arc<[PrefixPage]>,
    /// Leading pages found in cache at submit.
    pub cached_pages: usize,
    pub cached_tokens: usize,
    /// Submission instant. Survives requeues.
    pub arrival: Instant,
    /// Tie-break order within the arena.
    pub seq_no: u64,
    pub phase: Phase,
    /// Bumped on every requeue; events carrying an older attempt are stale.
    pub attempt: u32,
    /// Requeues after failures or timeouts. Preemptions are counted separately.
    pub retries: u32,
    pub preemptions: u32,
    pub reservation: Reservation,
    pub prefill_worker: Option<WorkerId>,
    pub decode_worker: Option<WorkerId>,
    /// Worker slots still claimed by this sequence.
    pub holds_prefill_slot: bool,
    pub holds_decode_slot: bool,
    pub admitted_at: Option<Instant>,
    pub first_token_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub generated_tokens: usize,
    pub reject_reason: Option<RejectReason>,
    pub error: Option<String>,
    pub cancel: CancellationToken,
}

impl Sequence {
    pub fn prompt_tokens(&self) -> usize {
        self.prompt.len()
    }

    /// Prompt tokens that still need prefill.
    pub fn uncached_tokens(&self) -> usize {
        self.prompt.len().saturating_sub(self.cached_tokens)
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.arrival)
    }

    pub fn status(&self, now: Instant) -> SequenceStatus {
        SequenceStatus {
            id: self.id,
            tenant: self.tenant.clone(),
            phase: self.phase,
            attempt: self.attempt,
            retries: self.retries,
            preemptions: self.preemptions,
            prompt_tokens: self.prompt_tokens(),
            cached_tokens: self.cached_tokens,
            generated_tokens: self.generated_tokens,
            prefill_worker: self.prefill_worker.clone(),
            decode_worker: self.decode_worker.clone(),
            waited_ms: self
                .admitted_at
                .unwrap_or(now)
                .saturating_duration_since(self.arrival)
                .as_millis() as u64,
            ttft_ms: self
                .first_token_at
                .map(|t| t.saturating_duration_since(self.arrival).as_millis() as u64),
            reservation: self.reservation.summary(),
            reject_reason: self.reject_reason,
            error: self.error.clone(),
        }
    }
}

/// Serializable view of a sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceStatus {
    pub id: SequenceId,
    pub tenant: TenantId,
    pub phase: Phase,
    pub attempt: u32,
    pub retries: u32,
    pub preemptions: u32,
    pub prompt_tokens: usize,
    pub cached_tokens: usize,
    pub generated_tokens: usize,
    pub prefill_worker: Option<WorkerId>,
    pub decode_worker: Option<WorkerId>,
    /// Time from arrival to latest admission (or to now while queued).
    pub waited_ms: u64,
    pub ttft_ms: Option<u64>,
    pub reservation: Vec<(String, u64)>,
    pub reject_reason: Option<RejectReason>,
    pub error: Option<String>,
}

/// Work handed to the serving engine when a sequence is admitted.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: SequenceId,
    pub tenant: TenantId,
    pub attempt: u32,
    pub prompt: Arc<[Token]>,
    pub pages: Arc<[PrefixPage]>,
    pub cached_pages: usize,
    pub max_new_tokens: usize,
    pub prefill_worker: WorkerId,
    pub decode_worker: WorkerId,
    /// Device-tier bytes detached from the reservation for new pages.
    pub device_bytes: u64,
    pub cancel: CancellationToken,
}
