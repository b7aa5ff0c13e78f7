//! The admission scheduler.
//!
//! Owns the sequence arena and the fair queue. Every entry point takes the
//! arena lock, mutates, runs an admission pass when resources may have been
//! freed, and returns; the lock is never held across an await. Admitted work
//! leaves through an unbounded channel of [`Dispatch`]es.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetError, BudgetTracker, Reservation, Resource};
use crate::cache::page::{PageKey, Tier};
use crate::cache::prefix::{chain_salt, prefix_pages, PrefixPage};
use crate::config::{Config, SchedulingConfig};
use crate::metrics::Metrics;
use crate::placement::router::Router;
use crate::placement::worker::Role;
use crate::scheduler::queue::{cost_chunks, Candidate, FairQueue, QueuedEntry};
use crate::scheduler::ratelimit::{RateLimiter, SubmitVerdict};
use crate::scheduler::sequence::{
    Dispatch, Phase, RejectReason, Sequence, SequenceId, SequenceRequest, SequenceStatus,
};
use crate::scheduler::tenant::{Tenant, TenantId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("unknown sequence {0}")]
    UnknownSequence(SequenceId),

    #[error("stale event for {id}: attempt {got}, current {current}")]
    StaleEvent {
        id: SequenceId,
        got: u32,
        current: u32,
    },

    #[error("illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: SequenceId,
        from: Phase,
        to: Phase,
    },

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error(transparent)]
    Budget(#[from] BudgetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Admitted,
    Queued,
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub id: SequenceId,
    pub decision: Decision,
}

/// What a finished sequence reports.
#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub generated_tokens: usize,
    pub first_token_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub virtual_time: f64,
    pub phases: Vec<(Phase, usize)>,
}

/// Why a candidate could not be admitted this pass.
#[derive(Debug)]
enum Blocked {
    Budget(BudgetError),
    NoWorker(Role),
    RateLimited,
    /// The arena and the queue disagreed; the sequence was aborted.
    Invalid,
}

struct TenantState {
    tenant: Tenant,
    limiter: Option<RateLimiter>,
}

struct State {
    tenants: HashMap<TenantId, TenantState>,
    sequences: HashMap<SequenceId, Sequence>,
    queue: FairQueue,
    history: VecDeque<SequenceStatus>,
    next_seq_no: u64,
}

pub struct Scheduler {
    state: Mutex<State>,
    config: SchedulingConfig,
    page_tokens: usize,
    page_bytes: u64,
    share_prefix: bool,
    budgets: Arc<BudgetTracker>,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        budgets: Arc<BudgetTracker>,
        router: Arc<Router>,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let now = Instant::now();
        let tenants = config
            .tenants
            .iter()
            .map(|tc| {
                let tenant = Tenant::from(tc);
                let limiter = tenant.rate_limit.as_ref().map(|rl| RateLimiter::new(rl, now));
                (tenant.id.clone(), TenantState { tenant, limiter })
            })
            .collect();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            state: Mutex::new(State {
                tenants,
                sequences: HashMap::new(),
                queue: FairQueue::new(config.scheduling.aging_bound()),
                history: VecDeque::new(),
                next_seq_no: 0,
            }),
            config: config.scheduling.clone(),
            page_tokens: config.model.page_tokens,
            page_bytes: config.model.page_bytes(),
            share_prefix: config.model.share_prefix_across_tenants,
            budgets,
            router,
            metrics,
            dispatch_tx,
        };
        (scheduler, dispatch_rx)
    }

    pub fn budgets(&self) -> &Arc<BudgetTracker> {
        &self.budgets
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Accept, queue or reject a new sequence, then run an admission pass.
    pub fn submit(
        &self,
        request: SequenceRequest,
        now: Instant,
    ) -> Result<Submission, SchedulerError> {
        if request.prompt.is_empty() {
            return Err(SchedulerError::EmptyPrompt);
        }
        let id = SequenceId::new();
        let mut state = self.state.lock();
        let seq_no = state.next_seq_no;
        state.next_seq_no += 1;

        let Some(tenant) = state.tenants.get(&request.tenant).map(|t| t.tenant.clone()) else {
            warn!(tenant = %request.tenant, "Submission from unknown tenant");
            return Ok(self.reject_new(&mut state, id, request, seq_no, now, RejectReason::UnknownTenant));
        };

        let salt = chain_salt(&tenant.id, self.share_prefix);
        let pages = prefix_pages(&request.prompt, self.page_tokens, salt);
        let keys: Vec<PageKey> = pages.iter().map(|p| p.key).collect();
        let cached_pages = self.router.locator().cached_prefix(&keys);
        let demands = self.demands(&tenant.id, request.prompt.len(), request.max_new_tokens, pages.len(), cached_pages);
        if let Some((resource, amount)) = demands.iter().find(|(r, amount)| {
            self.budgets.get(r).is_some_and(|b| *amount > b.ceiling())
        }) {
            info!(tenant = %tenant.id, resource = %resource, amount, "Sequence exceeds budget ceiling");
            return Ok(self.reject_new(&mut state, id, request, seq_no, now, RejectReason::ExceedsCapacity));
        }
        let prompt_tokens = request.prompt.len() as u64;
        if let Some(limiter) = state
            .tenants
            .get_mut(&tenant.id)
            .and_then(|t| t.limiter.as_mut())
        {
            match limiter.on_submit(prompt_tokens, now) {
                SubmitVerdict::Allow => {}
                SubmitVerdict::Deprioritize { until } => {
                    debug!(tenant = %tenant.id, until = ?until.saturating_duration_since(now), "Tenant deprioritized")
                }
                SubmitVerdict::Reject => {
                    return Ok(self.reject_new(&mut state, id, request, seq_no, now, RejectReason::RateLimited));
                }
            }
        }

        let cached_tokens = pages[..cached_pages].iter().map(|p| p.token_count).sum();
        let sequence = Sequence {
            id,
            tenant: tenant.id.clone(),
            prompt: request.prompt.into(),
            max_new_tokens: request.max_new_tokens,
            pages: pages.into(),
            cached_pages,
            cached_tokens,
            arrival: now,
            seq_no,
            phase: Phase::Queued,
            attempt: 0,
            retries: 0,
            preemptions: 0,
            reservation: Reservation::default(),
            prefill_worker: None,
            decode_worker: None,
            holds_prefill_slot: false,
            holds_decode_slot: false,
            admitted_at: None,
            first_token_at: None,
            finished_at: None,
            generated_tokens: 0,
            reject_reason: None,
            error: None,
            cancel: CancellationToken::new(),
        };
        debug!(
            sequence = %id,
            tenant = %tenant.id,
            prompt_tokens,
            cached_tokens,
            "Sequence queued"
        );
        self.enqueue(&mut state, sequence);
        self.schedule_locked(&mut state, now);

        // Only a sequence left waiting counts against the depth ceiling.
        let waiting = state
            .sequences
            .get(&id)
            .is_some_and(|s| s.phase == Phase::Queued);
        if waiting && state.queue.len() > self.config.max_queue_depth {
            state.queue.remove(&tenant.id, id);
            info!(sequence = %id, tenant = %tenant.id, depth = state.queue.len(), "Queue full");
            self.finish(&mut state, id, Phase::Rejected, Some(RejectReason::QueueFull), None, now);
        }

        let decision = match state.sequences.get(&id).map(|s| s.phase) {
            Some(Phase::Queued) => Decision::Queued,
            Some(_) => Decision::Admitted,
            None => match self.find_history(&state, id).and_then(|s| s.reject_reason) {
                Some(reason) => Decision::Rejected { reason },
                None => Decision::Admitted,
            },
        };
        self.update_phase_gauges(&state);
        Ok(Submission { id, decision })
    }

    /// Run an admission pass. Returns how many sequences were admitted.
    pub fn schedule(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let admitted = self.schedule_locked(&mut state, now);
        self.update_phase_gauges(&state);
        admitted
    }

    pub fn status(&self, id: SequenceId) -> Option<SequenceStatus> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .sequences
            .get(&id)
            .map(|s| s.status(now))
            .or_else(|| self.find_history(&state, id).cloned())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            queued: state.queue.len(),
            virtual_time: state.queue.virtual_time(),
            phases: Self::phase_counts(&state)
                .into_iter()
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }

    /// Live (non-terminal) sequences.
    pub fn active(&self) -> usize {
        self.state.lock().sequences.len()
    }

    pub fn on_prefill_started(&self, id: SequenceId, attempt: u32) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        self.advance(&mut state, id, attempt, Phase::Prefilling)?;
        Ok(())
    }

    /// Prefill finished and its pages are registered. Frees the prefill side.
    pub fn on_pages_ready(&self, id: SequenceId, attempt: u32) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        self.advance(&mut state, id, attempt, Phase::Transferring)?;
        if let Some(seq) = state.sequences.get_mut(&id) {
            let slots = seq.reservation.take(&Resource::PrefillSlots, 1);
            let release = self.budgets.release(&Resource::PrefillSlots, slots);
            if seq.holds_prefill_slot {
                if let Some(worker) = &seq.prefill_worker {
                    self.router.release(worker);
                }
                seq.holds_prefill_slot = false;
            }
            if let Err(e) = release {
                self.abort(&mut state, id, e.to_string());
                return Err(e.into());
            }
        }
        self.schedule_locked(&mut state, Instant::now());
        self.update_phase_gauges(&state);
        Ok(())
    }

    /// Pages are resident on the decode worker. Frees the transfer budget.
    pub fn on_transfer_complete(&self, id: SequenceId, attempt: u32) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        self.advance(&mut state, id, attempt, Phase::Decoding)?;
        if let Some(seq) = state.sequences.get_mut(&id) {
            let bytes = seq.reservation.take(&Resource::TransferBandwidth, u64::MAX);
            if let Err(e) = self.budgets.release(&Resource::TransferBandwidth, bytes) {
                self.abort(&mut state, id, e.to_string());
                return Err(e.into());
            }
        }
        self.schedule_locked(&mut state, Instant::now());
        self.update_phase_gauges(&state);
        Ok(())
    }

    /// Decode finished. Releases everything the sequence holds.
    pub fn complete(&self, id: SequenceId, attempt: u32, usage: Usage) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        self.advance(&mut state, id, attempt, Phase::Completed)?;
        let now = Instant::now();
        if let Some(seq) = state.sequences.get_mut(&id) {
            seq.generated_tokens = usage.generated_tokens;
            seq.first_token_at = Some(usage.first_token_at);
            let ttft = usage.first_token_at.saturating_duration_since(seq.arrival);
            self.metrics
                .ttft
                .with_label_values(&[seq.tenant.as_str()])
                .observe(ttft.as_secs_f64());
            info!(
                sequence = %id,
                tenant = %seq.tenant,
                ttft_ms = ttft.as_millis() as u64,
                generated = usage.generated_tokens,
                "Sequence completed"
            );
        }
        self.finish(&mut state, id, Phase::Completed, None, None, now);
        self.schedule_locked(&mut state, now);
        self.update_phase_gauges(&state);
        Ok(())
    }

    /// Execution failed. Retryable failures requeue while retries remain.
    pub fn fail(
        &self,
        id: SequenceId,
        attempt: u32,
        reason: &str,
        retryable: bool,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        self.check_attempt(&state, id, attempt)?;
        let now = Instant::now();
        let retries = state.sequences.get(&id).map_or(0, |s| s.retries);
        if retryable && retries + 1 < self.config.max_attempts {
            warn!(sequence = %id, reason, retries = retries + 1, "Sequence failed, requeueing");
            self.requeue_locked(&mut state, id, true)?;
        } else {
            let reject = if retryable {
                RejectReason::RetriesExhausted
            } else {
                RejectReason::Failed
            };
            warn!(sequence = %id, reason, "Sequence failed");
            self.finish(&mut state, id, Phase::Rejected, Some(reject), Some(reason.to_string()), now);
        }
        self.schedule_locked(&mut state, now);
        self.update_phase_gauges(&state);
        Ok(())
    }

    /// Refuse a running sequence outright, without retry.
    pub fn reject(
        &self,
        id: SequenceId,
        attempt: u32,
        reason: RejectReason,
        detail: &str,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        self.check_attempt(&state, id, attempt)?;
        let now = Instant::now();
        warn!(sequence = %id, reason = %reason, detail, "Running sequence rejected");
        self.finish(&mut state, id, Phase::Rejected, Some(reason), Some(detail.to_string()), now);
        self.schedule_locked(&mut state, now);
        self.update_phase_gauges(&state);
        Ok(())
    }

    /// Cancel a live sequence. Its work is signalled through its token.
    pub fn cancel(&self, id: SequenceId) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        let Some(seq) = state.sequences.get(&id) else {
            return Err(SchedulerError::UnknownSequence(id));
        };
        let tenant = seq.tenant.clone();
        if seq.phase == Phase::Queued {
            state.queue.remove(&tenant, id);
        }
        info!(sequence = %id, tenant = %tenant, "Sequence cancelled");
        let now = Instant::now();
        self.finish(&mut state, id, Phase::Cancelled, None, None, now);
        self.schedule_locked(&mut state, now);
        self.update_phase_gauges(&state);
        Ok(())
    }

    /// Send a running sequence back to the queue, keeping its age.
    pub fn requeue(&self, id: SequenceId) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        self.requeue_locked(&mut state, id, false)?;
        self.schedule_locked(&mut state, Instant::now());
        self.update_phase_gauges(&state);
        Ok(())
    }

    /// Requeue or reject admitted sequences that never started prefill.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        let timeout = self.config.admission_timeout();
        let mut state = self.state.lock();
        let expired: Vec<(SequenceId, u32)> = state
            .sequences
            .values()
            .filter(|s| s.phase == Phase::Admitted)
            .filter(|s| {
                s.admitted_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
            })
            .map(|s| (s.id, s.retries))
            .collect();
        for (id, retries) in &expired {
            if retries + 1 < self.config.max_attempts {
                warn!(sequence = %id, "Admission timed out, requeueing");
                if let Err(e) = self.requeue_locked(&mut state, *id, true) {
                    debug!(sequence = %id, error = %e, "Timeout requeue failed");
                }
            } else {
                warn!(sequence = %id, "Admission timed out, rejecting");
                self.finish(&mut state, *id, Phase::Rejected, Some(RejectReason::AdmissionTimeout), None, now);
            }
        }
        self.schedule_locked(&mut state, now);
        self.update_phase_gauges(&state);
        expired.len()
    }

    fn demands(
        &self,
        tenant: &TenantId,
        prompt_tokens: usize,
        max_new_tokens: usize,
        pages: usize,
        cached_pages: usize,
    ) -> Vec<(Resource, u64)> {
        let mut demands = vec![
            (Resource::TokensInFlight, (prompt_tokens + max_new_tokens) as u64),
            (Resource::TenantConcurrency(tenant.clone()), 1),
            (Resource::PrefillSlots, 1),
            (Resource::DecodeSlots, 1),
            (Resource::TransferBandwidth, pages as u64 * self.page_bytes),
        ];
        let device = Resource::TierCapacity(Tier::DeviceMemory);
        if self.budgets.get(&device).is_some() {
            demands.push((device, (pages - cached_pages) as u64 * self.page_bytes));
        }
        demands
    }

    fn enqueue(&self, state: &mut State, seq: Sequence) {
        let entry = QueuedEntry {
            id: seq.id,
            seq_no: seq.seq_no,
            arrival: seq.arrival,
            cost_chunks: cost_chunks(seq.uncached_tokens(), self.config.prefill_chunk_tokens),
        };
        state.queue.push(seq.tenant.clone(), entry);
        state.sequences.insert(seq.id, seq);
    }

    fn reject_new(
        &self,
        state: &mut State,
        id: SequenceId,
        request: SequenceRequest,
        seq_no: u64,
        now: Instant,
        reason: RejectReason,
    ) -> Submission {
        let seq = Sequence {
            id,
            tenant: request.tenant,
            prompt: request.prompt.into(),
            max_new_tokens: request.max_new_tokens,
            pages: Vec::<PrefixPage>::new().into(),
            cached_pages: 0,
            cached_tokens: 0,
            arrival: now,
            seq_no,
            phase: Phase::Rejected,
            attempt: 0,
            retries: 0,
            preemptions: 0,
            reservation: Reservation::default(),
            prefill_worker: None,
            decode_worker: None,
            holds_prefill_slot: false,
            holds_decode_slot: false,
            admitted_at: None,
            first_token_at: None,
            finished_at: Some(now),
            generated_tokens: 0,
            reject_reason: Some(reason),
            error: None,
            cancel: CancellationToken::new(),
        };
        info!(sequence = %id, tenant = %seq.tenant, reason = %reason, "Sequence rejected");
        self.metrics.rejections.with_label_values(&[reason.as_str()]).inc();
        self.push_history(state, seq.status(now));
        Submission {
            id,
            decision: Decision::Rejected { reason },
        }
    }

    fn schedule_locked(&self, state: &mut State, now: Instant) -> usize {
        let mut skip: HashSet<TenantId> = HashSet::new();
        let mut preempted_for: HashSet<SequenceId> = HashSet::new();
        let mut admitted = 0;
        loop {
            let candidate = {
                let tenants = &state.tenants;
                state.queue.select(
                    now,
                    &skip,
                    |t| tenants.get(t).map_or(1.0, |s| s.tenant.weight),
                    |t| {
                        tenants
                            .get(t)
                            .and_then(|s| s.limiter.as_ref())
                            .map_or(1.0, |l| l.penalty(now))
                    },
                )
            };
            let Some(candidate) = candidate else {
                break;
            };
            match self.try_admit(state, &candidate, now) {
                Ok(()) => {
                    state.queue.commit(&candidate);
                    admitted += 1;
                }
                Err(Blocked::Invalid) => {
                    state.queue.remove(&candidate.tenant, candidate.id);
                }
                Err(blocked) => {
                    let may_preempt = matches!(blocked, Blocked::Budget(_) | Blocked::NoWorker(_))
                        && self.config.preemption
                        && preempted_for.insert(candidate.id);
                    if may_preempt && self.try_preempt(state, &candidate, &blocked, now) {
                        continue;
                    }
                    debug!(
                        sequence = %candidate.id,
                        tenant = %candidate.tenant,
                        blocked = ?blocked,
                        "Head not admissible"
                    );
                    skip.insert(candidate.tenant);
                }
            }
        }
        admitted
    }

    fn try_admit(&self, state: &mut State, candidate: &Candidate, now: Instant) -> Result<(), Blocked> {
        let Some(seq) = state.sequences.get(&candidate.id) else {
            error!(sequence = %candidate.id, "Queued sequence missing from arena");
            return Err(Blocked::Invalid);
        };
        if seq.phase != Phase::Queued {
            let from = seq.phase;
            error!(sequence = %candidate.id, phase = %from, "Duplicate admission");
            self.abort(state, candidate.id, format!("duplicate admission from {from}"));
            return Err(Blocked::Invalid);
        }

        let keys: Vec<PageKey> = seq.pages.iter().map(|p| p.key).collect();
        let cached_pages = self.router.locator().cached_prefix(&keys);
        let demands = self.demands(
            &seq.tenant,
            seq.prompt_tokens(),
            seq.max_new_tokens,
            keys.len(),
            cached_pages,
        );
        let mut reservation = self.budgets.try_reserve_all(&demands).map_err(Blocked::Budget)?;

        let prefill = match self.router.place(Role::Prefill, &[]) {
            Ok(p) => p,
            Err(_) => {
                self.refund(&reservation);
                return Err(Blocked::NoWorker(Role::Prefill));
            }
        };
        let decode = match self.router.place(Role::Decode, &keys) {
            Ok(p) => p,
            Err(_) => {
                self.router.release(&prefill.worker);
                self.refund(&reservation);
                return Err(Blocked::NoWorker(Role::Decode));
            }
        };

        let prompt_tokens = seq.prompt_tokens() as u64;
        let tenant = seq.tenant.clone();
        let rate_ok = state
            .tenants
            .get_mut(&tenant)
            .and_then(|t| t.limiter.as_mut())
            .map_or(true, |l| l.try_admit(prompt_tokens, now));
        if !rate_ok {
            self.router.release(&prefill.worker);
            self.router.release(&decode.worker);
            self.refund(&reservation);
            return Err(Blocked::RateLimited);
        }

        let device_bytes = reservation.take(&Resource::TierCapacity(Tier::DeviceMemory), u64::MAX);
        let Some(seq) = state.sequences.get_mut(&candidate.id) else {
            return Err(Blocked::Invalid);
        };
        seq.cached_pages = cached_pages;
        seq.cached_tokens = seq.pages[..cached_pages].iter().map(|p| p.token_count).sum();
        seq.phase = Phase::Admitted;
        seq.admitted_at = Some(now);
        seq.reservation = reservation;
        seq.prefill_worker = Some(prefill.worker.clone());
        seq.decode_worker = Some(decode.worker.clone());
        seq.holds_prefill_slot = true;
        seq.holds_decode_slot = true;
        self.metrics.prefix_hit_tokens.inc_by(seq.cached_tokens as u64);

        info!(
            sequence = %seq.id,
            tenant = %seq.tenant,
            attempt = seq.attempt,
            prefill = %prefill.worker,
            decode = %decode.worker,
            cached_tokens = seq.cached_tokens,
            waited_ms = seq.waited(now).as_millis() as u64,
            "Sequence admitted"
        );

        let dispatch = Dispatch {
            id: seq.id,
            tenant: seq.tenant.clone(),
            attempt: seq.attempt,
            prompt: seq.prompt.clone(),
            pages: seq.pages.clone(),
            cached_pages,
            max_new_tokens: seq.max_new_tokens,
            prefill_worker: prefill.worker,
            decode_worker: decode.worker,
            device_bytes,
            cancel: seq.cancel.clone(),
        };
        if let Err(e) = self.dispatch_tx.send(dispatch) {
            // Nobody will run it; give the detached bytes back.
            let bytes = e.0.device_bytes;
            if let Err(e) = self
                .budgets
                .release(&Resource::TierCapacity(Tier::DeviceMemory), bytes)
            {
                warn!(sequence = %candidate.id, bytes, error = %e, "Device bytes release failed");
            }
            warn!(sequence = %candidate.id, "Dispatch channel closed");
        }
        Ok(())
    }

    /// Return a reservation that was taken for an admission that did not happen.
    fn refund(&self, reservation: &Reservation) {
        if let Err(e) = self.budgets.release_all(reservation) {
            warn!(error = %e, held = ?reservation.summary(), "Reservation refund failed");
        }
    }

    /// Estimated prefill time of a sequence. Prefill runs in whole chunks.
    fn prefill_estimate(&self, seq: &Sequence) -> Duration {
        let chunks = cost_chunks(seq.uncached_tokens(), self.config.prefill_chunk_tokens);
        let tokens = chunks as f64 * self.config.prefill_chunk_tokens as f64;
        Duration::from_secs_f64(tokens / self.config.prefill_tokens_per_sec_estimate.max(1.0))
    }

    /// Time until the earliest running prefill is expected to free its slot.
    fn prefill_wait(&self, state: &State) -> Duration {
        state
            .sequences
            .values()
            .filter(|s| s.holds_prefill_slot)
            .map(|s| self.prefill_estimate(s))
            .min()
            .unwrap_or(Duration::ZERO)
    }

    /// Amounts of each demanded resource the candidate is short by right now.
    fn shortfalls(&self, seq: &Sequence) -> Vec<(Resource, u64)> {
        let keys: Vec<PageKey> = seq.pages.iter().map(|p| p.key).collect();
        let cached = self.router.locator().cached_prefix(&keys);
        self.demands(&seq.tenant, seq.prompt_tokens(), seq.max_new_tokens, keys.len(), cached)
            .into_iter()
            .filter_map(|(resource, amount)| {
                let headroom = self.budgets.headroom(&resource);
                (amount > headroom).then_some((resource, amount.saturating_sub(headroom)))
            })
            .collect()
    }

    /// Preempt one lower-weight running sequence on behalf of `candidate`.
    ///
    /// Only a victim whose refund covers every shortfall is taken, so a
    /// preemption always unblocks the candidate. A candidate held back by its
    /// own tenant's concurrency cap never preempts.
    fn try_preempt(&self, state: &mut State, candidate: &Candidate, blocked: &Blocked, now: Instant) -> bool {
        let Some(ts) = state.tenants.get(&candidate.tenant) else {
            return false;
        };
        let Some(target) = ts.tenant.ttft_target else {
            return false;
        };
        let weight = ts.tenant.weight;
        let Some(seq) = state.sequences.get(&candidate.id) else {
            return false;
        };

        let (shortfalls, worker_role) = match blocked {
            Blocked::Budget(_) => (self.shortfalls(seq), None),
            Blocked::NoWorker(role) => (Vec::new(), Some(*role)),
            Blocked::RateLimited | Blocked::Invalid => return false,
        };
        if shortfalls.is_empty() && worker_role.is_none() {
            return false;
        }
        let own_cap = Resource::TenantConcurrency(candidate.tenant.clone());
        if shortfalls.iter().any(|(r, _)| *r == own_cap) {
            return false;
        }

        let prefill_blocked = worker_role == Some(Role::Prefill)
            || shortfalls.iter().any(|(r, _)| *r == Resource::PrefillSlots);
        let wait = if prefill_blocked {
            self.prefill_wait(state)
        } else {
            Duration::ZERO
        };
        let projected = seq.waited(now) + wait + self.prefill_estimate(seq);
        if projected < target {
            return false;
        }

        let relieves = |s: &Sequence| {
            let worker_ok = match worker_role {
                Some(Role::Prefill) => s.holds_prefill_slot,
                Some(Role::Decode) => s.holds_decode_slot,
                None => true,
            };
            worker_ok
                && shortfalls
                    .iter()
                    .all(|(r, missing)| s.reservation.amount(r) >= *missing)
        };
        let victim = state
            .sequences
            .values()
            .filter(|s| s.phase.is_preemptible())
            .filter(|s| s.preemptions < self.config.max_preemptions)
            .filter(|s| relieves(s))
            .filter_map(|s| {
                let w = state.tenants.get(&s.tenant)?.tenant.weight;
                (w < weight).then_some((w, s.admitted_at, s.seq_no, s.id))
            })
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| b.1.cmp(&a.1))
                    .then_with(|| b.2.cmp(&a.2))
            });
        let Some((_, _, _, victim)) = victim else {
            debug!(
                sequence = %candidate.id,
                projected_ms = projected.as_millis() as u64,
                "TTFT at risk but no victim frees the blocker"
            );
            return false;
        };

        info!(
            victim = %victim,
            beneficiary = %candidate.id,
            tenant = %candidate.tenant,
            projected_ms = projected.as_millis() as u64,
            "Preempting sequence"
        );
        if let Some(seq) = state.sequences.get_mut(&victim) {
            seq.preemptions += 1;
        }
        self.metrics.preemptions.inc();
        self.requeue_locked(state, victim, false).is_ok()
    }

    fn check_attempt(&self, state: &State, id: SequenceId, attempt: u32) -> Result<(), SchedulerError> {
        let seq = state
            .sequences
            .get(&id)
            .ok_or(SchedulerError::UnknownSequence(id))?;
        if seq.attempt != attempt {
            return Err(SchedulerError::StaleEvent {
                id,
                got: attempt,
                current: seq.attempt,
            });
        }
        Ok(())
    }

    /// Move a sequence to `to`. An illegal move aborts the sequence.
    fn advance(
        &self,
        state: &mut State,
        id: SequenceId,
        attempt: u32,
        to: Phase,
    ) -> Result<(), SchedulerError> {
        self.check_attempt(state, id, attempt)?;
        let Some(seq) = state.sequences.get_mut(&id) else {
            return Err(SchedulerError::UnknownSequence(id));
        };
        let from = seq.phase;
        if !from.can_transition(to) {
            self.abort(state, id, format!("illegal transition {from} -> {to}"));
            return Err(SchedulerError::InvalidTransition { id, from, to });
        }
        if !to.is_terminal() {
            seq.phase = to;
            debug!(sequence = %id, from = %from, to = %to, "Phase change");
        }
        Ok(())
    }

    fn requeue_locked(&self, state: &mut State, id: SequenceId, retry: bool) -> Result<(), SchedulerError> {
        let Some(seq) = state.sequences.get_mut(&id) else {
            return Err(SchedulerError::UnknownSequence(id));
        };
        if !seq.phase.can_transition(Phase::Queued) {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: seq.phase,
                to: Phase::Queued,
            });
        }
        let released = self.release_resources(seq);
        seq.cancel.cancel();
        seq.cancel = CancellationToken::new();
        seq.attempt += 1;
        if retry {
            seq.retries += 1;
        }
        seq.phase = Phase::Queued;
        seq.admitted_at = None;
        seq.prefill_worker = None;
        seq.decode_worker = None;
        if let Err(e) = released {
            self.abort(state, id, e.to_string());
            return Err(e.into());
        }
        let Some(seq) = state.sequences.get(&id) else {
            return Err(SchedulerError::UnknownSequence(id));
        };
        let entry = QueuedEntry {
            id,
            seq_no: seq.seq_no,
            arrival: seq.arrival,
            cost_chunks: cost_chunks(seq.uncached_tokens(), self.config.prefill_chunk_tokens),
        };
        let tenant = seq.tenant.clone();
        debug!(sequence = %id, attempt = seq.attempt, "Sequence requeued");
        state.queue.push(tenant, entry);
        Ok(())
    }

    fn release_resources(&self, seq: &mut Sequence) -> Result<(), BudgetError> {
        if seq.holds_prefill_slot {
            if let Some(worker) = &seq.prefill_worker {
                self.router.release(worker);
            }
            seq.holds_prefill_slot = false;
        }
        if seq.holds_decode_slot {
            if let Some(worker) = &seq.decode_worker {
                self.router.release(worker);
            }
            seq.holds_decode_slot = false;
        }
        let reservation = std::mem::take(&mut seq.reservation);
        self.budgets.release_all(&reservation)
    }

    /// Terminate a sequence whose bookkeeping is inconsistent. Other sequences are unaffected.
    fn abort(&self, state: &mut State, id: SequenceId, reason: String) {
        error!(sequence = %id, reason = %reason, "Aborting sequence");
        if let Some(seq) = state.sequences.get(&id) {
            if seq.phase == Phase::Queued {
                let tenant = seq.tenant.clone();
                state.queue.remove(&tenant, id);
            }
        }
        self.finish(state, id, Phase::Rejected, Some(RejectReason::Internal), Some(reason), Instant::now());
    }

    /// Move a sequence out of the arena into the history.
    fn finish(
        &self,
        state: &mut State,
        id: SequenceId,
        phase: Phase,
        reason: Option<RejectReason>,
        error: Option<String>,
        now: Instant,
    ) {
        let Some(mut seq) = state.sequences.remove(&id) else {
            return;
        };
        if let Err(e) = self.release_resources(&mut seq) {
            error!(sequence = %id, error = %e, "Budget release failed");
        }
        if phase != Phase::Completed {
            seq.cancel.cancel();
        }
        seq.phase = phase;
        seq.finished_at = Some(now);
        seq.reject_reason = reason;
        seq.error = error;
        if let Some(reason) = reason {
            self.metrics.rejections.with_label_values(&[reason.as_str()]).inc();
        }
        self.push_history(state, seq.status(now));
    }

    fn push_history(&self, state: &mut State, status: SequenceStatus) {
        state.history.push_back(status);
        while state.history.len() > self.config.retain_finished {
            state.history.pop_front();
        }
    }

    fn find_history<'a>(&self, state: &'a State, id: SequenceId) -> Option<&'a SequenceStatus> {
        state.history.iter().rev().find(|s| s.id == id)
    }

    fn phase_counts(state: &State) -> Vec<(Phase, usize)> {
        let mut counts: Vec<(Phase, usize)> = Phase::ALL.iter().map(|p| (*p, 0)).collect();
        for seq in state.sequences.values() {
            if let Some(slot) = counts.iter_mut().find(|(p, _)| *p == seq.phase) {
                slot.1 += 1;
            }
        }
        counts
    }

    fn update_phase_gauges(&self, state: &State) {
        for (phase, n) in Self::phase_counts(state) {
            if !phase.is_terminal() {
                self.metrics
                    .queue_depth
                    .with_label_values(&[phase.as_str()])
                    .set(n as i64);
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::page::PageKey;
    use crate::config::{ExhaustionPolicy, RateLimitConfig, TenantConfig, WorkerConfig};
    use crate::placement::router::PageLocator;
    use crate::placement::worker::WorkerRegistry;

    struct EmptyCache;

    impl PageLocator for EmptyCache {
        fn page_size(&self, _key: PageKey) -> Option<u64> {
            None
        }

        fn cached_prefix(&self, _keys: &[PageKey]) -> usize {
            0
        }
    }

    fn config(tenants: Vec<TenantConfig>, prefill_slots: u64) -> Config {
        let mut config = Config::default();
        config.tenants = tenants;
        config.budgets.max_prefill_concurrency = prefill_slots;
        config.workers = vec![
            WorkerConfig::new("p0", Role::Prefill, "a"),
            WorkerConfig::new("d0", Role::Decode, "a"),
        ];
        config.fill_defaults();
        config
    }

    fn scheduler(config: &Config) -> (Scheduler, mpsc::UnboundedReceiver<Dispatch>) {
        let budgets = Arc::new(BudgetTracker::from_config(config));
        let registry = Arc::new(WorkerRegistry::from_config(&config.workers));
        let router = Arc::new(Router::new(
            registry,
            Arc::new(EmptyCache),
            config.placement.clone(),
            config.model.page_bytes(),
        ));
        let metrics = Arc::new(Metrics::new().unwrap());
        Scheduler::new(config, budgets, router, metrics)
    }

    fn request(tenant: &str, tokens: usize) -> SequenceRequest {
        SequenceRequest {
            tenant: TenantId::from(tenant),
            prompt: (0..tokens as u32).collect(),
            max_new_tokens: 16,
        }
    }

    /// Walk a dispatched sequence through to completion.
    fn run_to_completion(s: &Scheduler, d: &Dispatch) {
        s.on_prefill_started(d.id, d.attempt).unwrap();
        s.on_pages_ready(d.id, d.attempt).unwrap();
        s.on_transfer_complete(d.id, d.attempt).unwrap();
        s.complete(
            d.id,
            d.attempt,
            Usage {
                generated_tokens: 16,
                first_token_at: Instant::now(),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_submit_admits_and_dispatches() {
        let config = config(vec![TenantConfig::new("a", 1.0)], 4);
        let (s, mut rx) = scheduler(&config);
        let sub = s.submit(request("a", 100), Instant::now()).unwrap();
        assert_eq!(sub.decision, Decision::Admitted);
        let d = rx.try_recv().unwrap();
        assert_eq!(d.id, sub.id);
        assert_eq!(d.attempt, 0);
        assert!(d.device_bytes > 0);
        assert_eq!(s.budgets().usage(&Resource::PrefillSlots), 1);

        run_to_completion(&s, &d);
        let status = s.status(sub.id).unwrap();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(s.budgets().usage(&Resource::TokensInFlight), 0);
        assert_eq!(s.budgets().usage(&Resource::PrefillSlots), 0);
        assert_eq!(s.budgets().usage(&Resource::DecodeSlots), 0);
        // Device bytes were handed to the dispatch and are still held.
        assert_eq!(
            s.budgets().usage(&Resource::TierCapacity(Tier::DeviceMemory)),
            d.device_bytes
        );
    }

    #[test]
    fn test_unknown_tenant_and_empty_prompt() {
        let config = config(vec![TenantConfig::new("a", 1.0)], 4);
        let (s, _rx) = scheduler(&config);
        let sub = s.submit(request("ghost", 10), Instant::now()).unwrap();
        assert_eq!(
            sub.decision,
            Decision::Rejected {
                reason: RejectReason::UnknownTenant
            }
        );
        assert_eq!(
            s.submit(request("a", 0), Instant::now()).unwrap_err(),
            SchedulerError::EmptyPrompt
        );
    }

    #[test]
    fn test_exceeds_capacity_rejected() {
        let mut config = config(vec![TenantConfig::new("a", 1.0)], 4);
        config.budgets.max_tokens_in_flight = 50;
        let (s, _rx) = scheduler(&config);
        let sub = s.submit(request("a", 100), Instant::now()).unwrap();
        assert_eq!(
            sub.decision,
            Decision::Rejected {
                reason: RejectReason::ExceedsCapacity
            }
        );
    }

    #[test]
    fn test_queue_full() {
        let mut config = config(vec![TenantConfig::new("a", 1.0)], 1);
        config.scheduling.max_queue_depth = 1;
        let (s, _rx) = scheduler(&config);
        let now = Instant::now();
        assert_eq!(s.submit(request("a", 10), now).unwrap().decision, Decision::Admitted);
        assert_eq!(s.submit(request("a", 10), now).unwrap().decision, Decision::Queued);
        assert_eq!(
            s.submit(request("a", 10), now).unwrap().decision,
            Decision::Rejected {
                reason: RejectReason::QueueFull
            }
        );
    }

    #[test]
    fn test_pages_ready_admits_next() {
        let config = config(vec![TenantConfig::new("a", 1.0)], 1);
        let (s, mut rx) = scheduler(&config);
        let now = Instant::now();
        s.submit(request("a", 10), now).unwrap();
        let second = s.submit(request("a", 10), now).unwrap();
        assert_eq!(second.decision, Decision::Queued);

        let d = rx.try_recv().unwrap();
        s.on_prefill_started(d.id, d.attempt).unwrap();
        s.on_pages_ready(d.id, d.attempt).unwrap();
        let next = rx.try_recv().unwrap();
        assert_eq!(next.id, second.id);
    }

    #[test]
    fn test_stale_event_ignored() {
        let config = config(vec![TenantConfig::new("a", 1.0)], 4);
        let (s, mut rx) = scheduler(&config);
        let sub = s.submit(request("a", 10), Instant::now()).unwrap();
        let d = rx.try_recv().unwrap();
        s.requeue(sub.id).unwrap();
        assert!(d.cancel.is_cancelled());

        let err = s.on_prefill_started(d.id, d.attempt).unwrap_err();
        assert!(matches!(err, SchedulerError::StaleEvent { got: 0, current: 1, .. }));
        let again = rx.try_recv().unwrap();
        assert_eq!(again.attempt, 1);
        s.on_prefill_started(again.id, again.attempt).unwrap();
    }

    #[test]
    fn test_illegal_transition_aborts_sequence() {
        let config = config(vec![TenantConfig::new("a", 1.0)], 4);
        let (s, mut rx) = scheduler(&config);
        let sub = s.submit(request("a", 10), Instant::now()).unwrap();
        let d = rx.try_recv().unwrap();
        let err = s.on_transfer_complete(d.id, d.attempt).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
        let status = s.status(sub.id).unwrap();
        assert_eq!(status.reject_reason, Some(RejectReason::Internal));
        assert_eq!(s.budgets().usage(&Resource::TokensInFlight), 0);
    }

    #[test]
    fn test_cancel_queued_and_running() {
        let config = config(vec![TenantConfig::new("a", 1.0)], 1);
        let (s, mut rx) = scheduler(&config);
        let now = Instant::now();
        let first = s.submit(request("a", 10), now).unwrap();
        let second = s.submit(request("a", 10), now).unwrap();
        s.cancel(second.id).unwrap();
        assert_eq!(s.status(second.id).unwrap().phase, Phase::Cancelled);

        let d = rx.try_recv().unwrap();
        s.cancel(first.id).unwrap();
        assert!(d.cancel.is_cancelled());
        assert_eq!(s.budgets().usage(&Resource::PrefillSlots), 0);
        assert!(matches!(
            s.cancel(first.id),
            Err(SchedulerError::UnknownSequence(_))
        ));
    }

    #[test]
    fn test_retryable_failure_requeues_until_limit() {
        let mut config = config(vec![TenantConfig::new("a", 1.0)], 4);
        config.scheduling.max_attempts = 2;
        let (s, mut rx) = scheduler(&config);
        let sub = s.submit(request("a", 10), Instant::now()).unwrap();
        let d = rx.try_recv().unwrap();
        s.fail(d.id, d.attempt, "transport exhausted", true).unwrap();
        let d = rx.try_recv().unwrap();
        assert_eq!(d.attempt, 1);
        s.fail(d.id, d.attempt, "transport exhausted", true).unwrap();
        let status = s.status(sub.id).unwrap();
        assert_eq!(status.reject_reason, Some(RejectReason::RetriesExhausted));
    }

    #[test]
    fn test_admission_timeout() {
        let mut config = config(vec![TenantConfig::new("a", 1.0)], 4);
        config.scheduling.max_attempts = 1;
        let (s, mut rx) = scheduler(&config);
        let now = Instant::now();
        let sub = s.submit(request("a", 10), now).unwrap();
        let _ = rx.try_recv().unwrap();
        assert_eq!(s.check_timeouts(now), 0);
        let later = now + config.scheduling.admission_timeout() + Duration::from_millis(1);
        assert_eq!(s.check_timeouts(later), 1);
        assert_eq!(
            s.status(sub.id).unwrap().reject_reason,
            Some(RejectReason::AdmissionTimeout)
        );
    }

    #[test]
    fn test_preemption_of_lower_weight_tenant() {
        let mut gold = TenantConfig::new("gold", 4.0);
        gold.ttft_target_ms = Some(1);
        let config = config(vec![gold, TenantConfig::new("bronze", 1.0)], 1);
        let (s, mut rx) = scheduler(&config);
        let now = Instant::now();
        let low = s.submit(request("bronze", 10), now).unwrap();
        let victim = rx.try_recv().unwrap();

        let later = now + Duration::from_millis(5);
        let high = s.submit(request("gold", 10), later).unwrap();
        assert_eq!(high.decision, Decision::Admitted);
        assert!(victim.cancel.is_cancelled());

        let status = s.status(low.id).unwrap();
        assert_eq!(status.phase, Phase::Queued);
        assert_eq!(status.preemptions, 1);
        assert_eq!(status.attempt, 1);
        assert_eq!(rx.try_recv().unwrap().id, high.id);
    }

    #[test]
    fn test_full_queue_still_admits_other_tenant() {
        let mut a = TenantConfig::new("a", 1.0);
        a.max_concurrency = 1;
        let mut config = config(vec![a, TenantConfig::new("b", 1.0)], 4);
        config.scheduling.max_queue_depth = 1;
        let (s, _rx) = scheduler(&config);
        let now = Instant::now();
        assert_eq!(s.submit(request("a", 10), now).unwrap().decision, Decision::Admitted);
        assert_eq!(s.submit(request("a", 10), now).unwrap().decision, Decision::Queued);

        // Every budget b needs is free, so the backlog of a is irrelevant.
        assert_eq!(s.submit(request("b", 10), now).unwrap().decision, Decision::Admitted);
        let rejected = s.submit(request("a", 10), now).unwrap();
        assert_eq!(
            rejected.decision,
            Decision::Rejected {
                reason: RejectReason::QueueFull
            }
        );
        assert_eq!(s.snapshot().queued, 1);
        assert_eq!(
            s.status(rejected.id).unwrap().reject_reason,
            Some(RejectReason::QueueFull)
        );
    }

    #[test]
    fn test_own_concurrency_cap_never_preempts() {
        let mut gold = TenantConfig::new("gold", 4.0);
        gold.ttft_target_ms = Some(1);
        gold.max_concurrency = 1;
        let config = config(vec![gold, TenantConfig::new("bronze", 1.0)], 4);
        let (s, mut rx) = scheduler(&config);
        let now = Instant::now();
        s.submit(request("gold", 10), now).unwrap();
        let low = s.submit(request("bronze", 10), now).unwrap();
        let _gold = rx.try_recv().unwrap();
        let bronze = rx.try_recv().unwrap();

        let later = now + Duration::from_millis(5);
        let second = s.submit(request("gold", 10), later).unwrap();
        assert_eq!(second.decision, Decision::Queued);
        assert!(!bronze.cancel.is_cancelled());
        assert_eq!(s.status(low.id).unwrap().preemptions, 0);
    }

    #[test]
    fn test_no_preemption_when_victim_cannot_free_blocker() {
        let mut gold = TenantConfig::new("gold", 4.0);
        gold.ttft_target_ms = Some(1);
        let mut config = config(vec![gold, TenantConfig::new("bronze", 1.0)], 4);
        config.tiers.device_memory_budget = config.model.page_bytes();
        let (s, mut rx) = scheduler(&config);
        let now = Instant::now();
        let low = s.submit(request("bronze", 10), now).unwrap();
        let bronze = rx.try_recv().unwrap();
        assert_eq!(bronze.device_bytes, config.model.page_bytes());

        // Device bytes left with the dispatch; requeueing bronze frees none.
        let high = s
            .submit(request("gold", 10), now + Duration::from_millis(5))
            .unwrap();
        assert_eq!(high.decision, Decision::Queued);
        assert!(!bronze.cancel.is_cancelled());
        assert_eq!(s.status(low.id).unwrap().phase, Phase::Admitted);
    }

    #[test]
    fn test_no_preemption_of_equal_weight() {
        let mut a = TenantConfig::new("a", 1.0);
        a.ttft_target_ms = Some(1);
        let config = config(vec![a, TenantConfig::new("b", 1.0)], 1);
        let (s, _rx) = scheduler(&config);
        let now = Instant::now();
        s.submit(request("b", 10), now).unwrap();
        let sub = s.submit(request("a", 10), now + Duration::from_millis(5)).unwrap();
        assert_eq!(sub.decision, Decision::Queued);
    }

    #[test]
    fn test_rate_limited_reject() {
        let mut a = TenantConfig::new("a", 1.0);
        a.rate_limit = Some(RateLimitConfig {
            tokens_per_sec: 10.0,
            burst: 20.0,
            on_exhaustion: ExhaustionPolicy::Reject,
            deprioritize_multiplier: 2.0,
            penalty_window_ms: 1000,
            ..Default::default()
        });
        let config = config(vec![a], 4);
        let (s, _rx) = scheduler(&config);
        let now = Instant::now();
        assert_eq!(s.submit(request("a", 20), now).unwrap().decision, Decision::Admitted);
        assert_eq!(
            s.submit(request("a", 20), now).unwrap().decision,
            Decision::Rejected {
                reason: RejectReason::RateLimited
            }
        );
    }

    #[test]
    fn test_weighted_share_under_contention() {
        let config = config(
            vec![TenantConfig::new("a", 2.0), TenantConfig::new("b", 1.0)],
            1,
        );
        let (s, mut rx) = scheduler(&config);
        let now = Instant::now();
        for _ in 0..40 {
            s.submit(request("a", 64), now).unwrap();
            s.submit(request("b", 64), now).unwrap();
        }
        let mut served = HashMap::<String, usize>::new();
        for _ in 0..30 {
            let d = rx.try_recv().unwrap();
            *served.entry(d.tenant.to_string()).or_default() += 1;
            run_to_completion(&s, &d);
        }
        let a = served["a"] as f64;
        let b = served["b"] as f64;
        assert!((a / b - 2.0).abs() < 0.3, "a={a} b={b}");
    }
}
