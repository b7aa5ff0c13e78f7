//! Serving engine: drives admitted sequences through the pipeline.
//!
//! The engine owns three background tasks:
//! 1. the dispatcher, which spawns one task per admitted sequence
//! 2. the admission ticker, which checks admission timeouts and re-runs admission
//! 3. the eviction loop, which ages the cache and prunes stale residency
//!
//! A sequence task verifies its cached prefix, prefills the remainder on its
//! prefill worker chunk by chunk, registers the new pages, moves everything its
//! decode worker lacks, passes its tenant's decode gate, and decodes. Progress
//! is reported through scheduler events; work belonging to a superseded
//! attempt is dropped. Pages registered before a cancellation stay cached, so
//! a preempted sequence resumes from where its prefill stopped.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetSnapshot, BudgetTracker, Resource};
use crate::cache::manager::{CacheError, CacheManager, TierStats};
use crate::cache::page::{PageKey, PageTable, Tier};
use crate::config::Config;
use crate::inference::backend::{BackendError, ExecutionBackend, SimulatedBackend};
use crate::metrics::Metrics;
use crate::placement::router::{PageLocator, Router};
use crate::placement::worker::{WorkerId, WorkerRegistry, WorkerSnapshot};
use crate::scheduler::admission::{QueueSnapshot, Scheduler, SchedulerError, Submission, Usage};
use crate::scheduler::ratelimit::{DecodeGates, GateError};
use crate::scheduler::sequence::{
    Dispatch, RejectReason, SequenceId, SequenceRequest, SequenceStatus,
};
use crate::transfer::engine::{TransferEngine, TransferRecord};
use crate::transfer::job::{Location, PageTransfer, Route, TransferJob, TransferOutcome};

/// Shared components the engine is assembled from.
pub struct EngineParts {
    pub metrics: Arc<Metrics>,
    pub budgets: Arc<BudgetTracker>,
    pub cache: Arc<CacheManager>,
    pub transfers: Arc<TransferEngine>,
    pub backend: Arc<dyn ExecutionBackend>,
}

pub struct ServingEngine {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    budgets: Arc<BudgetTracker>,
    cache: Arc<CacheManager>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    transfers: Arc<TransferEngine>,
    backend: Arc<dyn ExecutionBackend>,
    gates: DecodeGates,
    shutdown: CancellationToken,
}

/// Device-tier bytes handed over at admission. Whatever is left unused goes
/// back to the budget on drop.
struct DeviceGrant {
    budgets: Arc<BudgetTracker>,
    remaining: u64,
}

impl Drop for DeviceGrant {
    fn drop(&mut self) {
        if self.remaining == 0 {
            return;
        }
        if let Err(e) = self
            .budgets
            .release(&Resource::TierCapacity(Tier::DeviceMemory), self.remaining)
        {
            error!(bytes = self.remaining, error = %e, "Device grant release failed");
        }
    }
}

/// Page references held by a running sequence, released on drop.
struct PageRefs {
    cache: Arc<CacheManager>,
    keys: Vec<PageKey>,
}

impl PageRefs {
    fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            cache,
            keys: Vec::new(),
        }
    }

    fn push(&mut self, key: PageKey) {
        self.keys.push(key);
    }

    /// Keep the first `len` references, releasing the rest.
    fn truncate(&mut self, len: usize) {
        if len < self.keys.len() {
            self.cache.release(&self.keys[len..]);
            self.keys.truncate(len);
        }
    }
}

impl Drop for PageRefs {
    fn drop(&mut self) {
        self.cache.release(&self.keys);
    }
}

enum RunError {
    Cancelled,
    Stale(SchedulerError),
    Retryable(String),
    Fatal(String),
    Rejected(RejectReason, String),
}

impl From<SchedulerError> for RunError {
    fn from(e: SchedulerError) -> Self {
        RunError::Stale(e)
    }
}

impl From<BackendError> for RunError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Cancelled => RunError::Cancelled,
            e @ BackendError::WorkerFailed { .. } => RunError::Retryable(e.to_string()),
        }
    }
}

impl From<GateError> for RunError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Cancelled => RunError::Cancelled,
            e @ GateError::Exhausted(_) => RunError::Rejected(RejectReason::RateLimited, e.to_string()),
            e @ GateError::Closed(_) => RunError::Retryable(e.to_string()),
        }
    }
}

impl ServingEngine {
    /// Build every component from configuration and start the background tasks.
    pub async fn open(config: Config) -> anyhow::Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new()?);
        let budgets = Arc::new(BudgetTracker::from_config(&config));
        let cache = Arc::new(CacheManager::open(&config, budgets.clone(), metrics.clone()).await?);
        let transfers = Arc::new(TransferEngine::new(&config.transfer, metrics.clone()));
        let backend = Arc::new(SimulatedBackend::new(
            config.backend.clone(),
            config.model.kv_bytes_per_token(),
        ));
        Ok(Self::start(
            config,
            EngineParts {
                metrics,
                budgets,
                cache,
                transfers,
                backend,
            },
        ))
    }

    /// Assemble the engine from prepared parts and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config, parts: EngineParts) -> Arc<Self> {
        let registry = Arc::new(WorkerRegistry::from_config(&config.workers));
        let router = Arc::new(Router::new(
            registry.clone(),
            parts.cache.clone() as Arc<dyn PageLocator>,
            config.placement.clone(),
            config.model.page_bytes(),
        ));
        let (scheduler, dispatch_rx) =
            Scheduler::new(&config, parts.budgets.clone(), router, parts.metrics.clone());

        let gates = DecodeGates::from_config(&config.tenants);
        let engine = Arc::new(Self {
            config: Arc::new(config),
            metrics: parts.metrics,
            budgets: parts.budgets,
            cache: parts.cache,
            registry,
            scheduler: Arc::new(scheduler),
            transfers: parts.transfers,
            backend: parts.backend,
            gates,
            shutdown: CancellationToken::new(),
        });
        engine.spawn_dispatcher(dispatch_rx);
        engine.spawn_admission_ticker();
        engine.spawn_eviction_loop();
        info!(
            tenants = engine.config.tenants.len(),
            workers = engine.config.workers.len(),
            "Serving engine started"
        );
        engine
    }

    pub fn submit(&self, request: SequenceRequest) -> Result<Submission, SchedulerError> {
        self.scheduler.submit(request, Instant::now())
    }

    pub fn cancel(&self, id: SequenceId) -> Result<(), SchedulerError> {
        self.scheduler.cancel(id)
    }

    pub fn status(&self, id: SequenceId) -> Option<SequenceStatus> {
        self.scheduler.status(id)
    }

    pub fn queue(&self) -> QueueSnapshot {
        self.scheduler.snapshot()
    }

    pub fn cache_stats(&self) -> Vec<TierStats> {
        self.cache.tier_stats()
    }

    pub fn budget_snapshot(&self) -> Vec<BudgetSnapshot> {
        self.budgets.snapshot()
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.registry.snapshot()
    }

    pub fn transfer_history(&self) -> Vec<TransferRecord> {
        self.transfers.history()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop the background tasks. Running sequences finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(dispatch) => {
                            let worker = engine.clone();
                            tokio::spawn(async move { worker.run_sequence(dispatch).await });
                        }
                        None => break,
                    },
                }
            }
            debug!("Dispatcher stopped");
        });
    }

    fn spawn_admission_ticker(self: &Arc<Self>) {
        let engine = self.clone();
        let period = self.config.scheduling.tick();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let expired = engine.scheduler.check_timeouts(Instant::now());
                        if expired > 0 {
                            debug!(expired, "Admission timeouts handled");
                        }
                    }
                }
            }
            debug!("Admission ticker stopped");
        });
    }

    fn spawn_eviction_loop(self: &Arc<Self>) {
        let engine = self.clone();
        let period = self.config.eviction.cycle_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = tick.tick() => engine.maintenance().await,
                }
            }
            debug!("Eviction loop stopped");
        });
    }

    /// One eviction cycle plus the bookkeeping that follows it.
    pub async fn maintenance(&self) {
        let report = self.cache.evict_cycle().await;
        let pruned = self.registry.prune_stale(self.cache.as_ref());
        for snapshot in self.budgets.snapshot() {
            self.metrics
                .budget_utilization
                .with_label_values(&[snapshot.resource.as_str()])
                .set(snapshot.utilization);
        }
        if report.demoted + report.dropped + report.anomalies + pruned > 0 {
            info!(
                demoted = report.demoted,
                dropped = report.dropped,
                anomalies = report.anomalies,
                floor_protected = report.floor_protected,
                pruned_residency = pruned,
                "Eviction cycle"
            );
        }
    }

    async fn run_sequence(self: Arc<Self>, dispatch: Dispatch) {
        let id = dispatch.id;
        let attempt = dispatch.attempt;
        let outcome = match self.execute(&dispatch).await {
            Ok(usage) => self.scheduler.complete(id, attempt, usage),
            Err(RunError::Cancelled) => {
                debug!(sequence = %id, attempt, "Sequence work cancelled");
                Ok(())
            }
            Err(RunError::Stale(e)) => Err(e),
            Err(RunError::Retryable(reason)) => self.scheduler.fail(id, attempt, &reason, true),
            Err(RunError::Fatal(reason)) => self.scheduler.fail(id, attempt, &reason, false),
            Err(RunError::Rejected(reason, detail)) => {
                self.metrics
                    .rate_limit_events
                    .with_label_values(&[dispatch.tenant.as_str(), "reject"])
                    .inc();
                self.scheduler.reject(id, attempt, reason, &detail)
            }
        };
        if let Err(e) = outcome {
            debug!(sequence = %id, attempt, error = %e, "Dropping superseded work");
        }
    }

    async fn execute(&self, d: &Dispatch) -> Result<Usage, RunError> {
        let grant = DeviceGrant {
            budgets: self.budgets.clone(),
            remaining: d.device_bytes,
        };
        self.scheduler.on_prefill_started(d.id, d.attempt)?;

        let keys: Vec<PageKey> = d.pages.iter().map(|p| p.key).collect();
        let mut table = PageTable::new(self.config.model.page_tokens);
        let mut refs = PageRefs::new(self.cache.clone());

        // Cached prefix: hold references, then make sure every page reads back clean.
        let held = self.cache.acquire(&keys[..d.cached_pages.min(keys.len())]);
        for key in &keys[..held] {
            refs.push(*key);
        }
        let mut valid = 0;
        for key in &keys[..held] {
            match self.cache.get(*key).await {
                Ok(_) => valid += 1,
                Err(e) => {
                    warn!(sequence = %d.id, key = %key, error = %e, "Cached page unusable, recomputing");
                    break;
                }
            }
        }
        refs.truncate(valid);
        for page in &d.pages[..valid] {
            table.push(page.key, page.token_count);
        }

        if valid < d.pages.len() {
            let mut grant = grant;
            let chunk_pages = (self.config.scheduling.prefill_chunk_tokens
                / self.config.model.page_tokens.max(1))
            .max(1);
            for (n, chunk) in d.pages[valid..].chunks(chunk_pages).enumerate() {
                // Preemption and cancellation both trip the token.
                if d.cancel.is_cancelled() {
                    debug!(sequence = %d.id, chunks_done = n, "Prefill stopped between chunks");
                    return Err(RunError::Cancelled);
                }
                let computed = self
                    .backend
                    .prefill(&d.prefill_worker, &d.tenant, &d.prompt, chunk, &d.cancel)
                    .await?;
                for page in computed {
                    let key = page.key;
                    let tokens = page.token_count;
                    match self.cache.put_reserved(page, &mut grant.remaining).await {
                        Ok(outcome) => {
                            debug!(sequence = %d.id, key = %key, tier = %outcome.tier(), "Registered page");
                            refs.push(key);
                            table.push(key, tokens);
                        }
                        Err(e @ CacheError::ContentMismatch(_)) => return Err(RunError::Fatal(e.to_string())),
                        Err(e) => return Err(RunError::Retryable(format!("registering page {key}: {e}"))),
                    }
                }
            }
        } else {
            drop(grant);
        }

        self.scheduler.on_pages_ready(d.id, d.attempt)?;
        self.move_to_decode(d, valid).await?;
        self.scheduler.on_transfer_complete(d.id, d.attempt)?;

        let permit = self.gates.acquire(&d.tenant, &d.cancel).await?;
        if permit.retries > 0 {
            self.metrics
                .rate_limit_events
                .with_label_values(&[d.tenant.as_str(), "retry"])
                .inc_by(u64::from(permit.retries));
        }
        let output = self
            .backend
            .decode(&d.decode_worker, d.prompt.len(), d.max_new_tokens, &d.cancel)
            .await?;
        let secs = output.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.metrics
                .decode_tokens_per_sec
                .observe(output.generated_tokens as f64 / secs);
        }
        drop(permit);
        debug!(
            sequence = %d.id,
            pages = table.len(),
            tokens = table.total_tokens(),
            generated = output.generated_tokens,
            "Decode finished"
        );
        Ok(Usage {
            generated_tokens: output.generated_tokens,
            first_token_at: output.first_token_at,
        })
    }

    fn host_of(&self, worker: &WorkerId) -> String {
        self.registry
            .get(worker)
            .map(|w| w.host.clone())
            .unwrap_or_default()
    }

    /// Move every page the decode worker lacks, grouped by where it comes from.
    ///
    /// Pages from `fresh_from` on were just computed on the prefill worker.
    async fn move_to_decode(&self, d: &Dispatch, fresh_from: usize) -> Result<(), RunError> {
        let decode_host = self.host_of(&d.decode_worker);
        let destination = Location::device(d.decode_worker.clone(), decode_host.clone());
        let default_bytes = self.config.model.page_bytes();

        let mut groups: Vec<(Location, Vec<PageTransfer>)> = Vec::new();
        for (i, page) in d.pages.iter().enumerate() {
            let holder = self
                .registry
                .resident_on(page.key)
                .filter(|_| self.cache.on_device(page.key));
            if holder.as_ref() == Some(&d.decode_worker) {
                continue;
            }
            let source = if i >= fresh_from {
                Location::device(d.prefill_worker.clone(), self.host_of(&d.prefill_worker))
            } else if let Some(worker) = holder {
                let host = self.host_of(&worker);
                Location::device(worker, host)
            } else {
                Location::storage(decode_host.clone())
            };
            let transfer = PageTransfer {
                key: page.key,
                bytes: self.cache.page_size(page.key).unwrap_or(default_bytes),
            };
            match groups.iter_mut().find(|(loc, _)| *loc == source) {
                Some((_, pages)) => pages.push(transfer),
                None => groups.push((source, vec![transfer])),
            }
        }

        // Groups come from distinct sources and move concurrently.
        let jobs = groups.into_iter().map(|(source, pages)| {
            let mut job = TransferJob::new(
                Route::new(source, destination.clone()),
                pages,
                d.cancel.child_token(),
            )
            .for_sequence(d.id);
            async move {
                let outcome = self.transfers.transfer(&mut job).await;
                (job, outcome)
            }
        });
        let mut result = Ok(());
        for (job, outcome) in join_all(jobs).await {
            match outcome {
                TransferOutcome::Succeeded { .. } => {
                    let committed: Vec<(PageKey, u64)> =
                        job.pages.iter().map(|p| (p.key, p.bytes)).collect();
                    self.registry.commit_residency(&d.decode_worker, &committed);
                }
                TransferOutcome::Cancelled => result = Err(RunError::Cancelled),
                TransferOutcome::Failed { reason } => {
                    if result.is_ok() {
                        result = Err(RunError::Retryable(reason));
                    }
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for ServingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingEngine")
            .field("scheduler", &self.scheduler)
            .field("cache", &self.cache)
            .field("transfers", &self.transfers)
            .finish_non_exhaustive()
    }
}
