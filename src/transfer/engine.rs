//! Transfer engine: ordered transport fallback.
//!
//! A job walks the transport list in order. Transports that cannot carry the
//! route are skipped; a failed or timed-out attempt falls through to the
//! next. The first success is recorded (history, per-transport stats,
//! metrics) and ends the job. Callers commit destination residency only after
//! a success, so a failed job never leaves torn pages behind.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::metrics::Metrics;
use crate::transfer::job::{JobState, TransferJob, TransferOutcome};
use crate::transfer::transport::{SimulatedTransport, Transport};

/// One successful transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub job: Uuid,
    pub transport: &'static str,
    pub route: String,
    pub pages: usize,
    pub bytes: u64,
    pub latency_us: u64,
    pub bytes_per_sec: f64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// Attempts abandoned because the job was cancelled.
    pub cancelled: u64,
    pub bytes: u64,
    pub busy_us: u64,
}

impl TransportStats {
    pub fn mean_bytes_per_sec(&self) -> f64 {
        if self.busy_us == 0 {
            return 0.0;
        }
        self.bytes as f64 / (self.busy_us as f64 / 1_000_000.0)
    }
}

pub struct TransferEngine {
    transports: Vec<Arc<dyn Transport>>,
    attempt_timeout: Duration,
    permits: Semaphore,
    history: Mutex<VecDeque<TransferRecord>>,
    history_len: usize,
    stats: Mutex<HashMap<&'static str, TransportStats>>,
    metrics: Arc<Metrics>,
}

impl TransferEngine {
    /// Simulated transports in configured order.
    pub fn new(config: &TransferConfig, metrics: Arc<Metrics>) -> Self {
        let transports = SimulatedTransport::from_config(config)
            .into_iter()
            .map(|t| Arc::new(t) as Arc<dyn Transport>)
            .collect();
        Self::with_transports(config, transports, metrics)
    }

    pub fn with_transports(
        config: &TransferConfig,
        transports: Vec<Arc<dyn Transport>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        info!(
            order = ?transports.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "Transfer engine ready"
        );
        Self {
            transports,
            attempt_timeout: config.attempt_timeout(),
            permits: Semaphore::new(config.max_concurrent.max(1)),
            history: Mutex::new(VecDeque::new()),
            history_len: config.history_len,
            stats: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn transport_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// Run a job to a terminal state.
    pub async fn transfer(&self, job: &mut TransferJob) -> TransferOutcome {
        let _permit = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return self.fail(job, "transfer engine closed".to_string()),
            },
            _ = job.cancel.cancelled() => return self.cancelled(job),
        };
        if job.pages.is_empty() {
            job.state = JobState::Succeeded;
            return TransferOutcome::Succeeded {
                transport: "none",
                bytes: 0,
                latency: Duration::ZERO,
            };
        }

        job.state = JobState::InFlight;
        let bytes = job.total_bytes();
        let mut last_error: Option<String> = None;
        for transport in &self.transports {
            if !transport.is_usable(&job.route) {
                debug!(transport = transport.name(), route = %job.route, "Transport cannot carry route");
                continue;
            }
            job.attempts += 1;
            let name = transport.name();
            let child = job.cancel.child_token();
            let started = Instant::now();

            let result = {
                let send = tokio::time::timeout(
                    self.attempt_timeout,
                    transport.send(&job.route, &job.pages, &child),
                );
                tokio::pin!(send);
                tokio::select! {
                    result = &mut send => Some(result),
                    _ = job.cancel.cancelled() => {
                        if transport.supports_abort() {
                            child.cancel();
                        }
                        // Let the attempt wind down; whatever it returns is discarded.
                        let _ = (&mut send).await;
                        None
                    }
                }
            };
            let Some(result) = result else {
                self.record_attempt(name, |s| s.cancelled += 1);
                self.metrics.transfers.with_label_values(&[name, "cancelled"]).inc();
                return self.cancelled(job);
            };

            let elapsed = started.elapsed();
            match result {
                Ok(Ok(moved)) => {
                    self.record_success(job, name, moved, elapsed);
                    return TransferOutcome::Succeeded {
                        transport: name,
                        bytes: moved,
                        latency: elapsed,
                    };
                }
                Ok(Err(e)) => {
                    warn!(job = %job.id, transport = name, error = %e, "Transport attempt failed, falling back");
                    self.record_attempt(name, |s| s.failures += 1);
                    self.metrics.transfers.with_label_values(&[name, "failed"]).inc();
                    last_error = Some(format!("{name}: {e}"));
                }
                Err(_) => {
                    warn!(
                        job = %job.id,
                        transport = name,
                        timeout_ms = self.attempt_timeout.as_millis() as u64,
                        "Transport attempt timed out, falling back"
                    );
                    self.record_attempt(name, |s| s.timeouts += 1);
                    self.metrics.transfers.with_label_values(&[name, "timeout"]).inc();
                    last_error = Some(format!("{name}: timed out"));
                }
            }
        }

        let reason = match last_error {
            Some(e) => format!("all transports failed for {bytes} bytes, last {e}"),
            None => format!("no transport can carry {}", job.route),
        };
        self.fail(job, reason)
    }

    fn record_attempt(&self, name: &'static str, update: impl FnOnce(&mut TransportStats)) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(name).or_default();
        entry.attempts += 1;
        update(entry);
    }

    fn record_success(&self, job: &mut TransferJob, name: &'static str, bytes: u64, elapsed: Duration) {
        job.state = JobState::Succeeded;
        job.transport = Some(name);
        let latency_us = elapsed.as_micros() as u64;
        self.record_attempt(name, |s| {
            s.successes += 1;
            s.bytes += bytes;
            s.busy_us += latency_us;
        });
        self.metrics.transfers.with_label_values(&[name, "succeeded"]).inc();
        self.metrics
            .transfer_latency
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());

        let secs = elapsed.as_secs_f64();
        let record = TransferRecord {
            job: job.id,
            transport: name,
            route: job.route.to_string(),
            pages: job.pages.len(),
            bytes,
            latency_us,
            bytes_per_sec: if secs > 0.0 { bytes as f64 / secs } else { 0.0 },
            attempts: job.attempts,
        };
        debug!(
            job = %job.id,
            transport = name,
            bytes,
            latency_us,
            attempts = job.attempts,
            "Transfer succeeded"
        );
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.history_len {
            history.pop_front();
        }
    }

    fn fail(&self, job: &mut TransferJob, reason: String) -> TransferOutcome {
        warn!(job = %job.id, route = %job.route, reason = %reason, "Transfer failed");
        job.state = JobState::Failed;
        TransferOutcome::Failed { reason }
    }

    fn cancelled(&self, job: &mut TransferJob) -> TransferOutcome {
        debug!(job = %job.id, "Transfer cancelled");
        job.state = JobState::Cancelled;
        TransferOutcome::Cancelled
    }

    /// Most recent successful transfers, oldest first.
    pub fn history(&self) -> Vec<TransferRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> HashMap<&'static str, TransportStats> {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("transports", &self.transport_names())
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}
