//! Per-tenant token buckets and decode gates.
//!
//! The bucket is assessed twice. At submit, a dry bucket either rejects the
//! sequence or opens a deprioritization window for the tenant. At admission,
//! the sequence's prompt tokens are charged; under the `queue` policy a
//! sequence is not admissible until the bucket covers it.
//!
//! Decode concurrency is enforced separately, at execution, by
//! [`DecodeGates`]. The tenant's exhaustion policy decides what a sequence
//! does when every decode permit is taken: `queue` waits, `deprioritize`
//! retries after a pause, `reject` fails the sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::config::{ExhaustionPolicy, RateLimitConfig, TenantConfig};
use crate::scheduler::tenant::TenantId;

/// Refilling token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Starts full. A zero burst defaults to twice the rate.
    pub fn new(rate: f64, burst: f64, now: Instant) -> Self {
        let burst = if burst > 0.0 { burst } else { rate * 2.0 };
        Self {
            rate,
            burst,
            tokens: burst,
            last: now,
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        if dt > 0.0 {
            self.tokens = (self.tokens + self.rate * dt).min(self.burst);
            self.last = now;
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Tokens missing to cover `amount`. An amount above the burst needs a full bucket.
    pub fn deficit(&self, amount: f64) -> f64 {
        (amount.min(self.burst) - self.tokens).max(0.0)
    }

    /// Take `amount` if covered.
    pub fn try_take(&mut self, amount: f64) -> bool {
        if self.deficit(amount) > 0.0 {
            return false;
        }
        self.tokens = (self.tokens - amount).max(0.0);
        true
    }

    /// Take `amount` unconditionally, flooring at zero.
    pub fn charge(&mut self, amount: f64) {
        self.tokens = (self.tokens - amount).max(0.0);
    }
}

/// Verdict at submit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubmitVerdict {
    Allow,
    /// Accepted, but the tenant's SRPT keys are multiplied until the window closes.
    Deprioritize { until: Instant },
    Reject,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: TokenBucket,
    policy: ExhaustionPolicy,
    multiplier: f64,
    window: Duration,
    penalty_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(config.tokens_per_sec, config.burst, now),
            policy: config.on_exhaustion,
            multiplier: config.deprioritize_multiplier.max(1.0),
            window: Duration::from_millis(config.penalty_window_ms),
            penalty_until: None,
        }
    }

    pub fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    /// Assess a new sequence of `tokens` prompt tokens.
    pub fn on_submit(&mut self, tokens: u64, now: Instant) -> SubmitVerdict {
        self.bucket.refill(now);
        if self.bucket.deficit(tokens as f64) <= 0.0 {
            return SubmitVerdict::Allow;
        }
        match self.policy {
            ExhaustionPolicy::Reject => SubmitVerdict::Reject,
            ExhaustionPolicy::Queue => SubmitVerdict::Allow,
            ExhaustionPolicy::Deprioritize => {
                let until = now + self.window;
                self.penalty_until = Some(until);
                SubmitVerdict::Deprioritize { until }
            }
        }
    }

    /// Whether a sequence of `tokens` may be admitted now. Charges the bucket when it may.
    pub fn try_admit(&mut self, tokens: u64, now: Instant) -> bool {
        self.bucket.refill(now);
        match self.policy {
            ExhaustionPolicy::Queue => self.bucket.try_take(tokens as f64),
            ExhaustionPolicy::Deprioritize | ExhaustionPolicy::Reject => {
                self.bucket.charge(tokens as f64);
                true
            }
        }
    }

    /// SRPT key multiplier in effect at `now`.
    pub fn penalty(&self, now: Instant) -> f64 {
        match self.penalty_until {
            Some(until) if now < until => self.multiplier,
            _ => 1.0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("tenant {0} is at its decode concurrency limit")]
    Exhausted(TenantId),

    #[error("cancelled while waiting for a decode permit")]
    Cancelled,

    #[error("decode gate for tenant {0} is closed")]
    Closed(TenantId),
}

/// A held decode permit. Dropping it frees the slot.
#[derive(Debug, Default)]
pub struct DecodePermit {
    _permit: Option<OwnedSemaphorePermit>,
    /// Times the holder found the gate full and tried again.
    pub retries: u32,
}

#[derive(Debug)]
struct Gate {
    permits: Arc<Semaphore>,
    policy: ExhaustionPolicy,
    retry: Duration,
}

/// Decode concurrency per rate-limited tenant.
#[derive(Debug, Default)]
pub struct DecodeGates {
    gates: HashMap<TenantId, Gate>,
}

impl DecodeGates {
    pub fn from_config(tenants: &[TenantConfig]) -> Self {
        let gates = tenants
            .iter()
            .filter_map(|t| {
                let rl = t.rate_limit.as_ref().filter(|rl| rl.decode_concurrency > 0)?;
                let gate = Gate {
                    permits: Arc::new(Semaphore::new(rl.decode_concurrency)),
                    policy: rl.on_exhaustion,
                    retry: rl.decode_retry(),
                };
                Some((TenantId::from(t.id.as_str()), gate))
            })
            .collect();
        Self { gates }
    }

    /// Free permits for `tenant`, or `None` when it is not gated.
    pub fn available(&self, tenant: &TenantId) -> Option<usize> {
        self.gates.get(tenant).map(|g| g.permits.available_permits())
    }

    /// Take a decode permit for `tenant` according to its exhaustion policy.
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> Result<DecodePermit, GateError> {
        let Some(gate) = self.gates.get(tenant) else {
            return Ok(DecodePermit::default());
        };
        let closed = || GateError::Closed(tenant.clone());
        match gate.policy {
            ExhaustionPolicy::Queue => tokio::select! {
                permit = gate.permits.clone().acquire_owned() => Ok(DecodePermit {
                    _permit: Some(permit.map_err(|_| closed())?),
                    retries: 0,
                }),
                _ = cancel.cancelled() => Err(GateError::Cancelled),
            },
            ExhaustionPolicy::Reject => match gate.permits.clone().try_acquire_owned() {
                Ok(permit) => Ok(DecodePermit {
                    _permit: Some(permit),
                    retries: 0,
                }),
                Err(TryAcquireError::NoPermits) => Err(GateError::Exhausted(tenant.clone())),
                Err(TryAcquireError::Closed) => Err(closed()),
            },
            ExhaustionPolicy::Deprioritize => {
                let mut retries = 0;
                loop {
                    match gate.permits.clone().try_acquire_owned() {
                        Ok(permit) => {
                            return Ok(DecodePermit {
                                _permit: Some(permit),
                                retries,
                            })
                        }
                        Err(TryAcquireError::Closed) => return Err(closed()),
                        Err(TryAcquireError::NoPermits) => retries += 1,
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(gate.retry) => {}
                        _ = cancel.cancelled() => return Err(GateError::Cancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(policy: ExhaustionPolicy, now: Instant) -> RateLimiter {
        RateLimiter::new(
            &RateLimitConfig {
                tokens_per_sec: 100.0,
                burst: 200.0,
                on_exhaustion: policy,
                deprioritize_multiplier: 2.0,
                penalty_window_ms: 1000,
                ..Default::default()
            },
            now,
        )
    }

    #[test]
    fn test_bucket_refills_to_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 0.0, now);
        assert_eq!(bucket.available(), 200.0);
        assert!(bucket.try_take(150.0));
        assert!(!bucket.try_take(100.0));
        bucket.refill(now + Duration::from_secs(10));
        assert_eq!(bucket.available(), 200.0);
    }

    #[test]
    fn test_reject_policy() {
        let now = Instant::now();
        let mut rl = limiter(ExhaustionPolicy::Reject, now);
        assert_eq!(rl.on_submit(150, now), SubmitVerdict::Allow);
        assert!(rl.try_admit(150, now));
        assert_eq!(rl.on_submit(150, now), SubmitVerdict::Reject);
    }

    #[test]
    fn test_deprioritize_opens_window() {
        let now = Instant::now();
        let mut rl = limiter(ExhaustionPolicy::Deprioritize, now);
        assert!(rl.try_admit(200, now));
        assert!(matches!(
            rl.on_submit(50, now),
            SubmitVerdict::Deprioritize { .. }
        ));
        assert_eq!(rl.penalty(now), 2.0);
        assert_eq!(rl.penalty(now + Duration::from_secs(2)), 1.0);
    }

    #[test]
    fn test_queue_policy_waits_for_refill() {
        let now = Instant::now();
        let mut rl = limiter(ExhaustionPolicy::Queue, now);
        assert!(rl.try_admit(200, now));
        assert_eq!(rl.on_submit(100, now), SubmitVerdict::Allow);
        assert!(!rl.try_admit(100, now));
        assert!(rl.try_admit(100, now + Duration::from_secs(1)));
    }

    fn gated(policy: ExhaustionPolicy) -> DecodeGates {
        let mut tenant = TenantConfig::new("t", 1.0);
        tenant.rate_limit = Some(RateLimitConfig {
            on_exhaustion: policy,
            decode_concurrency: 1,
            decode_retry_ms: 5,
            ..Default::default()
        });
        DecodeGates::from_config(&[tenant, TenantConfig::new("free", 1.0)])
    }

    #[tokio::test]
    async fn test_ungated_tenant_always_passes() {
        let gates = gated(ExhaustionPolicy::Reject);
        let free = TenantId::from("free");
        assert_eq!(gates.available(&free), None);
        let _a = gates.acquire(&free, &CancellationToken::new()).await.unwrap();
        let _b = gates.acquire(&free, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_gate_refuses_when_full() {
        let gates = gated(ExhaustionPolicy::Reject);
        let t = TenantId::from("t");
        let held = gates.acquire(&t, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            gates.acquire(&t, &CancellationToken::new()).await.unwrap_err(),
            GateError::Exhausted(t.clone())
        );
        drop(held);
        assert_eq!(gates.available(&t), Some(1));
        assert!(gates.acquire(&t, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_deprioritize_gate_retries_until_free() {
        let gates = Arc::new(gated(ExhaustionPolicy::Deprioritize));
        let t = TenantId::from("t");
        let held = gates.acquire(&t, &CancellationToken::new()).await.unwrap();

        let waiter = {
            let gates = gates.clone();
            let t = t.clone();
            tokio::spawn(async move { gates.acquire(&t, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let permit = waiter.await.unwrap().unwrap();
        assert!(permit.retries >= 1);
    }

    #[tokio::test]
    async fn test_queue_gate_waits_and_honours_cancel() {
        let gates = gated(ExhaustionPolicy::Queue);
        let t = TenantId::from("t");
        let _held = gates.acquire(&t, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        assert_eq!(
            gates.acquire(&t, &cancel).await.unwrap_err(),
            GateError::Cancelled
        );
    }
}
