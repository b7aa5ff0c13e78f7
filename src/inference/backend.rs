//! Execution backends: where prefill and decode actually run.
//!
//! The serving core treats model execution as opaque. [`SimulatedBackend`]
//! stands in for real workers: it sleeps for the time the configured token
//! rates imply and produces deterministic FP16 KV content derived from each
//! page's key, so identical prefixes always yield identical pages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use half::f16;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::page::KvPage;
use crate::cache::prefix::{PrefixPage, Token};
use crate::config::BackendConfig;
use crate::placement::worker::WorkerId;
use crate::scheduler::tenant::TenantId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("execution cancelled")]
    Cancelled,

    #[error("worker {worker} failed: {reason}")]
    WorkerFailed { worker: WorkerId, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeOutput {
    pub generated_tokens: usize,
    pub first_token_at: Instant,
    pub elapsed: Duration,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Compute KV pages for `pages`, a contiguous run of the prompt's pages.
    async fn prefill(
        &self,
        worker: &WorkerId,
        tenant: &TenantId,
        prompt: &[Token],
        pages: &[PrefixPage],
        cancel: &CancellationToken,
    ) -> Result<Vec<KvPage>, BackendError>;

    /// Generate up to `max_new_tokens` after a prompt whose KV is resident on `worker`.
    async fn decode(
        &self,
        worker: &WorkerId,
        prompt_tokens: usize,
        max_new_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<DecodeOutput, BackendError>;
}

#[derive(Debug)]
pub struct SimulatedBackend {
    config: BackendConfig,
    kv_bytes_per_token: u64,
    fail_prefill: AtomicBool,
}

impl SimulatedBackend {
    pub fn new(config: BackendConfig, kv_bytes_per_token: u64) -> Self {
        Self {
            config,
            kv_bytes_per_token,
            fail_prefill: AtomicBool::new(false),
        }
    }

    /// Make every subsequent prefill fail.
    pub fn set_fail_prefill(&self, fail: bool) {
        self.fail_prefill.store(fail, Ordering::Release);
    }

    fn compute_time(&self, tokens: usize, tokens_per_sec: f64) -> Duration {
        if self.config.time_scale <= 0.0 || tokens_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(tokens as f64 / tokens_per_sec * self.config.time_scale)
    }

    async fn spend(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
        }
    }

    /// Deterministic FP16 KV content for a page.
    pub fn page_content(&self, page: &PrefixPage) -> Bytes {
        let values = (self.kv_bytes_per_token as usize / 2) * page.token_count;
        let mut state = splitmix64(page.key.0);
        let mut out = Vec::with_capacity(values * 2);
        for _ in 0..values {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
            let v = f16::from_f32(unit * 2.0 - 1.0);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Bytes::from(out)
    }
}

/// Scrambles a key into a xorshift seed. Never returns zero.
fn splitmix64(key: u64) -> u64 {
    let mut z = key.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    if z == 0 {
        0x9E37_79B9_7F4A_7C15
    } else {
        z
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn prefill(
        &self,
        worker: &WorkerId,
        tenant: &TenantId,
        _prompt: &[Token],
        pages: &[PrefixPage],
        cancel: &CancellationToken,
    ) -> Result<Vec<KvPage>, BackendError> {
        let tokens: usize = pages.iter().map(|p| p.token_count).sum();
        self.spend(self.compute_time(tokens, self.config.prefill_tokens_per_sec), cancel)
            .await?;
        if self.fail_prefill.load(Ordering::Acquire) {
            return Err(BackendError::WorkerFailed {
                worker: worker.clone(),
                reason: "injected prefill failure".to_string(),
            });
        }
        Ok(pages
            .iter()
            .map(|p| {
                KvPage::new(
                    p.key,
                    tenant.clone(),
                    p.token_start,
                    p.token_count,
                    self.page_content(p),
                )
            })
            .collect())
    }

    async fn decode(
        &self,
        _worker: &WorkerId,
        _prompt_tokens: usize,
        max_new_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<DecodeOutput, BackendError> {
        let started = Instant::now();
        let rate = self.config.decode_tokens_per_sec;
        self.spend(self.compute_time(1, rate), cancel).await?;
        let first_token_at = Instant::now();
        self.spend(self.compute_time(max_new_tokens.saturating_sub(1), rate), cancel)
            .await?;
        Ok(DecodeOutput {
            generated_tokens: max_new_tokens,
            first_token_at,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::page::PageKey;

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(
            BackendConfig {
                time_scale: 0.0,
                ..Default::default()
            },
            64,
        )
    }

    fn page(key: u64, tokens: usize) -> PrefixPage {
        PrefixPage {
            key: PageKey(key),
            token_start: 0,
            token_count: tokens,
        }
    }

    #[test]
    fn test_page_content_is_deterministic() {
        let b = backend();
        let a1 = b.page_content(&page(42, 4));
        let a2 = b.page_content(&page(42, 4));
        let other = b.page_content(&page(43, 4));
        assert_eq!(a1, a2);
        assert_ne!(a1, other);
        assert_eq!(a1.len(), 64 * 4);
    }

    #[test]
    fn test_adjacent_keys_get_distinct_content() {
        let b = backend();
        for key in [0u64, 2, 42, 1 << 40] {
            assert_ne!(
                b.page_content(&page(key, 2)),
                b.page_content(&page(key + 1, 2)),
                "keys {key} and {}",
                key + 1
            );
        }
        assert_ne!(splitmix64(0), 0);
    }

    #[tokio::test]
    async fn test_prefill_produces_pages() {
        let b = backend();
        let pages = [page(1, 8), page(2, 3)];
        let out = b
            .prefill(
                &WorkerId::from("p0"),
                &TenantId::from("t"),
                &[0; 11],
                &pages,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].token_count, 3);
        assert_eq!(out[1].logical_size(), 3 * 64);
    }

    #[tokio::test]
    async fn test_cancelled_decode() {
        let b = backend();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = b
            .decode(&WorkerId::from("d0"), 10, 10, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Cancelled);
    }
}
