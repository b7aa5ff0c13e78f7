//! Runtime configuration for llmserve.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every knob the serving core consumes (tenants, budget ceilings, tier
//! capacities, eviction timing, transport order, worker pool) lives here.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::page::Tier;
use crate::placement::worker::Role;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llmserve", about = "Disaggregated prefill/decode serving core")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("tenant '{0}' is declared more than once")]
    DuplicateTenant(String),

    #[error("tenant '{tenant}' has non-positive weight {weight}")]
    InvalidWeight { tenant: String, weight: f64 },

    #[error("worker '{0}' is declared more than once")]
    DuplicateWorker(String),

    #[error("no {0} workers configured")]
    MissingRole(Role),

    #[error("unknown transport '{0}' in transfer.engine_order")]
    UnknownTransport(String),

    #[error("transfer.engine_order is empty")]
    EmptyTransportChain,

    #[error("watermarks must satisfy 0 < low ({low}) < high ({high}) <= 1")]
    InvalidWatermarks { low: f64, high: f64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub tenants: Vec<TenantConfig>,
    pub budgets: BudgetConfig,
    pub scheduling: SchedulingConfig,
    pub tiers: TierConfig,
    pub eviction: EvictionConfig,
    pub compression: CompressionConfig,
    pub transfer: TransferConfig,
    pub placement: PlacementConfig,
    pub workers: Vec<WorkerConfig>,
    pub backend: BackendConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Model geometry, used only to size KV pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Tokens covered by one KV page.
    pub page_tokens: usize,

    /// Number of transformer layers.
    pub n_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Share prefix pages between tenants. When false, keys are salted per tenant.
    pub share_prefix_across_tenants: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            page_tokens: 64,
            n_layers: 4,
            n_kv_heads: 4,
            head_dim: 64,
            share_prefix_across_tenants: false,
        }
    }
}

impl ModelConfig {
    /// KV bytes for one token at FP16, K and V across all layers.
    pub fn kv_bytes_per_token(&self) -> u64 {
        (self.n_layers * self.n_kv_heads * self.head_dim * 2 * 2) as u64
    }

    /// KV bytes for a full page at FP16.
    pub fn page_bytes(&self) -> u64 {
        self.kv_bytes_per_token() * self.page_tokens as u64
    }
}

/// What the rate limiter does when a tenant's bucket runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Admit, but push the request back in its tenant queue for a penalty window.
    Deprioritize,
    /// Hold in queue until the bucket refills.
    Queue,
    /// Reject at submit.
    Reject,
}

/// Token bucket for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_sec: f64,

    /// Bucket size; 0 means twice the refill rate.
    pub burst: f64,

    pub on_exhaustion: ExhaustionPolicy,

    /// SRPT key multiplier applied while deprioritized.
    pub deprioritize_multiplier: f64,

    pub penalty_window_ms: u64,

    /// Sequences of this tenant decoding at once; 0 is unlimited.
    pub decode_concurrency: usize,

    /// Pause between decode-slot retries under the deprioritize policy.
    pub decode_retry_ms: u64,
}

impl RateLimitConfig {
    pub fn decode_retry(&self) -> Duration {
        Duration::from_millis(self.decode_retry_ms.max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_sec: 0.0,
            burst: 0.0,
            on_exhaustion: ExhaustionPolicy::Deprioritize,
            deprioritize_multiplier: 1.25,
            penalty_window_ms: 2000,
            decode_concurrency: 0,
            decode_retry_ms: 10,
        }
    }
}

/// A tenant as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub id: String,

    /// Fair-share weight.
    pub weight: f64,

    /// Time-to-first-token ceiling. Tenants with a target may trigger preemption.
    pub ttft_target_ms: Option<u64>,

    /// Bytes per tier that eviction never takes this tenant below.
    pub hot_set_bytes: u64,

    /// Maximum concurrently running sequences.
    pub max_concurrency: u64,

    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            weight: 1.0,
            ttft_target_ms: None,
            hot_set_bytes: 0,
            max_concurrency: 64,
            rate_limit: None,
        }
    }
}

impl TenantConfig {
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            weight,
            ..Default::default()
        }
    }

    pub fn ttft_target(&self) -> Option<Duration> {
        self.ttft_target_ms.map(Duration::from_millis)
    }
}

/// Global budget ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Prompt plus generation tokens across all running sequences.
    pub max_tokens_in_flight: u64,

    pub max_prefill_concurrency: u64,

    pub max_decode_concurrency: u64,

    /// Projected KV transfer rate across all running sequences.
    pub max_transfer_bytes_per_sec: u64,

    /// Window over which a sequence's KV bytes are expected to move.
    pub transfer_window_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_in_flight: 250_000,
            max_prefill_concurrency: 6,
            max_decode_concurrency: 12,
            max_transfer_bytes_per_sec: 7_500_000_000,
            transfer_window_ms: 1000,
        }
    }
}

impl BudgetConfig {
    pub fn transfer_window(&self) -> Duration {
        Duration::from_millis(self.transfer_window_ms.max(1))
    }
}

/// Admission scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Prefill chunk size; SRPT cost is counted in chunks.
    pub prefill_chunk_tokens: usize,

    /// After this long in queue a request outranks every non-aged request.
    pub aging_bound_ms: u64,

    /// A submission that would have to wait behind this many queued sequences is rejected.
    pub max_queue_depth: usize,

    /// An admitted sequence must start prefill within this bound.
    pub admission_timeout_ms: u64,

    /// Admission attempts before a timed-out sequence is rejected.
    pub max_attempts: u32,

    pub preemption: bool,

    /// A sequence is never preempted more often than this.
    pub max_preemptions: u32,

    /// Used to estimate time-to-first-token for SLO checks.
    pub prefill_tokens_per_sec_estimate: f64,

    /// Admission ticker period.
    pub tick_ms: u64,

    /// Terminal sequences kept for status queries.
    pub retain_finished: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            prefill_chunk_tokens: 512,
            aging_bound_ms: 2000,
            max_queue_depth: 2000,
            admission_timeout_ms: 5000,
            max_attempts: 3,
            preemption: true,
            max_preemptions: 2,
            prefill_tokens_per_sec_estimate: 20_000.0,
            tick_ms: 10,
            retain_finished: 1024,
        }
    }
}

impl SchedulingConfig {
    pub fn aging_bound(&self) -> Duration {
        Duration::from_millis(self.aging_bound_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Tier capacity and path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Device (accelerator) memory budget for KV pages in bytes.
    pub device_memory_budget: u64,

    /// Host RAM budget for KV pages in bytes.
    pub host_memory_budget: u64,

    /// Path for local fast storage.
    pub local_storage_path: PathBuf,

    /// Maximum bytes on local storage (0 disables the tier).
    pub local_storage_budget: u64,

    /// Path for the remote object tier (optional).
    pub remote_object_path: Option<PathBuf>,

    /// Maximum bytes on the remote object tier.
    pub remote_object_budget: u64,

    /// High watermark: pressure eviction starts above this fraction.
    pub high_watermark: f64,

    /// Low watermark: pressure eviction stops below this fraction.
    pub low_watermark: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            device_memory_budget: 2 * 1024 * 1024 * 1024,
            host_memory_budget: 8 * 1024 * 1024 * 1024,
            local_storage_path: PathBuf::from("/tmp/llmserve-kv"),
            local_storage_budget: 20 * 1024 * 1024 * 1024,
            remote_object_path: None,
            remote_object_budget: 0,
            high_watermark: 0.85,
            low_watermark: 0.70,
        }
    }
}

impl TierConfig {
    /// Capacity of a tier in bytes.
    pub fn budget_for(&self, tier: Tier) -> u64 {
        match tier {
            Tier::DeviceMemory => self.device_memory_budget,
            Tier::HostMemory => self.host_memory_budget,
            Tier::LocalStorage => self.local_storage_budget,
            Tier::RemoteObject => self.remote_object_budget,
        }
    }

    /// Tiers that are configured, fastest first.
    pub fn enabled_tiers(&self) -> Vec<Tier> {
        Tier::ALL
            .into_iter()
            .filter(|tier| match tier {
                Tier::DeviceMemory | Tier::HostMemory => self.budget_for(*tier) > 0,
                Tier::LocalStorage => self.local_storage_budget > 0,
                Tier::RemoteObject => {
                    self.remote_object_path.is_some() && self.remote_object_budget > 0
                }
            })
            .collect()
    }
}

/// Eviction timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Pages touched within this window are never idle-evicted.
    pub hot_window_ms: u64,

    /// Pages idle beyond this are reclaimed even when pinned or referenced.
    pub max_inactive_ms: u64,

    /// A page whose tier write failed is not retried for this long.
    pub cooldown_ms: u64,

    /// Background cycle period.
    pub cycle_interval_ms: u64,

    /// Upper bound on pages moved per tier per cycle.
    pub max_victims_per_cycle: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            hot_window_ms: 300_000,
            max_inactive_ms: 900_000,
            cooldown_ms: 5_000,
            cycle_interval_ms: 1_000,
            max_victims_per_cycle: 256,
        }
    }
}

impl EvictionConfig {
    pub fn hot_window(&self) -> Duration {
        Duration::from_millis(self.hot_window_ms)
    }

    pub fn max_inactive(&self) -> Duration {
        Duration::from_millis(self.max_inactive_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms.max(1))
    }
}

/// Representation per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Quantize to int8 when pages land in host memory.
    pub host_quantize: bool,

    /// Quantize to int8 when pages land on local storage.
    pub storage_quantize: bool,

    /// Quantize and zstd-compress pages on the remote object tier.
    pub remote_zstd: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Elements sharing one int8 scale.
    pub group_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            host_quantize: false,
            storage_quantize: true,
            remote_zstd: true,
            zstd_level: 3,
            group_size: 32,
        }
    }
}

/// One simulated link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub enabled: bool,
    pub bandwidth_bytes_per_sec: u64,
    pub latency_us: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bandwidth_bytes_per_sec: 10_000_000_000,
            latency_us: 10,
        }
    }
}

/// Transfer layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transports in fallback order. Known names: rdma, collective, network.
    pub engine_order: Vec<String>,

    /// Bound on a single transport attempt.
    pub attempt_timeout_ms: u64,

    /// Maximum jobs in flight.
    pub max_concurrent: usize,

    /// Successful transfers remembered for observability.
    pub history_len: usize,

    pub rdma: LinkConfig,
    pub collective: LinkConfig,
    pub network: LinkConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            engine_order: vec![
                "rdma".to_string(),
                "collective".to_string(),
                "network".to_string(),
            ],
            attempt_timeout_ms: 2000,
            max_concurrent: 16,
            history_len: 256,
            rdma: LinkConfig {
                bandwidth_bytes_per_sec: 25_000_000_000,
                latency_us: 5,
                ..Default::default()
            },
            collective: LinkConfig {
                bandwidth_bytes_per_sec: 12_000_000_000,
                latency_us: 20,
                ..Default::default()
            },
            network: LinkConfig {
                bandwidth_bytes_per_sec: 1_250_000_000,
                latency_us: 200,
                ..Default::default()
            },
        }
    }
}

impl TransferConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Placement scoring weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub locality_weight: f64,
    pub load_weight: f64,
    pub headroom_weight: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            locality_weight: 0.6,
            load_weight: 0.25,
            headroom_weight: 0.15,
        }
    }
}

/// A worker in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub role: Role,
    pub host: String,

    /// Concurrent sequences the worker runs.
    #[serde(default = "default_worker_slots")]
    pub slots: usize,

    /// KV memory on the worker's device.
    #[serde(default = "default_worker_memory")]
    pub memory_bytes: u64,
}

fn default_worker_slots() -> usize {
    8
}

fn default_worker_memory() -> u64 {
    1024 * 1024 * 1024
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, role: Role, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            host: host.into(),
            slots: default_worker_slots(),
            memory_bytes: default_worker_memory(),
        }
    }
}

/// Simulated execution backend rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub prefill_tokens_per_sec: f64,
    pub decode_tokens_per_sec: f64,

    /// Multiplier on simulated compute time; 0 disables sleeping.
    pub time_scale: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            prefill_tokens_per_sec: 50_000.0,
            decode_tokens_per_sec: 2_000.0,
            time_scale: 1.0,
        }
    }
}

const KNOWN_TRANSPORTS: [&str; 3] = ["rdma", "collective", "network"];

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Populate the tenant and worker lists when the file leaves them empty.
    pub fn fill_defaults(&mut self) {
        if self.tenants.is_empty() {
            self.tenants.push(TenantConfig::default());
        }
        if self.workers.is_empty() {
            self.workers = vec![
                WorkerConfig::new("prefill-0", Role::Prefill, "host-a"),
                WorkerConfig::new("decode-0", Role::Decode, "host-a"),
                WorkerConfig::new("decode-1", Role::Decode, "host-b"),
            ];
        }
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::DuplicateTenant(tenant.id.clone()));
            }
            if !(tenant.weight > 0.0) {
                return Err(ConfigError::InvalidWeight {
                    tenant: tenant.id.clone(),
                    weight: tenant.weight,
                });
            }
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.id.as_str()) {
                return Err(ConfigError::DuplicateWorker(worker.id.clone()));
            }
        }
        for role in [Role::Prefill, Role::Decode] {
            if !self.workers.iter().any(|w| w.role == role) {
                return Err(ConfigError::MissingRole(role));
            }
        }

        if self.transfer.engine_order.is_empty() {
            return Err(ConfigError::EmptyTransportChain);
        }
        if let Some(name) = self
            .transfer
            .engine_order
            .iter()
            .find(|name| !KNOWN_TRANSPORTS.contains(&name.as_str()))
        {
            return Err(ConfigError::UnknownTransport(name.clone()));
        }

        let (low, high) = (self.tiers.low_watermark, self.tiers.high_watermark);
        if !(low > 0.0 && low < high && high <= 1.0) {
            return Err(ConfigError::InvalidWatermarks { low, high });
        }

        if self.model.page_tokens == 0 {
            return Err(ConfigError::Zero {
                field: "model.page_tokens",
            });
        }
        if self.scheduling.prefill_chunk_tokens == 0 {
            return Err(ConfigError::Zero {
                field: "scheduling.prefill_chunk_tokens",
            });
        }
        if self.tiers.device_memory_budget == 0 {
            return Err(ConfigError::Zero {
                field: "tiers.device_memory_budget",
            });
        }
        if self.compression.group_size == 0 {
            return Err(ConfigError::Zero {
                field: "compression.group_size",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.fill_defaults();
        cfg
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = valid();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.transfer.engine_order[0], "rdma");
        assert_eq!(cfg.scheduling.aging_bound(), Duration::from_secs(2));
    }

    #[test]
    fn test_kv_page_bytes() {
        let cfg = Config::default();
        // n_layers(4) * n_kv_heads(4) * head_dim(64) * 2(fp16) * 2(K+V)
        assert_eq!(cfg.model.kv_bytes_per_token(), 4 * 4 * 64 * 2 * 2);
        assert_eq!(cfg.model.page_bytes(), 4096 * 64);
    }

    #[test]
    fn test_rejects_bad_weight() {
        let mut cfg = valid();
        cfg.tenants.push(TenantConfig::new("zero", 0.0));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_transport() {
        let mut cfg = valid();
        cfg.transfer.engine_order.push("carrier-pigeon".into());
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::UnknownTransport("carrier-pigeon".into()))
        );
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let mut cfg = valid();
        cfg.tiers.low_watermark = 0.9;
        cfg.tiers.high_watermark = 0.8;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidWatermarks { .. })
        ));
    }

    #[test]
    fn test_enabled_tiers_skip_unconfigured_remote() {
        let cfg = TierConfig::default();
        assert_eq!(
            cfg.enabled_tiers(),
            vec![Tier::DeviceMemory, Tier::HostMemory, Tier::LocalStorage]
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "tenants": [ { "id": "a", "weight": 2.0, "ttft_target_ms": 300 } ] }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.tenants.len(), 1);
        assert_eq!(cfg.tenants[0].ttft_target(), Some(Duration::from_millis(300)));
        assert_eq!(cfg.tenants[0].max_concurrency, 64);
        assert_eq!(cfg.budgets.max_prefill_concurrency, 6);
    }
}
