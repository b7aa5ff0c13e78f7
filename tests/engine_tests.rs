//! End-to-end tests: submit through the serving engine and watch sequences finish.

use std::sync::Arc;
use std::time::Duration;

use llmserve::budget::{BudgetTracker, Resource};
use llmserve::cache::manager::CacheManager;
use llmserve::cache::page::Tier;
use llmserve::cache::store::{MemoryStore, TierStore};
use llmserve::config::{Config, TenantConfig, WorkerConfig};
use llmserve::inference::backend::SimulatedBackend;
use llmserve::inference::engine::{EngineParts, ServingEngine};
use llmserve::metrics::Metrics;
use llmserve::placement::worker::Role;
use llmserve::scheduler::{
    Decision, Phase, RejectReason, SequenceId, SequenceRequest, SequenceStatus, TenantId,
};
use llmserve::transfer::engine::TransferEngine;

fn config(prefill_host: &str, decode_host: &str) -> Config {
    let mut config = Config::default();
    config.tenants = vec![TenantConfig::new("t", 1.0)];
    config.workers = vec![
        WorkerConfig::new("p0", Role::Prefill, prefill_host),
        WorkerConfig::new("d0", Role::Decode, decode_host),
    ];
    config.tiers.local_storage_budget = 0;
    config.backend.time_scale = 0.0;
    config.transfer.rdma.latency_us = 10;
    config.transfer.network.latency_us = 10;
    config.transfer.collective.latency_us = 10;
    config
}

fn start(config: Config) -> (Arc<ServingEngine>, Arc<SimulatedBackend>, Arc<BudgetTracker>) {
    let metrics = Arc::new(Metrics::new().unwrap());
    let budgets = Arc::new(BudgetTracker::from_config(&config));
    let stores: Vec<Arc<dyn TierStore>> = vec![
        Arc::new(MemoryStore::new(Tier::DeviceMemory)),
        Arc::new(MemoryStore::new(Tier::HostMemory)),
    ];
    let cache = Arc::new(CacheManager::with_stores(
        &config,
        budgets.clone(),
        metrics.clone(),
        stores,
    ));
    let transfers = Arc::new(TransferEngine::new(&config.transfer, metrics.clone()));
    let backend = Arc::new(SimulatedBackend::new(
        config.backend.clone(),
        config.model.kv_bytes_per_token(),
    ));
    let engine = ServingEngine::start(
        config,
        EngineParts {
            metrics,
            budgets: budgets.clone(),
            cache,
            transfers,
            backend: backend.clone(),
        },
    );
    (engine, backend, budgets)
}

fn request(len: usize, max_new_tokens: usize) -> SequenceRequest {
    SequenceRequest {
        tenant: TenantId::from("t"),
        prompt: (0..len as u32).collect(),
        max_new_tokens,
    }
}

async fn wait_terminal(engine: &ServingEngine, id: SequenceId) -> SequenceStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(status) = engine.status(id) {
            if status.phase.is_terminal() {
                return status;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sequence {id} did not finish"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_sequence_completes_and_prefix_is_reused() {
    let (engine, _, budgets) = start(config("a", "a"));

    let first = engine.submit(request(300, 4)).unwrap();
    assert_eq!(first.decision, Decision::Admitted);
    let status = wait_terminal(&engine, first.id).await;
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.generated_tokens, 4);
    assert_eq!(status.cached_tokens, 0);

    // 300 tokens at 64 per page.
    assert_eq!(engine.cache().len(), 5);

    let second = engine.submit(request(300, 4)).unwrap();
    let status = wait_terminal(&engine, second.id).await;
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.cached_tokens, 300);
    assert_eq!(engine.cache().len(), 5);

    assert_eq!(budgets.usage(&Resource::TokensInFlight), 0);
    assert_eq!(budgets.usage(&Resource::PrefillSlots), 0);
    assert_eq!(budgets.usage(&Resource::DecodeSlots), 0);
    assert_eq!(budgets.usage(&Resource::TransferBandwidth), 0);
    // Only the cached pages hold device memory.
    assert_eq!(
        budgets.usage(&Resource::TierCapacity(Tier::DeviceMemory)),
        300 * config("a", "a").model.kv_bytes_per_token()
    );
}

#[tokio::test]
async fn test_cross_host_pages_go_over_rdma() {
    let (engine, _, _) = start(config("a", "b"));

    let sub = engine.submit(request(128, 2)).unwrap();
    assert_eq!(wait_terminal(&engine, sub.id).await.phase, Phase::Completed);

    let history = engine.transfer_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].transport, "rdma");
    assert_eq!(history[0].pages, 2);
}

#[tokio::test]
async fn test_cross_host_falls_back_to_network_without_rdma() {
    let mut cfg = config("a", "b");
    cfg.transfer.rdma.enabled = false;
    let (engine, _, _) = start(cfg);

    let sub = engine.submit(request(128, 2)).unwrap();
    assert_eq!(wait_terminal(&engine, sub.id).await.phase, Phase::Completed);

    let history = engine.transfer_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].transport, "network");
}

#[tokio::test]
async fn test_failing_prefill_exhausts_retries() {
    let (engine, backend, budgets) = start(config("a", "a"));
    backend.set_fail_prefill(true);

    let sub = engine.submit(request(64, 2)).unwrap();
    let status = wait_terminal(&engine, sub.id).await;
    assert_eq!(status.phase, Phase::Rejected);
    assert_eq!(status.reject_reason, Some(RejectReason::RetriesExhausted));
    assert_eq!(status.retries, 2);
    assert!(engine.cache().is_empty());
    assert_eq!(budgets.usage(&Resource::TierCapacity(Tier::DeviceMemory)), 0);
    assert_eq!(budgets.usage(&Resource::TokensInFlight), 0);
}

#[tokio::test]
async fn test_cancel_during_decode_releases_budgets() {
    let mut cfg = config("a", "a");
    cfg.backend.time_scale = 1.0;
    cfg.backend.prefill_tokens_per_sec = 1_000_000.0;
    cfg.backend.decode_tokens_per_sec = 10.0;
    let (engine, _, budgets) = start(cfg);

    let sub = engine.submit(request(64, 1000)).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.status(sub.id).map(|s| s.phase) != Some(Phase::Decoding) {
        assert!(tokio::time::Instant::now() < deadline, "never reached decode");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    engine.cancel(sub.id).unwrap();
    let status = wait_terminal(&engine, sub.id).await;
    assert_eq!(status.phase, Phase::Cancelled);
    assert_eq!(budgets.usage(&Resource::TokensInFlight), 0);
    assert_eq!(budgets.usage(&Resource::DecodeSlots), 0);
    assert!(engine.cancel(sub.id).is_err());
}

#[tokio::test]
async fn test_maintenance_updates_budget_gauges() {
    let (engine, _, _) = start(config("a", "a"));
    let sub = engine.submit(request(64, 1)).unwrap();
    wait_terminal(&engine, sub.id).await;

    engine.maintenance().await;
    let gauge = engine
        .metrics()
        .budget_utilization
        .with_label_values(&["tier_capacity:device"])
        .get();
    assert!(gauge > 0.0);
    engine.shutdown();
}

#[tokio::test]
async fn test_cancel_between_prefill_chunks_keeps_finished_pages() {
    let mut cfg = config("a", "a");
    cfg.backend.time_scale = 1.0;
    // One 512-token chunk takes 100ms.
    cfg.backend.prefill_tokens_per_sec = 5_120.0;
    let (engine, _, budgets) = start(cfg);

    let sub = engine.submit(request(2048, 4)).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.cache().len() < 8 {
        assert!(tokio::time::Instant::now() < deadline, "first chunk never landed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    engine.cancel(sub.id).unwrap();
    let status = wait_terminal(&engine, sub.id).await;
    assert_eq!(status.phase, Phase::Cancelled);
    let cached = engine.cache().len();
    assert!((8..32).contains(&cached), "{cached} pages cached");
    assert_eq!(budgets.usage(&Resource::TokensInFlight), 0);
    assert_eq!(budgets.usage(&Resource::PrefillSlots), 0);
}
