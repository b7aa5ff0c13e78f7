//! Integration tests for the tiered KV page cache.

use std::sync::Arc;

use bytes::Bytes;
use half::f16;

use llmserve::budget::BudgetTracker;
use llmserve::cache::manager::{CacheManager, Demotion, PutOutcome};
use llmserve::cache::page::{KvPage, PageFormat, PageKey, PageTable, Tier};
use llmserve::cache::prefix::{chain_salt, prefix_pages, Token};
use llmserve::cache::store::{DiskStore, MemoryStore, TierStore};
use llmserve::config::{Config, TenantConfig};
use llmserve::metrics::Metrics;
use llmserve::scheduler::tenant::TenantId;

fn fp16_page(key: u64, tokens: usize) -> KvPage {
    let data: Vec<u8> = (0..tokens * 32)
        .flat_map(|i| f16::from_f32(((i as u64 + key) % 17) as f32 * 0.125 - 1.0).to_le_bytes())
        .collect();
    KvPage::new(PageKey(key), TenantId::from("t"), 0, tokens, Bytes::from(data))
}

async fn disk_backed(dir: &std::path::Path, quantize: bool) -> (CacheManager, Arc<DiskStore>) {
    let mut config = Config::default();
    config.tiers.device_memory_budget = 4096;
    config.tiers.host_memory_budget = 0;
    config.tiers.local_storage_budget = 1 << 20;
    config.tiers.local_storage_path = dir.to_path_buf();
    config.compression.storage_quantize = quantize;
    config.tenants = vec![TenantConfig::new("t", 1.0)];

    let budgets = Arc::new(BudgetTracker::from_config(&config));
    let metrics = Arc::new(Metrics::new().unwrap());
    let disk = Arc::new(
        DiskStore::open(Tier::LocalStorage, dir.to_path_buf())
            .await
            .unwrap(),
    );
    let stores: Vec<Arc<dyn TierStore>> = vec![
        Arc::new(MemoryStore::new(Tier::DeviceMemory)),
        disk.clone(),
    ];
    (
        CacheManager::with_stores(&config, budgets, metrics, stores),
        disk,
    )
}

#[test]
fn test_page_table_lifecycle() {
    let tokens: Vec<Token> = (0..1000).collect();
    let pages = prefix_pages(&tokens, 256, chain_salt(&TenantId::from("t"), false));
    assert_eq!(pages.len(), 4);
    assert_eq!(pages[3].token_count, 1000 - 3 * 256);

    let mut table = PageTable::new(256);
    for page in &pages {
        table.push(page.key, page.token_count);
    }
    assert_eq!(table.len(), 4);
    assert_eq!(table.total_tokens(), 1000);
    assert_eq!(table.page_for_token(0), Some(pages[0].key));
    assert_eq!(table.page_for_token(999), Some(pages[3].key));
    assert_eq!(table.page_for_token(1000), None);
}

#[test]
fn test_tenants_do_not_share_prefixes_by_default() {
    let tokens: Vec<Token> = (0..128).collect();
    let a = prefix_pages(&tokens, 64, chain_salt(&TenantId::from("a"), false));
    let b = prefix_pages(&tokens, 64, chain_salt(&TenantId::from("b"), false));
    assert_ne!(a[0].key, b[0].key);

    let a = prefix_pages(&tokens, 64, chain_salt(&TenantId::from("a"), true));
    let b = prefix_pages(&tokens, 64, chain_salt(&TenantId::from("b"), true));
    assert_eq!(a[0].key, b[0].key);
    assert_eq!(a[1].key, b[1].key);
}

#[tokio::test]
async fn test_demote_to_disk_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, disk) = disk_backed(dir.path(), false).await;

    let page = fp16_page(7, 16);
    let expected = page.data.clone();
    assert_eq!(
        cache.put(page).await.unwrap(),
        PutOutcome::Stored(Tier::DeviceMemory)
    );
    cache.release(&[PageKey(7)]);

    assert_eq!(
        cache.demote(PageKey(7), false).await.unwrap(),
        Demotion::Moved(Tier::LocalStorage)
    );
    assert!(disk.page_path(PageKey(7)).exists());
    assert_eq!(cache.page_info(PageKey(7)).unwrap().tier, Tier::LocalStorage);
    assert_eq!(cache.get(PageKey(7)).await.unwrap(), expected);

    // Coldest tier: only an explicit drop removes it.
    assert_eq!(
        cache.demote(PageKey(7), false).await.unwrap(),
        Demotion::Kept
    );
    assert_eq!(
        cache.demote(PageKey(7), true).await.unwrap(),
        Demotion::Dropped
    );
    assert!(cache.page_info(PageKey(7)).is_none());
    assert!(!disk.page_path(PageKey(7)).exists());
}

#[tokio::test]
async fn test_quantized_storage_tier_shrinks_pages() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, _disk) = disk_backed(dir.path(), true).await;

    let page = fp16_page(9, 16);
    let logical = page.logical_size();
    cache.put(page).await.unwrap();
    cache.release(&[PageKey(9)]);
    cache.demote(PageKey(9), false).await.unwrap();

    let info = cache.page_info(PageKey(9)).unwrap();
    assert_eq!(info.format, PageFormat::Int8);
    assert!(info.stored_size < logical);
    assert_eq!(info.logical_size, logical);

    // Reads come back as FP16 of the original length.
    let restored = cache.get(PageKey(9)).await.unwrap();
    assert_eq!(restored.len() as u64, logical);
}

#[tokio::test]
async fn test_promote_restores_device_copy() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, _disk) = disk_backed(dir.path(), false).await;

    cache.put(fp16_page(3, 16)).await.unwrap();
    cache.release(&[PageKey(3)]);
    cache.demote(PageKey(3), false).await.unwrap();

    assert_eq!(
        cache.promote(PageKey(3), Tier::DeviceMemory).await.unwrap(),
        Tier::DeviceMemory
    );
    let stats = cache.tier_stats();
    let device = stats
        .iter()
        .find(|s| s.tier == Some(Tier::DeviceMemory))
        .unwrap();
    assert_eq!(device.page_count, 1);
    let storage = stats
        .iter()
        .find(|s| s.tier == Some(Tier::LocalStorage))
        .unwrap();
    assert_eq!(storage.bytes_used, 0);
}

#[tokio::test]
async fn test_admission_grant_is_consumed_first() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, _disk) = disk_backed(dir.path(), false).await;
    let page = fp16_page(1, 16);
    let size = page.logical_size();

    // Bytes already reserved against the device tier at admission.
    let mut grant = size + 10;
    cache.put_reserved(page, &mut grant).await.unwrap();
    assert_eq!(grant, 10);
}
