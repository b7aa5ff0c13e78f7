//! Tier manager: the page table and every page movement between tiers.
//!
//! The cache manager is the central coordinator for KV pages. It:
//! - Maps page keys to their tier, representation and reference state
//! - Places new pages in the fastest tier with room, demoting LRU pages first
//! - Moves pages between tiers copy-then-free, re-encoding per tier
//! - Verifies stored bytes on every read
//! - Runs the periodic eviction cycle
//!
//! Tier occupancy is accounted in the shared [`BudgetTracker`] under
//! [`Resource::TierCapacity`], so admission sees the same numbers eviction
//! acts on. The page table is a sharded map; no map guard is held across an
//! `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetError, BudgetTracker, Resource};
use crate::cache::compressor::{CompressionError, Compressor};
use crate::cache::evictor::{Evictor, FloorLedger, VictimQuery};
use crate::cache::page::{KvPage, PageEntry, PageFormat, PageInfo, PageKey, PageState, Tier};
use crate::cache::prefix::compute_hash;
use crate::cache::store::{DiskStore, MemoryStore, StoreError, TierStore};
use crate::config::{Config, EvictionConfig};
use crate::metrics::Metrics;
use crate::placement::router::PageLocator;
use crate::scheduler::tenant::TenantId;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("page {0} not cached")]
    Miss(PageKey),

    #[error("page {0} is still being written")]
    NotReady(PageKey),

    #[error("page {0} is being moved")]
    Busy(PageKey),

    #[error("page {0} failed checksum verification")]
    Corrupted(PageKey),

    #[error("page {0} already cached with different content")]
    ContentMismatch(PageKey),

    #[error("no tier can hold page {key} ({size} bytes)")]
    NoCapacity { key: PageKey, size: u64 },

    #[error("tier {0} has no store")]
    TierDisabled(Tier),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Budget(#[from] BudgetError),
}

/// Where a `put` left the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Newly stored in this tier.
    Stored(Tier),
    /// Already cached; reference count incremented.
    Shared(Tier),
}

impl PutOutcome {
    pub fn tier(&self) -> Tier {
        match self {
            PutOutcome::Stored(tier) | PutOutcome::Shared(tier) => *tier,
        }
    }
}

/// Result of trying to push a page down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demotion {
    Moved(Tier),
    Dropped,
    /// No slower tier could take it and dropping was not allowed.
    Kept,
}

/// Per-tier usage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub tier: Option<Tier>,
    /// Number of pages in this tier.
    pub page_count: usize,
    /// Total bytes used in this tier (including pending reservations).
    pub bytes_used: u64,
    /// Capacity budget in bytes.
    pub capacity: u64,
}

impl TierStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.capacity as f64
    }

    /// Whether this tier has exceeded its high watermark.
    pub fn above_high_watermark(&self, watermark: f64) -> bool {
        self.usage_fraction() > watermark
    }

    /// Whether this tier is below its low watermark.
    pub fn below_low_watermark(&self, watermark: f64) -> bool {
        self.usage_fraction() < watermark
    }
}

/// What one eviction cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Stale pins and leaked references found.
    pub anomalies: usize,
    pub demoted: usize,
    pub dropped: usize,
    /// Candidates kept for a tenant's hot-set floor.
    pub floor_protected: usize,
    pub failures: usize,
}

/// The central tier manager.
pub struct CacheManager {
    /// Page table indexed by key.
    entries: DashMap<PageKey, PageEntry>,

    /// Byte stores, one per enabled tier.
    stores: HashMap<Tier, Arc<dyn TierStore>>,

    /// Enabled tiers, fastest first.
    tiers: Vec<Tier>,

    /// Resident bytes per tenant and tier.
    resident: DashMap<(TenantId, Tier), u64>,

    /// Hot-set floors per tenant.
    floors: HashMap<TenantId, u64>,

    compressor: Compressor,
    evictor: Evictor,
    budgets: Arc<BudgetTracker>,
    metrics: Arc<Metrics>,
    eviction: EvictionConfig,
    high_watermark: f64,
    low_watermark: f64,
}

impl CacheManager {
    /// Build the manager with in-memory device/host stores and on-disk storage tiers.
    pub async fn open(
        config: &Config,
        budgets: Arc<BudgetTracker>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, CacheError> {
        let mut stores: Vec<Arc<dyn TierStore>> = Vec::new();
        for tier in config.tiers.enabled_tiers() {
            let store: Arc<dyn TierStore> = match tier {
                Tier::DeviceMemory | Tier::HostMemory => Arc::new(MemoryStore::new(tier)),
                Tier::LocalStorage => Arc::new(
                    DiskStore::open(tier, config.tiers.local_storage_path.clone()).await?,
                ),
                Tier::RemoteObject => match &config.tiers.remote_object_path {
                    Some(path) => Arc::new(DiskStore::open(tier, path.clone()).await?),
                    None => continue,
                },
            };
            stores.push(store);
        }
        Ok(Self::with_stores(config, budgets, metrics, stores))
    }

    /// Build the manager over caller-provided stores.
    ///
    /// Tiers without a store or without a registered capacity budget are skipped.
    pub fn with_stores(
        config: &Config,
        budgets: Arc<BudgetTracker>,
        metrics: Arc<Metrics>,
        stores: Vec<Arc<dyn TierStore>>,
    ) -> Self {
        let stores: HashMap<Tier, Arc<dyn TierStore>> =
            stores.into_iter().map(|s| (s.tier(), s)).collect();
        let tiers: Vec<Tier> = Tier::ALL
            .into_iter()
            .filter(|tier| {
                stores.contains_key(tier)
                    && budgets.get(&Resource::TierCapacity(*tier)).is_some()
            })
            .collect();
        let floors = config
            .tenants
            .iter()
            .map(|t| (TenantId::from(t.id.as_str()), t.hot_set_bytes))
            .collect();

        info!(tiers = ?tiers, "Cache manager ready");

        Self {
            entries: DashMap::new(),
            stores,
            tiers,
            resident: DashMap::new(),
            floors,
            compressor: Compressor::new(config.compression.clone()),
            evictor: Evictor::new(),
            budgets,
            metrics,
            eviction: config.eviction.clone(),
            high_watermark: config.tiers.high_watermark,
            low_watermark: config.tiers.low_watermark,
        }
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    fn store(&self, tier: Tier) -> Result<&Arc<dyn TierStore>, CacheError> {
        self.stores.get(&tier).ok_or(CacheError::TierDisabled(tier))
    }

    fn tiers_below(&self, tier: Tier) -> impl Iterator<Item = Tier> + '_ {
        self.tiers.iter().copied().filter(move |t| *t > tier)
    }

    fn is_coldest(&self, tier: Tier) -> bool {
        self.tiers_below(tier).next().is_none()
    }

    // --- Accounting -----------------------------------------------------

    fn release_capacity(&self, tier: Tier, size: u64) {
        if let Err(e) = self.budgets.release(&Resource::TierCapacity(tier), size) {
            error!(tier = %tier, size, error = %e, "Tier accounting underflow");
        }
    }

    fn add_resident(&self, tenant: &TenantId, tier: Tier, size: u64) {
        *self.resident.entry((tenant.clone(), tier)).or_insert(0) += size;
    }

    fn sub_resident(&self, tenant: &TenantId, tier: Tier, size: u64) {
        if let Some(mut bytes) = self.resident.get_mut(&(tenant.clone(), tier)) {
            *bytes = bytes.saturating_sub(size);
        }
    }

    /// Bytes a tenant has resident in a tier.
    pub fn resident_bytes(&self, tenant: &TenantId, tier: Tier) -> u64 {
        self.resident
            .get(&(tenant.clone(), tier))
            .map(|b| *b)
            .unwrap_or(0)
    }

    fn floor_ledger(&self, tier: Tier) -> FloorLedger {
        let resident = self
            .resident
            .iter()
            .filter(|entry| entry.key().1 == tier)
            .map(|entry| (entry.key().0.clone(), *entry.value()))
            .collect();
        FloorLedger::new(self.floors.clone(), resident)
    }

    /// Reserve room for `size` bytes in `tier`, demoting LRU pages if needed.
    ///
    /// Device-tier bytes pre-reserved at admission are consumed first.
    async fn reserve_in(&self, tier: Tier, size: u64, prereserved: &mut u64) -> bool {
        if tier == Tier::DeviceMemory && *prereserved >= size {
            *prereserved -= size;
            return true;
        }
        let resource = Resource::TierCapacity(tier);
        if self.budgets.try_reserve(&resource, size).is_ok() {
            return true;
        }
        self.make_room(tier, size).await;
        self.budgets.try_reserve(&resource, size).is_ok()
    }

    /// Demote least-recently-used pages out of `tier` until `needed` bytes fit.
    async fn make_room(&self, tier: Tier, needed: u64) -> usize {
        let headroom = self.budgets.headroom(&Resource::TierCapacity(tier));
        if headroom >= needed {
            return 0;
        }
        let now = Instant::now();
        let snapshot: Vec<PageEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        let selection = self.evictor.select_victims(
            snapshot.iter(),
            tier,
            now,
            VictimQuery {
                min_idle: None,
                bytes_needed: Some(needed - headroom),
                max_count: self.eviction.max_victims_per_cycle.max(1),
            },
            self.floor_ledger(tier),
        );

        let mut moved = 0;
        for victim in selection.victims {
            match self.demote(victim.key, true).await {
                Ok(Demotion::Moved(_)) | Ok(Demotion::Dropped) => moved += 1,
                Ok(Demotion::Kept) => {}
                Err(e) => debug!(key = %victim.key, error = %e, "Could not make room"),
            }
        }
        debug!(tier = %tier, needed, moved, "Made room");
        moved
    }

    // --- Contract ---------------------------------------------------------

    /// Insert a page. An existing key gains a reference instead of a second copy.
    ///
    /// The caller holds one reference on success and must [`release`](Self::release) it.
    pub async fn put(&self, page: KvPage) -> Result<PutOutcome, CacheError> {
        self.put_reserved(page, &mut 0).await
    }

    /// Like [`put`](Self::put), drawing device-tier bytes from `prereserved` first.
    pub async fn put_reserved(
        &self,
        page: KvPage,
        prereserved: &mut u64,
    ) -> Result<PutOutcome, CacheError> {
        let now = Instant::now();
        let key = page.key;
        let checksum = page.content_checksum();
        let first_tier = *self
            .tiers
            .first()
            .ok_or(CacheError::TierDisabled(Tier::DeviceMemory))?;

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.content_checksum != checksum {
                    error!(key = %key, tenant = %page.tenant, "Page content differs from cached copy");
                    return Err(CacheError::ContentMismatch(key));
                }
                entry.ref_count += 1;
                entry.touch(now);
                debug!(key = %key, refs = entry.ref_count, tier = %entry.tier, "Shared cached page");
                return Ok(PutOutcome::Shared(entry.tier));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PageEntry {
                    key,
                    tenant: page.tenant.clone(),
                    token_count: page.token_count,
                    tier: first_tier,
                    format: PageFormat::Fp16,
                    stored_size: 0,
                    logical_size: page.logical_size(),
                    content_checksum: checksum,
                    stored_checksum: 0,
                    ref_count: 1,
                    pinned: false,
                    state: PageState::Writing,
                    created: now,
                    last_access: now,
                    access_count: 1,
                    cooldown_until: None,
                });
            }
        }

        match self.write_new(&page, prereserved).await {
            Ok(tier) => Ok(PutOutcome::Stored(tier)),
            Err(e) => {
                self.entries.remove(&key);
                Err(e)
            }
        }
    }

    async fn write_new(&self, page: &KvPage, prereserved: &mut u64) -> Result<Tier, CacheError> {
        for &tier in &self.tiers {
            let format = self.compressor.format_for_tier(tier);
            let encoded = Bytes::from(self.compressor.encode(&page.data, format)?);
            let size = encoded.len() as u64;
            if !self.reserve_in(tier, size, prereserved).await {
                debug!(key = %page.key, tier = %tier, "Tier full, trying next");
                continue;
            }
            let stored_checksum = compute_hash(&encoded, 0);
            if let Err(e) = self.store(tier)?.write(page.key, encoded).await {
                warn!(key = %page.key, tier = %tier, error = %e, "Tier write failed");
                self.release_capacity(tier, size);
                continue;
            }
            if let Some(mut entry) = self.entries.get_mut(&page.key) {
                entry.tier = tier;
                entry.format = format;
                entry.stored_size = size;
                entry.stored_checksum = stored_checksum;
                entry.state = PageState::Ready;
            }
            self.add_resident(&page.tenant, tier, size);
            debug!(key = %page.key, tier = %tier, size, format = ?format, "Stored page");
            return Ok(tier);
        }
        Err(CacheError::NoCapacity {
            key: page.key,
            size: page.logical_size(),
        })
    }

    /// Read a page back as FP16.
    ///
    /// A checksum mismatch removes the page and returns [`CacheError::Corrupted`].
    pub async fn get(&self, key: PageKey) -> Result<Bytes, CacheError> {
        for _ in 0..3 {
            let (tier, format, checksum) = {
                let mut entry = self.entries.get_mut(&key).ok_or(CacheError::Miss(key))?;
                if entry.state == PageState::Writing {
                    return Err(CacheError::NotReady(key));
                }
                entry.touch(Instant::now());
                (entry.tier, entry.format, entry.stored_checksum)
            };

            let data = match self.store(tier)?.read(key).await {
                Ok(data) => data,
                // Moved between snapshot and read.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            if compute_hash(&data, 0) != checksum {
                let moved = self
                    .entries
                    .get(&key)
                    .map(|e| e.tier != tier || e.stored_checksum != checksum)
                    .unwrap_or(true);
                if moved {
                    continue;
                }
                error!(key = %key, tier = %tier, "Checksum mismatch, evicting page");
                self.metrics.corrupted_pages.inc();
                self.remove_page(key).await;
                return Err(CacheError::Corrupted(key));
            }

            let fp16 = self.compressor.decode(&data, format)?;
            return Ok(Bytes::from(fp16));
        }
        Err(CacheError::Busy(key))
    }

    /// Pin a page so eviction never drops it.
    pub fn pin(&self, key: PageKey) -> Result<(), CacheError> {
        let mut entry = self.entries.get_mut(&key).ok_or(CacheError::Miss(key))?;
        entry.pinned = true;
        Ok(())
    }

    pub fn unpin(&self, key: PageKey) -> Result<(), CacheError> {
        let mut entry = self.entries.get_mut(&key).ok_or(CacheError::Miss(key))?;
        entry.pinned = false;
        Ok(())
    }

    /// Take a reference on each leading readable page. Returns how many were taken.
    pub fn acquire(&self, keys: &[PageKey]) -> usize {
        let now = Instant::now();
        let mut taken = 0;
        for key in keys {
            match self.entries.get_mut(key) {
                Some(mut entry) if entry.state != PageState::Writing => {
                    entry.ref_count += 1;
                    entry.touch(now);
                    taken += 1;
                }
                _ => break,
            }
        }
        taken
    }

    /// Drop one reference on each page.
    pub fn release(&self, keys: &[PageKey]) {
        for key in keys {
            match self.entries.get_mut(key) {
                Some(mut entry) if entry.ref_count > 0 => entry.ref_count -= 1,
                Some(_) => warn!(key = %key, "Release of unreferenced page"),
                None => debug!(key = %key, "Release of page no longer cached"),
            }
        }
    }

    /// Number of leading keys that are cached and readable.
    pub fn lookup_prefix(&self, keys: &[PageKey]) -> usize {
        keys.iter()
            .take_while(|key| {
                self.entries
                    .get(*key)
                    .is_some_and(|e| e.state != PageState::Writing)
            })
            .count()
    }

    pub fn page_info(&self, key: PageKey) -> Option<PageInfo> {
        self.entries.get(&key).map(|e| e.info())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move a page up to `target`, making room there first.
    pub async fn promote(&self, key: PageKey, target: Tier) -> Result<Tier, CacheError> {
        let (current, size) = self
            .entries
            .get(&key)
            .map(|e| (e.tier, e.logical_size))
            .ok_or(CacheError::Miss(key))?;
        if target >= current {
            return Ok(current);
        }
        if !self.tiers.contains(&target) {
            return Err(CacheError::TierDisabled(target));
        }
        self.make_room(target, size).await;
        self.relocate(key, target).await?;
        info!(key = %key, from = %current, to = %target, "Promoted page");
        Ok(target)
    }

    /// Push a page to the next slower tier that has room.
    pub async fn demote(&self, key: PageKey, allow_drop: bool) -> Result<Demotion, CacheError> {
        let src = self
            .entries
            .get(&key)
            .map(|e| e.tier)
            .ok_or(CacheError::Miss(key))?;
        let below: Vec<Tier> = self.tiers_below(src).collect();
        for dst in below {
            match self.relocate(key, dst).await {
                Ok(()) => return Ok(Demotion::Moved(dst)),
                Err(CacheError::NoCapacity { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        if allow_drop && self.drop_page(key).await {
            return Ok(Demotion::Dropped);
        }
        Ok(Demotion::Kept)
    }

    /// Copy a page into `dst`, then free the source copy.
    async fn relocate(&self, key: PageKey, dst: Tier) -> Result<(), CacheError> {
        let (src, format, size, checksum, tenant) = {
            let mut entry = self.entries.get_mut(&key).ok_or(CacheError::Miss(key))?;
            if entry.state != PageState::Ready {
                return Err(CacheError::Busy(key));
            }
            if entry.tier == dst {
                return Ok(());
            }
            entry.state = PageState::Moving;
            (
                entry.tier,
                entry.format,
                entry.stored_size,
                entry.stored_checksum,
                entry.tenant.clone(),
            )
        };

        let copied = self.copy_to(key, src, format, checksum, dst).await;
        let (dst_format, dst_size, dst_checksum) = match copied {
            Ok(copy) => copy,
            Err(e) => {
                match &e {
                    CacheError::Corrupted(_) => {
                        error!(key = %key, tier = %src, "Checksum mismatch during move");
                        self.metrics.corrupted_pages.inc();
                        self.remove_page(key).await;
                    }
                    CacheError::Store(_) => {
                        let until = Instant::now() + self.eviction.cooldown();
                        if let Some(mut entry) = self.entries.get_mut(&key) {
                            entry.state = PageState::Ready;
                            entry.cooldown_until = Some(until);
                        }
                        warn!(key = %key, from = %src, to = %dst, error = %e, "Move failed, page cooling down");
                    }
                    _ => {
                        if let Some(mut entry) = self.entries.get_mut(&key) {
                            entry.state = PageState::Ready;
                        }
                    }
                }
                return Err(e);
            }
        };

        let committed = match self.entries.get_mut(&key) {
            Some(mut entry) => {
                entry.tier = dst;
                entry.format = dst_format;
                entry.stored_size = dst_size;
                entry.stored_checksum = dst_checksum;
                entry.state = PageState::Ready;
                true
            }
            None => false,
        };

        if !committed {
            // Removed while moving; the new copy is orphaned.
            self.discard_copy(key, dst, dst_size).await;
            return Err(CacheError::Miss(key));
        }

        if let Err(e) = self.store(src)?.delete(key).await {
            warn!(key = %key, tier = %src, error = %e, "Failed to free source copy");
        }
        self.release_capacity(src, size);
        self.sub_resident(&tenant, src, size);
        self.add_resident(&tenant, dst, dst_size);
        if dst > src {
            self.metrics.evictions.with_label_values(&[src.as_str()]).inc();
        }
        debug!(key = %key, from = %src, to = %dst, size = dst_size, "Moved page");
        Ok(())
    }

    /// Read, verify, re-encode and write a page into `dst`.
    async fn copy_to(
        &self,
        key: PageKey,
        src: Tier,
        format: PageFormat,
        checksum: u64,
        dst: Tier,
    ) -> Result<(PageFormat, u64, u64), CacheError> {
        let data = self.store(src)?.read(key).await?;
        if compute_hash(&data, 0) != checksum {
            return Err(CacheError::Corrupted(key));
        }
        let dst_format = self.compressor.format_for_tier(dst);
        let encoded = Bytes::from(self.compressor.convert(&data, format, dst_format)?);
        let size = encoded.len() as u64;

        let resource = Resource::TierCapacity(dst);
        if self.budgets.try_reserve(&resource, size).is_err() {
            return Err(CacheError::NoCapacity { key, size });
        }
        let dst_checksum = compute_hash(&encoded, 0);
        if let Err(e) = self.store(dst)?.write(key, encoded).await {
            self.release_capacity(dst, size);
            return Err(e.into());
        }
        Ok((dst_format, size, dst_checksum))
    }

    async fn discard_copy(&self, key: PageKey, tier: Tier, size: u64) {
        if let Ok(store) = self.store(tier) {
            if let Err(e) = store.delete(key).await {
                warn!(key = %key, tier = %tier, error = %e, "Failed to discard copy");
            }
        }
        self.release_capacity(tier, size);
    }

    /// Drop a ready, unpinned, unreferenced page entirely.
    async fn drop_page(&self, key: PageKey) -> bool {
        let removed = self.entries.remove_if(&key, |_, e| {
            e.state == PageState::Ready && !e.pinned && e.ref_count == 0
        });
        match removed {
            Some((_, entry)) => {
                self.discard_copy(key, entry.tier, entry.stored_size).await;
                self.sub_resident(&entry.tenant, entry.tier, entry.stored_size);
                self.metrics
                    .evictions
                    .with_label_values(&[entry.tier.as_str()])
                    .inc();
                debug!(key = %key, tier = %entry.tier, "Dropped page");
                true
            }
            None => false,
        }
    }

    /// Remove a page regardless of its state.
    async fn remove_page(&self, key: PageKey) {
        if let Some((_, entry)) = self.entries.remove(&key) {
            if entry.state != PageState::Writing {
                self.discard_copy(key, entry.tier, entry.stored_size).await;
                self.sub_resident(&entry.tenant, entry.tier, entry.stored_size);
            }
        }
    }

    // --- Eviction cycle -----------------------------------------------------

    /// Run one eviction cycle: anomaly pass, idle pass, pressure pass.
    pub async fn evict_cycle(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        self.anomaly_pass(Instant::now(), &mut report).await;
        self.idle_pass(Instant::now(), &mut report).await;
        self.pressure_pass(Instant::now(), &mut report).await;

        if report.demoted + report.dropped + report.anomalies > 0 {
            info!(
                anomalies = report.anomalies,
                demoted = report.demoted,
                dropped = report.dropped,
                floor_protected = report.floor_protected,
                failures = report.failures,
                "Eviction cycle complete"
            );
        }
        report
    }

    fn record(&self, outcome: Result<Demotion, CacheError>, report: &mut EvictionReport) {
        match outcome {
            Ok(Demotion::Moved(_)) => report.demoted += 1,
            Ok(Demotion::Dropped) => report.dropped += 1,
            Ok(Demotion::Kept) => {}
            Err(CacheError::Busy(_)) | Err(CacheError::Miss(_)) => {}
            Err(e) => {
                debug!(error = %e, "Eviction step failed");
                report.failures += 1;
            }
        }
    }

    /// Pages pinned or referenced but idle beyond `max_inactive` are leaks.
    async fn anomaly_pass(&self, now: Instant, report: &mut EvictionReport) {
        let max_inactive = self.eviction.max_inactive();
        let stale: Vec<(PageKey, bool, u32)> = self
            .entries
            .iter()
            .filter(|e| {
                e.state == PageState::Ready
                    && (e.pinned || e.ref_count > 0)
                    && e.idle(now) > max_inactive
                    && !e.cooling(now)
            })
            .map(|e| (e.key, e.pinned, e.ref_count))
            .collect();

        for (key, pinned, refs) in stale {
            warn!(key = %key, pinned, refs, "Reclaiming stale page");
            self.metrics.page_anomalies.inc();
            report.anomalies += 1;
            if let Some(mut entry) = self.entries.get_mut(&key) {
                entry.ref_count = 0;
            }
            let outcome = self.demote(key, !pinned).await;
            self.record(outcome, report);
        }
    }

    /// Unreferenced pages idle beyond the hot window move down one tier.
    async fn idle_pass(&self, now: Instant, report: &mut EvictionReport) {
        let snapshot: Vec<PageEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        for &tier in &self.tiers {
            let selection = self.evictor.select_victims(
                snapshot.iter(),
                tier,
                now,
                VictimQuery {
                    min_idle: Some(self.eviction.hot_window()),
                    bytes_needed: None,
                    max_count: self.eviction.max_victims_per_cycle,
                },
                self.floor_ledger(tier),
            );
            report.floor_protected += selection.floor_protected;
            for victim in selection.victims {
                let outcome = self.demote(victim.key, true).await;
                self.record(outcome, report);
            }
        }
    }

    /// Tiers above the high watermark shed LRU pages down to the low watermark.
    async fn pressure_pass(&self, now: Instant, report: &mut EvictionReport) {
        for &tier in &self.tiers {
            let Some(budget) = self.budgets.get(&Resource::TierCapacity(tier)) else {
                continue;
            };
            if budget.utilization() <= self.high_watermark {
                continue;
            }
            let target = (self.low_watermark * budget.ceiling() as f64) as u64;
            let excess = budget.usage().saturating_sub(target);
            let snapshot: Vec<PageEntry> =
                self.entries.iter().map(|e| e.value().clone()).collect();
            let selection = self.evictor.select_victims(
                snapshot.iter(),
                tier,
                now,
                VictimQuery {
                    min_idle: None,
                    bytes_needed: Some(excess),
                    max_count: self.eviction.max_victims_per_cycle,
                },
                self.floor_ledger(tier),
            );
            report.floor_protected += selection.floor_protected;
            debug!(tier = %tier, excess, victims = selection.victims.len(), "Pressure eviction");
            let allow_drop = self.is_coldest(tier);
            for victim in selection.victims {
                let outcome = self.demote(victim.key, allow_drop).await;
                self.record(outcome, report);
            }
        }
    }

    /// Get tier statistics for monitoring.
    pub fn tier_stats(&self) -> Vec<TierStats> {
        let mut counts: HashMap<Tier, usize> = HashMap::new();
        for entry in self.entries.iter() {
            if entry.state != PageState::Writing {
                *counts.entry(entry.tier).or_insert(0) += 1;
            }
        }
        self.tiers
            .iter()
            .map(|&tier| {
                let budget = self.budgets.get(&Resource::TierCapacity(tier));
                TierStats {
                    tier: Some(tier),
                    page_count: counts.get(&tier).copied().unwrap_or(0),
                    bytes_used: budget.as_ref().map(|b| b.usage()).unwrap_or(0),
                    capacity: budget.as_ref().map(|b| b.ceiling()).unwrap_or(0),
                }
            })
            .collect()
    }
}

impl PageLocator for CacheManager {
    fn page_size(&self, key: PageKey) -> Option<u64> {
        self.entries
            .get(&key)
            .filter(|e| e.state != PageState::Writing)
            .map(|e| e.logical_size)
    }

    fn cached_prefix(&self, keys: &[PageKey]) -> usize {
        self.lookup_prefix(keys)
    }

    fn on_device(&self, key: PageKey) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|e| e.tier == Tier::DeviceMemory && e.state != PageState::Writing)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("pages", &self.entries.len())
            .field("tiers", &self.tiers)
            .finish_non_exhaustive()
    }
}
