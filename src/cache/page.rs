//! KV page types and per-sequence page tables.
//!
//! A page holds the attention state for a fixed span of prompt tokens.
//! Pages are the unit of sharing, placement, and movement between tiers.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::prefix::compute_hash;
use crate::scheduler::tenant::TenantId;

/// Identifies which storage tier a page currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier 0: accelerator memory (hot).
    DeviceMemory,
    /// Tier 1: host RAM (warm).
    HostMemory,
    /// Tier 2: local fast storage (cool).
    LocalStorage,
    /// Tier 3: remote object storage (cold).
    RemoteObject,
}

impl Tier {
    /// All tiers, fastest first.
    pub const ALL: [Tier; 4] = [
        Tier::DeviceMemory,
        Tier::HostMemory,
        Tier::LocalStorage,
        Tier::RemoteObject,
    ];

    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::DeviceMemory => 0,
            Tier::HostMemory => 1,
            Tier::LocalStorage => 2,
            Tier::RemoteObject => 3,
        }
    }

    /// Returns the next slower tier for demotion, or None if already coldest.
    pub fn demote(&self) -> Option<Tier> {
        match self {
            Tier::DeviceMemory => Some(Tier::HostMemory),
            Tier::HostMemory => Some(Tier::LocalStorage),
            Tier::LocalStorage => Some(Tier::RemoteObject),
            Tier::RemoteObject => None,
        }
    }

    /// Returns the next faster tier for promotion, or None if already hottest.
    pub fn promote(&self) -> Option<Tier> {
        match self {
            Tier::DeviceMemory => None,
            Tier::HostMemory => Some(Tier::DeviceMemory),
            Tier::LocalStorage => Some(Tier::HostMemory),
            Tier::RemoteObject => Some(Tier::LocalStorage),
        }
    }

    /// Storage tiers survive a process restart.
    pub fn is_durable(&self) -> bool {
        matches!(self, Tier::LocalStorage | Tier::RemoteObject)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::DeviceMemory => "device",
            Tier::HostMemory => "host",
            Tier::LocalStorage => "local",
            Tier::RemoteObject => "remote",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The quantization / storage format of a page's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    /// Full precision FP16 (native device format).
    Fp16,
    /// Group-wise symmetric int8 with an FP16 scale per group.
    Int8,
    /// Int8 + zstd compressed (object-store format).
    Int8Zstd,
}

impl PageFormat {
    /// Bytes per element for this format (approximate).
    pub fn bytes_per_element(&self) -> f64 {
        match self {
            PageFormat::Fp16 => 2.0,
            PageFormat::Int8 => 1.0625, // 1 byte + 2-byte scale per 32 elements
            PageFormat::Int8Zstd => 0.8,
        }
    }
}

/// Content-addressable page key: a chained hash of the prompt prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageKey(pub u64);

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A freshly produced page, as emitted by prefill.
///
/// `data` is the FP16 representation; the cache re-encodes it per tier.
#[derive(Debug, Clone)]
pub struct KvPage {
    pub key: PageKey,
    pub tenant: TenantId,
    pub token_start: usize,
    pub token_count: usize,
    pub data: Bytes,
}

impl KvPage {
    pub fn new(
        key: PageKey,
        tenant: TenantId,
        token_start: usize,
        token_count: usize,
        data: Bytes,
    ) -> Self {
        Self {
            key,
            tenant,
            token_start,
            token_count,
            data,
        }
    }

    /// Checksum of the FP16 content. Identical for every producer of the same key.
    pub fn content_checksum(&self) -> u64 {
        compute_hash(&self.data, 0)
    }

    pub fn logical_size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Lifecycle of a page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// First copy is being written; not yet readable.
    Writing,
    /// Readable in `tier`.
    Ready,
    /// Being copied to another tier; still readable from `tier`.
    Moving,
}

/// Page-table entry for one cached page.
#[derive(Debug, Clone)]
pub struct PageEntry {
    pub key: PageKey,
    pub tenant: TenantId,
    pub token_count: usize,

    /// Tier holding the authoritative copy.
    pub tier: Tier,

    /// Representation in `tier`.
    pub format: PageFormat,

    /// Bytes occupied in `tier`.
    pub stored_size: u64,

    /// FP16 size.
    pub logical_size: u64,

    /// Checksum of the FP16 content the page was created with.
    pub content_checksum: u64,

    /// Checksum of the bytes as stored in `tier`.
    pub stored_checksum: u64,

    /// Sequences currently using this page.
    pub ref_count: u32,

    pub pinned: bool,
    pub state: PageState,
    pub created: Instant,
    pub last_access: Instant,
    pub access_count: u64,

    /// Set after a failed tier write; no demotion is attempted before it passes.
    pub cooldown_until: Option<Instant>,
}

impl PageEntry {
    /// Record an access.
    pub fn touch(&mut self, now: Instant) {
        self.last_access = now;
        self.access_count += 1;
    }

    /// Time since last access.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }

    pub fn cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Whether ordinary eviction may move or drop this page.
    pub fn is_evictable(&self, now: Instant) -> bool {
        self.state == PageState::Ready && !self.pinned && self.ref_count == 0 && !self.cooling(now)
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            key: self.key,
            tenant: self.tenant.clone(),
            tier: self.tier,
            format: self.format,
            stored_size: self.stored_size,
            logical_size: self.logical_size,
            ref_count: self.ref_count,
            pinned: self.pinned,
            state: self.state,
        }
    }
}

/// Serializable snapshot of a page-table entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageInfo {
    pub key: PageKey,
    pub tenant: TenantId,
    pub tier: Tier,
    pub format: PageFormat,
    pub stored_size: u64,
    pub logical_size: u64,
    pub ref_count: u32,
    pub pinned: bool,
    pub state: PageState,
}

/// The page table maps a sequence's token positions to page keys.
///
/// Keys are ordered by prefix position: page `i` covers tokens
/// `[i * page_tokens, (i + 1) * page_tokens)`.
#[derive(Debug, Clone, Default)]
pub struct PageTable {
    pages: Vec<PageKey>,
    total_tokens: usize,
    page_tokens: usize,
}

impl PageTable {
    /// Create a new empty page table.
    pub fn new(page_tokens: usize) -> Self {
        Self {
            pages: Vec::new(),
            total_tokens: 0,
            page_tokens,
        }
    }

    /// Add a page to the end of the sequence.
    pub fn push(&mut self, key: PageKey, token_count: usize) {
        self.pages.push(key);
        self.total_tokens += token_count;
    }

    /// Get the page that covers a given token position.
    pub fn page_for_token(&self, token_pos: usize) -> Option<PageKey> {
        if token_pos >= self.total_tokens || self.page_tokens == 0 {
            return None;
        }
        self.pages.get(token_pos / self.page_tokens).copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn keys(&self) -> &[PageKey] {
        &self.pages
    }
}
