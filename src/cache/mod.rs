//! Tiered KV page cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`page`]: KvPage, PageTable, Tier definitions
//! - [`prefix`]: Chained prefix keys over token pages
//! - [`store`]: Per-tier byte stores (memory, local files)
//! - [`manager`]: Page table that orchestrates placement, promotion and demotion
//! - [`evictor`]: Victim selection (LRU with tenant hot-set floors)
//! - [`compressor`]: Quantization and zstd compression/decompression

pub mod compressor;
pub mod evictor;
pub mod manager;
pub mod page;
pub mod prefix;
pub mod store;

pub use manager::{CacheError, CacheManager, EvictionReport, PutOutcome, TierStats};
pub use page::{KvPage, PageKey, PageTable, Tier};
