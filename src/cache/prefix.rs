//! Content-addressable page keys.
//!
//! A page key is a chained hash over the prompt prefix: each page's key is
//! seeded with the previous page's key, so two prompts share a key for page
//! `i` exactly when their first `(i + 1) * page_tokens` tokens match. The
//! chain starts from a salt, per tenant unless prefixes are shared globally.

use bytemuck::cast_slice;
use xxhash_rust::xxh3;

use crate::cache::page::PageKey;
use crate::scheduler::tenant::TenantId;

/// A token is a 32-bit unsigned integer.
pub type Token = u32;

/// Seed used for salts.
pub const XXH3_SEED: u64 = 1337;

/// Computes a hash of the data using the given seed.
pub fn compute_hash(data: &[u8], seed: u64) -> u64 {
    xxh3::xxh3_64_with_seed(data, seed)
}

/// Starting seed for a tenant's key chain.
pub fn chain_salt(tenant: &TenantId, share_across_tenants: bool) -> u64 {
    if share_across_tenants {
        XXH3_SEED
    } else {
        compute_hash(tenant.as_str().as_bytes(), XXH3_SEED)
    }
}

/// One page of a prompt, identified by its chained key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixPage {
    pub key: PageKey,
    pub token_start: usize,
    pub token_count: usize,
}

/// Split `tokens` into pages and compute each page's chained key.
///
/// The trailing partial page, if any, gets a key too; it only ever matches a
/// prompt with the identical tail.
pub fn prefix_pages(tokens: &[Token], page_tokens: usize, salt: u64) -> Vec<PrefixPage> {
    if page_tokens == 0 {
        return Vec::new();
    }
    let mut parent = salt;
    tokens
        .chunks(page_tokens)
        .enumerate()
        .map(|(i, chunk)| {
            let key = compute_hash(cast_slice(chunk), parent);
            parent = key;
            PrefixPage {
                key: PageKey(key),
                token_start: i * page_tokens,
                token_count: chunk.len(),
            }
        })
        .collect()
}
