//! Tenants: identity and the fair-share parameters read from configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{RateLimitConfig, TenantConfig};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Arc<str>);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tenant as the scheduler sees it. Immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: TenantId,
    /// Fair-share weight (> 0).
    pub weight: f64,
    pub ttft_target: Option<Duration>,
    /// Bytes per tier eviction leaves alone.
    pub hot_set_bytes: u64,
    pub max_concurrency: u64,
    pub rate_limit: Option<RateLimitConfig>,
}

impl From<&TenantConfig> for Tenant {
    fn from(config: &TenantConfig) -> Self {
        Self {
            id: TenantId::from(config.id.as_str()),
            weight: config.weight,
            ttft_target: config.ttft_target(),
            hot_set_bytes: config.hot_set_bytes,
            max_concurrency: config.max_concurrency,
            rate_limit: config.rate_limit.clone(),
        }
    }
}
