//! Transports and their simulated links.
//!
//! A transport declares which routes it can carry and whether an in-flight
//! send can be aborted. The simulated links model latency plus
//! size/bandwidth and can be marked unhealthy or stalled at runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{LinkConfig, TransferConfig};
use crate::transfer::job::{PageTransfer, Route};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{0} link is down")]
    LinkDown(&'static str),

    #[error("{0} cannot carry route {1}")]
    Unsupported(&'static str, String),

    #[error("send aborted")]
    Aborted,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this transport can carry `route` at all.
    fn is_usable(&self, route: &Route) -> bool;

    /// Whether cancelling the token stops a send in progress.
    fn supports_abort(&self) -> bool;

    /// Move `pages` along `route`, returning bytes moved.
    async fn send(
        &self,
        route: &Route,
        pages: &[PageTransfer],
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError>;
}

/// Latency plus serialization time.
#[derive(Debug, Clone, Copy)]
pub struct LinkModel {
    pub bandwidth_bytes_per_sec: u64,
    pub latency: Duration,
}

impl LinkModel {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            bandwidth_bytes_per_sec: config.bandwidth_bytes_per_sec.max(1),
            latency: Duration::from_micros(config.latency_us),
        }
    }

    pub fn duration_for(&self, bytes: u64) -> Duration {
        self.latency + Duration::from_secs_f64(bytes as f64 / self.bandwidth_bytes_per_sec as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Zero-copy between device memories, any host.
    Rdma,
    /// Device-to-device within one host. Cannot be aborted once launched.
    Collective,
    /// Host network. Carries every route.
    Network,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Rdma => "rdma",
            TransportKind::Collective => "collective",
            TransportKind::Network => "network",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rdma" => Some(TransportKind::Rdma),
            "collective" => Some(TransportKind::Collective),
            "network" => Some(TransportKind::Network),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct SimulatedTransport {
    kind: TransportKind,
    link: LinkModel,
    healthy: AtomicBool,
    stalled: AtomicBool,
}

impl SimulatedTransport {
    pub fn new(kind: TransportKind, link: LinkModel) -> Self {
        Self {
            kind,
            link,
            healthy: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
        }
    }

    /// Build the enabled transports in configured order.
    pub fn from_config(config: &TransferConfig) -> Vec<Self> {
        config
            .engine_order
            .iter()
            .filter_map(|name| TransportKind::from_name(name))
            .filter_map(|kind| {
                let link = match kind {
                    TransportKind::Rdma => &config.rdma,
                    TransportKind::Collective => &config.collective,
                    TransportKind::Network => &config.network,
                };
                link.enabled
                    .then(|| Self::new(kind, LinkModel::from_config(link)))
            })
            .collect()
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// An unhealthy link fails every send.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// A stalled link never completes a send.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), TransportError> {
        let sleep = async {
            if self.stalled.load(Ordering::Acquire) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(duration).await;
        };
        if !self.supports_abort() {
            sleep.await;
            return Ok(());
        }
        tokio::select! {
            _ = sleep => Ok(()),
            _ = cancel.cancelled() => Err(TransportError::Aborted),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn is_usable(&self, route: &Route) -> bool {
        match self.kind {
            TransportKind::Rdma => route.device_to_device(),
            TransportKind::Collective => route.device_to_device() && route.same_host(),
            TransportKind::Network => true,
        }
    }

    fn supports_abort(&self) -> bool {
        self.kind != TransportKind::Collective
    }

    async fn send(
        &self,
        route: &Route,
        pages: &[PageTransfer],
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        if !self.is_usable(route) {
            return Err(TransportError::Unsupported(self.name(), route.to_string()));
        }
        if !self.healthy.load(Ordering::Acquire) {
            // A dead link still costs one round trip to notice.
            self.wait(self.link.latency, cancel).await?;
            return Err(TransportError::LinkDown(self.name()));
        }
        let bytes: u64 = pages.iter().map(|p| p.bytes).sum();
        self.wait(self.link.duration_for(bytes), cancel).await?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::page::PageKey;
    use crate::placement::worker::WorkerId;
    use crate::transfer::job::Location;

    fn link() -> LinkModel {
        LinkModel {
            bandwidth_bytes_per_sec: 1_000_000,
            latency: Duration::from_millis(1),
        }
    }

    fn cross_host() -> Route {
        Route::new(
            Location::device(WorkerId::from("p0"), "a"),
            Location::device(WorkerId::from("d0"), "b"),
        )
    }

    #[test]
    fn test_link_model() {
        assert_eq!(link().duration_for(1_000_000), Duration::from_millis(1001));
    }

    #[test]
    fn test_capabilities() {
        let rdma = SimulatedTransport::new(TransportKind::Rdma, link());
        let coll = SimulatedTransport::new(TransportKind::Collective, link());
        let net = SimulatedTransport::new(TransportKind::Network, link());
        let spill = Route::new(Location::storage("a"), Location::device(WorkerId::from("d0"), "a"));

        assert!(rdma.is_usable(&cross_host()));
        assert!(!coll.is_usable(&cross_host()));
        assert!(!rdma.is_usable(&spill));
        assert!(net.is_usable(&spill));
        assert!(!coll.supports_abort());
    }

    #[test]
    fn test_from_config_skips_disabled() {
        let mut config = TransferConfig::default();
        config.collective.enabled = false;
        let kinds: Vec<_> = SimulatedTransport::from_config(&config)
            .iter()
            .map(|t| t.kind())
            .collect();
        assert_eq!(kinds, vec![TransportKind::Rdma, TransportKind::Network]);
    }

    #[tokio::test]
    async fn test_unhealthy_link_fails() {
        let rdma = SimulatedTransport::new(TransportKind::Rdma, link());
        rdma.set_healthy(false);
        let pages = [PageTransfer { key: PageKey(1), bytes: 100 }];
        let err = rdma
            .send(&cross_host(), &pages, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::LinkDown("rdma"));
    }

    #[tokio::test]
    async fn test_abort_stops_stalled_send() {
        let rdma = SimulatedTransport::new(TransportKind::Rdma, link());
        rdma.set_stalled(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pages = [PageTransfer { key: PageKey(1), bytes: 100 }];
        assert_eq!(
            rdma.send(&cross_host(), &pages, &cancel).await,
            Err(TransportError::Aborted)
        );
    }
}
