//! Transfer jobs and the routes they travel.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::page::PageKey;
use crate::placement::worker::WorkerId;
use crate::scheduler::sequence::SequenceId;

/// Where an endpoint keeps its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Device,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub host: String,
    /// Owning worker, for device endpoints.
    pub worker: Option<WorkerId>,
    pub medium: Medium,
}

impl Location {
    pub fn device(worker: WorkerId, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            worker: Some(worker),
            medium: Medium::Device,
        }
    }

    pub fn storage(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            worker: None,
            medium: Medium::Storage,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.worker, self.medium) {
            (Some(worker), _) => write!(f, "{worker}@{}", self.host),
            (None, Medium::Device) => write!(f, "device@{}", self.host),
            (None, Medium::Storage) => write!(f, "storage@{}", self.host),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub source: Location,
    pub destination: Location,
}

impl Route {
    pub fn new(source: Location, destination: Location) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub fn same_host(&self) -> bool {
        self.source.host == self.destination.host
    }

    pub fn device_to_device(&self) -> bool {
        self.source.medium == Medium::Device && self.destination.medium == Medium::Device
    }

    pub fn touches_storage(&self) -> bool {
        self.source.medium == Medium::Storage || self.destination.medium == Medium::Storage
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// A page and the bytes it puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageTransfer {
    pub key: PageKey,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Debug)]
pub struct TransferJob {
    pub id: Uuid,
    pub sequence: Option<SequenceId>,
    pub route: Route,
    pub pages: Vec<PageTransfer>,
    pub state: JobState,
    /// Transport attempts made so far.
    pub attempts: u32,
    /// Transport that carried the job, once it succeeded.
    pub transport: Option<&'static str>,
    pub cancel: CancellationToken,
}

impl TransferJob {
    pub fn new(route: Route, pages: Vec<PageTransfer>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: None,
            route,
            pages,
            state: JobState::Pending,
            attempts: 0,
            transport: None,
            cancel,
        }
    }

    pub fn for_sequence(mut self, id: SequenceId) -> Self {
        self.sequence = Some(id);
        self
    }

    pub fn total_bytes(&self) -> u64 {
        self.pages.iter().map(|p| p.bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Succeeded {
        transport: &'static str,
        bytes: u64,
        latency: Duration,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded { .. })
    }
}
