//! Page movement between workers and tiers.
//!
//! - [`job`]: routes, jobs and outcomes
//! - [`transport`]: the transport trait and simulated links
//! - [`engine`]: ordered fallback across transports

pub mod engine;
pub mod job;
pub mod transport;

pub use engine::{TransferEngine, TransferRecord, TransportStats};
pub use job::{JobState, Location, Medium, PageTransfer, Route, TransferJob, TransferOutcome};
pub use transport::{LinkModel, SimulatedTransport, Transport, TransportError, TransportKind};
