//! Sequence execution.
//!
//! - [`backend`]: Execution backends for prefill and decode workers
//! - [`engine`]: Serving engine that drives admitted sequences end to end

pub mod backend;
pub mod engine;

pub use backend::{BackendError, ExecutionBackend, SimulatedBackend};
pub use engine::{EngineParts, ServingEngine};
