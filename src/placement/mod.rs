pub mod router;
pub mod worker;

pub use router::{PageLocator, Placement, PlacementError, Router};
pub use worker::{Role, Worker, WorkerId, WorkerRegistry};
