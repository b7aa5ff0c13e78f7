pub mod admission;
pub mod queue;
pub mod ratelimit;
pub mod sequence;
pub mod tenant;

pub use admission::{Decision, Scheduler, SchedulerError, Submission, Usage};
pub use sequence::{Dispatch, Phase, RejectReason, SequenceId, SequenceRequest, SequenceStatus};
pub use tenant::{Tenant, TenantId};
