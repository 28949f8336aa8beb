//! In-process background job system.
//!
//! ## Design
//!
//! - Bounded collection; admission fails closed at capacity
//! - Highest priority among ready jobs runs first, one at a time
//! - Failures back off exponentially (`2^attempts × base`) up to `max_attempts`
//! - A retention sweep purges jobs older than the window, whatever their state
//! - Trigger rules enqueue periodic work, including per-user fan-out
//!
//! ## Components
//!
//! - `Job` / `JobPayload`: typed unit of work and its retry state
//! - `JobQueue`: the bounded collection and selection order
//! - `HandlerRegistry`: job type to `JobHandler`
//! - `Scheduler`: admission, worker loop, timeouts and retry policy
//! - `RetentionSweeper`, `TriggerDriver`: independent timers feeding the scheduler

pub mod enqueue;
pub mod handlers;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sweeper;
pub mod triggers;
pub mod types;

pub use tokio_util::sync::CancellationToken;
pub use enqueue::Jobs;
pub use handlers::register_default_handlers;
pub use queue::{JobQueue, QueueError};
pub use registry::{FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use scheduler::{Scheduler, SchedulerStats};
pub use sweeper::{RetentionSweeper, SweeperHandle};
pub use triggers::{
    Cadence, FireReport, TriggerAction, TriggerDriver, TriggerError, TriggerHandle, TriggerRule,
    UserSource, default_rules,
};
pub use types::{
    Admission, AnalyticsKind, Job, JobId, JobOptions, JobPayload, JobState, JobSummary, JobType,
    NotificationPriority, RejectReason,
};
