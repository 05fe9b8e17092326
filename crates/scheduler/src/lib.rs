//! Queued, resource-gated execution of per-element pipeline tasks.
//!
//! Elements flow through stages (pull, fetch, build, push); each stage is a
//! [`Queue`] declaring the resource tokens its jobs hold. Work runs on
//! worker tasks while a single owning loop applies completions, retries
//! transient failures, and keeps the authoritative cache size, scheduling
//! an eviction job when builds outgrow the quota.

pub mod element;
pub mod queue;
pub mod resources;
pub mod scheduler;

pub use element::{calculate_keys, BuildFailure, Element};
pub use queue::{
    ActionFuture, BuildQueue, ElementAction, FetchQueue, JobOutcome, PullQueue, PushQueue, Queue,
    QueueStatus, ReturnCode,
};
pub use resources::{ResourceType, Resources};
pub use scheduler::{FailedJob, PipelineResult, Scheduler};
