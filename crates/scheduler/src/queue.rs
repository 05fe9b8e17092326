//! Queues: the staged pipeline an element moves through.
//!
//! Each queue declares the resource tokens its jobs hold, decides per
//! element whether a job is ready, and provides the action that runs off
//! the main thread. Completion hooks run back on the owning loop with
//! mutable access to the element.

use crate::element::Element;
use crate::resources::ResourceType;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Whether an element's job may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Dispatch now (subject to resource tokens)
    Ready,
    /// Not yet; re-evaluated when other jobs complete
    Wait,
    /// Nothing to do in this queue; advance the element
    Skip,
}

/// Result code of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    /// A temporary failure; retried up to the queue's retry budget
    Fail,
    /// A permanent failure; never retried
    PermFail,
    Skipped,
    Terminated,
}

/// What a job produced, flowing back to the owning loop.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub code: ReturnCode,
    /// Bytes a successful job added to the cache, if any
    pub artifact_size: Option<u64>,
    pub message: Option<String>,
    pub logfile: Option<PathBuf>,
}

impl JobOutcome {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: ReturnCode::Ok,
            artifact_size: None,
            message: None,
            logfile: None,
        }
    }

    #[must_use]
    pub fn ok_with_size(artifact_size: u64) -> Self {
        Self {
            artifact_size: Some(artifact_size),
            ..Self::ok()
        }
    }

    #[must_use]
    pub fn skipped() -> Self {
        Self {
            code: ReturnCode::Skipped,
            ..Self::ok()
        }
    }

    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            code: ReturnCode::Fail,
            artifact_size: None,
            message: Some(message.into()),
            logfile: None,
        }
    }

    #[must_use]
    pub fn perm_fail(message: impl Into<String>) -> Self {
        Self {
            code: ReturnCode::PermFail,
            ..Self::fail(message)
        }
    }

    #[must_use]
    pub fn terminated() -> Self {
        Self {
            code: ReturnCode::Terminated,
            ..Self::ok()
        }
    }
}

/// A job body, run on a worker task.
pub type ActionFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

/// Factory producing a job body from an element snapshot.
pub type ElementAction = Arc<dyn Fn(&Element) -> ActionFuture + Send + Sync>;

/// One stage of the pipeline.
pub trait Queue: Send {
    fn action_name(&self) -> &'static str;
    fn complete_name(&self) -> &'static str;

    /// Resource tokens one job of this queue holds while running.
    fn resources(&self) -> &[ResourceType] {
        &[]
    }

    /// Retry budget for `ReturnCode::Fail` outcomes.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Called when an element enters the queue. Returning an outcome
    /// bypasses dispatch entirely (the cached-failure fast path).
    fn enqueue_hook(&mut self, _element: &Element) -> Option<JobOutcome> {
        None
    }

    /// Whether the element's job may run yet.
    fn status(&self, element: &Element, elements: &[Element]) -> QueueStatus;

    /// Produce the job body; runs off the main thread.
    fn spawn_action(&self, element: &Element) -> ActionFuture;

    /// Completion hook for successful jobs, on the owning loop.
    fn done(&mut self, element: &mut Element, outcome: &JobOutcome);
}

/// Pulls already-built artifacts from remote caches.
pub struct PullQueue {
    action: ElementAction,
}

impl PullQueue {
    pub fn new(action: ElementAction) -> Self {
        Self { action }
    }
}

impl Queue for PullQueue {
    fn action_name(&self) -> &'static str {
        "Pull"
    }

    fn complete_name(&self) -> &'static str {
        "Pulled"
    }

    fn resources(&self) -> &[ResourceType] {
        &[ResourceType::Download, ResourceType::Cache]
    }

    fn status(&self, element: &Element, _elements: &[Element]) -> QueueStatus {
        if element.cached_success {
            QueueStatus::Skip
        } else {
            QueueStatus::Ready
        }
    }

    fn spawn_action(&self, element: &Element) -> ActionFuture {
        (self.action)(element)
    }

    fn done(&mut self, element: &mut Element, outcome: &JobOutcome) {
        // The action reports Skipped when no remote had the artifact
        if outcome.code == ReturnCode::Ok {
            element.cached_success = true;
        }
    }
}

/// Fetches element sources.
pub struct FetchQueue {
    action: ElementAction,
}

impl FetchQueue {
    pub fn new(action: ElementAction) -> Self {
        Self { action }
    }
}

impl Queue for FetchQueue {
    fn action_name(&self) -> &'static str {
        "Fetch"
    }

    fn complete_name(&self) -> &'static str {
        "Fetched"
    }

    fn resources(&self) -> &[ResourceType] {
        &[ResourceType::Download]
    }

    fn max_retries(&self) -> u32 {
        2
    }

    fn status(&self, element: &Element, _elements: &[Element]) -> QueueStatus {
        if element.cached_success || element.sources_cached {
            QueueStatus::Skip
        } else {
            QueueStatus::Ready
        }
    }

    fn spawn_action(&self, element: &Element) -> ActionFuture {
        (self.action)(element)
    }

    fn done(&mut self, element: &mut Element, _outcome: &JobOutcome) {
        element.sources_cached = true;
    }
}

/// Assembles elements in dependency order.
pub struct BuildQueue {
    action: ElementAction,
    /// Elements whose cached failure was already reported once
    tried: HashSet<usize>,
}

impl BuildQueue {
    pub fn new(action: ElementAction) -> Self {
        Self {
            action,
            tried: HashSet::new(),
        }
    }
}

impl Queue for BuildQueue {
    fn action_name(&self) -> &'static str {
        "Build"
    }

    fn complete_name(&self) -> &'static str {
        "Built"
    }

    fn resources(&self) -> &[ResourceType] {
        &[ResourceType::Process, ResourceType::Cache]
    }

    fn enqueue_hook(&mut self, element: &Element) -> Option<JobOutcome> {
        // An element known to have failed before is reported immediately,
        // preserving the original error and log path, without running a job
        let failure = element.cached_failure.as_ref()?;
        if !self.tried.insert(element.id) {
            return None;
        }
        debug!(element = %element.name, "Bypassing build of known failure");
        Some(JobOutcome {
            code: ReturnCode::PermFail,
            artifact_size: None,
            message: Some(failure.description.clone()),
            logfile: failure.logfile.clone(),
        })
    }

    fn status(&self, element: &Element, elements: &[Element]) -> QueueStatus {
        if !element.required {
            // Not currently required, but it may be requested later
            return QueueStatus::Wait;
        }
        if element.cached_success {
            return QueueStatus::Skip;
        }
        if !element.buildable(elements) {
            return QueueStatus::Wait;
        }
        QueueStatus::Ready
    }

    fn spawn_action(&self, element: &Element) -> ActionFuture {
        (self.action)(element)
    }

    fn done(&mut self, element: &mut Element, _outcome: &JobOutcome) {
        element.cached_success = true;
    }
}

/// Pushes built artifacts to every push-enabled remote.
pub struct PushQueue {
    action: ElementAction,
}

impl PushQueue {
    pub fn new(action: ElementAction) -> Self {
        Self { action }
    }
}

impl Queue for PushQueue {
    fn action_name(&self) -> &'static str {
        "Push"
    }

    fn complete_name(&self) -> &'static str {
        "Pushed"
    }

    fn resources(&self) -> &[ResourceType] {
        &[ResourceType::Upload]
    }

    fn status(&self, element: &Element, _elements: &[Element]) -> QueueStatus {
        if element.cached_success {
            QueueStatus::Ready
        } else {
            // Skip elements which never became cached; their failure is
            // already reported by an earlier queue
            QueueStatus::Skip
        }
    }

    fn spawn_action(&self, element: &Element) -> ActionFuture {
        (self.action)(element)
    }

    fn done(&mut self, _element: &mut Element, _outcome: &JobOutcome) {}
}
