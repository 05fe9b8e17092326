//! The cooperative scheduler.
//!
//! A single owning loop holds all mutable scheduler state (elements, queue
//! bookkeeping, the authoritative cache size) and reacts to messages from
//! worker tasks. Workers run job bodies and report back over a channel;
//! they never share mutable state with each other. Cancellation is a token
//! checked at suspension points.

use crate::element::Element;
use crate::queue::{JobOutcome, Queue, QueueStatus, ReturnCode};
use crate::resources::{ResourceType, Resources};
use buildstream_artifact::{ArtifactCache, Keyed};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum SchedulerMsg {
    JobComplete {
        stage: usize,
        element: usize,
        outcome: JobOutcome,
    },
    /// Running cache-size report from a cleanup worker
    UpdateCacheSize(u64),
    CleanupComplete(Result<u64, String>),
}

/// A job that failed permanently, with its original message and log.
#[derive(Debug)]
pub struct FailedJob {
    pub action: &'static str,
    pub element: String,
    pub message: Option<String>,
    pub logfile: Option<PathBuf>,
}

/// What one pipeline run did.
#[derive(Debug, Default)]
pub struct PipelineResult {
    pub processed: Vec<(&'static str, String)>,
    pub skipped: Vec<(&'static str, String)>,
    pub failed: Vec<FailedJob>,
    pub terminated: bool,
}

/// Per-element pipeline position.
struct Progress {
    stage: usize,
    tries: u32,
    active: bool,
    halted: bool,
}

/// Drives elements through a list of queues across a pool of worker tasks.
pub struct Scheduler {
    elements: Vec<Element>,
    artifacts: ArtifactCache,
    resources: Resources,
    token: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(elements: Vec<Element>, artifacts: ArtifactCache) -> Self {
        Self {
            elements,
            artifacts,
            resources: Resources::new(4, 10, 4),
            token: CancellationToken::new(),
        }
    }

    /// Override worker pool limits.
    #[must_use]
    pub fn with_resources(mut self, builders: usize, fetchers: usize, pushers: usize) -> Self {
        self.resources = Resources::new(builders, fetchers, pushers);
        self
    }

    #[must_use]
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn elements_mut(&mut self) -> &mut [Element] {
        &mut self.elements
    }

    pub fn artifacts_mut(&mut self) -> &mut ArtifactCache {
        &mut self.artifacts
    }

    /// Token observed by running jobs; cancelling it requests cooperative
    /// termination.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Mark elements as required for this session and pin their artifacts.
    /// Must run before any cleanup job, or eviction may remove a needed
    /// artifact.
    pub fn mark_required(&mut self, ids: &[usize]) {
        for &id in ids {
            self.elements[id].required = true;
        }
        let keyed = ids.iter().map(|&id| &self.elements[id] as &dyn Keyed);
        self.artifacts.mark_required_elements(keyed);
    }

    /// Run the plan through the queues until every element has either
    /// passed all stages, failed, or cannot make progress.
    pub async fn run(&mut self, mut queues: Vec<Box<dyn Queue>>, plan: &[usize]) -> PipelineResult {
        let (tx, mut rx) = mpsc::unbounded_channel::<SchedulerMsg>();
        let mut progress: HashMap<usize, Progress> = HashMap::new();
        let mut result = PipelineResult::default();
        let mut active_jobs = 0usize;
        let mut cleanup_running = false;

        for &id in plan {
            progress.insert(
                id,
                Progress {
                    stage: 0,
                    tries: 0,
                    active: false,
                    halted: false,
                },
            );
            enter_stage(&mut queues, &self.elements, id, &mut progress, &mut result);
        }

        loop {
            if !self.token.is_cancelled() {
                self.schedule_pass(
                    &mut queues,
                    &mut progress,
                    &mut result,
                    &tx,
                    &mut active_jobs,
                );
            }

            if active_jobs == 0 && !cleanup_running {
                break;
            }

            let Some(msg) = rx.recv().await else { break };
            match msg {
                SchedulerMsg::JobComplete {
                    stage,
                    element,
                    outcome,
                } => {
                    active_jobs -= 1;
                    self.resources.release(queues[stage].resources());
                    let entry = progress
                        .get_mut(&element)
                        .expect("completed job belongs to a scheduled element");
                    entry.active = false;

                    let element_name = self.elements[element].name.clone();
                    match outcome.code {
                        ReturnCode::Ok => {
                            queues[stage].done(&mut self.elements[element], &outcome);
                            result
                                .processed
                                .push((queues[stage].action_name(), element_name));
                            entry.stage += 1;
                            entry.tries = 0;
                            enter_stage(&mut queues, &self.elements, element, &mut progress, &mut result);

                            if let Some(size) = outcome.artifact_size {
                                if let Err(e) = self.artifacts.add_artifact_size(size) {
                                    warn!(error = %e, "Failed to account artifact size");
                                }
                                self.check_cache_size(&tx, &mut cleanup_running);
                            }
                        }
                        ReturnCode::Fail => {
                            entry.tries += 1;
                            if entry.tries > queues[stage].max_retries() {
                                warn!(
                                    action = queues[stage].action_name(),
                                    element = %element_name,
                                    tries = entry.tries,
                                    "Job failed permanently after retries"
                                );
                                result.failed.push(FailedJob {
                                    action: queues[stage].action_name(),
                                    element: element_name,
                                    message: outcome.message,
                                    logfile: outcome.logfile,
                                });
                                entry.halted = true;
                            } else {
                                debug!(
                                    action = queues[stage].action_name(),
                                    element = %element_name,
                                    tries = entry.tries,
                                    "Retrying failed job"
                                );
                            }
                        }
                        ReturnCode::PermFail => {
                            result.failed.push(FailedJob {
                                action: queues[stage].action_name(),
                                element: element_name,
                                message: outcome.message,
                                logfile: outcome.logfile,
                            });
                            entry.halted = true;
                        }
                        ReturnCode::Skipped => {
                            result
                                .skipped
                                .push((queues[stage].action_name(), element_name));
                            entry.stage += 1;
                            entry.tries = 0;
                            enter_stage(&mut queues, &self.elements, element, &mut progress, &mut result);
                        }
                        ReturnCode::Terminated => {
                            result.terminated = true;
                            entry.halted = true;
                        }
                    }
                }
                SchedulerMsg::UpdateCacheSize(size) => {
                    if let Err(e) = self.artifacts.set_cache_size(size, false) {
                        warn!(error = %e, "Failed to apply cache size update");
                    }
                }
                SchedulerMsg::CleanupComplete(cleanup_result) => {
                    cleanup_running = false;
                    self.resources.release_exclusive(ResourceType::Cache);
                    match cleanup_result {
                        Ok(size) => {
                            info!(size, "Cleanup job finished");
                            if let Err(e) = self.artifacts.set_cache_size(size, false) {
                                warn!(error = %e, "Failed to apply cleaned cache size");
                            }
                        }
                        Err(message) => {
                            result.failed.push(FailedJob {
                                action: "Clean",
                                element: "cache".into(),
                                message: Some(message),
                                logfile: None,
                            });
                        }
                    }
                }
            }
        }

        result.terminated |= self.token.is_cancelled();
        result
    }

    /// Dispatch every ready job the resource tokens allow.
    fn schedule_pass(
        &mut self,
        queues: &mut [Box<dyn Queue>],
        progress: &mut HashMap<usize, Progress>,
        result: &mut PipelineResult,
        tx: &mpsc::UnboundedSender<SchedulerMsg>,
        active_jobs: &mut usize,
    ) {
        for stage in 0..queues.len() {
            let candidates: Vec<usize> = progress
                .iter()
                .filter(|(_, p)| p.stage == stage && !p.active && !p.halted)
                .map(|(&id, _)| id)
                .collect();

            for id in candidates {
                match queues[stage].status(&self.elements[id], &self.elements) {
                    QueueStatus::Wait => {}
                    QueueStatus::Skip => {
                        result
                            .skipped
                            .push((queues[stage].action_name(), self.elements[id].name.clone()));
                        let entry = progress.get_mut(&id).expect("candidate has progress");
                        entry.stage += 1;
                        entry.tries = 0;
                        enter_stage(queues, &self.elements, id, progress, result);
                    }
                    QueueStatus::Ready => {
                        if !self.resources.reserve(queues[stage].resources()) {
                            continue;
                        }
                        debug!(
                            action = queues[stage].action_name(),
                            element = %self.elements[id].name,
                            "Starting job"
                        );
                        progress.get_mut(&id).expect("candidate has progress").active = true;
                        *active_jobs += 1;

                        let fut = queues[stage].spawn_action(&self.elements[id]);
                        let tx = tx.clone();
                        let token = self.token.clone();
                        tokio::spawn(async move {
                            let outcome = tokio::select! {
                                _ = token.cancelled() => JobOutcome::terminated(),
                                outcome = fut => outcome,
                            };
                            let _ = tx.send(SchedulerMsg::JobComplete {
                                stage,
                                element: id,
                                outcome,
                            });
                        });
                    }
                }
            }
        }
    }

    /// Schedule a cleanup job when the cache has grown past its quota. The
    /// job holds the cache token exclusively and reports its progress back
    /// through the message channel.
    fn check_cache_size(
        &mut self,
        tx: &mpsc::UnboundedSender<SchedulerMsg>,
        cleanup_running: &mut bool,
    ) {
        if *cleanup_running {
            return;
        }
        match self.artifacts.full() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "Failed to check cache size");
                return;
            }
        }
        if !self.resources.reserve_exclusive(ResourceType::Cache) {
            return;
        }
        *cleanup_running = true;

        info!("Cache over quota, scheduling cleanup");
        let cas = self.artifacts.cas().clone();
        let quota = self.artifacts.quota_snapshot();
        let required = self.artifacts.required_keys();
        let tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut cleaner = ArtifactCache::with_quota(cas, quota);
            cleaner.mark_required_keys(required);

            let progress_tx = tx.clone();
            let mut report = move |size: u64| {
                let _ = progress_tx.send(SchedulerMsg::UpdateCacheSize(size));
            };
            let outcome = cleaner.clean(Some(&mut report));
            let _ = tx.send(SchedulerMsg::CleanupComplete(
                outcome.map_err(|e| e.to_string()),
            ));
        });
    }
}

/// Apply the enqueue hook of the element's current stage, advancing or
/// halting it without dispatching a job where the hook short-circuits.
fn enter_stage(
    queues: &mut [Box<dyn Queue>],
    elements: &[Element],
    id: usize,
    progress: &mut HashMap<usize, Progress>,
    result: &mut PipelineResult,
) {
    loop {
        let entry = progress.get_mut(&id).expect("entered element has progress");
        if entry.halted || entry.stage >= queues.len() {
            return;
        }
        let stage = entry.stage;

        let Some(outcome) = queues[stage].enqueue_hook(&elements[id]) else {
            return;
        };

        let entry = progress.get_mut(&id).expect("entered element has progress");
        match outcome.code {
            ReturnCode::Ok => {
                result
                    .processed
                    .push((queues[stage].action_name(), elements[id].name.clone()));
                entry.stage += 1;
            }
            ReturnCode::Skipped => {
                result
                    .skipped
                    .push((queues[stage].action_name(), elements[id].name.clone()));
                entry.stage += 1;
            }
            ReturnCode::Fail | ReturnCode::PermFail | ReturnCode::Terminated => {
                result.failed.push(FailedJob {
                    action: queues[stage].action_name(),
                    element: elements[id].name.clone(),
                    message: outcome.message,
                    logfile: outcome.logfile,
                });
                entry.halted = true;
                return;
            }
        }
    }
}
