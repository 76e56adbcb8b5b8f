//! Top-level control loop: replay a learned route when one is usable,
//! explore with the provider chain otherwise, and learn from explorations
//! that succeed.
//!
//! Route health bookkeeping:
//! - a completed run resets `failure_count` (a replay also bumps
//!   `success_count`);
//! - a replay that falls through to exploration costs exactly one failure,
//!   persisted only if the exploration does not produce a replacement route;
//! - a cancelled run persists nothing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::RouteCompiler;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::executor::{ActionExecutor, SessionFactory};
use crate::provider::ProviderChain;
use crate::replayer::RouteReplayer;
use crate::store::RouteStore;
use crate::types::{
    Action, ActionProposal, ActionResult, AgentState, Check, Decision, ExplorationTrace,
    HistoryEntry, ObservedState, Route, RunMode, RunReport, StepRef, Task, TraceEntry,
};

pub struct AgentOrchestrator {
    sessions: Arc<dyn SessionFactory>,
    chain: ProviderChain,
    store: Arc<dyn RouteStore>,
    compiler: RouteCompiler,
    config: AgentConfig,
    active: Arc<Mutex<HashSet<String>>>,
    events: Option<broadcast::Sender<AgentEvent>>,
}

/// Exclusive claim on a workflow id, taken by [`AgentOrchestrator::try_start`].
/// Frees the id on drop.
#[derive(Debug)]
pub struct RunSlot {
    active: Arc<Mutex<HashSet<String>>>,
    workflow_id: String,
}

impl RunSlot {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.workflow_id);
    }
}

/// Where an exploration stopped, for the run report.
struct ExploreError {
    error: AgentError,
    at: StepRef,
}

impl AgentOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        chain: ProviderChain,
        store: Arc<dyn RouteStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            sessions,
            chain,
            store,
            compiler: RouteCompiler::new(),
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_busy(&self, workflow_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(workflow_id)
    }

    /// Run one task to completion or failure.
    ///
    /// Returns `Err(Busy)` without doing anything when another run for the
    /// same workflow is active. Every other outcome is a [`RunReport`].
    /// Cancellation is observed between steps only.
    pub async fn run(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AgentError> {
        let slot = self.try_start(&task.workflow_id)?;
        self.run_in(slot, task, cancel).await
    }

    /// Claim a workflow id without running anything yet, so a caller can
    /// answer Busy synchronously and run later with [`Self::run_in`].
    pub fn try_start(&self, workflow_id: &str) -> Result<RunSlot, AgentError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(workflow_id.to_string()) {
            return Err(AgentError::Busy(workflow_id.to_string()));
        }
        Ok(RunSlot {
            active: self.active.clone(),
            workflow_id: workflow_id.to_string(),
        })
    }

    /// Run a task under a slot already taken for its workflow. A slot for
    /// another workflow does not cover the task and yields `Err(Busy)`.
    pub async fn run_in(
        &self,
        slot: RunSlot,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AgentError> {
        if slot.workflow_id != task.workflow_id {
            return Err(AgentError::Busy(task.workflow_id.clone()));
        }
        info!("[Agent] Run '{}': {}", task.workflow_id, task.goal);
        self.set_state(&task.workflow_id, AgentState::Idle);

        let report = self.drive(task, cancel).await;
        match &report.error {
            None => {
                info!(
                    "[Agent] '{}' completed via {} in {} step(s)",
                    task.workflow_id, report.mode, report.steps_executed
                );
                self.emit(AgentEvent::TaskComplete {
                    workflow_id: task.workflow_id.clone(),
                    mode: report.mode,
                    steps_executed: report.steps_executed,
                });
            }
            Some(failure) => {
                warn!("[Agent] '{}' failed: {}", task.workflow_id, failure);
                self.emit(AgentEvent::TaskError {
                    workflow_id: task.workflow_id.clone(),
                    message: failure.to_string(),
                });
            }
        }
        drop(slot);
        Ok(report)
    }

    async fn drive(&self, task: &Task, cancel: &CancellationToken) -> RunReport {
        let id = task.workflow_id.as_str();
        let mut steps_executed = 0;

        let route = self.load_route(id).await.filter(|r| {
            let eligible = r.is_replay_eligible(self.config.failure_threshold);
            if !eligible {
                info!(
                    "[Agent] Route for '{}' has {} consecutive failures, skipping replay",
                    id, r.failure_count
                );
            }
            eligible
        });
        let planned = if route.is_some() {
            RunMode::Replay
        } else {
            RunMode::Explore
        };

        if cancel.is_cancelled() {
            let at = next_step(route.as_ref(), 0);
            return RunReport::failed_at(planned, 0, &AgentError::Cancelled, Some(at));
        }
        let executor = match self.sessions.open(id).await {
            Ok(e) => e,
            Err(e) => {
                self.set_state(id, AgentState::Failed);
                let at = next_step(route.as_ref(), 0);
                return RunReport::failed_at(planned, 0, &e, Some(at));
            }
        };

        // Failure increment owed by a replay that fell through.
        let mut stale: Option<Route> = None;

        if let Some(route) = route {
            self.set_state(id, AgentState::Replaying);
            match self
                .replay_route(&route, task, &executor, cancel, &mut steps_executed)
                .await
            {
                Ok(()) => {
                    let mut healthy = route;
                    healthy.success_count += 1;
                    healthy.failure_count = 0;
                    if let Err(e) = self.save_route(&healthy).await {
                        warn!("[Agent] Could not record replay success for '{}': {}", id, e);
                    }
                    self.set_state(id, AgentState::Succeeded);
                    return RunReport::completed(RunMode::Replay, steps_executed);
                }
                Err(e) if e.is_recoverable() => {
                    warn!("[Agent] Replay of '{}' broke, exploring instead: {}", id, e);
                    self.emit(AgentEvent::StepError {
                        workflow_id: id.to_string(),
                        message: e.to_string(),
                    });
                    let mut failed = route;
                    failed.failure_count += 1;
                    stale = Some(failed);
                }
                Err(e) => {
                    self.set_state(id, AgentState::Failed);
                    let at = next_step(Some(&route), steps_executed);
                    return RunReport::failed_at(RunMode::Replay, steps_executed, &e, Some(at));
                }
            }
        }

        let mode = if stale.is_some() {
            RunMode::Mixed
        } else {
            RunMode::Explore
        };
        self.set_state(id, AgentState::Exploring);

        match self.explore(task, &executor, cancel, &mut steps_executed).await {
            Ok(trace) => {
                if trace.is_empty() {
                    info!("[Agent] '{}' needed no actions, nothing to compile", id);
                    if let Some(mut previous) = stale {
                        previous.failure_count = 0;
                        if let Err(e) = self.save_route(&previous).await {
                            warn!("[Agent] Could not reset counters for '{}': {}", id, e);
                        }
                    }
                } else {
                    let compiled = self.compiler.compile(id, &trace, &task.variables);
                    match self.save_route(&compiled).await {
                        Ok(()) => {
                            info!("[Agent] Learned {}-step route for '{}'", compiled.steps.len(), id);
                            self.emit(AgentEvent::RouteSaved {
                                workflow_id: id.to_string(),
                                steps: compiled.steps.len(),
                            });
                        }
                        Err(e) => warn!("[Agent] Could not save learned route for '{}': {}", id, e),
                    }
                }
                self.set_state(id, AgentState::Succeeded);
                RunReport::completed(mode, steps_executed)
            }
            Err(ExploreError { error, at }) => {
                if matches!(error, AgentError::Cancelled) {
                    debug!("[Agent] '{}' cancelled, leaving stored route untouched", id);
                } else if let Some(failed) = stale {
                    if let Err(e) = self.save_route(&failed).await {
                        warn!("[Agent] Could not record replay failure for '{}': {}", id, e);
                    }
                }
                self.set_state(id, AgentState::Failed);
                RunReport::failed_at(mode, steps_executed, &error, Some(at))
            }
        }
    }

    async fn replay_route(
        &self,
        route: &Route,
        task: &Task,
        executor: &Arc<dyn ActionExecutor>,
        cancel: &CancellationToken,
        steps_executed: &mut usize,
    ) -> Result<(), AgentError> {
        let replayer = RouteReplayer::new(executor.clone(), &self.config);
        let mut replay = replayer.replay(route, &task.variables);

        while !replay.is_finished() {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let Some((index, outcome)) = replay.next_step().await else {
                break;
            };
            outcome?;
            *steps_executed += 1;
            self.emit(AgentEvent::Step {
                workflow_id: task.workflow_id.clone(),
                number: index + 1,
                description: route.steps[index].name.clone(),
            });
        }
        Ok(())
    }

    async fn explore(
        &self,
        task: &Task,
        executor: &Arc<dyn ActionExecutor>,
        cancel: &CancellationToken,
        steps_executed: &mut usize,
    ) -> Result<ExplorationTrace, ExploreError> {
        let id = task.workflow_id.as_str();
        let deadline = Instant::now() + self.config.exploration_budget;
        let mut trace = ExplorationTrace::new();
        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut attempts = 0usize;
        let mut last_name = String::from("initial observation");
        let goal = task.describe();

        let fail = |error: AgentError, index: usize, name: &str| ExploreError {
            error,
            at: StepRef {
                index,
                name: name.to_string(),
            },
        };

        let mut state = match timeout(self.config.verify_timeout, executor.observe()).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(fail(e, 0, &last_name)),
            Err(_) => {
                let e = AgentError::Timeout {
                    what: "initial observation".into(),
                    ms: self.config.verify_timeout.as_millis() as u64,
                };
                return Err(fail(e, 0, &last_name));
            }
        };

        loop {
            if cancel.is_cancelled() {
                return Err(fail(AgentError::Cancelled, attempts, &last_name));
            }
            if attempts >= self.config.max_exploration_steps {
                let e = AgentError::ExplorationBudgetExceeded(format!(
                    "{} steps without reaching the goal",
                    attempts
                ));
                return Err(fail(e, attempts, &last_name));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let e = AgentError::ExplorationBudgetExceeded(format!(
                    "{}s wall-clock budget used up",
                    self.config.exploration_budget.as_secs()
                ));
                return Err(fail(e, attempts, &last_name));
            }

            self.emit(AgentEvent::Thinking {
                workflow_id: id.to_string(),
            });
            let decision = match timeout(remaining, self.chain.decide(&state, &goal, &history)).await {
                Ok(Ok(d)) => d,
                Ok(Err(e)) => return Err(fail(e, attempts, &last_name)),
                Err(_) => {
                    let e = AgentError::ExplorationBudgetExceeded(
                        "wall-clock budget ran out while deciding".into(),
                    );
                    return Err(fail(e, attempts, &last_name));
                }
            };

            let proposal = match decision {
                Decision::GoalSatisfied { summary } => {
                    info!("[Agent] '{}' goal reached: {}", id, summary);
                    return Ok(trace);
                }
                Decision::GoalFailed { reason } => {
                    return Err(fail(AgentError::GoalFailed(reason), attempts, &last_name));
                }
                Decision::Act(p) => p,
            };

            attempts += 1;
            last_name = proposal.name.clone();
            info!("[Agent] Explore step {} '{}': {}", attempts, proposal.name, proposal.action);
            self.emit(AgentEvent::Step {
                workflow_id: id.to_string(),
                number: attempts,
                description: format!("{}: {}", proposal.name, proposal.action),
            });

            let result = self.perform(executor, &proposal.action, &state).await;
            history.push(HistoryEntry {
                step: attempts,
                action: proposal.action.clone(),
                success: result.success,
                error: result.error.clone(),
            });

            if !result.success {
                let message = result
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string());
                warn!("[Agent] Explore step {} failed: {}", attempts, message);
                self.emit(AgentEvent::StepError {
                    workflow_id: id.to_string(),
                    message,
                });
                state = result.state;
                continue;
            }

            *steps_executed += 1;
            if proposal.post_wait_ms > 0 {
                tokio::time::sleep(Duration::from_millis(proposal.post_wait_ms)).await;
            }
            let signal = self.capture_signal(executor, &proposal, &state, &result.state).await;
            debug!("[Agent] Step {} success signal: {}", attempts, signal);

            state = result.state;
            trace.record(TraceEntry {
                name: proposal.name,
                action: proposal.action,
                post_wait_ms: proposal.post_wait_ms,
                signal,
            });
        }
    }

    async fn perform(
        &self,
        executor: &Arc<dyn ActionExecutor>,
        action: &Action,
        current: &ObservedState,
    ) -> ActionResult {
        match timeout(self.config.action_timeout, executor.perform(action)).await {
            Ok(result) => result,
            Err(_) => ActionResult {
                success: false,
                state: current.clone(),
                error: Some(format!(
                    "action timed out after {}ms",
                    self.config.action_timeout.as_millis()
                )),
            },
        }
    }

    /// Pick the predicate that replay will check for this step. Only
    /// predicates that hold on the live UI right now are eligible.
    async fn capture_signal(
        &self,
        executor: &Arc<dyn ActionExecutor>,
        proposal: &ActionProposal,
        before: &ObservedState,
        after: &ObservedState,
    ) -> Check {
        let mut candidates = Vec::new();
        if let Some(expect) = &proposal.expect {
            candidates.push(expect.clone());
        }
        if !after.url.is_empty() && after.url != before.url {
            // A navigated URL came from the task; anything else the page
            // chose, and its query or fragment may be per-instance.
            let url = match &proposal.action {
                Action::Navigate { url } if *url == after.url => after.url.as_str(),
                _ => stable_url(&after.url),
            };
            if url != stable_url(&before.url) {
                candidates.push(Check::UrlContains(url.to_string()));
            }
        }
        if let Action::Type { text, .. } = &proposal.action {
            if !text.is_empty() {
                candidates.push(Check::TextPresent(text.clone()));
            }
        }

        for check in candidates {
            if check == Check::ActionSucceeded {
                return check;
            }
            match timeout(self.config.verify_timeout, executor.verify(&check)).await {
                Ok(Ok(true)) => return check,
                Ok(Ok(false)) => debug!("[Agent] Signal '{}' does not hold", check),
                Ok(Err(e)) => debug!("[Agent] Signal '{}' not checkable: {}", check, e),
                Err(_) => debug!("[Agent] Signal '{}' timed out", check),
            }
        }
        Check::ActionSucceeded
    }

    async fn load_route(&self, workflow_id: &str) -> Option<Route> {
        match timeout(self.config.store_timeout, self.store.load(workflow_id)).await {
            Ok(Ok(route)) => route,
            Ok(Err(e @ AgentError::RouteSchemaMismatch { .. })) => {
                warn!("[Agent] {}; the route will be re-explored", e);
                None
            }
            Ok(Err(e)) => {
                warn!("[Agent] Could not load route for '{}': {}", workflow_id, e);
                None
            }
            Err(_) => {
                warn!("[Agent] Loading route for '{}' timed out", workflow_id);
                None
            }
        }
    }

    async fn save_route(&self, route: &Route) -> Result<(), AgentError> {
        timeout(self.config.store_timeout, self.store.save(route))
            .await
            .map_err(|_| AgentError::Timeout {
                what: format!("saving route for '{}'", route.workflow_id),
                ms: self.config.store_timeout.as_millis() as u64,
            })?
    }

    fn set_state(&self, workflow_id: &str, state: AgentState) {
        debug!("[Agent] '{}' -> {:?}", workflow_id, state);
        self.emit(AgentEvent::State {
            workflow_id: workflow_id.to_string(),
            state,
        });
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            // no subscribers is fine
            let _ = tx.send(event);
        }
    }
}

/// The step a run would have executed next.
fn next_step(route: Option<&Route>, index: usize) -> StepRef {
    let name = match route.and_then(|r| r.steps.get(index)) {
        Some(step) => step.name.clone(),
        None => "initial observation".to_string(),
    };
    StepRef { index, name }
}

/// A URL without its query string or fragment.
fn stable_url(url: &str) -> &str {
    url.find(['?', '#']).map_or(url, |end| &url[..end])
}
