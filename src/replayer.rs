//! Deterministic execution of a compiled route.
//!
//! A replay is a lazy sequence of `(step_index, outcome)`. Steps have live
//! side effects, so a replay cannot be rewound; once a step fails the
//! sequence ends. Deciding what to do about a failure is left to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::executor::ActionExecutor;
use crate::types::{Check, ObservedState, Route};

pub type StepOutcome = Result<ObservedState, AgentError>;

pub struct RouteReplayer {
    executor: Arc<dyn ActionExecutor>,
    action_timeout: Duration,
    verify_timeout: Duration,
}

impl RouteReplayer {
    pub fn new(executor: Arc<dyn ActionExecutor>, config: &AgentConfig) -> Self {
        Self {
            executor,
            action_timeout: config.action_timeout,
            verify_timeout: config.verify_timeout,
        }
    }

    pub fn replay<'a>(&'a self, route: &'a Route, variables: &'a BTreeMap<String, String>) -> Replay<'a> {
        Replay {
            replayer: self,
            route,
            variables,
            next: 0,
            halted: false,
        }
    }
}

pub struct Replay<'a> {
    replayer: &'a RouteReplayer,
    route: &'a Route,
    variables: &'a BTreeMap<String, String>,
    next: usize,
    halted: bool,
}

impl Replay<'_> {
    /// Execute the next step. Returns `None` when the route is finished or a
    /// previous step failed.
    pub async fn next_step(&mut self) -> Option<(usize, StepOutcome)> {
        if self.halted || self.next >= self.route.steps.len() {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let outcome = self.run_step(index).await;
        if outcome.is_err() {
            self.halted = true;
        }
        Some((index, outcome))
    }

    pub fn is_finished(&self) -> bool {
        self.halted || self.next >= self.route.steps.len()
    }

    async fn run_step(&self, index: usize) -> StepOutcome {
        let step = &self.route.steps[index];
        // Bind first: an unbound variable must fail before anything runs.
        let (action, check) = step.resolve(index, self.variables)?;
        let r = self.replayer;

        debug!("[Replay] Step {} '{}': {}", index, step.name, action);
        let result = timeout(r.action_timeout, r.executor.perform(&action))
            .await
            .map_err(|_| AgentError::Timeout {
                what: format!("step {} '{}' action", index, step.name),
                ms: r.action_timeout.as_millis() as u64,
            })?;
        if !result.success {
            return Err(AgentError::ActionFailed {
                index,
                step: step.name.clone(),
                detail: result
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string()),
            });
        }

        if step.post_wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.post_wait_ms)).await;
        }

        if check == Check::ActionSucceeded {
            return Ok(result.state);
        }
        let verdict = timeout(r.verify_timeout, r.executor.verify(&check))
            .await
            .map_err(|_| AgentError::Timeout {
                what: format!("step {} '{}' verification", index, step.name),
                ms: r.verify_timeout.as_millis() as u64,
            })?;
        match verdict {
            Ok(true) => Ok(result.state),
            Ok(false) => Err(AgentError::StepVerificationFailure {
                index,
                step: step.name.clone(),
                detail: format!("expected {}", check),
            }),
            Err(e) => Err(AgentError::StepVerificationFailure {
                index,
                step: step.name.clone(),
                detail: format!("could not evaluate {}: {}", check, e),
            }),
        }
    }
}
