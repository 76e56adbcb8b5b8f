//! The boundary to whatever actually drives the UI.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::types::{Action, ActionResult, Check, ObservedState};

/// Performs atomic UI actions for one run.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Perform one action and report the state observed afterwards.
    /// Failures are reported through `ActionResult::success`, not `Err`.
    async fn perform(&self, action: &Action) -> ActionResult;

    /// Evaluate a check against the live UI.
    async fn verify(&self, check: &Check) -> Result<bool, AgentError>;

    /// Capture the current state without acting.
    async fn observe(&self) -> Result<ObservedState, AgentError>;
}

/// Hands out an independent execution context per run, so concurrent
/// workflows never share a page.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, workflow_id: &str) -> Result<Arc<dyn ActionExecutor>, AgentError>;
}
