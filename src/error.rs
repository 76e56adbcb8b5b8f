//! Agent error kinds and how each one is handled.
//!
//! Verification failures and provider failures are recovered locally
//! (replay falls through to exploration, a failed provider hands over to the
//! next one). Misconfiguration and drift surface as run failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StepRef;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("variable '{var}' is not bound (step {index} '{step}')")]
    UnboundVariable {
        index: usize,
        step: String,
        var: String,
    },

    #[error("step {index} '{step}' is malformed: {reason}")]
    InvalidStep {
        index: usize,
        step: String,
        reason: String,
    },

    #[error("verification failed at step {index} '{step}': {detail}")]
    StepVerificationFailure {
        index: usize,
        step: String,
        detail: String,
    },

    #[error("action failed at step {index} '{step}': {detail}")]
    ActionFailed {
        index: usize,
        step: String,
        detail: String,
    },

    #[error("{what} timed out after {ms}ms")]
    Timeout { what: String, ms: u64 },

    #[error("no decision provider produced a usable decision after {attempts} attempt(s): {last}")]
    ProviderUnavailable { attempts: usize, last: String },

    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("provider '{provider}' confidence {confidence:.2} is below {threshold:.2}")]
    LowConfidence {
        provider: String,
        confidence: f32,
        threshold: f32,
    },

    #[error("exploration budget exceeded: {0}")]
    ExplorationBudgetExceeded(String),

    #[error("goal reported unreachable: {0}")]
    GoalFailed(String),

    #[error("workflow '{0}' already has an active run")]
    Busy(String),

    #[error("route for '{workflow_id}' has schema version {found}, expected {expected}")]
    RouteSchemaMismatch {
        workflow_id: String,
        found: u64,
        expected: u32,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("route store error: {0}")]
    Store(String),

    #[error("execution session error: {0}")]
    Session(String),
}

/// Serializable discriminant of [`AgentError`], used in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnboundVariable,
    InvalidStep,
    StepVerificationFailure,
    ActionFailed,
    Timeout,
    ProviderUnavailable,
    Provider,
    LowConfidence,
    ExplorationBudgetExceeded,
    GoalFailed,
    Busy,
    RouteSchemaMismatch,
    Cancelled,
    Store,
    Session,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::UnboundVariable { .. } => ErrorKind::UnboundVariable,
            AgentError::InvalidStep { .. } => ErrorKind::InvalidStep,
            AgentError::StepVerificationFailure { .. } => ErrorKind::StepVerificationFailure,
            AgentError::ActionFailed { .. } => ErrorKind::ActionFailed,
            AgentError::Timeout { .. } => ErrorKind::Timeout,
            AgentError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            AgentError::Provider { .. } => ErrorKind::Provider,
            AgentError::LowConfidence { .. } => ErrorKind::LowConfidence,
            AgentError::ExplorationBudgetExceeded(_) => ErrorKind::ExplorationBudgetExceeded,
            AgentError::GoalFailed(_) => ErrorKind::GoalFailed,
            AgentError::Busy(_) => ErrorKind::Busy,
            AgentError::RouteSchemaMismatch { .. } => ErrorKind::RouteSchemaMismatch,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Store(_) => ErrorKind::Store,
            AgentError::Session(_) => ErrorKind::Session,
        }
    }

    /// The route step the error is attached to, if any.
    pub fn step(&self) -> Option<StepRef> {
        match self {
            AgentError::UnboundVariable { index, step, .. }
            | AgentError::InvalidStep { index, step, .. }
            | AgentError::StepVerificationFailure { index, step, .. }
            | AgentError::ActionFailed { index, step, .. } => Some(StepRef {
                index: *index,
                name: step.clone(),
            }),
            _ => None,
        }
    }

    /// Errors that are handled inside the run by falling back (replay to
    /// exploration, provider to next provider) instead of failing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::StepVerificationFailure { .. }
                | AgentError::ActionFailed { .. }
                | AgentError::Timeout { .. }
                | AgentError::ProviderUnavailable { .. }
                | AgentError::Provider { .. }
                | AgentError::LowConfidence { .. }
        )
    }
}
