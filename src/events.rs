use serde::Serialize;

use crate::types::{AgentState, RunMode};

/// Progress notifications published while runs execute.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    State {
        workflow_id: String,
        state: AgentState,
    },
    Step {
        workflow_id: String,
        number: usize,
        description: String,
    },
    StepError {
        workflow_id: String,
        message: String,
    },
    Thinking {
        workflow_id: String,
    },
    RouteSaved {
        workflow_id: String,
        steps: usize,
    },
    TaskComplete {
        workflow_id: String,
        mode: RunMode,
        steps_executed: usize,
    },
    TaskError {
        workflow_id: String,
        message: String,
    },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::State { .. } => "state",
            AgentEvent::Step { .. } => "step",
            AgentEvent::StepError { .. } => "step_error",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::RouteSaved { .. } => "route_saved",
            AgentEvent::TaskComplete { .. } => "task_complete",
            AgentEvent::TaskError { .. } => "task_error",
        }
    }
}
